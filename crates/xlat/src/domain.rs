//! Memory domains and the thread state the engine keeps per thread.
//!
//! A memory domain is a user address space. Domains are kept in a fixed-size list so
//! that changes to kernel mappings can be carried into each of them.

use crate::asid::AddressSpace;
use crate::error::MmuError;

/// Maximum number of memory domains that can exist at the same time.
pub const MAX_DOMAINS: usize = 16;

/// Identifies a memory domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainId(u8);

impl DomainId {
    /// Returns the position of the domain in the domain list.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fixed-size list of live domains.
#[derive(Debug)]
pub(crate) struct DomainList {
    domains: [Option<AddressSpace>; MAX_DOMAINS],
}

impl DomainList {
    pub const fn new() -> Self {
        Self {
            domains: [None; MAX_DOMAINS],
        }
    }

    /// Returns whether another domain can be registered.
    pub fn has_room(&self) -> bool {
        self.domains.iter().any(Option::is_none)
    }

    /// Registers an address space as a new domain.
    pub fn insert(&mut self, space: AddressSpace) -> Result<DomainId, MmuError> {
        let index = self
            .domains
            .iter()
            .position(Option::is_none)
            .ok_or(MmuError::TooManyDomains)?;
        self.domains[index] = Some(space);
        Ok(DomainId(index as u8))
    }

    /// Unregisters a domain and returns its address space.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a live domain.
    pub fn remove(&mut self, id: DomainId) -> AddressSpace {
        match self.domains.get_mut(id.index()).and_then(Option::take) {
            Some(space) => space,
            None => panic!("unknown memory domain {id:?}"),
        }
    }

    /// Returns the address space of a domain.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a live domain.
    pub fn get(&self, id: DomainId) -> AddressSpace {
        match self.domains.get(id.index()).copied().flatten() {
            Some(space) => space,
            None => panic!("unknown memory domain {id:?}"),
        }
    }

    /// Iterates over the address spaces of all live domains.
    pub fn iter(&self) -> impl Iterator<Item = &AddressSpace> {
        self.domains.iter().flatten()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.iter().count()
    }
}

/// A thread's stack, in kernel virtual addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRegion {
    pub start: usize,
    pub size: usize,
}

impl StackRegion {
    pub const fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }
}

/// The address space a thread runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRoot {
    /// The kernel address space.
    Kernel,
    /// The address space of a memory domain.
    Domain(DomainId),
}

/// Per-thread state managed by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    user: bool,
    stack: StackRegion,
    root: Option<ThreadRoot>,
}

impl Thread {
    /// Creates a kernel thread that has not been placed in an address space yet.
    pub const fn kernel(stack: StackRegion) -> Self {
        Self {
            user: false,
            stack,
            root: None,
        }
    }

    /// Creates a user thread that has not been placed in an address space yet.
    pub const fn user(stack: StackRegion) -> Self {
        Self {
            user: true,
            stack,
            root: None,
        }
    }

    /// Returns whether the thread runs in user mode.
    pub const fn is_user(&self) -> bool {
        self.user
    }

    /// Returns the thread's stack.
    pub const fn stack(&self) -> StackRegion {
        self.stack
    }

    /// Returns the address space the thread runs in, if it has been placed in one.
    pub const fn root(&self) -> Option<ThreadRoot> {
        self.root
    }

    pub(crate) fn set_root(&mut self, root: ThreadRoot) {
        self.root = Some(root);
    }
}

/// Scheduler services needed when a thread changes address space.
pub trait Scheduler {
    /// Returns whether `thread` is running on the calling CPU.
    fn is_current(&self, thread: &Thread) -> bool;

    /// Asks the other CPUs to reload the address space of the thread they run.
    fn signal_mem_config(&self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asid::Asid;
    use crate::pool::TableHandle;
    use crate::PhysicalAddress;

    fn space(index: usize) -> AddressSpace {
        AddressSpace::new(
            TableHandle::from_index(index),
            PhysicalAddress::new(index * 0x1000),
            Asid::KERNEL,
        )
    }

    #[test]
    fn insert_and_remove() {
        let mut list = DomainList::new();
        let a = list.insert(space(1)).unwrap();
        let b = list.insert(space(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(list.len(), 2);
        assert_eq!(list.get(b), space(2));

        assert_eq!(list.remove(a), space(1));
        assert_eq!(list.len(), 1);
        // The freed slot is reused.
        assert_eq!(list.insert(space(3)).unwrap(), a);
    }

    #[test]
    fn list_is_bounded() {
        let mut list = DomainList::new();
        for i in 0..MAX_DOMAINS {
            list.insert(space(i + 1)).unwrap();
        }
        assert!(!list.has_room());
        assert_eq!(list.insert(space(99)), Err(MmuError::TooManyDomains));
    }

    #[test]
    #[should_panic(expected = "unknown memory domain")]
    fn removed_domain_is_unknown() {
        let mut list = DomainList::new();
        let id = list.insert(space(1)).unwrap();
        list.remove(id);
        list.get(id);
    }

    #[test]
    fn new_threads_are_unplaced() {
        let stack = StackRegion::new(0x8000, 0x2000);
        let thread = Thread::user(stack);
        assert!(thread.is_user());
        assert_eq!(thread.root(), None);
        assert!(!Thread::kernel(stack).is_user());
    }
}
