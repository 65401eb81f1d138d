//! The translation table engine.
//!
//! [`Mmu`] owns the table pool, the kernel address space and the list of memory
//! domains. It is meant to live in a `static`:
//!
//! ```ignore
//! static MMU: Mmu<64> = Mmu::new(MmuConfig::new(48, 40));
//!
//! MMU.init(&boot_regions);
//! unsafe { MMU.enable() };
//! ```
//!
//! Two locks protect the engine. The domain list lock is always taken before the table
//! lock, so a change to kernel mappings can be carried into every domain without
//! another domain appearing or vanishing halfway.

use log::{debug, error};
use spin::{Mutex, MutexGuard};

use crate::arch::{self, PAGE_SIZE};
use crate::asid::{AddressSpace, Asid, AsidAllocator};
use crate::config::{MmuConfig, MAIR_VALUE};
use crate::descriptor::{Attributes, Descriptor, Leaf, Level, MemoryFlags};
use crate::domain::{DomainId, DomainList, Scheduler, Thread, ThreadRoot};
use crate::error::{MmuError, TranslateError};
use crate::mapping::Overwrite;
use crate::pool::{PoolStats, TableHandle, TablePool};
use crate::{PhysicalAddress, VirtualAddress};

/// A region of memory the kernel needs mapped from the start.
pub trait MmuRegion {
    /// Returns a name for diagnostics.
    fn name(&self) -> &str;

    /// Returns the physical base address.
    fn phys(&self) -> PhysicalAddress;

    /// Returns the virtual base address.
    fn virt(&self) -> VirtualAddress;

    /// Returns the size in bytes.
    fn size(&self) -> usize;

    /// Returns the memory type and permissions.
    fn attributes(&self) -> Attributes;
}

/// State guarded by the table lock.
pub(crate) struct Xlat<const N: usize> {
    pub pool: TablePool<N>,
    pub level: Level,
    asids: AsidAllocator,
}

impl<const N: usize> Xlat<N> {
    /// Returns the kernel address space.
    pub fn kernel(&self) -> AddressSpace {
        AddressSpace::new(
            TableHandle::KERNEL_ROOT,
            self.pool.phys(TableHandle::KERNEL_ROOT),
            Asid::KERNEL,
        )
    }

    /// Makes the kernel's view of a range visible in every domain.
    ///
    /// Failures are logged; the remaining domains are still updated.
    pub fn sync_domains(&mut self, domains: &DomainList, virt: usize, size: usize) {
        for space in domains.iter() {
            let result = self.pool.globalize(
                space.root(),
                TableHandle::KERNEL_ROOT,
                virt,
                size,
                self.level,
            );
            if let Err(err) = result {
                error!("failed to sync {virt:#x}+{size:#x} into ASID {}: {err}", space.asid());
            }
        }
    }

    /// Maps a range into `space` only, leaving the kernel's tables untouched.
    fn private_map(
        &mut self,
        space: AddressSpace,
        phys: usize,
        virt: usize,
        size: usize,
        attributes: Attributes,
    ) -> Result<(), MmuError> {
        let root = space.root();
        self.pool
            .privatize(root, TableHandle::KERNEL_ROOT, virt, size, self.level)?;

        let leaf = Leaf::new(
            PhysicalAddress::new(phys),
            attributes.with(MemoryFlags::NON_GLOBAL),
        );
        self.pool
            .set_mapping(root, self.level, virt, size, leaf, Overwrite::Allow)?;
        arch::invalidate_tlb_all();
        Ok(())
    }

    /// Makes a range of `space` translate like the kernel again.
    fn reset_map(&mut self, space: AddressSpace, virt: usize, size: usize) -> Result<(), MmuError> {
        self.pool.globalize(
            space.root(),
            TableHandle::KERNEL_ROOT,
            virt,
            size,
            self.level,
        )?;
        arch::invalidate_tlb_all();
        Ok(())
    }
}

/// Stage-1 translation table engine with a pool of `N` tables.
pub struct Mmu<const N: usize> {
    config: MmuConfig,
    domains: Mutex<DomainList>,
    xlat: Mutex<Xlat<N>>,
}

impl<const N: usize> Mmu<N> {
    /// Creates an engine with an empty kernel address space.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub const fn new(config: MmuConfig) -> Self {
        config.validate();
        Self {
            config,
            domains: Mutex::new(DomainList::new()),
            xlat: Mutex::new(Xlat {
                pool: TablePool::new(),
                level: config.base_level(),
                asids: AsidAllocator::new(config.asid_bits),
            }),
        }
    }

    /// Returns the configuration.
    pub const fn config(&self) -> &MmuConfig {
        &self.config
    }

    pub(crate) fn lock(&self) -> (MutexGuard<'_, DomainList>, MutexGuard<'_, Xlat<N>>) {
        let domains = self.domains.lock();
        let xlat = self.xlat.lock();
        (domains, xlat)
    }

    /// Checks a virtual range against the configured address width.
    ///
    /// # Panics
    ///
    /// Panics if the range is not page aligned.
    pub(crate) fn check_virt(&self, virt: VirtualAddress, size: usize) -> Result<(), MmuError> {
        assert!(
            virt.is_aligned(PAGE_SIZE) && size % PAGE_SIZE == 0,
            "range {virt}+{size:#x} is not page aligned"
        );
        match virt.as_usize().checked_add(size) {
            Some(end) if end <= self.config.va_limit() => Ok(()),
            _ => {
                error!("range {virt}+{size:#x} exceeds the {}-bit address space", self.config.va_bits);
                Err(MmuError::Unsupported)
            }
        }
    }

    fn check_phys(&self, phys: PhysicalAddress, size: usize) -> Result<(), MmuError> {
        assert!(phys.is_aligned(PAGE_SIZE), "physical address {phys} is not page aligned");
        match phys.as_usize().checked_add(size) {
            Some(end) if end <= self.config.pa_limit() => Ok(()),
            _ => {
                error!("range {phys}+{size:#x} exceeds the {}-bit output range", self.config.pa_bits);
                Err(MmuError::Unsupported)
            }
        }
    }

    /// Maps the boot regions into the kernel address space.
    ///
    /// # Panics
    ///
    /// Panics if any region cannot be mapped; the kernel cannot run on partial tables.
    pub fn init<R: MmuRegion>(&self, regions: &[R]) {
        for region in regions.iter().filter(|region| region.size() > 0) {
            let result = self.check_virt(region.virt(), region.size()).and_then(|()| {
                self.check_phys(region.phys(), region.size())?;
                let mut xlat = self.xlat.lock();
                let level = xlat.level;
                xlat.pool.set_mapping(
                    TableHandle::KERNEL_ROOT,
                    level,
                    region.virt().as_usize(),
                    region.size(),
                    Leaf::new(region.phys(), region.attributes()),
                    Overwrite::Allow,
                )
            });

            match result {
                Ok(()) => debug!(
                    "mapped region {}: {}..{} -> {}",
                    region.name(),
                    region.virt(),
                    region.virt() + region.size(),
                    region.phys()
                ),
                Err(err) => panic!("failed to map region {}: {err}", region.name()),
            }
        }
    }

    /// Programs the translation regime and enables the MMU with the kernel tables.
    ///
    /// # Safety
    ///
    /// The kernel tables must map all code and data the CPU uses from here on.
    pub unsafe fn enable(&self) {
        let ttbr0 = self.xlat.lock().kernel().ttbr0();
        debug!("enabling MMU: TCR {:#018x}, TTBR0 {ttbr0:#018x}", self.config.tcr());
        // SAFETY: forwarded to the caller.
        unsafe { arch::enable_mmu(MAIR_VALUE, self.config.tcr(), ttbr0) };
    }

    /// Maps `size` bytes at `virt` to `phys` in the kernel address space and every domain.
    pub fn map(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: usize,
        attributes: Attributes,
        overwrite: Overwrite,
    ) -> Result<(), MmuError> {
        self.check_virt(virt, size)?;
        self.check_phys(phys, size)?;

        let (domains, mut xlat) = self.lock();
        let level = xlat.level;
        xlat.pool
            .set_mapping(
                TableHandle::KERNEL_ROOT,
                level,
                virt.as_usize(),
                size,
                Leaf::new(phys, attributes),
                overwrite,
            )
            .inspect_err(|err| error!("failed to map {virt}+{size:#x}: {err}"))?;

        xlat.sync_domains(&domains, virt.as_usize(), size);
        arch::invalidate_tlb_all();
        debug!("mapped {virt}+{size:#x} -> {phys}");
        Ok(())
    }

    /// Removes the translations for `size` bytes at `virt` from the kernel address space
    /// and every domain.
    pub fn unmap(&self, virt: VirtualAddress, size: usize) -> Result<(), MmuError> {
        self.check_virt(virt, size)?;

        let (domains, mut xlat) = self.lock();
        let level = xlat.level;
        xlat.pool
            .del_mapping(TableHandle::KERNEL_ROOT, virt.as_usize(), size, level)
            .inspect_err(|err| error!("failed to unmap {virt}+{size:#x}: {err}"))?;

        xlat.sync_domains(&domains, virt.as_usize(), size);
        arch::invalidate_tlb_all();
        debug!("unmapped {virt}+{size:#x}");
        Ok(())
    }

    /// Translates a kernel virtual address.
    pub fn translate(&self, virt: VirtualAddress) -> Result<PhysicalAddress, TranslateError> {
        let xlat = self.xlat.lock();
        xlat.pool
            .translate(TableHandle::KERNEL_ROOT, xlat.level, virt.as_usize())
    }

    /// Returns the kernel's entry translating `virt` and the level it sits at.
    pub fn lookup(&self, virt: VirtualAddress) -> (Descriptor, Level) {
        let xlat = self.xlat.lock();
        xlat.pool
            .walk(TableHandle::KERNEL_ROOT, xlat.level, virt.as_usize())
    }

    /// Returns the kernel address space.
    pub fn kernel_space(&self) -> AddressSpace {
        self.xlat.lock().kernel()
    }

    /// Returns the address space selected by `root`.
    pub fn address_space(&self, root: ThreadRoot) -> AddressSpace {
        match root {
            ThreadRoot::Kernel => self.kernel_space(),
            ThreadRoot::Domain(id) => self.domains.lock().get(id),
        }
    }

    /// Creates a memory domain that initially shares every kernel mapping.
    pub fn domain_create(&self) -> Result<DomainId, MmuError> {
        let (mut domains, mut xlat) = self.lock();
        if !domains.has_room() {
            error!("cannot create memory domain: domain list full");
            return Err(MmuError::TooManyDomains);
        }

        let level = xlat.level;
        let root = xlat
            .pool
            .dup_table(TableHandle::KERNEL_ROOT, level)
            .inspect_err(|err| error!("cannot create memory domain: {err}"))?;
        let asid = xlat.asids.allocate();
        let space = AddressSpace::new(root, xlat.pool.phys(root), asid);

        let id = domains.insert(space)?;
        debug!("created memory domain {id:?} with ASID {asid}, root table {}", root.index());
        Ok(id)
    }

    /// Destroys a memory domain and releases its private tables.
    ///
    /// No thread may run in the domain any more.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not name a live domain.
    pub fn domain_destroy(&self, id: DomainId) {
        let (mut domains, mut xlat) = self.lock();
        let space = domains.remove(id);
        let level = xlat.level;
        xlat.pool.discard(space.root(), level);
        xlat.pool.dec_owner(space.root());
        arch::invalidate_tlb_all();
        debug!("destroyed memory domain {id:?} (ASID {})", space.asid());
    }

    /// Maps a partition into a domain, identity mapped, without affecting other address
    /// spaces.
    pub fn domain_attach_range(
        &self,
        id: DomainId,
        virt: VirtualAddress,
        size: usize,
        attributes: Attributes,
    ) -> Result<(), MmuError> {
        self.check_virt(virt, size)?;

        let (domains, mut xlat) = self.lock();
        let space = domains.get(id);
        xlat.private_map(space, virt.as_usize(), virt.as_usize(), size, attributes)
            .inspect_err(|err| error!("failed to attach {virt}+{size:#x} to {id:?}: {err}"))?;
        debug!("attached {virt}+{size:#x} to memory domain {id:?}");
        Ok(())
    }

    /// Removes a partition from a domain, restoring the kernel's view of the range.
    pub fn domain_detach_range(
        &self,
        id: DomainId,
        virt: VirtualAddress,
        size: usize,
    ) -> Result<(), MmuError> {
        self.check_virt(virt, size)?;

        let (domains, mut xlat) = self.lock();
        let space = domains.get(id);
        xlat.reset_map(space, virt.as_usize(), size)
            .inspect_err(|err| error!("failed to detach {virt}+{size:#x} from {id:?}: {err}"))?;
        debug!("detached {virt}+{size:#x} from memory domain {id:?}");
        Ok(())
    }

    /// Translates `virt` in a domain's address space.
    pub fn domain_translate(
        &self,
        id: DomainId,
        virt: VirtualAddress,
    ) -> Result<PhysicalAddress, TranslateError> {
        let (domains, xlat) = self.lock();
        let root = domains.get(id).root();
        xlat.pool.translate(root, xlat.level, virt.as_usize())
    }

    /// Places a new thread in an address space.
    ///
    /// User threads placed in a domain get their stack mapped privately there.
    pub fn thread_init(&self, thread: &mut Thread, root: ThreadRoot) -> Result<(), MmuError> {
        if let (true, ThreadRoot::Domain(id)) = (thread.is_user(), root) {
            self.map_stack(thread, id)?;
        }
        thread.set_root(root);
        Ok(())
    }

    /// Moves a thread into a domain.
    ///
    /// A user thread that already ran elsewhere gets its stack mapped in the new domain and
    /// reset in the old one. If the thread is running on this CPU the new address space
    /// is activated immediately; otherwise the other CPUs are asked to reload theirs.
    pub fn thread_domain_add(
        &self,
        thread: &mut Thread,
        id: DomainId,
        scheduler: &impl Scheduler,
    ) -> Result<(), MmuError> {
        let old = thread.root();
        let migrating = old.is_some() && thread.is_user();

        if migrating {
            self.map_stack(thread, id)?;
        }

        thread.set_root(ThreadRoot::Domain(id));
        if scheduler.is_current(thread) {
            self.switch_to(thread);
        } else {
            scheduler.signal_mem_config();
        }

        if let (true, Some(ThreadRoot::Domain(old))) = (migrating, old) {
            if old != id {
                self.reset_stack(thread, old)?;
            }
        }
        debug!("thread moved from {old:?} to memory domain {id:?}");
        Ok(())
    }

    /// Takes a thread out of its domain.
    ///
    /// The stack of an exiting user thread is reset to the kernel's view.
    pub fn thread_domain_remove(&self, thread: &Thread, exiting: bool) -> Result<(), MmuError> {
        if !thread.is_user() || !exiting {
            return Ok(());
        }
        match thread.root() {
            Some(ThreadRoot::Domain(id)) => self.reset_stack(thread, id),
            _ => Ok(()),
        }
    }

    /// Activates the address space of `thread` on this CPU.
    ///
    /// Returns whether TTBR0_EL1 changed.
    pub fn switch_to(&self, thread: &Thread) -> bool {
        let space = self.address_space(thread.root().unwrap_or(ThreadRoot::Kernel));
        space.activate()
    }

    fn map_stack(&self, thread: &Thread, id: DomainId) -> Result<(), MmuError> {
        let stack = thread.stack();
        self.check_virt(VirtualAddress::new(stack.start), stack.size)?;

        let (domains, mut xlat) = self.lock();
        let space = domains.get(id);
        xlat.private_map(
            space,
            stack.start,
            stack.start,
            stack.size,
            Attributes::normal(MemoryFlags::WRITE | MemoryFlags::USER),
        )
        .inspect_err(|err| error!("failed to map thread stack in {id:?}: {err}"))
    }

    fn reset_stack(&self, thread: &Thread, id: DomainId) -> Result<(), MmuError> {
        let stack = thread.stack();
        let (domains, mut xlat) = self.lock();
        let space = domains.get(id);
        xlat.reset_map(space, stack.start, stack.size)
            .inspect_err(|err| error!("failed to reset thread stack in {id:?}: {err}"))
    }

    /// Returns aggregate table pool usage.
    pub fn stats(&self) -> PoolStats {
        self.xlat.lock().pool.stats()
    }

    /// Returns the first table whose occupancy count disagrees with its contents.
    pub fn audit(&self) -> Option<TableHandle> {
        self.xlat.lock().pool.audit()
    }
}

#[cfg(test)]
mod tests {
    use core::cell::Cell;

    use super::*;
    use crate::arch::emulated;
    use crate::config::AsidBits;
    use crate::descriptor::DescAttrs;
    use crate::domain::StackRegion;

    const PAGE: usize = 0x1000;

    fn mmu<const N: usize>() -> Mmu<N> {
        Mmu::new(MmuConfig::new(48, 40))
    }

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn pa(addr: usize) -> PhysicalAddress {
        PhysicalAddress::new(addr)
    }

    fn kernel_rw() -> Attributes {
        Attributes::normal(MemoryFlags::WRITE)
    }

    struct Region {
        name: &'static str,
        base: usize,
        size: usize,
        attributes: Attributes,
    }

    impl MmuRegion for Region {
        fn name(&self) -> &str {
            self.name
        }
        fn phys(&self) -> PhysicalAddress {
            pa(self.base)
        }
        fn virt(&self) -> VirtualAddress {
            va(self.base)
        }
        fn size(&self) -> usize {
            self.size
        }
        fn attributes(&self) -> Attributes {
            self.attributes
        }
    }

    struct TestScheduler {
        current: bool,
        signals: Cell<usize>,
    }

    impl TestScheduler {
        fn new(current: bool) -> Self {
            Self {
                current,
                signals: Cell::new(0),
            }
        }
    }

    impl Scheduler for TestScheduler {
        fn is_current(&self, _thread: &Thread) -> bool {
            self.current
        }

        fn signal_mem_config(&self) {
            self.signals.set(self.signals.get() + 1);
        }
    }

    #[test]
    fn map_then_translate() {
        let mmu = mmu::<16>();
        let size = 0x40_3000;
        mmu.map(va(0x4000_0000), pa(0x8000_0000), size, kernel_rw(), Overwrite::Forbid)
            .unwrap();

        for offset in (0..size).step_by(PAGE).chain([1, size - 1]) {
            assert_eq!(mmu.translate(va(0x4000_0000 + offset)), Ok(pa(0x8000_0000 + offset)));
        }
        assert_eq!(mmu.translate(va(0x4000_0000 + size)), Err(TranslateError::NotMapped));
        assert_eq!(mmu.audit(), None);
    }

    #[test]
    fn kernel_rw_descriptor() {
        let mmu = mmu::<8>();
        mmu.map(va(0x1000), pa(0x2000), PAGE, kernel_rw(), Overwrite::Forbid)
            .unwrap();

        let (descriptor, level) = mmu.lookup(va(0x1000));
        assert_eq!(level, Level::L3);
        let Descriptor::Page { phys, attrs } = descriptor else {
            panic!("expected a page, got {descriptor:?}");
        };
        assert_eq!(phys, pa(0x2000));
        assert!(!attrs.contains(DescAttrs::AP_RO));
        assert!(!attrs.contains(DescAttrs::AP_EL0));
        assert!(attrs.contains(DescAttrs::AF | DescAttrs::PXN | DescAttrs::UXN));
        assert!(attrs.is_inner_shareable());
    }

    #[test]
    fn forbidden_overwrite_keeps_mapping() {
        let mmu = mmu::<8>();
        mmu.map(va(0x1000), pa(0x2000), PAGE, kernel_rw(), Overwrite::Forbid)
            .unwrap();
        let before = mmu.lookup(va(0x1000));

        assert_eq!(
            mmu.map(va(0x1000), pa(0x3000), PAGE, kernel_rw(), Overwrite::Forbid),
            Err(MmuError::AlreadyMapped)
        );
        assert_eq!(mmu.lookup(va(0x1000)), before);

        mmu.map(va(0x1000), pa(0x3000), PAGE, kernel_rw(), Overwrite::Allow)
            .unwrap();
        assert_eq!(mmu.translate(va(0x1000)), Ok(pa(0x3000)));
    }

    #[test]
    fn map_unmap_leaves_no_tables() {
        let mmu = mmu::<16>();
        let before = mmu.stats();

        mmu.map(va(0x20_0000), pa(0x20_0000), 0x60_0000, kernel_rw(), Overwrite::Forbid)
            .unwrap();
        mmu.unmap(va(0x20_0000), 0x60_0000).unwrap();

        assert_eq!(mmu.stats(), before);
    }

    #[test]
    fn ranges_outside_the_regime() {
        let mmu: Mmu<8> = Mmu::new(MmuConfig::new(39, 32));
        assert_eq!(
            mmu.map(va(1 << 39), pa(0), PAGE, kernel_rw(), Overwrite::Forbid),
            Err(MmuError::Unsupported)
        );
        assert_eq!(
            mmu.map(va(0), pa(1 << 32), PAGE, kernel_rw(), Overwrite::Forbid),
            Err(MmuError::Unsupported)
        );
        assert_eq!(mmu.unmap(va((1 << 39) - PAGE), 2 * PAGE), Err(MmuError::Unsupported));
    }

    #[test]
    #[should_panic(expected = "not page aligned")]
    fn misaligned_map_is_fatal() {
        let mmu = mmu::<8>();
        let _ = mmu.map(va(0x1800), pa(0x2000), PAGE, kernel_rw(), Overwrite::Forbid);
    }

    #[test]
    fn init_and_enable() {
        let mmu = mmu::<16>();
        mmu.init(&[
            Region {
                name: "text",
                base: 0x4000_0000,
                size: 0x10_0000,
                attributes: Attributes::normal(MemoryFlags::empty()),
            },
            Region {
                name: "uart",
                base: 0x0900_0000,
                size: PAGE,
                attributes: Attributes::device(MemoryFlags::WRITE),
            },
            Region {
                name: "empty",
                base: 0,
                size: 0,
                attributes: kernel_rw(),
            },
        ]);
        assert_eq!(mmu.translate(va(0x4000_1234)), Ok(pa(0x4000_1234)));
        assert_eq!(mmu.translate(va(0x0900_0000)), Ok(pa(0x0900_0000)));

        // SAFETY: emulated CPU.
        unsafe { mmu.enable() };
        assert!(emulated::mmu_enabled());
        assert_eq!(emulated::mair(), MAIR_VALUE);
        assert_eq!(emulated::tcr(), mmu.config().tcr());
        assert_eq!(emulated::read_ttbr0(), mmu.kernel_space().ttbr0());
    }

    #[test]
    #[should_panic(expected = "failed to map region huge")]
    fn init_failure_is_fatal() {
        let mmu = mmu::<2>();
        mmu.init(&[Region {
            name: "huge",
            base: 0x1000,
            size: PAGE,
            attributes: kernel_rw(),
        }]);
    }

    #[test]
    fn domains_share_kernel_mappings() {
        let mmu = mmu::<16>();
        mmu.map(va(0x1000), pa(0x2000), PAGE, kernel_rw(), Overwrite::Forbid)
            .unwrap();
        let domain = mmu.domain_create().unwrap();
        assert_eq!(mmu.domain_translate(domain, va(0x1000)), Ok(pa(0x2000)));

        // Kernel changes made later reach the domain too.
        mmu.map(va(1 << 39), pa(0x5000), PAGE, kernel_rw(), Overwrite::Forbid)
            .unwrap();
        assert_eq!(mmu.domain_translate(domain, va(1 << 39)), Ok(pa(0x5000)));

        mmu.unmap(va(0x1000), PAGE).unwrap();
        assert_eq!(
            mmu.domain_translate(domain, va(0x1000)),
            Err(TranslateError::NotMapped)
        );
        assert_eq!(mmu.audit(), None);
    }

    #[test]
    fn attach_and_detach_partition() {
        let mmu = mmu::<16>();
        mmu.map(va(0x10_0000), pa(0x10_0000), 0x10_0000, kernel_rw(), Overwrite::Forbid)
            .unwrap();
        let domain = mmu.domain_create().unwrap();
        let other = mmu.domain_create().unwrap();
        let user_ro = Attributes::normal(MemoryFlags::USER | MemoryFlags::USER_EXECUTE_NEVER);

        mmu.domain_attach_range(domain, va(0x10_2000), 2 * PAGE, user_ro)
            .unwrap();

        let space = mmu.address_space(ThreadRoot::Domain(domain));
        let other = mmu.address_space(ThreadRoot::Domain(other));
        let user_visible = |root: TableHandle| {
            let xlat = mmu.xlat.lock();
            let (descriptor, _) = xlat.pool.walk(root, xlat.level, 0x10_2000);
            descriptor.attrs().unwrap().contains(DescAttrs::AP_EL0)
        };

        assert!(user_visible(space.root()));
        assert!(!user_visible(TableHandle::KERNEL_ROOT));
        assert!(!user_visible(other.root()));
        let (descriptor, _) = {
            let xlat = mmu.xlat.lock();
            xlat.pool.walk(space.root(), xlat.level, 0x10_3000)
        };
        assert!(descriptor.attrs().unwrap().contains(DescAttrs::NG | DescAttrs::UXN));

        mmu.domain_detach_range(domain, va(0x10_2000), 2 * PAGE).unwrap();
        let xlat = mmu.xlat.lock();
        assert_eq!(
            xlat.pool.walk(space.root(), xlat.level, 0x10_2000).0,
            xlat.pool.walk(TableHandle::KERNEL_ROOT, xlat.level, 0x10_2000).0
        );
        assert_eq!(xlat.pool.audit(), None);
    }

    #[test]
    fn destroying_domains_releases_tables() {
        let mmu = mmu::<16>();
        mmu.map(va(0x1000), pa(0x2000), 4 * PAGE, kernel_rw(), Overwrite::Forbid)
            .unwrap();
        let before = mmu.stats();

        let domain = mmu.domain_create().unwrap();
        mmu.domain_attach_range(domain, va(0x2000), PAGE, kernel_rw())
            .unwrap();
        mmu.domain_destroy(domain);

        assert_eq!(mmu.stats().used_tables, before.used_tables);
        assert_eq!(mmu.stats().owner_refs, before.owner_refs);
        assert_eq!(mmu.translate(va(0x2000)), Ok(pa(0x3000)));
        assert_eq!(mmu.audit(), None);
    }

    #[test]
    fn domain_creation_fails_without_tables() {
        let mmu = mmu::<2>();
        mmu.domain_create().unwrap();
        assert_eq!(mmu.domain_create(), Err(MmuError::NoMemory));
    }

    #[test]
    fn engine_costs_one_page_per_table() {
        assert!(size_of::<Mmu<16>>() < 17 * PAGE);

        let mmu = mmu::<4>();
        let domain = mmu.domain_create().unwrap();
        let root = mmu.address_space(ThreadRoot::Domain(domain)).ttbr0() & 0xFFFF_FFFF_FFFF;
        assert_eq!(root, mmu.kernel_space().ttbr0() + PAGE as u64);
    }

    #[test]
    fn domain_list_is_bounded() {
        let mmu = mmu::<{ crate::MAX_DOMAINS + 1 }>();
        for _ in 0..crate::MAX_DOMAINS {
            mmu.domain_create().unwrap();
        }
        assert_eq!(mmu.domain_create(), Err(MmuError::TooManyDomains));
    }

    #[test]
    fn asids_wrap_after_eight_bits() {
        let mmu: Mmu<4> = Mmu::new(MmuConfig::new(48, 40).with_asid_bits(AsidBits::Eight));
        for expected in 1..=255u16 {
            let id = mmu.domain_create().unwrap();
            assert_eq!(mmu.address_space(ThreadRoot::Domain(id)).asid().value(), expected);
            mmu.domain_destroy(id);
        }

        let id = mmu.domain_create().unwrap();
        assert_eq!(mmu.address_space(ThreadRoot::Domain(id)).asid().value(), 1);
    }

    #[test]
    fn user_thread_stack_is_private() {
        let mmu = mmu::<16>();
        let stack = StackRegion::new(0x20_0000, 2 * PAGE);
        let domain = mmu.domain_create().unwrap();

        let mut thread = Thread::user(stack);
        mmu.thread_init(&mut thread, ThreadRoot::Domain(domain)).unwrap();

        assert_eq!(thread.root(), Some(ThreadRoot::Domain(domain)));
        assert_eq!(mmu.domain_translate(domain, va(0x20_1000)), Ok(pa(0x20_1000)));
        assert_eq!(mmu.translate(va(0x20_1000)), Err(TranslateError::NotMapped));

        assert!(mmu.switch_to(&thread));
        assert_eq!(emulated::read_ttbr0(), mmu.address_space(ThreadRoot::Domain(domain)).ttbr0());
        assert!(!mmu.switch_to(&thread));
    }

    #[test]
    fn kernel_thread_runs_on_kernel_tables() {
        let mmu = mmu::<8>();
        let mut thread = Thread::kernel(StackRegion::new(0x20_0000, PAGE));
        let before = mmu.stats();
        mmu.thread_init(&mut thread, ThreadRoot::Kernel).unwrap();

        assert_eq!(mmu.stats(), before);
        mmu.switch_to(&thread);
        assert_eq!(emulated::read_ttbr0(), mmu.kernel_space().ttbr0());
    }

    #[test]
    fn migrating_current_thread_switches_immediately() {
        let mmu = mmu::<16>();
        let stack = StackRegion::new(0x20_0000, PAGE);
        let first = mmu.domain_create().unwrap();
        let second = mmu.domain_create().unwrap();
        let mut thread = Thread::user(stack);
        mmu.thread_init(&mut thread, ThreadRoot::Domain(first)).unwrap();

        let scheduler = TestScheduler::new(true);
        let flushes = emulated::tlb_full_invalidations();
        mmu.thread_domain_add(&mut thread, second, &scheduler).unwrap();

        assert_eq!(thread.root(), Some(ThreadRoot::Domain(second)));
        assert_eq!(emulated::read_ttbr0(), mmu.address_space(ThreadRoot::Domain(second)).ttbr0());
        assert!(emulated::tlb_full_invalidations() > flushes);
        assert_eq!(scheduler.signals.get(), 0);

        // The stack moved with the thread.
        assert_eq!(mmu.domain_translate(second, va(0x20_0000)), Ok(pa(0x20_0000)));
        assert_eq!(
            mmu.domain_translate(first, va(0x20_0000)),
            Err(TranslateError::NotMapped)
        );
        assert_eq!(mmu.audit(), None);
    }

    #[test]
    fn migrating_other_thread_signals() {
        let mmu = mmu::<16>();
        let domain = mmu.domain_create().unwrap();
        let mut thread = Thread::user(StackRegion::new(0x20_0000, PAGE));
        let ttbr0 = emulated::read_ttbr0();

        let scheduler = TestScheduler::new(false);
        mmu.thread_domain_add(&mut thread, domain, &scheduler).unwrap();

        assert_eq!(scheduler.signals.get(), 1);
        assert_eq!(emulated::read_ttbr0(), ttbr0);
        // First placement is not a migration: no stack mapping.
        assert_eq!(
            mmu.domain_translate(domain, va(0x20_0000)),
            Err(TranslateError::NotMapped)
        );
    }

    #[test]
    fn exiting_thread_stack_is_reset() {
        let mmu = mmu::<16>();
        let domain = mmu.domain_create().unwrap();
        let mut thread = Thread::user(StackRegion::new(0x20_0000, PAGE));
        mmu.thread_init(&mut thread, ThreadRoot::Domain(domain)).unwrap();

        mmu.thread_domain_remove(&thread, false).unwrap();
        assert!(mmu.domain_translate(domain, va(0x20_0000)).is_ok());

        mmu.thread_domain_remove(&thread, true).unwrap();
        assert_eq!(
            mmu.domain_translate(domain, va(0x20_0000)),
            Err(TranslateError::NotMapped)
        );
        assert_eq!(mmu.audit(), None);
    }
}
