/*
 * Virtual Memory Manager
 *
 * Per-address-space policy layer over the paging mechanics: region
 * creation and removal, zero-fill-on-demand, copy-on-fork cloning, teardown
 * and user-pointer validation.
 *
 * Frames are reserved before any page table entry is mutated, so a region
 * operation either fully succeeds or leaves the address space untouched.
 * Zero-fill pages keep their reservation pre-paid until first write.
 *
 * Concurrency: the page tables of one address space are partitioned into
 * groups of directory entries, one sleeping mutex per group. An operation
 * covering a range acquires the group locks in ascending index order and
 * releases them in descending order.
 */

use alloc::boxed::Box;

use crate::memory::paging::{self, PageTableEntry, TABLE_ENTRIES};
use crate::memory::types::{PhysAddr, PhysFrame, PteFlags, VirtAddr, PAGE_SIZE};
use crate::memory::{frames, USER_MEM_START};
use crate::sync::Mutex;

/// Directory entries per lock group.
const GROUP_SIZE: usize = 64;

/// Number of page-table lock groups per address space.
const PDE_GROUPS: usize = TABLE_ENTRIES / GROUP_SIZE;

/// Errors from region operations, mapped to syscall codes by the handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Not enough free frames to reserve the request.
    NoMem,
    /// A page in the requested range is already mapped.
    Overlap,
    /// Address outside user space or length malformed.
    BadAddress,
    /// remove_pages target is not the start of a new_pages region.
    NotRegionStart,
}

/// Categorised result of user-pointer validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidError {
    KernelSpace,
    Len,
    NotNullTerm,
    ReadOnly,
    PageNotAlloc,
}

/// The page directory shared by idle threads and used while an address
/// space is being torn down. Maps only kernel space.
static mut BOOT_ROOT: PhysAddr = PhysAddr::new(0);

/// The single all-zero frame backing every untouched ZFOD page.
static mut ZERO_FRAME: PhysAddr = PhysAddr::new(0);

/// Build the initial page directory, allocate the shared zero frame and
/// enable paging on the boot CPU. Workers adopt the same root in their
/// bring-up path.
pub fn init() -> Result<(), &'static str> {
    paging::init_kernel_tables()?;
    let root = paging::alloc_directory()?;

    let zero = crate::memory::heap::try_alloc_aligned(PAGE_SIZE as usize, PAGE_SIZE as usize)
        .ok_or("out of kernel memory allocating zero frame")?;
    unsafe {
        core::ptr::write_bytes(zero.as_ptr(), 0, PAGE_SIZE as usize);
        ZERO_FRAME = PhysAddr::new(zero.as_ptr() as u32);
        BOOT_ROOT = root;
        paging::enable_paging(root);
    }
    Ok(())
}

/// Page directory used by idle threads and during teardown.
pub fn boot_root() -> PhysAddr {
    unsafe { BOOT_ROOT }
}

/// Physical address of the shared zero frame.
pub fn zero_frame() -> PhysAddr {
    unsafe { ZERO_FRAME }
}

/// One task's address space: a page directory plus its group locks.
pub struct AddressSpace {
    root: PhysAddr,
    group_locks: [Mutex; PDE_GROUPS],
}

/// Inclusive group-index range covered by a span of directory entries.
fn group_range(pde_lo: usize, pde_hi: usize) -> (usize, usize) {
    (pde_lo / GROUP_SIZE, pde_hi / GROUP_SIZE)
}

impl AddressSpace {
    /// Create an empty user address space sharing the kernel tables.
    pub fn new() -> Result<Box<Self>, VmError> {
        let root = paging::alloc_directory().map_err(|_| VmError::NoMem)?;
        Ok(Box::new(Self {
            root,
            group_locks: core::array::from_fn(|_| Mutex::new()),
        }))
    }

    /// Physical address of the page directory, as loaded into cr3.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Run `f` with the group locks for [va, va+bytes) held.
    ///
    /// Locks are taken in ascending group order and dropped in descending
    /// order, which is the crate-wide ordering rule for these locks.
    fn with_range_locked<R>(&self, va: VirtAddr, bytes: u32, f: impl FnOnce() -> R) -> R {
        let lo = paging::pd_index(va.page_base());
        let hi = paging::pd_index(VirtAddr::new(va.as_u32() + bytes.saturating_sub(1)));
        let (glo, ghi) = group_range(lo, hi);
        for g in glo..=ghi {
            self.group_locks[g].lock();
        }
        let r = f();
        for g in (glo..=ghi).rev() {
            self.group_locks[g].unlock();
        }
        r
    }

    /// Map [va, va+bytes) into this address space.
    ///
    /// Pages are either backed by the shared zero frame (`zfod`, read-only
    /// until first write) or by fresh zeroed frames. With `from_new_pages`
    /// the first and last pages are marked so a later `remove_region` can
    /// refuse arbitrary midpoints, and any already-present page fails the
    /// whole request. Without it (the exec loader path) present pages are
    /// left as they are, so adjacent segments may share a boundary page.
    ///
    /// Must be called with this address space active when non-ZFOD pages
    /// are requested, since fresh frames are zeroed through their own
    /// mapping.
    pub fn new_region(
        &self,
        va: VirtAddr,
        bytes: u32,
        rw: bool,
        from_new_pages: bool,
        zfod: bool,
    ) -> Result<(), VmError> {
        if bytes == 0 || va.as_u32().checked_add(bytes - 1).is_none() {
            return Err(VmError::BadAddress);
        }
        if va.as_u32() < USER_MEM_START
            || va.as_u32() + (bytes - 1) >= crate::memory::USER_MEM_LIMIT
        {
            return Err(VmError::BadAddress);
        }

        let first = va.page_base().as_u32();
        let last = VirtAddr::new(va.as_u32() + bytes - 1).page_base().as_u32();

        self.with_range_locked(va, bytes, || {
            // First pass: count the frames this request needs, check for
            // collisions, and grow any missing page tables. An empty page
            // table is not visible mapping state, so failing out of this
            // pass leaves the region untouched as far as the contract
            // goes.
            let mut unmapped = 0u32;
            let mut page = first;
            loop {
                let pte = paging::entry_for(self.root, VirtAddr::new(page), true)
                    .map_err(|_| VmError::NoMem)?
                    .expect("create walk returned no entry");
                if unsafe { (*pte).is_present() } {
                    if from_new_pages {
                        return Err(VmError::Overlap);
                    }
                } else {
                    unmapped += 1;
                }
                if page == last {
                    break;
                }
                page += PAGE_SIZE;
            }

            if !frames::reserve(unmapped) {
                return Err(VmError::NoMem);
            }

            // Second pass: mutate. Tables exist and the reservation
            // guarantees every get_frame succeeds, so nothing below this
            // point can fail partway.
            let mut done = 0u32;
            let mut page = first;
            loop {
                let pte = paging::entry_for(self.root, VirtAddr::new(page), false)
                    .map_err(|_| VmError::NoMem)?
                    .expect("table vanished between passes");

                if unsafe { !(*pte).is_present() } {
                    let mut flags = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE;
                    if from_new_pages {
                        if page == first {
                            flags |= PteFlags::NEW_PAGES_START;
                        }
                        if page == last {
                            flags |= PteFlags::NEW_PAGES_END;
                        }
                    }
                    if zfod {
                        // Shared zero frame, never writable; first write
                        // faults and materialises a real frame.
                        flags |= PteFlags::ZFOD;
                        unsafe { (*pte).set(zero_frame(), flags) };
                    } else {
                        let frame = frames::get_frame().expect("reserved frame missing");
                        if rw {
                            flags |= PteFlags::WRITABLE;
                        }
                        unsafe {
                            // Map writable first so the fresh frame can be
                            // zeroed through the new mapping, then settle
                            // the final flags.
                            (*pte).set(
                                frame.start_address(),
                                flags | PteFlags::WRITABLE,
                            );
                            paging::flush_tlb(VirtAddr::new(page));
                            core::ptr::write_bytes(page as *mut u8, 0, PAGE_SIZE as usize);
                            (*pte).set_flags(flags);
                            paging::flush_tlb(VirtAddr::new(page));
                        }
                    }
                    done += 1;
                } else if rw && !zfod {
                    // Boundary page shared with a previous segment: widen
                    // its permissions so the writable segment works.
                    unsafe {
                        let flags = (*pte).flags() | PteFlags::WRITABLE;
                        (*pte).set_flags(flags);
                        paging::flush_tlb(VirtAddr::new(page));
                    }
                }
                if page == last {
                    break;
                }
                page += PAGE_SIZE;
            }

            debug_assert_eq!(done, unmapped);
            Ok(())
        })
    }

    /// Free a region previously created by new_pages.
    ///
    /// `va` must carry the region-start marker; pages are freed up to and
    /// including the end-marker page. Zero-fill pages return their prepaid
    /// reservation, real pages return their frame.
    pub fn remove_region(&self, va: VirtAddr) -> Result<(), VmError> {
        if va.as_u32() < USER_MEM_START || !va.is_page_aligned() {
            return Err(VmError::BadAddress);
        }

        // The region length is not known until the walk reaches the end
        // marker; group locks are acquired in ascending order as the walk
        // crosses group boundaries.
        let lo_group = paging::pd_index(va) / GROUP_SIZE;
        let mut held_hi = lo_group;
        self.group_locks[lo_group].lock();

        let result = (|| {
            let start = paging::entry_for(self.root, va, false).map_err(|_| VmError::NoMem)?;
            let start = match start {
                Some(p) if unsafe { (*p).is_present() } => p,
                _ => return Err(VmError::NotRegionStart),
            };
            if unsafe { !(*start).flags().contains(PteFlags::NEW_PAGES_START) } {
                return Err(VmError::NotRegionStart);
            }

            let mut page = va.as_u32();
            loop {
                let group = paging::pd_index(VirtAddr::new(page)) / GROUP_SIZE;
                while held_hi < group {
                    held_hi += 1;
                    self.group_locks[held_hi].lock();
                }

                let pte = paging::entry_for(self.root, VirtAddr::new(page), false)
                    .map_err(|_| VmError::NoMem)?
                    .filter(|p| unsafe { (**p).is_present() })
                    .ok_or(VmError::NotRegionStart)?;

                let flags = unsafe { (*pte).flags() };
                if flags.contains(PteFlags::ZFOD) {
                    frames::unreserve(1);
                } else {
                    frames::put_frame(PhysFrame::containing_address(unsafe { (*pte).addr() }));
                }
                unsafe {
                    (*pte).clear();
                }
                paging::flush_tlb(VirtAddr::new(page));

                if flags.contains(PteFlags::NEW_PAGES_END) {
                    break;
                }
                page += PAGE_SIZE;
            }
            Ok(())
        })();

        for g in (lo_group..=held_hi).rev() {
            self.group_locks[g].unlock();
        }
        result
    }

    /// Clone this address space for fork.
    ///
    /// Reserves frames for every present user page up front, then copies
    /// page by page. Zero-fill pages are cloned as references to the shared
    /// zero frame and keep a prepaid reservation in the clone. Kernel
    /// directory entries are shared, never copied.
    ///
    /// Must run with this address space active: the destination frame is
    /// temporarily remapped over the source page to receive the copy, since
    /// user frames are not visible through the kernel direct map.
    pub fn clone_space(&self) -> Result<Box<AddressSpace>, VmError> {
        debug_assert_eq!(paging::current_root().as_u32(), self.root.as_u32());

        for g in 0..PDE_GROUPS {
            self.group_locks[g].lock();
        }
        let result = self.clone_locked();
        for g in (0..PDE_GROUPS).rev() {
            self.group_locks[g].unlock();
        }
        result
    }

    fn clone_locked(&self) -> Result<Box<AddressSpace>, VmError> {
        let present = self.count_present_user_pages();
        if !frames::reserve(present) {
            return Err(VmError::NoMem);
        }

        let clone = match AddressSpace::new() {
            Ok(c) => c,
            Err(e) => {
                frames::unreserve(present);
                return Err(e);
            }
        };

        let mut copied = 0u32;
        let src_pd = unsafe { &*paging::table_ptr(self.root) };
        for pde_idx in crate::memory::paging::KERNEL_PDES..TABLE_ENTRIES {
            let pde = src_pd.entries[pde_idx];
            // GLOBAL directory entries are kernel-shared (MMIO), never
            // task state.
            if !pde.is_present() || pde.flags().contains(PteFlags::GLOBAL) {
                continue;
            }
            let src_pt = unsafe { &*paging::table_ptr(pde.addr()) };
            for pte_idx in 0..TABLE_ENTRIES {
                let src_pte = src_pt.entries[pte_idx];
                if !src_pte.is_present() {
                    continue;
                }
                let va = VirtAddr::new(((pde_idx << 22) | (pte_idx << 12)) as u32);
                if let Err(e) = self.clone_one_page(&clone, va, src_pte) {
                    // Unwind: the clone owns everything copied so far plus
                    // the reservations not yet spent.
                    clone.free_space();
                    clone.release_directory();
                    frames::unreserve(present - copied);
                    return Err(e);
                }
                copied += 1;
            }
        }

        debug_assert_eq!(copied, present);
        Ok(clone)
    }

    /// Copy one present source page into the clone.
    fn clone_one_page(
        &self,
        clone: &AddressSpace,
        va: VirtAddr,
        src_pte: PageTableEntry,
    ) -> Result<(), VmError> {
        let dst_entry = paging::entry_for(clone.root, va, true)
            .map_err(|_| VmError::NoMem)?
            .expect("create walk returned no entry");
        let flags = src_pte.flags();

        if flags.contains(PteFlags::ZFOD) {
            // Lazy page: share the zero frame, reservation carries over.
            unsafe { (*dst_entry).set(zero_frame(), flags) };
            return Ok(());
        }

        let dst_frame = frames::get_frame().ok_or(VmError::NoMem)?;

        // The destination frame is not kernel-addressable, so stage the
        // page through a kernel buffer and briefly point the source PTE at
        // the destination frame to write it.
        let mut buf = alloc::vec![0u8; PAGE_SIZE as usize];
        let src_entry = paging::entry_for(self.root, va, false)
            .map_err(|_| VmError::NoMem)?
            .expect("present page lost its table");
        unsafe {
            core::ptr::copy_nonoverlapping(
                va.as_u32() as *const u8,
                buf.as_mut_ptr(),
                PAGE_SIZE as usize,
            );
            (*src_entry).set(
                dst_frame.start_address(),
                PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER_ACCESSIBLE,
            );
            paging::flush_tlb(va);
            core::ptr::copy_nonoverlapping(
                buf.as_ptr(),
                va.as_u32() as *mut u8,
                PAGE_SIZE as usize,
            );
            (*src_entry).set(src_pte.addr(), flags);
            paging::flush_tlb(va);
            (*dst_entry).set(dst_frame.start_address(), flags);
        }
        Ok(())
    }

    fn count_present_user_pages(&self) -> u32 {
        let pd = unsafe { &*paging::table_ptr(self.root) };
        let mut count = 0;
        for pde_idx in crate::memory::paging::KERNEL_PDES..TABLE_ENTRIES {
            let pde = pd.entries[pde_idx];
            if !pde.is_present() || pde.flags().contains(PteFlags::GLOBAL) {
                continue;
            }
            let pt = unsafe { &*paging::table_ptr(pde.addr()) };
            for pte in pt.entries.iter() {
                if pte.is_present() {
                    count += 1;
                }
            }
        }
        count
    }

    /// Tear down all user mappings, returning frames and reservations.
    /// The page directory itself stays alive; exec reuses it and vanish
    /// releases it separately once cr3 has moved off it.
    pub fn free_space(&self) {
        for g in 0..PDE_GROUPS {
            self.group_locks[g].lock();
        }

        let pd = unsafe { &mut *paging::table_ptr(self.root) };
        for pde_idx in crate::memory::paging::KERNEL_PDES..TABLE_ENTRIES {
            let pde = &mut pd.entries[pde_idx];
            if !pde.is_present() || pde.flags().contains(PteFlags::GLOBAL) {
                continue;
            }
            let pt = unsafe { &mut *paging::table_ptr(pde.addr()) };
            for pte in pt.entries.iter_mut() {
                if !pte.is_present() {
                    continue;
                }
                if pte.flags().contains(PteFlags::ZFOD) {
                    frames::unreserve(1);
                } else {
                    frames::put_frame(PhysFrame::containing_address(pte.addr()));
                }
                pte.clear();
            }
            paging::free_table(pde.addr());
            pde.clear();
        }

        for g in (0..PDE_GROUPS).rev() {
            self.group_locks[g].unlock();
        }
    }

    /// Release the page directory. The caller must have switched cr3 away
    /// from this address space first.
    pub fn release_directory(&self) {
        debug_assert_ne!(paging::current_root().as_u32(), self.root.as_u32());
        paging::free_table(self.root);
    }

    /// Full teardown: user mappings, page tables and the directory.
    pub fn free_entire_space(&self) {
        self.free_space();
        self.release_directory();
    }

    /// Page-fault hook: resolve a write to a present ZFOD page.
    ///
    /// Returns true when the fault was a zero-fill materialisation and has
    /// been handled; the faulting instruction can then be retried. The
    /// frame was reserved when the region was created, so allocation here
    /// cannot fail.
    pub fn is_page_zfod(&self, va: VirtAddr, error_code: u32) -> bool {
        const PF_PRESENT: u32 = 1 << 0;
        const PF_WRITE: u32 = 1 << 1;
        if error_code & PF_PRESENT == 0 || error_code & PF_WRITE == 0 {
            return false;
        }

        self.with_range_locked(va, 1, || {
            let pte = match paging::entry_for(self.root, va, false) {
                Ok(Some(p)) if unsafe { (*p).is_present() } => p,
                _ => return false,
            };
            let flags = unsafe { (*pte).flags() };
            if !flags.contains(PteFlags::ZFOD) {
                return false;
            }

            let frame = frames::get_frame().expect("prepaid ZFOD frame missing");
            let new_flags =
                (flags - PteFlags::ZFOD) | PteFlags::WRITABLE | PteFlags::PRESENT;
            let page = va.page_base();
            unsafe {
                (*pte).set(frame.start_address(), new_flags);
                paging::flush_tlb(page);
                core::ptr::write_bytes(page.as_u32() as *mut u8, 0, PAGE_SIZE as usize);
            }
            true
        })
    }

    /// Validate a user buffer for a syscall.
    ///
    /// Walks presence and permission bits for every covered page with the
    /// page-table group locks held. A ZFOD page counts as writable. With
    /// `want_null_terminator` the walk stops at the first zero byte and
    /// fails if none occurs within `n` bytes.
    pub fn check_mem_validness(
        &self,
        p: VirtAddr,
        n: u32,
        want_null_terminator: bool,
        want_writable: bool,
    ) -> Result<(), ValidError> {
        if n == 0 {
            return Err(ValidError::Len);
        }
        if p.as_u32() < USER_MEM_START {
            return Err(ValidError::KernelSpace);
        }
        match p.as_u32().checked_add(n - 1) {
            Some(end) if end < crate::memory::USER_MEM_LIMIT => {}
            Some(_) => return Err(ValidError::KernelSpace),
            None => return Err(ValidError::Len),
        }

        self.with_range_locked(p, n, || {
            let mut page = p.page_base().as_u32();
            let last = VirtAddr::new(p.as_u32() + n - 1).page_base().as_u32();
            loop {
                let pte = paging::entry_for(self.root, VirtAddr::new(page), false)
                    .ok()
                    .flatten()
                    .filter(|e| unsafe { (**e).is_present() })
                    .ok_or(ValidError::PageNotAlloc)?;
                let flags = unsafe { (*pte).flags() };
                if want_writable
                    && !flags.contains(PteFlags::WRITABLE)
                    && !flags.contains(PteFlags::ZFOD)
                {
                    return Err(ValidError::ReadOnly);
                }

                if want_null_terminator {
                    let scan_lo = page.max(p.as_u32());
                    let scan_hi = (page + PAGE_SIZE).min(p.as_u32() + n);
                    for addr in scan_lo..scan_hi {
                        if unsafe { core::ptr::read_volatile(addr as *const u8) } == 0 {
                            return Ok(());
                        }
                    }
                }

                if page == last {
                    break;
                }
                page += PAGE_SIZE;
            }

            if want_null_terminator {
                Err(ValidError::NotNullTerm)
            } else {
                Ok(())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_range_spans() {
        assert_eq!(group_range(4, 4), (0, 0));
        assert_eq!(group_range(63, 64), (0, 1));
        assert_eq!(group_range(128, 300), (2, 4));
    }
}
