/*
 * Paging Mechanics
 *
 * Two-level x86 page table manipulation: 1024-entry page directory, each
 * entry covering 4 MiB through a 1024-entry page table. This module owns
 * the entry and table types, the table walk, and the kernel template that
 * every address space shares. Policy (regions, zero-fill, cloning) lives in
 * `memory::vm`.
 *
 * Page directories and page tables are allocated from the kernel heap,
 * which is direct-mapped, so a table's physical address is also the pointer
 * the kernel dereferences to walk it. User data frames are above the direct
 * map and are never dereferenced directly.
 */

use core::ptr::NonNull;

use crate::memory::heap;
use crate::memory::types::{PhysAddr, PteFlags, VirtAddr, PAGE_SIZE};
use crate::memory::USER_MEM_START;
use crate::sync::SpinLock;

/// Page-directory entries covering the kernel direct map (16 MiB / 4 MiB).
pub const KERNEL_PDES: usize = (USER_MEM_START >> 22) as usize;

/// Entries per directory or table.
pub const TABLE_ENTRIES: usize = 1024;

/// Bytes of virtual space covered by one page table.
pub const TABLE_SPAN: u32 = (TABLE_ENTRIES as u32) * PAGE_SIZE;

/// Page table entry
#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct PageTableEntry(u32);

impl PageTableEntry {
    /// Get physical address from entry
    pub fn addr(&self) -> PhysAddr {
        PhysAddr::new(self.0 & !(PAGE_SIZE - 1))
    }

    /// Set physical address and flags
    pub fn set(&mut self, addr: PhysAddr, flags: PteFlags) {
        assert!(
            addr.is_page_aligned(),
            "page table entry address must be 4KB aligned, got {:#x}",
            addr.as_u32()
        );
        self.0 = addr.as_u32() | flags.bits();
    }

    /// Check if entry is present
    pub fn is_present(&self) -> bool {
        self.0 & PteFlags::PRESENT.bits() != 0
    }

    /// Clear entry
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Get flags
    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & (PAGE_SIZE - 1))
    }

    /// Rewrite only the flag bits, keeping the frame address.
    pub fn set_flags(&mut self, flags: PteFlags) {
        self.0 = (self.0 & !(PAGE_SIZE - 1)) | flags.bits();
    }
}

/// Page directory or page table (1024 entries)
#[repr(align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; TABLE_ENTRIES],
}

impl PageTable {
    /// Zero out all entries
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

/// Directory index of a virtual address (top 10 bits).
pub fn pd_index(va: VirtAddr) -> usize {
    (va.as_u32() >> 22) as usize
}

/// Table index of a virtual address (middle 10 bits).
pub fn pt_index(va: VirtAddr) -> usize {
    ((va.as_u32() >> 12) & 0x3ff) as usize
}

/// Dereference a table by its physical address.
///
/// # Safety
/// `phys` must point at a live table inside the direct-mapped region.
pub unsafe fn table_ptr(phys: PhysAddr) -> *mut PageTable {
    debug_assert!(
        phys.as_u32() < USER_MEM_START,
        "page table {:#x} outside direct map",
        phys.as_u32()
    );
    phys.as_u32() as *mut PageTable
}

/// Allocate a zeroed page table or directory from the kernel heap.
pub fn alloc_table() -> Result<PhysAddr, &'static str> {
    let ptr = heap::try_alloc_aligned(PAGE_SIZE as usize, PAGE_SIZE as usize)
        .ok_or("out of kernel memory allocating page table")?;
    let table = ptr.as_ptr() as *mut PageTable;
    unsafe { (*table).zero() };
    Ok(PhysAddr::new(ptr.as_ptr() as u32))
}

/// Free a table allocated with `alloc_table`.
pub fn free_table(phys: PhysAddr) {
    unsafe {
        heap::free_aligned(
            NonNull::new(phys.as_u32() as *mut u8).expect("null page table"),
            PAGE_SIZE as usize,
            PAGE_SIZE as usize,
        );
    }
}

/// The kernel page tables shared by every address space, built once.
static KERNEL_TABLES: SpinLock<[PhysAddr; KERNEL_PDES]> =
    SpinLock::new([PhysAddr::new(0); KERNEL_PDES]);

/// Local APIC register page, identity-mapped as a shared global entry in
/// every address space. Outside the direct map, so it gets a page table
/// of its own.
pub const LAPIC_MMIO_BASE: u32 = 0xfee0_0000;

static MMIO_TABLE: SpinLock<PhysAddr> = SpinLock::new(PhysAddr::new(0));

/// Build the global kernel tables: a direct map of [0, USER_MEM_START)
/// with supervisor-only, writable, global pages, plus the uncached APIC
/// MMIO page.
pub fn init_kernel_tables() -> Result<(), &'static str> {
    let mut tables = KERNEL_TABLES.lock();
    let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::GLOBAL;

    for (i, slot) in tables.iter_mut().enumerate() {
        let pt_phys = alloc_table()?;
        let pt = unsafe { &mut *table_ptr(pt_phys) };
        for j in 0..TABLE_ENTRIES {
            let frame = (i * TABLE_ENTRIES + j) as u32 * PAGE_SIZE;
            pt.entries[j].set(PhysAddr::new(frame), flags);
        }
        *slot = pt_phys;
    }

    let mmio_pt = alloc_table()?;
    let pt = unsafe { &mut *table_ptr(mmio_pt) };
    pt.entries[pt_index(VirtAddr::new(LAPIC_MMIO_BASE))].set(
        PhysAddr::new(LAPIC_MMIO_BASE),
        flags | PteFlags::NO_CACHE,
    );
    *MMIO_TABLE.lock() = mmio_pt;

    log::info!(
        "kernel direct map built: {} global page tables over {} MiB (+ APIC page)",
        KERNEL_PDES,
        USER_MEM_START / (1024 * 1024)
    );
    Ok(())
}

/// Allocate a new page directory with the kernel entries filled in.
///
/// The kernel tables are shared by reference; only user-space directory
/// entries ever differ between address spaces.
pub fn alloc_directory() -> Result<PhysAddr, &'static str> {
    let pd_phys = alloc_table()?;
    let pd = unsafe { &mut *table_ptr(pd_phys) };
    let tables = KERNEL_TABLES.lock();
    let flags = PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::GLOBAL;
    for i in 0..KERNEL_PDES {
        pd.entries[i].set(tables[i], flags);
    }
    pd.entries[pd_index(VirtAddr::new(LAPIC_MMIO_BASE))].set(*MMIO_TABLE.lock(), flags);
    Ok(pd_phys)
}

/// Walk to the PTE for `va` under `root`.
///
/// With `create`, a missing page table is allocated and hooked into the
/// directory with user/writable directory flags (per-page permissions are
/// enforced at the PTE level).
///
/// Returns None for a non-present table when not creating.
pub fn entry_for(
    root: PhysAddr,
    va: VirtAddr,
    create: bool,
) -> Result<Option<*mut PageTableEntry>, &'static str> {
    let pd = unsafe { &mut *table_ptr(root) };
    let pde = &mut pd.entries[pd_index(va)];

    let pt_phys = if pde.is_present() {
        pde.addr()
    } else if create {
        let pt_phys = alloc_table()?;
        pde.set(
            pt_phys,
            PteFlags::PRESENT | PteFlags::WRITABLE | PteFlags::USER_ACCESSIBLE,
        );
        pt_phys
    } else {
        return Ok(None);
    };

    let pt = unsafe { &mut *table_ptr(pt_phys) };
    Ok(Some(&mut pt.entries[pt_index(va)] as *mut _))
}

/// Translate a virtual address under `root`.
pub fn translate(root: PhysAddr, va: VirtAddr) -> Option<(PhysAddr, PteFlags)> {
    let pd = unsafe { &*table_ptr(root) };
    let pde = pd.entries[pd_index(va)];
    if !pde.is_present() {
        return None;
    }
    let pt = unsafe { &*table_ptr(pde.addr()) };
    let pte = pt.entries[pt_index(va)];
    if !pte.is_present() {
        return None;
    }
    let offset = va.as_u32() & (PAGE_SIZE - 1);
    Some((PhysAddr::new(pte.addr().as_u32() + offset), pte.flags()))
}

/// Invalidate one TLB entry on the current CPU.
#[inline]
pub fn flush_tlb(va: VirtAddr) {
    unsafe {
        x86::tlb::flush(va.as_u32() as usize);
    }
}

/// Current page directory base.
pub fn current_root() -> PhysAddr {
    PhysAddr::new(unsafe { x86::controlregs::cr3() } as u32)
}

/// Load a new page directory base. Flushes the non-global TLB.
///
/// # Safety
/// `root` must be a live page directory whose kernel entries map the
/// currently executing code and stack.
pub unsafe fn switch_root(root: PhysAddr) {
    unsafe {
        x86::controlregs::cr3_write(root.as_u32() as u64);
    }
}

/// Turn on paging with global-page support.
///
/// # Safety
/// `root` must direct-map the kernel so execution continues across the
/// moment paging turns on.
pub unsafe fn enable_paging(root: PhysAddr) {
    use x86::controlregs::{cr0, cr0_write, cr4, cr4_write, Cr0, Cr4};
    unsafe {
        switch_root(root);
        cr4_write(cr4() | Cr4::CR4_ENABLE_GLOBAL_PAGES);
        // WP stays off: the exec loader writes program text through
        // read-only user mappings from ring 0.
        cr0_write(cr0() | Cr0::CR0_ENABLE_PAGING);
    }
    log::info!("paging enabled, root {:#x}", root.as_u32());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_split_the_address() {
        let va = VirtAddr::new((3 << 22) | (7 << 12) | 0x123);
        assert_eq!(pd_index(va), 3);
        assert_eq!(pt_index(va), 7);
    }

    #[test]
    fn test_kernel_span_covers_user_mem_start() {
        // The direct map must end exactly where user space begins.
        assert_eq!(KERNEL_PDES as u32 * TABLE_SPAN, USER_MEM_START);
    }

    #[test]
    fn test_entry_roundtrips_addr_and_flags() {
        let mut e = PageTableEntry(0);
        let flags = PteFlags::PRESENT | PteFlags::USER_ACCESSIBLE | PteFlags::ZFOD;
        e.set(PhysAddr::new(0x1234_5000), flags);
        assert_eq!(e.addr().as_u32(), 0x1234_5000);
        assert_eq!(e.flags(), flags);
        assert!(e.is_present());

        e.set_flags(flags - PteFlags::ZFOD | PteFlags::WRITABLE);
        assert_eq!(e.addr().as_u32(), 0x1234_5000);
        assert!(!e.flags().contains(PteFlags::ZFOD));
        assert!(e.flags().contains(PteFlags::WRITABLE));
    }
}
