/*
 * Memory Subsystem
 *
 * Initialization order matters: the heap must exist before the kernel page
 * tables (tables are heap-carved), and paging must be on before any user
 * address space is built.
 */

pub mod frames;
pub mod heap;
pub mod paging;
pub mod types;
pub mod vm;

/// First user-space address; everything below is the kernel direct map.
pub const USER_MEM_START: u32 = 0x0100_0000;

/// First address above user space. The top of the address space holds
/// kernel-shared MMIO mappings.
pub const USER_MEM_LIMIT: u32 = 0xfe00_0000;

/// Boot-time memory initialization on the manager CPU.
///
/// `phys_top` is the top of usable RAM reported by the boot loader,
/// `cpu_count` the number of CPUs sharing the user frame range.
pub fn init(phys_top: u32, cpu_count: usize) -> Result<(), &'static str> {
    unsafe { heap::init() };
    frames::init(phys_top, cpu_count);
    vm::init()?;
    Ok(())
}
