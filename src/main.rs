/*
 * Finch Kernel Main Entry Point
 *
 * Boot path for a small SMP kernel on 32-bit x86. The bootstrap
 * processor (CPU 0) is the manager: it brings up memory, tables and the
 * console, wakes the application processors, and then parks forever in
 * the message dispatch loop. The APs are the workers: each initializes
 * its per-CPU state in a fixed order, becomes its own idle thread, and
 * runs user threads from then on.
 *
 * Key properties:
 * - Manager/worker split: user code never runs on CPU 0
 * - Workers own their run queues; cross-CPU traffic is messages only
 * - The boot stacks double as the idle threads' kernel stacks
 */

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), no_main)]
#![cfg_attr(not(test), feature(alloc_error_handler))]
#![allow(dead_code)]

extern crate alloc;
#[cfg(not(test))]
extern crate rlibc;

#[macro_use]
mod utils;

mod arch;
mod bus;
mod console;
mod lifecycle;
mod loader;
mod memory;
mod sched;
mod sync;
mod syscall;
mod task;
mod tests;
mod traps;

use task::tcb::KERNEL_STACK_SIZE;

/// Multiboot2 magic handed over in EAX by the boot loader.
const MULTIBOOT2_MAGIC: u32 = 0x36d7_6289;

/// CPUs assumed present. Discovery tables are a boot-loader concern; the
/// machines this kernel targets are virtual and configured to match.
const BOOT_CPUS: usize = 4;

/// Fallback top of RAM when the boot loader gives no memory map.
const DEFAULT_PHYS_TOP: u32 = 64 * 1024 * 1024;

/// A kernel stack usable before the scheduler exists. Aligned like every
/// other kernel stack so the stack-pointer TCB lookup works on it.
#[repr(C, align(8192))]
struct BootStack([u8; KERNEL_STACK_SIZE as usize]);

/// The manager's stack, later registered as its dispatch-loop TCB.
#[unsafe(no_mangle)]
static mut BSP_STACK: BootStack = BootStack([0; KERNEL_STACK_SIZE as usize]);

// Boot-loader entry on the BSP. Switch onto our own stack and carry the
// multiboot registers into Rust.
#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    ".global _start",
    "_start:",
    "cli",
    "lea esp, [BSP_STACK + {stack_size}]",
    "push ebx", // multiboot information structure
    "push eax", // multiboot magic
    "call kstart",
    "1:",
    "hlt",
    "jmp 1b",
    stack_size = const KERNEL_STACK_SIZE,
);

/// Manager (BSP) bring-up.
#[unsafe(no_mangle)]
pub extern "C" fn kstart(magic: u32, mbi: u32) -> ! {
    utils::serial::init();
    utils::logger::init();
    log::info!("finch kernel booting");

    let phys_top = parse_boot_info(magic, mbi);
    arch::smp::set_cpu_count(BOOT_CPUS);

    arch::gdt::init();
    arch::gdt::load_on_this_cpu(0);
    arch::idt::init();
    arch::idt::load_on_this_cpu();

    memory::init(phys_top, arch::smp::cpu_count()).expect("memory bring-up failed");

    arch::pic::init();
    console::init();

    // The dispatch loop needs a TCB so stack-pointer lookup and the
    // global table locks work on this CPU too.
    let bsp_base = &raw const BSP_STACK as u32;
    task::tcb::Tcb::create_bootstrap(bsp_base, 0).expect("cannot create manager TCB");

    start_workers();

    arch::interrupts::enable();
    lifecycle::manager_main()
}

/// Pull the memory bound out of the multiboot2 info, if there is one.
fn parse_boot_info(magic: u32, mbi: u32) -> u32 {
    if magic != MULTIBOOT2_MAGIC {
        log::warn!("no multiboot2 magic (got {:#x}); assuming defaults", magic);
        return DEFAULT_PHYS_TOP;
    }
    let boot_info = unsafe {
        multiboot2::BootInformation::load(mbi as *const multiboot2::BootInformationHeader)
    };
    match boot_info {
        Ok(info) => {
            let top = info
                .memory_map_tag()
                .map(|mm| {
                    mm.memory_areas()
                        .iter()
                        .filter(|a| a.typ() == multiboot2::MemoryAreaType::Available)
                        .map(|a| a.end_address() as u32)
                        .max()
                        .unwrap_or(DEFAULT_PHYS_TOP)
                })
                .unwrap_or(DEFAULT_PHYS_TOP);
            log::info!("usable RAM up to {:#x}", top);
            top
        }
        Err(e) => {
            log::warn!("multiboot2 info unreadable ({:?}); assuming defaults", e);
            DEFAULT_PHYS_TOP
        }
    }
}

/// Allocate the worker boot stacks and kick the APs.
fn start_workers() {
    for cpu in 1..arch::smp::cpu_count() {
        let stack = memory::heap::try_alloc_aligned(
            KERNEL_STACK_SIZE as usize,
            KERNEL_STACK_SIZE as usize,
        )
        .expect("cannot allocate worker boot stack");
        unsafe {
            arch::smp::AP_BOOT_STACKS[cpu] = stack.as_ptr() as u32 + KERNEL_STACK_SIZE;
        }
    }
    arch::smp::boot_aps();
}

/// Worker (AP) bring-up. Called from the SMP trampoline with interrupts
/// off, on this worker's boot stack.
///
/// The order is fixed: adopt the initial page directory, then per-CPU
/// frame and queue state, then the scheduler, and only then interrupts.
#[unsafe(no_mangle)]
pub extern "C" fn ap_main(cpu: u32) -> ! {
    arch::gdt::load_on_this_cpu(cpu as usize);
    arch::idt::load_on_this_cpu();

    unsafe { memory::paging::enable_paging(memory::vm::boot_root()) };

    bus::init_worker(cpu as usize);

    let stack_top = unsafe { arch::smp::AP_BOOT_STACKS[cpu as usize] };
    sched::init_cpu(stack_top - KERNEL_STACK_SIZE);

    arch::smp::init_lapic_timer();

    // Worker 1 seeds the task tree.
    if cpu == 1 {
        loader::spawn_init_task().expect("cannot spawn init task");
        #[cfg(feature = "ktest")]
        tests::spawn_test_threads();
    }

    arch::smp::mark_online();
    log::info!("worker online");

    // This context is now the idle thread: never enqueued, never
    // blocked, runs only when the queue is empty.
    loop {
        arch::wait_for_interrupt();
    }
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    serial_println!("KERNEL PANIC on cpu{}: {}", arch::smp::cpu_id().0, info);
    arch::halt_forever()
}
