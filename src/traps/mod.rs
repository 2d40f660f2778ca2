/*
 * Trap Dispatch
 *
 * Single entry point for every wired vector: hardware interrupts are
 * acknowledged and routed, the syscall gate goes to the dispatcher, and
 * exceptions walk the policy chain. For a page fault that chain is
 * zero-fill resolution first, then the thread's swexn handler, then
 * death; other exceptions skip straight to the handler-or-death step.
 *
 * A fault with the kernel's own code segment is never survivable; it
 * panics with the frame so the bug is visible.
 */

pub mod swexn;

use crate::arch::idt::{TrapFrame, KEYBOARD_VECTOR, SYSCALL_VECTOR};
use crate::arch::pic;
use crate::arch::smp::TIMER_VECTOR;
use crate::memory::types::VirtAddr;
use crate::syscall;
use crate::task::tcb;
use crate::utils::timer;

/// Exception mnemonics, indexed by vector.
const EXCEPTION_NAMES: [&str; 20] = [
    "divide error",
    "debug",
    "nmi",
    "breakpoint",
    "overflow",
    "bound range",
    "invalid opcode",
    "device not available",
    "double fault",
    "coprocessor overrun",
    "invalid tss",
    "segment not present",
    "stack fault",
    "general protection",
    "page fault",
    "reserved",
    "x87 floating point",
    "alignment check",
    "machine check",
    "simd floating point",
];

#[unsafe(no_mangle)]
pub extern "C" fn trap_dispatch(frame: &mut TrapFrame) {
    match frame.vector as u8 {
        TIMER_VECTOR => {
            // EOI before the tick: the tick path may context switch and
            // not return here for a while.
            pic::eoi_timer();
            timer::on_timer_interrupt();
        }
        KEYBOARD_VECTOR => {
            let scancode = unsafe { x86::io::inb(0x60) };
            pic::eoi_keyboard();
            crate::console::keyboard::on_scancode(scancode);
        }
        SYSCALL_VECTOR => syscall::dispatch(frame),
        14 => page_fault(frame),
        v if (v as usize) < EXCEPTION_NAMES.len() => exception(frame, v as u32),
        v => panic!("trap on unwired vector {}", v),
    }
}

fn page_fault(frame: &mut TrapFrame) {
    let cr2 = unsafe { x86::controlregs::cr2() } as u32;
    let me = tcb::current();

    // Zero-fill materialisation comes first; the reservation was paid
    // when the region was created, so this path cannot fail for memory.
    if let Some(task) = me.task() {
        if task
            .vm()
            .is_page_zfod(VirtAddr::new(cr2), frame.error_code)
        {
            return;
        }
    }

    if !frame.from_user() {
        panic!(
            "kernel page fault at {:#x}, eip {:#x}, error {:#x}",
            cr2, frame.eip, frame.error_code
        );
    }

    if swexn::try_deliver(frame, 14, cr2) {
        return;
    }
    kill_faulting_thread(frame, 14, cr2);
}

fn exception(frame: &mut TrapFrame, vector: u32) {
    if !frame.from_user() {
        panic!(
            "kernel {} at eip {:#x}, error {:#x}",
            EXCEPTION_NAMES[vector as usize], frame.eip, frame.error_code
        );
    }
    if swexn::try_deliver(frame, vector, 0) {
        return;
    }
    kill_faulting_thread(frame, vector, 0);
}

fn kill_faulting_thread(frame: &TrapFrame, vector: u32, cr2: u32) -> ! {
    let me = tcb::current();
    log::warn!(
        "thread {} killed: {} at eip {:#x} (cr2 {:#x}, error {:#x})",
        me.tid(),
        EXCEPTION_NAMES[vector as usize],
        frame.eip,
        cr2,
        frame.error_code
    );
    syscall::handlers::vanish_current(true)
}
