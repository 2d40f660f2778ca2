/*
 * PIC and PIT Setup
 *
 * The legacy interrupt controller pair, remapped above the exception
 * range, and the programmable interval timer driving the manager CPU's
 * 100 Hz tick. Worker CPUs tick on their local APIC timers; only the
 * manager talks to the PIC.
 */

use pic8259::ChainedPics;
use spin::Mutex;
use x86::io::outb;

use crate::arch::smp::{self, TIMER_VECTOR};
use crate::utils::timer::TIMER_HZ;

const PIC_1_OFFSET: u8 = 0x20;
const PIC_2_OFFSET: u8 = 0x28;

static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

/// Remap the PICs, unmask timer and keyboard, and program the PIT.
pub fn init() {
    unsafe {
        let mut pics = PICS.lock();
        pics.initialize();
        // IRQ0 (timer) and IRQ1 (keyboard) only.
        pics.write_masks(0xfc, 0xff);
    }

    // PIT channel 0, rate generator, 100 Hz.
    let divisor: u16 = (1_193_182u32 / TIMER_HZ) as u16;
    unsafe {
        outb(0x43, 0x36);
        outb(0x40, (divisor & 0xff) as u8);
        outb(0x40, (divisor >> 8) as u8);
    }
    log::info!("PIC remapped, PIT programmed for {} Hz", TIMER_HZ);
}

/// Acknowledge a timer interrupt on the issuing CPU.
pub fn eoi_timer() {
    if smp::cpu_id().is_manager() {
        unsafe {
            PICS.lock().notify_end_of_interrupt(TIMER_VECTOR);
        }
    } else {
        smp::lapic_eoi();
    }
}

/// Acknowledge a keyboard interrupt. Keyboard routing is manager-only.
pub fn eoi_keyboard() {
    unsafe {
        PICS.lock()
            .notify_end_of_interrupt(crate::arch::idt::KEYBOARD_VECTOR);
    }
}
