/*
 * System Timer and Tick Management
 *
 * This module tracks the global tick count driven by the 100 Hz timer
 * interrupt and feeds per-CPU scheduler ticks. The global count advances on
 * the manager CPU only, so `get_ticks` has a single authoritative source;
 * worker CPUs receive their own timer interrupts for preemption but do not
 * touch the global counter.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::smp;
use crate::sched;

/// Timer interrupt frequency programmed into the PIT.
pub const TIMER_HZ: u32 = 100;

/// Global tick counter, advanced by the manager CPU.
static TICKS: AtomicU32 = AtomicU32::new(0);

/// Called from the timer interrupt handler on every CPU, once per interrupt.
///
/// On the manager this advances the global tick count. On workers it wakes
/// any due sleepers and hands control to the scheduler for the round-robin
/// preemption decision.
pub fn on_timer_interrupt() {
    if smp::cpu_id().is_manager() {
        TICKS.fetch_add(1, Ordering::Relaxed);
        return;
    }

    sched::sleep::wake_due(get_ticks());
    sched::preempt_tick();
}

/// Current tick count since boot.
pub fn get_ticks() -> u32 {
    TICKS.load(Ordering::Relaxed)
}
