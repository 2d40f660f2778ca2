/*
 * Scheduler Tests
 *
 * Exercises the block/wake race, yield-to, and the sleep queue with real
 * kernel threads on the test CPU.
 */

use core::sync::atomic::{AtomicU32, Ordering};

use crate::sched::{self, SwitchOp};
use crate::task::tcb;
use crate::task::table;
use crate::tests::{exit_kthread, spawn_kthread};
use crate::utils::timer;

static RACE_STAGE: AtomicU32 = AtomicU32::new(0);

extern "C" fn descheduler_body(_arg: usize) -> ! {
    let me = tcb::current();
    // Stage 1: flag up, anyone may wake us from here on.
    me.set_descheduled(true);
    RACE_STAGE.store(1, Ordering::Release);
    // The waker may fire before this block; the MADE_RUNNABLE transient
    // absorbs that ordering.
    sched::context_switch(SwitchOp::Block);
    me.set_descheduled(false);
    RACE_STAGE.store(2, Ordering::Release);
    exit_kthread()
}

/// Test the deschedule/make_runnable race: the waker runs as soon as the
/// target is committed to blocking, whichever side reaches the scheduler
/// first the target must come back.
pub fn test_deschedule_make_runnable_race() -> bool {
    log::info!("TEST: deschedule vs make_runnable race");

    RACE_STAGE.store(0, Ordering::Release);
    let target = spawn_kthread(descheduler_body, 0);

    // Let it reach the flag.
    while RACE_STAGE.load(Ordering::Acquire) < 1 {
        sched::context_switch(SwitchOp::Yield(-1));
    }

    if !target.take_descheduled() {
        log::error!("  FAIL: target not descheduled after stage 1");
        return false;
    }
    sched::context_switch(SwitchOp::MakeRunnable(target));

    let mut spins = 0u32;
    while RACE_STAGE.load(Ordering::Acquire) < 2 {
        sched::context_switch(SwitchOp::Yield(-1));
        spins += 1;
        if spins > 1_000_000 {
            log::error!("  FAIL: target never came back");
            return false;
        }
    }
    log::info!("  PASS: target blocked and returned exactly once");
    true
}

static YIELD_MARK: AtomicU32 = AtomicU32::new(0);

extern "C" fn yield_target_body(_arg: usize) -> ! {
    YIELD_MARK.store(1, Ordering::Release);
    exit_kthread()
}

/// Test yield-to: the named thread is pulled out of the queue and runs
/// before the yielder resumes.
pub fn test_yield_to_named_thread() -> bool {
    log::info!("TEST: yield to a named thread");

    YIELD_MARK.store(0, Ordering::Release);
    let target = spawn_kthread(yield_target_body, 0);
    let r = sched::context_switch(SwitchOp::Yield(target.tid().0 as i32));

    if r != 0 {
        log::error!("  FAIL: yield-to returned {}", r);
        return false;
    }
    if YIELD_MARK.load(Ordering::Acquire) != 1 {
        log::error!("  FAIL: target had not run when the yielder resumed");
        return false;
    }
    log::info!("  PASS: target ran first, yield returned 0");
    true
}

/// Test that yield to a vanished tid reports the thread as gone.
pub fn test_yield_to_missing_thread() -> bool {
    log::info!("TEST: yield to a missing tid");

    let bogus = 0x7fff_fff0;
    let absent = table::thread_lookup(crate::task::Tid(bogus)).is_none();
    let r = sched::context_switch(SwitchOp::Yield(bogus as i32));

    if absent && r == crate::syscall::numbers::ETHREAD {
        log::info!("  PASS: missing thread rejected");
        true
    } else {
        log::error!("  FAIL: expected ETHREAD, got {}", r);
        false
    }
}

/// Test the WAKEUP transient: a resume that lands before the target
/// blocks must be absorbed by the following block instead of stranding
/// the thread.
pub fn test_resume_before_block_absorbed() -> bool {
    log::info!("TEST: resume arriving before the block");

    let me = tcb::current();
    // Resume a thread that has not blocked yet: ourselves. The op leaves
    // the WAKEUP transient and does not switch.
    sched::context_switch(SwitchOp::Resume(me));
    // This block must consume the transient and return immediately.
    sched::context_switch(SwitchOp::Block);

    if me.state() == crate::task::SchedState::Normal {
        log::info!("  PASS: block absorbed the pending wakeup");
        true
    } else {
        log::error!("  FAIL: state {:?} after absorbed block", me.state());
        false
    }
}

static REAP_MARK: AtomicU32 = AtomicU32::new(0);

extern "C" fn short_lived_body(_arg: usize) -> ! {
    REAP_MARK.store(1, Ordering::Release);
    exit_kthread()
}

/// Test the zombie reaper: an exited thread's carcass is collected by
/// later context switches.
pub fn test_zombie_reaped() -> bool {
    log::info!("TEST: zombie collection");

    REAP_MARK.store(0, Ordering::Release);
    let before = crate::task::zombie::pending();
    spawn_kthread(short_lived_body, 0);

    let mut spins = 0u32;
    loop {
        sched::context_switch(SwitchOp::Yield(-1));
        if REAP_MARK.load(Ordering::Acquire) == 1 && crate::task::zombie::pending() <= before {
            log::info!("  PASS: zombie freed after {} switches", spins + 1);
            return true;
        }
        spins += 1;
        if spins > 1_000_000 {
            log::error!(
                "  FAIL: {} zombies still pending",
                crate::task::zombie::pending()
            );
            return false;
        }
    }
}

/// Test sleep: the thread resumes no earlier than its wakeup tick.
pub fn test_sleep_until_tick() -> bool {
    log::info!("TEST: sleep until a wakeup tick");

    let start = timer::get_ticks();
    sched::sleep::sleep_until(start + 3);
    let now = timer::get_ticks();

    if now >= start + 3 {
        log::info!("  PASS: slept {} ticks", now - start);
        true
    } else {
        log::error!("  FAIL: woke early at tick {} (slept from {})", now, start);
        false
    }
}

pub fn run() -> (u32, u32) {
    let mut passed = 0;
    let mut failed = 0;
    for result in [
        test_deschedule_make_runnable_race(),
        test_yield_to_named_thread(),
        test_yield_to_missing_thread(),
        test_resume_before_block_absorbed(),
        test_zombie_reaped(),
        test_sleep_until_tick(),
    ] {
        if result {
            passed += 1;
        } else {
            failed += 1;
        }
    }
    (passed, failed)
}
