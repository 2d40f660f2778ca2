/*
 * In-Kernel Test Suite
 *
 * Scenario tests that need a live kernel: real threads, the bus, the
 * manager, the frame allocator. Enabled with the `ktest` feature and run
 * from a dedicated kernel thread on the first worker, alongside the init
 * task.
 *
 * Pure-logic unit tests live in #[cfg(test)] modules next to the code
 * they cover.
 */

pub mod lifecycle_tests;
pub mod sched_tests;
pub mod vm_tests;

use crate::arch::smp;
use crate::sched::{self, SwitchOp};
use crate::task::tcb::{self, Tcb, TcbRef};
use crate::task::{table, zombie};

/// Create a taskless kernel thread on the calling CPU and queue it.
pub fn spawn_kthread(entry: extern "C" fn(usize) -> !, arg: usize) -> TcbRef {
    let tcb = Tcb::create(None, smp::cpu_id().0).expect("cannot allocate test thread");
    unsafe {
        *tcb.context.get() = sched::context::prepare_initial(tcb.stack_top(), entry, arg);
    }
    table::thread_insert(tcb);
    sched::enqueue_boot(tcb);
    tcb
}

/// Retire a kernel test thread through the zombie path.
pub fn exit_kthread() -> ! {
    let me = tcb::current();
    table::thread_remove(me.tid());
    zombie::add(me);
    sched::context_switch(SwitchOp::Block);
    unreachable!("exited test thread rescheduled")
}

extern "C" fn ktest_main(_arg: usize) -> ! {
    log::info!("==== kernel self-tests ====");

    let mut passed = 0;
    let mut failed = 0;
    for (name, (p, f)) in [
        ("vm", vm_tests::run()),
        ("sched", sched_tests::run()),
        ("lifecycle", lifecycle_tests::run()),
    ] {
        log::info!("{}: {} passed, {} failed", name, p, f);
        passed += p;
        failed += f;
    }

    if failed == 0 {
        log::info!("==== all {} kernel self-tests passed ====", passed);
    } else {
        log::error!("==== {} kernel self-tests FAILED ====", failed);
    }
    exit_kthread()
}

/// Queue the test driver thread. Called from worker bring-up when the
/// ktest feature is on.
pub fn spawn_test_threads() {
    spawn_kthread(ktest_main, 0);
}
