/*
 * Zombie List and Reaper
 *
 * A vanished thread cannot free its own kernel stack while still running
 * on it, so it parks itself here and blocks forever. Any later context
 * switch donates a moment of the resuming thread's time to free one
 * zombie.
 *
 * The reaper only ever try_locks: it runs on the context-switch path,
 * where blocking on the zombie list or on the heap would deadlock against
 * whatever the interrupted thread was holding. On contention it simply
 * walks away; the zombie is collected by a later switch.
 */

use alloc::collections::VecDeque;
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::bus::Message;
use crate::memory::heap;
use crate::sync::SpinLock;
use crate::task::tcb::{self, SchedState, Tcb, TcbRef, KERNEL_STACK_SIZE};

static ZOMBIES: SpinLock<VecDeque<TcbRef>> = SpinLock::new(VecDeque::new());

/// Park a vanished thread for collection.
///
/// Called in the vanishing thread's last syscall context, before its final
/// block. The thread must already be off the thread table.
pub fn add(tcb: TcbRef) {
    ZOMBIES.lock().push_back(tcb);
}

/// Try to collect one zombie. Called after every context switch that
/// actually switched.
pub fn try_reap() {
    let Some(mut zombies) = ZOMBIES.try_lock() else {
        return;
    };
    let Some(mut heap_guard) = heap::try_lock_heap() else {
        return;
    };

    let Some(z) = zombies.pop_front() else {
        return;
    };

    // A zombie still on its way down is not collectable yet: it may be the
    // thread running this very reaper, or it may not have finished its
    // final switch. Requeue and let a later switch try again. The deque
    // just popped, so this push cannot allocate.
    let me = tcb::current();
    if z == me || z.state() != SchedState::Blocked {
        zombies.push_back(z);
        return;
    }

    tcb::unregister_stack(z.stack_base());

    // SAFETY: the zombie is blocked for good and unreachable from every
    // table; these are the allocations its create() made.
    unsafe {
        let stack_layout =
            Layout::from_size_align(KERNEL_STACK_SIZE as usize, KERNEL_STACK_SIZE as usize)
                .expect("bad stack layout");
        heap_guard.deallocate(
            NonNull::new(z.stack_base() as *mut u8).expect("zombie without stack"),
            stack_layout,
        );
        heap_guard.deallocate(
            NonNull::new(z.msg() as *mut u8).expect("zombie without message"),
            Layout::new::<Message>(),
        );
        heap_guard.deallocate(
            NonNull::new(z.as_ptr() as *mut u8).expect("null zombie"),
            Layout::new::<Tcb>(),
        );
    }
}

/// Zombies currently awaiting collection, for diagnostics and tests.
pub fn pending() -> usize {
    ZOMBIES.lock().len()
}
