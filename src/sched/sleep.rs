/*
 * Sleep Queue
 *
 * Per-CPU priority queue of sleeping threads ordered by absolute wakeup
 * tick. The timer interrupt drains the due entries and resumes them; a
 * sleeping thread always wakes on the CPU it slept on.
 */

use alloc::collections::BinaryHeap;
use core::cmp::Ordering as CmpOrdering;

use lazy_static::lazy_static;

use crate::arch::percpu::CachePadded;
use crate::arch::smp::{self, MAX_CPUS};
use crate::sched::{self, SwitchOp};
use crate::sync::SpinLock;
use crate::task::tcb::{self, TcbRef};

struct Sleeper {
    wake_tick: u32,
    tcb: TcbRef,
}

// BinaryHeap is a max-heap; invert the comparison so the earliest wakeup
// sits on top.
impl Ord for Sleeper {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.wake_tick.cmp(&self.wake_tick)
    }
}

impl PartialOrd for Sleeper {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Sleeper {
    fn eq(&self, other: &Self) -> bool {
        self.wake_tick == other.wake_tick
    }
}

impl Eq for Sleeper {}

lazy_static! {
    static ref SLEEP_QUEUES: [CachePadded<SpinLock<BinaryHeap<Sleeper>>>; MAX_CPUS] =
        core::array::from_fn(|_| CachePadded::new(SpinLock::new(BinaryHeap::new())));
}

/// Park the calling thread until the global tick count reaches
/// `wake_tick`.
pub fn sleep_until(wake_tick: u32) {
    let me = tcb::current();
    let cpu = smp::cpu_id().0 as usize;
    SLEEP_QUEUES[cpu].get().lock().push(Sleeper {
        wake_tick,
        tcb: me,
    });
    sched::context_switch(SwitchOp::Block);
}

/// Resume every sleeper whose wakeup tick has arrived. Runs in the timer
/// interrupt on the sleeper's own CPU.
///
/// Entries are popped before the resume, so a nested tick arriving while
/// a resumed thread runs cannot wake the same sleeper twice.
pub fn wake_due(now: u32) {
    let cpu = smp::cpu_id().0 as usize;
    loop {
        let due = {
            let mut q = SLEEP_QUEUES[cpu].get().lock();
            match q.peek() {
                Some(s) if s.wake_tick <= now => q.pop(),
                _ => None,
            }
        };
        match due {
            Some(s) => {
                sched::context_switch(SwitchOp::Resume(s.tcb));
            }
            None => break,
        }
    }
}

/// Sleepers currently parked on this CPU, for diagnostics and tests.
pub fn pending() -> usize {
    let cpu = smp::cpu_id().0 as usize;
    SLEEP_QUEUES[cpu].get().lock().len()
}
