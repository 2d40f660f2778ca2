/*
 * FIFO Mutex
 *
 * Sleeping lock for syscall-context code. Contended acquirers are queued in
 * arrival order and blocked through the scheduler, so a long hold never
 * burns a CPU the way a spinlock would. Waiters are woken one at a time on
 * unlock, and the lock is handed directly to the woken thread, so a late
 * arrival cannot barge past a queued waiter.
 *
 * Must not be taken by the manager CPU's dispatch loop or by an interrupt
 * handler; both have no thread to block. The idle thread may never block
 * either, which the scheduler enforces.
 */

use alloc::collections::VecDeque;

use super::spinlock::SpinLock;
use crate::sched::{self, SwitchOp};
use crate::task::tcb::{self, TcbRef, Tid};

struct MutexInner {
    /// Thread currently holding the lock.
    holder: Option<Tid>,
    /// Threads queued behind the holder, FIFO.
    waiters: VecDeque<TcbRef>,
    destroyed: bool,
}

pub struct Mutex {
    inner: SpinLock<MutexInner>,
}

impl Mutex {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(MutexInner {
                holder: None,
                waiters: VecDeque::new(),
                destroyed: false,
            }),
        }
    }

    /// Acquire the lock, blocking the calling thread if it is held.
    pub fn lock(&self) {
        let me = tcb::current();
        {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                panic!("mutex used after destroy");
            }
            match inner.holder {
                None => {
                    inner.holder = Some(me.tid());
                    return;
                }
                Some(tid) if tid == me.tid() => {
                    panic!("thread {} re-locking a mutex it holds", tid.0);
                }
                Some(_) => {
                    inner.waiters.push_back(me);
                }
            }
        }
        // The unlocker may run on another CPU between the guard drop above
        // and this block; the scheduler absorbs that with MADE_RUNNABLE.
        sched::context_switch(SwitchOp::Block);
    }

    /// Acquire the lock only if it is free. Never blocks.
    pub fn try_lock(&self) -> bool {
        let me = tcb::current();
        let mut inner = self.inner.lock();
        if inner.destroyed {
            panic!("mutex used after destroy");
        }
        if inner.holder.is_none() {
            inner.holder = Some(me.tid());
            true
        } else {
            false
        }
    }

    /// Release the lock, waking the oldest waiter if any.
    pub fn unlock(&self) {
        let next = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                panic!("mutex used after destroy");
            }
            match inner.waiters.pop_front() {
                Some(waiter) => {
                    inner.holder = Some(waiter.tid());
                    Some(waiter)
                }
                None => {
                    inner.holder = None;
                    None
                }
            }
        };
        if let Some(waiter) = next {
            sched::context_switch(SwitchOp::MakeRunnable(waiter));
        }
    }

    /// Run `f` with the lock held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let r = f();
        self.unlock();
        r
    }

    /// Retire the mutex. A destroyed mutex with an outstanding holder or
    /// queued waiters is an invariant violation.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.holder.is_some() || !inner.waiters.is_empty() {
            panic!("mutex destroyed while in use");
        }
        inner.destroyed = true;
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}
