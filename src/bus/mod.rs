/*
 * Cross-CPU Message Bus
 *
 * Typed messages between worker CPUs and the manager. Per worker there is
 * one outbound queue (worker to manager) and one inbound queue (manager to
 * worker); each is a singly-linked FIFO under its own spinlock, so a pair
 * of CPUs contends on nothing but its own channel.
 *
 * Messages are never allocated at send time. Every thread carries exactly
 * one message inside its TCB, allocated at thread creation, and that is
 * the only message the thread ever sends; the reply returns the same
 * message to its owner. Queue links are intrusive.
 *
 * Ordering: per worker/manager pair, FIFO both ways. Nothing is ordered
 * across pairs and nothing is retried here; retry policy belongs to the
 * life-cycle protocol.
 */

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch::smp::{self, MAX_CPUS};
use crate::sync::SpinLock;
use crate::task::pcb::PcbRef;
use crate::task::tcb::{Tcb, TcbRef, Tid};

/// Message kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgKind {
    Fork,
    ForkResponse,
    Vanish,
    VanishBack,
    Wait,
    WaitResponse,
    SetInitPcb,
    Print,
    Readline,
    SetCursorPos,
    GetCursorPos,
    SetTermColor,
    MakeRunnable,
    Yield,
    Halt,
    Response,
}

/// Payload union. Which variant is valid follows from the kind.
#[derive(Clone, Copy)]
pub enum MsgPayload {
    None,
    /// Fork in flight: the blocked parent and the pre-built child thread.
    /// `retries` counts placement attempts by the manager.
    Fork {
        parent: TcbRef,
        child: TcbRef,
        retries: u32,
    },
    /// Plain result value, written into the owner's result slot on reply
    /// delivery.
    Result { value: i32 },
    /// Last thread of a task is gone; exit bookkeeping for the manager.
    Vanish { task: PcbRef, status: i32 },
    /// wait() from a thread of `task`.
    Wait { task: PcbRef },
    /// Reaped child delivered to a waiter. A negative pid is the error
    /// code for "nothing to wait for".
    WaitResponse { pid: i32, status: i32 },
    /// The task that adopts orphans.
    SetInitPcb { task: PcbRef },
    /// Fork child finished cloning; its new task for the pid table.
    ForkDone { task: PcbRef },
    /// Console output from a kernel-side staging buffer.
    Print { buf: *const u8, len: u32 },
    /// Console input into a kernel-side staging buffer.
    Readline { buf: *mut u8, len: u32 },
    /// Cursor position, both directions.
    Cursor { row: i32, col: i32 },
    /// Terminal color.
    Color { color: u32 },
    /// Scheduling order naming a thread on the destination CPU.
    Thread { target: TcbRef },
}

/// A bus message. One lives inside every TCB.
pub struct Message {
    /// Intrusive queue link.
    next: AtomicPtr<Message>,
    /// The thread this message belongs to and returns to.
    owner: AtomicPtr<Tcb>,
    pub kind: MsgKind,
    /// Tid of the owning thread, for manager-side routing decisions.
    pub requester: Tid,
    /// CPU the reply must be delivered to.
    pub cpu: u32,
    pub payload: MsgPayload,
}

// SAFETY: a message is only ever touched by whoever holds it: its owner
// thread while not enqueued, the queue under its spinlock, the manager
// after dequeue.
unsafe impl Send for Message {}
unsafe impl Sync for Message {}

impl Message {
    pub const fn new(requester: Tid, cpu: u32) -> Self {
        Self {
            next: AtomicPtr::new(ptr::null_mut()),
            owner: AtomicPtr::new(ptr::null_mut()),
            kind: MsgKind::Response,
            requester,
            cpu,
            payload: MsgPayload::None,
        }
    }

    pub fn set_owner(&self, owner: *mut Tcb) {
        self.owner.store(owner, Ordering::Release);
    }

    /// The owning thread. Panics on a message that was never wired to a
    /// TCB, which cannot happen past thread creation.
    pub fn owner(&self) -> TcbRef {
        let p = self.owner.load(Ordering::Acquire);
        unsafe { TcbRef::from_ptr(p) }
    }
}

/// Singly-linked FIFO of messages under a dedicated spinlock.
pub struct MsgQueue {
    inner: SpinLock<QueueInner>,
}

struct QueueInner {
    head: *mut Message,
    tail: *mut Message,
}

// SAFETY: all pointer traffic happens under the queue's lock.
unsafe impl Send for QueueInner {}

impl MsgQueue {
    pub const fn new() -> Self {
        Self {
            inner: SpinLock::new(QueueInner {
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
            }),
        }
    }

    pub fn push(&self, msg: *mut Message) {
        let mut q = self.inner.lock();
        unsafe {
            (*msg).next.store(ptr::null_mut(), Ordering::Relaxed);
        }
        if q.tail.is_null() {
            q.head = msg;
            q.tail = msg;
        } else {
            unsafe {
                (*q.tail).next.store(msg, Ordering::Relaxed);
            }
            q.tail = msg;
        }
    }

    pub fn pop(&self) -> Option<*mut Message> {
        let mut q = self.inner.lock();
        if q.head.is_null() {
            return None;
        }
        let msg = q.head;
        q.head = unsafe { (*msg).next.load(Ordering::Relaxed) };
        if q.head.is_null() {
            q.tail = ptr::null_mut();
        }
        Some(msg)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().head.is_null()
    }
}

/// Queue registry owned by the manager: per worker, an outbound and an
/// inbound queue, published by the worker during its bring-up.
static OUTBOUND: [AtomicPtr<MsgQueue>; MAX_CPUS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS];
static INBOUND: [AtomicPtr<MsgQueue>; MAX_CPUS] =
    [const { AtomicPtr::new(ptr::null_mut()) }; MAX_CPUS];

fn queue(slot: &AtomicPtr<MsgQueue>) -> Option<&'static MsgQueue> {
    let p = slot.load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { &*p })
    }
}

/// Allocate and publish this worker's queue pair. Called once per worker
/// during bring-up, before its first syscall can happen.
pub fn init_worker(cpu: usize) {
    let out: &'static MsgQueue = alloc::boxed::Box::leak(alloc::boxed::Box::new(MsgQueue::new()));
    let inb: &'static MsgQueue = alloc::boxed::Box::leak(alloc::boxed::Box::new(MsgQueue::new()));
    OUTBOUND[cpu].store(out as *const _ as *mut _, Ordering::Release);
    INBOUND[cpu].store(inb as *const _ as *mut _, Ordering::Release);
    log::info!("message queues published");
}

/// Enqueue toward the manager from this worker.
pub fn worker_send(cpu: usize, msg: *mut Message) {
    queue(&OUTBOUND[cpu])
        .expect("worker sending before queue init")
        .push(msg);
}

/// Dequeue one message the manager addressed to this worker.
pub fn worker_recv(cpu: usize) -> Option<*mut Message> {
    queue(&INBOUND[cpu])?.pop()
}

/// Manager-side: enqueue toward a worker.
pub fn manager_send(msg: *mut Message, cpu: usize) {
    queue(&INBOUND[cpu])
        .expect("manager sending to unpublished worker")
        .push(msg);
}

/// Poll position, persisted across calls so no worker starves.
static POLL_CURSOR: core::sync::atomic::AtomicUsize = core::sync::atomic::AtomicUsize::new(0);

/// Manager-side: round-robin poll across all worker outbound queues,
/// busy-looping until a message arrives.
pub fn manager_recv() -> *mut Message {
    let workers = smp::cpu_count() - 1;
    loop {
        let start = POLL_CURSOR.load(Ordering::Relaxed);
        for i in 0..workers {
            let cpu = 1 + (start + i) % workers;
            if let Some(q) = queue(&OUTBOUND[cpu]) {
                if let Some(msg) = q.pop() {
                    POLL_CURSOR.store((start + i + 1) % workers, Ordering::Relaxed);
                    return msg;
                }
            }
        }
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(tid: u32) -> *mut Message {
        alloc::boxed::Box::into_raw(alloc::boxed::Box::new(Message::new(Tid(tid), 1)))
    }

    #[test]
    fn test_fifo_order() {
        let q = MsgQueue::new();
        let (a, b, c) = (msg(1), msg(2), msg(3));
        q.push(a);
        q.push(b);
        q.push(c);
        assert_eq!(q.pop(), Some(a));
        assert_eq!(q.pop(), Some(b));
        assert_eq!(q.pop(), Some(c));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_interleaved_push_pop() {
        let q = MsgQueue::new();
        let (a, b) = (msg(1), msg(2));
        q.push(a);
        assert_eq!(q.pop(), Some(a));
        assert!(q.is_empty());
        q.push(b);
        q.push(a);
        assert_eq!(q.pop(), Some(b));
        assert_eq!(q.pop(), Some(a));
    }
}
