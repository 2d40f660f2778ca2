/*
 * Process Control Block
 *
 * One PCB per task. The pid is the tid of the founding thread. The PCB
 * carries the task's address space, the live-thread count, the exit status,
 * and the wait state the manager uses to pair wait calls with vanished
 * children.
 *
 * Worker CPUs touch the thread count and exit status (atomics); the wait
 * state belongs to the manager's life-cycle protocol and is only reached
 * from there, under its spinlock.
 */

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crate::bus::Message;
use crate::memory::vm::AddressSpace;
use crate::sync::SpinLock;

/// Task identifier. Equal to the founding thread's tid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task({})", self.0)
    }
}

/// An exit status in flight from a vanished child to its parent.
#[derive(Debug, Clone, Copy)]
pub struct ExitStatus {
    pub pid: Pid,
    pub status: i32,
}

/// Wait bookkeeping, owned by the manager.
pub struct WaitState {
    /// Children still alive (forked and not yet vanished).
    pub alive_children: u32,
    /// Exit statuses of vanished children, oldest first.
    pub zombies: VecDeque<ExitStatus>,
    /// Parked WAIT messages from threads of this task, oldest first.
    pub waiters: VecDeque<*mut Message>,
}

impl WaitState {
    fn new() -> Self {
        Self {
            alive_children: 0,
            zombies: VecDeque::new(),
            waiters: VecDeque::new(),
        }
    }
}

/// Process Control Block.
pub struct Pcb {
    pid: Pid,
    /// Parent pid; rewritten to init's pid when the parent vanishes first.
    parent: AtomicU32,
    vm: Box<AddressSpace>,
    /// Live threads in this task.
    threads: AtomicU32,
    /// Status from the last set_status call, delivered on task exit.
    exit_status: AtomicI32,
    pub wait: SpinLock<WaitState>,
}

// SAFETY: shared fields are atomics or behind locks.
unsafe impl Send for Pcb {}
unsafe impl Sync for Pcb {}

/// Shared handle to a PCB.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PcbRef(NonNull<Pcb>);

// SAFETY: see Pcb.
unsafe impl Send for PcbRef {}
unsafe impl Sync for PcbRef {}

impl core::ops::Deref for PcbRef {
    type Target = Pcb;
    fn deref(&self) -> &Pcb {
        // SAFETY: the manager frees a PCB only after the last thread's
        // VANISH completed, at which point no live path holds the ref.
        unsafe { self.0.as_ref() }
    }
}

impl PcbRef {
    pub fn as_ptr(&self) -> *mut Pcb {
        self.0.as_ptr()
    }

    /// # Safety
    /// `ptr` must point at a live PCB.
    pub unsafe fn from_ptr(ptr: *mut Pcb) -> Self {
        Self(NonNull::new(ptr).expect("null PCB pointer"))
    }
}

impl Pcb {
    /// Create a task around an address space. The founding thread's tid
    /// becomes the pid and the thread count starts at one.
    pub fn create(pid: Pid, parent: Pid, vm: Box<AddressSpace>) -> PcbRef {
        let pcb = Box::new(Pcb {
            pid,
            parent: AtomicU32::new(parent.0),
            vm,
            threads: AtomicU32::new(1),
            exit_status: AtomicI32::new(0),
            wait: SpinLock::new(WaitState::new()),
        });
        unsafe { PcbRef::from_ptr(Box::into_raw(pcb)) }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn parent(&self) -> Pid {
        Pid(self.parent.load(Ordering::Acquire))
    }

    pub fn set_parent(&self, pid: Pid) {
        self.parent.store(pid.0, Ordering::Release);
    }

    pub fn vm(&self) -> &AddressSpace {
        &self.vm
    }

    pub fn thread_count(&self) -> u32 {
        self.threads.load(Ordering::Acquire)
    }

    pub fn thread_started(&self) {
        self.threads.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one live thread; true when this was the last one.
    pub fn thread_ended(&self) -> bool {
        self.threads.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn exit_status(&self) -> i32 {
        self.exit_status.load(Ordering::Acquire)
    }

    pub fn set_exit_status(&self, status: i32) {
        self.exit_status.store(status, Ordering::Release);
    }

    /// Release the PCB storage. Manager-only, after the task left the pid
    /// table and its last thread reported VANISH.
    ///
    /// # Safety
    /// No other reference to this PCB may remain.
    pub unsafe fn release(this: PcbRef) {
        drop(unsafe { Box::from_raw(this.as_ptr()) });
    }
}
