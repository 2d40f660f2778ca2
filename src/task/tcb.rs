/*
 * Thread Control Block
 *
 * One TCB per kernel thread. The TCB owns the thread's kernel stack, its
 * saved register context, the scheduling-state word used to resolve the
 * block/wake race, the syscall result slot, and the one message the thread
 * is allowed to send to the manager.
 *
 * Kernel stacks are power-of-two sized and aligned on their size, so the
 * running thread's TCB is recoverable from the stack pointer alone: shift
 * the stack pointer right and index a table. That lookup is `current()`,
 * and the invariant behind it is that a thread only ever executes on its
 * own kernel stack.
 */

use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicI32, Ordering};

use crate::bus::Message;
use crate::memory::heap;
use crate::memory::types::PhysAddr;
use crate::sched::context::Context;
use crate::sync::atomic::IdCounter;
use crate::task::pcb::{Pcb, PcbRef};
use crate::traps::swexn::SwexnHandler;

/// Thread identifier, globally unique and monotonically issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tid(pub u32);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Thread({})", self.0)
    }
}

/// Kernel stack size. Must stay a power of two: stack addressing depends
/// on it.
pub const KERNEL_STACK_SIZE: u32 = 8192;

const STACK_SHIFT: u32 = KERNEL_STACK_SIZE.trailing_zeros();

/// One slot per possible stack position in the kernel direct map.
const STACK_SLOTS: usize = (crate::memory::USER_MEM_START >> STACK_SHIFT) as usize;

/// Scheduling state, including the two transient values that guard the
/// block/wake race between CPUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SchedState {
    Normal = 0,
    Blocked = 1,
    /// make_runnable saw the target still NORMAL; the target's in-flight
    /// BLOCK must not go through.
    MadeRunnable = 2,
    /// Same, set by the resume path (sleep wakeup).
    Wakeup = 3,
}

impl SchedState {
    fn from_u32(v: u32) -> Self {
        match v {
            0 => SchedState::Normal,
            1 => SchedState::Blocked,
            2 => SchedState::MadeRunnable,
            3 => SchedState::Wakeup,
            _ => panic!("corrupt scheduling state {}", v),
        }
    }
}

/// Thread Control Block.
pub struct Tcb {
    tid: Tid,
    /// Owning task. Null for idle threads and for a vanished thread whose
    /// task has been released.
    task: AtomicPtr<Pcb>,
    /// Cached page-directory root, kept in sync with the task. The context
    /// switcher reads this instead of chasing the task pointer so that
    /// taskless threads stay switchable.
    root: AtomicU32,
    /// Lowest address of the kernel stack.
    stack_base: u32,
    /// Saved register context. Only touched by the owning CPU's scheduler
    /// with the run-queue lock held.
    pub context: UnsafeCell<Context>,
    state: AtomicU32,
    /// Syscall return value, written by the context switcher before the
    /// thread resumes.
    result: AtomicI32,
    /// Set while the thread is blocked via deschedule; make_runnable only
    /// targets threads with this set.
    descheduled: AtomicBool,
    /// Registered software exception handler, if any. Owner-thread access
    /// only.
    pub swexn: UnsafeCell<Option<SwexnHandler>>,
    /// The thread's pre-allocated manager message.
    msg: *mut Message,
    /// CPU this thread runs on. Fixed at creation apart from fork
    /// placement.
    cpu: AtomicU32,
}

// SAFETY: cross-CPU access is limited to the atomic fields and to
// fields guarded by the scheduler and bus protocols.
unsafe impl Send for Tcb {}
unsafe impl Sync for Tcb {}

/// Shared handle to a TCB.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TcbRef(NonNull<Tcb>);

// SAFETY: see Tcb.
unsafe impl Send for TcbRef {}
unsafe impl Sync for TcbRef {}

impl core::ops::Deref for TcbRef {
    type Target = Tcb;
    fn deref(&self) -> &Tcb {
        // SAFETY: TCBs are freed only by the zombie reaper, which runs
        // after every path holding a reference has let go.
        unsafe { self.0.as_ref() }
    }
}

impl TcbRef {
    pub fn as_ptr(&self) -> *mut Tcb {
        self.0.as_ptr()
    }

    /// # Safety
    /// `ptr` must point at a live TCB.
    pub unsafe fn from_ptr(ptr: *mut Tcb) -> Self {
        Self(NonNull::new(ptr).expect("null TCB pointer"))
    }
}

static TID_COUNTER: IdCounter = IdCounter::new(1);

/// Stack-pointer to TCB table. Indexed by stack address right-shifted by
/// the stack-size exponent.
static STACK_TCBS: [AtomicPtr<Tcb>; STACK_SLOTS] =
    [const { AtomicPtr::new(core::ptr::null_mut()) }; STACK_SLOTS];

impl Tcb {
    /// Allocate a TCB, its kernel stack and its manager message.
    ///
    /// The new thread starts in state NORMAL with an empty context; the
    /// scheduler or the fork path fills the context in before it first
    /// runs.
    pub fn create(task: Option<PcbRef>, cpu: u32) -> Result<TcbRef, &'static str> {
        let stack = heap::try_alloc_aligned(KERNEL_STACK_SIZE as usize, KERNEL_STACK_SIZE as usize)
            .ok_or("out of kernel memory allocating thread stack")?;
        let stack_base = stack.as_ptr() as u32;

        let tid = Tid(TID_COUNTER.next());
        let msg = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(Message::new(tid, cpu)));

        let root = match task {
            Some(p) => p.vm().root().as_u32(),
            None => crate::memory::vm::boot_root().as_u32(),
        };
        let tcb = alloc::boxed::Box::new(Tcb {
            tid,
            task: AtomicPtr::new(task.map_or(core::ptr::null_mut(), |p| p.as_ptr())),
            root: AtomicU32::new(root),
            stack_base,
            context: UnsafeCell::new(Context::empty()),
            state: AtomicU32::new(SchedState::Normal as u32),
            result: AtomicI32::new(0),
            descheduled: AtomicBool::new(false),
            swexn: UnsafeCell::new(None),
            msg,
            cpu: AtomicU32::new(cpu),
        });
        let tcb_ptr = alloc::boxed::Box::into_raw(tcb);
        unsafe { (*msg).set_owner(tcb_ptr) };

        STACK_TCBS[(stack_base >> STACK_SHIFT) as usize].store(tcb_ptr, Ordering::Release);
        Ok(unsafe { TcbRef::from_ptr(tcb_ptr) })
    }

    /// Adopt an existing, properly aligned stack as a thread. Used for the
    /// per-CPU boot stacks that become the idle threads and the manager's
    /// dispatch context.
    pub fn create_bootstrap(stack_base: u32, cpu: u32) -> Result<TcbRef, &'static str> {
        assert_eq!(
            stack_base & (KERNEL_STACK_SIZE - 1),
            0,
            "boot stack not aligned to its size"
        );
        let tid = Tid(TID_COUNTER.next());
        let msg = alloc::boxed::Box::into_raw(alloc::boxed::Box::new(Message::new(tid, cpu)));
        let tcb = alloc::boxed::Box::new(Tcb {
            tid,
            task: AtomicPtr::new(core::ptr::null_mut()),
            root: AtomicU32::new(crate::memory::vm::boot_root().as_u32()),
            stack_base,
            context: UnsafeCell::new(Context::empty()),
            state: AtomicU32::new(SchedState::Normal as u32),
            result: AtomicI32::new(0),
            descheduled: AtomicBool::new(false),
            swexn: UnsafeCell::new(None),
            msg,
            cpu: AtomicU32::new(cpu),
        });
        let tcb_ptr = alloc::boxed::Box::into_raw(tcb);
        unsafe { (*msg).set_owner(tcb_ptr) };

        STACK_TCBS[(stack_base >> STACK_SHIFT) as usize].store(tcb_ptr, Ordering::Release);
        Ok(unsafe { TcbRef::from_ptr(tcb_ptr) })
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn cpu(&self) -> u32 {
        self.cpu.load(Ordering::Relaxed)
    }

    pub fn set_cpu(&self, cpu: u32) {
        self.cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn state(&self) -> SchedState {
        SchedState::from_u32(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, s: SchedState) {
        self.state.store(s as u32, Ordering::Release);
    }

    /// Compare-and-set on the scheduling state; the block/wake race
    /// resolves through this.
    pub fn state_cas(&self, from: SchedState, to: SchedState) -> Result<(), SchedState> {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SchedState::from_u32)
    }

    pub fn result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }

    pub fn set_result(&self, v: i32) {
        self.result.store(v, Ordering::Release);
    }

    pub fn is_descheduled(&self) -> bool {
        self.descheduled.load(Ordering::Acquire)
    }

    pub fn set_descheduled(&self, v: bool) {
        self.descheduled.store(v, Ordering::Release);
    }

    /// Claim the deschedule flag. Exactly one concurrent waker sees true.
    pub fn take_descheduled(&self) -> bool {
        self.descheduled.swap(false, Ordering::AcqRel)
    }

    /// Owning task, if the thread still has one.
    pub fn task(&self) -> Option<PcbRef> {
        let p = self.task.load(Ordering::Acquire);
        NonNull::new(p).map(|nn| unsafe { PcbRef::from_ptr(nn.as_ptr()) })
    }

    /// Point the thread at a task and adopt its address space root.
    pub fn set_task(&self, task: Option<PcbRef>) {
        match task {
            Some(p) => {
                self.task.store(p.as_ptr(), Ordering::Release);
                self.root.store(p.vm().root().as_u32(), Ordering::Release);
            }
            None => {
                self.task.store(core::ptr::null_mut(), Ordering::Release);
                self.root
                    .store(crate::memory::vm::boot_root().as_u32(), Ordering::Release);
            }
        }
    }

    /// Page-directory root the context switcher loads for this thread.
    pub fn page_root(&self) -> PhysAddr {
        PhysAddr::new(self.root.load(Ordering::Acquire))
    }

    /// Refresh the cached root after the task's address space changed.
    pub fn reload_root(&self) {
        if let Some(task) = self.task() {
            self.root.store(task.vm().root().as_u32(), Ordering::Release);
        }
    }

    pub fn stack_base(&self) -> u32 {
        self.stack_base
    }

    /// Top of the kernel stack, the value programmed into TSS esp0.
    pub fn stack_top(&self) -> u32 {
        self.stack_base + KERNEL_STACK_SIZE
    }

    /// The thread's pre-allocated manager message.
    pub fn msg(&self) -> *mut Message {
        self.msg
    }
}

/// The running thread's TCB, recovered from the stack pointer.
///
/// # Panics
/// Panics when called on a stack that is not a registered kernel stack;
/// that means boot code reached for a thread context before threads exist.
pub fn current() -> TcbRef {
    #[cfg(target_arch = "x86")]
    let esp: u32 = {
        let esp: u32;
        unsafe {
            core::arch::asm!("mov {}, esp", out(reg) esp, options(nomem, nostack));
        }
        esp
    };
    #[cfg(not(target_arch = "x86"))]
    let esp: u32 = panic!("no current thread off target");

    let slot = (esp >> STACK_SHIFT) as usize;
    let ptr = STACK_TCBS[slot].load(Ordering::Acquire);
    if ptr.is_null() {
        panic!("no TCB registered for stack at {:#x}", esp);
    }
    unsafe { TcbRef::from_ptr(ptr) }
}

/// Register a statically allocated boot stack so `current()` resolves for
/// the manager's dispatch loop.
pub fn register_stack(stack_base: u32, tcb: TcbRef) {
    STACK_TCBS[(stack_base >> STACK_SHIFT) as usize].store(tcb.as_ptr(), Ordering::Release);
}

/// Drop the stack-table entry for a reaped thread.
pub fn unregister_stack(stack_base: u32) {
    STACK_TCBS[(stack_base >> STACK_SHIFT) as usize]
        .store(core::ptr::null_mut(), Ordering::Release);
}
