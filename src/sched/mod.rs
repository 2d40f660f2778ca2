/*
 * Per-CPU Scheduler
 *
 * Strict-FIFO round-robin per CPU, preempted by the timer tick. All
 * suspension and wake-up funnels through `context_switch`, a single entry
 * point that takes the CPU's run-queue spinlock, applies one scheduling
 * operation, and either returns without switching or swaps register state
 * to the chosen successor.
 *
 * The run-queue lock is held across the register swap and released on the
 * successor's stack, in `finish_switch`. Every resume path runs it: the
 * return from `context_switch_asm`, the first-run bootstrap, and the fork
 * child's capture return.
 *
 * Threads never migrate between CPUs; cross-CPU work arrives only as
 * messages, which the pick function drains one at a time and converts
 * into scheduling effects.
 */

pub mod context;
pub mod sleep;

use alloc::collections::VecDeque;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::arch::percpu::CachePadded;
use crate::arch::{gdt, interrupts, smp};
use crate::bus::{self, MsgKind, MsgPayload};
use crate::memory::paging;
use crate::syscall::numbers::{EMORETHR, ETHREAD};
use crate::task::tcb::{self, SchedState, Tcb, TcbRef};
use crate::task::{table, zombie};
use crate::sync::SpinLock;

/// One scheduling operation. The caller may be suspended inside
/// `context_switch` and resumed later, on the same CPU, with the
/// operation's result in its result slot.
#[derive(Clone, Copy)]
pub enum SwitchOp {
    /// Timer preemption: requeue self, run the head of the queue.
    Tick,
    /// yield(tid). -1 behaves like Tick with result 0; a concrete tid is
    /// pulled out of the run queue wherever it sits.
    Yield(i32),
    /// Suspend until made runnable. Absorbs a concurrent wake through the
    /// MADE_RUNNABLE/WAKEUP transients.
    Block,
    /// Push the caller's pre-allocated message outbound, then Block with
    /// no window between the two.
    SendMsg,
    /// Wake a blocked thread on this or another CPU. Never switches.
    MakeRunnable(TcbRef),
    /// Wake a blocked thread and run it now, requeueing self.
    Resume(TcbRef),
    /// Split the calling task: clone the caller into a new thread of the
    /// same task and run it now, requeueing self.
    ThreadFork,
    /// Fork: clone the caller into a new thread destined for a new task,
    /// hand it to the manager for placement, and block until the manager
    /// replies with the child's tid.
    Fork,
}

struct CpuSched {
    run_queue: VecDeque<TcbRef>,
    idle: Option<TcbRef>,
}

impl CpuSched {
    const fn new() -> Self {
        Self {
            run_queue: VecDeque::new(),
            idle: None,
        }
    }
}

const MAX_CPUS: usize = smp::MAX_CPUS;

static RUNQS: [CachePadded<SpinLock<CpuSched>>; MAX_CPUS] =
    [const { CachePadded::new(SpinLock::new(CpuSched::new())) }; MAX_CPUS];

/// Per-CPU pointer to the running thread's TCB, padded to its own cache
/// line so scheduler hot paths on different CPUs never share one.
static CUR_RUNNING: [CachePadded<AtomicPtr<Tcb>>; MAX_CPUS] =
    [const { CachePadded::new(AtomicPtr::new(core::ptr::null_mut())) }; MAX_CPUS];

/// Adopt the calling CPU's boot context as its idle thread.
///
/// The boot stack becomes the idle thread's kernel stack, so `current()`
/// resolves from here on. The idle thread is never enqueued; it is chosen
/// only when the run queue is empty, and it may never block.
pub fn init_cpu(boot_stack_base: u32) -> TcbRef {
    let cpu = smp::cpu_id().0 as usize;
    let idle = tcb::Tcb::create_bootstrap(boot_stack_base, cpu as u32)
        .expect("cannot allocate idle TCB");

    let mut sched = RUNQS[cpu].get().lock();
    sched.idle = Some(idle);
    drop(sched);
    CUR_RUNNING[cpu].get().store(idle.as_ptr(), Ordering::Release);
    log::info!("scheduler online, idle thread {}", idle.tid());
    idle
}

/// The thread currently running on `cpu`, observed cross-CPU.
pub fn running_on(cpu: usize) -> Option<TcbRef> {
    let p = CUR_RUNNING[cpu].get().load(Ordering::Acquire);
    if p.is_null() {
        None
    } else {
        Some(unsafe { TcbRef::from_ptr(p) })
    }
}

/// Release obligations of a freshly resumed thread: drop the run-queue
/// lock its dispatcher held across the swap, then give the zombie reaper
/// one try_lock attempt.
pub fn finish_switch() {
    let cpu = smp::cpu_id().0 as usize;
    unsafe { RUNQS[cpu].get().raw_unlock() };
    zombie::try_reap();
}

/// Timer-tick entry: round-robin preemption.
pub fn preempt_tick() {
    context_switch(SwitchOp::Tick);
}

/// Boot-time splice of a freshly built thread into this CPU's queue,
/// before ordinary scheduling traffic exists.
pub fn enqueue_boot(tcb: TcbRef) {
    let irq_was_enabled = interrupts::are_enabled();
    interrupts::disable();
    let cpu = smp::cpu_id().0 as usize;
    let rq = RUNQS[cpu].get();
    unsafe {
        rq.raw_lock();
        rq.raw_get().run_queue.push_back(tcb);
        rq.raw_unlock();
    }
    if irq_was_enabled {
        interrupts::enable();
    }
}

/// Apply one scheduling operation. See `SwitchOp` for the contract of
/// each. Returns the caller's result slot.
pub fn context_switch(op: SwitchOp) -> i32 {
    // Fork-family ops allocate and capture before the run-queue lock is
    // involved.
    match op {
        SwitchOp::Fork => return fork_switch(false),
        SwitchOp::ThreadFork => return fork_switch(true),
        _ => {}
    }

    let irq_was_enabled = interrupts::are_enabled();
    interrupts::disable();

    let cpu = smp::cpu_id().0 as usize;
    let me = tcb::current();

    // MAKE_RUNNABLE targets another thread's CPU and never switches; it
    // does not touch this CPU's queue at all.
    if let SwitchOp::MakeRunnable(target) = op {
        make_runnable_inner(target);
        if irq_was_enabled {
            interrupts::enable();
        }
        return 0;
    }

    let rq = RUNQS[cpu].get();
    unsafe { rq.raw_lock() };
    let sched = unsafe { rq.raw_get() };
    let idle = sched.idle.expect("scheduler not initialized");

    let next: Option<TcbRef> = match op {
        SwitchOp::Tick => {
            if me != idle {
                sched.run_queue.push_back(me);
            }
            Some(pick_next(sched, cpu))
        }
        SwitchOp::Yield(tid) if tid < 0 => {
            me.set_result(0);
            if me != idle {
                sched.run_queue.push_back(me);
            }
            Some(pick_next(sched, cpu))
        }
        SwitchOp::Yield(tid) => {
            // O(n) scan; yield-to names an arbitrary queue position.
            match sched
                .run_queue
                .iter()
                .position(|t| t.tid().0 == tid as u32)
            {
                Some(pos) => {
                    let target = sched.run_queue.remove(pos).unwrap();
                    me.set_result(0);
                    if me != idle {
                        sched.run_queue.push_back(me);
                    }
                    Some(target)
                }
                None => {
                    me.set_result(ETHREAD);
                    None
                }
            }
        }
        SwitchOp::Block | SwitchOp::SendMsg => {
            if let SwitchOp::SendMsg = op {
                // Message push and block share one critical section, so
                // the reply cannot race ahead of the blocked state.
                bus::worker_send(cpu, me.msg());
            }
            match me.state() {
                SchedState::MadeRunnable | SchedState::Wakeup => {
                    // A concurrent wake beat us here; do not block.
                    me.set_state(SchedState::Normal);
                    None
                }
                SchedState::Normal => {
                    if me == idle {
                        panic!("idle thread attempted to block");
                    }
                    me.set_state(SchedState::Blocked);
                    Some(pick_next(sched, cpu))
                }
                SchedState::Blocked => {
                    panic!("thread {} blocking while already blocked", me.tid());
                }
            }
        }
        SwitchOp::Resume(target) => match target.state() {
            SchedState::Blocked => {
                target.set_state(SchedState::Normal);
                if me != idle {
                    sched.run_queue.push_back(me);
                }
                Some(target)
            }
            SchedState::Normal => {
                // Not yet blocked; leave a wakeup for its BLOCK to absorb.
                target.set_state(SchedState::Wakeup);
                None
            }
            other => panic!("resume of thread {} in state {:?}", target.tid(), other),
        },
        SwitchOp::MakeRunnable(_) | SwitchOp::Fork | SwitchOp::ThreadFork => unreachable!(),
    };

    match next {
        None => {
            unsafe { rq.raw_unlock() };
            if irq_was_enabled {
                interrupts::enable();
            }
            me.result()
        }
        Some(next) if next == me => {
            unsafe { rq.raw_unlock() };
            if irq_was_enabled {
                interrupts::enable();
            }
            me.result()
        }
        Some(next) => {
            switch_to(cpu, me, next);
            // Back on this stack: some dispatcher picked us again.
            finish_switch();
            if irq_was_enabled {
                interrupts::enable();
            }
            me.result()
        }
    }
}

/// The register swap plus everything that must precede it. Called with
/// the run-queue lock held; the lock travels with the CPU and is released
/// by the successor in `finish_switch`.
fn switch_to(cpu: usize, me: TcbRef, next: TcbRef) {
    gdt::set_esp0(cpu, next.stack_top());
    CUR_RUNNING[cpu].get().store(next.as_ptr(), Ordering::Release);

    let next_root = next.page_root();
    if paging::current_root() != next_root {
        // New address space must be live before the successor returns to
        // user mode.
        unsafe { paging::switch_root(next_root) };
    }

    unsafe {
        context::context_switch_asm(me.context.get(), next.context.get());
    }
}

/// Choose the next runnable thread: one inbound message first, then the
/// run queue, then idle.
fn pick_next(sched: &mut CpuSched, cpu: usize) -> TcbRef {
    if let Some(t) = drain_one_message(sched, cpu) {
        return t;
    }
    if let Some(t) = sched.run_queue.pop_front() {
        return t;
    }
    sched.idle.expect("scheduler not initialized")
}

/// Convert one inbound message into a scheduling effect.
///
/// Returns a thread to run now, or None if the message had no immediate
/// dispatch (or there was no message).
fn drain_one_message(sched: &mut CpuSched, cpu: usize) -> Option<TcbRef> {
    let msg = bus::worker_recv(cpu)?;
    let m = unsafe { &mut *msg };

    match m.kind {
        MsgKind::Fork => {
            // A forked child placed on this CPU; its first dispatch runs
            // the address-space clone in its own context.
            let child = match m.payload {
                MsgPayload::Fork { child, .. } => child,
                _ => panic!("FORK message without fork payload"),
            };
            child.set_cpu(cpu as u32);
            // On a placement retry the child is parked in SEND_MSG; the
            // first placement finds it never-run and already NORMAL.
            if child.state() == SchedState::Blocked {
                child.set_state(SchedState::Normal);
            }
            Some(child)
        }
        MsgKind::ForkResponse
        | MsgKind::WaitResponse
        | MsgKind::Response
        | MsgKind::VanishBack => {
            // Reply to a blocked SEND_MSG: the message owner resumes with
            // the carried result in its slot.
            let owner = m.owner();
            match m.payload {
                MsgPayload::Result { value } => owner.set_result(value),
                MsgPayload::WaitResponse { pid, .. } => owner.set_result(pid),
                _ => owner.set_result(0),
            }
            debug_assert_eq!(owner.state(), SchedState::Blocked);
            owner.set_state(SchedState::Normal);
            Some(owner)
        }
        MsgKind::MakeRunnable => {
            // Wake order for a descheduled thread of this CPU; the caller
            // is blocked on the reply.
            let target = match m.payload {
                MsgPayload::Thread { target } => target,
                _ => panic!("MAKE_RUNNABLE message without thread payload"),
            };
            match target.state() {
                SchedState::Blocked => {
                    target.set_state(SchedState::Normal);
                    sched.run_queue.push_back(target);
                }
                SchedState::Normal => {
                    // Racing with its block; leave the transient.
                    target.set_state(SchedState::MadeRunnable);
                }
                _ => {}
            }
            m.kind = MsgKind::Response;
            m.payload = MsgPayload::Result { value: 0 };
            bus::worker_send(cpu, msg);
            None
        }
        MsgKind::Yield => {
            // Run order: dispatch the named thread of this CPU now.
            let target = match m.payload {
                MsgPayload::Thread { target } => target,
                _ => panic!("YIELD message without thread payload"),
            };
            let value = match sched.run_queue.iter().position(|t| *t == target) {
                Some(pos) => {
                    sched.run_queue.remove(pos);
                    0
                }
                None => ETHREAD,
            };
            m.kind = MsgKind::Response;
            m.payload = MsgPayload::Result { value };
            bus::worker_send(cpu, msg);
            if value == 0 { Some(target) } else { None }
        }
        MsgKind::Halt => {
            log::info!("halt order received");
            crate::arch::halt_forever();
        }
        other => panic!("worker received manager-only message kind {:?}", other),
    }
}

/// MAKE_RUNNABLE against a thread on any CPU. The target CPU's queue is
/// locked just long enough to splice.
fn make_runnable_inner(target: TcbRef) {
    let target_cpu = target.cpu() as usize;
    let rq = RUNQS[target_cpu].get();
    unsafe { rq.raw_lock() };
    let sched = unsafe { rq.raw_get() };
    match target.state() {
        SchedState::Blocked => {
            target.set_state(SchedState::Normal);
            sched.run_queue.push_back(target);
        }
        SchedState::Normal => {
            target.set_state(SchedState::MadeRunnable);
        }
        other => {
            panic!(
                "make_runnable of thread {} in state {:?}",
                target.tid(),
                other
            );
        }
    }
    unsafe { rq.raw_unlock() };
}

/// Fork and thread_fork share the stack-clone machinery; `same_task`
/// distinguishes them.
///
/// Returns in two worlds: the parent continues with the child's tid (or a
/// negative error), the child continues with 0. The caller tells which
/// world it is in by re-reading `tcb::current()` after the call.
fn fork_switch(same_task: bool) -> i32 {
    let me = tcb::current();
    let task = me.task().expect("fork from taskless thread");

    if !same_task && task.thread_count() > 1 {
        return EMORETHR;
    }

    let child = match tcb::Tcb::create(Some(task), me.cpu()) {
        Ok(c) => c,
        Err(_) => return crate::syscall::numbers::ENOMEM,
    };

    if same_task {
        task.thread_started();
    }

    let mut captured = context::Context::empty();
    unsafe { context::context_capture_asm(&mut captured) };

    // Two threads return from the capture above: the parent immediately,
    // the child when first dispatched. Only freshly computed state may be
    // read past this point; locals from before the capture carry the
    // parent's values. The child never unwinds back through the copied
    // Rust frames: pointers in them (the trap-frame reference above all)
    // still address the parent's stack, so it leaves through its own
    // trap frame instead.
    let now = tcb::current();
    if now != me {
        // Child path: the dispatcher that chose us still holds the
        // run-queue lock.
        finish_switch();
        interrupts::enable();
        crate::syscall::handlers::fork_child_entry(same_task)
    }

    unsafe { context::clone_stack_for_fork(&me, &child, &captured) };
    table::thread_insert(child);

    if same_task {
        // THREAD_FORK: enqueue self, run the child now.
        let irq_was_enabled = interrupts::are_enabled();
        interrupts::disable();
        let cpu = smp::cpu_id().0 as usize;
        let rq = RUNQS[cpu].get();
        unsafe { rq.raw_lock() };
        let sched = unsafe { rq.raw_get() };
        let idle = sched.idle.expect("scheduler not initialized");
        if me != idle {
            sched.run_queue.push_back(me);
        }
        switch_to(cpu, me, child);
        finish_switch();
        if irq_was_enabled {
            interrupts::enable();
        }
        child.tid().0 as i32
    } else {
        // FORK: hand the child to the manager for placement, block until
        // the round trip completes. The manager replies with the child's
        // tid or a negative error; a failed placement also unwinds the
        // child through its own path.
        let msg = unsafe { &mut *me.msg() };
        msg.kind = MsgKind::Fork;
        msg.payload = MsgPayload::Fork {
            parent: me,
            child,
            retries: 0,
        };
        context_switch(SwitchOp::SendMsg)
    }
}
