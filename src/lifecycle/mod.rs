/*
 * Life-Cycle Coordinator (Manager Side)
 *
 * The manager CPU's whole existence: pull one message off the bus,
 * dispatch it, repeat. Centralising the pid table, exit-status delivery
 * and fork placement on one CPU serialises them without any distributed
 * locking; the workers only ever wait on replies.
 *
 * Fork placement walks the workers round-robin. A worker that cannot
 * clone the address space (its frame segment ran dry) reports failure
 * and the child is re-placed on the next worker, up to one attempt per
 * worker before the parent gets ENOMEM back.
 */

use alloc::collections::BTreeMap;

use crate::arch::smp::{self, MAX_CPUS};
use crate::bus::{self, Message, MsgKind, MsgPayload};
use crate::console;
use crate::syscall::numbers::{ECHILD, ENOMEM};
use crate::task::pcb::{ExitStatus, Pcb, PcbRef};
use crate::task::table;

struct PendingFork {
    parent_msg: *mut Message,
    retries: u32,
}

struct Manager {
    /// The task that adopts orphans. Set once, early, by SET_INIT_PCB.
    init_task: Option<PcbRef>,
    /// In-flight forks keyed by child tid.
    pending_forks: BTreeMap<u32, PendingFork>,
    /// Round-robin fork placement cursor.
    next_core: usize,
}

/// Messages the manager itself originates (HALT broadcast). The manager
/// has no threads, so it owns these instead.
static mut MANAGER_MSGS: [Message; MAX_CPUS] =
    [const { Message::new(crate::task::Tid(0), 0) }; MAX_CPUS];

/// The manager dispatch loop. Never returns.
pub fn manager_main() -> ! {
    let mut mgr = Manager {
        init_task: None,
        pending_forks: BTreeMap::new(),
        next_core: 0,
    };
    log::info!("manager dispatch loop running");

    loop {
        let msg = bus::manager_recv();
        mgr.dispatch(msg);
    }
}

/// Rewrite a message as a reply and route it to its owner's CPU.
fn reply(msg: *mut Message, kind: MsgKind, value: i32) {
    let m = unsafe { &mut *msg };
    m.kind = kind;
    m.payload = MsgPayload::Result { value };
    bus::manager_send(msg, m.owner().cpu() as usize);
}

/// Reply to a WAIT message with one reaped child (or an error pid).
fn reply_wait(msg: *mut Message, pid: i32, status: i32) {
    let m = unsafe { &mut *msg };
    m.kind = MsgKind::WaitResponse;
    m.payload = MsgPayload::WaitResponse { pid, status };
    bus::manager_send(msg, m.owner().cpu() as usize);
}

impl Manager {
    fn dispatch(&mut self, msg: *mut Message) {
        let kind = unsafe { (*msg).kind };
        match kind {
            MsgKind::Fork => self.do_fork(msg),
            MsgKind::ForkResponse => self.do_fork_response(msg),
            MsgKind::Vanish => self.do_vanish(msg),
            MsgKind::Wait => self.do_wait(msg),
            MsgKind::SetInitPcb => self.do_set_init(msg),
            MsgKind::Print => self.do_print(msg),
            MsgKind::Readline => console::readline_request(msg),
            MsgKind::GetCursorPos => self.do_get_cursor(msg),
            MsgKind::SetCursorPos => self.do_set_cursor(msg),
            MsgKind::SetTermColor => self.do_set_color(msg),
            MsgKind::MakeRunnable | MsgKind::Yield => self.forward_order(msg),
            MsgKind::Response => {
                // Worker-generated acknowledgement passing through to the
                // thread that asked for the scheduling order.
                let cpu = unsafe { (*msg).owner().cpu() } as usize;
                bus::manager_send(msg, cpu);
            }
            MsgKind::Halt => self.do_halt(),
            other => panic!("manager received worker-only message kind {:?}", other),
        }
    }

    // ── fork ────────────────────────────────────────────────────

    /// Pick the next placement target, round-robin over the workers.
    fn pick_worker(&mut self) -> usize {
        let workers = smp::cpu_count() - 1;
        let target = 1 + self.next_core % workers;
        self.next_core = (self.next_core + 1) % workers;
        target
    }

    fn do_fork(&mut self, msg: *mut Message) {
        let MsgPayload::Fork { parent, child, .. } = (unsafe { &*msg }).payload else {
            panic!("FORK message without fork payload");
        };
        self.pending_forks.insert(
            child.tid().0,
            PendingFork {
                parent_msg: msg,
                retries: 0,
            },
        );

        let target = self.pick_worker();
        // The placement order travels on the child's own message; the
        // parent's stays parked here until the outcome is known.
        let child_msg = unsafe { &mut *child.msg() };
        child_msg.kind = MsgKind::Fork;
        child_msg.payload = MsgPayload::Fork {
            parent,
            child,
            retries: 0,
        };
        bus::manager_send(child.msg(), target);
    }

    fn do_fork_response(&mut self, msg: *mut Message) {
        let child_tid = unsafe { (*msg).requester };
        let payload = unsafe { (*msg).payload };

        match payload {
            MsgPayload::ForkDone { task } => {
                let pending = self
                    .pending_forks
                    .remove(&child_tid.0)
                    .expect("fork response without pending fork");

                table::pid_insert(task);

                let MsgPayload::Fork { parent, child, .. } =
                    (unsafe { &*pending.parent_msg }).payload
                else {
                    panic!("pending fork lost its payload");
                };
                let parent_task = parent.task().expect("forking parent lost its task");
                parent_task.wait.lock().alive_children += 1;

                reply(pending.parent_msg, MsgKind::ForkResponse, child.tid().0 as i32);
                reply(msg, MsgKind::Response, 0);
            }
            MsgPayload::Result { .. } => {
                // Clone failed on that worker.
                let pending = self
                    .pending_forks
                    .get_mut(&child_tid.0)
                    .expect("fork failure without pending fork");
                pending.retries += 1;

                let workers = smp::cpu_count() as u32 - 1;
                if pending.retries < workers {
                    let retries = pending.retries;
                    let MsgPayload::Fork { parent, child, .. } =
                        (unsafe { &*pending.parent_msg }).payload
                    else {
                        panic!("pending fork lost its payload");
                    };
                    let target = self.pick_worker();
                    let child_msg = unsafe { &mut *child.msg() };
                    child_msg.kind = MsgKind::Fork;
                    child_msg.payload = MsgPayload::Fork {
                        parent,
                        child,
                        retries,
                    };
                    bus::manager_send(child.msg(), target);
                } else {
                    let pending = self.pending_forks.remove(&child_tid.0).unwrap();
                    reply(pending.parent_msg, MsgKind::ForkResponse, ENOMEM);
                    // Negative result orders the child to abort.
                    reply(msg, MsgKind::Response, ENOMEM);
                }
            }
            _ => panic!("FORK_RESPONSE with unexpected payload"),
        }
    }

    // ── wait / vanish ───────────────────────────────────────────

    fn do_wait(&mut self, msg: *mut Message) {
        let MsgPayload::Wait { task } = (unsafe { &*msg }).payload else {
            panic!("WAIT message without wait payload");
        };

        let mut w = task.wait.lock();
        if let Some(es) = w.zombies.pop_front() {
            drop(w);
            reply_wait(msg, es.pid.0 as i32, es.status);
        } else if w.alive_children as usize > w.waiters.len() {
            // More children than waiters: park until one vanishes.
            w.waiters.push_back(msg);
        } else {
            drop(w);
            reply_wait(msg, ECHILD, 0);
        }
    }

    /// Deliver one exit status to a task: hand it to a parked waiter if
    /// one exists, else queue it.
    fn deliver_exit(&self, recipient: PcbRef, es: ExitStatus, decrement_alive: bool) {
        let mut w = recipient.wait.lock();
        if decrement_alive {
            w.alive_children -= 1;
        }
        if let Some(waiter) = w.waiters.pop_front() {
            drop(w);
            reply_wait(waiter, es.pid.0 as i32, es.status);
        } else {
            w.zombies.push_back(es);
        }
    }

    fn do_vanish(&mut self, msg: *mut Message) {
        let MsgPayload::Vanish { task, status } = (unsafe { &*msg }).payload else {
            panic!("VANISH message without vanish payload");
        };
        let my_pid = task.pid();
        let init = self.init_task.expect("vanish before init was announced");
        if task == init {
            panic!("init task vanished");
        }

        // Exit status goes to the parent if it is still alive, else to
        // init.
        let recipient = table::pid_lookup(task.parent()).unwrap_or(init);
        self.deliver_exit(
            recipient,
            ExitStatus {
                pid: my_pid,
                status,
            },
            true,
        );

        // Orphans: my live children now answer to init, and my unreaped
        // exit statuses queue up for init's wait.
        let mut orphan_pids = alloc::vec::Vec::new();
        table::pid_for_each(|pcb| {
            if pcb.parent() == my_pid {
                orphan_pids.push(pcb.pid());
            }
        });
        for pid in &orphan_pids {
            if let Some(orphan) = table::pid_lookup(*pid) {
                orphan.set_parent(init.pid());
            }
        }

        let (stranded, alive) = {
            let mut w = task.wait.lock();
            debug_assert!(w.waiters.is_empty(), "dead task with parked waiters");
            let stranded: alloc::vec::Vec<ExitStatus> = w.zombies.drain(..).collect();
            (stranded, w.alive_children)
        };
        if alive > 0 {
            init.wait.lock().alive_children += alive;
        }
        for es in stranded {
            self.deliver_exit(init, es, false);
        }

        table::pid_remove(my_pid);
        // SAFETY: the task is out of every table and its last thread is
        // blocked in SEND_MSG until our reply below.
        unsafe { Pcb::release(task) };

        reply(msg, MsgKind::VanishBack, 0);
    }

    // ── init / console / halt ───────────────────────────────────

    fn do_set_init(&mut self, msg: *mut Message) {
        let MsgPayload::SetInitPcb { task } = (unsafe { &*msg }).payload else {
            panic!("SET_INIT_PCB without task payload");
        };
        if self.init_task.is_some() {
            panic!("init task announced twice");
        }
        self.init_task = Some(task);
        table::pid_insert(task);
        log::info!("init task is {}", task.pid());
        reply(msg, MsgKind::Response, 0);
    }

    fn do_print(&mut self, msg: *mut Message) {
        let MsgPayload::Print { buf, len } = (unsafe { &*msg }).payload else {
            panic!("PRINT without print payload");
        };
        // The staging buffer lives in the sender's kernel heap and the
        // sender is blocked until this reply.
        let bytes = unsafe { core::slice::from_raw_parts(buf, len as usize) };
        console::write_bytes(bytes);
        reply(msg, MsgKind::Response, len as i32);
    }

    fn do_get_cursor(&mut self, msg: *mut Message) {
        let (row, col) = console::cursor();
        let m = unsafe { &mut *msg };
        m.kind = MsgKind::Response;
        m.payload = MsgPayload::Cursor { row, col };
        bus::manager_send(msg, m.owner().cpu() as usize);
    }

    fn do_set_cursor(&mut self, msg: *mut Message) {
        let MsgPayload::Cursor { row, col } = (unsafe { &*msg }).payload else {
            panic!("SET_CURSOR_POS without cursor payload");
        };
        reply(msg, MsgKind::Response, console::set_cursor(row, col));
    }

    fn do_set_color(&mut self, msg: *mut Message) {
        let MsgPayload::Color { color } = (unsafe { &*msg }).payload else {
            panic!("SET_TERM_COLOR without color payload");
        };
        reply(msg, MsgKind::Response, console::set_color(color));
    }

    fn do_halt(&mut self) -> ! {
        log::info!("broadcasting halt to all workers");
        for cpu in 1..smp::cpu_count() {
            // SAFETY: manager-only array, one message per worker, sent
            // exactly once on the way down.
            let m = unsafe { &mut *(&raw mut MANAGER_MSGS[cpu]) };
            m.kind = MsgKind::Halt;
            m.payload = MsgPayload::None;
            bus::manager_send(m as *mut Message, cpu);
        }
        crate::arch::halt_forever();
    }

    fn forward_order(&mut self, msg: *mut Message) {
        let MsgPayload::Thread { target } = (unsafe { &*msg }).payload else {
            panic!("scheduling order without thread payload");
        };
        bus::manager_send(msg, target.cpu() as usize);
    }
}
