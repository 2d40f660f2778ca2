/*
 * Global Task and Thread Tables
 *
 * The pid table maps live pids to their PCBs; the manager's life-cycle
 * protocol is its only writer and, apart from diagnostics, its only
 * reader. The thread table maps tids to TCBs and is maintained by the
 * workers; yield-to and make_runnable resolve their targets here.
 *
 * Lock ordering: the pid-table lock is taken before any task wait lock.
 */

use alloc::collections::BTreeMap;

use crate::sync::{Mutex, SpinLock};
use crate::task::pcb::{Pcb, PcbRef, Pid};
use crate::task::tcb::{TcbRef, Tid};

struct PidTable {
    map: SpinLock<BTreeMap<u32, PcbRef>>,
    lock: Mutex,
}

static PID_TABLE: PidTable = PidTable {
    map: SpinLock::new(BTreeMap::new()),
    lock: Mutex::new(),
};

static THREAD_TABLE: SpinLock<BTreeMap<u32, TcbRef>> = SpinLock::new(BTreeMap::new());
static THREAD_LOCK: Mutex = Mutex::new();

/// Insert a task under its pid.
pub fn pid_insert(pcb: PcbRef) {
    PID_TABLE.lock.with(|| {
        PID_TABLE.map.lock().insert(pcb.pid().0, pcb);
    });
}

/// Remove a task. Returns the PCB so the caller can release it.
pub fn pid_remove(pid: Pid) -> Option<PcbRef> {
    PID_TABLE.lock.with(|| PID_TABLE.map.lock().remove(&pid.0))
}

pub fn pid_lookup(pid: Pid) -> Option<PcbRef> {
    PID_TABLE.lock.with(|| PID_TABLE.map.lock().get(&pid.0).copied())
}

/// Run `f` under the pid-table lock with every live task.
///
/// Used by the manager's orphan reparenting pass, which has to find all
/// children of a vanishing task.
pub fn pid_for_each(mut f: impl FnMut(&Pcb)) {
    PID_TABLE.lock.with(|| {
        for pcb in PID_TABLE.map.lock().values() {
            f(pcb);
        }
    });
}

/// Run `f` with the pid-table lock held, for multi-step manager
/// transactions that must see a stable table.
pub fn pid_table_locked<R>(f: impl FnOnce() -> R) -> R {
    PID_TABLE.lock.with(f)
}

pub fn thread_insert(tcb: TcbRef) {
    THREAD_LOCK.with(|| {
        THREAD_TABLE.lock().insert(tcb.tid().0, tcb);
    });
}

pub fn thread_remove(tid: Tid) {
    THREAD_LOCK.with(|| {
        THREAD_TABLE.lock().remove(&tid.0);
    });
}

pub fn thread_lookup(tid: Tid) -> Option<TcbRef> {
    THREAD_LOCK.with(|| THREAD_TABLE.lock().get(&tid.0).copied())
}
