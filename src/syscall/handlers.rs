/*
 * System Call Handlers (Worker Side)
 *
 * Each handler validates its arguments against the caller's address
 * space, then either completes locally or marshals the caller's message
 * and blocks through SEND_MSG until the manager replies.
 *
 * All userspace pointers are validated before the first dereference. A
 * syscall that blocks and then writes through a user pointer revalidates
 * after waking: another thread of the task may have removed the pages in
 * between.
 */

use alloc::vec::Vec;

use crate::arch::idt::TrapFrame;
use crate::arch::smp;
use crate::bus::{MsgKind, MsgPayload};
use crate::loader;
use crate::memory::paging;
use crate::memory::types::VirtAddr;
use crate::memory::vm::{self, ValidError, VmError};
use crate::sched::{self, SwitchOp};
use crate::syscall::numbers::*;
use crate::task::pcb::{Pcb, Pid};
use crate::task::tcb::{self, TcbRef};
use crate::task::{table, zombie};
use crate::traps;
use crate::utils::timer;

/// Longest buffer print/readline accepts in one call.
const IO_MAX: u32 = 4096;

/// Result-slot sentinel a failed fork child sets before blocking: a
/// non-negative value the manager's abort reply cannot produce.
const FORK_RETRY: i32 = 1;

fn vm_of(me: &TcbRef) -> &'static crate::memory::vm::AddressSpace {
    let task = me.task().expect("syscall from taskless thread");
    // SAFETY: the task outlives the syscall; its last thread is the
    // caller itself.
    unsafe { &*(task.vm() as *const _) }
}

fn map_valid_err(e: ValidError) -> i32 {
    match e {
        ValidError::KernelSpace
        | ValidError::Len
        | ValidError::PageNotAlloc
        | ValidError::ReadOnly
        | ValidError::NotNullTerm => EFAULT,
    }
}

fn map_vm_err(e: VmError) -> i32 {
    match e {
        VmError::NoMem => ENOMEM,
        VmError::Overlap | VmError::NotRegionStart => EINVAL,
        VmError::BadAddress => EFAULT,
    }
}

/// Validate and copy a user buffer into kernel memory.
fn copy_from_user(me: &TcbRef, ptr: u32, len: u32) -> Result<Vec<u8>, i32> {
    vm_of(me)
        .check_mem_validness(VirtAddr::new(ptr), len, false, false)
        .map_err(map_valid_err)?;
    let mut buf = alloc::vec![0u8; len as usize];
    unsafe {
        core::ptr::copy_nonoverlapping(ptr as *const u8, buf.as_mut_ptr(), len as usize);
    }
    Ok(buf)
}

/// Validate and copy a kernel buffer out to user memory.
fn copy_to_user(me: &TcbRef, ptr: u32, data: &[u8]) -> Result<(), i32> {
    vm_of(me)
        .check_mem_validness(VirtAddr::new(ptr), data.len() as u32, false, true)
        .map_err(map_valid_err)?;
    unsafe {
        core::ptr::copy_nonoverlapping(data.as_ptr(), ptr as *mut u8, data.len());
    }
    Ok(())
}

/// Validate and copy a NUL-terminated user string, bounded by NAME_MAX.
pub fn copy_string_from_user(me: &TcbRef, ptr: u32) -> Result<Vec<u8>, i32> {
    vm_of(me)
        .check_mem_validness(VirtAddr::new(ptr), NAME_MAX, true, false)
        .map_err(|e| match e {
            ValidError::NotNullTerm => ENAMETOOLONG,
            other => map_valid_err(other),
        })?;
    let mut out = Vec::new();
    let mut p = ptr;
    loop {
        let byte = unsafe { core::ptr::read(p as *const u8) };
        if byte == 0 {
            break;
        }
        out.push(byte);
        p += 1;
    }
    Ok(out)
}

// ── Local syscalls ──────────────────────────────────────────────

pub fn sys_gettid() -> i32 {
    tcb::current().tid().0 as i32
}

pub fn sys_get_ticks() -> i32 {
    timer::get_ticks() as i32
}

pub fn sys_yield(tid: i32) -> i32 {
    let me = tcb::current();
    if tid >= 0 && tid as u32 == me.tid().0 {
        return 0;
    }
    if tid < 0 {
        return sched::context_switch(SwitchOp::Yield(-1));
    }

    let Some(target) = table::thread_lookup(crate::task::Tid(tid as u32)) else {
        return ETHREAD;
    };
    if target.cpu() == me.cpu() {
        return sched::context_switch(SwitchOp::Yield(tid));
    }

    // Remote target: a run order routed through the manager to the
    // target's CPU; we block on the acknowledgement.
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::Yield;
    msg.payload = MsgPayload::Thread { target };
    sched::context_switch(SwitchOp::SendMsg)
}

pub fn sys_sleep(ticks: i32) -> i32 {
    if ticks < 0 {
        return EINVAL;
    }
    if ticks == 0 {
        return sched::context_switch(SwitchOp::Yield(-1));
    }
    sched::sleep::sleep_until(timer::get_ticks().wrapping_add(ticks as u32));
    0
}

pub fn sys_deschedule(reject_ptr: u32) -> i32 {
    let me = tcb::current();
    if let Err(e) = vm_of(&me).check_mem_validness(VirtAddr::new(reject_ptr), 4, false, false) {
        return map_valid_err(e);
    }

    // The flag goes up before the reject word is read, so a concurrent
    // make_runnable that observes the flag always lands either in the
    // blocked state or in the MADE_RUNNABLE transient.
    me.set_descheduled(true);
    let reject = unsafe { core::ptr::read_volatile(reject_ptr as *const i32) };
    if reject != 0 {
        me.set_descheduled(false);
        // Absorb a wake that slipped in while the flag was up.
        let _ = me.state_cas(
            crate::task::SchedState::MadeRunnable,
            crate::task::SchedState::Normal,
        );
        return 0;
    }

    sched::context_switch(SwitchOp::Block);
    me.set_descheduled(false);
    0
}

pub fn sys_make_runnable(tid: i32) -> i32 {
    if tid < 0 {
        return EINVAL;
    }
    let me = tcb::current();
    let Some(target) = table::thread_lookup(crate::task::Tid(tid as u32)) else {
        return ETHREAD;
    };
    // Only one waker wins the flag; everyone else sees a thread that is
    // not descheduled.
    if !target.take_descheduled() {
        return ETHREAD;
    }

    if target.cpu() == me.cpu() {
        sched::context_switch(SwitchOp::MakeRunnable(target));
        return 0;
    }

    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::MakeRunnable;
    msg.payload = MsgPayload::Thread { target };
    sched::context_switch(SwitchOp::SendMsg)
}

pub fn sys_new_pages(base: u32, len: u32) -> i32 {
    if base & (crate::memory::types::PAGE_SIZE - 1) != 0
        || len == 0
        || len & (crate::memory::types::PAGE_SIZE - 1) != 0
    {
        return EINVAL;
    }
    let me = tcb::current();
    match vm_of(&me).new_region(VirtAddr::new(base), len, true, true, true) {
        Ok(()) => 0,
        Err(e) => map_vm_err(e),
    }
}

pub fn sys_remove_pages(base: u32) -> i32 {
    let me = tcb::current();
    match vm_of(&me).remove_region(VirtAddr::new(base)) {
        Ok(()) => 0,
        Err(e) => map_vm_err(e),
    }
}

pub fn sys_readfile(name_ptr: u32, buf: u32, count: u32, offset: u32) -> i32 {
    let me = tcb::current();
    let name = match copy_string_from_user(&me, name_ptr) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let Some(contents) = loader::toc::lookup(&name) else {
        return ENOENT;
    };
    if offset as usize > contents.len() {
        return EINVAL;
    }
    let n = (count as usize).min(contents.len() - offset as usize);
    if n == 0 {
        return 0;
    }
    match copy_to_user(&me, buf, &contents[offset as usize..offset as usize + n]) {
        Ok(()) => n as i32,
        Err(e) => e,
    }
}

pub fn sys_set_status(status: i32) -> i32 {
    let me = tcb::current();
    me.task()
        .expect("set_status from taskless thread")
        .set_exit_status(status);
    0
}

pub fn sys_swexn(frame: &mut TrapFrame, esp3: u32, eip: u32, arg: u32, newureg: u32) -> i32 {
    traps::swexn::sys_swexn(frame, esp3, eip, arg, newureg)
}

pub fn sys_exec(frame: &mut TrapFrame, name_ptr: u32, argv_ptr: u32) -> i32 {
    loader::sys_exec(frame, name_ptr, argv_ptr)
}

// ── Life-cycle syscalls (worker side) ───────────────────────────

pub fn sys_fork() -> i32 {
    sched::context_switch(SwitchOp::Fork)
}

pub fn sys_thread_fork() -> i32 {
    sched::context_switch(SwitchOp::ThreadFork)
}

/// Leave the kernel through this thread's own trap frame with `result`
/// as the user-visible return value.
///
/// Fork children must exit this way: the Rust frames on their copied
/// stack hold pointers into the parent's stack and may not be unwound.
fn user_return(result: i32) -> ! {
    let me = tcb::current();
    let frame = crate::arch::idt::TrapFrame::on_stack(me.stack_top());
    unsafe {
        (*frame).eax = result as u32;
        crate::arch::idt::trap_return_to(frame)
    }
}

/// First code a fork or thread_fork child runs, called from the
/// scheduler once the child's capture resumes on its placement CPU.
///
/// A thread_fork child shares everything and goes straight back to user
/// mode. A fork child arrives inside the parent's address space: it
/// clones the space, builds its own PCB, reports the outcome to the
/// manager, and parks until the manager confirms. On clone failure the
/// manager may re-place the child on another worker (whose frame segment
/// may not be exhausted) or order it to abort.
pub fn fork_child_entry(same_task: bool) -> ! {
    let me = tcb::current();

    if same_task {
        user_return(0);
    }

    let parent_task = me.task().expect("fork child without parent task");
    loop {
        match parent_task.vm().clone_space() {
            Ok(new_vm) => {
                let pcb = Pcb::create(Pid(me.tid().0), parent_task.pid(), new_vm);
                me.set_task(Some(pcb));
                unsafe { paging::switch_root(pcb.vm().root()) };

                let msg = unsafe { &mut *me.msg() };
                msg.kind = MsgKind::ForkResponse;
                msg.payload = MsgPayload::ForkDone { task: pcb };
                me.set_result(0);
                sched::context_switch(SwitchOp::SendMsg);
                user_return(0);
            }
            Err(_) => {
                let msg = unsafe { &mut *me.msg() };
                msg.kind = MsgKind::ForkResponse;
                msg.payload = MsgPayload::Result { value: ENOMEM };
                me.set_result(FORK_RETRY);
                let r = sched::context_switch(SwitchOp::SendMsg);
                if r < 0 {
                    // Abort order: placement failed everywhere.
                    fork_child_abort(me);
                }
                // Re-placed on another CPU: try the clone again there.
            }
        }
    }
}

/// Tear down a fork child that never got an address space.
fn fork_child_abort(me: TcbRef) -> ! {
    table::thread_remove(me.tid());
    me.set_task(None);
    unsafe { paging::switch_root(vm::boot_root()) };
    zombie::add(me);
    sched::context_switch(SwitchOp::Block);
    unreachable!("aborted fork child rescheduled");
}

pub fn sys_wait(status_ptr: u32) -> i32 {
    let me = tcb::current();
    let task = me.task().expect("wait from taskless thread");
    if status_ptr != 0 {
        if let Err(e) = vm_of(&me).check_mem_validness(VirtAddr::new(status_ptr), 4, false, true)
        {
            return map_valid_err(e);
        }
    }

    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::Wait;
    msg.payload = MsgPayload::Wait { task };
    sched::context_switch(SwitchOp::SendMsg);

    let msg = unsafe { &*me.msg() };
    let MsgPayload::WaitResponse { pid, status } = msg.payload else {
        panic!("wait woke without a wait response");
    };
    if pid < 0 {
        return pid;
    }
    if status_ptr != 0 {
        // Revalidate: the pages may be gone since we blocked.
        if let Err(e) = vm_of(&me).check_mem_validness(VirtAddr::new(status_ptr), 4, false, true)
        {
            return map_valid_err(e);
        }
        unsafe {
            core::ptr::write_volatile(status_ptr as *mut i32, status);
        }
    }
    pid
}

pub fn sys_vanish() -> i32 {
    vanish_current(false)
}

/// End the calling thread. With `is_kernel_kill` the kernel is killing a
/// misbehaving thread and forces the exit status to -2 first.
///
/// The last thread of a task tears down the address space and reports
/// VANISH to the manager, which delivers the exit status and reparents
/// any children; the thread itself then joins the zombie list and blocks
/// for good.
pub fn vanish_current(is_kernel_kill: bool) -> ! {
    let me = tcb::current();
    let task = me.task().expect("vanish from taskless thread");

    if is_kernel_kill {
        task.set_exit_status(-2);
    }

    table::thread_remove(me.tid());
    let last = task.thread_ended();

    if last {
        // Frames and page tables go back while the space is still
        // addressable; the directory is released only after cr3 moved.
        task.vm().free_space();
        unsafe { paging::switch_root(vm::boot_root()) };
        me.set_task(None);
        task.vm().release_directory();

        let msg = unsafe { &mut *me.msg() };
        msg.kind = MsgKind::Vanish;
        msg.payload = MsgPayload::Vanish {
            task,
            status: task.exit_status(),
        };
        sched::context_switch(SwitchOp::SendMsg);
        // Woken by VANISH_BACK; the PCB is gone now.
    } else {
        me.set_task(None);
        unsafe { paging::switch_root(vm::boot_root()) };
    }

    zombie::add(me);
    sched::context_switch(SwitchOp::Block);
    unreachable!("vanished thread rescheduled");
}

// ── Console syscalls (manager round trips) ──────────────────────

pub fn sys_print(len: u32, buf: u32) -> i32 {
    if len == 0 || len > IO_MAX {
        return EINVAL;
    }
    let me = tcb::current();
    let staged = match copy_from_user(&me, buf, len) {
        Ok(b) => b,
        Err(e) => return e,
    };

    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::Print;
    msg.payload = MsgPayload::Print {
        buf: staged.as_ptr(),
        len,
    };
    // The staging buffer stays alive across the block: `staged` is not
    // dropped until after the reply wakes us.
    let r = sched::context_switch(SwitchOp::SendMsg);
    drop(staged);
    r
}

pub fn sys_readline(len: u32, buf: u32) -> i32 {
    if len == 0 || len > IO_MAX {
        return EINVAL;
    }
    let me = tcb::current();
    // Fail early if the destination is bad; revalidated after the block.
    if let Err(e) = vm_of(&me).check_mem_validness(VirtAddr::new(buf), len, false, true) {
        return map_valid_err(e);
    }

    let mut staged = alloc::vec![0u8; len as usize];
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::Readline;
    msg.payload = MsgPayload::Readline {
        buf: staged.as_mut_ptr(),
        len,
    };
    let n = sched::context_switch(SwitchOp::SendMsg);
    if n < 0 {
        return n;
    }
    match copy_to_user(&me, buf, &staged[..n as usize]) {
        Ok(()) => n,
        Err(e) => e,
    }
}

pub fn sys_get_cursor_pos(row_ptr: u32, col_ptr: u32) -> i32 {
    let me = tcb::current();
    for p in [row_ptr, col_ptr] {
        if let Err(e) = vm_of(&me).check_mem_validness(VirtAddr::new(p), 4, false, true) {
            return map_valid_err(e);
        }
    }

    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::GetCursorPos;
    msg.payload = MsgPayload::None;
    let r = sched::context_switch(SwitchOp::SendMsg);
    if r < 0 {
        return r;
    }

    let msg = unsafe { &*me.msg() };
    let MsgPayload::Cursor { row, col } = msg.payload else {
        panic!("get_cursor_pos woke without a cursor payload");
    };
    if copy_to_user(&me, row_ptr, &row.to_ne_bytes()).is_err()
        || copy_to_user(&me, col_ptr, &col.to_ne_bytes()).is_err()
    {
        return EFAULT;
    }
    0
}

pub fn sys_set_cursor_pos(row: i32, col: i32) -> i32 {
    let me = tcb::current();
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::SetCursorPos;
    msg.payload = MsgPayload::Cursor { row, col };
    sched::context_switch(SwitchOp::SendMsg)
}

pub fn sys_set_term_color(color: u32) -> i32 {
    let me = tcb::current();
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::SetTermColor;
    msg.payload = MsgPayload::Color { color };
    sched::context_switch(SwitchOp::SendMsg)
}

pub fn sys_halt() -> i32 {
    let me = tcb::current();
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::Halt;
    msg.payload = MsgPayload::None;
    log::info!("halt requested by {} on cpu{}", me.tid(), smp::cpu_id().0);
    sched::context_switch(SwitchOp::SendMsg);
    unreachable!("halt returned");
}
