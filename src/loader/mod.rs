/*
 * Program Loader
 *
 * exec and the first-task bring-up. Loading runs with the target address
 * space active: segments are mapped region by region, file content is
 * copied straight through the new mappings, bss and the deep stack pages
 * stay zero-fill. The user stack is assembled last and the trap frame is
 * redirected so the return from the syscall lands at the new entry point.
 */

pub mod elf;
pub mod toc;

use alloc::vec::Vec;

use crate::arch::gdt::{USER_CS, USER_DS};
use crate::arch::idt::TrapFrame;
use crate::bus::{MsgKind, MsgPayload};
use crate::memory::types::{VirtAddr, PAGE_SIZE};
use crate::sched::{self, SwitchOp};
use crate::syscall::numbers::*;
use crate::task::pcb::{Pcb, PcbRef, Pid};
use crate::task::tcb::{self, TcbRef};
use crate::task::table;
use crate::memory::vm::AddressSpace;

/// Top of the user stack region.
pub const USER_STACK_HIGH: u32 = 0xc000_0000;

/// Initial stack region size. The top page is materialised eagerly for
/// the argument block; the rest faults in on demand.
pub const USER_STACK_SIZE: u32 = 64 * 1024;

const USER_STACK_LOW: u32 = USER_STACK_HIGH - USER_STACK_SIZE;

/// Canonical EFLAGS for a fresh user context: IF plus the always-one bit.
const USER_EFLAGS: u32 = 0x0202;

/// exec(name, argv). Replaces the calling task's address space with the
/// named program. Only single-threaded tasks may exec.
pub fn sys_exec(frame: &mut TrapFrame, name_ptr: u32, argv_ptr: u32) -> i32 {
    let me = tcb::current();
    let task = me.task().expect("exec from taskless thread");
    if task.thread_count() > 1 {
        return EMORETHR;
    }

    let name = match crate::syscall::handlers::copy_string_from_user(&me, name_ptr) {
        Ok(n) => n,
        Err(e) => return e,
    };
    let argv = match copy_argv(&me, argv_ptr) {
        Ok(a) => a,
        Err(e) => return e,
    };

    // Everything that can fail without touching the old image goes
    // first: once the old space is torn down there is no way back.
    let Some(image) = toc::lookup(&name) else {
        return ENOENT;
    };
    let parsed = match elf::parse(image) {
        Ok(p) => p,
        Err(_) => return ENOEXEC,
    };

    task.vm().free_space();
    unsafe {
        *me.swexn.get() = None;
    }

    match load_into_current(task.vm(), image, &parsed, &argv) {
        Ok((entry, user_esp)) => {
            redirect_to_user(frame, entry, user_esp);
            0
        }
        Err(_) => {
            // Old image already gone; the thread cannot continue.
            log::warn!("exec of '{}' failed after teardown", name_str(&name));
            crate::syscall::handlers::vanish_current(true)
        }
    }
}

fn name_str(name: &[u8]) -> &str {
    core::str::from_utf8(name).unwrap_or("<non-utf8>")
}

/// Copy a NULL-terminated user argv into kernel memory.
fn copy_argv(me: &TcbRef, argv_ptr: u32) -> Result<Vec<Vec<u8>>, i32> {
    let mut argv = Vec::new();
    if argv_ptr == 0 {
        return Ok(argv);
    }
    let task = me.task().expect("argv copy without task");
    let mut slot = argv_ptr;
    loop {
        if argv.len() >= ARGV_MAX {
            return Err(E2BIG);
        }
        task.vm()
            .check_mem_validness(VirtAddr::new(slot), 4, false, false)
            .map_err(|_| EFAULT)?;
        let str_ptr = unsafe { core::ptr::read(slot as *const u32) };
        if str_ptr == 0 {
            break;
        }
        argv.push(crate::syscall::handlers::copy_string_from_user(me, str_ptr)?);
        slot += 4;
    }
    Ok(argv)
}

/// Map and fill the program image plus the user stack, returning the
/// entry point and initial stack pointer.
///
/// The address space must be active and empty of user mappings.
fn load_into_current(
    vm: &AddressSpace,
    image: &[u8],
    parsed: &elf::LoadedElf,
    argv: &[Vec<u8>],
) -> Result<(u32, u32), i32> {
    for seg in &parsed.segments {
        if seg.vaddr < crate::memory::USER_MEM_START {
            return Err(ENOEXEC);
        }
        if seg.filesz > 0 {
            vm.new_region(
                VirtAddr::new(seg.vaddr),
                seg.filesz,
                seg.writable,
                false,
                false,
            )
            .map_err(|_| ENOMEM)?;
            unsafe {
                core::ptr::copy_nonoverlapping(
                    image.as_ptr().add(seg.offset as usize),
                    seg.vaddr as *mut u8,
                    seg.filesz as usize,
                );
            }
        }
        if seg.memsz > seg.filesz {
            // bss: zero-fill on demand. A boundary page shared with the
            // file part is already mapped and already zero past filesz.
            let bss_start = seg.vaddr + seg.filesz;
            vm.new_region(
                VirtAddr::new(bss_start),
                seg.memsz - seg.filesz,
                true,
                false,
                true,
            )
            .map_err(|_| ENOMEM)?;
        }
    }

    // Deep stack pages are zero-fill; the top page takes the argument
    // block now.
    vm.new_region(
        VirtAddr::new(USER_STACK_LOW),
        USER_STACK_SIZE - PAGE_SIZE,
        true,
        false,
        true,
    )
    .map_err(|_| ENOMEM)?;
    vm.new_region(
        VirtAddr::new(USER_STACK_HIGH - PAGE_SIZE),
        PAGE_SIZE,
        true,
        false,
        false,
    )
    .map_err(|_| ENOMEM)?;

    Ok((parsed.entry, build_user_stack(argv)?))
}

/// Lay out the argument block at the top of the stack:
/// strings, the argv pointer array, then the main() frame
/// (argc, argv, stack_high, stack_low) under a sentinel return address.
fn build_user_stack(argv: &[Vec<u8>]) -> Result<u32, i32> {
    let strings_bytes: u32 = argv.iter().map(|a| a.len() as u32 + 1).sum();
    let block = strings_bytes + 4 * (argv.len() as u32 + 1) + 5 * 4 + 16;
    if block > PAGE_SIZE {
        return Err(E2BIG);
    }

    let mut sp = USER_STACK_HIGH;
    let mut str_ptrs = Vec::with_capacity(argv.len());
    for arg in argv.iter().rev() {
        sp -= arg.len() as u32 + 1;
        unsafe {
            core::ptr::copy_nonoverlapping(arg.as_ptr(), sp as *mut u8, arg.len());
            core::ptr::write((sp + arg.len() as u32) as *mut u8, 0);
        }
        str_ptrs.push(sp);
    }
    str_ptrs.reverse();

    sp &= !3;
    // argv array, NULL terminated.
    sp -= 4 * (argv.len() as u32 + 1);
    let argv_base = sp;
    unsafe {
        for (i, p) in str_ptrs.iter().enumerate() {
            core::ptr::write((argv_base + 4 * i as u32) as *mut u32, *p);
        }
        core::ptr::write((argv_base + 4 * argv.len() as u32) as *mut u32, 0);
    }

    // main(argc, argv, stack_high, stack_low) with a poison return
    // address: returning from main without vanish faults visibly.
    let words = [
        0xdead_beef,
        argv.len() as u32,
        argv_base,
        USER_STACK_HIGH,
        USER_STACK_LOW,
    ];
    for w in words.iter().rev() {
        sp -= 4;
        unsafe { core::ptr::write(sp as *mut u32, *w) };
    }
    Ok(sp)
}

/// Rewrite a trap frame so the iret lands in fresh user context.
fn redirect_to_user(frame: &mut TrapFrame, entry: u32, user_esp: u32) {
    frame.eip = entry;
    frame.user_esp = user_esp;
    frame.eflags = USER_EFLAGS;
    frame.cs = USER_CS as u32;
    frame.user_ss = USER_DS as u32;
    frame.ds = USER_DS as u32;
    frame.es = USER_DS as u32;
    frame.fs = USER_DS as u32;
    frame.gs = USER_DS as u32;
    frame.eax = 0;
    frame.ebx = 0;
    frame.ecx = 0;
    frame.edx = 0;
    frame.esi = 0;
    frame.edi = 0;
    frame.ebp = 0;
}

/// Create the init task on the calling worker CPU and queue its founding
/// thread. The thread announces itself to the manager, loads `init` from
/// the table of contents, and drops to user mode.
pub fn spawn_init_task() -> Result<(), &'static str> {
    let vm = AddressSpace::new().map_err(|_| "no memory for init address space")?;
    let tcb = tcb::Tcb::create(None, crate::arch::smp::cpu_id().0)?;
    let pcb = Pcb::create(Pid(tcb.tid().0), Pid(tcb.tid().0), vm);
    tcb.set_task(Some(pcb));

    unsafe {
        *tcb.context.get() =
            sched::context::prepare_initial(tcb.stack_top(), init_task_main, 0);
    }
    table::thread_insert(tcb);
    sched::enqueue_boot(tcb);
    log::info!("init task queued as {}", pcb.pid());
    Ok(())
}

/// Founding thread of init.
extern "C" fn init_task_main(_arg: usize) -> ! {
    let me = tcb::current();
    let task = me.task().expect("init thread without task");

    announce_init(me, task);

    // Switch onto init's (still empty) address space before loading.
    unsafe { crate::memory::paging::switch_root(task.vm().root()) };

    let image = toc::lookup(b"init").expect("init missing from TOC");
    let parsed = elf::parse(image).expect("built-in init does not parse");
    let argv: [Vec<u8>; 1] = [b"init".to_vec()];
    let (entry, user_esp) = load_into_current(task.vm(), image, &parsed, &argv)
        .expect("cannot load init");

    log::info!("entering user mode: init at {:#x}", entry);
    unsafe { enter_user(entry, user_esp) }
}

/// Tell the manager which task adopts orphans.
fn announce_init(me: TcbRef, task: PcbRef) {
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::SetInitPcb;
    msg.payload = MsgPayload::SetInitPcb { task };
    sched::context_switch(SwitchOp::SendMsg);
}

/// First descent to ring 3, used only by threads that have no user trap
/// frame to return through.
///
/// # Safety
/// `entry` and `user_esp` must be mapped in the active address space.
#[cfg(target_arch = "x86")]
unsafe fn enter_user(entry: u32, user_esp: u32) -> ! {
    unsafe {
        core::arch::asm!(
            "mov ds, {uds:e}",
            "mov es, {uds:e}",
            "mov fs, {uds:e}",
            "mov gs, {uds:e}",
            "push {uds:e}",   // ss
            "push {esp}",     // esp
            "push {eflags}",  // eflags
            "push {ucs}",     // cs
            "push {eip}",     // eip
            "iretd",
            uds = in(reg) USER_DS as u32,
            ucs = in(reg) USER_CS as u32,
            esp = in(reg) user_esp,
            eflags = in(reg) USER_EFLAGS,
            eip = in(reg) entry,
            options(noreturn)
        );
    }
}

#[cfg(not(target_arch = "x86"))]
unsafe fn enter_user(_entry: u32, _user_esp: u32) -> ! {
    unreachable!("user mode exists only on the real target")
}
