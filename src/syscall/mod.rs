/*
 * System Call Dispatch
 *
 * Entry from the INT 0x80 gate. The number rides in EAX and up to five
 * arguments in EBX, ECX, EDX, ESI, EDI; the return value goes back in the
 * trap frame's EAX slot and is restored on the way out.
 */

pub mod handlers;
pub mod numbers;

use crate::arch::idt::TrapFrame;
use numbers::*;

pub fn dispatch(frame: &mut TrapFrame) {
    let (a, b, c, d, e) = (frame.ebx, frame.ecx, frame.edx, frame.esi, frame.edi);

    let ret = match frame.eax {
        SYS_GETTID => handlers::sys_gettid(),
        SYS_FORK => handlers::sys_fork(),
        SYS_THREAD_FORK => handlers::sys_thread_fork(),
        SYS_EXEC => handlers::sys_exec(frame, a, b),
        SYS_WAIT => handlers::sys_wait(a),
        SYS_VANISH => handlers::sys_vanish(),
        SYS_SET_STATUS => handlers::sys_set_status(a as i32),
        SYS_YIELD => handlers::sys_yield(a as i32),
        SYS_SLEEP => handlers::sys_sleep(a as i32),
        SYS_GET_TICKS => handlers::sys_get_ticks(),
        SYS_DESCHEDULE => handlers::sys_deschedule(a),
        SYS_MAKE_RUNNABLE => handlers::sys_make_runnable(a as i32),
        SYS_NEW_PAGES => handlers::sys_new_pages(a, b),
        SYS_REMOVE_PAGES => handlers::sys_remove_pages(a),
        SYS_PRINT => handlers::sys_print(a, b),
        SYS_READLINE => handlers::sys_readline(a, b),
        SYS_GET_CURSOR_POS => handlers::sys_get_cursor_pos(a, b),
        SYS_SET_CURSOR_POS => handlers::sys_set_cursor_pos(a as i32, b as i32),
        SYS_SET_TERM_COLOR => handlers::sys_set_term_color(a),
        SYS_SWEXN => handlers::sys_swexn(frame, a, b, c, d),
        SYS_READFILE => handlers::sys_readfile(a, b, c, d),
        SYS_HALT => handlers::sys_halt(),
        _ => ENOSYS,
    };

    frame.eax = ret as u32;
}
