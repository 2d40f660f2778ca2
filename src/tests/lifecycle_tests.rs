/*
 * Bus and Console Round-Trip Tests
 *
 * Drives the worker/manager message protocol end to end from a kernel
 * thread: each test marshals this thread's message, blocks in SEND_MSG,
 * and checks what the manager sent back. FIFO per pair and exactly-one
 * reply per request are implicitly exercised by every round trip.
 */

use crate::bus::{MsgKind, MsgPayload};
use crate::sched::{self, SwitchOp};
use crate::syscall::numbers::EINVAL;
use crate::task::tcb;

/// Test a PRINT round trip: the manager consumes the staged buffer and
/// acknowledges with its length.
pub fn test_print_round_trip() -> bool {
    log::info!("TEST: PRINT round trip through the manager");

    let me = tcb::current();
    let text = b"finch kernel self-test\n";
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::Print;
    msg.payload = MsgPayload::Print {
        buf: text.as_ptr(),
        len: text.len() as u32,
    };
    let r = sched::context_switch(SwitchOp::SendMsg);

    if r == text.len() as i32 {
        log::info!("  PASS: manager printed {} bytes", r);
        true
    } else {
        log::error!("  FAIL: expected {}, got {}", text.len(), r);
        false
    }
}

/// Test cursor state: set a position, read it back.
pub fn test_cursor_round_trip() -> bool {
    log::info!("TEST: cursor set/get round trip");

    let me = tcb::current();
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::SetCursorPos;
    msg.payload = MsgPayload::Cursor { row: 7, col: 11 };
    let r = sched::context_switch(SwitchOp::SendMsg);
    if r != 0 {
        log::error!("  FAIL: set_cursor returned {}", r);
        return false;
    }

    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::GetCursorPos;
    msg.payload = MsgPayload::None;
    let r = sched::context_switch(SwitchOp::SendMsg);
    if r != 0 {
        log::error!("  FAIL: get_cursor returned {}", r);
        return false;
    }

    let msg = unsafe { &*me.msg() };
    match msg.payload {
        MsgPayload::Cursor { row: 7, col: 11 } => {
            log::info!("  PASS: cursor came back as (7, 11)");
            true
        }
        MsgPayload::Cursor { row, col } => {
            log::error!("  FAIL: cursor came back as ({}, {})", row, col);
            false
        }
        _ => {
            log::error!("  FAIL: reply without cursor payload");
            false
        }
    }
}

/// Test that an out-of-range color is rejected by the manager.
pub fn test_set_term_color_invalid() -> bool {
    log::info!("TEST: out-of-range terminal color");

    let me = tcb::current();
    let msg = unsafe { &mut *me.msg() };
    msg.kind = MsgKind::SetTermColor;
    msg.payload = MsgPayload::Color { color: 0x1ff };
    let r = sched::context_switch(SwitchOp::SendMsg);

    if r == EINVAL {
        log::info!("  PASS: color rejected with EINVAL");
        true
    } else {
        log::error!("  FAIL: expected EINVAL, got {}", r);
        false
    }
}

pub fn run() -> (u32, u32) {
    let mut passed = 0;
    let mut failed = 0;
    for result in [
        test_print_round_trip(),
        test_cursor_round_trip(),
        test_set_term_color_invalid(),
    ] {
        if result {
            passed += 1;
        } else {
            failed += 1;
        }
    }
    (passed, failed)
}
