/*
 * Software Exception Handlers (swexn)
 *
 * User tasks may register a handler that runs on a user-provided stack
 * when the thread faults. The kernel deregisters the handler before
 * delivering to it, so a fault inside the handler kills the thread
 * instead of recursing.
 */

use core::mem::size_of;

use crate::arch::gdt::{USER_CS, USER_DS};
use crate::arch::idt::TrapFrame;
use crate::memory::types::VirtAddr;
use crate::memory::USER_MEM_START;
use crate::syscall::numbers::EINVAL;
use crate::task::tcb;

/// A registered handler: entry point, exception stack, opaque argument.
#[derive(Debug, Clone, Copy)]
pub struct SwexnHandler {
    pub esp3: u32,
    pub eip: u32,
    pub arg: u32,
}

/// Register dump delivered to a swexn handler. Field order is part of the
/// user ABI.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Ureg {
    pub cause: u32,
    pub cr2: u32,
    pub ds: u32,
    pub es: u32,
    pub fs: u32,
    pub gs: u32,
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub zero: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

/// Sentinel return address pushed under the handler; returning to it
/// faults, and the second, unhandled fault kills the thread.
pub const RETURN_SENTINEL: u32 = 0xdeadbeef;

/// EFLAGS bits that must match exactly in an adopted register set: bit 1
/// always set, the reserved and system bits clear, IOPL 0.
const EFLAGS_FIXED_MASK: u32 = 0xffc0_802a;
const EFLAGS_FIXED_VALUE: u32 = 0x0000_0002;
const EFLAGS_IF: u32 = 1 << 9;

impl Ureg {
    pub fn from_frame(frame: &TrapFrame, cause: u32, cr2: u32) -> Self {
        Self {
            cause,
            cr2,
            ds: frame.ds,
            es: frame.es,
            fs: frame.fs,
            gs: frame.gs,
            edi: frame.edi,
            esi: frame.esi,
            ebp: frame.ebp,
            zero: 0,
            ebx: frame.ebx,
            edx: frame.edx,
            ecx: frame.ecx,
            eax: frame.eax,
            error_code: frame.error_code,
            eip: frame.eip,
            cs: frame.cs,
            eflags: frame.eflags,
            esp: frame.user_esp,
            ss: frame.user_ss,
        }
    }
}

/// Is this register set one the kernel is willing to adopt?
pub fn adoptable(u: &Ureg) -> bool {
    let seg_ok = u.ds == USER_DS as u32
        && u.es == USER_DS as u32
        && u.fs == USER_DS as u32
        && u.gs == USER_DS as u32
        && u.ss == USER_DS as u32
        && u.cs == USER_CS as u32;
    let addr_ok = u.eip >= USER_MEM_START && u.esp >= USER_MEM_START && u.ebp >= USER_MEM_START;
    let eflags_ok =
        (u.eflags & EFLAGS_FIXED_MASK) == EFLAGS_FIXED_VALUE && (u.eflags & EFLAGS_IF) != 0;
    seg_ok && addr_ok && eflags_ok
}

/// swexn(esp3, eip, arg, newureg): install or remove the handler and
/// optionally adopt a register set for the return to user mode.
///
/// Nothing changes unless every part validates.
pub fn sys_swexn(frame: &mut TrapFrame, esp3: u32, eip: u32, arg: u32, newureg: u32) -> i32 {
    let me = tcb::current();
    let installing = esp3 != 0 && eip != 0;

    if installing && (esp3 < USER_MEM_START || eip < USER_MEM_START) {
        return EINVAL;
    }

    let adopted: Option<Ureg> = if newureg != 0 {
        let task = me.task().expect("swexn from taskless thread");
        if task
            .vm()
            .check_mem_validness(
                VirtAddr::new(newureg),
                size_of::<Ureg>() as u32,
                false,
                false,
            )
            .is_err()
        {
            return EINVAL;
        }
        let u = unsafe { core::ptr::read(newureg as *const Ureg) };
        if !adoptable(&u) {
            return EINVAL;
        }
        Some(u)
    } else {
        None
    };

    // Validation done; commit.
    unsafe {
        *me.swexn.get() = if installing {
            Some(SwexnHandler { esp3, eip, arg })
        } else {
            None
        };
    }

    if let Some(u) = adopted {
        frame.edi = u.edi;
        frame.esi = u.esi;
        frame.ebp = u.ebp;
        frame.ebx = u.ebx;
        frame.edx = u.edx;
        frame.ecx = u.ecx;
        frame.eip = u.eip;
        frame.eflags = u.eflags;
        frame.user_esp = u.esp;
        // Segments are already the user selectors; adoptable() verified
        // the ureg agrees. The returned value lands in the frame's eax
        // slot, which is how the adopted eax survives the dispatch
        // epilogue.
        return u.eax as i32;
    }
    0
}

/// Deliver a fault to the thread's registered handler, if any.
///
/// Returns false when there is no handler or the exception stack is bad;
/// the caller kills the thread then. The handler is deregistered before
/// the frame is redirected.
pub fn try_deliver(frame: &mut TrapFrame, cause: u32, cr2: u32) -> bool {
    let me = tcb::current();
    let handler = unsafe { (*me.swexn.get()).take() };
    let Some(h) = handler else {
        return false;
    };

    let ureg = Ureg::from_frame(frame, cause, cr2);
    let frame_bytes = size_of::<Ureg>() as u32 + 12;
    let base = h.esp3.wrapping_sub(frame_bytes);

    let task = me.task().expect("fault delivery without task");
    if task
        .vm()
        .check_mem_validness(VirtAddr::new(base), frame_bytes, false, true)
        .is_err()
    {
        return false;
    }

    // Stack at handler entry: sentinel return address, arg, ureg pointer,
    // then the ureg record itself.
    let ureg_ptr = base + 12;
    unsafe {
        core::ptr::write(ureg_ptr as *mut Ureg, ureg);
        core::ptr::write(base as *mut u32, RETURN_SENTINEL);
        core::ptr::write((base + 4) as *mut u32, h.arg);
        core::ptr::write((base + 8) as *mut u32, ureg_ptr);
    }

    frame.eip = h.eip;
    frame.user_esp = base;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good_ureg() -> Ureg {
        Ureg {
            cause: 14,
            cr2: 0,
            ds: USER_DS as u32,
            es: USER_DS as u32,
            fs: USER_DS as u32,
            gs: USER_DS as u32,
            edi: 0,
            esi: 0,
            ebp: 0x0200_0000,
            zero: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
            error_code: 0,
            eip: 0x0100_0100,
            cs: USER_CS as u32,
            eflags: 0x0202,
            esp: 0x0200_0000,
            ss: USER_DS as u32,
        }
    }

    #[test]
    fn test_adoptable_accepts_canonical() {
        assert!(adoptable(&good_ureg()));
    }

    #[test]
    fn test_adoptable_rejects_kernel_segments() {
        let mut u = good_ureg();
        u.cs = 0x08;
        assert!(!adoptable(&u));
    }

    #[test]
    fn test_adoptable_rejects_kernel_addresses() {
        let mut u = good_ureg();
        u.eip = 0x1000;
        assert!(!adoptable(&u));
    }

    #[test]
    fn test_adoptable_rejects_bad_eflags() {
        let mut u = good_ureg();
        u.eflags = 0x0200; // bit 1 clear
        assert!(!adoptable(&u));
        u.eflags = 0x3202; // IOPL != 0
        assert!(!adoptable(&u));
        u.eflags = 0x0002; // interrupts off
        assert!(!adoptable(&u));
    }
}
