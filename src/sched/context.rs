/*
 * Context Switch Primitive
 *
 * The saved register state of a suspended thread and the assembly that
 * swaps it. Only the callee-saved registers and the stack pointer are kept
 * here; everything else lives in the trap frame the thread pushed on its
 * own kernel stack on the way in.
 *
 * The state-machine logic that decides who runs next is in `sched`; this
 * module is the unsafe floor it stands on.
 */

use crate::task::tcb::{Tcb, KERNEL_STACK_SIZE};

/// Callee-saved register context.
///
/// Layout must match the field offsets hard-coded in the assembly below.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Context {
    pub ebx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
}

impl Context {
    pub const fn empty() -> Self {
        Self {
            ebx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eip: 0,
        }
    }
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    // context_switch_asm(old: *mut Context, new: *const Context)
    //
    // Saves the caller's callee-saved registers and resume point into
    // *old, then installs *new and jumps to its saved eip. The saved esp
    // is the value the stack pointer has after this call returns, so a
    // resumed thread continues exactly at the call site.
    ".global context_switch_asm",
    "context_switch_asm:",
    "mov eax, [esp + 4]",
    "mov edx, [esp + 8]",
    "mov [eax + 0], ebx",
    "mov [eax + 4], esi",
    "mov [eax + 8], edi",
    "mov [eax + 12], ebp",
    "lea ecx, [esp + 4]",
    "mov [eax + 16], ecx",
    "mov ecx, [esp]",
    "mov [eax + 20], ecx",
    "mov ebx, [edx + 0]",
    "mov esi, [edx + 4]",
    "mov edi, [edx + 8]",
    "mov ebp, [edx + 12]",
    "mov esp, [edx + 16]",
    "jmp dword ptr [edx + 20]",
    // context_capture_asm(ctx: *mut Context)
    //
    // Same save half only. A thread later dispatched with this context
    // resumes at this call's return with caller-saved registers
    // clobbered, exactly as the compiler already assumes across a call.
    ".global context_capture_asm",
    "context_capture_asm:",
    "mov eax, [esp + 4]",
    "mov [eax + 0], ebx",
    "mov [eax + 4], esi",
    "mov [eax + 8], edi",
    "mov [eax + 12], ebp",
    "lea ecx, [esp + 4]",
    "mov [eax + 16], ecx",
    "mov ecx, [esp]",
    "mov [eax + 20], ecx",
    "ret",
);

#[cfg(target_arch = "x86")]
unsafe extern "C" {
    /// Raw register swap. See the assembly comment for the contract.
    pub fn context_switch_asm(old: *mut Context, new: *const Context);

    /// Record the current resume point into `ctx` without switching.
    ///
    /// Execution returns here twice: once immediately, and once for every
    /// thread dispatched with the captured context. The two paths are told
    /// apart by `tcb::current()`, which follows the stack pointer.
    pub fn context_capture_asm(ctx: *mut Context);
}

// Host-test stand-ins; the switch paths never run off target.
#[cfg(not(target_arch = "x86"))]
pub unsafe fn context_switch_asm(_old: *mut Context, _new: *const Context) {
    unreachable!("context switch off target")
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn context_capture_asm(_ctx: *mut Context) {
    unreachable!("context capture off target")
}

/// Build the initial context for a brand-new kernel thread.
///
/// The prepared stack carries a fake return address and the entry
/// function's argument, laid out so `thread_bootstrap` finds them as its
/// C arguments.
pub fn prepare_initial(stack_top: u32, entry: extern "C" fn(usize) -> !, arg: usize) -> Context {
    let esp = stack_top - 12;
    unsafe {
        let p = esp as *mut u32;
        p.add(0).write(0); // fake return address
        p.add(1).write(entry as usize as u32);
        p.add(2).write(arg as u32);
    }
    Context {
        ebx: 0,
        esi: 0,
        edi: 0,
        ebp: 0,
        esp,
        eip: thread_bootstrap as usize as u32,
    }
}

/// First landing point of every new thread.
///
/// Arrives with the run-queue lock of this CPU still held by the switch
/// that dispatched us; release it, give the reaper its moment, then enter
/// the thread body with interrupts on.
extern "C" fn thread_bootstrap(entry: extern "C" fn(usize) -> !, arg: usize) -> ! {
    crate::sched::finish_switch();
    crate::arch::interrupts::enable();
    entry(arg)
}

/// Duplicate the parent's kernel stack into the child and derive the
/// child's context from the parent's captured one.
///
/// Saved base pointers that point into the parent's stack are rebased so
/// the child's frame-pointer chain walks its own copy.
///
/// # Safety
/// `captured` must be a context captured on the parent's stack in a frame
/// that is still live, and the child must not be runnable yet.
pub unsafe fn clone_stack_for_fork(parent: &Tcb, child: &Tcb, captured: &Context) {
    let src = parent.stack_base();
    let dst = child.stack_base();
    let delta = dst.wrapping_sub(src);

    unsafe {
        core::ptr::copy_nonoverlapping(
            src as *const u8,
            dst as *mut u8,
            KERNEL_STACK_SIZE as usize,
        );
    }

    let in_parent_stack = |p: u32| p >= src && p < src + KERNEL_STACK_SIZE;

    let mut ctx = *captured;
    ctx.esp = ctx.esp.wrapping_add(delta);
    if in_parent_stack(ctx.ebp) {
        ctx.ebp = ctx.ebp.wrapping_add(delta);

        // Walk the copied frame-pointer chain: each saved ebp that points
        // into the parent stack is moved by the same delta.
        let mut bp = ctx.ebp;
        while bp >= dst && bp + 4 <= dst + KERNEL_STACK_SIZE {
            let slot = bp as *mut u32;
            let saved = unsafe { slot.read() };
            if !in_parent_stack(saved) {
                break;
            }
            let rebased = saved.wrapping_add(delta);
            unsafe { slot.write(rebased) };
            bp = rebased;
        }
    }

    unsafe {
        *child.context.get() = ctx;
    }
}
