/*
 * IDT Wiring
 *
 * 256-entry interrupt descriptor table shared by all CPUs. Exceptions
 * 0..19, the timer and keyboard vectors, and the syscall gate all funnel
 * through one assembly stub that builds a full trap frame and calls the
 * Rust dispatcher.
 *
 * The syscall gate is an interrupt gate with DPL 3 so user code can reach
 * it; everything else is DPL 0.
 */

use crate::arch::gdt::KERNEL_CS;
use crate::arch::smp::TIMER_VECTOR;

pub const KEYBOARD_VECTOR: u8 = 0x21;
pub const SYSCALL_VECTOR: u8 = 0x80;

/// Everything the stub pushed, plus what the CPU pushed. Field order
/// matches the stack layout, lowest address first.
#[repr(C)]
pub struct TrapFrame {
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    // pusha block
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_dummy: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub vector: u32,
    pub error_code: u32,
    // hardware frame
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    // present only when the trap came from user mode
    pub user_esp: u32,
    pub user_ss: u32,
}

impl TrapFrame {
    /// Did this trap arrive from ring 3?
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// The trap frame a user-mode entry pushed on `stack_top`.
    ///
    /// Ring-crossing traps always start from TSS esp0, which the context
    /// switcher keeps at the thread's kernel-stack top, so the frame
    /// position is fixed.
    pub fn on_stack(stack_top: u32) -> *mut TrapFrame {
        (stack_top - core::mem::size_of::<TrapFrame>() as u32) as *mut TrapFrame
    }
}

#[cfg(target_arch = "x86")]
unsafe extern "C" {
    /// Leave the kernel through the given trap frame. Never returns.
    pub fn trap_return_to(frame: *mut TrapFrame) -> !;
}

#[cfg(not(target_arch = "x86"))]
pub unsafe fn trap_return_to(_frame: *mut TrapFrame) -> ! {
    unreachable!("trap return off target")
}

#[derive(Clone, Copy)]
#[repr(C, packed)]
struct IdtEntry {
    offset_low: u16,
    selector: u16,
    zero: u8,
    type_attr: u8,
    offset_high: u16,
}

impl IdtEntry {
    const fn missing() -> Self {
        Self {
            offset_low: 0,
            selector: 0,
            zero: 0,
            type_attr: 0,
            offset_high: 0,
        }
    }

    fn gate(handler: u32, dpl: u8) -> Self {
        Self {
            offset_low: handler as u16,
            selector: KERNEL_CS,
            zero: 0,
            // present | 32-bit interrupt gate | dpl
            type_attr: 0x8e | (dpl << 5),
            offset_high: (handler >> 16) as u16,
        }
    }
}

static mut IDT: [IdtEntry; 256] = [IdtEntry::missing(); 256];

// One stub per wired vector. Vectors 8, 10-14 and 17 push an error code;
// the rest get a zero pushed to keep the frame uniform.
#[cfg(target_arch = "x86")]
macro_rules! trap_stub {
    ($name:ident, $vector:expr, err) => {
        core::arch::global_asm!(
            concat!(".global ", stringify!($name)),
            concat!(stringify!($name), ":"),
            concat!("push ", stringify!($vector)),
            "jmp trap_common",
        );
    };
    ($name:ident, $vector:expr) => {
        core::arch::global_asm!(
            concat!(".global ", stringify!($name)),
            concat!(stringify!($name), ":"),
            "push 0",
            concat!("push ", stringify!($vector)),
            "jmp trap_common",
        );
    };
}

#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    // Common trap path. On entry the stack holds: error code, vector,
    // then the hardware frame. The error code and vector were pushed in
    // reversed positions by the stubs, so the frame sees vector below
    // error_code.
    ".global trap_common",
    "trap_common:",
    "pusha",
    "push ds",
    "push es",
    "push fs",
    "push gs",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov fs, ax",
    "mov gs, ax",
    "push esp",
    "call trap_dispatch",
    "add esp, 4",
    ".global trap_restore",
    "trap_restore:",
    "pop gs",
    "pop fs",
    "pop es",
    "pop ds",
    "popa",
    "add esp, 8", // drop vector + error code
    "iretd",
    // trap_return_to(frame: *mut TrapFrame) -> !
    //
    // Unwind through an arbitrary trap frame instead of the one on the
    // current call path. Fork children leave the kernel this way: their
    // copied trap frame is unwound directly, with no Rust frames of the
    // parent's in between.
    ".global trap_return_to",
    "trap_return_to:",
    "mov esp, [esp + 4]",
    "jmp trap_restore",
);

#[cfg(target_arch = "x86")]
mod stubs {
    trap_stub!(trap_de, 0);
    trap_stub!(trap_db, 1);
    trap_stub!(trap_nmi, 2);
    trap_stub!(trap_bp, 3);
    trap_stub!(trap_of, 4);
    trap_stub!(trap_br, 5);
    trap_stub!(trap_ud, 6);
    trap_stub!(trap_nm, 7);
    trap_stub!(trap_df, 8, err);
    trap_stub!(trap_cso, 9);
    trap_stub!(trap_ts, 10, err);
    trap_stub!(trap_np, 11, err);
    trap_stub!(trap_ss, 12, err);
    trap_stub!(trap_gp, 13, err);
    trap_stub!(trap_pf, 14, err);
    trap_stub!(trap_mf, 16);
    trap_stub!(trap_ac, 17, err);
    trap_stub!(trap_mc, 18);
    trap_stub!(trap_xf, 19);
    trap_stub!(trap_timer, 0x20);
    trap_stub!(trap_kbd, 0x21);
    trap_stub!(trap_syscall, 0x80);
}

#[cfg(target_arch = "x86")]
unsafe extern "C" {
    fn trap_de();
    fn trap_db();
    fn trap_nmi();
    fn trap_bp();
    fn trap_of();
    fn trap_br();
    fn trap_ud();
    fn trap_nm();
    fn trap_df();
    fn trap_cso();
    fn trap_ts();
    fn trap_np();
    fn trap_ss();
    fn trap_gp();
    fn trap_pf();
    fn trap_mf();
    fn trap_ac();
    fn trap_mc();
    fn trap_xf();
    fn trap_timer();
    fn trap_kbd();
    fn trap_syscall();
}

/// Build the IDT. Manager-only, before interrupts are enabled anywhere.
#[cfg(target_arch = "x86")]
pub fn init() {
    let set = |idt: &mut [IdtEntry; 256], v: u8, h: unsafe extern "C" fn(), dpl: u8| {
        idt[v as usize] = IdtEntry::gate(h as usize as u32, dpl);
    };
    unsafe {
        let idt = &mut *(&raw mut IDT);
        set(idt, 0, trap_de, 0);
        set(idt, 1, trap_db, 0);
        set(idt, 2, trap_nmi, 0);
        set(idt, 3, trap_bp, 0);
        set(idt, 4, trap_of, 0);
        set(idt, 5, trap_br, 0);
        set(idt, 6, trap_ud, 0);
        set(idt, 7, trap_nm, 0);
        set(idt, 8, trap_df, 0);
        set(idt, 9, trap_cso, 0);
        set(idt, 10, trap_ts, 0);
        set(idt, 11, trap_np, 0);
        set(idt, 12, trap_ss, 0);
        set(idt, 13, trap_gp, 0);
        set(idt, 14, trap_pf, 0);
        set(idt, 16, trap_mf, 0);
        set(idt, 17, trap_ac, 0);
        set(idt, 18, trap_mc, 0);
        set(idt, 19, trap_xf, 0);
        set(idt, TIMER_VECTOR, trap_timer, 0);
        set(idt, KEYBOARD_VECTOR, trap_kbd, 0);
        set(idt, SYSCALL_VECTOR, trap_syscall, 3);
    }
    log::info!("IDT built: exceptions, timer, keyboard, syscall gate");
}

#[cfg(not(target_arch = "x86"))]
pub fn init() {}

/// Load the shared IDT on the calling CPU.
pub fn load_on_this_cpu() {
    #[cfg(target_arch = "x86")]
    unsafe {
        let descr = x86::dtables::DescriptorTablePointer {
            limit: (core::mem::size_of::<[IdtEntry; 256]>() - 1) as u16,
            base: &raw const IDT as *const IdtEntry,
        };
        x86::dtables::lidt(&descr);
    }
}
