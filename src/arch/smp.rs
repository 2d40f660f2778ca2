/*
 * SMP Bring-Up and Local APIC
 *
 * CPU identity, AP startup and the per-CPU timer. The local APIC pokes
 * here are the narrow hardware interface the rest of the kernel consumes;
 * everything above deals only in CPU ids.
 *
 * CPU 0 is the manager. It parks its dispatch loop on the bus; the other
 * CPUs run user threads. APIC ids are assumed to be contiguous from zero,
 * which holds on the virtual machines this kernel targets.
 */

use core::sync::atomic::{AtomicUsize, Ordering};

/// Upper bound on supported CPUs; actual count is detected at boot.
pub const MAX_CPUS: usize = 8;

/// Timer interrupt vector, shared by the PIT (manager) and the local APIC
/// timer (workers).
pub const TIMER_VECTOR: u8 = 0x20;

/// CPU identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuId(pub u32);

impl CpuId {
    pub fn is_manager(self) -> bool {
        self.0 == 0
    }
}

static CPU_COUNT: AtomicUsize = AtomicUsize::new(1);
static CPUS_ONLINE: AtomicUsize = AtomicUsize::new(1);

/// Id of the calling CPU, from the APIC id reported by cpuid.
///
/// ebx is saved by hand because LLVM reserves it on this target.
#[cfg(target_arch = "x86")]
pub fn cpu_id() -> CpuId {
    let id: u32;
    unsafe {
        core::arch::asm!(
            "push ebx",
            "mov eax, 1",
            "cpuid",
            "mov eax, ebx",
            "pop ebx",
            out("eax") id,
            out("ecx") _,
            out("edx") _,
        );
    }
    CpuId(id >> 24)
}

#[cfg(not(target_arch = "x86"))]
pub fn cpu_id() -> CpuId {
    CpuId(0)
}

pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Acquire)
}

pub fn set_cpu_count(n: usize) {
    CPU_COUNT.store(n.min(MAX_CPUS), Ordering::Release);
}

/// A worker reports itself alive at the end of its bring-up.
pub fn mark_online() {
    CPUS_ONLINE.fetch_add(1, Ordering::AcqRel);
}

pub fn online() -> usize {
    CPUS_ONLINE.load(Ordering::Acquire)
}

// ── Local APIC ──────────────────────────────────────────────────

const LAPIC_BASE: u32 = 0xfee0_0000;

const LAPIC_SVR: u32 = 0x0f0;
const LAPIC_EOI: u32 = 0x0b0;
const LAPIC_ICR_LOW: u32 = 0x300;
const LAPIC_ICR_HIGH: u32 = 0x310;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_TIMER_INIT: u32 = 0x380;
const LAPIC_TIMER_DIV: u32 = 0x3e0;

fn lapic_write(reg: u32, value: u32) {
    unsafe {
        core::ptr::write_volatile((LAPIC_BASE + reg) as *mut u32, value);
    }
}

fn lapic_read(reg: u32) -> u32 {
    unsafe { core::ptr::read_volatile((LAPIC_BASE + reg) as *const u32) }
}

/// Enable the local APIC on the calling CPU and start its timer in
/// periodic mode on the shared timer vector.
///
/// The initial count approximates the PIT's 100 Hz on the bus clocks of
/// the machines this kernel targets; precise calibration is a hardware
/// concern outside this kernel's core.
pub fn init_lapic_timer() {
    lapic_write(LAPIC_SVR, 0x100 | 0xff); // APIC enable, spurious vector 0xff
    lapic_write(LAPIC_TIMER_DIV, 0b1011); // divide by 1
    lapic_write(LAPIC_LVT_TIMER, (1 << 17) | TIMER_VECTOR as u32); // periodic
    lapic_write(LAPIC_TIMER_INIT, 10_000_000);
}

/// Acknowledge the current interrupt at the local APIC.
pub fn lapic_eoi() {
    lapic_write(LAPIC_EOI, 0);
}

/// Physical page the AP real-mode trampoline is copied to. Must be below
/// 1 MiB and page-aligned; the SIPI vector encodes its page number.
const TRAMPOLINE_PHYS: u32 = 0x7000;

#[cfg(target_arch = "x86")]
unsafe extern "C" {
    static ap_tramp_start: u8;
    static ap_tramp_end: u8;
}

/// Wake every AP: copy the real-mode trampoline into low memory and send
/// INIT followed by STARTUP to each APIC id, then wait for the workers to
/// report in.
#[cfg(target_arch = "x86")]
pub fn boot_aps() {
    let tramp_len = unsafe {
        (&raw const ap_tramp_end as usize) - (&raw const ap_tramp_start as usize)
    };
    unsafe {
        core::ptr::copy_nonoverlapping(
            &raw const ap_tramp_start,
            TRAMPOLINE_PHYS as *mut u8,
            tramp_len,
        );
    }

    let sipi_vector = (TRAMPOLINE_PHYS >> 12) & 0xff;
    for apic_id in 1..cpu_count() as u32 {
        lapic_write(LAPIC_ICR_HIGH, apic_id << 24);
        lapic_write(LAPIC_ICR_LOW, 0x0000_4500); // INIT, assert
        busy_wait();
        for _ in 0..2 {
            lapic_write(LAPIC_ICR_HIGH, apic_id << 24);
            lapic_write(LAPIC_ICR_LOW, 0x0000_4600 | sipi_vector); // STARTUP
            busy_wait();
        }
    }

    while online() < cpu_count() {
        core::hint::spin_loop();
    }
    log::info!("all {} CPUs online", online());
}

#[cfg(not(target_arch = "x86"))]
pub fn boot_aps() {
    unreachable!("AP bring-up off target")
}

fn busy_wait() {
    for _ in 0..100_000 {
        core::hint::spin_loop();
    }
    let _ = lapic_read(LAPIC_ICR_LOW);
}

// The 16-bit trampoline: real mode -> protected mode -> ap_start32. The
// AP picks its kernel stack from the per-CPU boot stack table published
// by the BSP before the SIPI.
#[cfg(target_arch = "x86")]
core::arch::global_asm!(
    ".code16",
    ".global ap_tramp_start",
    "ap_tramp_start:",
    "cli",
    "xor ax, ax",
    "mov ds, ax",
    "lgdt [0x7000 + ap_tramp_gdt_desc - ap_tramp_start]",
    "mov eax, cr0",
    "or eax, 1",
    "mov cr0, eax",
    "ljmp 0x8, 0x7000 + ap_tramp_32 - ap_tramp_start",
    ".align 8",
    "ap_tramp_gdt:",
    ".quad 0",
    ".quad 0x00cf9a000000ffff", // flat 32-bit code
    ".quad 0x00cf92000000ffff", // flat 32-bit data
    "ap_tramp_gdt_desc:",
    ".word 23",
    ".long 0x7000 + ap_tramp_gdt - ap_tramp_start",
    ".code32",
    "ap_tramp_32:",
    "mov ax, 0x10",
    "mov ds, ax",
    "mov es, ax",
    "mov ss, ax",
    "mov fs, ax",
    "mov gs, ax",
    // APIC id -> boot stack table index
    "mov eax, 1",
    "cpuid",
    "shr ebx, 24",
    "mov eax, [AP_BOOT_STACKS + ebx * 4]",
    "mov esp, eax",
    "push ebx",
    "call ap_main",
    "ap_tramp_end:",
    ".global ap_tramp_end",
);

/// Boot stack tops for each AP, filled by the BSP before `boot_aps`.
#[unsafe(no_mangle)]
pub static mut AP_BOOT_STACKS: [u32; MAX_CPUS] = [0; MAX_CPUS];
