/*
 * GDT and TSS Wiring
 *
 * Flat 32-bit segmentation: kernel and user code/data segments plus one
 * TSS per CPU. The only TSS field that matters at runtime is esp0, which
 * the context switcher repoints at the incoming thread's kernel stack top
 * before every switch, so a trap from user mode lands on the right stack.
 */

use core::mem::size_of;

use crate::arch::smp::MAX_CPUS;

pub const KERNEL_CS: u16 = 0x08;
pub const KERNEL_DS: u16 = 0x10;
pub const USER_CS: u16 = 0x1b; // selector 3 | RPL 3
pub const USER_DS: u16 = 0x23; // selector 4 | RPL 3

const TSS_FIRST: usize = 5;

/// 32-bit task state segment. Only esp0/ss0 are used; hardware task
/// switching is not.
#[repr(C, packed)]
struct Tss {
    link: u32,
    esp0: u32,
    ss0: u32,
    unused: [u32; 22],
    iomap_base: u16,
    trailer: u16,
}

impl Tss {
    const fn new() -> Self {
        Self {
            link: 0,
            esp0: 0,
            ss0: KERNEL_DS as u32,
            unused: [0; 22],
            iomap_base: size_of::<Tss>() as u16,
            trailer: 0,
        }
    }
}

static mut TSS: [Tss; MAX_CPUS] = [const { Tss::new() }; MAX_CPUS];

/// GDT: null, kernel code/data, user code/data, one TSS slot per CPU.
static mut GDT: [u64; TSS_FIRST + MAX_CPUS] = [0; TSS_FIRST + MAX_CPUS];

fn segment_descriptor(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    let mut d: u64 = 0;
    d |= (limit & 0xffff) as u64;
    d |= ((base & 0xffff) as u64) << 16;
    d |= (((base >> 16) & 0xff) as u64) << 32;
    d |= (access as u64) << 40;
    d |= (((limit >> 16) & 0xf) as u64) << 48;
    d |= ((flags & 0xf) as u64) << 52;
    d |= (((base >> 24) & 0xff) as u64) << 56;
    d
}

/// Build the shared GDT. Manager-only, before any other CPU starts.
pub fn init() {
    unsafe {
        let gdt = &mut *(&raw mut GDT);
        gdt[0] = 0;
        gdt[1] = segment_descriptor(0, 0xfffff, 0x9a, 0xc); // kernel code
        gdt[2] = segment_descriptor(0, 0xfffff, 0x92, 0xc); // kernel data
        gdt[3] = segment_descriptor(0, 0xfffff, 0xfa, 0xc); // user code
        gdt[4] = segment_descriptor(0, 0xfffff, 0xf2, 0xc); // user data
        for cpu in 0..MAX_CPUS {
            let base = &raw const TSS[cpu] as u32;
            gdt[TSS_FIRST + cpu] =
                segment_descriptor(base, size_of::<Tss>() as u32 - 1, 0x89, 0x0);
        }
    }
    log::info!("GDT built: {} segments + {} TSS slots", TSS_FIRST, MAX_CPUS);
}

/// Load the GDT, reload segments, and load this CPU's TSS.
pub fn load_on_this_cpu(cpu: usize) {
    #[cfg(target_arch = "x86")]
    unsafe {
        let descr = x86::dtables::DescriptorTablePointer {
            limit: (size_of::<[u64; TSS_FIRST + MAX_CPUS]>() - 1) as u16,
            base: &raw const GDT as *const u64,
        };
        x86::dtables::lgdt(&descr);
        core::arch::asm!(
            "mov ax, {kds}",
            "mov ds, ax",
            "mov es, ax",
            "mov ss, ax",
            "mov fs, ax",
            "mov gs, ax",
            // far return to reload cs
            "push {kcs}",
            "lea eax, [2f]",
            "push eax",
            "retf",
            "2:",
            kds = const KERNEL_DS as u32,
            kcs = const KERNEL_CS as u32,
            out("eax") _,
        );
        let tss_sel = ((TSS_FIRST + cpu) * 8) as u16;
        x86::task::load_tr(x86::segmentation::SegmentSelector::from_raw(tss_sel));
    }
    #[cfg(not(target_arch = "x86"))]
    let _ = cpu;
}

/// Point this CPU's TSS esp0 at a kernel stack top.
pub fn set_esp0(cpu: usize, esp0: u32) {
    unsafe {
        (&raw mut TSS[cpu].esp0).write_volatile(esp0);
    }
}
