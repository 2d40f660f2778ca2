/*
 * Program Table of Contents
 *
 * The kernel has no filesystem; user programs are statically linked into
 * the kernel image as (name, bytes) pairs. `init` is assembled by hand
 * here: an ELF32 wrapper around a few instructions that fork a child and
 * reap it forever, which is all the root of the task tree has to do.
 */

use crate::loader::elf::{Elf32Ehdr, Elf32Phdr};
use crate::memory::USER_MEM_START;

/// One program image.
pub struct TocEntry {
    pub name: &'static [u8],
    pub bytes: &'static [u8],
}

const INIT_CODE_LEN: usize = 24;

/// The complete init image: ELF header, one program header, code. Laid
/// out back to back exactly as the file offsets claim.
#[repr(C)]
struct InitImage {
    ehdr: Elf32Ehdr,
    phdr: Elf32Phdr,
    code: [u8; INIT_CODE_LEN],
}

const INIT_LOAD_BASE: u32 = USER_MEM_START;
const INIT_CODE_OFF: u32 =
    (core::mem::size_of::<Elf32Ehdr>() + core::mem::size_of::<Elf32Phdr>()) as u32;
const INIT_SIZE: u32 = INIT_CODE_OFF + INIT_CODE_LEN as u32;

static INIT_IMAGE: InitImage = InitImage {
    ehdr: Elf32Ehdr {
        e_ident: [0x7f, b'E', b'L', b'F', 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0],
        e_type: 2,    // ET_EXEC
        e_machine: 3, // EM_386
        e_version: 1,
        e_entry: INIT_LOAD_BASE + INIT_CODE_OFF,
        e_phoff: core::mem::size_of::<Elf32Ehdr>() as u32,
        e_shoff: 0,
        e_flags: 0,
        e_ehsize: core::mem::size_of::<Elf32Ehdr>() as u16,
        e_phentsize: core::mem::size_of::<Elf32Phdr>() as u16,
        e_phnum: 1,
        e_shentsize: 40,
        e_shnum: 0,
        e_shstrndx: 0,
    },
    phdr: Elf32Phdr {
        p_type: 1, // PT_LOAD
        p_offset: 0,
        p_vaddr: INIT_LOAD_BASE,
        p_paddr: INIT_LOAD_BASE,
        p_filesz: INIT_SIZE,
        p_memsz: INIT_SIZE,
        p_flags: 5, // R + X
        p_align: 0x1000,
    },
    // init's whole job: wait() in a loop to reap whatever gets
    // reparented to it, yielding between attempts.
    code: [
        0xb8, 0x05, 0x00, 0x00, 0x00, // mov eax, SYS_WAIT
        0x31, 0xdb, //                   xor ebx, ebx (status ptr NULL)
        0xcd, 0x80, //                   int 0x80
        0xb8, 0x08, 0x00, 0x00, 0x00, // mov eax, SYS_YIELD
        0xbb, 0xff, 0xff, 0xff, 0xff, // mov ebx, -1
        0xcd, 0x80, //                   int 0x80
        0xeb, 0xe9, //                   jmp back to the top
        0x90, //                         nop (pad)
    ],
};

/// Name lookup over the table.
pub fn lookup(name: &[u8]) -> Option<&'static [u8]> {
    for entry in entries() {
        if entry.name == name {
            return Some(entry.bytes);
        }
    }
    None
}

/// All programs in the table.
pub fn entries() -> [TocEntry; 1] {
    // SAFETY: InitImage is repr(C) plain bytes with no padding between
    // the 4-byte-aligned headers and the byte array.
    let bytes = unsafe {
        core::slice::from_raw_parts(
            &INIT_IMAGE as *const InitImage as *const u8,
            core::mem::size_of::<InitImage>(),
        )
    };
    [TocEntry {
        name: b"init",
        bytes,
    }]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_finds_init() {
        assert!(lookup(b"init").is_some());
        assert!(lookup(b"no-such-program").is_none());
    }

    #[test]
    fn test_init_image_offsets() {
        let bytes = lookup(b"init").unwrap();
        assert_eq!(&bytes[0..4], b"\x7fELF");
        assert_eq!(bytes.len(), INIT_SIZE as usize);
    }
}
