/*
 * ELF32 Executable Parsing
 *
 * Just enough of the ELF format to load the statically linked programs in
 * the built-in table of contents: header validation and the PT_LOAD
 * program headers. No dynamic linking, no relocation, no sections.
 */

use alloc::vec::Vec;

pub const ET_EXEC: u16 = 2;
pub const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;

pub const PF_W: u32 = 2;

/// ELF32 file header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF32 program header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// One loadable piece of the image.
#[derive(Debug, Clone, Copy)]
pub struct Segment {
    pub vaddr: u32,
    pub offset: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub writable: bool,
}

/// Parsed executable: entry point plus its loadable segments.
pub struct LoadedElf {
    pub entry: u32,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    Truncated,
    BadMagic,
    NotExecutable,
    WrongMachine,
    BadProgramHeader,
}

/// Validate an image and extract its load view.
pub fn parse(image: &[u8]) -> Result<LoadedElf, ElfError> {
    if image.len() < core::mem::size_of::<Elf32Ehdr>() {
        return Err(ElfError::Truncated);
    }
    // SAFETY: length checked; Elf32Ehdr is plain old data and we read
    // unaligned.
    let ehdr = unsafe { core::ptr::read_unaligned(image.as_ptr() as *const Elf32Ehdr) };

    if &ehdr.e_ident[0..4] != b"\x7fELF" {
        return Err(ElfError::BadMagic);
    }
    // 32-bit, little-endian, version 1.
    if ehdr.e_ident[4] != 1 || ehdr.e_ident[5] != 1 {
        return Err(ElfError::BadMagic);
    }
    if ehdr.e_type != ET_EXEC {
        return Err(ElfError::NotExecutable);
    }
    if ehdr.e_machine != EM_386 {
        return Err(ElfError::WrongMachine);
    }
    if ehdr.e_phentsize as usize != core::mem::size_of::<Elf32Phdr>() || ehdr.e_phnum == 0 {
        return Err(ElfError::BadProgramHeader);
    }

    let ph_end = ehdr.e_phoff as usize
        + ehdr.e_phnum as usize * core::mem::size_of::<Elf32Phdr>();
    if ph_end > image.len() {
        return Err(ElfError::Truncated);
    }

    let mut segments = Vec::new();
    for i in 0..ehdr.e_phnum as usize {
        let off = ehdr.e_phoff as usize + i * core::mem::size_of::<Elf32Phdr>();
        // SAFETY: bounds checked above.
        let phdr = unsafe {
            core::ptr::read_unaligned(image.as_ptr().add(off) as *const Elf32Phdr)
        };
        if phdr.p_type != PT_LOAD {
            continue;
        }
        if phdr.p_filesz > phdr.p_memsz {
            return Err(ElfError::BadProgramHeader);
        }
        if (phdr.p_offset as usize + phdr.p_filesz as usize) > image.len() {
            return Err(ElfError::Truncated);
        }
        segments.push(Segment {
            vaddr: phdr.p_vaddr,
            offset: phdr.p_offset,
            filesz: phdr.p_filesz,
            memsz: phdr.p_memsz,
            writable: phdr.p_flags & PF_W != 0,
        });
    }
    if segments.is_empty() {
        return Err(ElfError::BadProgramHeader);
    }

    Ok(LoadedElf {
        entry: ehdr.e_entry,
        segments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::toc;

    #[test]
    fn test_parse_builtin_init() {
        let image = toc::lookup(b"init").expect("init missing from TOC");
        let elf = parse(image).expect("built-in init must parse");
        assert_eq!(elf.segments.len(), 1);
        assert!(elf.entry >= elf.segments[0].vaddr);
        assert!(elf.entry < elf.segments[0].vaddr + elf.segments[0].memsz);
    }

    #[test]
    fn test_reject_bad_magic() {
        let junk = [0u8; 64];
        assert!(matches!(parse(&junk), Err(ElfError::BadMagic)));
    }

    #[test]
    fn test_reject_truncated() {
        let image = toc::lookup(b"init").unwrap();
        assert!(matches!(parse(&image[..20]), Err(ElfError::Truncated)));
    }
}
