use std::io::{self, Cursor, Read};

use byteorder::{ReadBytesExt, LE};

use crate::header::{ElfClass, Layout};
use crate::sections::ProgramHeader;

/// `ELFCLASS32` layout: 4-byte addresses and offsets.
///
/// Program header (`Elf32_Phdr`) field order:
/// `p_type, p_offset, p_vaddr, p_paddr, p_filesz, p_memsz, p_flags, p_align`.
#[derive(Debug, Clone, Copy)]
pub struct Elf32;

/// `ELFCLASS64` layout: 8-byte addresses and offsets.
///
/// Program header (`Elf64_Phdr`) field order:
/// `p_type, p_flags, p_offset, p_vaddr, p_paddr, p_filesz, p_memsz, p_align`.
/// `p_flags` moved up so the 8-byte fields stay aligned.
#[derive(Debug, Clone, Copy)]
pub struct Elf64;

impl Layout for Elf32 {
    const CLASS: ElfClass = ElfClass::Elf32;
    const EHDR_SIZE: usize = goblin::elf32::header::SIZEOF_EHDR;
    const SHDR_SIZE: usize = goblin::elf32::section_header::SIZEOF_SHDR;
    const PHDR_SIZE: usize = goblin::elf32::program_header::SIZEOF_PHDR;

    fn read_word<R: Read>(r: &mut R) -> io::Result<u64> {
        r.read_u32::<LE>().map(u64::from)
    }

    fn program_header(bytes: &[u8]) -> io::Result<ProgramHeader> {
        let mut cur = Cursor::new(bytes);
        let kind = cur.read_u32::<LE>()?;
        let offset = Self::read_word(&mut cur)?;
        let vaddr = Self::read_word(&mut cur)?;
        let paddr = Self::read_word(&mut cur)?;
        let filesz = Self::read_word(&mut cur)?;
        let memsz = Self::read_word(&mut cur)?;
        let flags = cur.read_u32::<LE>()?;
        let align = Self::read_word(&mut cur)?;

        Ok(ProgramHeader {
            kind,
            flags,
            offset,
            vaddr,
            paddr,
            filesz,
            memsz,
            align,
        })
    }
}

impl Layout for Elf64 {
    const CLASS: ElfClass = ElfClass::Elf64;
    const EHDR_SIZE: usize = goblin::elf64::header::SIZEOF_EHDR;
    const SHDR_SIZE: usize = goblin::elf64::section_header::SIZEOF_SHDR;
    const PHDR_SIZE: usize = goblin::elf64::program_header::SIZEOF_PHDR;

    fn read_word<R: Read>(r: &mut R) -> io::Result<u64> {
        r.read_u64::<LE>()
    }

    fn program_header(bytes: &[u8]) -> io::Result<ProgramHeader> {
        let mut cur = Cursor::new(bytes);
        let kind = cur.read_u32::<LE>()?;
        let flags = cur.read_u32::<LE>()?;

        Ok(ProgramHeader {
            kind,
            flags,
            offset: Self::read_word(&mut cur)?,
            vaddr: Self::read_word(&mut cur)?,
            paddr: Self::read_word(&mut cur)?,
            filesz: Self::read_word(&mut cur)?,
            memsz: Self::read_word(&mut cur)?,
            align: Self::read_word(&mut cur)?,
        })
    }
}
