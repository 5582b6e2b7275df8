pub mod elf;

use std::io::{self, Cursor, Read};

use byteorder::{ReadBytesExt, LE};
use goblin::elf::header::{
    EI_CLASS, EI_DATA, ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFMAG, SELFMAG, SIZEOF_IDENT,
};

use crate::error::{ElfError, Result};
use crate::sections::{ProgramHeader, SectionHeader};

pub use elf::{Elf32, Elf64};

/// Address width of an ELF image, taken from `e_ident[EI_CLASS]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElfClass {
    Elf32,
    Elf64,
}

impl ElfClass {
    /// Validates the identification prefix and returns the class it declares.
    pub fn from_ident(ident: &[u8]) -> Result<Self> {
        if ident.len() < SIZEOF_IDENT || &ident[..SELFMAG] != ELFMAG {
            return Err(ElfError::format("elf magic doesn't match"));
        }
        if ident[EI_DATA] != ELFDATA2LSB {
            return Err(ElfError::format(format!(
                "unsupported data encoding {}",
                ident[EI_DATA]
            )));
        }
        match ident[EI_CLASS] {
            ELFCLASS32 => Ok(ElfClass::Elf32),
            ELFCLASS64 => Ok(ElfClass::Elf64),
            other => Err(ElfError::format(format!("wrong elf class {other}"))),
        }
    }

    /// Size in bytes of a target address.
    pub fn pointer_size(self) -> u8 {
        match self {
            ElfClass::Elf32 => 4,
            ElfClass::Elf64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        u32::from(self.pointer_size()) * 8
    }
}

/// The ELF file header, widened to 64-bit fields regardless of class.
///
/// Mirrors `Elf32_Ehdr` / `Elf64_Ehdr`; see the
/// [ELF specification](https://refspecs.linuxfoundation.org/elf/elf.pdf).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub class: ElfClass,

    /// Object file type (`ET_EXEC`, `ET_DYN`, ...).
    pub e_type: u16,

    /// Target architecture (`EM_X86_64`, `EM_AARCH64`, ...).
    pub e_machine: u16,

    /// Virtual address of the program entry point.
    pub e_entry: u64,

    /// File offset of the program header table.
    pub e_phoff: u64,

    /// File offset of the section header table.
    pub e_shoff: u64,

    pub e_flags: u32,
    pub e_ehsize: u16,

    /// Size of one program header table entry.
    pub e_phentsize: u16,
    pub e_phnum: u16,

    /// Size of one section header table entry.
    pub e_shentsize: u16,
    pub e_shnum: u16,

    /// Index of the section holding section names.
    pub e_shstrndx: u16,
}

impl FileHeader {
    pub fn is_64(&self) -> bool {
        self.class == ElfClass::Elf64
    }

    /// Returns true for `ET_EXEC` images.
    pub fn is_executable(&self) -> bool {
        self.e_type == goblin::elf::header::ET_EXEC
    }

    /// File offset of the `index`-th section header table entry, or `None`
    /// if it does not fit in a `u64`.
    pub fn section_header_offset(&self, index: u16) -> Option<u64> {
        table_entry_offset(self.e_shoff, index, self.e_shentsize)
    }

    /// File offset of the `index`-th program header table entry, or `None`
    /// if it does not fit in a `u64`.
    pub fn program_header_offset(&self, index: u16) -> Option<u64> {
        table_entry_offset(self.e_phoff, index, self.e_phentsize)
    }
}

fn table_entry_offset(table: u64, index: u16, entry_size: u16) -> Option<u64> {
    u64::from(index)
        .checked_mul(u64::from(entry_size))
        .and_then(|rel| table.checked_add(rel))
}

/// Field layout of one ELF class.
///
/// Header parsing is written once against this trait; the implementors only
/// say how wide an address/offset word is and where the program header
/// fields sit.
pub trait Layout {
    const CLASS: ElfClass;

    /// Size of the file header, `e_ident` included.
    const EHDR_SIZE: usize;

    /// Size of one section header entry.
    const SHDR_SIZE: usize;

    /// Size of one program header entry.
    const PHDR_SIZE: usize;

    /// Reads one address/offset/size word.
    fn read_word<R: Read>(r: &mut R) -> io::Result<u64>;

    /// Decodes a program header entry; field order differs between classes.
    fn program_header(bytes: &[u8]) -> io::Result<ProgramHeader>;

    fn file_header(bytes: &[u8]) -> io::Result<FileHeader> {
        let mut cur = Cursor::new(bytes);
        let mut e_ident = [0u8; SIZEOF_IDENT];
        cur.read_exact(&mut e_ident)?;

        let e_type = cur.read_u16::<LE>()?;
        let e_machine = cur.read_u16::<LE>()?;
        // e_version
        cur.read_u32::<LE>()?;

        Ok(FileHeader {
            class: Self::CLASS,
            e_type,
            e_machine,
            e_entry: Self::read_word(&mut cur)?,
            e_phoff: Self::read_word(&mut cur)?,
            e_shoff: Self::read_word(&mut cur)?,
            e_flags: cur.read_u32::<LE>()?,
            e_ehsize: cur.read_u16::<LE>()?,
            e_phentsize: cur.read_u16::<LE>()?,
            e_phnum: cur.read_u16::<LE>()?,
            e_shentsize: cur.read_u16::<LE>()?,
            e_shnum: cur.read_u16::<LE>()?,
            e_shstrndx: cur.read_u16::<LE>()?,
        })
    }

    /// Decodes a section header entry. The name is left empty and its offset
    /// into the name string table is returned alongside.
    fn section_header(bytes: &[u8]) -> io::Result<(u32, SectionHeader)> {
        let mut cur = Cursor::new(bytes);
        let sh_name = cur.read_u32::<LE>()?;
        let kind = cur.read_u32::<LE>()?;
        let flags = Self::read_word(&mut cur)?;
        let addr = Self::read_word(&mut cur)?;
        let offset = Self::read_word(&mut cur)?;
        let size = Self::read_word(&mut cur)?;

        Ok((
            sh_name,
            SectionHeader {
                name: String::new(),
                kind,
                flags,
                addr,
                offset,
                size,
            },
        ))
    }
}
