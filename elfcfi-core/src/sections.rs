use std::borrow::Cow;

use goblin::elf::program_header::{pt_to_str, PF_R, PF_W, PF_X, PT_LOAD};
use goblin::elf::section_header::sht_to_str;

/// One named entry of the section header table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionHeader {
    pub name: String,
    /// `sh_type`
    pub kind: u32,
    pub flags: u64,
    /// Virtual address of the section once mapped (`sh_addr`).
    pub addr: u64,
    /// File offset of the section contents (`sh_offset`).
    pub offset: u64,
    pub size: u64,
}

impl SectionHeader {
    pub fn type_name(&self) -> &'static str {
        sht_to_str(self.kind)
    }

    /// Returns true if `vaddr` falls inside the mapped section.
    pub fn contains(&self, vaddr: u64) -> bool {
        vaddr >= self.addr && vaddr - self.addr < self.size
    }
}

/// One program header table entry, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramHeader {
    /// `p_type`
    pub kind: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

impl ProgramHeader {
    pub fn is_load(&self) -> bool {
        self.kind == PT_LOAD
    }

    pub fn is_executable(&self) -> bool {
        self.flags & PF_X != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & PF_W != 0
    }

    pub fn is_readable(&self) -> bool {
        self.flags & PF_R != 0
    }

    /// `PT_LOAD`, `PT_DYNAMIC`, ... or `UNKNOWN_PT` for anything else.
    pub fn type_name(&self) -> &'static str {
        pt_to_str(self.kind)
    }

    /// Flags as a compact `XWR` string, e.g. `"XR"` for a text segment.
    pub fn flags_string(&self) -> String {
        let mut out = String::with_capacity(3);
        if self.is_executable() {
            out.push('X');
        }
        if self.is_writable() {
            out.push('W');
        }
        if self.is_readable() {
            out.push('R');
        }
        out
    }
}

/// Resolves the null-terminated name at `offset` in a string table.
///
/// Out-of-range offsets resolve to the empty string, which callers treat as
/// an unnamed section. Invalid UTF-8 is replaced lossily, so distinct names
/// stay distinct.
pub(crate) fn name_from_strtab(strtab: &[u8], offset: u32) -> Cow<'_, str> {
    let Some(tail) = strtab.get(offset as usize..) else {
        return Cow::Borrowed("");
    };
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    String::from_utf8_lossy(&tail[..end])
}
