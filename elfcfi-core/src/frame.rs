//! Call frame information: CIE/FDE records and the tables that hold them.
//!
//! Instruction bytes are kept verbatim. Evaluating them is the job of an
//! unwinder sitting on top of these tables.

pub mod encoding;
pub mod parser;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use gimli::constants::{DwEhPe, DW_EH_PE_absptr, DW_EH_PE_omit};

pub use encoding::{decode_sleb128, decode_uleb128, encoding_name, SectionCursor};
pub use parser::FrameParser;

/// The two sections that carry CIE/FDE records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// `.eh_frame`: CIE id 0, FDEs point back at their CIE relatively.
    EhFrame,
    /// `.debug_frame`: all-ones CIE id, FDEs hold absolute CIE offsets.
    DebugFrame,
}

impl FrameKind {
    pub fn section_name(self) -> &'static str {
        match self {
            FrameKind::EhFrame => ".eh_frame",
            FrameKind::DebugFrame => ".debug_frame",
        }
    }
}

impl std::str::FromStr for FrameKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ehframe" | "eh_frame" | ".eh_frame" => Ok(FrameKind::EhFrame),
            "debugframe" | "debug_frame" | ".debug_frame" => Ok(FrameKind::DebugFrame),
            _ => Err(format!("Unknown frame section: {}", s)),
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section_name())
    }
}

/// Common Information Entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cie {
    /// Byte offset of the record within its section.
    pub offset: u64,
    pub version: u8,
    /// Augmentation string, e.g. `"zR"` or `"zPLR"`.
    pub augmentation: String,
    /// Size of a target address, used by `DW_EH_PE_absptr`.
    pub address_size: u8,
    pub data_alignment_factor: i64,
    /// Encoding of the FDE address fields (augmentation `R`).
    pub fde_pointer_encoding: DwEhPe,
    /// Encoding of the FDE LSDA pointer (augmentation `L`); zero when absent.
    pub lsda_encoding: DwEhPe,
    /// Record used the 64-bit extended length form.
    pub is_64bit: bool,
    pub initial_instructions: Vec<u8>,
}

impl Cie {
    pub(crate) fn new(offset: u64, address_size: u8) -> Self {
        Self {
            offset,
            version: 1,
            augmentation: String::new(),
            address_size,
            data_alignment_factor: 0,
            fde_pointer_encoding: DW_EH_PE_absptr,
            lsda_encoding: DwEhPe(0),
            is_64bit: false,
            initial_instructions: Vec::new(),
        }
    }

    /// True when FDEs using this CIE carry an augmentation data length.
    pub fn has_augmentation_data(&self) -> bool {
        self.augmentation.starts_with('z')
    }

    pub fn has_lsda(&self) -> bool {
        self.lsda_encoding.0 != 0 && self.lsda_encoding != DW_EH_PE_omit
    }

    pub fn instructions(&self) -> &[u8] {
        &self.initial_instructions
    }
}

/// Frame Description Entry for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fde {
    /// Byte offset of the record within its section.
    pub offset: u64,
    pub cie: Arc<Cie>,
    pub func_start: u64,
    pub func_end: u64,
    pub is_64bit: bool,
    pub instructions: Vec<u8>,
}

impl Fde {
    pub fn pointer_encoding(&self) -> DwEhPe {
        self.cie.fde_pointer_encoding
    }

    pub fn len(&self) -> u64 {
        self.func_end.wrapping_sub(self.func_start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.func_start && addr < self.func_end
    }

    pub fn instructions(&self) -> &[u8] {
        &self.instructions
    }
}

/// Decoded contents of one frame section.
///
/// CIEs are keyed by section offset, FDEs by function start address. A
/// table whose decode failed part-way keeps the records read before the
/// failure and reports [`FrameTables::is_complete`] as false.
#[derive(Debug, Clone)]
pub struct FrameTables {
    kind: FrameKind,
    cies: BTreeMap<u64, Arc<Cie>>,
    fdes: BTreeMap<u64, Fde>,
    complete: bool,
}

impl FrameTables {
    pub fn new(kind: FrameKind) -> Self {
        Self {
            kind,
            cies: BTreeMap::new(),
            fdes: BTreeMap::new(),
            complete: false,
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn cies(&self) -> &BTreeMap<u64, Arc<Cie>> {
        &self.cies
    }

    pub fn fdes(&self) -> &BTreeMap<u64, Fde> {
        &self.fdes
    }

    pub fn cie(&self, offset: u64) -> Option<&Arc<Cie>> {
        self.cies.get(&offset)
    }

    pub fn fde(&self, func_start: u64) -> Option<&Fde> {
        self.fdes.get(&func_start)
    }

    /// Finds the FDE whose `[func_start, func_end)` range covers `addr`.
    pub fn find_fde(&self, addr: u64) -> Option<&Fde> {
        self.fdes
            .range(..=addr)
            .next_back()
            .map(|(_, fde)| fde)
            .filter(|fde| fde.contains(addr))
    }

    pub(crate) fn insert_cie(&mut self, cie: Cie) -> Arc<Cie> {
        let cie = Arc::new(cie);
        self.cies.insert(cie.offset, Arc::clone(&cie));
        cie
    }

    pub(crate) fn insert_fde(&mut self, fde: Fde) {
        self.fdes.insert(fde.func_start, fde);
    }

    pub(crate) fn mark_complete(&mut self) {
        self.complete = true;
    }
}
