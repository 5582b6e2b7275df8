//! Error type shared by every decoding stage.

use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while opening an ELF image or decoding its
/// call-frame information.
///
/// All variants are recoverable at the call boundary except
/// [`ElfError::MalformedAugmentation`], see [`ElfError::is_fatal`].
#[derive(Error, Debug)]
pub enum ElfError {
    /// The file could not be opened at all.
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bad magic, unknown ELF class or an unsupported byte order.
    #[error("invalid ELF image: {0}")]
    Format(String),

    /// A read returned fewer bytes than requested, or failed outright.
    #[error("truncated read of {len} bytes at offset {offset:#x}")]
    TruncatedRead { offset: u64, len: usize },

    /// `e_shstrndx` is zero, so section names cannot be resolved.
    #[error("section header string table index is zero")]
    MissingStringTable,

    /// A section the operation depends on is not present.
    #[error("no {0} section")]
    MissingSection(String),

    /// An FDE points at an offset where no CIE has been decoded.
    #[error("FDE at {fde_offset:#x} references unknown CIE at {cie_offset:#x}")]
    UnresolvedCieReference { fde_offset: u64, cie_offset: u64 },

    /// The augmentation string of a CIE cannot be understood. Decoding of the
    /// section must not continue past this point.
    #[error("CIE at {offset:#x} has malformed augmentation {augmentation:?}")]
    MalformedAugmentation { offset: u64, augmentation: String },

    /// A `DW_EH_PE_*` byte whose value format is not defined by DWARF.
    #[error("invalid pointer encoding {0:#04x}")]
    InvalidPointerEncoding(u8),

    /// A fixed-width field of a size no encoding defines, such as a CIE
    /// address size of 3.
    #[error("unsupported field width of {0} bytes")]
    UnsupportedWidth(u8),

    /// A record body extends past its declared length, or the declared length
    /// extends past the section.
    #[error("record at {offset:#x} overruns its bounds")]
    RecordOverrun { offset: u64 },
}

impl ElfError {
    /// Returns true for errors that signal a format assumption mismatch too
    /// deep to keep decoding the same section.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ElfError::MalformedAugmentation { .. })
    }

    pub(crate) fn format(msg: impl Into<String>) -> Self {
        ElfError::Format(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ElfError>;
