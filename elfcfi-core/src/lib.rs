pub mod binary;
pub mod cache;
pub mod error;
pub mod frame;
pub mod header;
pub mod reader;
pub mod sections;

pub use binary::*;
pub use cache::*;
pub use error::*;
pub use frame::{Cie, Fde, FrameKind, FrameTables};
pub use header::{ElfClass, FileHeader};
pub use reader::*;
pub use sections::{ProgramHeader, SectionHeader};
