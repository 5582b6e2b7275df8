//! # Reader Cache
//!
//! One [`ElfReader`] per path for the whole life of the process.
//!
//! The global cache behind [`ReaderCache::global`] is created on first use
//! and is never torn down: readers hold read-only data that stays valid until
//! exit, and leaving them in place means there is no shutdown ordering to get
//! wrong. Entries are never evicted.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use elfcfi_core::ReaderCache;
//!
//! if let Some(reader) = ReaderCache::global().get("/usr/lib/libc.so.6") {
//!     let tables = reader.read_eh_frame()?;
//!     println!("{} FDEs", tables.fdes().len());
//! }
//! # Ok::<(), elfcfi_core::ElfError>(())
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use once_cell::sync::{Lazy, OnceCell};

use crate::binary::ElfReader;

/// Open outcome for one path. `None` records a failed open.
type Slot = Arc<OnceCell<Option<Arc<ElfReader>>>>;

static GLOBAL: Lazy<ReaderCache> = Lazy::new(ReaderCache::new);

/// Memoizes [`ElfReader::open`] by path.
///
/// Paths are used as given, so two spellings of one file get two readers.
/// The first caller for a path opens it while later callers for the same
/// path wait; callers for paths already resolved never wait on an open.
#[derive(Default)]
pub struct ReaderCache {
    readers: RwLock<HashMap<PathBuf, Slot>>,
}

impl ReaderCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cache. Lives until the process exits.
    pub fn global() -> &'static ReaderCache {
        &GLOBAL
    }

    /// Returns the reader for `path`, opening it on first request.
    ///
    /// A failed open is remembered as well: later calls for the same path
    /// return `None` without touching the file again.
    pub fn get<P: AsRef<Path>>(&self, path: P) -> Option<Arc<ElfReader>> {
        let path = path.as_ref();
        let slot = self.slot(path);
        slot.get_or_init(|| match ElfReader::open(path) {
            Ok(reader) => Some(Arc::new(reader)),
            Err(err) => {
                log::warn!("Failed to open {}: {err}", path.display());
                None
            }
        })
        .clone()
    }

    /// Number of paths seen so far, failed opens included.
    pub fn len(&self) -> usize {
        self.readers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, path: &Path) -> Slot {
        if let Some(slot) = self
            .readers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            return Arc::clone(slot);
        }
        let mut readers = self.readers.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(readers.entry(path.to_path_buf()).or_default())
    }
}

/// Shorthand for `ReaderCache::global().get(path)`.
pub fn open_elf<P: AsRef<Path>>(path: P) -> Option<Arc<ElfReader>> {
    ReaderCache::global().get(path)
}
