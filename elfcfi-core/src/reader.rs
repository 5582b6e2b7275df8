//! Positioned, bounds-checked access to the bytes of an image.
//!
//! Every read names its absolute offset, so there is no shared cursor and one
//! reader can serve structural parsing and on-demand section loads at the same
//! time, from any number of threads.

use std::fs::File;
use std::path::Path;

use crate::error::{ElfError, Result};

pub trait BinaryReader: Send + Sync {
    /// Fills `buf` from `offset`. A short read is an error, never partial data.
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()>;

    /// Total size of the underlying medium in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `len` bytes at `offset` into a fresh buffer.
    ///
    /// The range is checked against [`BinaryReader::len`] before allocating,
    /// so a corrupt size field cannot request an absurd allocation.
    fn read_vec(&self, len: u64, offset: u64) -> Result<Vec<u8>> {
        let truncated = || ElfError::TruncatedRead {
            offset,
            len: usize::try_from(len).unwrap_or(usize::MAX),
        };
        let end = offset.checked_add(len).ok_or_else(truncated)?;
        if end > self.len() {
            return Err(truncated());
        }
        let mut buf = vec![0u8; usize::try_from(len).map_err(|_| truncated())?];
        self.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }
}

/// Reads straight from an open file with `pread`-style calls.
#[derive(Debug)]
pub struct FileReader {
    file: File,
    len: u64,
}

impl FileReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let open_err = |source| ElfError::Open {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(open_err)?;
        let len = file.metadata().map_err(open_err)?.len();
        Ok(Self { file, len })
    }
}

impl BinaryReader for FileReader {
    #[cfg(unix)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.read_exact_at(buf, offset).map_err(|err| {
            log::debug!("read of {} bytes at {offset:#x} failed: {err}", buf.len());
            ElfError::TruncatedRead {
                offset,
                len: buf.len(),
            }
        })
    }

    #[cfg(windows)]
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;

        let len = buf.len();
        let mut done = 0;
        while done < len {
            match self.file.seek_read(&mut buf[done..], offset + done as u64) {
                Ok(0) => return Err(ElfError::TruncatedRead { offset, len }),
                Ok(n) => done += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => {
                    log::debug!("read of {len} bytes at {offset:#x} failed: {err}");
                    return Err(ElfError::TruncatedRead { offset, len });
                }
            }
        }
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// An image that is already in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    data: Vec<u8>,
}

impl MemoryReader {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for MemoryReader {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl BinaryReader for MemoryReader {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        let truncated = ElfError::TruncatedRead {
            offset,
            len: buf.len(),
        };
        let start = usize::try_from(offset).map_err(|_| truncated)?;
        let src = start
            .checked_add(buf.len())
            .and_then(|end| self.data.get(start..end))
            .ok_or(ElfError::TruncatedRead {
                offset,
                len: buf.len(),
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
