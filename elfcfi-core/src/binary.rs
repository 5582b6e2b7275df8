use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use goblin::elf::header::SIZEOF_IDENT;

use crate::error::{ElfError, Result};
use crate::frame::{FrameKind, FrameParser, FrameTables};
use crate::header::{ElfClass, Elf32, Elf64, FileHeader, Layout};
use crate::reader::{BinaryReader, FileReader};
use crate::sections::{name_from_strtab, ProgramHeader, SectionHeader};

/// Outcome of the last decode attempt for one frame section.
enum FrameState {
    Decoded(Arc<FrameTables>),
    /// Recoverable failure; the next request decodes again.
    Failed(Arc<FrameTables>),
    /// Fatal failure; the section is never decoded again.
    Poisoned {
        tables: Arc<FrameTables>,
        offset: u64,
        augmentation: String,
    },
}

impl FrameState {
    fn tables(&self) -> &Arc<FrameTables> {
        match self {
            FrameState::Decoded(tables) | FrameState::Failed(tables) => tables,
            FrameState::Poisoned { tables, .. } => tables,
        }
    }
}

/// A parsed ELF image: file header, named sections and program headers,
/// plus lazily decoded call frame information.
pub struct ElfReader {
    path: PathBuf,
    source: Box<dyn BinaryReader>,
    header: FileHeader,
    sections: BTreeMap<String, SectionHeader>,
    program_headers: Vec<ProgramHeader>,
    min_load_vaddr: Option<u64>,
    frames: Mutex<HashMap<FrameKind, FrameState>>,
}

impl ElfReader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = FileReader::open(path)?;
        Self::from_reader(path, source)
    }

    /// Parses the structure of an image served by `source`.
    ///
    /// `path` only labels the reader; nothing is read from it.
    pub fn from_reader<P, R>(path: P, source: R) -> Result<Self>
    where
        P: Into<PathBuf>,
        R: BinaryReader + 'static,
    {
        let path = path.into();
        let mut ident = [0u8; SIZEOF_IDENT];
        source.read_exact_at(&mut ident, 0)?;
        let class = ElfClass::from_ident(&ident)?;

        let layout = match class {
            ElfClass::Elf32 => read_layout::<Elf32>(&source)?,
            ElfClass::Elf64 => read_layout::<Elf64>(&source)?,
        };

        let min_load_vaddr = layout
            .program_headers
            .iter()
            .filter(|ph| ph.is_load() && ph.is_executable())
            .map(|ph| ph.vaddr)
            .min();

        log::info!(
            "Opened {} ({}-bit, {} sections, {} program headers)",
            path.display(),
            class.bits(),
            layout.sections.len(),
            layout.program_headers.len()
        );

        Ok(Self {
            path,
            source: Box::new(source),
            header: layout.header,
            sections: layout.sections,
            program_headers: layout.program_headers,
            min_load_vaddr,
            frames: Mutex::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn class(&self) -> ElfClass {
        self.header.class
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Named sections, keyed by name.
    pub fn sections(&self) -> &BTreeMap<String, SectionHeader> {
        &self.sections
    }

    pub fn section(&self, name: &str) -> Option<&SectionHeader> {
        self.sections.get(name)
    }

    /// Reads the full contents of the named section.
    pub fn section_data(&self, name: &str) -> Result<Vec<u8>> {
        let section = self
            .section(name)
            .ok_or_else(|| ElfError::MissingSection(name.to_string()))?;
        self.source.read_vec(section.size, section.offset)
    }

    /// Program headers in on-disk order.
    pub fn program_headers(&self) -> &[ProgramHeader] {
        &self.program_headers
    }

    /// Lowest `p_vaddr` of any executable `PT_LOAD` segment, or `None` when
    /// the image has no such segment.
    pub fn min_load_vaddr(&self) -> Option<u64> {
        self.min_load_vaddr
    }

    /// Decodes `.eh_frame`. See [`ElfReader::read_frame_section`].
    pub fn read_eh_frame(&self) -> Result<Arc<FrameTables>> {
        self.read_frame_section(FrameKind::EhFrame)
    }

    /// Decodes the given frame section once and returns its tables.
    ///
    /// A successful decode is kept and returned by later calls without
    /// touching the file again. A recoverable failure is not kept, so the
    /// next call retries; a fatal one ([`ElfError::is_fatal`]) is returned
    /// again on every later call. Concurrent callers wait for one decode.
    pub fn read_frame_section(&self, kind: FrameKind) -> Result<Arc<FrameTables>> {
        let mut frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        match frames.get(&kind) {
            Some(FrameState::Decoded(tables)) => return Ok(Arc::clone(tables)),
            Some(FrameState::Poisoned {
                offset,
                augmentation,
                ..
            }) => {
                return Err(ElfError::MalformedAugmentation {
                    offset: *offset,
                    augmentation: augmentation.clone(),
                })
            }
            Some(FrameState::Failed(_)) | None => {}
        }

        let name = kind.section_name();
        let Some(section) = self.section(name) else {
            log::warn!("No {name} section in {}", self.path.display());
            return Err(ElfError::MissingSection(name.to_string()));
        };
        let data = self.source.read_vec(section.size, section.offset)?;

        let mut tables = FrameTables::new(kind);
        let parser = FrameParser::new(&data, section.addr, kind, self.class().pointer_size());
        let outcome = parser.parse_into(&mut tables);

        match outcome {
            Ok(()) => {
                tables.mark_complete();
                log::info!(
                    "Decoded {name}: {} CIEs, {} FDEs",
                    tables.cies().len(),
                    tables.fdes().len()
                );
                let tables = Arc::new(tables);
                frames.insert(kind, FrameState::Decoded(Arc::clone(&tables)));
                Ok(tables)
            }
            Err(err) => {
                log::warn!("Failed to decode {name} in {}: {err}", self.path.display());
                let tables = Arc::new(tables);
                let state = match &err {
                    ElfError::MalformedAugmentation {
                        offset,
                        augmentation,
                    } => FrameState::Poisoned {
                        tables,
                        offset: *offset,
                        augmentation: augmentation.clone(),
                    },
                    _ => FrameState::Failed(tables),
                };
                frames.insert(kind, state);
                Err(err)
            }
        }
    }

    /// Whatever tables the last decode of `kind` produced, complete or not.
    ///
    /// Returns `None` if the section was never decoded, or was missing.
    pub fn frame_tables(&self, kind: FrameKind) -> Option<Arc<FrameTables>> {
        let frames = self.frames.lock().unwrap_or_else(PoisonError::into_inner);
        frames.get(&kind).map(|state| Arc::clone(state.tables()))
    }
}

impl fmt::Debug for ElfReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfReader")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("sections", &self.sections.len())
            .field("program_headers", &self.program_headers.len())
            .field("min_load_vaddr", &self.min_load_vaddr)
            .finish_non_exhaustive()
    }
}

struct ImageLayout {
    header: FileHeader,
    sections: BTreeMap<String, SectionHeader>,
    program_headers: Vec<ProgramHeader>,
}

/// Reads one fixed-size table entry and decodes it with `decode`.
///
/// An entry whose offset overflows (`None`) is reported as a truncated read
/// at the table start.
fn read_entry<T>(
    source: &dyn BinaryReader,
    offset: Option<u64>,
    table: u64,
    size: usize,
    decode: impl FnOnce(&[u8]) -> std::io::Result<T>,
) -> Result<T> {
    let offset = offset.ok_or(ElfError::TruncatedRead {
        offset: table,
        len: size,
    })?;
    let mut buf = vec![0u8; size];
    source.read_exact_at(&mut buf, offset)?;
    decode(&buf).map_err(|_| ElfError::TruncatedRead { offset, len: size })
}

fn read_layout<L: Layout>(source: &dyn BinaryReader) -> Result<ImageLayout> {
    let header = read_entry(source, Some(0), 0, L::EHDR_SIZE, L::file_header)?;
    log::debug!(
        "section offset: {:#x}, section num: {}, section entry size: {}, string section index: {}",
        header.e_shoff,
        header.e_shnum,
        header.e_shentsize,
        header.e_shstrndx
    );

    let sections = read_sections::<L>(source, &header)?;
    let program_headers = read_program_headers::<L>(source, &header)?;

    Ok(ImageLayout {
        header,
        sections,
        program_headers,
    })
}

fn read_sections<L: Layout>(
    source: &dyn BinaryReader,
    header: &FileHeader,
) -> Result<BTreeMap<String, SectionHeader>> {
    if header.e_shstrndx == 0 {
        return Err(ElfError::MissingStringTable);
    }
    let (_, strtab) = read_entry(
        source,
        header.section_header_offset(header.e_shstrndx),
        header.e_shoff,
        L::SHDR_SIZE,
        L::section_header,
    )?;
    let names = source.read_vec(strtab.size, strtab.offset)?;

    let mut sections = BTreeMap::new();
    for index in 0..header.e_shnum {
        let (name_offset, mut section) = read_entry(
            source,
            header.section_header_offset(index),
            header.e_shoff,
            L::SHDR_SIZE,
            L::section_header,
        )?;
        let name = name_from_strtab(&names, name_offset);
        if name.is_empty() {
            continue;
        }
        section.name = name.into_owned();
        log::debug!(
            "section {}, addr {:#x}, offset {:#x}, size {:#x}",
            section.name,
            section.addr,
            section.offset,
            section.size
        );
        sections.insert(section.name.clone(), section);
    }
    Ok(sections)
}

fn read_program_headers<L: Layout>(
    source: &dyn BinaryReader,
    header: &FileHeader,
) -> Result<Vec<ProgramHeader>> {
    (0..header.e_phnum)
        .map(|index| {
            let ph = read_entry(
                source,
                header.program_header_offset(index),
                header.e_phoff,
                L::PHDR_SIZE,
                L::program_header,
            )?;
            log::debug!(
                "program header type {}({:#x}) flag ({})({:#x}), offset {:#x}, vaddr {:#x}, paddr {:#x}, size {:#x}",
                ph.type_name(),
                ph.kind,
                ph.flags_string(),
                ph.flags,
                ph.offset,
                ph.vaddr,
                ph.paddr,
                ph.filesz
            );
            Ok(ph)
        })
        .collect()
}
