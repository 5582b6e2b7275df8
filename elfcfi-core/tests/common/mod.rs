//! Builders for small synthetic ELF images and frame sections.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{WriteBytesExt, LE};
use elfcfi_core::{BinaryReader, MemoryReader, Result};
use goblin::elf::header::{EI_CLASS, EI_DATA, ELFCLASS32, ELFCLASS64, ELFDATA2LSB, ELFMAG};
use goblin::elf::section_header::{SHT_PROGBITS, SHT_STRTAB};

pub struct Segment {
    pub kind: u32,
    pub flags: u32,
    pub vaddr: u64,
    pub size: u64,
}

pub struct Section {
    pub name: String,
    pub addr: u64,
    pub data: Vec<u8>,
}

/// Where a section ended up in a built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placed {
    pub name: String,
    pub addr: u64,
    pub offset: u64,
    pub size: u64,
}

pub struct Image {
    pub bytes: Vec<u8>,
    pub sections: Vec<Placed>,
}

pub struct ElfBuilder {
    is_64: bool,
    segments: Vec<Segment>,
    sections: Vec<Section>,
    drop_strtab_index: bool,
}

impl ElfBuilder {
    pub fn new64() -> Self {
        Self::new(true)
    }

    pub fn new32() -> Self {
        Self::new(false)
    }

    fn new(is_64: bool) -> Self {
        Self {
            is_64,
            segments: Vec::new(),
            sections: Vec::new(),
            drop_strtab_index: false,
        }
    }

    pub fn segment(mut self, kind: u32, flags: u32, vaddr: u64, size: u64) -> Self {
        self.segments.push(Segment {
            kind,
            flags,
            vaddr,
            size,
        });
        self
    }

    pub fn section(mut self, name: &str, addr: u64, data: Vec<u8>) -> Self {
        self.sections.push(Section {
            name: name.to_string(),
            addr,
            data,
        });
        self
    }

    /// Writes `e_shstrndx = 0`.
    pub fn without_strtab_index(mut self) -> Self {
        self.drop_strtab_index = true;
        self
    }

    fn word(&self, out: &mut Vec<u8>, value: u64) {
        if self.is_64 {
            out.write_u64::<LE>(value).unwrap();
        } else {
            out.write_u32::<LE>(value as u32).unwrap();
        }
    }

    pub fn build(&self) -> Image {
        let (ehsize, phentsize, shentsize) = if self.is_64 { (64, 56, 64) } else { (52, 32, 40) };

        // Section name table: "\0" then every name, .shstrtab last.
        let mut strtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for section in &self.sections {
            name_offsets.push(strtab.len() as u32);
            strtab.extend_from_slice(section.name.as_bytes());
            strtab.push(0);
        }
        let strtab_name = strtab.len() as u32;
        strtab.extend_from_slice(b".shstrtab\0");

        let phoff = ehsize as u64;
        let mut offset = phoff + (phentsize * self.segments.len()) as u64;

        let mut placed = Vec::new();
        for section in &self.sections {
            placed.push(Placed {
                name: section.name.clone(),
                addr: section.addr,
                offset,
                size: section.data.len() as u64,
            });
            offset += section.data.len() as u64;
        }
        let strtab_offset = offset;
        offset += strtab.len() as u64;
        let shoff = offset;
        // null + sections + .shstrtab
        let shnum = self.sections.len() + 2;
        let shstrndx = if self.drop_strtab_index { 0 } else { shnum - 1 };

        let mut out = Vec::new();
        let mut ident = [0u8; 16];
        ident[..4].copy_from_slice(ELFMAG);
        ident[EI_CLASS] = if self.is_64 { ELFCLASS64 } else { ELFCLASS32 };
        ident[EI_DATA] = ELFDATA2LSB;
        ident[6] = 1;
        out.extend_from_slice(&ident);
        out.write_u16::<LE>(3).unwrap(); // ET_DYN
        out.write_u16::<LE>(if self.is_64 { 62 } else { 3 }).unwrap();
        out.write_u32::<LE>(1).unwrap();
        self.word(&mut out, 0x1000);
        self.word(&mut out, if self.segments.is_empty() { 0 } else { phoff });
        self.word(&mut out, shoff);
        out.write_u32::<LE>(0).unwrap();
        out.write_u16::<LE>(ehsize as u16).unwrap();
        out.write_u16::<LE>(phentsize as u16).unwrap();
        out.write_u16::<LE>(self.segments.len() as u16).unwrap();
        out.write_u16::<LE>(shentsize as u16).unwrap();
        out.write_u16::<LE>(shnum as u16).unwrap();
        out.write_u16::<LE>(shstrndx as u16).unwrap();
        assert_eq!(out.len(), ehsize);

        for seg in &self.segments {
            out.write_u32::<LE>(seg.kind).unwrap();
            if self.is_64 {
                out.write_u32::<LE>(seg.flags).unwrap();
            }
            self.word(&mut out, 0); // p_offset
            self.word(&mut out, seg.vaddr);
            self.word(&mut out, seg.vaddr);
            self.word(&mut out, seg.size);
            self.word(&mut out, seg.size);
            if !self.is_64 {
                out.write_u32::<LE>(seg.flags).unwrap();
            }
            self.word(&mut out, 0x1000);
        }

        for section in &self.sections {
            out.extend_from_slice(&section.data);
        }
        out.extend_from_slice(&strtab);
        assert_eq!(out.len() as u64, shoff);

        let write_shdr = |out: &mut Vec<u8>, name: u32, kind: u32, addr: u64, off: u64, size: u64| {
            out.write_u32::<LE>(name).unwrap();
            out.write_u32::<LE>(kind).unwrap();
            self.word(out, 0);
            self.word(out, addr);
            self.word(out, off);
            self.word(out, size);
            out.write_u32::<LE>(0).unwrap();
            out.write_u32::<LE>(0).unwrap();
            self.word(out, 1);
            self.word(out, 0);
        };
        write_shdr(&mut out, 0, 0, 0, 0, 0);
        for (p, name) in placed.iter().zip(&name_offsets) {
            write_shdr(&mut out, *name, SHT_PROGBITS, p.addr, p.offset, p.size);
        }
        write_shdr(
            &mut out,
            strtab_name,
            SHT_STRTAB,
            0,
            strtab_offset,
            strtab.len() as u64,
        );

        Image {
            bytes: out,
            sections: placed,
        }
    }
}

pub fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

pub fn sleb(mut value: i64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}

/// Assembles `.eh_frame` contents for a section mapped at `base`.
pub struct FrameBuilder {
    pub data: Vec<u8>,
    base: u64,
}

impl FrameBuilder {
    pub fn new(base: u64) -> Self {
        Self {
            data: Vec::new(),
            base,
        }
    }

    fn record(&mut self, body: &[u8]) -> u64 {
        let offset = self.data.len() as u64;
        self.data.write_u32::<LE>(body.len() as u32).unwrap();
        self.data.extend_from_slice(body);
        offset
    }

    /// Version 1 CIE with code alignment 1 and return address register 16.
    pub fn cie(
        &mut self,
        augmentation: &str,
        data_alignment: i64,
        aug_data: &[u8],
        instructions: &[u8],
    ) -> u64 {
        let mut body = vec![0, 0, 0, 0, 1];
        body.extend_from_slice(augmentation.as_bytes());
        body.push(0);
        body.extend(uleb(1));
        body.extend(sleb(data_alignment));
        body.push(16);
        if augmentation.starts_with('z') {
            body.extend(uleb(aug_data.len() as u64));
            body.extend_from_slice(aug_data);
        }
        body.extend_from_slice(instructions);
        self.record(&body)
    }

    /// The CIE pointer field value for an FDE about to be appended.
    fn pointer_to(&self, cie: u64) -> u32 {
        (self.data.len() as u64 + 4 - cie) as u32
    }

    /// FDE whose CIE uses the default absolute encoding of `width` bytes.
    pub fn fde_absolute(
        &mut self,
        cie: u64,
        width: u8,
        start: u64,
        range: u64,
        instructions: &[u8],
    ) -> u64 {
        let mut body = Vec::new();
        body.write_u32::<LE>(self.pointer_to(cie)).unwrap();
        for value in [start, range] {
            if width == 8 {
                body.write_u64::<LE>(value).unwrap();
            } else {
                body.write_u32::<LE>(value as u32).unwrap();
            }
        }
        body.extend_from_slice(instructions);
        self.record(&body)
    }

    /// FDE for a `zR` CIE using `DW_EH_PE_pcrel | DW_EH_PE_sdata4`.
    pub fn fde_pcrel(&mut self, cie: u64, start: u64, range: u32, instructions: &[u8]) -> u64 {
        let offset = self.data.len() as u64;
        let location_addr = self.base + offset + 8;
        let mut body = Vec::new();
        body.write_u32::<LE>(self.pointer_to(cie)).unwrap();
        body.write_i32::<LE>(start.wrapping_sub(location_addr) as i32).unwrap();
        body.write_u32::<LE>(range).unwrap();
        body.extend(uleb(0));
        body.extend_from_slice(instructions);
        self.record(&body)
    }

    /// FDE with an arbitrary CIE pointer value.
    pub fn fde_raw_pointer(&mut self, pointer: u32, start: u32, range: u32) -> u64 {
        let mut body = Vec::new();
        body.write_u32::<LE>(pointer).unwrap();
        body.write_u32::<LE>(start).unwrap();
        body.write_u32::<LE>(range).unwrap();
        self.record(&body)
    }

    pub fn terminator(&mut self) {
        self.data.extend_from_slice(&[0, 0, 0, 0]);
    }
}

/// A memory reader that counts how many reads it served.
pub struct CountingReader {
    inner: MemoryReader,
    reads: Arc<AtomicUsize>,
}

impl CountingReader {
    pub fn new(bytes: Vec<u8>) -> (Self, Arc<AtomicUsize>) {
        let reads = Arc::new(AtomicUsize::new(0));
        (
            Self {
                inner: MemoryReader::new(bytes),
                reads: Arc::clone(&reads),
            },
            reads,
        )
    }
}

impl BinaryReader for CountingReader {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.inner.read_exact_at(buf, offset)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

/// Fails every read that starts at `offset` until `failures` reads have failed.
pub struct FlakyReader {
    inner: MemoryReader,
    offset: u64,
    failures: AtomicUsize,
}

impl FlakyReader {
    pub fn new(bytes: Vec<u8>, offset: u64, failures: usize) -> Self {
        Self {
            inner: MemoryReader::new(bytes),
            offset,
            failures: AtomicUsize::new(failures),
        }
    }
}

impl BinaryReader for FlakyReader {
    fn read_exact_at(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        if offset == self.offset
            && self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(elfcfi_core::ElfError::TruncatedRead {
                offset,
                len: buf.len(),
            });
        }
        self.inner.read_exact_at(buf, offset)
    }

    fn len(&self) -> u64 {
        self.inner.len()
    }
}

/// A unique path under the system temp dir holding `bytes`.
pub fn temp_image(tag: &str, bytes: &[u8]) -> std::path::PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    let path = std::env::temp_dir().join(format!("elfcfi-{}-{tag}-{n}.elf", std::process::id()));
    std::fs::write(&path, bytes).unwrap();
    path
}
