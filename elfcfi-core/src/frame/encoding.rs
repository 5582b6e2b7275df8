//! LEB128 integers and `DW_EH_PE_*` encoded pointers.

use std::io::Cursor;

use byteorder::{ReadBytesExt, LE};
use gimli::constants::{
    DwEhPe, DW_EH_PE_absptr, DW_EH_PE_omit, DW_EH_PE_sdata2, DW_EH_PE_sdata4, DW_EH_PE_sdata8,
    DW_EH_PE_sleb128, DW_EH_PE_udata2, DW_EH_PE_udata4, DW_EH_PE_udata8, DW_EH_PE_uleb128,
};

use crate::error::{ElfError, Result};

/// Decodes an unsigned LEB128 value from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed, or `None` if the
/// input ends before a byte without the continuation bit. Bits beyond the
/// 64th are dropped.
pub fn decode_uleb128(bytes: &[u8]) -> Option<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift < 64 {
            result |= u64::from(byte & 0x7f) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            return Some((result, i + 1));
        }
    }
    None
}

/// Decodes a signed LEB128 value from the front of `bytes`.
///
/// Bit 6 of the final byte is the sign and is extended through the rest of
/// the result.
pub fn decode_sleb128(bytes: &[u8]) -> Option<(i64, usize)> {
    let mut result = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in bytes.iter().enumerate() {
        if shift < 64 {
            result |= u64::from(byte & 0x7f) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= !0u64 << shift;
            }
            return Some((result as i64, i + 1));
        }
    }
    None
}

/// Human readable form of a pointer encoding, e.g.
/// `DW_EH_PE_pcrel | DW_EH_PE_sdata4`.
pub fn encoding_name(encoding: DwEhPe) -> String {
    if encoding == DW_EH_PE_omit {
        return "DW_EH_PE_omit".to_string();
    }
    let mut parts = Vec::new();
    if encoding.is_indirect() {
        parts.push("DW_EH_PE_indirect".to_string());
    }
    let application = encoding.application();
    if application.0 != 0 {
        parts.push(name_or_hex(application));
    }
    parts.push(name_or_hex(encoding.format()));
    parts.join(" | ")
}

fn name_or_hex(value: DwEhPe) -> String {
    value
        .static_string()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{:#04x}", value.0))
}

/// Bounds-checked reader over a frame section.
///
/// Positions are byte offsets from the start of the section. A cursor can be
/// narrowed to end at a record boundary so that a body which reads past its
/// own record fails instead of running into the next one.
#[derive(Debug, Clone)]
pub struct SectionCursor<'a> {
    inner: Cursor<&'a [u8]>,
}

impl<'a> SectionCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            inner: Cursor::new(data),
        }
    }

    /// A cursor over `data[..end]` positioned at `start`.
    pub fn bounded(data: &'a [u8], start: u64, end: u64) -> Self {
        let end = usize::try_from(end).unwrap_or(data.len()).min(data.len());
        let mut inner = Cursor::new(&data[..end]);
        inner.set_position(start);
        Self { inner }
    }

    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    pub fn set_position(&mut self, pos: u64) {
        self.inner.set_position(pos);
    }

    pub fn len(&self) -> u64 {
        self.inner.get_ref().len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.inner.get_ref().is_empty()
    }

    pub fn remaining(&self) -> u64 {
        self.len().saturating_sub(self.position())
    }

    /// Everything from the current position to the end, consuming it.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let data: &'a [u8] = *self.inner.get_ref();
        let start = usize::try_from(self.position()).unwrap_or(data.len()).min(data.len());
        self.inner.set_position(data.len() as u64);
        &data[start..]
    }

    fn truncated(&self, len: usize) -> ElfError {
        ElfError::TruncatedRead {
            offset: self.position(),
            len,
        }
    }

    /// Maps a failed fixed-width read to `TruncatedRead`, rewinding to `pos`
    /// so that nothing is consumed.
    fn rewind_on_err<T>(
        &mut self,
        pos: u64,
        len: usize,
        value: std::io::Result<T>,
    ) -> Result<T> {
        value.map_err(|_| {
            self.inner.set_position(pos);
            ElfError::TruncatedRead { offset: pos, len }
        })
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let pos = self.position();
        let value = self.inner.read_u8();
        self.rewind_on_err(pos, 1, value)
    }

    /// Reads a little-endian unsigned value of `width` bytes (1, 2, 4 or 8).
    pub fn read_uint(&mut self, width: u8) -> Result<u64> {
        let pos = self.position();
        let value = match width {
            1 => self.inner.read_u8().map(u64::from),
            2 => self.inner.read_u16::<LE>().map(u64::from),
            4 => self.inner.read_u32::<LE>().map(u64::from),
            8 => self.inner.read_u64::<LE>(),
            _ => return Err(ElfError::UnsupportedWidth(width)),
        };
        self.rewind_on_err(pos, usize::from(width), value)
    }

    /// Reads a little-endian signed value of `width` bytes, sign-extended.
    pub fn read_int(&mut self, width: u8) -> Result<i64> {
        let pos = self.position();
        let value = match width {
            2 => self.inner.read_i16::<LE>().map(i64::from),
            4 => self.inner.read_i32::<LE>().map(i64::from),
            8 => self.inner.read_i64::<LE>(),
            _ => return Err(ElfError::UnsupportedWidth(width)),
        };
        self.rewind_on_err(pos, usize::from(width), value)
    }

    /// Reads a null-terminated byte string, returning it without the null.
    pub fn read_cstr(&mut self) -> Result<&'a [u8]> {
        let data: &'a [u8] = *self.inner.get_ref();
        let start = usize::try_from(self.position()).unwrap_or(data.len()).min(data.len());
        let len = data[start..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| self.truncated(data.len() - start + 1))?;
        self.inner.set_position((start + len + 1) as u64);
        Ok(&data[start..start + len])
    }

    pub fn read_uleb128(&mut self) -> Result<u64> {
        let start = self.position();
        let (value, used) = decode_uleb128(self.tail()).ok_or_else(|| self.truncated(1))?;
        self.inner.set_position(start + used as u64);
        Ok(value)
    }

    pub fn read_sleb128(&mut self) -> Result<i64> {
        let start = self.position();
        let (value, used) = decode_sleb128(self.tail()).ok_or_else(|| self.truncated(1))?;
        self.inner.set_position(start + used as u64);
        Ok(value)
    }

    /// Reads the raw value of an encoded pointer.
    ///
    /// Only the low nibble (value format) is interpreted here; signed formats
    /// are sign-extended into the returned `u64`. Applying the base named by
    /// the high nibble is left to the caller. `DW_EH_PE_omit` reads nothing
    /// and yields `None`.
    #[allow(non_upper_case_globals)]
    pub fn read_encoded(&mut self, encoding: DwEhPe, address_size: u8) -> Result<Option<u64>> {
        if encoding == DW_EH_PE_omit {
            return Ok(None);
        }
        let value = match encoding.format() {
            DW_EH_PE_absptr => self.read_uint(address_size)?,
            DW_EH_PE_uleb128 => self.read_uleb128()?,
            DW_EH_PE_udata2 => self.read_uint(2)?,
            DW_EH_PE_udata4 => self.read_uint(4)?,
            DW_EH_PE_udata8 => self.read_uint(8)?,
            DW_EH_PE_sleb128 => self.read_sleb128()? as u64,
            DW_EH_PE_sdata2 => self.read_int(2)? as u64,
            DW_EH_PE_sdata4 => self.read_int(4)? as u64,
            DW_EH_PE_sdata8 => self.read_int(8)? as u64,
            _ => return Err(ElfError::InvalidPointerEncoding(encoding.0)),
        };
        Ok(Some(value))
    }

    fn tail(&self) -> &'a [u8] {
        let data: &'a [u8] = *self.inner.get_ref();
        let start = usize::try_from(self.position()).unwrap_or(data.len()).min(data.len());
        &data[start..]
    }
}
