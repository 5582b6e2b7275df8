//! Single forward pass over a `.eh_frame` / `.debug_frame` section.
//!
//! Every record starts with its length, so the cursor always moves to the
//! declared record end after a record is handled, whatever the body consumed.
//! CIEs must precede the FDEs that reference them.

use std::sync::Arc;

use gimli::constants::{DwEhPe, DW_EH_PE_pcrel};
use log::trace;

use crate::error::{ElfError, Result};
use crate::frame::encoding::{encoding_name, SectionCursor};
use crate::frame::{Cie, Fde, FrameKind, FrameTables};

/// 32-bit length escape announcing the 64-bit extended length form.
const DWARF64_ESCAPE: u32 = 0xffff_ffff;
const CIE_ID_32: u64 = 0xffff_ffff;
const CIE_ID_64: u64 = u64::MAX;

#[derive(Debug)]
pub struct FrameParser<'a> {
    pub data: &'a [u8],
    /// Virtual address the section is mapped at (`sh_addr`).
    pub base_address: u64,
    pub kind: FrameKind,
    /// Address size assumed by CIEs that do not declare their own.
    pub address_size: u8,
}

impl<'a> FrameParser<'a> {
    pub fn new(data: &'a [u8], base_address: u64, kind: FrameKind, address_size: u8) -> Self {
        Self {
            data,
            base_address,
            kind,
            address_size,
        }
    }

    /// Decodes every record into `tables`.
    ///
    /// On error, records decoded before the failing one stay in `tables`.
    pub fn parse_into(&self, tables: &mut FrameTables) -> Result<()> {
        let mut cur = SectionCursor::new(self.data);
        while cur.remaining() > 0 {
            let record_offset = cur.position();
            let len = cur.read_uint(4)? as u32;
            let (unit_len, is_64bit) = if len == DWARF64_ESCAPE {
                (cur.read_uint(8)?, true)
            } else {
                (u64::from(len), false)
            };

            if unit_len == 0 {
                trace!("<{record_offset:x}> zero terminator");
                match self.kind {
                    FrameKind::EhFrame => continue,
                    FrameKind::DebugFrame => break,
                }
            }

            let record_end = cur
                .position()
                .checked_add(unit_len)
                .filter(|&end| end <= cur.len())
                .ok_or(ElfError::RecordOverrun {
                    offset: record_offset,
                })?;

            let mut body = SectionCursor::bounded(self.data, cur.position(), record_end);
            let id_offset = body.position();
            let mut id = body.read_uint(if is_64bit { 8 } else { 4 })?;
            if !is_64bit && id == CIE_ID_32 {
                id = CIE_ID_64;
            }

            let is_cie = match self.kind {
                FrameKind::EhFrame => id == 0,
                FrameKind::DebugFrame => id == CIE_ID_64,
            };
            trace!(
                "<{record_offset:x}> cie_id {id:x} {}",
                if is_cie { "CIE" } else { "FDE" }
            );

            if is_cie {
                let cie = self.parse_cie(&mut body, record_offset, is_64bit)?;
                tables.insert_cie(cie);
            } else {
                let cie_offset = match self.kind {
                    FrameKind::EhFrame => id_offset.wrapping_sub(id),
                    FrameKind::DebugFrame => id,
                };
                let cie = tables.cie(cie_offset).cloned().ok_or(
                    ElfError::UnresolvedCieReference {
                        fde_offset: record_offset,
                        cie_offset,
                    },
                )?;
                let fde = self.parse_fde(&mut body, record_offset, cie, is_64bit)?;
                tables.insert_fde(fde);
            }

            cur.set_position(record_end);
        }
        Ok(())
    }

    fn parse_cie(
        &self,
        body: &mut SectionCursor<'a>,
        offset: u64,
        is_64bit: bool,
    ) -> Result<Cie> {
        let mut cie = Cie::new(offset, self.address_size);
        cie.is_64bit = is_64bit;
        cie.version = body.read_u8()?;

        let augmentation = String::from_utf8_lossy(body.read_cstr()?).into_owned();
        trace!("version {}, augmentation {augmentation:?}", cie.version);
        if !(augmentation.is_empty() || augmentation.starts_with('z')) {
            return Err(ElfError::MalformedAugmentation {
                offset,
                augmentation,
            });
        }

        if cie.version >= 4 {
            cie.address_size = body.read_u8()?;
            let segment_size = body.read_u8()?;
            trace!(
                "address_size {}, segment_size {segment_size}",
                cie.address_size
            );
        }

        let code_alignment_factor = body.read_uleb128()?;
        cie.data_alignment_factor = body.read_sleb128()?;
        let return_address_register = if cie.version == 1 {
            u64::from(body.read_u8()?)
        } else {
            body.read_uleb128()?
        };
        trace!(
            "code_alignment_factor {code_alignment_factor}, data_alignment_factor {}, \
             return_address_register {return_address_register}",
            cie.data_alignment_factor
        );

        if augmentation.starts_with('z') {
            let augmentation_len = body.read_uleb128()?;
            trace!("augmentation_len {augmentation_len}");
            for c in augmentation.chars().skip(1) {
                match c {
                    'R' => {
                        cie.fde_pointer_encoding = DwEhPe(body.read_u8()?);
                        trace!(
                            "fde_pointer_encoding {}",
                            encoding_name(cie.fde_pointer_encoding)
                        );
                    }
                    'P' => {
                        let encoding = DwEhPe(body.read_u8()?);
                        let personality = body.read_encoded(encoding, cie.address_size)?;
                        trace!(
                            "personality pointer {personality:x?} ({})",
                            encoding_name(encoding)
                        );
                    }
                    'L' => {
                        cie.lsda_encoding = DwEhPe(body.read_u8()?);
                        trace!("lsda_encoding {}", encoding_name(cie.lsda_encoding));
                    }
                    _ => {
                        return Err(ElfError::MalformedAugmentation {
                            offset,
                            augmentation: augmentation.clone(),
                        })
                    }
                }
            }
        }

        cie.augmentation = augmentation;
        cie.initial_instructions = body.read_rest().to_vec();
        trace!(
            "initial_instructions len {:#x}",
            cie.initial_instructions.len()
        );
        Ok(cie)
    }

    fn parse_fde(
        &self,
        body: &mut SectionCursor<'a>,
        offset: u64,
        cie: Arc<Cie>,
        is_64bit: bool,
    ) -> Result<Fde> {
        let encoding = cie.fde_pointer_encoding;
        let missing = || ElfError::InvalidPointerEncoding(encoding.0);

        let location_offset = body.position();
        let initial_location = body
            .read_encoded(encoding, cie.address_size)?
            .ok_or_else(missing)?;
        let address_range = body
            .read_encoded(encoding, cie.address_size)?
            .ok_or_else(missing)?;

        let mut func_start = initial_location;
        if encoding.application() == DW_EH_PE_pcrel {
            func_start = func_start
                .wrapping_add(self.base_address)
                .wrapping_add(location_offset);
        }
        let func_end = func_start.wrapping_add(address_range);
        trace!(
            "cie_offset {:#x}, proc range [{func_start:#x} - {func_end:#x}]",
            cie.offset
        );

        if cie.has_augmentation_data() {
            let augmentation_len = body.read_uleb128()?;
            trace!("augmentation_len {augmentation_len}");
        }
        if cie.has_lsda() {
            let lsda = body.read_encoded(cie.lsda_encoding, cie.address_size)?;
            trace!("lsda {lsda:x?}");
        }

        let instructions = body.read_rest().to_vec();
        trace!("instructions len {:#x}", instructions.len());
        Ok(Fde {
            offset,
            cie,
            func_start,
            func_end,
            is_64bit,
            instructions,
        })
    }
}
