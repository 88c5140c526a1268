/*++

Licensed under the Apache-2.0 license.

File Name:

    fwsec.rs

Abstract:

    File contains the FWSEC image manager: ownership of the extracted
    IMEM/DMEM/signature blobs, DMEM mapper location, FRTS command patching,
    fuse-driven signature selection and staging buffer layout.

--*/

use alloc::vec::Vec;
use log::debug;
use zerocopy::IntoBytes;

use crate::vbios::Vbios;
use fwsec_error::{FwsecError, FwsecResult, VbiosSection};
use fwsec_image_types::*;

/// Offsets of the three staging buffer sections: `[IMEM][DMEM][signature]`.
#[derive(Debug, Clone, Copy)]
pub struct StagingLayout {
    pub imem_offset: usize,
    pub dmem_offset: usize,
    pub signature_offset: usize,
    pub total_len: usize,
}

/// Signature index for a fused version: the position of the highest set bit
/// of `signature_versions` that is at or below `fuse_version`.
pub fn select_signature_index(signature_versions: u16, fuse_version: u32) -> Option<u32> {
    let highest = fuse_version.min(15);
    (0..=highest)
        .rev()
        .find(|bit| signature_versions & (1 << bit) != 0)
}

/// The FWSEC firmware lifted out of the VBIOS, with mutable copies of the
/// load images so the FRTS command can be patched in.
#[derive(Debug)]
pub struct FwsecImage {
    pub desc: FalconUcodeDescV3,
    imem: Vec<u8>,
    dmem: Vec<u8>,
    signatures: Vec<u8>,
    dmem_mapper_offset: usize,
}

impl FwsecImage {
    /// Copy IMEM, DMEM and the signature blob out of the ROM.
    ///
    /// The payload follows the descriptor contiguously:
    /// `[descriptor][signatures][IMEM][DMEM]`.
    pub fn from_vbios(rom: &[u8], vbios: &Vbios) -> FwsecResult<Self> {
        let desc = vbios.desc;

        if desc.imem_load_size == 0
            || desc.imem_load_size > IMEM_MAX_SIZE
            || desc.dmem_load_size == 0
            || desc.dmem_load_size > DMEM_MAX_SIZE
        {
            return Err(FwsecError::InvalidVbios(VbiosSection::FwsecDesc));
        }

        let sig_off = vbios.desc_offset + FALCON_UCODE_DESC_V3_SIZE;
        let sig_len = desc.signature_count as usize * RSA3K_SIGNATURE_SIZE;
        let imem_off = sig_off + sig_len;
        let dmem_off = imem_off + desc.imem_load_size as usize;
        let end = dmem_off + desc.dmem_load_size as usize;

        let section = |from: usize, to: usize| {
            rom.get(from..to)
                .ok_or(FwsecError::OutOfBounds(VbiosSection::FwsecDesc))
        };

        let signatures = section(sig_off, imem_off)?.to_vec();
        let imem = section(imem_off, dmem_off)?.to_vec();
        let dmem = section(dmem_off, end)?.to_vec();

        let dmem_mapper_offset = locate_dmem_mapper(&dmem, &desc)?;
        debug!(
            "fwsec: imem {:#x} dmem {:#x} sigs {} mapper at {:#x}",
            imem.len(),
            dmem.len(),
            desc.signature_count,
            dmem_mapper_offset
        );

        Ok(Self {
            desc,
            imem,
            dmem,
            signatures,
            dmem_mapper_offset,
        })
    }

    pub fn imem(&self) -> &[u8] {
        &self.imem
    }

    pub fn dmem(&self) -> &[u8] {
        &self.dmem
    }

    pub fn dmem_mapper_offset(&self) -> usize {
        self.dmem_mapper_offset
    }

    /// The `idx`-th RSA-3K signature, if present.
    pub fn signature(&self, idx: usize) -> Option<&[u8]> {
        let start = idx.checked_mul(RSA3K_SIGNATURE_SIZE)?;
        self.signatures.get(start..start + RSA3K_SIGNATURE_SIZE)
    }

    /// Pick the signature matching the fused version.
    pub fn select_signature(&self, fuse_version: u32) -> FwsecResult<usize> {
        let idx = select_signature_index(self.desc.signature_versions, fuse_version)
            .ok_or(FwsecError::SignatureUnavailable(fuse_version))? as usize;

        if idx >= self.desc.signature_count as usize {
            return Err(FwsecError::SignatureUnavailable(fuse_version));
        }
        Ok(idx)
    }

    /// Write the FRTS command into the mapper's command-in buffer and force
    /// `init_cmd` to FRTS so the payload runs it on entry.
    ///
    /// `frts_offset_from_end` is the region offset measured back from the
    /// end of the framebuffer. Re-patching with the same layout yields a
    /// byte-identical DMEM.
    pub fn patch_frts_command(
        &mut self,
        frts_offset_from_end: u32,
        frts_size: u32,
    ) -> FwsecResult<()> {
        let mapper: DmemMapperV3 = read_at(&self.dmem, self.dmem_mapper_offset)
            .ok_or(FwsecError::OutOfBounds(VbiosSection::DmemMapper))?;

        if (mapper.cmd_in_buffer_size as usize) < FWSEC_FRTS_CMD_SIZE {
            return Err(FwsecError::InvalidVbios(VbiosSection::DmemMapper));
        }

        let cmd_off = self.dmem_mapper_offset + mapper.cmd_in_buffer_offset as usize;
        let cmd = FwsecFrtsCmd {
            cmd: FWSEC_CMD_FRTS,
            frts_region_offset: frts_offset_from_end,
            frts_region_size: frts_size,
            reserved: [0; 5],
        };
        self.dmem
            .get_mut(cmd_off..cmd_off + FWSEC_FRTS_CMD_SIZE)
            .ok_or(FwsecError::OutOfBounds(VbiosSection::DmemMapper))?
            .copy_from_slice(cmd.as_bytes());

        let init_off = self.dmem_mapper_offset + DMEM_MAPPER_INIT_CMD_OFFSET;
        self.dmem
            .get_mut(init_off..init_off + 4)
            .ok_or(FwsecError::OutOfBounds(VbiosSection::DmemMapper))?
            .copy_from_slice(&FWSEC_CMD_FRTS.to_le_bytes());

        Ok(())
    }

    /// Size of the `[IMEM][DMEM][signature]` staging concatenation.
    pub fn staging_len(&self) -> usize {
        let sig = if self.desc.signature_count > 0 {
            RSA3K_SIGNATURE_SIZE
        } else {
            0
        };
        self.imem.len() + self.dmem.len() + sig
    }

    /// Lay the firmware out in a staging buffer for DMA or BROM loading.
    pub fn write_staging(&self, sig_idx: usize, out: &mut [u8]) -> FwsecResult<StagingLayout> {
        let sig = self
            .signature(sig_idx)
            .ok_or(FwsecError::SignatureUnavailable(sig_idx as u32))?;

        let dmem_offset = self.imem.len();
        let signature_offset = dmem_offset + self.dmem.len();
        let total_len = signature_offset + sig.len();

        let buf = out
            .get_mut(..total_len)
            .ok_or(FwsecError::DmaAllocFailed)?;
        buf[..dmem_offset].copy_from_slice(&self.imem);
        buf[dmem_offset..signature_offset].copy_from_slice(&self.dmem);
        buf[signature_offset..].copy_from_slice(sig);

        Ok(StagingLayout {
            imem_offset: 0,
            dmem_offset,
            signature_offset,
            total_len,
        })
    }
}

/// Find the DMEM mapper: walk the application interface table when it is
/// intact, otherwise scan DMEM for the "DMAP" signature.
fn locate_dmem_mapper(dmem: &[u8], desc: &FalconUcodeDescV3) -> FwsecResult<usize> {
    if let Some(offset) = appif_mapper_offset(dmem, desc.interface_offset as usize) {
        if mapper_valid_at(dmem, offset) {
            return Ok(offset);
        }
    }

    let mut offset = 0;
    while offset + DMEM_MAPPER_SIZE as usize <= dmem.len() {
        if read_u32_le(dmem, offset) == Some(DMEM_MAPPER_SIGNATURE) && mapper_valid_at(dmem, offset)
        {
            debug!("fwsec: DMEM mapper found by scan at {:#x}", offset);
            return Ok(offset);
        }
        offset += 4;
    }

    Err(FwsecError::InvalidVbios(VbiosSection::DmemMapper))
}

fn appif_mapper_offset(dmem: &[u8], interface_offset: usize) -> Option<usize> {
    let hdr: FalconAppifHdrV1 = read_at(dmem, interface_offset)?;
    if hdr.version != 1 || hdr.header_size < 4 || hdr.entry_size != 8 || hdr.entry_count == 0 {
        return None;
    }

    let entry_base = interface_offset + hdr.header_size as usize;
    for i in 0..hdr.entry_count as usize {
        let entry: FalconAppifEntryV1 = read_at(dmem, entry_base + i * hdr.entry_size as usize)?;
        if entry.id == APPIF_ID_DMEMMAPPER {
            return Some(entry.dmem_offset as usize);
        }
    }

    None
}

fn mapper_valid_at(dmem: &[u8], offset: usize) -> bool {
    read_at::<DmemMapperV3>(dmem, offset).is_some_and(|mapper| mapper.is_valid())
}
