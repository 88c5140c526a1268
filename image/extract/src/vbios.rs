/*++

Licensed under the Apache-2.0 license.

File Name:

    vbios.rs

Abstract:

    File contains the VBIOS decoder: expansion ROM walk, BIT table parse,
    PMU lookup table location (Ada token 0x50 indirection, pre-Ada falcon
    data path, pattern fallback) and FWSEC descriptor extraction.

--*/

use alloc::vec::Vec;
use log::debug;

use fwsec_error::{FwsecError, FwsecResult, VbiosSection};
use fwsec_image_types::*;

/// One image of the expansion ROM chain, recorded for diagnostics and for
/// resolving BIT-relative offsets.
#[derive(Debug, Clone, Copy)]
pub struct RomImageInfo {
    pub base: usize,
    pub code_type: u8,
    pub last: bool,
}

/// Decoded VBIOS: everything the image manager needs to lift FWSEC out of
/// the ROM bytes. The ROM buffer itself stays caller-owned.
#[derive(Debug, Clone)]
pub struct Vbios {
    pub rom_base: usize,
    pub images: Vec<RomImageInfo>,
    pub bit_offset: usize,
    pub desc: FalconUcodeDescV3,
    pub desc_offset: usize,
}

impl Vbios {
    /// Run the decoder pipeline over `rom`.
    ///
    /// `prefer_debug` selects the FWSEC-DBG image over FWSEC-PROD when the
    /// lookup table carries both (debug-fused parts only).
    pub fn parse(rom: &[u8], prefer_debug: bool) -> FwsecResult<Self> {
        if rom.len() < VBIOS_MIN_SIZE || rom.len() > VBIOS_MAX_SIZE {
            return Err(FwsecError::InvalidVbios(VbiosSection::Rom));
        }

        let rom_base = find_rom_base(rom)?;
        let images = walk_images(rom, rom_base);
        let (bit_hdr, bit_offset) = find_bit(rom, rom_base)?;

        // BIT-relative offsets resolve against the image containing the BIT.
        let image_base = images
            .iter()
            .map(|img| img.base)
            .filter(|base| *base <= bit_offset)
            .max()
            .unwrap_or(rom_base);

        let tokens = bit_tokens(rom, &bit_hdr, bit_offset);
        let pmu_offset = locate_pmu_table(rom, rom_base, image_base, &tokens)?;
        let data_offset = find_fwsec_entry(rom, pmu_offset, prefer_debug)?;
        let (desc, desc_offset) = locate_descriptor(rom, rom_base, data_offset)?;

        debug!(
            "vbios: rom_base={:#x} bit={:#x} pmu={:#x} desc={:#x} imem={:#x} dmem={:#x} sigs={}",
            rom_base,
            bit_offset,
            pmu_offset,
            desc_offset,
            desc.imem_load_size,
            desc.dmem_load_size,
            desc.signature_count
        );

        Ok(Self {
            rom_base,
            images,
            bit_offset,
            desc,
            desc_offset,
        })
    }
}

/// Pass 1: find the first PCIR-validated x86 expansion ROM image.
fn find_rom_base(rom: &[u8]) -> FwsecResult<usize> {
    let mut offset = 0;
    while offset + ROM_PCIR_PTR_OFFSET + 2 <= rom.len() {
        if read_u16_le(rom, offset) == Some(ROM_SIGNATURE) {
            if let Some(pcir_ptr) = read_u16_le(rom, offset + ROM_PCIR_PTR_OFFSET) {
                let pcir_off = offset + pcir_ptr as usize;
                if pcir_ptr != 0 {
                    if let Some(pcir) = read_at::<PcirHeader>(rom, pcir_off) {
                        if pcir.signature == PCIR_SIGNATURE
                            && pcir.code_type == PCIR_CODE_TYPE_X86
                        {
                            return Ok(offset);
                        }
                    }
                }
            }
        }
        offset += ROM_SCAN_STRIDE;
    }

    Err(FwsecError::InvalidVbios(VbiosSection::Rom))
}

/// Pass 2: enumerate the expansion ROM image chain.
fn walk_images(rom: &[u8], rom_base: usize) -> Vec<RomImageInfo> {
    let mut images = Vec::new();
    let mut offset = rom_base;

    while read_u16_le(rom, offset) == Some(ROM_SIGNATURE) {
        let Some(pcir_ptr) = read_u16_le(rom, offset + ROM_PCIR_PTR_OFFSET) else {
            break;
        };
        let Some(pcir) = read_at::<PcirHeader>(rom, offset + pcir_ptr as usize) else {
            break;
        };
        if pcir.signature != PCIR_SIGNATURE || pcir.image_size() == 0 {
            break;
        }

        images.push(RomImageInfo {
            base: offset,
            code_type: pcir.code_type,
            last: pcir.is_last(),
        });

        if pcir.is_last() {
            break;
        }
        offset += pcir.image_size();
    }

    images
}

/// Pass 3: locate the BIT header within 64 KiB of the ROM base.
fn find_bit(rom: &[u8], rom_base: usize) -> FwsecResult<(BitHeader, usize)> {
    let end = rom.len().min(rom_base + BIT_SCAN_WINDOW);

    for offset in rom_base..end {
        if read_u16_le(rom, offset) != Some(BIT_PREFIX) {
            continue;
        }
        let Some(sig) = rom.get(offset + 2..offset + 6) else {
            break;
        };
        if sig != BIT_SIGNATURE {
            continue;
        }
        if let Some(hdr) = read_at::<BitHeader>(rom, offset) {
            if hdr.is_valid() {
                return Ok((hdr, offset));
            }
        }
    }

    Err(FwsecError::InvalidVbios(VbiosSection::Bit))
}

/// Tokens follow the BIT header contiguously; id 0 terminates the list
/// early regardless of the advertised count.
fn bit_tokens(rom: &[u8], hdr: &BitHeader, bit_offset: usize) -> Vec<BitToken> {
    let mut tokens = Vec::new();
    let base = bit_offset + hdr.header_size as usize;

    for i in 0..hdr.token_count as usize {
        let Some(token) = read_at::<BitToken>(rom, base + i * hdr.token_size as usize) else {
            break;
        };
        if token.id == 0 {
            break;
        }
        tokens.push(token);
    }

    tokens
}

/// Whether a structurally valid PMU lookup table (header plus entry array)
/// sits at `offset`.
fn pmu_header_at(rom: &[u8], offset: usize) -> bool {
    let Some(hdr) = read_at::<PmuLookupHeader>(rom, offset) else {
        return false;
    };
    hdr.is_valid()
        && offset
            + hdr.header_size as usize
            + hdr.entry_count as usize * hdr.entry_size as usize
            <= rom.len()
}

/// Whether the table at `offset` carries a FWSEC entry in either layout.
fn table_has_fwsec_entry(rom: &[u8], offset: usize) -> bool {
    find_fwsec_entry(rom, offset, false).is_ok()
}

/// Pass 4: locate the PMU lookup table.
fn locate_pmu_table(
    rom: &[u8],
    rom_base: usize,
    image_base: usize,
    tokens: &[BitToken],
) -> FwsecResult<usize> {
    // Ada path: token 0x50 carries a raw array of 32-bit table offsets.
    if let Some(token) = tokens.iter().find(|t| t.id == BIT_TOKEN_PMU_TABLE) {
        let data_off = image_base + token.data_offset as usize;
        for i in 0..token.data_size as usize / 4 {
            let Some(candidate) = read_u32_le(rom, data_off + i * 4) else {
                break;
            };
            if candidate == 0 {
                continue;
            }
            // The array entries are ambiguous between absolute and
            // rom_base-relative; take the first that validates.
            for offset in [candidate as usize, rom_base + candidate as usize] {
                if pmu_header_at(rom, offset) {
                    debug!("vbios: PMU table via token 0x50 at {:#x}", offset);
                    return Ok(offset);
                }
            }
        }
    }

    // Pre-Ada path: token 0x70 points at a falcon data block holding the
    // ucode table offset.
    if let Some(token) = tokens.iter().find(|t| t.id == BIT_TOKEN_FALCON_DATA) {
        if let Some(fd) = read_at::<FalconData>(rom, image_base + token.data_offset as usize) {
            for offset in [
                image_base + fd.ucode_table_offset as usize,
                fd.ucode_table_offset as usize,
            ] {
                if pmu_header_at(rom, offset) {
                    debug!("vbios: PMU table via token 0x70 at {:#x}", offset);
                    return Ok(offset);
                }
            }
        }
    }

    // Last resort: scan for the {01 06 06 xx} header prefix backed by a
    // FWSEC entry.
    let mut offset = PMU_TABLE_SCAN_START;
    while offset + PMU_TABLE_HEADER_SIZE as usize <= rom.len() {
        if pmu_header_at(rom, offset) && table_has_fwsec_entry(rom, offset) {
            debug!("vbios: PMU table via pattern scan at {:#x}", offset);
            return Ok(offset);
        }
        offset += 4;
    }

    Err(FwsecError::InvalidVbios(VbiosSection::PmuTable))
}

/// Pass 5a: find the FWSEC entry in the lookup table and return its data
/// offset. Six-byte entries are probed in both layouts.
fn find_fwsec_entry(rom: &[u8], pmu_offset: usize, prefer_debug: bool) -> FwsecResult<u32> {
    let hdr: PmuLookupHeader = read_at(rom, pmu_offset)
        .ok_or(FwsecError::OutOfBounds(VbiosSection::PmuTable))?;
    if !hdr.is_valid() {
        return Err(FwsecError::InvalidVbios(VbiosSection::PmuTable));
    }

    let entry_base = pmu_offset + hdr.header_size as usize;
    let mut prod: Option<u32> = None;
    let mut dbg: Option<u32> = None;

    for i in 0..hdr.entry_count as usize {
        let entry_off = entry_base + i * hdr.entry_size as usize;
        let Some(entry) = read_at::<PmuLookupEntry>(rom, entry_off) else {
            return Err(FwsecError::OutOfBounds(VbiosSection::PmuTable));
        };
        let Some(entry_ada) = read_at::<PmuLookupEntryAda>(rom, entry_off) else {
            return Err(FwsecError::OutOfBounds(VbiosSection::PmuTable));
        };

        let app8 = entry.app_id;
        let app16 = entry_ada.app_id;
        let data_offset = entry.data_offset;

        if app8 == PMU_APP_ID_FWSEC_PROD || app16 == u16::from(PMU_APP_ID_FWSEC_PROD) {
            prod.get_or_insert(data_offset);
        }
        if app8 == PMU_APP_ID_FWSEC_DBG || app16 == u16::from(PMU_APP_ID_FWSEC_DBG) {
            dbg.get_or_insert(data_offset);
        }
    }

    let chosen = if prefer_debug {
        dbg.or(prod)
    } else {
        prod.or(dbg)
    };
    chosen.ok_or(FwsecError::InvalidVbios(VbiosSection::PmuTable))
}

/// A descriptor candidate at `offset`: a plausible NVFW binary header,
/// optionally an outer container whose `header_offset` points at the real
/// descriptor, with sane memory sizes.
fn descriptor_at(rom: &[u8], offset: usize) -> Option<(FalconUcodeDescV3, usize)> {
    let hdr: NvfwBinHdr = read_at(rom, offset)?;
    if !hdr.is_plausible() {
        return None;
    }

    if hdr.header_offset != 0 {
        let inner_off = offset.checked_add(hdr.header_offset as usize)?;
        if let Some(inner_hdr) = read_at::<NvfwBinHdr>(rom, inner_off) {
            if inner_hdr.is_plausible() {
                if let Some(desc) = desc_with_sane_sizes(rom, inner_off) {
                    return Some((desc, inner_off));
                }
            }
        }
    }

    desc_with_sane_sizes(rom, offset).map(|desc| (desc, offset))
}

fn desc_with_sane_sizes(rom: &[u8], offset: usize) -> Option<FalconUcodeDescV3> {
    let desc: FalconUcodeDescV3 = read_at(rom, offset)?;
    if desc.imem_load_size == 0
        || desc.imem_load_size > IMEM_MAX_SIZE
        || desc.dmem_load_size == 0
        || desc.dmem_load_size > DMEM_MAX_SIZE
    {
        return None;
    }
    Some(desc)
}

/// Pass 5b: resolve the entry's data offset to a validated descriptor.
///
/// The offset is ambiguous between absolute-in-ROM and rom_base-relative;
/// absolute is tried first. If neither validates, a bounded linear
/// search around the expected location is permitted.
fn locate_descriptor(
    rom: &[u8],
    rom_base: usize,
    data_offset: u32,
) -> FwsecResult<(FalconUcodeDescV3, usize)> {
    let expected = data_offset as usize;

    for offset in [expected, rom_base + expected] {
        if let Some(found) = descriptor_at(rom, offset) {
            return Ok(found);
        }
    }

    let start = expected.saturating_sub(DESC_RESCUE_WINDOW) & !3;
    let end = rom
        .len()
        .min(expected.saturating_add(DESC_RESCUE_WINDOW));
    let mut offset = start;
    while offset + FALCON_UCODE_DESC_V3_SIZE <= end {
        if let Some(found) = descriptor_at(rom, offset) {
            debug!("vbios: descriptor rescued at {:#x}", found.1);
            return Ok(found);
        }
        offset += 4;
    }

    Err(FwsecError::InvalidVbios(VbiosSection::FwsecDesc))
}
