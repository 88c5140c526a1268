/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Synthetic VBIOS builder. Assembles complete (or deliberately broken)
    ROM images for the decoder and orchestration test suites.

--*/

use anyhow::{ensure, Result};
use zerocopy::IntoBytes;

use fwsec_image_types::*;

/// Builds a synthetic VBIOS image.
///
/// The defaults produce the canonical 64 KiB test image: one x86 PCIR
/// image, a BIT header at 0x200, token 0x50 pointing at a one-entry offset
/// array, a PMU lookup table at 0x280 with a single FWSEC-PROD entry, and a
/// descriptor at 0x1000 carrying 0x400 bytes of IMEM, 0x200 bytes of DMEM
/// and one signature.
#[derive(Debug, Clone)]
pub struct VbiosBuilder {
    rom_base: usize,
    total_len: usize,
    bit_offset: usize,
    pmu_table_offset: usize,
    desc_offset: usize,
    imem_size: usize,
    dmem_size: usize,
    signature_count: u8,
    signature_versions: u16,
    entry_offset_relative: bool,
    ada_entry_layout: bool,
    token_terminator_first: bool,
    use_token70: bool,
    omit_pmu_tokens: bool,
    dbg_entry_offset: Option<u32>,
    extra_desc_offset: Option<usize>,
    entry_override: Option<u32>,
    corrupt_appif_header: bool,
    omit_dmem_mapper: bool,
    cmd_in_buffer_size: u32,
}

impl Default for VbiosBuilder {
    fn default() -> Self {
        Self {
            rom_base: 0,
            total_len: 0x1_0000,
            bit_offset: 0x200,
            pmu_table_offset: 0x280,
            desc_offset: 0x1000,
            imem_size: 0x400,
            dmem_size: 0x200,
            signature_count: 1,
            signature_versions: 0b1,
            entry_offset_relative: false,
            ada_entry_layout: false,
            token_terminator_first: false,
            use_token70: false,
            omit_pmu_tokens: false,
            dbg_entry_offset: None,
            extra_desc_offset: None,
            entry_override: None,
            corrupt_appif_header: false,
            omit_dmem_mapper: false,
            cmd_in_buffer_size: 0x40,
        }
    }
}

/// In-DMEM layout of the synthetic firmware.
const APPIF_OFFSET: u32 = 0x40;
const MAPPER_OFFSET: u32 = 0x80;
const CMD_IN_OFFSET: u32 = 0x40;

impl VbiosBuilder {
    /// Pad the image so the expansion ROM starts at `rom_base`.
    pub fn rom_base(mut self, rom_base: usize) -> Self {
        self.rom_base = rom_base;
        self
    }

    /// Place the PMU lookup table at `offset` relative to the ROM base.
    pub fn pmu_table_offset(mut self, offset: usize) -> Self {
        self.pmu_table_offset = offset;
        self
    }

    /// Store the FWSEC entry offset relative to the ROM base instead of as
    /// an absolute image offset.
    pub fn entry_offset_relative(mut self, relative: bool) -> Self {
        self.entry_offset_relative = relative;
        self
    }

    /// Use the Ada entry layout (two-byte application id).
    pub fn ada_entry_layout(mut self, ada: bool) -> Self {
        self.ada_entry_layout = ada;
        self
    }

    /// Emit an id-0 token ahead of the useful ones, terminating the scan.
    pub fn token_terminator_first(mut self, terminator: bool) -> Self {
        self.token_terminator_first = terminator;
        self
    }

    /// Reference the PMU table through the pre-Ada 0x70 token.
    pub fn use_token70(mut self, token70: bool) -> Self {
        self.use_token70 = token70;
        self
    }

    /// Emit neither the 0x50 nor the 0x70 token.
    pub fn omit_pmu_tokens(mut self, omit: bool) -> Self {
        self.omit_pmu_tokens = omit;
        self
    }

    /// Add a FWSEC-DBG entry pointing at `offset` (absolute).
    pub fn with_dbg_entry(mut self, offset: u32) -> Self {
        self.dbg_entry_offset = Some(offset);
        self
    }

    /// Write a second copy of the descriptor and payload at `offset`.
    pub fn desc_also_at(mut self, offset: usize) -> Self {
        self.extra_desc_offset = Some(offset);
        self
    }

    /// Override the offset stored in the FWSEC-PROD entry.
    pub fn entry_points_at(mut self, offset: u32) -> Self {
        self.entry_override = Some(offset);
        self
    }

    pub fn signature_versions(mut self, versions: u16) -> Self {
        self.signature_versions = versions;
        self
    }

    /// Corrupt the application interface header so only the DMAP scan can
    /// locate the mapper.
    pub fn corrupt_appif_header(mut self, corrupt: bool) -> Self {
        self.corrupt_appif_header = corrupt;
        self
    }

    /// Leave the DMEM mapper out entirely.
    pub fn omit_dmem_mapper(mut self, omit: bool) -> Self {
        self.omit_dmem_mapper = omit;
        self
    }

    pub fn cmd_in_buffer_size(mut self, size: u32) -> Self {
        self.cmd_in_buffer_size = size;
        self
    }

    /// The IMEM payload bytes the image carries.
    pub fn imem_payload(&self) -> Vec<u8> {
        (0..self.imem_size).map(|i| (i % 251) as u8).collect()
    }

    /// The DMEM payload bytes, including the embedded application
    /// interface and DMEM mapper.
    pub fn dmem_payload(&self) -> Vec<u8> {
        let mut dmem = vec![0u8; self.dmem_size];

        // Filler beyond the structured area; strictly increasing so it can
        // never collide with the "DMAP" signature.
        for (i, byte) in dmem.iter_mut().enumerate().skip(0x100) {
            *byte = (i % 191) as u8;
        }

        if self.omit_dmem_mapper {
            return dmem;
        }

        let appif = FalconAppifHdrV1 {
            version: if self.corrupt_appif_header { 2 } else { 1 },
            header_size: 4,
            entry_size: 8,
            entry_count: 1,
        };
        let appif_off = APPIF_OFFSET as usize;
        dmem[appif_off..appif_off + 4].copy_from_slice(appif.as_bytes());

        let entry = FalconAppifEntryV1 {
            id: APPIF_ID_DMEMMAPPER,
            dmem_offset: MAPPER_OFFSET,
        };
        dmem[appif_off + 4..appif_off + 12].copy_from_slice(entry.as_bytes());

        let mapper = DmemMapperV3 {
            signature: DMEM_MAPPER_SIGNATURE,
            version: DMEM_MAPPER_VERSIONS[0],
            size: DMEM_MAPPER_SIZE,
            cmd_in_buffer_offset: CMD_IN_OFFSET,
            cmd_in_buffer_size: self.cmd_in_buffer_size,
            cmd_out_buffer_offset: CMD_IN_OFFSET + 0x40,
            cmd_out_buffer_size: 0x20,
            init_cmd: 0,
            features: 0,
            cmd_mask0: 1 << FWSEC_CMD_FRTS,
            cmd_mask1: 0,
            reserved: [0; 20],
        };
        let mapper_off = MAPPER_OFFSET as usize;
        dmem[mapper_off..mapper_off + 64].copy_from_slice(mapper.as_bytes());

        dmem
    }

    /// The `idx`-th signature payload.
    pub fn signature_payload(&self, idx: usize) -> Vec<u8> {
        (0..RSA3K_SIGNATURE_SIZE)
            .map(|i| (idx as u8).wrapping_mul(37).wrapping_add((i % 113) as u8))
            .collect()
    }

    fn descriptor(&self) -> FalconUcodeDescV3 {
        let payload =
            self.signature_count as usize * RSA3K_SIGNATURE_SIZE + self.imem_size + self.dmem_size;
        FalconUcodeDescV3 {
            bin_hdr: NvfwBinHdr {
                vendor_id: NVIDIA_VENDOR_ID,
                version: 3,
                reserved: 0,
                total_size: (FALCON_UCODE_DESC_V3_SIZE + payload) as u32,
                header_offset: 0,
                header_size: FALCON_UCODE_DESC_V3_SIZE as u32,
                data_offset: FALCON_UCODE_DESC_V3_SIZE as u32,
                data_size: (self.imem_size + self.dmem_size) as u32,
            },
            stored_size: (self.imem_size + self.dmem_size) as u32,
            pkc_data_offset: FALCON_UCODE_DESC_V3_SIZE as u32,
            interface_offset: APPIF_OFFSET,
            imem_phys_base: 0,
            imem_load_size: self.imem_size as u32,
            imem_virt_base: 0x100,
            dmem_phys_base: 0,
            dmem_load_size: self.dmem_size as u32,
            engine_id_mask: 0x0400,
            ucode_id: 9,
            signature_count: self.signature_count,
            signature_versions: self.signature_versions,
        }
    }

    fn write_descriptor_payload(&self, buf: &mut [u8], offset: usize) -> Result<()> {
        let desc = self.descriptor();
        put(buf, offset, desc.as_bytes())?;

        let mut cursor = offset + FALCON_UCODE_DESC_V3_SIZE;
        for idx in 0..self.signature_count as usize {
            put(buf, cursor, &self.signature_payload(idx))?;
            cursor += RSA3K_SIGNATURE_SIZE;
        }
        put(buf, cursor, &self.imem_payload())?;
        cursor += self.imem_size;
        put(buf, cursor, &self.dmem_payload())?;
        Ok(())
    }

    /// Assemble the image.
    pub fn build(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.total_len];
        let base = self.rom_base;
        ensure!(base % ROM_SCAN_STRIDE == 0, "rom_base must be stride aligned");

        // Expansion ROM header with the PCIR pointer at +0x18.
        let pcir_off = 0x1A0u16;
        let rom_hdr = RomHeader {
            signature: ROM_SIGNATURE,
            reserved: [0; 0x16],
            pcir_offset: pcir_off,
        };
        put(&mut buf, base, rom_hdr.as_bytes())?;

        let pcir = PcirHeader {
            signature: PCIR_SIGNATURE,
            vendor_id: NVIDIA_VENDOR_ID,
            device_id: 0x2684,
            reserved: 0,
            length: 28,
            revision: 3,
            class_code: [0x00, 0x00, 0x03],
            image_length: ((self.total_len - base) / 512) as u16,
            code_revision: 0,
            code_type: PCIR_CODE_TYPE_X86,
            indicator: PCIR_LAST_IMAGE,
            max_runtime_size: 0,
            config_utility_ptr: 0,
            dmtf_clp_ptr: 0,
        };
        put(&mut buf, base + pcir_off as usize, pcir.as_bytes())?;

        // BIT header and tokens.
        let token50_data_rel = 0x260u16;
        let mut tokens: Vec<BitToken> = Vec::new();
        if self.token_terminator_first {
            tokens.push(BitToken {
                id: 0,
                version: 0,
                data_size: 0,
                data_offset: 0,
            });
        }
        tokens.push(BitToken {
            id: 0x32,
            version: 1,
            data_size: 0,
            data_offset: 0,
        });
        if !self.omit_pmu_tokens {
            tokens.push(BitToken {
                id: if self.use_token70 {
                    BIT_TOKEN_FALCON_DATA
                } else {
                    BIT_TOKEN_PMU_TABLE
                },
                version: 1,
                data_size: if self.use_token70 { 8 } else { 4 },
                data_offset: token50_data_rel,
            });
        }

        let bit = BitHeader {
            prefix: BIT_PREFIX,
            signature: BIT_SIGNATURE,
            version: 0x0100,
            header_size: 12,
            token_size: 6,
            token_count: tokens.len() as u8,
            checksum: 0,
        };
        let bit_abs = base + self.bit_offset;
        put(&mut buf, bit_abs, bit.as_bytes())?;
        for (i, token) in tokens.iter().enumerate() {
            put(&mut buf, bit_abs + 12 + i * 6, token.as_bytes())?;
        }

        // Token data: either the raw offset array (0x50) or the falcon
        // data block (0x70), both referencing the PMU table.
        let pmu_abs = base + self.pmu_table_offset;
        let token_data_abs = base + token50_data_rel as usize;
        if self.use_token70 {
            let fd = FalconData {
                ucode_table_offset: self.pmu_table_offset as u32,
                ucode_table_size: 0x100,
            };
            put(&mut buf, token_data_abs, fd.as_bytes())?;
        } else {
            put(&mut buf, token_data_abs, &(pmu_abs as u32).to_le_bytes())?;
        }

        // PMU lookup table.
        let desc_abs = base + self.desc_offset;
        let prod_offset = self.entry_override.unwrap_or(if self.entry_offset_relative {
            self.desc_offset as u32
        } else {
            desc_abs as u32
        });

        let entry_count = 1 + self.dbg_entry_offset.is_some() as u8;
        let pmu_hdr = PmuLookupHeader {
            version: PMU_TABLE_VERSION,
            header_size: PMU_TABLE_HEADER_SIZE,
            entry_size: PMU_TABLE_ENTRY_SIZE,
            entry_count,
            desc_version: 0,
            reserved: 0,
        };
        put(&mut buf, pmu_abs, pmu_hdr.as_bytes())?;

        let mut entry_cursor = pmu_abs + PMU_TABLE_HEADER_SIZE as usize;
        self.write_entry(&mut buf, entry_cursor, PMU_APP_ID_FWSEC_PROD, prod_offset)?;
        entry_cursor += PMU_TABLE_ENTRY_SIZE as usize;
        if let Some(dbg_offset) = self.dbg_entry_offset {
            self.write_entry(&mut buf, entry_cursor, PMU_APP_ID_FWSEC_DBG, dbg_offset)?;
        }

        // Descriptor plus payload.
        self.write_descriptor_payload(&mut buf, desc_abs)?;
        if let Some(extra) = self.extra_desc_offset {
            self.write_descriptor_payload(&mut buf, extra)?;
        }

        Ok(buf)
    }

    fn write_entry(&self, buf: &mut [u8], offset: usize, app_id: u8, data_offset: u32) -> Result<()> {
        if self.ada_entry_layout {
            let entry = PmuLookupEntryAda {
                app_id: u16::from(app_id),
                data_offset,
            };
            put(buf, offset, entry.as_bytes())
        } else {
            let entry = PmuLookupEntry {
                app_id,
                target_id: 0x07,
                data_offset,
            };
            put(buf, offset, entry.as_bytes())
        }
    }
}

fn put(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Result<()> {
    let end = offset + bytes.len();
    ensure!(end <= buf.len(), "write at {offset:#x}..{end:#x} escapes the image");
    buf[offset..end].copy_from_slice(bytes);
    Ok(())
}
