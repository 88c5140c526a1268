/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains data structures for the NVIDIA VBIOS image and the FWSEC
    firmware it embeds. All multi-byte fields are little-endian and the
    structures carry no padding.

--*/

#![no_std]

use core::mem::size_of;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Expansion ROM signature (0xAA55 little-endian).
pub const ROM_SIGNATURE: u16 = 0xAA55;
/// Stride used when scanning for the expansion ROM signature.
pub const ROM_SCAN_STRIDE: usize = 0x100;
/// Offset of the PCIR pointer inside the ROM header.
pub const ROM_PCIR_PTR_OFFSET: usize = 0x18;
/// PCI data structure signature.
pub const PCIR_SIGNATURE: [u8; 4] = *b"PCIR";

/// PCIR code type for x86 (PC-AT) images.
pub const PCIR_CODE_TYPE_X86: u8 = 0x00;
/// PCIR code type for EFI images.
pub const PCIR_CODE_TYPE_EFI: u8 = 0x03;
/// PCIR code type for the FWSEC-embedding image.
pub const PCIR_CODE_TYPE_FWSEC: u8 = 0xE0;
/// Bit 7 of the PCIR indicator marks the last image of the chain.
pub const PCIR_LAST_IMAGE: u8 = 0x80;

/// Two bytes preceding the BIT signature.
pub const BIT_PREFIX: u16 = 0xFFB8;
/// BIT signature, "BIT\0".
pub const BIT_SIGNATURE: [u8; 4] = *b"BIT\0";
/// BIT search window after the ROM base.
pub const BIT_SCAN_WINDOW: usize = 0x10000;

/// BIT token carrying the raw PMU-table offset array (Ada Lovelace).
pub const BIT_TOKEN_PMU_TABLE: u8 = 0x50;
/// BIT token carrying the falcon ucode table pointer (pre-Ada).
pub const BIT_TOKEN_FALCON_DATA: u8 = 0x70;

/// PMU lookup table application id for FWSEC-PROD (one-byte form).
pub const PMU_APP_ID_FWSEC_PROD: u8 = 0x85;
/// PMU lookup table application id for FWSEC-DBG (one-byte form).
pub const PMU_APP_ID_FWSEC_DBG: u8 = 0x86;

/// Expected PMU lookup table header: version 1, 6-byte header, 6-byte entries.
pub const PMU_TABLE_VERSION: u8 = 0x01;
pub const PMU_TABLE_HEADER_SIZE: u8 = 0x06;
pub const PMU_TABLE_ENTRY_SIZE: u8 = 0x06;
pub const PMU_TABLE_MAX_ENTRIES: u8 = 32;
/// Start offset of the pattern fallback scan for the PMU table.
pub const PMU_TABLE_SCAN_START: usize = 0x9000;

/// PCI vendor id of NVIDIA.
pub const NVIDIA_VENDOR_ID: u16 = 0x10DE;
/// Size of one RSA-3K firmware signature.
pub const RSA3K_SIGNATURE_SIZE: usize = 384;
/// Descriptors with a total size at or above this are rejected.
pub const DESC_MAX_TOTAL_SIZE: u32 = 0x10_0000;
/// Window for the descriptor rescue scan around the expected location.
pub const DESC_RESCUE_WINDOW: usize = 0x10000;

/// Falcon IMEM images larger than this are rejected (256 KiB).
pub const IMEM_MAX_SIZE: u32 = 0x4_0000;
/// Falcon DMEM images larger than this are rejected (64 KiB).
pub const DMEM_MAX_SIZE: u32 = 0x1_0000;

/// Application interface id of the DMEM mapper.
pub const APPIF_ID_DMEMMAPPER: u32 = 0x4;
/// DMEM mapper signature, "DMAP".
pub const DMEM_MAPPER_SIGNATURE: u32 = 0x5041_4D44;
/// Accepted DMEM mapper versions.
pub const DMEM_MAPPER_VERSIONS: [u32; 2] = [0x0003_0000, 0x0040_0003];
/// Required DMEM mapper structure size.
pub const DMEM_MAPPER_SIZE: u32 = 64;
/// Byte offset of `init_cmd` inside the DMEM mapper.
pub const DMEM_MAPPER_INIT_CMD_OFFSET: usize = 28;

/// FWSEC command selector for FRTS (set up WPR2).
pub const FWSEC_CMD_FRTS: u32 = 0x15;

/// Smallest VBIOS image accepted as input.
pub const VBIOS_MIN_SIZE: usize = 0x4000;
/// Largest VBIOS image accepted as input.
pub const VBIOS_MAX_SIZE: usize = 0x10_0000;

/// Expansion ROM header at each 0xAA55 signature.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct RomHeader {
    pub signature: u16,
    pub reserved: [u8; 0x16],
    pub pcir_offset: u16,
}

/// PCI data structure, one per expansion ROM image.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct PcirHeader {
    pub signature: [u8; 4],
    pub vendor_id: u16,
    pub device_id: u16,
    pub reserved: u16,
    pub length: u16,
    pub revision: u8,
    pub class_code: [u8; 3],
    /// Image length in 512-byte units.
    pub image_length: u16,
    pub code_revision: u16,
    pub code_type: u8,
    /// Bit 7 set on the last image of the chain.
    pub indicator: u8,
    pub max_runtime_size: u16,
    pub config_utility_ptr: u16,
    pub dmtf_clp_ptr: u16,
}

impl PcirHeader {
    /// Image size in bytes.
    pub fn image_size(&self) -> usize {
        self.image_length as usize * 512
    }

    /// Whether this is the last image of the chain.
    pub fn is_last(&self) -> bool {
        self.indicator & PCIR_LAST_IMAGE != 0
    }
}

/// BIOS Information Table header, preceded by the 0xFFB8 prefix bytes.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct BitHeader {
    pub prefix: u16,
    pub signature: [u8; 4],
    pub version: u16,
    /// Header size in bytes, counted from the prefix. Tokens follow.
    pub header_size: u8,
    pub token_size: u8,
    pub token_count: u8,
    pub checksum: u8,
}

impl BitHeader {
    /// Structural validation per the BIT format limits.
    pub fn is_valid(&self) -> bool {
        self.header_size >= 1
            && self.header_size < 32
            && (6..=12).contains(&self.token_size)
            && self.token_count >= 1
            && self.token_count < 64
    }
}

/// One BIT token. `data_offset` is relative to the containing image base.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct BitToken {
    pub id: u8,
    pub version: u8,
    pub data_size: u16,
    pub data_offset: u16,
}

/// Payload of the pre-Ada FALCON_DATA token (0x70).
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct FalconData {
    pub ucode_table_offset: u32,
    pub ucode_table_size: u32,
}

/// PMU lookup table header.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct PmuLookupHeader {
    pub version: u8,
    pub header_size: u8,
    pub entry_size: u8,
    pub entry_count: u8,
    pub desc_version: u8,
    pub reserved: u8,
}

impl PmuLookupHeader {
    /// The exact header signature the Ada tables carry.
    pub fn is_valid(&self) -> bool {
        self.version == PMU_TABLE_VERSION
            && self.header_size == PMU_TABLE_HEADER_SIZE
            && self.entry_size == PMU_TABLE_ENTRY_SIZE
            && self.entry_count >= 1
            && self.entry_count <= PMU_TABLE_MAX_ENTRIES
    }
}

/// PMU lookup table entry, pre-Ada layout (one-byte application id).
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct PmuLookupEntry {
    pub app_id: u8,
    pub target_id: u8,
    pub data_offset: u32,
}

/// PMU lookup table entry, Ada layout (two-byte application id).
///
/// Both layouts are 6 bytes; the decoder probes each.
#[repr(C, packed)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct PmuLookupEntryAda {
    pub app_id: u16,
    pub data_offset: u32,
}

/// NVIDIA firmware binary header, leading the falcon ucode descriptor.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct NvfwBinHdr {
    pub vendor_id: u16,
    pub version: u16,
    pub reserved: u32,
    pub total_size: u32,
    pub header_offset: u32,
    pub header_size: u32,
    pub data_offset: u32,
    pub data_size: u32,
}

impl NvfwBinHdr {
    /// Acceptance test for a descriptor candidate.
    pub fn is_plausible(&self) -> bool {
        self.vendor_id == NVIDIA_VENDOR_ID
            && (1..=16).contains(&self.version)
            && self.total_size > 0
            && self.total_size < DESC_MAX_TOTAL_SIZE
    }
}

/// Version-3 falcon ucode descriptor. The signatures, IMEM image and DMEM
/// image follow it contiguously in the ROM.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct FalconUcodeDescV3 {
    pub bin_hdr: NvfwBinHdr,
    pub stored_size: u32,
    pub pkc_data_offset: u32,
    pub interface_offset: u32,
    pub imem_phys_base: u32,
    pub imem_load_size: u32,
    pub imem_virt_base: u32,
    pub dmem_phys_base: u32,
    pub dmem_load_size: u32,
    pub engine_id_mask: u32,
    pub ucode_id: u8,
    pub signature_count: u8,
    pub signature_versions: u16,
}

/// Size of [`FalconUcodeDescV3`] on the wire.
pub const FALCON_UCODE_DESC_V3_SIZE: usize = size_of::<FalconUcodeDescV3>();

/// Falcon application interface header, at `interface_offset` inside DMEM.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct FalconAppifHdrV1 {
    pub version: u8,
    pub header_size: u8,
    pub entry_size: u8,
    pub entry_count: u8,
}

/// Falcon application interface entry.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct FalconAppifEntryV1 {
    pub id: u32,
    pub dmem_offset: u32,
}

/// DMEM mapper control block ("DMAP"), the command interface of FWSEC.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct DmemMapperV3 {
    pub signature: u32,
    pub version: u32,
    pub size: u32,
    /// Command-in buffer offset, relative to the mapper itself.
    pub cmd_in_buffer_offset: u32,
    pub cmd_in_buffer_size: u32,
    pub cmd_out_buffer_offset: u32,
    pub cmd_out_buffer_size: u32,
    pub init_cmd: u32,
    pub features: u32,
    pub cmd_mask0: u32,
    pub cmd_mask1: u32,
    pub reserved: [u8; 20],
}

impl DmemMapperV3 {
    /// Signature, version and size checks for a mapper candidate.
    pub fn is_valid(&self) -> bool {
        self.signature == DMEM_MAPPER_SIGNATURE
            && DMEM_MAPPER_VERSIONS.contains(&self.version)
            && self.size == DMEM_MAPPER_SIZE
    }
}

/// FRTS command written into the mapper's command-in buffer.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Debug, Clone, Copy)]
pub struct FwsecFrtsCmd {
    pub cmd: u32,
    /// FRTS region offset, measured back from the end of the framebuffer.
    pub frts_region_offset: u32,
    pub frts_region_size: u32,
    pub reserved: [u32; 5],
}

/// Size of [`FwsecFrtsCmd`] on the wire.
pub const FWSEC_FRTS_CMD_SIZE: usize = size_of::<FwsecFrtsCmd>();

/// Bounds-checked read of a structure at `offset` in `buf`.
pub fn read_at<T: FromBytes>(buf: &[u8], offset: usize) -> Option<T> {
    let src = buf.get(offset..)?;
    T::read_from_prefix(src).ok().map(|(value, _)| value)
}

/// Little-endian u16 at `offset`, if in bounds.
pub fn read_u16_le(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Little-endian u32 at `offset`, if in bounds.
pub fn read_u32_le(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
