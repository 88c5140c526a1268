/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    Error types for the FWSEC-FRTS bring-up engine.

--*/

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(test)]
extern crate alloc;

use core::fmt;

/// Result type used throughout the bring-up engine.
pub type FwsecResult<T> = Result<T, FwsecError>;

/// VBIOS structure on which validation or a bounds check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VbiosSection {
    /// Expansion ROM header (0xAA55 signature).
    Rom,
    /// PCI data structure.
    Pcir,
    /// BIOS Information Table.
    Bit,
    /// PMU lookup table.
    PmuTable,
    /// Falcon ucode descriptor.
    FwsecDesc,
    /// DMEM mapper application interface block.
    DmemMapper,
}

/// Wait stage on which a poll cap expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStage {
    /// GFW boot progress scratch never reported completion.
    GfwBoot,
    /// Falcon memory scrub did not finish.
    MemScrub,
    /// Core-select acknowledgement was not observed.
    CoreSelect,
    /// A DMA transfer chunk never went idle.
    Dma,
    /// The falcon did not halt after start.
    FalconHalt,
}

/// Failure of a single load method within the BROM/DMA/PIO cascade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodError {
    /// The method timed out (DMA chunk or halt wait).
    Timeout(TimeoutStage),
    /// The falcon halted but the FRTS scratch carries an error code.
    Frts(u16),
    /// The falcon halted cleanly but WPR2 read back as zero.
    Wpr2NotSet,
}

/// Every failure the bring-up engine can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwsecError {
    /// Signature or structure validation failed while parsing the VBIOS.
    InvalidVbios(VbiosSection),
    /// A computed offset escaped the ROM buffer.
    OutOfBounds(VbiosSection),
    /// A spin-wait exhausted its cap.
    Timeout(TimeoutStage),
    /// `PMC_BOOT_0` reports an architecture other than Ada Lovelace.
    ArchUnsupported(u8),
    /// WPR2 was already configured before the bring-up ran. Informative;
    /// reported only when the caller opted out of accepting the region.
    Wpr2AlreadySet { lo: u64, hi: u64 },
    /// FWSEC halted but left a non-zero FRTS error code.
    FrtsError(u16),
    /// FWSEC halted cleanly but WPR2 read back as zero.
    Wpr2NotSet,
    /// No firmware signature version is usable with the fused version.
    SignatureUnavailable(u32),
    /// The DMA allocator could not provide a staging buffer.
    DmaAllocFailed,
    /// BROM, DMA and PIO loading all failed; carries each method's cause.
    AllMethodsFailed {
        brom: MethodError,
        dma: MethodError,
        pio: MethodError,
    },
}

impl fmt::Display for VbiosSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VbiosSection::Rom => "expansion ROM",
            VbiosSection::Pcir => "PCI data structure",
            VbiosSection::Bit => "BIT header",
            VbiosSection::PmuTable => "PMU lookup table",
            VbiosSection::FwsecDesc => "FWSEC descriptor",
            VbiosSection::DmemMapper => "DMEM mapper",
        };
        f.write_str(name)
    }
}

impl fmt::Display for TimeoutStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TimeoutStage::GfwBoot => "GFW boot",
            TimeoutStage::MemScrub => "memory scrub",
            TimeoutStage::CoreSelect => "core select",
            TimeoutStage::Dma => "DMA transfer",
            TimeoutStage::FalconHalt => "falcon halt",
        };
        f.write_str(name)
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MethodError::Timeout(stage) => write!(f, "timeout waiting for {}", stage),
            MethodError::Frts(code) => write!(f, "FRTS error {:#06x}", code),
            MethodError::Wpr2NotSet => f.write_str("WPR2 not set"),
        }
    }
}

impl fmt::Display for FwsecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FwsecError::InvalidVbios(section) => write!(f, "invalid VBIOS: {}", section),
            FwsecError::OutOfBounds(section) => {
                write!(f, "offset out of ROM bounds while parsing {}", section)
            }
            FwsecError::Timeout(stage) => write!(f, "timeout waiting for {}", stage),
            FwsecError::ArchUnsupported(arch) => {
                write!(f, "unsupported GPU architecture {:#04x}", arch)
            }
            FwsecError::Wpr2AlreadySet { lo, hi } => {
                write!(f, "WPR2 already configured: {:#x}..{:#x}", lo, hi)
            }
            FwsecError::FrtsError(code) => write!(f, "FWSEC reported FRTS error {:#06x}", code),
            FwsecError::Wpr2NotSet => f.write_str("FWSEC halted but WPR2 is not configured"),
            FwsecError::SignatureUnavailable(fuse) => {
                write!(f, "no signature usable with fuse version {}", fuse)
            }
            FwsecError::DmaAllocFailed => f.write_str("DMA staging buffer allocation failed"),
            FwsecError::AllMethodsFailed { brom, dma, pio } => write!(
                f,
                "all load methods failed: brom: {}; dma: {}; pio: {}",
                brom, dma, pio
            ),
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "std")] {
        impl std::error::Error for FwsecError {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_display_carries_discriminators() {
        assert_eq!(
            FwsecError::InvalidVbios(VbiosSection::PmuTable).to_string(),
            "invalid VBIOS: PMU lookup table"
        );
        assert_eq!(
            FwsecError::Timeout(TimeoutStage::GfwBoot).to_string(),
            "timeout waiting for GFW boot"
        );
        assert_eq!(
            FwsecError::ArchUnsupported(0x17).to_string(),
            "unsupported GPU architecture 0x17"
        );
    }

    #[test]
    fn test_method_errors_compare() {
        let all = FwsecError::AllMethodsFailed {
            brom: MethodError::Timeout(TimeoutStage::FalconHalt),
            dma: MethodError::Frts(2),
            pio: MethodError::Wpr2NotSet,
        };
        assert_eq!(
            all,
            FwsecError::AllMethodsFailed {
                brom: MethodError::Timeout(TimeoutStage::FalconHalt),
                dma: MethodError::Frts(2),
                pio: MethodError::Wpr2NotSet,
            }
        );
    }
}
