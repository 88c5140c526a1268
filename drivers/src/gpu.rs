/*++

Licensed under the Apache-2.0 license.

File Name:

    gpu.rs

Abstract:

    File contains GPU-level helpers: architecture detection, GFW boot wait,
    WPR2 range access, FRTS error scratch, framebuffer size and the fuse
    reads driving signature selection.

--*/

use crate::mmio::{Bar0, Clock};
use crate::regs;
use crate::wait::{poll_until, PollSpec};
use fwsec_error::{FwsecError, FwsecResult, TimeoutStage};

/// Architecture code of Ada Lovelace in `PMC_BOOT_0` bits 24:20.
pub const ARCH_ADA: u8 = 0x19;

/// Value of the GFW progress low byte once boot has completed.
pub const GFW_BOOT_COMPLETE: u32 = 0xFF;

/// A WPR2 range read back from the MMU registers, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WprRange {
    pub lo: u64,
    pub hi: u64,
}

/// Architecture code from `PMC_BOOT_0`.
pub fn arch_code<E: Bar0 + ?Sized>(bar: &mut E) -> u8 {
    ((bar.read32(regs::NV_PMC_BOOT_0) >> 20) & 0x1F) as u8
}

/// Reject anything that is not Ada Lovelace.
pub fn check_arch<E: Bar0 + ?Sized>(bar: &mut E) -> FwsecResult<()> {
    match arch_code(bar) {
        ARCH_ADA => Ok(()),
        other => Err(FwsecError::ArchUnsupported(other)),
    }
}

/// Wait for the GFW boot sequence to report completion.
pub fn wait_gfw_boot<E: Bar0 + Clock>(env: &mut E) -> FwsecResult<()> {
    poll_until(env, PollSpec::GFW_BOOT, TimeoutStage::GfwBoot, |env| {
        let progress = env.read32(regs::NV_PGC6_AON_SECURE_SCRATCH_GROUP_05_0);
        progress & 0xFF == GFW_BOOT_COMPLETE
    })
}

/// The WPR2 registers hold bits 31:4 of a 4 KiB aligned physical address,
/// stored as `addr >> 8`.
fn decode_wpr2(reg: u32) -> u64 {
    u64::from(reg & 0xFFFF_FFF0) << 8
}

/// Whether a prior bring-up (or driver) already established WPR2.
pub fn wpr2_configured<E: Bar0 + ?Sized>(bar: &mut E) -> bool {
    bar.read32(regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI) & 0xFFFF_FFF0 != 0
}

/// Read back the WPR2 range.
pub fn read_wpr2<E: Bar0 + ?Sized>(bar: &mut E) -> WprRange {
    WprRange {
        lo: decode_wpr2(bar.read32(regs::NV_PFB_PRI_MMU_WPR2_ADDR_LO)),
        hi: decode_wpr2(bar.read32(regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI)),
    }
}

/// FRTS error code FWSEC leaves in bits 31:16 of the scratch register.
pub fn frts_error_code<E: Bar0 + ?Sized>(bar: &mut E) -> u16 {
    (bar.read32(regs::NV_PBUS_SW_SCRATCH_0E) >> 16) as u16
}

/// Usable framebuffer size in bytes (register reports MiB in bits 15:0).
pub fn usable_fb_size<E: Bar0 + ?Sized>(bar: &mut E) -> u64 {
    u64::from(bar.read32(regs::NV_USABLE_FB_SIZE_IN_MB) & 0xFFFF) << 20
}

/// Fused FWSEC signature version.
pub fn fwsec_fuse_version<E: Bar0 + ?Sized>(bar: &mut E) -> u32 {
    bar.read32(regs::NV_FUSE_OPT_FPF_FWSEC_DBG_DISABLE) & 0xFFFF
}

/// A part whose GSP debug fuse was never blown accepts debug-signed
/// firmware; such parts prefer the FWSEC-DBG image.
pub fn gsp_debug_fused<E: Bar0 + ?Sized>(bar: &mut E) -> bool {
    bar.read32(regs::NV_FUSE_OPT_SECURE_GSP_DEBUG_DISABLE) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    struct FakeBar {
        regs: Vec<(u32, u32)>,
    }

    impl FakeBar {
        fn with(regs: &[(u32, u32)]) -> Self {
            Self {
                regs: regs.to_vec(),
            }
        }
    }

    impl Bar0 for FakeBar {
        fn read32(&mut self, off: u32) -> u32 {
            self.regs
                .iter()
                .find(|(o, _)| *o == off)
                .map(|(_, v)| *v)
                .unwrap_or(0)
        }
        fn write32(&mut self, off: u32, val: u32) {
            self.regs.push((off, val));
        }
    }

    impl Clock for FakeBar {
        fn stall_us(&mut self, _us: u32) {}
    }

    #[test]
    fn test_arch_detect() {
        let mut bar = FakeBar::with(&[(regs::NV_PMC_BOOT_0, 0x19 << 20)]);
        assert_eq!(arch_code(&mut bar), ARCH_ADA);
        assert_eq!(check_arch(&mut bar), Ok(()));

        let mut bar = FakeBar::with(&[(regs::NV_PMC_BOOT_0, 0x17 << 20)]);
        assert_eq!(check_arch(&mut bar), Err(FwsecError::ArchUnsupported(0x17)));
    }

    #[test]
    fn test_wpr2_decode_shift() {
        // Register value 0x3000 decodes to 0x300000
        let mut bar = FakeBar::with(&[
            (regs::NV_PFB_PRI_MMU_WPR2_ADDR_LO, 0),
            (regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI, 0x3000),
        ]);
        assert!(wpr2_configured(&mut bar));
        assert_eq!(
            read_wpr2(&mut bar),
            WprRange {
                lo: 0,
                hi: 0x0030_0000
            }
        );

        // The low nibble is masked off before shifting.
        let mut bar = FakeBar::with(&[(regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI, 0xF)]);
        assert!(!wpr2_configured(&mut bar));
    }

    #[test]
    fn test_gfw_boot_checks_low_byte() {
        let mut bar = FakeBar::with(&[(regs::NV_PGC6_AON_SECURE_SCRATCH_GROUP_05_0, 0xABCD_00FF)]);
        assert_eq!(wait_gfw_boot(&mut bar), Ok(()));

        let mut bar = FakeBar::with(&[(regs::NV_PGC6_AON_SECURE_SCRATCH_GROUP_05_0, 0xFE)]);
        assert_eq!(
            wait_gfw_boot(&mut bar),
            Err(FwsecError::Timeout(TimeoutStage::GfwBoot))
        );
    }

    #[test]
    fn test_scratch_and_fb_helpers() {
        let mut bar = FakeBar::with(&[
            (regs::NV_PBUS_SW_SCRATCH_0E, 0x0004_1234),
            (regs::NV_USABLE_FB_SIZE_IN_MB, 0xDEAD_4000),
            (regs::NV_FUSE_OPT_FPF_FWSEC_DBG_DISABLE, 0x0003),
        ]);
        assert_eq!(frts_error_code(&mut bar), 0x0004);
        assert_eq!(usable_fb_size(&mut bar), 0x4000u64 << 20);
        assert_eq!(fwsec_fuse_version(&mut bar), 3);
        assert!(gsp_debug_fused(&mut bar));
    }
}
