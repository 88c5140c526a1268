/*++

Licensed under the Apache-2.0 license.

File Name:

    fb.rs

Abstract:

    Framebuffer layout for the FRTS region.

--*/

use fwsec_drivers::{usable_fb_size, Bar0};

/// The FRTS region is a fixed 1 MiB, aligned to 1 MiB.
pub const FRTS_SIZE: u64 = 1 << 20;
const VGA_WORKSPACE_RESERVE: u64 = 1 << 20;

/// Framebuffer carve-out computed before FWSEC runs. The WPR2 fields stay
/// zero until the firmware establishes the region and the registers are
/// read back.
#[derive(Debug, Clone, Copy)]
pub struct FbLayout {
    pub fb_size: u64,
    pub fb_usable: u64,
    pub vga_workspace_base: u64,
    pub vga_workspace_size: u64,
    pub frts_base: u64,
    pub frts_size: u64,
    pub wpr2_base: u64,
    pub wpr2_size: u64,
}

impl FbLayout {
    /// Compute the layout from the reported framebuffer size: the VGA
    /// workspace sits in the last MiB, the FRTS region directly below it.
    pub fn new<E: Bar0>(bar: &mut E) -> Self {
        let fb_size = usable_fb_size(bar);
        let vga_workspace_base = fb_size.saturating_sub(VGA_WORKSPACE_RESERVE);
        let frts_base = vga_workspace_base.saturating_sub(FRTS_SIZE) & !(FRTS_SIZE - 1);

        Self {
            fb_size,
            fb_usable: fb_size,
            vga_workspace_base,
            vga_workspace_size: 0,
            frts_base,
            frts_size: FRTS_SIZE,
            wpr2_base: 0,
            wpr2_size: 0,
        }
    }

    /// FRTS region offset as FWSEC expects it: measured back from the end
    /// of the framebuffer.
    pub fn frts_offset_from_end(&self) -> u64 {
        self.fb_size - self.frts_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fwsec_drivers::regs;

    struct FbBar(u32);

    impl Bar0 for FbBar {
        fn read32(&mut self, off: u32) -> u32 {
            if off == regs::NV_USABLE_FB_SIZE_IN_MB {
                self.0
            } else {
                0
            }
        }
        fn write32(&mut self, _off: u32, _val: u32) {}
    }

    #[test]
    fn test_layout_for_8_gib() {
        let mut bar = FbBar(0x2000);
        let layout = FbLayout::new(&mut bar);

        assert_eq!(layout.fb_size, 8 << 30);
        assert_eq!(layout.vga_workspace_base, (8 << 30) - (1 << 20));
        // FRTS sits below the VGA workspace, 1 MiB aligned.
        assert_eq!(layout.frts_base % FRTS_SIZE, 0);
        assert_eq!(layout.frts_base, (8 << 30) - (2 << 20));
        assert_eq!(layout.frts_size, FRTS_SIZE);
        assert_eq!(layout.frts_offset_from_end(), 2 << 20);
        assert_eq!(layout.wpr2_base, 0);
        assert_eq!(layout.wpr2_size, 0);
    }
}
