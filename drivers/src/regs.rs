/*++

Licensed under the Apache-2.0 license.

File Name:

    regs.rs

Abstract:

    File contains the BAR0 register map consumed by the bring-up engine and
    the bitfield layouts of the falcon registers. Offsets are part of the
    external interface and must match the hardware.

--*/

use tock_registers::register_bitfields;

/// Boot/architecture register.
pub const NV_PMC_BOOT_0: u32 = 0x00_0000;
/// FRTS error code lives in bits 31:16.
pub const NV_PBUS_SW_SCRATCH_0E: u32 = 0x00_1438;
/// Usable framebuffer size in MiB, bits 15:0.
pub const NV_USABLE_FB_SIZE_IN_MB: u32 = 0x10_0A10;
/// WPR2 range registers.
pub const NV_PFB_PRI_MMU_WPR2_ADDR_LO: u32 = 0x1F_A824;
pub const NV_PFB_PRI_MMU_WPR2_ADDR_HI: u32 = 0x1F_A828;
/// GFW boot progress scratch; low byte reads 0xFF once boot completed.
pub const NV_PGC6_AON_SECURE_SCRATCH_GROUP_05_0: u32 = 0x11_8234;
/// Fuse carrying the FWSEC signature version, bits 15:0.
pub const NV_FUSE_OPT_FPF_FWSEC_DBG_DISABLE: u32 = 0x82_4100;
/// Fuse that disables GSP debug; zero means a debug-fused part.
pub const NV_FUSE_OPT_SECURE_GSP_DEBUG_DISABLE: u32 = 0x82_4104;

/// Falcon bases.
pub const FALCON_GSP_BASE: u32 = 0x11_0000;
pub const FALCON_SEC2_BASE: u32 = 0x84_0000;

/// Falcon register offsets, relative to the falcon base.
pub const FALCON_MAILBOX0: u32 = 0x040;
pub const FALCON_MAILBOX1: u32 = 0x044;
pub const FALCON_ITFEN: u32 = 0x048;
pub const FALCON_OS: u32 = 0x080;
pub const FALCON_BROM_ENGCTL: u32 = 0x0A4;
pub const FALCON_BROM_PARAM: u32 = 0x0AC;
pub const FALCON_BROM_ADDR: u32 = 0x0B0;
pub const FALCON_BROM_DATA: u32 = 0x0B4;
pub const FALCON_CPUCTL: u32 = 0x100;
pub const FALCON_BOOTVEC: u32 = 0x104;
pub const FALCON_HWCFG: u32 = 0x108;
pub const FALCON_DMACTL: u32 = 0x10C;
pub const FALCON_DMATRFBASE: u32 = 0x110;
pub const FALCON_DMATRFMOFFS: u32 = 0x114;
pub const FALCON_DMATRFFBOFFS: u32 = 0x118;
pub const FALCON_DMATRFCMD: u32 = 0x11C;
pub const FALCON_DMATRFBASE1: u32 = 0x128;
pub const FALCON_HWCFG1: u32 = 0x12C;
pub const FALCON_BCR_CTRL: u32 = 0xF54;
pub const FALCON_HWCFG2: u32 = 0xF98;

/// IMEM/DMEM access ports.
pub const fn falcon_imemc(port: u32) -> u32 {
    0x180 + port * 16
}
pub const fn falcon_imemd(port: u32) -> u32 {
    0x184 + port * 16
}
pub const fn falcon_dmemc(port: u32) -> u32 {
    0x1C0 + port * 8
}
pub const fn falcon_dmemd(port: u32) -> u32 {
    0x1C4 + port * 8
}

/// FBIF aperture configuration slots.
pub const fn falcon_fbif_transcfg(slot: u32) -> u32 {
    0x600 + slot * 4
}
pub const FALCON_FBIF_CTL: u32 = 0x624;

register_bitfields! [
    u32,

    /// PMC boot register; bits 24:20 carry the architecture code.
    pub PmcBoot0 [
        IMPL OFFSET(0) NUMBITS(8) [],
        ARCH OFFSET(20) NUMBITS(5) [],
    ],

    /// Falcon CPU control.
    pub Cpuctl [
        IINVAL OFFSET(0) NUMBITS(1) [],
        STARTCPU OFFSET(1) NUMBITS(1) [],
        SRESET OFFSET(2) NUMBITS(1) [],
        HRESET OFFSET(3) NUMBITS(1) [],
        HALTED OFFSET(4) NUMBITS(1) [],
        STOPPED OFFSET(5) NUMBITS(1) [],
        ALIAS_EN OFFSET(6) NUMBITS(1) [],
    ],

    /// Falcon hardware configuration 2.
    pub Hwcfg2 [
        RISCV OFFSET(0) NUMBITS(1) [],
        MEM_SCRUBBING OFFSET(5) NUMBITS(1) [],
    ],

    /// Peregrine boot control: core select plus valid handshake.
    pub BcrCtrl [
        CORE_SELECT OFFSET(0) NUMBITS(1) [
            Riscv = 0,
            Falcon = 1,
        ],
        VALID OFFSET(4) NUMBITS(1) [],
    ],

    /// Falcon DMA transfer command.
    pub DmaTrfCmd [
        FULL OFFSET(0) NUMBITS(1) [],
        IDLE OFFSET(1) NUMBITS(1) [],
        SEC OFFSET(2) NUMBITS(2) [],
        IMEM OFFSET(4) NUMBITS(1) [],
        WRITE OFFSET(5) NUMBITS(1) [],
        SIZE OFFSET(8) NUMBITS(3) [
            Size256B = 6,
        ],
    ],

    /// IMEMC/DMEMC port control.
    pub MemC [
        OFFS OFFSET(2) NUMBITS(6) [],
        BLK OFFSET(8) NUMBITS(8) [],
        AINCW OFFSET(24) NUMBITS(1) [],
        AINCR OFFSET(25) NUMBITS(1) [],
        SEC OFFSET(28) NUMBITS(1) [],
    ],

    /// FBIF aperture configuration.
    pub FbifTranscfg [
        TARGET OFFSET(0) NUMBITS(2) [
            LocalFb = 0,
            CoherentSysmem = 1,
            NoncoherentSysmem = 2,
        ],
        MEM_TYPE OFFSET(2) NUMBITS(1) [
            Virtual = 0,
            Physical = 1,
        ],
    ],

    /// FBIF control.
    pub FbifCtl [
        ENABLE OFFSET(0) NUMBITS(1) [],
        ALLOW_PHYS_NO_CTX OFFSET(7) NUMBITS(1) [],
    ],
];
