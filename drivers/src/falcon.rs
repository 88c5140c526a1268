/*++

Licensed under the Apache-2.0 license.

File Name:

    falcon.rs

Abstract:

    File contains the falcon microcontroller bring-up driver: reset and
    scrub handshake, core select, PIO and DMA loading, FBIF configuration,
    boot-ROM entry and halt detection.

--*/

use log::warn;
use tock_registers::interfaces::Readable;
use tock_registers::LocalRegisterCopy;

use crate::mmio::{Bar0, Clock};
use crate::regs;
use crate::wait::{poll_until, PollSpec};
use fwsec_error::{FwsecResult, TimeoutStage};

/// Falcon IMEM/DMEM ports move data in 256-byte blocks.
pub const DMA_BLOCK_SIZE: u32 = 256;

/// FBIF aperture target for DMA transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FbifTarget {
    LocalFb,
    CoherentSysmem,
    NoncoherentSysmem,
}

impl FbifTarget {
    fn transcfg(self) -> u32 {
        let target = match self {
            FbifTarget::LocalFb => regs::FbifTranscfg::TARGET::LocalFb,
            FbifTarget::CoherentSysmem => regs::FbifTranscfg::TARGET::CoherentSysmem,
            FbifTarget::NoncoherentSysmem => regs::FbifTranscfg::TARGET::NoncoherentSysmem,
        };
        (target + regs::FbifTranscfg::MEM_TYPE::Physical).value
    }
}

/// Parameters programmed into the boot ROM for heavy-secure entry.
#[derive(Debug, Clone, Copy)]
pub struct BromParams {
    /// Offset of the selected signature within the staging buffer.
    pub pkc_data_offset: u32,
    /// Engine mask the firmware is signed for.
    pub engine_id_mask: u16,
    /// Ucode id selecting the version fuse.
    pub ucode_id: u8,
}

/// Source layout of a DMA load: `[IMEM][DMEM]` in the staging buffer.
#[derive(Debug, Clone, Copy)]
pub struct DmaLoadParams {
    pub imem_len: u32,
    pub imem_base: u32,
    pub dmem_len: u32,
    pub dmem_base: u32,
    pub boot_vec: u32,
}

/// Mailbox contents observed once the falcon halted.
#[derive(Debug, Clone, Copy)]
pub struct HaltStatus {
    pub mailbox0: u32,
    pub mailbox1: u32,
}

/// One falcon controller instance (GSP, SEC2, ...).
pub struct Falcon {
    base: u32,
    pub is_riscv: bool,
    pub halted: bool,
}

impl Falcon {
    /// Probe the controller at `base`. Never fails.
    pub fn new<E: Bar0>(bar: &mut E, base: u32) -> Self {
        let hwcfg2 = reg32::<regs::Hwcfg2::Register>(bar.read32(base + regs::FALCON_HWCFG2));
        let cpuctl = reg32::<regs::Cpuctl::Register>(bar.read32(base + regs::FALCON_CPUCTL));

        Self {
            base,
            is_riscv: hwcfg2.is_set(regs::Hwcfg2::RISCV),
            halted: cpuctl.is_set(regs::Cpuctl::HALTED),
        }
    }

    /// The GSP falcon, which runs FWSEC.
    pub fn gsp<E: Bar0>(bar: &mut E) -> Self {
        Self::new(bar, regs::FALCON_GSP_BASE)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    fn rd<E: Bar0 + ?Sized>(&self, bar: &mut E, off: u32) -> u32 {
        bar.read32(self.base + off)
    }

    fn wr<E: Bar0 + ?Sized>(&self, bar: &mut E, off: u32, val: u32) {
        bar.write32(self.base + off, val);
    }

    /// Wait out the memory scrubber and select the falcon core.
    ///
    /// A scrub that never settles is logged and ignored; a core select that
    /// is not acknowledged is fatal, since nothing can be loaded afterwards.
    pub fn reset<E: Bar0 + Clock>(&mut self, env: &mut E) -> FwsecResult<()> {
        let base = self.base;

        let scrub = poll_until(env, PollSpec::MEM_SCRUB, TimeoutStage::MemScrub, |env| {
            let hwcfg2 = reg32::<regs::Hwcfg2::Register>(env.read32(base + regs::FALCON_HWCFG2));
            !hwcfg2.is_set(regs::Hwcfg2::MEM_SCRUBBING)
        });
        if scrub.is_err() {
            warn!("falcon@{:#x}: memory scrub still running, continuing", base);
        }

        let core_select = regs::BcrCtrl::CORE_SELECT::Falcon.value;
        self.wr(env, regs::FALCON_BCR_CTRL, core_select);
        poll_until(env, PollSpec::CORE_SELECT, TimeoutStage::CoreSelect, |env| {
            env.read32(base + regs::FALCON_BCR_CTRL) == core_select
        })?;

        self.halted = true;
        Ok(())
    }

    /// Push `imem` and `dmem` through the PIO ports.
    ///
    /// No secure bit is set: PIO-loaded code cannot pass the boot ROM's
    /// signature check and only runs on debug-fused parts.
    pub fn load_pio<E: Bar0>(&mut self, bar: &mut E, imem: &[u8], dmem: &[u8]) {
        self.load_mem_pio(
            bar,
            regs::falcon_imemc(0),
            regs::falcon_imemd(0),
            imem,
        );
        self.load_mem_pio(
            bar,
            regs::falcon_dmemc(0),
            regs::falcon_dmemd(0),
            dmem,
        );
    }

    fn load_mem_pio<E: Bar0>(&self, bar: &mut E, memc: u32, memd: u32, data: &[u8]) {
        for (block, chunk) in data.chunks(DMA_BLOCK_SIZE as usize).enumerate() {
            let ctrl = (regs::MemC::BLK.val(block as u32) + regs::MemC::AINCW::SET).value;
            self.wr(bar, memc, ctrl);

            for word in chunk.chunks(4) {
                let mut bytes = [0u8; 4];
                bytes[..word.len()].copy_from_slice(word);
                self.wr(bar, memd, u32::from_le_bytes(bytes));
            }
        }
    }

    /// Point both FBIF apertures at `target` and allow physical addressing
    /// without a channel context.
    pub fn configure_fbif<E: Bar0>(&mut self, bar: &mut E, target: FbifTarget) {
        for slot in 0..2 {
            self.wr(bar, regs::falcon_fbif_transcfg(slot), target.transcfg());
        }

        let ctl = self.rd(bar, regs::FALCON_FBIF_CTL);
        self.wr(
            bar,
            regs::FALCON_FBIF_CTL,
            ctl | regs::FbifCtl::ALLOW_PHYS_NO_CTX::SET.value,
        );
        self.wr(bar, regs::FALCON_DMACTL, 0);
    }

    /// Program the DMA base registers with the staging buffer address.
    ///
    /// Emits the release fence: the staging buffer must be fully written
    /// before the device learns its address.
    pub fn set_dma_base<E: Bar0>(&mut self, bar: &mut E, dma_phys: u64) {
        bar.fence();
        self.wr(bar, regs::FALCON_DMATRFBASE, (dma_phys >> 8) as u32);
        self.wr(bar, regs::FALCON_DMATRFBASE1, (dma_phys >> 40) as u32);
    }

    /// DMA the staging buffer into IMEM and DMEM and set the boot vector.
    pub fn load_dma<E: Bar0 + Clock>(
        &mut self,
        env: &mut E,
        dma_phys: u64,
        params: &DmaLoadParams,
    ) -> FwsecResult<()> {
        self.set_dma_base(env, dma_phys);

        self.dma_transfer(env, true, 0, params.imem_base, params.imem_len)?;
        self.dma_transfer(env, false, params.imem_len, params.dmem_base, params.dmem_len)?;

        self.wr(env, regs::FALCON_BOOTVEC, params.boot_vec);
        Ok(())
    }

    fn dma_transfer<E: Bar0 + Clock>(
        &self,
        env: &mut E,
        imem: bool,
        src: u32,
        dst: u32,
        len: u32,
    ) -> FwsecResult<()> {
        let base = self.base;
        let cmd = {
            let size = regs::DmaTrfCmd::SIZE::Size256B;
            if imem {
                (size + regs::DmaTrfCmd::IMEM::SET).value
            } else {
                size.value
            }
        };

        for off in (0..len).step_by(DMA_BLOCK_SIZE as usize) {
            self.wr(env, regs::FALCON_DMATRFMOFFS, dst + off);
            self.wr(env, regs::FALCON_DMATRFFBOFFS, src + off);
            self.wr(env, regs::FALCON_DMATRFCMD, cmd);

            poll_until(env, PollSpec::DMA_CHUNK, TimeoutStage::Dma, |env| {
                let cmd = reg32::<regs::DmaTrfCmd::Register>(
                    env.read32(base + regs::FALCON_DMATRFCMD),
                );
                cmd.is_set(regs::DmaTrfCmd::IDLE)
            })?;
        }

        Ok(())
    }

    /// Start the falcon CPU, optionally setting the boot vector first.
    pub fn start<E: Bar0>(&mut self, bar: &mut E, boot_vec: Option<u32>) {
        if let Some(vec) = boot_vec {
            self.wr(bar, regs::FALCON_BOOTVEC, vec);
        }
        self.wr(bar, regs::FALCON_CPUCTL, regs::Cpuctl::STARTCPU::SET.value);
        self.halted = false;
    }

    /// Heavy-secure entry: hand the staging buffer to the boot ROM, which
    /// verifies the RSA-3K signature against the fuses before starting.
    ///
    /// The caller must already have configured the FBIF aperture and the
    /// DMA base registers.
    pub fn start_brom<E: Bar0>(&mut self, bar: &mut E, params: &BromParams) {
        bar.fence();
        self.wr(
            bar,
            regs::FALCON_BROM_PARAM,
            u32::from(params.engine_id_mask) | (u32::from(params.ucode_id) << 16),
        );
        self.wr(bar, regs::FALCON_BROM_ADDR, params.pkc_data_offset);

        let ctrl = (regs::BcrCtrl::CORE_SELECT::Falcon + regs::BcrCtrl::VALID::SET).value;
        self.wr(bar, regs::FALCON_BCR_CTRL, ctrl);
        self.halted = false;
    }

    /// Wait until the CPU halts, then collect the mailboxes.
    pub fn wait_halt<E: Bar0 + Clock>(&mut self, env: &mut E, cap_us: u32) -> FwsecResult<HaltStatus> {
        let base = self.base;
        let spec = PollSpec::new(PollSpec::FALCON_HALT.stride_us, cap_us);

        poll_until(env, spec, TimeoutStage::FalconHalt, |env| {
            let cpuctl = reg32::<regs::Cpuctl::Register>(env.read32(base + regs::FALCON_CPUCTL));
            cpuctl.is_set(regs::Cpuctl::HALTED)
        })?;

        self.halted = true;
        Ok(HaltStatus {
            mailbox0: self.rd(env, regs::FALCON_MAILBOX0),
            mailbox1: self.rd(env, regs::FALCON_MAILBOX1),
        })
    }
}

fn reg32<R: tock_registers::RegisterLongName>(val: u32) -> LocalRegisterCopy<u32, R> {
    LocalRegisterCopy::new(val)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use fwsec_error::FwsecError;

    /// Register file fake: reads serve stored values, writes are recorded.
    struct FakeBar {
        regs: Vec<(u32, u32)>,
        writes: Vec<(u32, u32)>,
        fences: u32,
    }

    impl FakeBar {
        fn new() -> Self {
            Self {
                regs: Vec::new(),
                writes: Vec::new(),
                fences: 0,
            }
        }

        fn set(&mut self, off: u32, val: u32) {
            if let Some(slot) = self.regs.iter_mut().find(|(o, _)| *o == off) {
                slot.1 = val;
            } else {
                self.regs.push((off, val));
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
            self.writes.push((off, val));
            self.set(off, val);
        }

        fn fence(&mut self) {
            self.fences += 1;
        }
    }

    impl Clock for FakeBar {
        fn stall_us(&mut self, _us: u32) {}
    }

    const GSP: u32 = regs::FALCON_GSP_BASE;

    #[test]
    fn test_init_reads_riscv_and_halt_state() {
        let mut bar = FakeBar::new();
        bar.set(GSP + regs::FALCON_HWCFG2, 0b1);
        bar.set(GSP + regs::FALCON_CPUCTL, 1 << 4);

        let falcon = Falcon::gsp(&mut bar);
        assert!(falcon.is_riscv);
        assert!(falcon.halted);
        assert_eq!(falcon.base(), GSP);
    }

    #[test]
    fn test_reset_scrub_timeout_is_not_fatal() {
        let mut bar = FakeBar::new();
        // Scrubbing bit stuck; core select acknowledges via readback.
        bar.set(GSP + regs::FALCON_HWCFG2, 1 << 5);

        let mut falcon = Falcon::gsp(&mut bar);
        assert_eq!(falcon.reset(&mut bar), Ok(()));
        assert!(falcon.halted);
    }

    #[test]
    fn test_reset_core_select_timeout_is_fatal() {
        struct NackBar(FakeBar);

        impl Bar0 for NackBar {
            fn read32(&mut self, off: u32) -> u32 {
                if off == GSP + regs::FALCON_BCR_CTRL {
                    // Never acknowledge the select.
                    return 0;
                }
                self.0.read32(off)
            }
            fn write32(&mut self, off: u32, val: u32) {
                self.0.write32(off, val)
            }
        }
        impl Clock for NackBar {
            fn stall_us(&mut self, _us: u32) {}
        }

        let mut bar = NackBar(FakeBar::new());
        let mut falcon = Falcon::new(&mut bar, GSP);
        assert_eq!(
            falcon.reset(&mut bar),
            Err(FwsecError::Timeout(TimeoutStage::CoreSelect))
        );
    }

    #[test]
    fn test_load_pio_block_and_word_stream() {
        let mut bar = FakeBar::new();
        let mut falcon = Falcon::gsp(&mut bar);

        // 260 bytes of IMEM: one full block plus one word.
        let imem: Vec<u8> = (0..260).map(|i| i as u8).collect();
        falcon.load_pio(&mut bar, &imem, &[0xAA; 4]);

        let imemc = GSP + regs::falcon_imemc(0);
        let ctrl_writes: Vec<u32> = bar
            .writes
            .iter()
            .filter(|(o, _)| *o == imemc)
            .map(|(_, v)| *v)
            .collect();
        // Block 0 then block 1, both with auto-increment set.
        assert_eq!(ctrl_writes, [1 << 24, (1 << 8) | (1 << 24)]);

        let imemd = GSP + regs::falcon_imemd(0);
        let data_writes = bar.writes.iter().filter(|(o, _)| *o == imemd).count();
        assert_eq!(data_writes, 65);

        let dmemd = GSP + regs::falcon_dmemd(0);
        let dmem_words: Vec<u32> = bar
            .writes
            .iter()
            .filter(|(o, _)| *o == dmemd)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(dmem_words, [0xAAAA_AAAA]);
    }

    #[test]
    fn test_load_dma_chunks_and_fence_order() {
        struct IdleBar(FakeBar);

        impl Bar0 for IdleBar {
            fn read32(&mut self, off: u32) -> u32 {
                if off == GSP + regs::FALCON_DMATRFCMD {
                    return 1 << 1; // idle
                }
                self.0.read32(off)
            }
            fn write32(&mut self, off: u32, val: u32) {
                self.0.write32(off, val)
            }
            fn fence(&mut self) {
                self.0.fences += 1;
                self.0.writes.push((u32::MAX, 0)); // fence marker in order
            }
        }
        impl Clock for IdleBar {
            fn stall_us(&mut self, _us: u32) {}
        }

        let mut bar = IdleBar(FakeBar::new());
        let mut falcon = Falcon::new(&mut bar, GSP);

        let params = DmaLoadParams {
            imem_len: 0x200,
            imem_base: 0,
            dmem_len: 0x100,
            dmem_base: 0,
            boot_vec: 0x1234,
        };
        falcon.load_dma(&mut bar, 0x12_3456_7800, &params).unwrap();

        assert_eq!(bar.0.fences, 1);

        // The fence precedes the DMA base programming.
        let order: Vec<(u32, u32)> = bar.0.writes.clone();
        let fence_pos = order.iter().position(|(o, _)| *o == u32::MAX).unwrap();
        let base_pos = order
            .iter()
            .position(|(o, _)| *o == GSP + regs::FALCON_DMATRFBASE)
            .unwrap();
        assert!(fence_pos < base_pos);

        // Base registers split the 40-bit address.
        assert!(order.contains(&(GSP + regs::FALCON_DMATRFBASE, 0x12_3456_78)));
        assert!(order.contains(&(GSP + regs::FALCON_DMATRFBASE1, 0)));

        // Three 256-byte chunks total: two IMEM, one DMEM.
        let cmds: Vec<u32> = order
            .iter()
            .filter(|(o, _)| *o == GSP + regs::FALCON_DMATRFCMD)
            .map(|(_, v)| *v)
            .collect();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[0], (6 << 8) | (1 << 4));
        assert_eq!(cmds[2], 6 << 8);

        // DMEM source sits after the IMEM bytes in the staging buffer.
        assert!(order.contains(&(GSP + regs::FALCON_DMATRFFBOFFS, 0x200)));
        assert!(order.contains(&(GSP + regs::FALCON_BOOTVEC, 0x1234)));
    }

    #[test]
    fn test_start_brom_programs_param_word() {
        let mut bar = FakeBar::new();
        let mut falcon = Falcon::gsp(&mut bar);

        falcon.start_brom(
            &mut bar,
            &BromParams {
                pkc_data_offset: 0x600,
                engine_id_mask: 0x0400,
                ucode_id: 9,
            },
        );

        assert_eq!(bar.fences, 1);
        assert!(bar
            .writes
            .contains(&(GSP + regs::FALCON_BROM_PARAM, 0x0400 | (9 << 16))));
        assert!(bar.writes.contains(&(GSP + regs::FALCON_BROM_ADDR, 0x600)));
        // Core select with the valid bit is the start trigger and comes last.
        assert_eq!(
            bar.writes.last(),
            Some(&(GSP + regs::FALCON_BCR_CTRL, 1 | (1 << 4)))
        );
        assert!(!falcon.halted);
    }

    #[test]
    fn test_wait_halt_reads_mailboxes() {
        let mut bar = FakeBar::new();
        bar.set(GSP + regs::FALCON_CPUCTL, 1 << 4);
        bar.set(GSP + regs::FALCON_MAILBOX0, 0xdead);
        bar.set(GSP + regs::FALCON_MAILBOX1, 0xbeef);

        let mut falcon = Falcon::gsp(&mut bar);
        let status = falcon.wait_halt(&mut bar, 5_000_000).unwrap();
        assert_eq!(status.mailbox0, 0xdead);
        assert_eq!(status.mailbox1, 0xbeef);
        assert!(falcon.halted);
    }
}
