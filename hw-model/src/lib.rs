// Licensed under the Apache-2.0 license

//! Software model of the GPU register file seen by the bring-up engine.
//!
//! The model backs the `Bar0`, `Clock` and `DmaAllocator` capabilities with
//! a sparse register map, a fake clock and scripted falcon behavior, and
//! records an event log so tests can assert on write and fence ordering.

use std::collections::{HashMap, VecDeque};

use fwsec_drivers::{regs, Bar0, Clock, DmaAllocator, DmaBuffer, FwsecResult, ARCH_ADA};

/// Everything the model emits in device-visible order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Write { off: u32, val: u32 },
    Fence,
    DmaAlloc { len: usize, phys: u64 },
}

/// Scripted behavior of one falcon execution. Runs are consumed in order,
/// one per start trigger (`CPUCTL.STARTCPU` or a valid BROM boot request).
#[derive(Debug, Clone, Copy)]
pub struct FalconRun {
    /// Microseconds from start to halt; `None` never halts.
    pub halt_after_us: Option<u64>,
    /// `MAILBOX0` contents once halted.
    pub mailbox0: u32,
    /// Raw WPR2 register values latched when the run halts.
    pub wpr2_lo: u32,
    pub wpr2_hi: u32,
    /// FRTS error code latched into the scratch register on halt.
    pub frts_err: u16,
}

impl Default for FalconRun {
    fn default() -> Self {
        Self {
            halt_after_us: Some(0),
            mailbox0: 0,
            wpr2_lo: 0,
            wpr2_hi: 0,
            frts_err: 0,
        }
    }
}

impl FalconRun {
    /// A run that halts immediately and establishes WPR2.
    pub fn success(wpr2_lo: u32, wpr2_hi: u32) -> Self {
        Self {
            wpr2_lo,
            wpr2_hi,
            ..Self::default()
        }
    }

    /// A run that halts immediately without touching WPR2.
    pub fn wpr2_unset() -> Self {
        Self::default()
    }

    /// A run that never halts.
    pub fn hang() -> Self {
        Self {
            halt_after_us: None,
            ..Self::default()
        }
    }
}

/// Initial register and behavior state of the model.
pub struct InitParams {
    /// `PMC_BOOT_0` contents; defaults to the Ada architecture code.
    pub boot0: u32,
    /// Usable framebuffer size in MiB.
    pub fb_mb: u16,
    /// GFW boot progress scratch contents.
    pub gfw_progress: u32,
    /// Raw WPR2 register presets.
    pub wpr2_lo: u32,
    pub wpr2_hi: u32,
    /// FWSEC signature version fuse.
    pub fuse_version: u32,
    /// GSP secure debug fuse; non-zero models a production part.
    pub secure_debug_fuse: u32,
    /// How long the falcon memory scrubber stays busy.
    pub scrub_us: u64,
    /// Whether core-select writes are acknowledged on readback.
    pub core_select_ack: bool,
    /// Scripted falcon executions, consumed per start trigger.
    pub runs: Vec<FalconRun>,
}

impl Default for InitParams {
    fn default() -> Self {
        Self {
            boot0: u32::from(ARCH_ADA) << 20,
            fb_mb: 0x2000,
            gfw_progress: 0xFF,
            wpr2_lo: 0,
            wpr2_hi: 0,
            fuse_version: 0,
            secure_debug_fuse: 1,
            scrub_us: 0,
            core_select_ack: true,
            runs: Vec::new(),
        }
    }
}

struct ActiveRun {
    run: FalconRun,
    started_at_us: u64,
    effects_applied: bool,
}

/// The GPU model.
pub struct GpuModel {
    regs: HashMap<u32, u32>,
    events: Vec<Event>,
    now_us: u64,
    scrub_until_us: u64,
    core_select_ack: bool,
    runs: VecDeque<FalconRun>,
    active: Option<ActiveRun>,
    starts: u32,
    next_phys: u64,
}

const GSP: u32 = regs::FALCON_GSP_BASE;

impl GpuModel {
    pub fn new(params: InitParams) -> Self {
        let mut regs_map = HashMap::new();
        regs_map.insert(regs::NV_PMC_BOOT_0, params.boot0);
        regs_map.insert(
            regs::NV_USABLE_FB_SIZE_IN_MB,
            u32::from(params.fb_mb),
        );
        regs_map.insert(
            regs::NV_PGC6_AON_SECURE_SCRATCH_GROUP_05_0,
            params.gfw_progress,
        );
        regs_map.insert(regs::NV_PFB_PRI_MMU_WPR2_ADDR_LO, params.wpr2_lo);
        regs_map.insert(regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI, params.wpr2_hi);
        regs_map.insert(
            regs::NV_FUSE_OPT_FPF_FWSEC_DBG_DISABLE,
            params.fuse_version,
        );
        regs_map.insert(
            regs::NV_FUSE_OPT_SECURE_GSP_DEBUG_DISABLE,
            params.secure_debug_fuse,
        );

        Self {
            regs: regs_map,
            events: Vec::new(),
            now_us: 0,
            scrub_until_us: params.scrub_us,
            core_select_ack: params.core_select_ack,
            runs: params.runs.into(),
            active: None,
            starts: 0,
            next_phys: 0x4000_0000,
        }
    }

    /// Device-visible event log.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// How many falcon start triggers the model observed.
    pub fn start_count(&self) -> u32 {
        self.starts
    }

    /// Current fake time.
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Register value without going through the bus (no side effects).
    pub fn peek(&self, off: u32) -> u32 {
        self.regs.get(&off).copied().unwrap_or(0)
    }

    /// Ordered values written to `off`.
    pub fn writes_to(&self, off: u32) -> Vec<u32> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Write { off: o, val } if *o == off => Some(*val),
                _ => None,
            })
            .collect()
    }

    /// Whether any write landed in the GSP falcon register window.
    pub fn touched_gsp_falcon(&self) -> bool {
        self.events.iter().any(|event| {
            matches!(event, Event::Write { off, .. } if (GSP..GSP + 0x1000).contains(off))
        })
    }

    fn trigger_start(&mut self) {
        self.starts += 1;
        self.active = self.runs.pop_front().map(|run| ActiveRun {
            run,
            started_at_us: self.now_us,
            effects_applied: false,
        });
    }

    fn cpuctl_value(&mut self) -> u32 {
        let Some(active) = self.active.as_mut() else {
            return self.regs.get(&(GSP + regs::FALCON_CPUCTL)).copied().unwrap_or(0);
        };

        let halted = active
            .run
            .halt_after_us
            .is_some_and(|delay| self.now_us >= active.started_at_us + delay);
        if !halted {
            return 0;
        }

        if !active.effects_applied {
            active.effects_applied = true;
            let run = active.run;
            self.regs
                .insert(regs::NV_PFB_PRI_MMU_WPR2_ADDR_LO, run.wpr2_lo);
            self.regs
                .insert(regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI, run.wpr2_hi);
            self.regs.insert(
                regs::NV_PBUS_SW_SCRATCH_0E,
                u32::from(run.frts_err) << 16,
            );
            self.regs.insert(GSP + regs::FALCON_MAILBOX0, run.mailbox0);
        }

        1 << 4
    }
}

impl Bar0 for GpuModel {
    fn read32(&mut self, off: u32) -> u32 {
        if off == GSP + regs::FALCON_CPUCTL {
            return self.cpuctl_value();
        }
        if off == GSP + regs::FALCON_HWCFG2 {
            // RISC-V capable part; scrubbing until the configured time.
            let scrubbing = if self.now_us < self.scrub_until_us {
                1 << 5
            } else {
                0
            };
            return 1 | scrubbing;
        }
        if off == GSP + regs::FALCON_DMATRFCMD {
            return 1 << 1; // transfers complete instantly
        }
        self.regs.get(&off).copied().unwrap_or(0)
    }

    fn write32(&mut self, off: u32, val: u32) {
        self.events.push(Event::Write { off, val });

        if off == GSP + regs::FALCON_BCR_CTRL {
            if !self.core_select_ack {
                return; // never acknowledged; readback stays zero
            }
            self.regs.insert(off, val);
            if val & (1 << 4) != 0 {
                self.trigger_start();
            }
            return;
        }

        if off == GSP + regs::FALCON_CPUCTL {
            if val & (1 << 1) != 0 {
                self.trigger_start();
            }
            return;
        }

        self.regs.insert(off, val);
    }

    fn fence(&mut self) {
        self.events.push(Event::Fence);
    }
}

impl Clock for GpuModel {
    fn stall_us(&mut self, us: u32) {
        self.now_us += u64::from(us);
    }
}

impl DmaAllocator for GpuModel {
    fn alloc_dma(&mut self, len: usize, align: u64) -> FwsecResult<DmaBuffer> {
        let align = align.max(1);
        let phys = self.next_phys.next_multiple_of(align);
        self.next_phys = phys + len as u64;
        self.events.push(Event::DmaAlloc { len, phys });
        Ok(DmaBuffer::from_parts(vec![0u8; len], phys))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_halt_delay() {
        let mut model = GpuModel::new(InitParams {
            runs: vec![FalconRun {
                halt_after_us: Some(1_000),
                mailbox0: 7,
                wpr2_hi: 0x3000,
                ..FalconRun::default()
            }],
            ..InitParams::default()
        });

        // Start the falcon; not yet halted.
        model.write32(GSP + regs::FALCON_CPUCTL, 1 << 1);
        assert_eq!(model.read32(GSP + regs::FALCON_CPUCTL) & (1 << 4), 0);

        // After the scripted delay the halt bit and effects appear.
        model.stall_us(1_000);
        assert_eq!(model.read32(GSP + regs::FALCON_CPUCTL), 1 << 4);
        assert_eq!(model.read32(GSP + regs::FALCON_MAILBOX0), 7);
        assert_eq!(model.read32(regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI), 0x3000);
        assert_eq!(model.start_count(), 1);
    }

    #[test]
    fn test_runs_consumed_in_order() {
        let mut model = GpuModel::new(InitParams {
            runs: vec![FalconRun::wpr2_unset(), FalconRun::success(0, 0x3000)],
            ..InitParams::default()
        });

        model.write32(GSP + regs::FALCON_CPUCTL, 1 << 1);
        assert_eq!(model.read32(GSP + regs::FALCON_CPUCTL), 1 << 4);
        assert_eq!(model.read32(regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI), 0);

        // Second start via the BROM trigger consumes the next run.
        model.write32(GSP + regs::FALCON_BCR_CTRL, 1 | (1 << 4));
        assert_eq!(model.read32(GSP + regs::FALCON_CPUCTL), 1 << 4);
        assert_eq!(model.read32(regs::NV_PFB_PRI_MMU_WPR2_ADDR_HI), 0x3000);
        assert_eq!(model.start_count(), 2);
    }

    #[test]
    fn test_dma_alloc_alignment_and_log() {
        let mut model = GpuModel::new(InitParams::default());
        let buf = model.alloc_dma(0x700, 256).unwrap();
        assert_eq!(buf.phys_addr() % 256, 0);
        assert_eq!(buf.len(), 0x700);
        assert!(matches!(
            model.events()[0],
            Event::DmaAlloc { len: 0x700, .. }
        ));
    }
}
