/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    FWSEC-FRTS orchestrator: drives the full WPR2 bring-up from GFW-boot
    wait through VBIOS decode, firmware patching, the BROM/DMA/PIO load
    cascade and the final WPR2 verification.

--*/

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod fb;

pub use fb::{FbLayout, FRTS_SIZE};
pub use fwsec_drivers::WprRange;
pub use fwsec_error::{FwsecError, FwsecResult, MethodError, TimeoutStage};

use log::{info, warn};

use fwsec_drivers::{
    check_arch, frts_error_code, fwsec_fuse_version, gsp_debug_fused, read_wpr2, wait_gfw_boot,
    wpr2_configured, Bar0, BromParams, Clock, DmaAllocator, DmaLoadParams, Falcon, FbifTarget,
};
use fwsec_image_extract::{FwsecImage, StagingLayout, Vbios};

/// Policy knobs of one bring-up call. The defaults implement the canonical
/// sequence.
#[derive(Debug, Clone, Copy)]
pub struct BringupConfig {
    /// Accept a WPR2 region established by earlier firmware and return it
    /// as success. When false, report `Wpr2AlreadySet` and let the caller
    /// decide on a device reset.
    pub accept_preexisting_wpr2: bool,
    /// Cap of the falcon halt wait, in microseconds.
    pub halt_timeout_us: u32,
    /// Force the PROD/DBG image preference instead of reading the debug
    /// fuse.
    pub debug_fuse_override: Option<bool>,
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            accept_preexisting_wpr2: true,
            halt_timeout_us: 5_000_000,
            debug_fuse_override: None,
        }
    }
}

/// Load methods, in cascade order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Brom,
    Dma,
    Pio,
}

/// Orchestrator position, mirroring the bring-up state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    AwaitGfw,
    Wpr2PreCheck,
    Decoding,
    Building,
    Loading(MethodKind),
    AwaitHalt,
    Verifying,
    Success,
    Failed,
}

/// Shared inputs of every load method.
struct MethodContext<'a> {
    image: &'a FwsecImage,
    staging_phys: u64,
    layout: StagingLayout,
}

/// One way of getting the firmware into the falcon and running.
trait LoadMethod {
    const KIND: MethodKind;

    fn load_and_start<E: Bar0 + Clock>(
        &self,
        env: &mut E,
        falcon: &mut Falcon,
        ctx: &MethodContext<'_>,
    ) -> FwsecResult<()>;
}

/// Heavy-secure entry: the boot ROM pulls the staging buffer in and
/// verifies the signature before execution.
struct BromLoad;

impl LoadMethod for BromLoad {
    const KIND: MethodKind = MethodKind::Brom;

    fn load_and_start<E: Bar0 + Clock>(
        &self,
        env: &mut E,
        falcon: &mut Falcon,
        ctx: &MethodContext<'_>,
    ) -> FwsecResult<()> {
        falcon.configure_fbif(env, FbifTarget::NoncoherentSysmem);
        falcon.set_dma_base(env, ctx.staging_phys);
        falcon.start_brom(
            env,
            &BromParams {
                pkc_data_offset: ctx.layout.signature_offset as u32,
                engine_id_mask: ctx.image.desc.engine_id_mask as u16,
                ucode_id: ctx.image.desc.ucode_id,
            },
        );
        Ok(())
    }
}

/// Plain DMA load of IMEM and DMEM, then a direct CPU start.
struct DmaLoad;

impl LoadMethod for DmaLoad {
    const KIND: MethodKind = MethodKind::Dma;

    fn load_and_start<E: Bar0 + Clock>(
        &self,
        env: &mut E,
        falcon: &mut Falcon,
        ctx: &MethodContext<'_>,
    ) -> FwsecResult<()> {
        falcon.configure_fbif(env, FbifTarget::NoncoherentSysmem);
        falcon.load_dma(
            env,
            ctx.staging_phys,
            &DmaLoadParams {
                imem_len: ctx.image.imem().len() as u32,
                imem_base: ctx.image.desc.imem_phys_base,
                dmem_len: ctx.image.dmem().len() as u32,
                dmem_base: ctx.image.desc.dmem_phys_base,
                boot_vec: ctx.image.desc.imem_virt_base,
            },
        )?;
        falcon.start(env, None);
        Ok(())
    }
}

/// PIO last resort; skips signature verification entirely and therefore
/// only succeeds on debug-fused parts.
struct PioLoad;

impl LoadMethod for PioLoad {
    const KIND: MethodKind = MethodKind::Pio;

    fn load_and_start<E: Bar0 + Clock>(
        &self,
        env: &mut E,
        falcon: &mut Falcon,
        ctx: &MethodContext<'_>,
    ) -> FwsecResult<()> {
        falcon.load_pio(env, ctx.image.imem(), ctx.image.dmem());
        falcon.start(env, Some(ctx.image.desc.imem_virt_base));
        Ok(())
    }
}

/// The FWSEC-FRTS bring-up flow.
pub struct FwsecFrts {
    config: BringupConfig,
    stage: Stage,
}

impl FwsecFrts {
    pub fn new(config: BringupConfig) -> Self {
        Self {
            config,
            stage: Stage::Idle,
        }
    }

    /// Where the last `run` call ended up.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Execute the bring-up against `rom`, the VBIOS image bytes.
    pub fn run<E>(&mut self, env: &mut E, rom: &[u8]) -> FwsecResult<WprRange>
    where
        E: Bar0 + Clock + DmaAllocator,
    {
        let result = self.run_inner(env, rom);
        self.stage = match &result {
            Ok(_) => Stage::Success,
            Err(_) => Stage::Failed,
        };
        result
    }

    fn run_inner<E>(&mut self, env: &mut E, rom: &[u8]) -> FwsecResult<WprRange>
    where
        E: Bar0 + Clock + DmaAllocator,
    {
        check_arch(env)?;

        self.stage = Stage::AwaitGfw;
        wait_gfw_boot(env)?;

        self.stage = Stage::Wpr2PreCheck;
        if wpr2_configured(env) {
            let range = read_wpr2(env);
            info!("WPR2 already configured: {:#x}..{:#x}", range.lo, range.hi);
            return if self.config.accept_preexisting_wpr2 {
                Ok(range)
            } else {
                Err(FwsecError::Wpr2AlreadySet {
                    lo: range.lo,
                    hi: range.hi,
                })
            };
        }

        self.stage = Stage::Decoding;
        let prefer_debug = match self.config.debug_fuse_override {
            Some(value) => value,
            None => gsp_debug_fused(env),
        };
        let vbios = Vbios::parse(rom, prefer_debug)?;

        self.stage = Stage::Building;
        let mut image = FwsecImage::from_vbios(rom, &vbios)?;
        let layout = FbLayout::new(env);
        image.patch_frts_command(
            layout.frts_offset_from_end() as u32,
            layout.frts_size as u32,
        )?;

        let fuse_version = fwsec_fuse_version(env);
        let sig_idx = image.select_signature(fuse_version)?;

        let mut staging = env.alloc_dma(image.staging_len(), 256)?;
        let staging_layout = image.write_staging(sig_idx, staging.as_mut_slice())?;

        let mut falcon = Falcon::gsp(env);
        let ctx = MethodContext {
            image: &image,
            staging_phys: staging.phys_addr(),
            layout: staging_layout,
        };

        info!(
            "starting FWSEC-FRTS: frts {:#x}+{:#x}, signature {}, staging at {:#x}",
            layout.frts_base, layout.frts_size, sig_idx, staging.phys_addr()
        );

        let brom = match self.attempt(env, &mut falcon, &ctx, &BromLoad)? {
            Ok(range) => return Ok(range),
            Err(err) => err,
        };
        let dma = match self.attempt(env, &mut falcon, &ctx, &DmaLoad)? {
            Ok(range) => return Ok(range),
            Err(err) => err,
        };
        let pio = match self.attempt(env, &mut falcon, &ctx, &PioLoad)? {
            Ok(range) => return Ok(range),
            Err(err) => err,
        };

        Err(FwsecError::AllMethodsFailed { brom, dma, pio })
    }

    /// Run one method end to end: reset, load, start, halt-wait, verify.
    ///
    /// Method failures (including a halt timeout) are captured so the
    /// cascade can fall through; environment faults are terminal.
    fn attempt<E, M>(
        &mut self,
        env: &mut E,
        falcon: &mut Falcon,
        ctx: &MethodContext<'_>,
        method: &M,
    ) -> FwsecResult<Result<WprRange, MethodError>>
    where
        E: Bar0 + Clock,
        M: LoadMethod,
    {
        self.stage = Stage::Loading(M::KIND);

        // A falcon that failed a previous method is in an undefined state;
        // never reload without a full controller reset.
        falcon.reset(env)?;

        if let Err(err) = method.load_and_start(env, falcon, ctx) {
            return match err {
                FwsecError::Timeout(stage) => {
                    warn!("{:?} load timed out: {}", M::KIND, stage);
                    Ok(Err(MethodError::Timeout(stage)))
                }
                other => Err(other),
            };
        }

        self.stage = Stage::AwaitHalt;
        let status = match falcon.wait_halt(env, self.config.halt_timeout_us) {
            Ok(status) => status,
            Err(FwsecError::Timeout(stage)) => {
                warn!("{:?}: falcon did not halt", M::KIND);
                return Ok(Err(MethodError::Timeout(stage)));
            }
            Err(other) => return Err(other),
        };

        self.stage = Stage::Verifying;
        let frts_err = frts_error_code(env);
        if frts_err != 0 {
            warn!(
                "{:?}: FWSEC halted with FRTS error {:#06x} (mailbox0 {:#x})",
                M::KIND,
                frts_err,
                status.mailbox0
            );
            return Ok(Err(MethodError::Frts(frts_err)));
        }
        if !wpr2_configured(env) {
            warn!("{:?}: FWSEC halted but WPR2 is unset", M::KIND);
            return Ok(Err(MethodError::Wpr2NotSet));
        }

        let range = read_wpr2(env);
        info!("WPR2 established: {:#x}..{:#x}", range.lo, range.hi);
        Ok(Ok(range))
    }
}

/// Parse the VBIOS, patch FWSEC with the FRTS command and run it on the
/// GSP falcon. On success a valid WPR2 region exists in framebuffer
/// memory and its range is returned.
pub fn execute_fwsec_frts<E>(env: &mut E, vbios: &[u8]) -> FwsecResult<WprRange>
where
    E: Bar0 + Clock + DmaAllocator,
{
    FwsecFrts::new(BringupConfig::default()).run(env, vbios)
}
