/*++

Licensed under the Apache-2.0 license.

File Name:

    bringup_tests.rs

Abstract:

    End-to-end orchestration tests against the GPU model: the canonical
    bring-up, the pre-set WPR2 short circuit, halt timeouts, the load
    method cascade and the write-ordering contract.

--*/

use fwsec_drivers::regs;
use fwsec_error::{FwsecError, MethodError, TimeoutStage};
use fwsec_frts::{execute_fwsec_frts, BringupConfig, FwsecFrts, Stage, WprRange};
use fwsec_hw_model::{Event, FalconRun, GpuModel, InitParams};
use fwsec_image_gen::VbiosBuilder;

const GSP: u32 = regs::FALCON_GSP_BASE;

fn model_with_runs(runs: Vec<FalconRun>) -> GpuModel {
    GpuModel::new(InitParams {
        runs,
        ..InitParams::default()
    })
}

#[test]
fn test_s1_canonical_bringup() {
    // Mock falcon halts immediately and reports WPR2_HI = 0x3000; the
    // register decodes to 0x300000.
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = model_with_runs(vec![FalconRun::success(0, 0x3000)]);

    let range = execute_fwsec_frts(&mut model, &rom).unwrap();
    assert_eq!(range, WprRange { lo: 0, hi: 0x0030_0000 });
    assert_eq!(model.start_count(), 1);
}

#[test]
fn test_s1_stage_reaches_success() {
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = model_with_runs(vec![FalconRun::success(0, 0x3000)]);

    let mut flow = FwsecFrts::new(BringupConfig::default());
    assert_eq!(flow.stage(), Stage::Idle);
    flow.run(&mut model, &rom).unwrap();
    assert_eq!(flow.stage(), Stage::Success);
}

#[test]
fn test_s2_preexisting_wpr2_short_circuits() {
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = GpuModel::new(InitParams {
        wpr2_hi: 0x3000,
        ..InitParams::default()
    });

    let range = execute_fwsec_frts(&mut model, &rom).unwrap();
    assert_eq!(range, WprRange { lo: 0, hi: 0x0030_0000 });

    // The falcon was never touched.
    assert_eq!(model.start_count(), 0);
    assert!(!model.touched_gsp_falcon());
}

#[test]
fn test_preexisting_wpr2_reported_when_not_accepted() {
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = GpuModel::new(InitParams {
        wpr2_hi: 0x3000,
        ..InitParams::default()
    });

    let config = BringupConfig {
        accept_preexisting_wpr2: false,
        ..BringupConfig::default()
    };
    let result = FwsecFrts::new(config).run(&mut model, &rom);
    assert_eq!(
        result,
        Err(FwsecError::Wpr2AlreadySet {
            lo: 0,
            hi: 0x0030_0000
        })
    );
    assert!(!model.touched_gsp_falcon());
}

#[test]
fn test_s4_halt_just_within_cap_succeeds_on_brom() {
    // The falcon takes 4 s to halt; the default 5 s cap covers it.
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = model_with_runs(vec![FalconRun {
        halt_after_us: Some(4_000_000),
        wpr2_hi: 0x3000,
        ..FalconRun::default()
    }]);

    let range = execute_fwsec_frts(&mut model, &rom).unwrap();
    assert_eq!(range.hi, 0x0030_0000);
    assert_eq!(model.start_count(), 1);
}

#[test]
fn test_s4_halt_timeout_falls_through_to_dma() {
    // With a 3 s cap the same falcon times out on BROM and the DMA method
    // runs next.
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = model_with_runs(vec![
        FalconRun {
            halt_after_us: Some(4_000_000),
            wpr2_hi: 0x3000,
            ..FalconRun::default()
        },
        FalconRun::success(0, 0x3000),
    ]);

    let config = BringupConfig {
        halt_timeout_us: 3_000_000,
        ..BringupConfig::default()
    };
    let range = FwsecFrts::new(config).run(&mut model, &rom).unwrap();
    assert_eq!(range.hi, 0x0030_0000);
    assert_eq!(model.start_count(), 2);
}

#[test]
fn test_s5_gfw_timeout_stops_everything() {
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = GpuModel::new(InitParams {
        gfw_progress: 0xFE,
        ..InitParams::default()
    });

    let mut flow = FwsecFrts::new(BringupConfig::default());
    let result = flow.run(&mut model, &rom);
    assert_eq!(result, Err(FwsecError::Timeout(TimeoutStage::GfwBoot)));
    assert_eq!(flow.stage(), Stage::Failed);

    // No register was written and no later stage ran.
    assert!(model.events().is_empty());
    // The wait polled for the full 2 s cap at 1 ms stride.
    assert_eq!(model.now_us(), 2_000_000);
}

#[test]
fn test_p6_staging_fence_base_start_ordering() {
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = model_with_runs(vec![FalconRun::success(0, 0x3000)]);
    execute_fwsec_frts(&mut model, &rom).unwrap();

    let events = model.events();

    // The staging buffer exists before the fence, the fence precedes the
    // DMA base programming, and the start trigger is the last write.
    let alloc = events
        .iter()
        .position(|e| matches!(e, Event::DmaAlloc { .. }))
        .unwrap();
    let fence = events
        .iter()
        .position(|e| matches!(e, Event::Fence))
        .unwrap();
    let base = events
        .iter()
        .position(
            |e| matches!(e, Event::Write { off, .. } if *off == GSP + regs::FALCON_DMATRFBASE),
        )
        .unwrap();
    assert!(alloc < fence);
    assert!(fence < base);

    let last_write = events
        .iter()
        .rev()
        .find_map(|e| match e {
            Event::Write { off, val } => Some((*off, *val)),
            _ => None,
        })
        .unwrap();
    // BROM start: core select with the valid bit.
    assert_eq!(last_write, (GSP + regs::FALCON_BCR_CTRL, 1 | (1 << 4)));
}

#[test]
fn test_p8_cascade_stops_at_first_success() {
    // Method A halts with WPR2 unset, method B establishes it; method C
    // must not run.
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = model_with_runs(vec![
        FalconRun::wpr2_unset(),
        FalconRun::success(0, 0x3000),
        FalconRun::success(0, 0x4000),
    ]);

    let range = execute_fwsec_frts(&mut model, &rom).unwrap();
    assert_eq!(range.hi, 0x0030_0000);
    assert_eq!(model.start_count(), 2);
}

#[test]
fn test_all_methods_failed_carries_each_cause() {
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = model_with_runs(vec![
        FalconRun::wpr2_unset(),
        FalconRun {
            frts_err: 0x0004,
            ..FalconRun::default()
        },
        FalconRun::hang(),
    ]);

    let result = execute_fwsec_frts(&mut model, &rom);
    assert_eq!(
        result,
        Err(FwsecError::AllMethodsFailed {
            brom: MethodError::Wpr2NotSet,
            dma: MethodError::Frts(0x0004),
            pio: MethodError::Timeout(TimeoutStage::FalconHalt),
        })
    );
    assert_eq!(model.start_count(), 3);
}

#[test]
fn test_core_select_nack_is_fatal() {
    // A controller that never acknowledges core select cannot be loaded by
    // any method; the failure is terminal, not part of the cascade.
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = GpuModel::new(InitParams {
        core_select_ack: false,
        runs: vec![FalconRun::success(0, 0x3000)],
        ..InitParams::default()
    });

    let result = execute_fwsec_frts(&mut model, &rom);
    assert_eq!(result, Err(FwsecError::Timeout(TimeoutStage::CoreSelect)));
    assert_eq!(model.start_count(), 0);
}

#[test]
fn test_non_ada_architecture_is_rejected() {
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = GpuModel::new(InitParams {
        boot0: 0x17 << 20,
        ..InitParams::default()
    });

    let result = execute_fwsec_frts(&mut model, &rom);
    assert_eq!(result, Err(FwsecError::ArchUnsupported(0x17)));
    assert!(model.events().is_empty());
}

#[test]
fn test_signature_unavailable_surfaces_before_loading() {
    // The image only advertises signature version 1 but the part is fused
    // to version 0.
    let rom = VbiosBuilder::default()
        .signature_versions(0b10)
        .build()
        .unwrap();
    let mut model = GpuModel::new(InitParams::default());

    let result = execute_fwsec_frts(&mut model, &rom);
    assert_eq!(result, Err(FwsecError::SignatureUnavailable(0)));
    assert_eq!(model.start_count(), 0);
}

#[test]
fn test_staging_allocation_covers_whole_image() {
    // The staging buffer must hold the IMEM, the patched DMEM and the
    // selected signature.
    let rom = VbiosBuilder::default().build().unwrap();
    let mut model = model_with_runs(vec![FalconRun::success(0, 0x3000)]);
    execute_fwsec_frts(&mut model, &rom).unwrap();

    let Some(Event::DmaAlloc { len, .. }) = model
        .events()
        .iter()
        .find(|e| matches!(e, Event::DmaAlloc { .. }))
    else {
        panic!("no staging allocation");
    };
    // IMEM + DMEM + one RSA-3K signature.
    assert_eq!(*len, 0x400 + 0x200 + 384);
}
