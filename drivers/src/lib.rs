/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    File contains exports for the FWSEC bring-up driver library.

--*/

#![no_std]

extern crate alloc;

mod falcon;
mod gpu;
mod mmio;
pub mod regs;
mod wait;

pub use falcon::{BromParams, DmaLoadParams, Falcon, FbifTarget, HaltStatus, DMA_BLOCK_SIZE};
pub use fwsec_error::{FwsecError, FwsecResult, TimeoutStage};
pub use gpu::{
    arch_code, check_arch, frts_error_code, fwsec_fuse_version, gsp_debug_fused, read_wpr2,
    usable_fb_size, wait_gfw_boot, wpr2_configured, WprRange, ARCH_ADA, GFW_BOOT_COMPLETE,
};
pub use mmio::{Bar0, Clock, DmaAllocator, DmaBuffer, MappedBar0};
pub use wait::{poll_until, PollSpec};
