/*++

Licensed under the Apache-2.0 license.

File Name:

    lib.rs

Abstract:

    FWSEC extraction from the VBIOS: the multi-stage ROM decoder and the
    extracted firmware image manager.

--*/

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod fwsec;
mod vbios;

pub use fwsec::{select_signature_index, FwsecImage, StagingLayout};
pub use vbios::{RomImageInfo, Vbios};
