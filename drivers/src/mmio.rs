/*++

Licensed under the Apache-2.0 license.

File Name:

    mmio.rs

Abstract:

    Capability traits granting the bring-up engine access to the GPU BAR0
    register window, a stall source and a DMA allocator, plus the production
    BAR0 implementation over a raw MMIO mapping.

--*/

use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};

use fwsec_error::FwsecResult;

/// 32-bit register access to the GPU's BAR0 window.
///
/// Reads never fail: a dead bus returns `0xBADFxxxx` poison values, which
/// callers treat as data. `off` is a byte offset from the BAR0 base and must
/// be 4-byte aligned.
pub trait Bar0 {
    fn read32(&mut self, off: u32) -> u32;

    fn write32(&mut self, off: u32, val: u32);

    /// Release fence: all prior CPU stores (in particular to a DMA staging
    /// buffer) become visible to the device before any subsequent
    /// [`Bar0::write32`].
    fn fence(&mut self) {}
}

/// Busy-stall source used by every spin-wait.
pub trait Clock {
    fn stall_us(&mut self, us: u32);
}

/// Pinned, physically contiguous memory the GPU can DMA from.
///
/// `data` is the CPU mapping of the region; `phys` is the bus address
/// programmed into the device. The region is freed when the buffer drops.
pub struct DmaBuffer {
    data: Vec<u8>,
    phys: u64,
}

impl DmaBuffer {
    /// Wrap an allocation. The allocator guarantees that `phys` addresses
    /// the same bytes as `data`, stays stable while the buffer lives, and
    /// honors the alignment it was asked for.
    pub fn from_parts(data: Vec<u8>, phys: u64) -> Self {
        Self { data, phys }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Allocator for DMA staging memory.
pub trait DmaAllocator {
    /// Allocate `len` zeroed bytes whose physical address is a multiple of
    /// `align`. The physical address must fit the device's 48-bit mask.
    fn alloc_dma(&mut self, len: usize, align: u64) -> FwsecResult<DmaBuffer>;
}

/// BAR0 over a live MMIO mapping, using volatile 32-bit accesses.
pub struct MappedBar0 {
    base: *mut u8,
    len: usize,
}

impl MappedBar0 {
    /// # Safety
    ///
    /// `base..base + len` must be a valid, exclusively owned MMIO mapping of
    /// the GPU's BAR0 for the lifetime of the returned value, and the device
    /// must tolerate 32-bit accesses anywhere in that range.
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Self { base, len }
    }
}

// SAFETY: the mapping is exclusively owned and accesses take `&mut self`.
unsafe impl Send for MappedBar0 {}

impl Bar0 for MappedBar0 {
    fn read32(&mut self, off: u32) -> u32 {
        debug_assert!(off as usize + 4 <= self.len);
        debug_assert_eq!(off % 4, 0);
        // SAFETY: in bounds of the mapping per the `new` contract.
        unsafe { core::ptr::read_volatile(self.base.add(off as usize).cast::<u32>()) }
    }

    fn write32(&mut self, off: u32, val: u32) {
        debug_assert!(off as usize + 4 <= self.len);
        debug_assert_eq!(off % 4, 0);
        // SAFETY: in bounds of the mapping per the `new` contract.
        unsafe { core::ptr::write_volatile(self.base.add(off as usize).cast::<u32>(), val) }
    }

    fn fence(&mut self) {
        fence(Ordering::Release);
    }
}
