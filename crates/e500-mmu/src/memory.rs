//! Guest physical → host physical resolution.

use thiserror::Error;

/// A reference held against host frames so they cannot be reclaimed while a
/// shadow entry points at them.
///
/// Pins are not `Clone`: whoever holds one owns the obligation to hand it back
/// through [`GuestMemoryMap::release`] exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct FramePin {
    pfn: u64,
    pages: u64,
    cookie: u64,
}

impl FramePin {
    /// `cookie` is opaque to this crate; maps use it to find their own bookkeeping.
    pub fn new(pfn: u64, pages: u64, cookie: u64) -> Self {
        debug_assert!(pages > 0);
        Self { pfn, pages, cookie }
    }

    /// First pinned host frame.
    #[inline]
    pub fn pfn(&self) -> u64 {
        self.pfn
    }

    #[inline]
    pub fn pages(&self) -> u64 {
        self.pages
    }

    #[inline]
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Whether any pinned frame lies in the inclusive range `[low, high]`.
    #[inline]
    pub fn overlaps(&self, low: u64, high: u64) -> bool {
        self.pfn <= high && self.pfn + (self.pages - 1) >= low
    }
}

/// What backs a resolved guest frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Ordinary host-managed memory.
    Ram,
    /// Raw host frames `[start_pfn, end_pfn)` mapped straight through (device
    /// MMIO and similar); larger shadow pages may be built inside it.
    Passthrough { start_pfn: u64, end_pfn: u64 },
}

#[derive(Debug)]
pub struct ResolvedFrame {
    pub pin: FramePin,
    pub backing: Backing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("guest frame {gfn:#x} is not backed by host memory")]
    NotBacked { gfn: u64 },

    #[error("{pages} frames at guest frame {gfn:#x} are not host-contiguous")]
    NotContiguous { gfn: u64, pages: u64 },
}

/// Guest memory map of the VM that owns this vCPU.
pub trait GuestMemoryMap {
    /// Resolves and pins `pages` guest frames starting at `gfn`.
    ///
    /// For RAM the returned pin covers `pages` host-contiguous frames. For a
    /// passthrough region the pin covers the requested frames and `backing`
    /// reports the full region bounds.
    fn pin(&mut self, gfn: u64, pages: u64, writable: bool) -> Result<ResolvedFrame, FrameError>;

    /// Returns a pin. `dirty` is set when the mapping allowed writes.
    fn release(&mut self, pin: FramePin, dirty: bool);
}

impl<T: GuestMemoryMap + ?Sized> GuestMemoryMap for &mut T {
    #[inline]
    fn pin(&mut self, gfn: u64, pages: u64, writable: bool) -> Result<ResolvedFrame, FrameError> {
        <T as GuestMemoryMap>::pin(&mut **self, gfn, pages, writable)
    }

    #[inline]
    fn release(&mut self, pin: FramePin, dirty: bool) {
        <T as GuestMemoryMap>::release(&mut **self, pin, dirty)
    }
}
