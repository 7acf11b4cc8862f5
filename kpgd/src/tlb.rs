//! Translation-cache control seam.

use crate::AddressSpaceId;

/// Translation-cache invalidation primitives.
///
/// The lifecycle core decides *when* a flush is required for correctness
/// (narrowing or decomposing updates) and when it may be skipped (widening
/// updates, accessed-bit clears); the mechanism lives behind this trait.
pub trait TlbFlush {
    /// Discards every cached translation for `asid`, including top-level
    /// entries. Equivalent to a full root-register reload.
    fn flush_address_space(&self, asid: AddressSpaceId);

    /// Discards cached translations for `asid` covering `start..end`.
    fn flush_range(&self, asid: AddressSpaceId, start: u64, end: u64);

    /// Discards cached translations for the currently loaded context.
    fn flush_current(&self);
}

/// Flush implementation that does nothing; for hosts without a live
/// translation cache (tests, single-context bring-up).
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFlush;

impl TlbFlush for NoFlush {
    fn flush_address_space(&self, _asid: AddressSpaceId) {}

    fn flush_range(&self, _asid: AddressSpaceId, _start: u64, _end: u64) {}

    fn flush_current(&self) {}
}
