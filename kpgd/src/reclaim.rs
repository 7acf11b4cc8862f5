//! Deferred release of translation-table pages.
//!
//! A table page cannot go back to the page source the moment it is
//! unlinked: other processors may still hold cached translations walked
//! through it, and the source may hand the frame to anyone immediately.
//! Teardown therefore collects pages into a [`ReclaimBatch`] and only
//! returns them after the batch's flush epoch completes.

use arrayvec::ArrayVec;
use log::trace;

use crate::AddressSpaceId;
use crate::arch::PagingMode;
use crate::hooks::{Level, VirtHooks};
use crate::phys::{PageSource, TablePage};
use crate::table::detach_meta;
use crate::tlb::TlbFlush;

/// Maximum pages a single batch holds before an epoch must complete.
pub const RECLAIM_BATCH_CAPACITY: usize = 64;

/// A batch of unlinked table pages awaiting a flush epoch.
///
/// Collected by teardown paths and handed to [`ReclaimBatch::complete`]
/// once the covering range has been unmapped. Freeing any of these pages
/// early would let the frame be reused while a stale cached translation
/// still points at it.
#[derive(Debug)]
pub struct ReclaimBatch {
    asid: AddressSpaceId,
    pages: ArrayVec<TablePage, RECLAIM_BATCH_CAPACITY>,
    need_full_reload: bool,
}

impl ReclaimBatch {
    /// Starts an empty batch for one address space.
    pub fn new(asid: AddressSpaceId) -> Self {
        Self {
            asid,
            pages: ArrayVec::new(),
            need_full_reload: false,
        }
    }

    /// The number of pages queued in this batch.
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the batch holds no pages.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Whether the batch is at capacity and must be completed before more
    /// pages are deferred.
    pub fn is_full(&self) -> bool {
        self.pages.is_full()
    }

    /// Whether completing this batch requires a full root-register reload.
    pub fn needs_full_reload(&self) -> bool {
        self.need_full_reload
    }

    fn push(&mut self, page: TablePage) {
        assert!(
            !self.pages.is_full(),
            "reclaim batch overflow; complete an epoch before deferring more pages"
        );
        self.pages.push(page);
    }

    /// Defers release of an unlinked leaf table.
    ///
    /// Destroys the attached metadata and notifies the virtualization
    /// layer now; the page itself is freed at epoch completion.
    pub fn defer_release_leaf<H: VirtHooks>(&mut self, hooks: &H, mut page: TablePage) {
        detach_meta(&mut page);
        hooks.notify_release(Level::Leaf, page.pfn());
        self.push(page);
    }

    /// Defers release of an unlinked intermediate directory.
    ///
    /// On three-level hardware any change to a top-level entry needs a full
    /// root-register reload to be observed, so the batch is upgraded from a
    /// range flush to a full reload.
    pub fn defer_release_mid<H: VirtHooks>(
        &mut self,
        mode: PagingMode,
        hooks: &H,
        mut page: TablePage,
    ) {
        detach_meta(&mut page);
        hooks.notify_release(Level::Mid, page.pfn());
        if mode.mid_teardown_full_reload() {
            self.need_full_reload = true;
        }
        self.push(page);
    }

    /// Defers release of an unlinked upper directory (four-level modes
    /// only).
    pub fn defer_release_upper<H: VirtHooks>(
        &mut self,
        mode: PagingMode,
        hooks: &H,
        page: TablePage,
    ) {
        assert!(mode.has_upper_level(), "no upper directory level in this mode");
        hooks.notify_release(Level::Upper, page.pfn());
        self.push(page);
    }

    /// Completes the flush epoch and returns every queued page.
    ///
    /// `start..end` is the virtual range the batch's tables served. The
    /// flush is issued before any page is released, which is the entire
    /// point of the deferral.
    pub fn complete<F: TlbFlush, S: PageSource>(
        self,
        flush: &F,
        source: &mut S,
        start: u64,
        end: u64,
    ) {
        if self.need_full_reload {
            flush.flush_address_space(self.asid);
        } else {
            flush.flush_range(self.asid, start, end);
        }
        trace!(
            "reclaim epoch complete for {:?}: releasing {} table pages",
            self.asid,
            self.pages.len()
        );
        for page in self.pages {
            source.release(page);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;
    use crate::table::alloc_leaf_table;
    use crate::test_util::{HostPageSource, RecordingFlush};

    #[test]
    fn leaf_release_waits_for_epoch() {
        let mut source = HostPageSource::new();
        let flush = RecordingFlush::default();
        let page = alloc_leaf_table(&mut source).unwrap();
        let mut batch = ReclaimBatch::new(AddressSpaceId(1));
        batch.defer_release_leaf(&NoHooks, page);
        assert_eq!(source.outstanding(), 1);
        batch.complete(&flush, &mut source, 0x1000, 0x2000);
        assert_eq!(source.outstanding(), 0);
        assert_eq!(flush.range_flushes(), 1);
        assert_eq!(flush.full_flushes(), 0);
    }

    #[test]
    fn three_level_mid_release_forces_full_reload() {
        let mut source = HostPageSource::new();
        let flush = RecordingFlush::default();
        let mode = PagingMode::three_level_shared();
        let page = alloc_leaf_table(&mut source).unwrap();
        let mut batch = ReclaimBatch::new(AddressSpaceId(1));
        batch.defer_release_mid(mode, &NoHooks, page);
        assert!(batch.needs_full_reload());
        batch.complete(&flush, &mut source, 0, 0x40_0000);
        assert_eq!(flush.full_flushes(), 1);
        assert_eq!(flush.range_flushes(), 0);
        assert_eq!(source.outstanding(), 0);
    }

    #[test]
    fn four_level_mid_release_uses_range_flush() {
        let mut source = HostPageSource::new();
        let flush = RecordingFlush::default();
        let mode = PagingMode::four_level();
        let page = alloc_leaf_table(&mut source).unwrap();
        let mut batch = ReclaimBatch::new(AddressSpaceId(1));
        batch.defer_release_mid(mode, &NoHooks, page);
        assert!(!batch.needs_full_reload());
        batch.complete(&flush, &mut source, 0, 0x40_0000);
        assert_eq!(flush.range_flushes(), 1);
        assert_eq!(source.outstanding(), 0);
    }

    #[test]
    #[should_panic]
    fn upper_release_requires_four_levels() {
        let mut source = HostPageSource::new();
        let page = source.acquire_zeroed().unwrap();
        let mut batch = ReclaimBatch::new(AddressSpaceId(1));
        batch.defer_release_upper(PagingMode::two_level(), &NoHooks, page);
    }
}
