//! Accessed/dirty protocol on translation entries.
//!
//! The hardware tracks accessed and dirty bits itself; these operations
//! exist for the transitions software drives, and they flush as little as
//! the architecture allows. The rule from the concurrency model: updates
//! that widen what an entry permits may become visible lazily (the worst
//! case is one spurious fault), updates that narrow permissions or
//! decompose a huge entry must be flushed before returning.

use crate::AddressSpaceId;
use crate::arch::PagingMode;
use crate::entry::{AtomicEntry, Entry, EntryFlags};
use crate::tlb::TlbFlush;

/// Writes `new` into `entry` if it differs and `dirty` is requested;
/// returns whether the entry differed.
///
/// Used by write-fault handling to set the dirty bit and widen the entry
/// to writable in one step. No cross-processor flush is issued: the change
/// only widens permissions, and hardware re-walks on the next access
/// rather than silently keeping a stale translation, so the worst case is
/// one harmless repeated fault.
pub fn set_access_flags(entry: &AtomicEntry, new: Entry, dirty: bool) -> bool {
    let changed = entry.load() != new;
    if changed && dirty {
        entry.store(new);
    }
    changed
}

/// [`set_access_flags`] for a huge intermediate entry. `address` must be
/// aligned to the huge extent.
pub fn set_access_flags_huge(
    mode: PagingMode,
    address: u64,
    entry: &AtomicEntry,
    new: Entry,
    dirty: bool,
) -> bool {
    assert_eq!(address % mode.huge_extent(), 0, "unaligned huge entry address");
    set_access_flags(entry, new, dirty)
}

/// Atomically clears the accessed bit, returning whether it was set.
///
/// Repeating the call is idempotent: the second call finds the bit clear
/// and reports `false`. No flush is issued; callers that need one use
/// [`clear_flush_young`].
pub fn test_and_clear_young(entry: &AtomicEntry) -> bool {
    // Skip the atomic op entirely when the bit is already clear; this is
    // the common case when scanning for idle pages.
    if !entry.load().flags().contains(EntryFlags::ACCESSED) {
        return false;
    }
    entry.test_and_clear(EntryFlags::ACCESSED)
}

/// Clears the accessed bit for reclaim scanning, without flushing.
///
/// A stale accessed bit in a translation cache costs at most a page-aging
/// misjudgment, never corruption, and the bit is refreshed on the next
/// real access before the page could be evicted, so the flush is skipped
/// on purpose. This leans on the architecture's fault-recovery behavior;
/// a port to hardware without that guarantee must add the flush here.
pub fn clear_flush_young(entry: &AtomicEntry) -> bool {
    test_and_clear_young(entry)
}

/// [`clear_flush_young`] for a huge intermediate entry.
///
/// Unlike the leaf path this one does flush the entry's whole extent: huge
/// translations have platform-specific staleness hazards the leaf fast
/// path does not.
pub fn clear_flush_young_huge<F: TlbFlush>(
    flush: &F,
    asid: AddressSpaceId,
    mode: PagingMode,
    address: u64,
    entry: &AtomicEntry,
) -> bool {
    assert_eq!(address % mode.huge_extent(), 0, "unaligned huge entry address");
    let young = test_and_clear_young(entry);
    if young {
        flush.flush_range(asid, address, address + mode.huge_extent());
    }
    young
}

/// Marks a huge entry as being decomposed into a leaf table.
///
/// Atomically test-and-sets the splitting bit; the loser of a race sees it
/// already set and does nothing, so exactly one winner issues the flush.
/// The flush must complete before the decomposition proceeds: it
/// serializes against lock-free translation walks that never take the
/// table lock and would otherwise keep treating the entry as a stable huge
/// mapping.
pub fn mark_splitting<F: TlbFlush>(
    flush: &F,
    asid: AddressSpaceId,
    mode: PagingMode,
    address: u64,
    entry: &AtomicEntry,
) {
    assert_eq!(address % mode.huge_extent(), 0, "unaligned huge entry address");
    if !entry.test_and_set(EntryFlags::SPLITTING) {
        flush.flush_range(asid, address, address + mode.huge_extent());
    }
}
