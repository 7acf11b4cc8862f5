//! Eager preallocation of intermediate directories.
//!
//! Three-level modes commit every required intermediate directory at
//! directory-creation time so the expensive root-register reload happens
//! once, not once per later mapping. The batch is all-or-nothing: a failure
//! on any slot releases the whole batch.

use arrayvec::ArrayVec;
use log::{trace, warn};

use crate::arch::{MAX_EAGER_SLOTS, PagingMode};
use crate::entry::{Entry, EntryFlags};
use crate::hooks::{Level, VirtHooks};
use crate::kernel::KernelTemplate;
use crate::phys::{AllocError, PageSource, TablePage};
use crate::table::{DirectoryTable, attach_meta, detach_meta};

pub(crate) type EagerBatch = ArrayVec<TablePage, MAX_EAGER_SLOTS>;

/// Allocates the mode's fixed count of intermediate directories.
///
/// Each slot gets a zero-filled page, constructed metadata, and a
/// virtualization-hook notification; failure of any step unwinds every
/// previously built slot and returns the error. Lazy modes return an empty
/// batch without touching the source.
pub(crate) fn preallocate<S: PageSource, H: VirtHooks>(
    mode: PagingMode,
    hooks: &H,
    source: &mut S,
) -> Result<EagerBatch, AllocError> {
    let mut batch = EagerBatch::new();
    for slot in 0..mode.eager_slots() {
        let mut page = match source.acquire_zeroed() {
            Ok(page) => page,
            Err(err) => {
                warn!("eager slot {slot} allocation failed, unwinding batch");
                release(batch, hooks, source);
                return Err(err);
            }
        };
        if let Err(err) = attach_meta(&mut page) {
            source.release(page);
            release(batch, hooks, source);
            return Err(err);
        }
        if let Err(err) = hooks.notify_alloc(Level::Mid, page.pfn()) {
            detach_meta(&mut page);
            source.release(page);
            release(batch, hooks, source);
            return Err(err);
        }
        batch.push(page);
    }
    Ok(batch)
}

/// Destroys and frees a batch of fully constructed eager directories.
///
/// Used on allocation-failure unwind and when a directory that never
/// became visible is torn down.
pub(crate) fn release<S: PageSource, H: VirtHooks>(
    batch: EagerBatch,
    hooks: &H,
    source: &mut S,
) {
    for mut page in batch {
        hooks.notify_release(Level::Mid, page.pfn());
        detach_meta(&mut page);
        source.release(page);
    }
}

/// Installs an eager batch into the top-level directory's slots.
///
/// Slots in the kernel region first receive a copy of the canonical kernel
/// sub-entries, so a directory is fully serviceable the moment its root
/// entry is written. Must run inside the construction-visibility critical
/// section; the caller performs the root-register reload afterwards.
pub(crate) fn populate(
    mode: PagingMode,
    kernel: &KernelTemplate,
    root: &DirectoryTable,
    batch: &EagerBatch,
) {
    debug_assert_eq!(batch.len(), mode.eager_slots());
    for (index, mid) in batch.iter().enumerate() {
        if index >= mode.kernel_boundary() {
            let canonical = kernel
                .kernel_mid(index)
                .expect("canonical kernel mid missing for eager kernel slot");
            mid.table().copy_from(canonical);
        }
        // Only the present bit is meaningful at this level on eager
        // hardware; everything else is reserved.
        root.entry(index)
            .store(Entry::new(mid.frame(), EntryFlags::PRESENT));
    }
}

/// Clears still-occupied eager slots out of a dying directory.
///
/// Preallocation commits pages whether or not the address space ever used
/// that slot, so slots the mapping layer never tore down are reclaimed
/// here. Returns the pages to destroy once the visibility lock is
/// dropped; the root entries are cleared immediately so no walker can
/// reach them.
pub(crate) fn mop_up(
    mode: PagingMode,
    root: &DirectoryTable,
    eager: ArrayVec<Option<TablePage>, MAX_EAGER_SLOTS>,
) -> EagerBatch {
    let mut reclaimed = EagerBatch::new();
    for (index, slot) in eager.into_iter().enumerate() {
        let Some(page) = slot else {
            // The mapping layer took this slot's handle and released the
            // directory through its own teardown.
            continue;
        };
        let entry = root.entry(index).load();
        if !entry.is_present() {
            // Entry cleared without taking the handle: the slot no longer
            // owns a table, nothing to free.
            continue;
        }
        assert_eq!(
            entry.pfn(),
            page.pfn(),
            "eager slot {index} was replaced without taking its handle"
        );
        root.entry(index).store(Entry::NONE);
        reclaimed.push(page);
    }
    if !reclaimed.is_empty() {
        trace!("mopped up {} eager slots", reclaimed.len());
    }
    debug_assert!(mode.eager_slots() >= reclaimed.len());
    reclaimed
}
