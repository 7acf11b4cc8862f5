//! Hardened user-region directory mirrors.
//!
//! The user-access-isolation defense runs the kernel on a restricted
//! mirror of each directory: identical layout, but nothing in the user
//! region is executable or user-reachable. The mirror has no lifecycle of
//! its own; it is re-derived from its source whenever the source's
//! user-region entries change, which keeps the two from diverging.

use crate::arch::PagingMode;
use crate::entry::{Entry, EntryFlags};
use crate::table::DirectoryTable;

/// Re-derives the restricted user-region mirror of `src` into `dst`.
///
/// Every user-region entry is copied with its user-access bit stripped and
/// the no-execute bit forced on; kernel-region entries are left alone.
pub fn shadow_user_entries(mode: PagingMode, dst: &DirectoryTable, src: &DirectoryTable) {
    for index in 0..mode.kernel_boundary() {
        let raw = src.entry(index).load().raw();
        let restricted =
            (raw | EntryFlags::NO_EXECUTE.bits()) & !EntryFlags::USER_ACCESSIBLE.bits();
        dst.entry(index).store(Entry::from_raw(restricted));
    }
}

/// Copies the user-region entries of `src` into `dst` for a per-processor
/// directory copy, forcing the user-access bit on.
///
/// With `strip_present` the copies are additionally made non-present, for
/// configurations that want user mappings unreachable from the copy until
/// explicitly re-enabled.
pub fn clone_user_entries(
    mode: PagingMode,
    dst: &DirectoryTable,
    src: &DirectoryTable,
    strip_present: bool,
) {
    for index in 0..mode.kernel_boundary() {
        let mut raw = src.entry(index).load().raw() | EntryFlags::USER_ACCESSIBLE.bits();
        if strip_present {
            raw &= !EntryFlags::PRESENT.bits();
        }
        dst.entry(index).store(Entry::from_raw(raw));
    }
}
