//! Translation-depth configuration.
//!
//! The number of translation levels (2, 3 or 4) is fixed at boot. Everything
//! above this module is written against a [`PagingMode`] value instead of a
//! compile-time depth, so one binary can carry all supported depths.

/// The size of a translation table in bytes.
pub const PAGE_SIZE: usize = 4096;
/// The number of 64-bit entries in one table page.
pub const ENTRY_COUNT: usize = PAGE_SIZE / core::mem::size_of::<u64>();
/// Upper bound on eager intermediate-directory slots across all modes.
///
/// The only mode that preallocates is the three-level one, whose root
/// directory has 4 entries.
pub const MAX_EAGER_SLOTS: usize = 4;

/// A resolved translation-depth configuration.
///
/// Constructed once at boot from one of the preset constructors and then
/// passed by value; the eager slot count and entry layout never change for
/// the lifetime of a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagingMode {
    levels: u8,
    root_entries: usize,
    kernel_boundary: usize,
    shared_kernel_mid: bool,
}

impl PagingMode {
    /// Two translation levels: root entries point directly at leaf tables.
    pub const fn two_level() -> Self {
        Self::new(2, ENTRY_COUNT, ENTRY_COUNT / 2, false)
    }

    /// Three levels with a 4-entry root, kernel intermediate directories
    /// shared by every address space.
    pub const fn three_level_shared() -> Self {
        Self::new(3, 4, 3, true)
    }

    /// Three levels with a 4-entry root and per-address-space kernel
    /// intermediate directories (e.g. under a virtualization layer that
    /// forbids sharing them).
    pub const fn three_level_unshared() -> Self {
        Self::new(3, 4, 3, false)
    }

    /// Four translation levels with a higher-half kernel region.
    pub const fn four_level() -> Self {
        Self::new(4, ENTRY_COUNT, ENTRY_COUNT / 2, false)
    }

    /// Builds a mode from raw parameters, panicking on inconsistent ones.
    pub const fn new(
        levels: u8,
        root_entries: usize,
        kernel_boundary: usize,
        shared_kernel_mid: bool,
    ) -> Self {
        assert!(levels >= 2 && levels <= 4, "unsupported translation depth");
        assert!(root_entries <= ENTRY_COUNT);
        assert!(kernel_boundary < root_entries);
        let mode = Self {
            levels,
            root_entries,
            kernel_boundary,
            shared_kernel_mid,
        };
        // Eager population exists precisely because three-level hardware
        // reloads the root register on top-level changes; a three-level mode
        // with nothing to preallocate is a misconfiguration.
        assert!(levels != 3 || mode.eager_slots() > 0);
        assert!(mode.eager_slots() <= MAX_EAGER_SLOTS);
        mode
    }

    /// The number of translation levels.
    pub const fn levels(self) -> u8 {
        self.levels
    }

    /// The number of valid entries in a top-level directory.
    pub const fn root_entries(self) -> usize {
        self.root_entries
    }

    /// The first top-level index belonging to the kernel region.
    pub const fn kernel_boundary(self) -> usize {
        self.kernel_boundary
    }

    /// Whether kernel intermediate directories are shared across all
    /// address spaces.
    pub const fn shared_kernel_mid(self) -> bool {
        self.shared_kernel_mid
    }

    /// The number of intermediate directories preallocated into every new
    /// top-level directory.
    ///
    /// Three-level hardware requires a full root-register reload whenever a
    /// top-level entry changes. Since nearly all root slots are populated
    /// almost immediately in a new address space's life, committing them up
    /// front batches that cost into the single reload the caller performs
    /// after creation. When the kernel intermediate directories are shared
    /// only the user slots need preallocating; otherwise all of them do.
    pub const fn eager_slots(self) -> usize {
        if self.levels == 3 {
            if self.shared_kernel_mid {
                self.kernel_boundary
            } else {
                self.root_entries
            }
        } else {
            0
        }
    }

    /// Whether a registry of live top-level directories is needed to
    /// propagate kernel-mapping changes.
    ///
    /// With a shared kernel subtree a single canonical copy services every
    /// address space and nothing needs syncing.
    pub const fn needs_registry(self) -> bool {
        !self.shared_kernel_mid
    }

    /// Whether new directories copy the canonical kernel root entries at
    /// creation. The unshared three-level mode instead copies kernel
    /// sub-entries into its own preallocated intermediate directories.
    pub const fn clones_kernel_range(self) -> bool {
        self.levels != 3 || self.shared_kernel_mid
    }

    /// Whether this mode keeps per-directory kernel intermediate
    /// directories inside the eager slots.
    pub const fn has_eager_kernel_mids(self) -> bool {
        self.levels == 3 && !self.shared_kernel_mid
    }

    /// Whether releasing an intermediate directory requires a full
    /// root-register reload instead of a range flush.
    ///
    /// Three-level hardware does not guarantee that partial flushes observe
    /// top-level entry changes.
    pub const fn mid_teardown_full_reload(self) -> bool {
        self.levels == 3
    }

    /// Whether an extra upper directory level exists between the root and
    /// the intermediate directories.
    pub const fn has_upper_level(self) -> bool {
        self.levels > 3
    }

    /// The virtual extent mapped by one huge intermediate entry.
    pub const fn huge_extent(self) -> u64 {
        (ENTRY_COUNT * PAGE_SIZE) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eager_slot_counts() {
        assert_eq!(PagingMode::two_level().eager_slots(), 0);
        assert_eq!(PagingMode::three_level_shared().eager_slots(), 3);
        assert_eq!(PagingMode::three_level_unshared().eager_slots(), 4);
        assert_eq!(PagingMode::four_level().eager_slots(), 0);
    }

    #[test]
    fn registry_needed_iff_kernel_mids_unshared() {
        assert!(PagingMode::two_level().needs_registry());
        assert!(!PagingMode::three_level_shared().needs_registry());
        assert!(PagingMode::three_level_unshared().needs_registry());
        assert!(PagingMode::four_level().needs_registry());
    }

    #[test]
    fn kernel_range_cloning() {
        assert!(PagingMode::two_level().clones_kernel_range());
        assert!(PagingMode::three_level_shared().clones_kernel_range());
        assert!(!PagingMode::three_level_unshared().clones_kernel_range());
        assert!(PagingMode::four_level().clones_kernel_range());
    }

    #[test]
    #[should_panic]
    fn rejects_unsupported_depth() {
        PagingMode::new(5, ENTRY_COUNT, 256, false);
    }
}
