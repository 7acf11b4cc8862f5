//! The canonical kernel translation tree.

use arrayvec::ArrayVec;
use log::debug;

use crate::arch::{ENTRY_COUNT, MAX_EAGER_SLOTS, PagingMode};
use crate::entry::{Entry, EntryFlags};
use crate::phys::{AllocError, PageSource, TablePage};
use crate::table::DirectoryTable;

/// The canonical kernel-region mapping every address space derives from.
///
/// Holds the master top-level directory and, for three-level modes, the
/// canonical kernel intermediate directories. Depending on the mode, new
/// directories either copy the kernel root entries from here (sharing or
/// not sharing the subtree beneath them) or copy whole canonical
/// intermediate directories into their own preallocated slots.
///
/// Mutation of kernel entries must go through
/// [`DirectoryManager`](crate::manager::DirectoryManager) so the change is
/// propagated to registered directories under the registry lock.
pub struct KernelTemplate {
    mode: PagingMode,
    root: TablePage,
    /// Canonical kernel mids, parallel to root indices
    /// `kernel_boundary..root_entries`; empty outside three-level modes.
    mids: ArrayVec<TablePage, MAX_EAGER_SLOTS>,
}

// SAFETY: all table contents are atomic entry cells; the page handles
// themselves are never aliased mutably.
unsafe impl Send for KernelTemplate {}
// SAFETY: as above; `&self` methods only perform atomic entry access.
unsafe impl Sync for KernelTemplate {}

impl KernelTemplate {
    /// Builds an empty canonical tree for `mode`.
    ///
    /// Three-level modes also allocate the canonical kernel intermediate
    /// directories and link them into the kernel root slots. On failure
    /// everything allocated so far is returned to `source`.
    pub fn new<S: PageSource>(mode: PagingMode, source: &mut S) -> Result<Self, AllocError> {
        let root = source.acquire_zeroed()?;
        let mut mids: ArrayVec<TablePage, MAX_EAGER_SLOTS> = ArrayVec::new();
        if mode.levels() == 3 {
            for index in mode.kernel_boundary()..mode.root_entries() {
                let mid = match source.acquire_zeroed() {
                    Ok(mid) => mid,
                    Err(err) => {
                        for page in mids {
                            source.release(page);
                        }
                        source.release(root);
                        return Err(err);
                    }
                };
                root.table()
                    .entry(index)
                    .store(Entry::new(mid.frame(), EntryFlags::PRESENT));
                mids.push(mid);
            }
        }
        debug!(
            "canonical kernel tree ready: root pfn {:#x}, {} kernel mids",
            root.pfn(),
            mids.len()
        );
        Ok(Self { mode, root, mids })
    }

    /// The mode this template was built for.
    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// The canonical top-level directory.
    pub fn root(&self) -> &DirectoryTable {
        self.root.table()
    }

    /// The canonical kernel intermediate directory linked at root slot
    /// `index`, if this mode keeps one there.
    pub fn kernel_mid(&self, index: usize) -> Option<&DirectoryTable> {
        if self.mode.levels() != 3 || index < self.mode.kernel_boundary() {
            return None;
        }
        self.mids
            .get(index - self.mode.kernel_boundary())
            .map(TablePage::table)
    }

    /// Sets a canonical kernel root entry. Panics outside the kernel
    /// region, and in three-level modes, where kernel root entries
    /// permanently point at the canonical intermediate directories.
    pub(crate) fn set_kernel_entry(&self, index: usize, entry: Entry) {
        assert!(self.mode.levels() != 3, "three-level kernel root entries are fixed");
        assert!(
            index >= self.mode.kernel_boundary() && index < self.mode.root_entries(),
            "index {index} outside the kernel region"
        );
        self.root.table().entry(index).store(entry);
    }

    /// Sets one entry of a canonical kernel intermediate directory.
    pub(crate) fn set_kernel_mid_entry(&self, root_index: usize, entry_index: usize, entry: Entry) {
        let mid = self
            .kernel_mid(root_index)
            .expect("no canonical kernel mid at this root slot");
        assert!(entry_index < ENTRY_COUNT);
        mid.entry(entry_index).store(entry);
    }

    /// Copies the canonical kernel root entries into `dst`.
    pub fn clone_kernel_range(&self, dst: &DirectoryTable) {
        for index in self.mode.kernel_boundary()..self.mode.root_entries() {
            dst.entry(index).store(self.root.table().entry(index).load());
        }
    }

    /// Tears the canonical tree down, returning its pages.
    ///
    /// Only valid once no derived directory is live; directories that
    /// cloned the kernel range still reference the canonical mids.
    pub fn release<S: PageSource>(self, source: &mut S) {
        for page in self.mids {
            source.release(page);
        }
        source.release(self.root);
    }
}

impl core::fmt::Debug for KernelTemplate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("KernelTemplate")
            .field("mode", &self.mode)
            .field("root_pfn", &format_args!("{:#x}", self.root.pfn()))
            .field("kernel_mids", &self.mids.len())
            .finish()
    }
}
