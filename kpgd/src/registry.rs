//! The global set of live top-level directories.

use alloc::collections::BTreeMap;
use core::ptr::NonNull;

use arrayvec::ArrayVec;
use spin::{Mutex, MutexGuard};

use crate::AddressSpaceId;
use crate::arch::MAX_EAGER_SLOTS;
use crate::table::DirectoryTable;

/// A registered directory: the back-reference from a top-level directory
/// to its owning address space, plus the per-directory kernel intermediate
/// directories that kernel-mapping propagation must rewrite.
pub(crate) struct RegisteredDirectory {
    asid: AddressSpaceId,
    root: NonNull<DirectoryTable>,
    /// `(root index, table)` pairs; only populated in modes with
    /// per-directory kernel intermediate directories.
    kernel_mids: ArrayVec<(usize, NonNull<DirectoryTable>), MAX_EAGER_SLOTS>,
}

// SAFETY: the pointers are only dereferenced while the owning registry
// lock is held, and registration is removed under that same lock before
// the tables are freed.
unsafe impl Send for RegisteredDirectory {}

impl RegisteredDirectory {
    pub(crate) fn new(
        asid: AddressSpaceId,
        root: NonNull<DirectoryTable>,
        kernel_mids: ArrayVec<(usize, NonNull<DirectoryTable>), MAX_EAGER_SLOTS>,
    ) -> Self {
        Self {
            asid,
            root,
            kernel_mids,
        }
    }

    pub(crate) fn asid(&self) -> AddressSpaceId {
        self.asid
    }

    /// The directory's root table. Only call with the registry lock held.
    pub(crate) fn root(&self) -> &DirectoryTable {
        // SAFETY: valid while the entry is registered; see the Send
        // justification above.
        unsafe { self.root.as_ref() }
    }

    /// The directory's kernel intermediate directory at `root_index`, if
    /// this directory keeps one. Only call with the registry lock held.
    pub(crate) fn kernel_mid(&self, root_index: usize) -> Option<&DirectoryTable> {
        self.kernel_mids
            .iter()
            .find(|(index, _)| *index == root_index)
            // SAFETY: as for `root`.
            .map(|(_, table)| unsafe { table.as_ref() })
    }
}

pub(crate) type RegistryMap = BTreeMap<u64, RegisteredDirectory>;

/// The synchronized set of every live top-level directory whose
/// kernel-region entries must be kept in sync with the canonical mapping.
///
/// Lock discipline: this single lock also guards directory-construction
/// visibility. Any mutation that could let a walker observe a directory
/// (registration, the kernel-entry copy into a new directory, eager slot
/// population, kernel-mapping propagation, teardown of registered state)
/// happens with this lock held, so no walker ever sees a partially
/// populated directory. Hold times must stay short; this lock serializes
/// address-space creation and destruction system-wide.
///
/// Modes with a shared kernel subtree never register anything and the
/// registry stays empty.
#[derive(Debug, Default)]
pub struct DirectoryRegistry {
    inner: Mutex<RegistryMap>,
}

impl DirectoryRegistry {
    /// Creates an empty registry.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Acquires the registry (and construction-visibility) lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, RegistryMap> {
        self.inner.lock()
    }

    /// The number of registered directories.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether no directory is registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Whether a directory rooted at `pfn` is registered, and for which
    /// address space.
    pub fn owner_of(&self, pfn: u64) -> Option<AddressSpaceId> {
        self.inner.lock().get(&pfn).map(RegisteredDirectory::asid)
    }
}

impl core::fmt::Debug for RegisteredDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RegisteredDirectory")
            .field("asid", &self.asid)
            .field("kernel_mids", &self.kernel_mids.len())
            .finish()
    }
}
