//! Top-level directory lifecycle and kernel-mapping propagation.

use core::ops::Range;

use arrayvec::ArrayVec;
use log::debug;

use crate::AddressSpaceId;
use crate::arch::{MAX_EAGER_SLOTS, PagingMode};
use crate::entry::Entry;
use crate::hooks::{Level, VirtHooks};
use crate::kernel::KernelTemplate;
use crate::phys::{AllocError, PageSource, TablePage};
use crate::prealloc;
use crate::registry::{DirectoryRegistry, RegisteredDirectory, RegistryMap};
use crate::table::{DirectoryTable, detach_meta};

/// The root of one address space's translation tree.
///
/// Exclusively owned by its address space; created by
/// [`DirectoryManager::allocate`] and destroyed by
/// [`DirectoryManager::free`]. Holds the handles of its eager intermediate
/// directories so teardown can reclaim slots the mapping layer never
/// touched.
pub struct TopLevelDirectory {
    page: TablePage,
    asid: AddressSpaceId,
    eager: ArrayVec<Option<TablePage>, MAX_EAGER_SLOTS>,
}

// SAFETY: table contents are atomic entry cells and the eager handles are
// only touched by the exclusive owner.
unsafe impl Send for TopLevelDirectory {}

impl TopLevelDirectory {
    /// The directory's entry array.
    pub fn table(&self) -> &DirectoryTable {
        self.page.table()
    }

    /// The physical frame to load into the translation-root register.
    pub fn frame(&self) -> x86_64::structures::paging::PhysFrame {
        self.page.frame()
    }

    /// The physical frame number of the directory page.
    pub fn pfn(&self) -> u64 {
        self.page.pfn()
    }

    /// The owning address space.
    pub fn asid(&self) -> AddressSpaceId {
        self.asid
    }

    /// The number of eager intermediate-directory slots.
    pub fn eager_slots(&self) -> usize {
        self.eager.len()
    }

    /// Takes ownership of an eager slot's table, for teardown paths that
    /// unmap the slot before the directory dies. The caller becomes
    /// responsible for clearing the root entry and deferring the release.
    pub fn take_eager_slot(&mut self, index: usize) -> Option<TablePage> {
        self.eager.get_mut(index).and_then(Option::take)
    }
}

impl core::fmt::Debug for TopLevelDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TopLevelDirectory")
            .field("pfn", &format_args!("{:#x}", self.pfn()))
            .field("asid", &self.asid)
            .field("eager_slots", &self.eager.len())
            .finish()
    }
}

/// Allocates and frees top-level directories for address spaces and keeps
/// every live directory's kernel region in sync with the canonical
/// mapping.
///
/// One manager exists per system configuration; it owns the canonical
/// kernel template and the directory registry (the registry is supplied at
/// construction rather than reached through a global).
#[derive(Debug)]
pub struct DirectoryManager<H: VirtHooks> {
    mode: PagingMode,
    kernel: KernelTemplate,
    registry: DirectoryRegistry,
    hooks: H,
}

impl<H: VirtHooks> DirectoryManager<H> {
    /// Builds a manager around an existing canonical kernel template.
    pub fn new(kernel: KernelTemplate, registry: DirectoryRegistry, hooks: H) -> Self {
        Self {
            mode: kernel.mode(),
            kernel,
            registry,
            hooks,
        }
    }

    /// The configured translation-depth mode.
    pub fn mode(&self) -> PagingMode {
        self.mode
    }

    /// The canonical kernel template.
    pub fn kernel(&self) -> &KernelTemplate {
        &self.kernel
    }

    /// The directory registry.
    pub fn registry(&self) -> &DirectoryRegistry {
        &self.registry
    }

    /// Allocates a top-level directory for `asid`.
    ///
    /// All-or-nothing: on any failure every page acquired en route has been
    /// returned to `source`. The new directory becomes visible to registry
    /// walkers only with its kernel-region entries copied and its eager
    /// slots populated; the caller performs the root-register reload that
    /// makes the eager population take effect.
    pub fn allocate<S: PageSource>(
        &self,
        asid: AddressSpaceId,
        source: &mut S,
    ) -> Result<TopLevelDirectory, AllocError> {
        let root = source.acquire_zeroed()?;

        let batch = match prealloc::preallocate(self.mode, &self.hooks, source) {
            Ok(batch) => batch,
            Err(err) => {
                source.release(root);
                return Err(err);
            }
        };

        if let Err(err) = self.hooks.notify_alloc(Level::Root, root.pfn()) {
            prealloc::release(batch, &self.hooks, source);
            source.release(root);
            return Err(err);
        }

        // Construction-visibility critical section: the kernel-entry copy,
        // the registration, and the eager population are one atomic step
        // with respect to anything walking the registry.
        {
            let mut walkers = self.registry.lock();
            if self.mode.clones_kernel_range() {
                self.kernel.clone_kernel_range(root.table());
            }
            if self.mode.needs_registry() {
                let kernel_mids = batch
                    .iter()
                    .enumerate()
                    .filter(|(index, _)| *index >= self.mode.kernel_boundary())
                    .map(|(index, page)| (index, page.table_ptr()))
                    .collect();
                walkers.insert(
                    root.pfn(),
                    RegisteredDirectory::new(asid, root.table_ptr(), kernel_mids),
                );
            }
            prealloc::populate(self.mode, &self.kernel, root.table(), &batch);
        }

        debug!(
            "allocated directory pfn {:#x} for {:?} ({} eager slots)",
            root.pfn(),
            asid,
            batch.len()
        );
        Ok(TopLevelDirectory {
            page: root,
            asid,
            eager: batch.into_iter().map(Some).collect(),
        })
    }

    /// Frees `directory`, mopping up eager slots the mapping layer never
    /// released, and unregisters it.
    ///
    /// Root-entry clearing and unregistration happen under one hold of the
    /// visibility lock so no walker can reach a table that is about to be
    /// freed; the pages themselves go back to `source` after the lock is
    /// dropped.
    pub fn free<S: PageSource>(&self, mut directory: TopLevelDirectory, source: &mut S) {
        let eager = core::mem::take(&mut directory.eager);
        let reclaimed = {
            let mut walkers = self.registry.lock();
            let reclaimed = prealloc::mop_up(self.mode, directory.table(), eager);
            if self.mode.needs_registry() {
                let removed = walkers.remove(&directory.pfn());
                debug_assert!(removed.is_some(), "freeing an unregistered directory");
            }
            reclaimed
        };

        for mut page in reclaimed {
            self.hooks.notify_release(Level::Mid, page.pfn());
            detach_meta(&mut page);
            source.release(page);
        }

        self.hooks.notify_release(Level::Root, directory.pfn());
        debug!(
            "freed directory pfn {:#x} for {:?}",
            directory.pfn(),
            directory.asid
        );
        source.release(directory.page);
    }

    /// Changes a canonical kernel root entry and propagates it to every
    /// registered directory before returning. Only meaningful in modes
    /// whose directories clone the kernel root range (two- and four-level).
    pub fn update_kernel_entry(&self, index: usize, entry: Entry) {
        let walkers = self.registry.lock();
        self.kernel.set_kernel_entry(index, entry);
        self.propagate(&walkers, index..index + 1);
    }

    /// Changes one entry of a canonical kernel intermediate directory
    /// (three-level modes) and propagates it into every registered
    /// directory's corresponding intermediate directory.
    ///
    /// In the shared configuration there is nothing to propagate: every
    /// address space already walks the canonical table.
    pub fn update_kernel_mid_entry(&self, root_index: usize, entry_index: usize, entry: Entry) {
        let walkers = self.registry.lock();
        self.kernel.set_kernel_mid_entry(root_index, entry_index, entry);
        for directory in walkers.values() {
            let mid = directory
                .kernel_mid(root_index)
                .expect("registered directory missing a kernel mid slot");
            mid.entry(entry_index).store(entry);
        }
    }

    /// Re-copies the canonical kernel mapping for `range` (top-level
    /// indices) into every registered directory.
    pub fn sync_kernel_mappings(&self, range: Range<usize>) {
        assert!(range.start >= self.mode.kernel_boundary());
        assert!(range.end <= self.mode.root_entries());
        let walkers = self.registry.lock();
        self.propagate(&walkers, range);
    }

    fn propagate(&self, walkers: &RegistryMap, range: Range<usize>) {
        for directory in walkers.values() {
            for index in range.clone() {
                if self.mode.has_eager_kernel_mids() {
                    let canonical = self
                        .kernel
                        .kernel_mid(index)
                        .expect("canonical kernel mid missing");
                    let mid = directory
                        .kernel_mid(index)
                        .expect("registered directory missing a kernel mid slot");
                    mid.copy_from(canonical);
                } else {
                    directory
                        .root()
                        .entry(index)
                        .store(self.kernel.root().entry(index).load());
                }
            }
        }
    }

    /// Dismantles the manager, handing back the canonical template and the
    /// registry. Every directory must already be freed.
    pub fn into_parts(self) -> (KernelTemplate, DirectoryRegistry) {
        assert!(
            self.registry.is_empty(),
            "directories still registered at manager teardown"
        );
        (self.kernel, self.registry)
    }
}
