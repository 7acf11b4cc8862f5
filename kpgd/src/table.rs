//! Table pages and per-table metadata.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use spin::Mutex;

use crate::arch::{ENTRY_COUNT, PAGE_SIZE};
use crate::entry::AtomicEntry;
use crate::phys::{AllocError, PageSource, TablePage};

/// One page-sized array of translation entries.
///
/// Every table in the hierarchy (leaf table, intermediate directory,
/// top-level directory) has this in-memory shape; how many of its entries
/// are valid depends on the level and the
/// [`PagingMode`](crate::arch::PagingMode).
#[repr(C, align(4096))]
pub struct DirectoryTable {
    entries: [AtomicEntry; ENTRY_COUNT],
}

const _: () = assert!(core::mem::size_of::<DirectoryTable>() == PAGE_SIZE);

impl DirectoryTable {
    /// The entry cell at `index`. Panics if `index` is beyond the table;
    /// callers are expected to stay inside the valid range for their level.
    pub fn entry(&self, index: usize) -> &AtomicEntry {
        &self.entries[index]
    }

    /// Copies all entries of `src` into this table.
    pub fn copy_from(&self, src: &DirectoryTable) {
        for i in 0..ENTRY_COUNT {
            self.entries[i].store(src.entries[i].load());
        }
    }
}

impl fmt::Debug for DirectoryTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present = (0..ENTRY_COUNT)
            .filter(|&i| self.entries[i].load().is_present())
            .count();
        f.debug_struct("DirectoryTable")
            .field("present_entries", &present)
            .finish()
    }
}

/// Metadata attached to a table page for the lifetime of the table.
///
/// Carries the per-table lock the mapping layer takes for concurrent leaf
/// access. Attached by the table constructor, detached by the destructor;
/// its allocation can fail, which surfaces as [`AllocError::OutOfMemory`]
/// from whatever operation requested the table.
#[derive(Debug, Default)]
pub struct TableMeta {
    lock: Mutex<()>,
}

impl TableMeta {
    /// The per-table lock guarding concurrent leaf-entry mutation.
    pub fn lock(&self) -> &Mutex<()> {
        &self.lock
    }
}

/// Attaches freshly constructed metadata to `page`.
pub(crate) fn attach_meta(page: &mut TablePage) -> Result<(), AllocError> {
    debug_assert!(page.meta.is_none(), "metadata already attached");
    let layout = Layout::new::<TableMeta>();
    // SAFETY: TableMeta has a non-zero size.
    let raw = unsafe { alloc::alloc::alloc(layout) }.cast::<TableMeta>();
    let Some(ptr) = NonNull::new(raw) else {
        return Err(AllocError::OutOfMemory);
    };
    // SAFETY: `ptr` is a valid uninitialized TableMeta allocation.
    unsafe { ptr.as_ptr().write(TableMeta::default()) };
    page.meta = Some(ptr);
    Ok(())
}

/// Detaches and destroys the metadata attached to `page`, if any.
pub(crate) fn detach_meta(page: &mut TablePage) {
    if let Some(ptr) = page.meta.take() {
        // SAFETY: `ptr` came from `attach_meta` and has not been freed.
        unsafe {
            ptr.as_ptr().drop_in_place();
            alloc::alloc::dealloc(ptr.as_ptr().cast(), Layout::new::<TableMeta>());
        }
    }
}

/// Allocates one leaf table for user mappings, with metadata attached.
pub fn alloc_leaf_table<S: PageSource>(source: &mut S) -> Result<TablePage, AllocError> {
    let mut page = source.acquire_zeroed()?;
    if let Err(err) = attach_meta(&mut page) {
        source.release(page);
        return Err(err);
    }
    Ok(page)
}

/// Allocates one leaf table for kernel mappings.
///
/// Kernel leaf tables are covered by coarser locking and carry no
/// per-table metadata.
pub fn alloc_leaf_table_kernel<S: PageSource>(
    source: &mut S,
) -> Result<TablePage, AllocError> {
    source.acquire_zeroed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::HostPageSource;

    #[test]
    fn leaf_table_carries_metadata() {
        let mut source = HostPageSource::new();
        let mut page = alloc_leaf_table(&mut source).unwrap();
        assert!(page.meta().is_some());
        assert!(page.meta().unwrap().lock().try_lock().is_some());
        detach_meta(&mut page);
        source.release(page);
        assert_eq!(source.outstanding(), 0);
    }

    #[test]
    fn kernel_leaf_table_has_no_metadata() {
        let mut source = HostPageSource::new();
        let page = alloc_leaf_table_kernel(&mut source).unwrap();
        assert!(page.meta().is_none());
        source.release(page);
        assert_eq!(source.outstanding(), 0);
    }

    #[test]
    fn leaf_alloc_failure_leaves_nothing_outstanding() {
        let mut source = HostPageSource::new();
        source.fail_after(0);
        assert!(matches!(
            alloc_leaf_table(&mut source),
            Err(AllocError::OutOfMemory)
        ));
        assert_eq!(source.outstanding(), 0);
    }

    #[test]
    fn copy_from_replicates_entries() {
        let mut source = HostPageSource::new();
        let a = source.acquire_zeroed().unwrap();
        let b = source.acquire_zeroed().unwrap();
        a.table()
            .entry(7)
            .store(crate::entry::Entry::from_raw(0x1000 | 1));
        b.table().copy_from(a.table());
        assert_eq!(b.table().entry(7).load(), a.table().entry(7).load());
        source.release(a);
        source.release(b);
    }
}
