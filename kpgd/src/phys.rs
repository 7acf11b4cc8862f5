//! Physical page handles and the page-source seam.

use core::fmt;
use core::ptr::NonNull;

use thiserror::Error;
use x86_64::structures::paging::PhysFrame;

use crate::table::{DirectoryTable, TableMeta};

/// Why a directory or table allocation failed.
///
/// Both variants are recoverable by the caller; everything allocated on the
/// way to the failure has already been unwound when one of these is
/// returned. Contract violations (bad indices, inconsistent modes) panic
/// instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The physical page source (or a metadata constructor) was exhausted.
    #[error("out of physical pages")]
    OutOfMemory,
    /// The virtualization hook layer rejected the allocation.
    #[error("virtualization hook rejected the allocation")]
    HookRejected,
}

/// A handle to one table-sized physical page and its kernel-visible
/// mapping.
///
/// The handle does not free itself on drop; whoever holds it must hand it
/// back to a [`PageSource`] (directly, or through a reclaim batch). Leaf
/// tables additionally carry attached metadata which must be detached
/// before release.
pub struct TablePage {
    table: NonNull<DirectoryTable>,
    frame: PhysFrame,
    pub(crate) meta: Option<NonNull<TableMeta>>,
}

// SAFETY: the handle is a (pointer, frame) pair; the pointed-to table is
// only ever mutated through atomic entry cells.
unsafe impl Send for TablePage {}

impl TablePage {
    /// Wraps a mapped, zero-filled, page-aligned table page.
    ///
    /// # Safety
    /// `table` must point to a live, page-sized, page-aligned allocation
    /// that stays mapped until the handle is released, and `frame` must be
    /// the physical frame backing it.
    pub unsafe fn new(table: NonNull<DirectoryTable>, frame: PhysFrame) -> Self {
        Self {
            table,
            frame,
            meta: None,
        }
    }

    /// The table stored in this page.
    pub fn table(&self) -> &DirectoryTable {
        // SAFETY: the pointer is valid for the lifetime of the handle per
        // the `new` contract.
        unsafe { self.table.as_ref() }
    }

    pub(crate) fn table_ptr(&self) -> NonNull<DirectoryTable> {
        self.table
    }

    /// The physical frame backing this page.
    pub fn frame(&self) -> PhysFrame {
        self.frame
    }

    /// The physical frame number backing this page.
    pub fn pfn(&self) -> u64 {
        self.frame.start_address().as_u64() >> 12
    }

    /// The per-table metadata, if any is attached.
    pub fn meta(&self) -> Option<&TableMeta> {
        // SAFETY: the metadata allocation lives until `detach_meta`.
        self.meta.map(|meta| unsafe { &*meta.as_ptr() })
    }
}

impl fmt::Debug for TablePage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TablePage")
            .field("pfn", &format_args!("{:#x}", self.pfn()))
            .field("meta", &self.meta.is_some())
            .finish()
    }
}

/// Supplier of zero-filled table pages.
///
/// Acquisition may block (e.g. on reclaim) but must either produce a page
/// or fail; this crate never retries. Released pages may be reused for any
/// purpose immediately, which is why table teardown goes through a
/// [`ReclaimBatch`](crate::reclaim::ReclaimBatch) first.
pub trait PageSource {
    /// Acquires one zero-filled page.
    fn acquire_zeroed(&mut self) -> Result<TablePage, AllocError>;

    /// Returns a page. Any attached metadata must already be detached.
    fn release(&mut self, page: TablePage);
}
