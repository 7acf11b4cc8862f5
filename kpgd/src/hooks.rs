//! Virtualization hook seam.
//!
//! Platform virtualization layers track which physical frames hold
//! translation tables; they are told about every table-page allocation and
//! release. Native execution uses [`NoHooks`].

use crate::phys::AllocError;

/// The translation level a table page serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    /// Lowest-level table mapping virtual pages to frames.
    Leaf,
    /// Intermediate directory pointing at leaf tables.
    Mid,
    /// Upper directory between the root and the intermediate level; only
    /// exists in four-level modes.
    Upper,
    /// Top-level directory, the root of one address space.
    Root,
}

/// Notifications to the platform virtualization layer.
pub trait VirtHooks {
    /// A table page was allocated for `level`. A rejection unwinds the
    /// whole operation that triggered the allocation.
    fn notify_alloc(&self, level: Level, pfn: u64) -> Result<(), AllocError>;

    /// A table page is being released.
    fn notify_release(&self, level: Level, pfn: u64);
}

/// Hook layer for native execution; accepts everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl VirtHooks for NoHooks {
    fn notify_alloc(&self, _level: Level, _pfn: u64) -> Result<(), AllocError> {
        Ok(())
    }

    fn notify_release(&self, _level: Level, _pfn: u64) {}
}
