//! kpgd - per-address-space page-directory lifecycle management.
//!
//! Covers allocation, eager preallocation, population and teardown of
//! hierarchical translation directories for 2-, 3- and 4-level paging
//! modes, synchronization of kernel-region entries across every live
//! directory, deferred reclaim of translation-table pages, the hardened
//! user-region directory mirrors, and the accessed/dirty update protocol
//! with its minimal-flush policy.
//!
//! The physical page allocator, the translation-cache flush primitives and
//! the platform virtualization layer are consumed through the narrow
//! seams in [`phys`], [`tlb`] and [`hooks`]; hosts (including the test
//! suite) can supply their own.
#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod access;
pub mod arch;
pub mod entry;
pub mod hooks;
pub mod kernel;
pub mod manager;
pub mod phys;
mod prealloc;
pub mod reclaim;
pub mod registry;
pub mod shadow;
pub mod table;
pub mod tlb;

pub use arch::PagingMode;
pub use entry::{AtomicEntry, Entry, EntryFlags};
pub use kernel::KernelTemplate;
pub use manager::{DirectoryManager, TopLevelDirectory};
pub use phys::{AllocError, PageSource, TablePage};
pub use reclaim::ReclaimBatch;
pub use registry::DirectoryRegistry;

/// Identifies one address space to the registry and the flush layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct AddressSpaceId(pub u64);

#[cfg(test)]
pub(crate) mod test_util {
    //! Host-side stand-ins for the external collaborators.

    use core::alloc::Layout;
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use x86_64::PhysAddr;
    use x86_64::structures::paging::PhysFrame;

    use crate::AddressSpaceId;
    use crate::arch::PAGE_SIZE;
    use crate::hooks::{Level, VirtHooks};
    use crate::phys::{AllocError, PageSource, TablePage};
    use crate::tlb::TlbFlush;

    const PAGE_LAYOUT: Layout =
        match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => unreachable!(),
        };

    /// Page source backed by the host allocator.
    ///
    /// Hands out real 4 KiB-aligned zeroed allocations and treats their
    /// addresses as physical frames, so directory walks in tests touch
    /// genuine memory. Tracks the outstanding-page count the round-trip
    /// properties assert on, and can inject allocation failure after a
    /// chosen number of successes.
    pub(crate) struct HostPageSource {
        live: Vec<usize>,
        outstanding: usize,
        fail_after: Option<usize>,
    }

    impl HostPageSource {
        pub(crate) fn new() -> Self {
            Self {
                live: Vec::new(),
                outstanding: 0,
                fail_after: None,
            }
        }

        /// Makes the source fail with `OutOfMemory` after `successes` more
        /// acquisitions.
        pub(crate) fn fail_after(&mut self, successes: usize) {
            self.fail_after = Some(successes);
        }

        /// Pages acquired and not yet released.
        pub(crate) fn outstanding(&self) -> usize {
            self.outstanding
        }
    }

    impl PageSource for HostPageSource {
        fn acquire_zeroed(&mut self) -> Result<TablePage, AllocError> {
            if let Some(remaining) = self.fail_after {
                if remaining == 0 {
                    return Err(AllocError::OutOfMemory);
                }
                self.fail_after = Some(remaining - 1);
            }
            // SAFETY: PAGE_LAYOUT has non-zero size.
            let raw = unsafe { std::alloc::alloc_zeroed(PAGE_LAYOUT) };
            let Some(ptr) = NonNull::new(raw.cast()) else {
                return Err(AllocError::OutOfMemory);
            };
            let frame =
                PhysFrame::from_start_address(PhysAddr::new(raw as u64)).unwrap();
            self.live.push(raw as usize);
            self.outstanding += 1;
            // SAFETY: freshly allocated, zeroed, page-aligned, and kept
            // mapped until `release`.
            Ok(unsafe { TablePage::new(ptr, frame) })
        }

        fn release(&mut self, page: TablePage) {
            assert!(
                page.meta().is_none(),
                "page released with metadata still attached"
            );
            let addr = (page.pfn() << 12) as usize;
            let index = self
                .live
                .iter()
                .position(|&live| live == addr)
                .expect("released a page this source does not own");
            self.live.swap_remove(index);
            self.outstanding -= 1;
            // SAFETY: `addr` came from `alloc_zeroed` with PAGE_LAYOUT and
            // has not been freed yet.
            unsafe { std::alloc::dealloc(addr as *mut u8, PAGE_LAYOUT) };
        }
    }

    impl Drop for HostPageSource {
        fn drop(&mut self) {
            // Tests that panic on purpose may strand handles; free the
            // backing memory so the leak checker stays quiet.
            for &addr in &self.live {
                // SAFETY: as in `release`.
                unsafe { std::alloc::dealloc(addr as *mut u8, PAGE_LAYOUT) };
            }
        }
    }

    /// Flush layer that counts what was asked of it.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingFlush {
        full: AtomicUsize,
        range: AtomicUsize,
        current: AtomicUsize,
    }

    impl RecordingFlush {
        pub(crate) fn full_flushes(&self) -> usize {
            self.full.load(Ordering::SeqCst)
        }

        pub(crate) fn range_flushes(&self) -> usize {
            self.range.load(Ordering::SeqCst)
        }
    }

    impl TlbFlush for RecordingFlush {
        fn flush_address_space(&self, _asid: AddressSpaceId) {
            self.full.fetch_add(1, Ordering::SeqCst);
        }

        fn flush_range(&self, _asid: AddressSpaceId, start: u64, end: u64) {
            assert!(start < end, "empty flush range");
            self.range.fetch_add(1, Ordering::SeqCst);
        }

        fn flush_current(&self) {
            self.current.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Hook layer that rejects the Nth notification.
    #[derive(Debug)]
    pub(crate) struct RejectingHooks {
        accepted: AtomicUsize,
        reject_at: usize,
    }

    impl RejectingHooks {
        /// Accepts `accepted` notifications, then rejects one.
        pub(crate) fn after(accepted: usize) -> Self {
            Self {
                accepted: AtomicUsize::new(0),
                reject_at: accepted,
            }
        }
    }

    impl VirtHooks for RejectingHooks {
        fn notify_alloc(&self, _level: Level, _pfn: u64) -> Result<(), AllocError> {
            if self.accepted.fetch_add(1, Ordering::SeqCst) == self.reject_at {
                Err(AllocError::HookRejected)
            } else {
                Ok(())
            }
        }

        fn notify_release(&self, _level: Level, _pfn: u64) {}
    }
}
