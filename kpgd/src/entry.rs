//! Directory-entry values and atomic entry cells.

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use x86_64::PhysAddr;
use x86_64::structures::paging::PhysFrame;

bitflags! {
    /// Status bits of a translation entry.
    ///
    /// Only the bits the lifecycle and access-flag protocols operate on are
    /// named here; the full hardware encoding is owned by the translation
    /// format, not by this crate.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct EntryFlags: u64 {
        /// The entry maps something.
        const PRESENT         = 1 << 0;
        /// The mapping is writable.
        const WRITABLE        = 1 << 1;
        /// The mapping is accessible from userspace.
        const USER_ACCESSIBLE = 1 << 2;
        /// The hardware has read through this entry since the bit was last
        /// cleared.
        const ACCESSED        = 1 << 5;
        /// The hardware has written through this entry since the bit was
        /// last cleared.
        const DIRTY           = 1 << 6;
        /// The entry maps a huge extent directly instead of pointing at a
        /// lower-level table.
        const HUGE            = 1 << 7;
        /// The mapping survives a root-register reload.
        const GLOBAL          = 1 << 8;
        /// Software bit: a huge entry is being decomposed into a leaf
        /// table. Serializes against lock-free translation walks.
        const SPLITTING       = 1 << 9;
        /// Code execution through this entry is forbidden.
        const NO_EXECUTE      = 1 << 63;
    }
}

/// Mask of the physical-frame bits inside an entry.
const FRAME_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One translation entry value.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entry(u64);

impl Entry {
    /// The empty entry.
    pub const NONE: Entry = Entry(0);

    /// Builds an entry pointing at `frame` with `flags`.
    pub fn new(frame: PhysFrame, flags: EntryFlags) -> Self {
        Entry(frame.start_address().as_u64() | flags.bits())
    }

    /// Reinterprets a raw entry word.
    pub const fn from_raw(raw: u64) -> Self {
        Entry(raw)
    }

    /// The raw entry word.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// The physical frame number this entry points at.
    pub const fn pfn(self) -> u64 {
        (self.0 & FRAME_MASK) >> 12
    }

    /// The physical frame this entry points at.
    pub fn frame(self) -> PhysFrame {
        // Entries always carry page-aligned addresses, the mask guarantees it.
        PhysFrame::containing_address(PhysAddr::new(self.0 & FRAME_MASK))
    }

    /// The status bits of this entry.
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// Whether the entry maps anything.
    pub const fn is_present(self) -> bool {
        self.0 & EntryFlags::PRESENT.bits() != 0
    }

    /// Whether the entry maps a huge extent.
    pub const fn is_huge(self) -> bool {
        self.0 & EntryFlags::HUGE.bits() != 0
    }
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("pfn", &format_args!("{:#x}", self.pfn()))
            .field("flags", &self.flags())
            .finish()
    }
}

/// A translation entry updated with atomic operations.
///
/// Access-flag transitions race with the hardware walker and with
/// concurrent fault handlers, so every slot in a live table is an atomic
/// cell rather than a plain word.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicEntry(AtomicU64);

impl AtomicEntry {
    /// An empty entry cell.
    pub const fn zero() -> Self {
        AtomicEntry(AtomicU64::new(0))
    }

    /// Loads the current entry value.
    pub fn load(&self) -> Entry {
        Entry(self.0.load(Ordering::Acquire))
    }

    /// Stores a new entry value.
    pub fn store(&self, entry: Entry) {
        self.0.store(entry.0, Ordering::Release);
    }

    /// Atomically clears `flag`, returning whether it was set.
    pub fn test_and_clear(&self, flag: EntryFlags) -> bool {
        self.0.fetch_and(!flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }

    /// Atomically sets `flag`, returning whether it was already set.
    pub fn test_and_set(&self, flag: EntryFlags) -> bool {
        self.0.fetch_or(flag.bits(), Ordering::AcqRel) & flag.bits() != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_bits_match_hardware_encoding() {
        use x86_64::structures::paging::page_table::PageTableFlags as X86Flags;
        macro_rules! check {
            ($ours:ident, $theirs:ident) => {
                assert_eq!(
                    EntryFlags::$ours.bits(),
                    X86Flags::$theirs.bits(),
                    "flag {} does not match",
                    stringify!($ours)
                );
            };
        }
        check!(PRESENT, PRESENT);
        check!(WRITABLE, WRITABLE);
        check!(USER_ACCESSIBLE, USER_ACCESSIBLE);
        check!(ACCESSED, ACCESSED);
        check!(DIRTY, DIRTY);
        check!(HUGE, HUGE_PAGE);
        check!(GLOBAL, GLOBAL);
        check!(SPLITTING, BIT_9);
        check!(NO_EXECUTE, NO_EXECUTE);
    }

    #[test]
    fn entry_round_trips_frame_and_flags() {
        let frame =
            PhysFrame::from_start_address(PhysAddr::new(0xdead_b000)).unwrap();
        let entry = Entry::new(frame, EntryFlags::PRESENT | EntryFlags::WRITABLE);
        assert_eq!(entry.frame(), frame);
        assert_eq!(entry.pfn(), 0xdead_b000 >> 12);
        assert!(entry.is_present());
        assert!(!entry.is_huge());
        assert_eq!(entry.flags(), EntryFlags::PRESENT | EntryFlags::WRITABLE);
    }

    #[test]
    fn atomic_test_and_clear() {
        let cell = AtomicEntry::zero();
        cell.store(Entry::from_raw(
            (EntryFlags::PRESENT | EntryFlags::ACCESSED).bits(),
        ));
        assert!(cell.test_and_clear(EntryFlags::ACCESSED));
        assert!(!cell.test_and_clear(EntryFlags::ACCESSED));
        assert!(cell.load().is_present());
    }

    #[test]
    fn atomic_test_and_set() {
        let cell = AtomicEntry::zero();
        assert!(!cell.test_and_set(EntryFlags::SPLITTING));
        assert!(cell.test_and_set(EntryFlags::SPLITTING));
    }
}
