/*
 * Memory Types
 *
 * Core types used throughout the memory subsystem. Addresses are 32-bit on
 * this target; we wrap them in newtypes so physical and virtual values
 * cannot be mixed up silently.
 */

use bitflags::bitflags;

/// Size of a page and of a physical frame (4 KiB).
pub const PAGE_SIZE: u32 = 4096;

/// A physical address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

/// A virtual address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Round down to the containing page boundary.
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    pub const fn is_page_aligned(self) -> bool {
        self.0 & (PAGE_SIZE - 1) == 0
    }
}

/// Physical frame representation (4 KiB).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct PhysFrame(u32);

impl PhysFrame {
    pub const SIZE: u32 = PAGE_SIZE;

    /// Create a PhysFrame containing the given physical address.
    /// Address is rounded down to the 4 KiB boundary.
    pub const fn containing_address(addr: PhysAddr) -> Self {
        Self(addr.as_u32() & !(Self::SIZE - 1))
    }

    /// Frame holding the given frame number.
    pub const fn from_number(n: u32) -> Self {
        Self(n * Self::SIZE)
    }

    pub const fn number(self) -> u32 {
        self.0 / Self::SIZE
    }

    pub const fn start_address(self) -> PhysAddr {
        PhysAddr::new(self.0)
    }
}

bitflags! {
    /// Two-level x86 page table entry flags.
    ///
    /// Bits 9..12 are software-available; we use them for the zero-fill
    /// marker and the new_pages region boundary markers.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const PRESENT         = 1 << 0;
        const WRITABLE        = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH   = 1 << 3;
        const NO_CACHE        = 1 << 4;
        const ACCESSED        = 1 << 5;
        const DIRTY           = 1 << 6;
        const GLOBAL          = 1 << 8;
        /// Page is backed by the shared zero frame until first write.
        const ZFOD            = 1 << 9;
        /// First page of a region created by new_pages.
        const NEW_PAGES_START = 1 << 10;
        /// Last page of a region created by new_pages.
        const NEW_PAGES_END   = 1 << 11;
    }
}
