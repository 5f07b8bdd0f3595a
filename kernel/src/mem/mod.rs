//! User memory: physical frames, the supplemental page table and the page
//! fault handler that ties them together.

pub mod frame_allocator;
pub mod frame_table;
pub mod page_fault;
pub mod supplemental;
pub mod user;

use alloc::boxed::Box;
use core::{
    fmt,
    ops::{Deref, DerefMut},
};
use kidneyos_shared::mem::{page_offset, page_round_down, PAGE_FRAME_SIZE};
use thiserror::Error;
use zerocopy::{FromBytes, FromZeroes};

/// A page-aligned user virtual address. Every key into the supplemental page
/// table and every frame owner is one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtAddr(usize);

impl VirtAddr {
    /// The page containing `addr`.
    pub const fn page_round_down(addr: usize) -> Self {
        Self(page_round_down(addr))
    }

    /// `addr` must already be page aligned.
    pub fn new(addr: usize) -> Self {
        debug_assert_eq!(page_offset(addr), 0, "{addr:#X} is not page aligned");
        Self(page_round_down(addr))
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// The page `pages` pages above this one.
    pub const fn add_pages(self, pages: usize) -> Self {
        Self(self.0 + pages * PAGE_FRAME_SIZE)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#X}", self.0)
    }
}

/// Index of a physical frame in the user pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameNumber(pub usize);

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame {}", self.0)
    }
}

/// The contents of one physical page.
#[derive(FromZeroes, FromBytes)]
#[repr(transparent)]
pub struct Page([u8; PAGE_FRAME_SIZE]);

impl Page {
    /// Allocates a zeroed page directly on the heap.
    pub fn new_zeroed() -> Box<Self> {
        Self::new_box_zeroed()
    }
}

impl Deref for Page {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Misuse of the supplemental page table. These are caller bugs rather than
/// conditions a process can trigger by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("page {0} already has a supplemental page table entry")]
    DuplicateEntry(VirtAddr),
    #[error("no supplemental page table entry for page {0}")]
    NoEntry(VirtAddr),
    #[error("page {0} is not a user address")]
    NotUserAddress(VirtAddr),
}
