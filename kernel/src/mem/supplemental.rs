//! The supplemental page table: for every user page a process may touch, where
//! its contents come from and where they are now.

use super::{FrameNumber, VirtAddr, VmError};
use crate::{fs::FileRef, swapping::SwapSlot};
use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;
use kidneyos_shared::mem::{is_user_vaddr, PAGE_FRAME_SIZE};

/// The part of a file a page is loaded from. `read_bytes` bytes are read at
/// `offset` and the remaining `zero_bytes` of the page are zeroed.
#[derive(Clone)]
pub struct FileBacking {
    pub file: FileRef,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
}

impl fmt::Debug for FileBacking {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FileBacking")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Backing {
    File(FileBacking),
    Zero,
    /// Has been evicted to swap at least once. `slot` is `None` while the
    /// page is resident, since reading a slot back frees it.
    Swap { slot: Option<SwapSlot> },
    MemoryMapped,
}

#[derive(Debug, Clone)]
pub struct PageEntry {
    pub writable: bool,
    pub frame: Option<FrameNumber>,
    /// Set once the page has been populated for the first time.
    pub loaded: bool,
    pub backing: Backing,
}

impl PageEntry {
    pub fn new(backing: Backing, writable: bool) -> Self {
        Self {
            writable,
            frame: None,
            loaded: false,
            backing,
        }
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    /// Whether the only copy of the page is in swap.
    pub fn is_swapped(&self) -> bool {
        self.swap_slot().is_some()
    }

    pub fn swap_slot(&self) -> Option<SwapSlot> {
        match self.backing {
            Backing::Swap { slot } => slot,
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SupplementalPageTable(BTreeMap<VirtAddr, PageEntry>);

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_entry(&mut self, vaddr: VirtAddr, entry: PageEntry) -> Result<(), VmError> {
        if !is_user_vaddr(vaddr.as_usize()) {
            return Err(VmError::NotUserAddress(vaddr));
        }
        debug_assert!(
            !self.0.contains_key(&vaddr),
            "duplicate supplemental page table entry for {vaddr}"
        );
        if self.0.contains_key(&vaddr) {
            return Err(VmError::DuplicateEntry(vaddr));
        }
        self.0.insert(vaddr, entry);
        Ok(())
    }

    /// Reserves a page loaded from `file`. `read_bytes + zero_bytes` must be
    /// exactly one page.
    pub fn insert_file(
        &mut self,
        vaddr: VirtAddr,
        file: FileRef,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        assert_eq!(read_bytes + zero_bytes, PAGE_FRAME_SIZE);
        let backing = Backing::File(FileBacking {
            file,
            offset,
            read_bytes,
            zero_bytes,
        });
        self.create_entry(vaddr, PageEntry::new(backing, writable))
    }

    pub fn insert_zero(&mut self, vaddr: VirtAddr, writable: bool) -> Result<(), VmError> {
        self.create_entry(vaddr, PageEntry::new(Backing::Zero, writable))
    }

    pub fn insert_mmap(&mut self, vaddr: VirtAddr, writable: bool) -> Result<(), VmError> {
        self.create_entry(vaddr, PageEntry::new(Backing::MemoryMapped, writable))
    }

    /// Reserves the pages of a loadable segment starting at `vaddr`: the first
    /// `read_bytes` bytes come from `file` at `offset`, the following
    /// `zero_bytes` are zero. Pages with no file contents become zero-fill.
    ///
    /// Either every page is reserved or none is.
    pub fn insert_segment(
        &mut self,
        vaddr: VirtAddr,
        file: &FileRef,
        offset: u64,
        read_bytes: usize,
        zero_bytes: usize,
        writable: bool,
    ) -> Result<(), VmError> {
        assert_eq!((read_bytes + zero_bytes) % PAGE_FRAME_SIZE, 0);
        let pages = (read_bytes + zero_bytes) / PAGE_FRAME_SIZE;

        let mut addrs = Vec::new();
        for i in 0..pages {
            let page = i
                .checked_mul(PAGE_FRAME_SIZE)
                .and_then(|bytes| vaddr.as_usize().checked_add(bytes))
                .map(VirtAddr::page_round_down)
                .ok_or(VmError::NotUserAddress(vaddr))?;
            if !is_user_vaddr(page.as_usize()) {
                return Err(VmError::NotUserAddress(page));
            }
            if self.0.contains_key(&page) {
                return Err(VmError::DuplicateEntry(page));
            }
            addrs.push(page);
        }

        let mut remaining = read_bytes;
        for (i, page) in addrs.into_iter().enumerate() {
            let page_read = remaining.min(PAGE_FRAME_SIZE);
            if page_read == 0 {
                self.insert_zero(page, writable)?;
            } else {
                let page_offset = offset + (i * PAGE_FRAME_SIZE) as u64;
                self.insert_file(
                    page,
                    file.clone(),
                    page_offset,
                    page_read,
                    PAGE_FRAME_SIZE - page_read,
                    writable,
                )?;
            }
            remaining -= page_read;
        }
        Ok(())
    }

    pub fn lookup(&self, vaddr: VirtAddr) -> Option<&PageEntry> {
        self.0.get(&vaddr)
    }

    pub fn lookup_mut(&mut self, vaddr: VirtAddr) -> Option<&mut PageEntry> {
        self.0.get_mut(&vaddr)
    }

    /// Records that `vaddr` is resident in `frame` and has been loaded.
    pub fn bind_frame(&mut self, vaddr: VirtAddr, frame: FrameNumber) -> Result<(), VmError> {
        let entry = self.0.get_mut(&vaddr).ok_or(VmError::NoEntry(vaddr))?;
        entry.frame = Some(frame);
        entry.loaded = true;
        Ok(())
    }

    /// Returns the frame `vaddr` was resident in, if any.
    pub fn unbind_frame(&mut self, vaddr: VirtAddr) -> Option<FrameNumber> {
        self.0.get_mut(&vaddr)?.frame.take()
    }

    /// Removes the entry for `vaddr`. Its frame and swap slot, if any, are the
    /// caller's to release.
    pub fn destroy_entry(&mut self, vaddr: VirtAddr) -> Option<PageEntry> {
        self.0.remove(&vaddr)
    }

    /// Removes every entry, returning them so that the caller can release
    /// whatever they still hold.
    pub fn destroy_all(&mut self) -> Vec<(VirtAddr, PageEntry)> {
        core::mem::take(&mut self.0).into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VirtAddr, &PageEntry)> {
        self.0.iter()
    }
}
