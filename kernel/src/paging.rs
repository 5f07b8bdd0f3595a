//! The slice of a process's page directory that demand paging needs.
//!
//! The paging core never walks hardware page tables itself. It goes through
//! [`AddressSpace`], which the thread system implements on top of the real x86
//! page directory. [`PageDirectory`] is a software implementation that keeps the
//! same per-page bits in a map, used when no MMU is involved.

use crate::mem::{FrameNumber, VirtAddr};
use crate::sync::Mutex;
use alloc::collections::BTreeMap;
use arbitrary_int::u20;
use kidneyos_shared::{mem::is_user_vaddr, paging::PageTableEntry};

pub trait AddressSpace: Send + Sync {
    /// Maps `vaddr` to `frame`. Returns `false` if `vaddr` is already mapped or
    /// the page table needed for it could not be allocated.
    fn install_mapping(&self, vaddr: VirtAddr, frame: FrameNumber, writable: bool) -> bool;

    /// Marks `vaddr` not present. The accessed and dirty bits are left as they
    /// were, so they can still be read after the mapping is gone.
    fn clear_mapping(&self, vaddr: VirtAddr);

    /// The frame `vaddr` is currently mapped to, if present.
    fn translate(&self, vaddr: VirtAddr) -> Option<FrameNumber>;

    fn is_writable(&self, vaddr: VirtAddr) -> bool;

    fn is_dirty(&self, vaddr: VirtAddr) -> bool;
    fn set_dirty(&self, vaddr: VirtAddr, dirty: bool);

    fn is_accessed(&self, vaddr: VirtAddr) -> bool;
    fn set_accessed(&self, vaddr: VirtAddr, accessed: bool);
}

/// A page directory kept entirely in software, keyed by virtual page number.
#[derive(Default)]
pub struct PageDirectory {
    entries: Mutex<BTreeMap<usize, PageTableEntry>>,
    /// Maximum number of pages that can be mapped at once, standing in for
    /// running out of memory for page tables.
    limit: Option<usize>,
}

impl PageDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            entries: Mutex::default(),
            limit: Some(limit),
        }
    }

    fn page_number(vaddr: VirtAddr) -> usize {
        vaddr.as_usize() / kidneyos_shared::mem::PAGE_FRAME_SIZE
    }

    fn entry(&self, vaddr: VirtAddr) -> PageTableEntry {
        self.entries
            .lock()
            .get(&Self::page_number(vaddr))
            .copied()
            .unwrap_or(PageTableEntry::DEFAULT)
    }

    fn update(&self, vaddr: VirtAddr, f: impl FnOnce(PageTableEntry) -> PageTableEntry) {
        if let Some(pte) = self.entries.lock().get_mut(&Self::page_number(vaddr)) {
            *pte = f(*pte);
        }
    }

    /// Performs a user-mode access to `vaddr` the way the MMU would: the access
    /// succeeds only if the page is present (and writable, for a write), and
    /// sets the accessed bit, plus the dirty bit on a write.
    ///
    /// Returns `false` where the hardware would raise a page fault.
    pub fn access(&self, vaddr: VirtAddr, write: bool) -> bool {
        let mut entries = self.entries.lock();
        let Some(pte) = entries.get_mut(&Self::page_number(vaddr)) else {
            return false;
        };
        if !pte.present() || (write && !pte.read_write()) {
            return false;
        }
        *pte = pte.with_accessed(true).with_dirty(pte.dirty() || write);
        true
    }

    /// Number of pages currently present.
    pub fn mapped_pages(&self) -> usize {
        self.entries.lock().values().filter(|pte| pte.present()).count()
    }
}

impl AddressSpace for PageDirectory {
    fn install_mapping(&self, vaddr: VirtAddr, frame: FrameNumber, writable: bool) -> bool {
        debug_assert!(is_user_vaddr(vaddr.as_usize()));

        let Ok(frame_address) = u32::try_from(frame.0) else {
            return false;
        };
        if frame_address >= 1 << 20 {
            return false;
        }

        let mut entries = self.entries.lock();
        let page_number = Self::page_number(vaddr);
        if entries.get(&page_number).is_some_and(|pte| pte.present()) {
            return false;
        }
        if let Some(limit) = self.limit {
            if entries.values().filter(|pte| pte.present()).count() >= limit {
                return false;
            }
        }

        let pte = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(writable)
            .with_user_supervisor(true)
            .with_page_frame_address(u20::new(frame_address));
        entries.insert(page_number, pte);
        true
    }

    fn clear_mapping(&self, vaddr: VirtAddr) {
        self.update(vaddr, |pte| pte.with_present(false));
    }

    fn translate(&self, vaddr: VirtAddr) -> Option<FrameNumber> {
        let pte = self.entry(vaddr);
        pte.present()
            .then(|| FrameNumber(pte.page_frame_address().value() as usize))
    }

    fn is_writable(&self, vaddr: VirtAddr) -> bool {
        let pte = self.entry(vaddr);
        pte.present() && pte.read_write()
    }

    fn is_dirty(&self, vaddr: VirtAddr) -> bool {
        self.entry(vaddr).dirty()
    }

    fn set_dirty(&self, vaddr: VirtAddr, dirty: bool) {
        self.update(vaddr, |pte| pte.with_dirty(dirty));
    }

    fn is_accessed(&self, vaddr: VirtAddr) -> bool {
        self.entry(vaddr).accessed()
    }

    fn set_accessed(&self, vaddr: VirtAddr, accessed: bool) {
        self.update(vaddr, |pte| pte.with_accessed(accessed));
    }
}
