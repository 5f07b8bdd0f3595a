//! The pool of physical frames handed out to user processes.
//!
//! Kernel allocations never come from here, so every frame in the pool can be
//! evicted and reused by the frame table.

use super::{FrameNumber, Page};
use crate::sync::{Mutex, MutexGuard};
use alloc::{boxed::Box, vec, vec::Vec};
use bitbybit::bitfield;

#[bitfield(u8, default = 0)]
pub struct CoreMapEntry {
    #[bit(0, rw)]
    allocated: bool,
}

struct CoreMap {
    entries: Box<[CoreMapEntry]>,
    /// The next frame number to start searching for a free frame.
    position: usize,
    frames_allocated: usize,
}

pub struct UserPool {
    core_map: Mutex<CoreMap>,
    /// Backing memory, one lock per frame so that population of one frame
    /// never waits on I/O into another.
    pages: Box<[Mutex<Box<Page>>]>,
}

impl UserPool {
    pub fn new(frames: usize) -> Self {
        assert!(frames > 0, "user pool needs at least one frame");

        let pages: Vec<Mutex<Box<Page>>> = (0..frames)
            .map(|_| Mutex::new(Page::new_zeroed()))
            .collect();

        Self {
            core_map: Mutex::new(CoreMap {
                entries: vec![CoreMapEntry::DEFAULT; frames].into_boxed_slice(),
                position: 0,
                frames_allocated: 0,
            }),
            pages: pages.into_boxed_slice(),
        }
    }

    /// Takes one free frame, searching next-fit from the last allocation.
    /// Returns `None` when every frame is in use.
    pub fn alloc(&self) -> Option<FrameNumber> {
        let mut core_map = self.core_map.lock();
        let total_frames = core_map.entries.len();
        if core_map.frames_allocated == total_frames {
            return None;
        }

        let start = core_map.position;
        let index = (0..total_frames)
            .map(|i| (start + i) % total_frames)
            .find(|&i| !core_map.entries[i].allocated())?;

        core_map.entries[index] = core_map.entries[index].with_allocated(true);
        core_map.position = (index + 1) % total_frames;
        core_map.frames_allocated += 1;

        Some(FrameNumber(index))
    }

    /// Returns `frame` to the pool. The frame must currently be allocated.
    pub fn dealloc(&self, frame: FrameNumber) {
        let mut core_map = self.core_map.lock();
        let entry = core_map.entries[frame.0];
        assert!(entry.allocated(), "double free of {frame}");

        core_map.entries[frame.0] = entry.with_allocated(false);
        core_map.frames_allocated -= 1;
    }

    /// Locks and returns the contents of `frame`.
    pub fn page(&self, frame: FrameNumber) -> MutexGuard<'_, Box<Page>> {
        self.pages[frame.0].lock()
    }

    pub fn is_allocated(&self, frame: FrameNumber) -> bool {
        self.core_map.lock().entries[frame.0].allocated()
    }

    pub fn has_room(&self) -> bool {
        let core_map = self.core_map.lock();
        core_map.frames_allocated < core_map.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.pages.len()
    }

    pub fn frames_allocated(&self) -> usize {
        self.core_map.lock().frames_allocated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_until_exhausted() {
        let pool = UserPool::new(4);
        let frames: Vec<_> = (0..4).map(|_| pool.alloc().expect("room left")).collect();
        assert_eq!(
            frames,
            [FrameNumber(0), FrameNumber(1), FrameNumber(2), FrameNumber(3)]
        );
        assert!(!pool.has_room());
        assert_eq!(pool.alloc(), None);
    }

    #[test]
    fn test_next_fit_wraps_around() {
        let pool = UserPool::new(4);
        for _ in 0..4 {
            pool.alloc();
        }
        pool.dealloc(FrameNumber(1));
        pool.dealloc(FrameNumber(3));

        // Search resumes after frame 3, wrapping to frame 1 first.
        assert_eq!(pool.alloc(), Some(FrameNumber(1)));
        assert_eq!(pool.alloc(), Some(FrameNumber(3)));
        assert_eq!(pool.frames_allocated(), 4);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let pool = UserPool::new(2);
        let frame = pool.alloc().expect("room left");
        pool.dealloc(frame);
        pool.dealloc(frame);
    }

    #[test]
    fn test_page_contents_persist() {
        let pool = UserPool::new(2);
        let frame = pool.alloc().expect("room left");
        pool.page(frame)[0] = 42;
        assert_eq!(pool.page(frame)[0], 42);
        assert!(pool.is_allocated(frame));
    }
}
