//! The frame table: which process page each user frame currently holds, and
//! eviction when the user pool runs dry.
//!
//! Records live in an arena indexed by [`FrameId`]. A record is created when
//! a frame first leaves the pool and is reused in place when its frame is
//! evicted, so its id is stable for as long as the frame is allocated.
//!
//! Two locks guard the table. The frame list lock covers the arena and the
//! policy and is never held across I/O. The eviction lock serializes
//! evictions, and is held by anything that must not observe a page halfway
//! through moving from one owner to another (see [`FrameTable::eviction_barrier`]).

use super::{
    frame_allocator::UserPool,
    supplemental::Backing,
    FrameNumber, VirtAddr,
};
use crate::{
    swapping::{
        page_replacement::{Aging, PageReplacementPolicy, VictimCandidate},
        SwapSpace,
    },
    sync::{Mutex, MutexGuard},
    threading::{Pid, ProcessRegistry},
};
use alloc::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};
use bitbybit::bitfield;
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{debug, trace};
use zerocopy::FromZeroes;

#[bitfield(u8, default = 0)]
pub struct FrameFlags {
    /// Contents are populated and mapped. Frames that are not ready are never
    /// evicted.
    #[bit(0, rw)]
    ready: bool,
}

#[bitfield(u8, default = 0)]
pub struct AllocFlags {
    /// Zero the frame before returning it.
    #[bit(0, rw)]
    zero: bool,
}

impl AllocFlags {
    pub const ZEROED: Self = Self::DEFAULT.with_zero(true);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub usize);

/// The process page a frame holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOwner {
    pub pid: Pid,
    pub vaddr: VirtAddr,
}

struct FrameRecord {
    frame: FrameNumber,
    owner: FrameOwner,
    flags: FrameFlags,
    /// Outstanding pins. A pinned frame is held in memory for I/O on a user
    /// buffer and is never evicted.
    pins: u32,
    usage: u32,
}

#[derive(Default)]
struct FrameArena {
    records: Vec<Option<FrameRecord>>,
    free_ids: Vec<FrameId>,
    by_frame: BTreeMap<FrameNumber, FrameId>,
}

impl FrameArena {
    fn insert(&mut self, record: FrameRecord) -> FrameId {
        let frame = record.frame;
        let id = match self.free_ids.pop() {
            Some(id) => {
                self.records[id.0] = Some(record);
                id
            }
            None => {
                self.records.push(Some(record));
                FrameId(self.records.len() - 1)
            }
        };
        let previous = self.by_frame.insert(frame, id);
        assert!(previous.is_none(), "{frame} tracked twice");
        id
    }

    fn remove(&mut self, frame: FrameNumber) -> Option<FrameRecord> {
        let id = self.by_frame.remove(&frame)?;
        self.free_ids.push(id);
        self.records[id.0].take()
    }

    fn get(&self, frame: FrameNumber) -> Option<&FrameRecord> {
        let id = self.by_frame.get(&frame)?;
        self.records[id.0].as_ref()
    }

    fn get_mut(&mut self, frame: FrameNumber) -> Option<&mut FrameRecord> {
        let id = self.by_frame.get(&frame)?;
        self.records[id.0].as_mut()
    }

    fn by_id_mut(&mut self, id: FrameId) -> Option<&mut FrameRecord> {
        self.records.get_mut(id.0)?.as_mut()
    }

    fn iter(&self) -> impl Iterator<Item = (FrameId, &FrameRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, record)| Some((FrameId(i), record.as_ref()?)))
    }

    fn len(&self) -> usize {
        self.by_frame.len()
    }

    fn is_empty(&self) -> bool {
        self.by_frame.is_empty()
    }
}

struct FrameList {
    arena: FrameArena,
    policy: Box<dyn PageReplacementPolicy>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameTableStats {
    pub frames_in_use: usize,
    pub capacity: usize,
    pub evictions: usize,
    pub swap_outs: usize,
    /// Evicted clean file pages, dropped without writing them anywhere.
    pub discards: usize,
}

pub struct FrameTable {
    frames: Mutex<FrameList>,
    eviction_lock: Mutex<()>,
    pool: UserPool,
    swap: Arc<SwapSpace>,
    registry: Arc<dyn ProcessRegistry>,
    evictions: AtomicUsize,
    swap_outs: AtomicUsize,
    discards: AtomicUsize,
}

impl FrameTable {
    pub fn new(
        user_frames: usize,
        swap: Arc<SwapSpace>,
        registry: Arc<dyn ProcessRegistry>,
    ) -> Self {
        Self::with_policy(user_frames, swap, registry, Box::new(Aging))
    }

    pub fn with_policy(
        user_frames: usize,
        swap: Arc<SwapSpace>,
        registry: Arc<dyn ProcessRegistry>,
        policy: Box<dyn PageReplacementPolicy>,
    ) -> Self {
        Self {
            frames: Mutex::new(FrameList {
                arena: FrameArena::default(),
                policy,
            }),
            eviction_lock: Mutex::new(()),
            pool: UserPool::new(user_frames),
            swap,
            registry,
            evictions: AtomicUsize::new(0),
            swap_outs: AtomicUsize::new(0),
            discards: AtomicUsize::new(0),
        }
    }

    /// Gets a frame for page `vaddr` of process `pid`, evicting another page
    /// if the pool is empty. The frame is not ready until [`Self::mark_ready`].
    pub fn allocate(&self, pid: Pid, vaddr: VirtAddr, flags: AllocFlags) -> FrameNumber {
        let owner = FrameOwner { pid, vaddr };
        let frame = match self.pool.alloc() {
            Some(frame) => {
                self.track(frame, owner);
                frame
            }
            None => self.evict(owner),
        };

        if flags.zero() {
            self.pool.page(frame).zero();
        }
        frame
    }

    fn track(&self, frame: FrameNumber, owner: FrameOwner) {
        self.frames.lock().arena.insert(FrameRecord {
            frame,
            owner,
            flags: FrameFlags::DEFAULT,
            pins: 0,
            usage: 0,
        });
    }

    fn evict(&self, owner: FrameOwner) -> FrameNumber {
        let _eviction = self.eviction_lock.lock();

        // A frame may have been released while we waited for the lock.
        if let Some(frame) = self.pool.alloc() {
            self.track(frame, owner);
            return frame;
        }

        let (frame, previous) = {
            let mut list = self.frames.lock();
            let FrameList { arena, policy } = &mut *list;
            assert!(!arena.is_empty(), "evicting from an empty frame table");

            let candidates: Vec<VictimCandidate> = arena
                .iter()
                .filter(|(_, record)| record.flags.ready() && record.pins == 0)
                .map(|(id, record)| VictimCandidate {
                    id,
                    usage: record.usage,
                })
                .collect();
            let Some(victim) = policy.select_victim(&candidates) else {
                panic!("no frame can be evicted: all {} frames are busy", arena.len());
            };
            let Some(record) = arena.by_id_mut(victim) else {
                panic!("replacement policy chose an unknown frame {victim:?}");
            };

            let previous = record.owner;
            record.owner = owner;
            record.flags = FrameFlags::DEFAULT;
            record.pins = 0;
            record.usage = 0;
            (record.frame, previous)
        };

        debug!(
            "evicting {frame} from pid {} page {} for pid {}",
            previous.pid, previous.vaddr, owner.pid
        );
        self.evictions.fetch_add(1, Ordering::Relaxed);
        self.write_out(frame, previous);
        frame
    }

    /// Moves the contents of `frame` out of the way of its previous owner.
    fn write_out(&self, frame: FrameNumber, previous: FrameOwner) {
        let Some(process) = self.registry.resolve(previous.pid) else {
            debug!("pid {} has exited, dropping {frame}", previous.pid);
            return;
        };

        let page_dir = process.page_dir();
        page_dir.clear_mapping(previous.vaddr);
        let dirty = page_dir.is_dirty(previous.vaddr);

        let mut spt = process.spt().lock();
        let Some(entry) = spt.lookup_mut(previous.vaddr) else {
            return;
        };
        entry.frame = None;

        let to_swap = match entry.backing {
            Backing::File(_) => dirty,
            Backing::Zero | Backing::Swap { .. } => true,
            Backing::MemoryMapped => false,
        };
        if to_swap {
            let slot = self.swap.write(previous.pid, &self.pool.page(frame));
            entry.backing = Backing::Swap { slot: Some(slot) };
            self.swap_outs.fetch_add(1, Ordering::Relaxed);
            trace!("page {} of pid {} now in {slot}", previous.vaddr, previous.pid);
        } else if matches!(entry.backing, Backing::File(_)) {
            self.discards.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Holds off evictions while the guard lives. Anything that reads a
    /// supplemental page table entry another process's eviction may be
    /// rewriting takes this first.
    pub fn eviction_barrier(&self) -> MutexGuard<'_, ()> {
        self.eviction_lock.lock()
    }

    /// One tick of the aging clock: every frame whose page was accessed since
    /// the last tick gets its usage counter bumped, and the accessed bit is
    /// cleared.
    pub fn age_tick(&self) {
        let owners: Vec<(FrameId, FrameOwner)> = self
            .frames
            .lock()
            .arena
            .iter()
            .map(|(id, record)| (id, record.owner))
            .collect();

        // Page directories are consulted without the frame list lock.
        let accessed: Vec<(FrameId, FrameOwner, bool)> = owners
            .into_iter()
            .filter_map(|(id, owner)| {
                let process = self.registry.resolve(owner.pid)?;
                let page_dir = process.page_dir();
                let accessed = page_dir.is_accessed(owner.vaddr);
                if accessed {
                    page_dir.set_accessed(owner.vaddr, false);
                }
                Some((id, owner, accessed))
            })
            .collect();

        let mut list = self.frames.lock();
        let FrameList { arena, policy } = &mut *list;
        for (id, owner, accessed) in accessed {
            // Skip frames that changed hands in the meantime.
            if let Some(record) = arena.by_id_mut(id).filter(|r| r.owner == owner) {
                record.usage = policy.age(record.usage, accessed);
            }
        }
    }

    fn update(&self, frame: FrameNumber, f: impl FnOnce(&mut FrameRecord)) {
        let mut list = self.frames.lock();
        let Some(record) = list.arena.get_mut(frame) else {
            panic!("{frame} is not in the frame table");
        };
        f(record);
    }

    pub fn mark_ready(&self, frame: FrameNumber, ready: bool) {
        self.update(frame, |record| record.flags = record.flags.with_ready(ready));
    }

    /// Pins nest: a frame pinned twice stays pinned until unpinned twice.
    pub fn set_pinned(&self, frame: FrameNumber, pinned: bool) {
        self.update(frame, |record| {
            record.pins = if pinned {
                record.pins + 1
            } else {
                record.pins.saturating_sub(1)
            };
        });
    }

    /// Forgets `frame` and returns it to the pool.
    pub fn release(&self, frame: FrameNumber) {
        let record = self.frames.lock().arena.remove(frame);
        assert!(record.is_some(), "release of untracked {frame}");
        self.pool.dealloc(frame);
    }

    /// Releases every frame owned by `pid`, unmapping each and unbinding it
    /// from the supplemental page table if the process is still around.
    /// Returns the number of frames released.
    pub fn release_all_frames(&self, pid: Pid) -> usize {
        let _eviction = self.eviction_lock.lock();

        let owned: Vec<(FrameNumber, VirtAddr)> = self
            .frames
            .lock()
            .arena
            .iter()
            .filter(|(_, record)| record.owner.pid == pid)
            .map(|(_, record)| (record.frame, record.owner.vaddr))
            .collect();

        let process = self.registry.resolve(pid);
        for &(frame, vaddr) in &owned {
            if let Some(process) = &process {
                process.page_dir().clear_mapping(vaddr);
                let mut spt = process.spt().lock();
                if spt.lookup(vaddr).is_some_and(|e| e.frame == Some(frame)) {
                    spt.unbind_frame(vaddr);
                }
            }
            self.release(frame);
        }
        owned.len()
    }

    pub fn owner_of(&self, frame: FrameNumber) -> Option<FrameOwner> {
        self.frames.lock().arena.get(frame).map(|r| r.owner)
    }

    pub fn is_ready(&self, frame: FrameNumber) -> bool {
        self.frames
            .lock()
            .arena
            .get(frame)
            .is_some_and(|r| r.flags.ready())
    }

    pub fn is_pinned(&self, frame: FrameNumber) -> bool {
        self.frames
            .lock()
            .arena
            .get(frame)
            .is_some_and(|r| r.pins > 0)
    }

    pub fn usage(&self, frame: FrameNumber) -> Option<u32> {
        self.frames.lock().arena.get(frame).map(|r| r.usage)
    }

    pub fn pool(&self) -> &UserPool {
        &self.pool
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }

    pub fn stats(&self) -> FrameTableStats {
        FrameTableStats {
            frames_in_use: self.frames.lock().arena.len(),
            capacity: self.pool.capacity(),
            evictions: self.evictions.load(Ordering::Relaxed),
            swap_outs: self.swap_outs.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
        }
    }
}
