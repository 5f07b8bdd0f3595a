//! The swap space: page-sized slots on the block device registered as
//! [`BlockType::Swap`].
//!
//! Slot `n` occupies sectors `n * SECTORS_PER_PAGE` up to (but excluding)
//! `(n + 1) * SECTORS_PER_PAGE`. There is no header; which slots are in use is
//! only known to the bitmap kept here.

pub mod page_replacement;

use crate::{
    block::{Block, BlockManager, BlockSector, BlockType, BLOCK_SECTOR_SIZE},
    mem::Page,
    sync::Mutex,
    threading::Pid,
};
use alloc::{boxed::Box, string::String, sync::Arc, vec, vec::Vec};
use core::fmt;
use kidneyos_shared::mem::SECTORS_PER_PAGE;
use log::{debug, info};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Index of a page-sized slot on the swap device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub usize);

impl SwapSlot {
    fn first_sector(self) -> BlockSector {
        // Capacity is derived from a `BlockSector` count, so this cannot overflow.
        self.0 as BlockSector * SECTORS_PER_PAGE
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "swap slot {}", self.0)
    }
}

struct SlotMap {
    bitmap: Box<[u64]>,
    /// Pid of the process whose page is stored in each allocated slot.
    owners: Box<[Pid]>,
    used: usize,
}

impl SlotMap {
    fn new(capacity: usize) -> Self {
        Self {
            bitmap: vec![0; capacity.div_ceil(BITS_PER_WORD)].into_boxed_slice(),
            owners: vec![0; capacity].into_boxed_slice(),
            used: 0,
        }
    }

    fn is_set(&self, slot: usize) -> bool {
        self.bitmap[slot / BITS_PER_WORD] & (1 << (slot % BITS_PER_WORD)) != 0
    }

    fn set(&mut self, slot: usize, owner: Pid) {
        self.bitmap[slot / BITS_PER_WORD] |= 1 << (slot % BITS_PER_WORD);
        self.owners[slot] = owner;
        self.used += 1;
    }

    fn clear(&mut self, slot: usize) {
        self.bitmap[slot / BITS_PER_WORD] &= !(1 << (slot % BITS_PER_WORD));
        self.used -= 1;
    }

    /// Lowest free slot below `capacity`.
    fn first_free(&self, capacity: usize) -> Option<usize> {
        self.bitmap
            .iter()
            .enumerate()
            .find(|(_, &word)| word != u64::MAX)
            .map(|(i, &word)| i * BITS_PER_WORD + word.trailing_ones() as usize)
            .filter(|&slot| slot < capacity)
    }
}

pub struct SwapSpace {
    device: Arc<Mutex<Block>>,
    slots: Mutex<SlotMap>,
    capacity: usize,
}

/// Binds the swap space to the swap device registered with `blocks`.
///
/// Panics if there is no swap device; the kernel cannot page without one.
pub fn swap_init(blocks: &BlockManager) -> SwapSpace {
    let Some(device) = blocks.by_type(BlockType::Swap) else {
        panic!("Cannot get swap block");
    };
    SwapSpace::new(device)
}

impl SwapSpace {
    pub fn new(device: Arc<Mutex<Block>>) -> Self {
        let (name, sectors) = {
            let block = device.lock();
            (String::from(block.get_name()), block.get_size())
        };
        let capacity = (sectors / SECTORS_PER_PAGE) as usize;
        info!("swap: using {name} with {capacity} slots");

        Self {
            device,
            slots: Mutex::new(SlotMap::new(capacity)),
            capacity,
        }
    }

    /// Writes `page` to the lowest free slot and returns it. The slot is
    /// recorded as belonging to `owner`.
    ///
    /// Panics when the swap space is full or the device fails.
    pub fn write(&self, owner: Pid, page: &Page) -> SwapSlot {
        let slot = {
            let mut slots = self.slots.lock();
            let Some(index) = slots.first_free(self.capacity) else {
                panic!("swap space exhausted ({} slots)", self.capacity);
            };
            slots.set(index, owner);
            SwapSlot(index)
        };

        let mut device = self.device.lock();
        for (i, sector) in page.chunks_exact(BLOCK_SECTOR_SIZE).enumerate() {
            let sector_id = slot.first_sector() + i as BlockSector;
            if let Err(err) = device.write(sector_id, sector) {
                panic!("failed to write {slot}: {err}");
            }
        }
        debug!("swap: wrote page of pid {owner} to {slot}");

        slot
    }

    /// Reads `slot` into `page` and frees it.
    ///
    /// Panics if `slot` is not in use or the device fails.
    pub fn read(&self, slot: SwapSlot, page: &mut Page) {
        assert!(self.is_allocated(slot), "read from free {slot}");

        {
            let mut device = self.device.lock();
            for (i, sector) in page.chunks_exact_mut(BLOCK_SECTOR_SIZE).enumerate() {
                let sector_id = slot.first_sector() + i as BlockSector;
                if let Err(err) = device.read(sector_id, sector) {
                    panic!("failed to read {slot}: {err}");
                }
            }
        }

        self.remove(slot);
    }

    /// Frees `slot` without reading it.
    pub fn remove(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        assert!(slots.is_set(slot.0), "double free of {slot}");
        slots.clear(slot.0);
    }

    /// Frees every slot holding a page of `pid`. Returns how many were freed.
    pub fn remove_owned_by(&self, pid: Pid) -> usize {
        let mut slots = self.slots.lock();
        let owned: Vec<usize> = (0..self.capacity)
            .filter(|&slot| slots.is_set(slot) && slots.owners[slot] == pid)
            .collect();
        for &slot in &owned {
            slots.clear(slot);
        }
        owned.len()
    }

    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        slot.0 < self.capacity && self.slots.lock().is_set(slot.0)
    }

    pub fn owner(&self, slot: SwapSlot) -> Option<Pid> {
        let slots = self.slots.lock();
        (slot.0 < self.capacity && slots.is_set(slot.0)).then(|| slots.owners[slot.0])
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn free_slots(&self) -> usize {
        self.capacity - self.slots.lock().used
    }
}
