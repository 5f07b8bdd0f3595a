use super::block_error::BlockError;
use crate::sync::Mutex;
use alloc::{boxed::Box, string::String, sync::Arc, vec::Vec};
use core::fmt;
use kidneyos_shared::sizes::SECTOR_SIZE;
use log::info;

pub const BLOCK_SECTOR_SIZE: usize = SECTOR_SIZE as usize;

/// Sector index on a block device.
pub type BlockSector = u32;

/// What a block device is used for. The paging code only ever asks for
/// [`BlockType::Swap`].
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum BlockType {
    Swap,
    /// Contents unknown.
    Raw,
    /// Belongs to another operating system; never written.
    Foreign,
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            BlockType::Swap => "swap",
            BlockType::Raw => "raw",
            BlockType::Foreign => "foreign",
        };
        f.write_str(name)
    }
}

/// Sector-level access implemented by each driver.
pub trait BlockOp: Send {
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A registered block device: a driver plus its role, size and I/O counters.
pub struct Block {
    index: usize,
    name: String,
    block_type: BlockType,
    driver: Box<dyn BlockOp>,
    /// In sectors.
    size: BlockSector,
    read_count: u32,
    write_count: u32,
}

impl Block {
    fn check(&self, sector: BlockSector, len: usize) -> Result<(), BlockError> {
        if sector >= self.size {
            return Err(BlockError::SectorOutOfBounds);
        }
        if len != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        Ok(())
    }

    /// Reads one sector into `buf`, which must be exactly `BLOCK_SECTOR_SIZE`
    /// bytes long.
    pub fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        self.check(sector, buf.len())?;
        self.driver.read(sector, buf)?;
        self.read_count += 1;
        Ok(())
    }

    /// Writes one sector from `buf`, which must be exactly `BLOCK_SECTOR_SIZE`
    /// bytes long.
    pub fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        self.check(sector, buf.len())?;
        if self.block_type == BlockType::Foreign {
            return Err(BlockError::Foreign);
        }
        self.driver.write(sector, buf)?;
        self.write_count += 1;
        Ok(())
    }

    pub fn get_index(&self) -> usize {
        self.index
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_type(&self) -> BlockType {
        self.block_type
    }

    pub fn get_size(&self) -> BlockSector {
        self.size
    }

    pub fn get_read_count(&self) -> u32 {
        self.read_count
    }

    pub fn get_write_count(&self) -> u32 {
        self.write_count
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} \"{}\" ({}, {} sectors): {} reads, {} writes",
            self.index, self.name, self.block_type, self.size, self.read_count, self.write_count
        )
    }
}

/// Every block device known to the kernel. Each one sits behind its own lock
/// so that a subsystem such as swap can keep a handle to its device.
#[derive(Default)]
pub struct BlockManager {
    blocks: Vec<Arc<Mutex<Block>>>,
}

impl BlockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a device of `size` sectors driven by `driver`. Returns its index.
    pub fn register_block(
        &mut self,
        block_type: BlockType,
        name: &str,
        size: BlockSector,
        driver: Box<dyn BlockOp>,
    ) -> usize {
        let index = self.blocks.len();
        let block = Block {
            index,
            name: String::from(name),
            block_type,
            driver,
            size,
            read_count: 0,
            write_count: 0,
        };
        info!("block: registered {block}");
        self.blocks.push(Arc::new(Mutex::new(block)));
        index
    }

    pub fn by_id(&self, index: usize) -> Option<Arc<Mutex<Block>>> {
        self.blocks.get(index).cloned()
    }

    /// The first device registered with role `block_type`.
    pub fn by_type(&self, block_type: BlockType) -> Option<Arc<Mutex<Block>>> {
        self.blocks
            .iter()
            .find(|block| block.lock().block_type == block_type)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::ram_disk::RamDisk;

    fn manager_with_swap(sectors: BlockSector) -> BlockManager {
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::Raw, "raw", 4, Box::new(RamDisk::new(4)));
        blocks.register_block(
            BlockType::Swap,
            "swap",
            sectors,
            Box::new(RamDisk::new(sectors)),
        );
        blocks
    }

    #[test]
    fn test_lookup_by_type() {
        let blocks = manager_with_swap(16);
        let swap = blocks.by_type(BlockType::Swap).expect("swap registered");
        assert_eq!(swap.lock().get_index(), 1);
        assert_eq!(swap.lock().get_size(), 16);
        assert_eq!(swap.lock().get_name(), "swap");
        assert!(blocks.by_type(BlockType::Foreign).is_none());
        assert!(blocks.by_id(2).is_none());
        assert_eq!(blocks.len(), 2);
    }

    #[test]
    fn test_read_write_counts() {
        let blocks = manager_with_swap(16);
        let swap = blocks.by_type(BlockType::Swap).expect("swap registered");
        let mut block = swap.lock();

        let data = [0xAB; BLOCK_SECTOR_SIZE];
        block.write(3, &data).expect("write in bounds");
        let mut back = [0; BLOCK_SECTOR_SIZE];
        block.read(3, &mut back).expect("read in bounds");

        assert_eq!(back, data);
        assert_eq!(block.get_read_count(), 1);
        assert_eq!(block.get_write_count(), 1);
    }

    #[test]
    fn test_rejects_bad_requests() {
        let blocks = manager_with_swap(16);
        let swap = blocks.by_type(BlockType::Swap).expect("swap registered");
        let mut block = swap.lock();

        let mut buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(block.read(16, &mut buf), Err(BlockError::SectorOutOfBounds));
        assert_eq!(block.write(0, &buf[..10]), Err(BlockError::BufferInvalid));
        assert_eq!(block.get_read_count(), 0);
    }

    #[test]
    fn test_foreign_blocks_are_read_only() {
        let mut blocks = BlockManager::new();
        blocks.register_block(BlockType::Foreign, "win", 4, Box::new(RamDisk::new(4)));
        let foreign = blocks.by_id(0).expect("registered");
        let buf = [0; BLOCK_SECTOR_SIZE];
        assert_eq!(foreign.lock().write(0, &buf), Err(BlockError::Foreign));
        assert_eq!(foreign.lock().get_type(), BlockType::Foreign);
    }
}
