pub const KB: usize = 1 << 10;
pub const MB: usize = 1 << 20;

/// Bytes per disk sector. Swap and file I/O happen in whole sectors.
pub const SECTOR_SIZE: u32 = 512;
