// https://wiki.osdev.org/Paging

use arbitrary_int::u20;
use bitbybit::bitfield;

/// An x86 page table entry. Only the bits demand paging reads or writes are
/// named; the caching and global bits stay zero.
#[bitfield(u32, default = 0)]
pub struct PageTableEntry {
    #[bit(0, rw)]
    present: bool,
    #[bit(1, rw)]
    read_write: bool,
    #[bit(2, rw)]
    user_supervisor: bool,
    /// Set by the MMU on any access through this entry.
    #[bit(5, rw)]
    accessed: bool,
    /// Set by the MMU on a write through this entry.
    #[bit(6, rw)]
    dirty: bool,
    #[bits(12..=31, rw)]
    page_frame_address: u20,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_table_entry_bits() {
        let pte = PageTableEntry::DEFAULT
            .with_present(true)
            .with_read_write(true)
            .with_page_frame_address(u20::new(0x12345));
        assert!(pte.present());
        assert!(pte.read_write());
        assert!(!pte.dirty());
        assert_eq!(pte.raw_value(), 0x1234_5003);

        let pte = pte.with_dirty(true).with_accessed(true);
        assert_eq!(pte.raw_value() & 0x60, 0x60);
        assert_eq!(pte.page_frame_address().value(), 0x12345);
    }
}
