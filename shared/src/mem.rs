use crate::sizes::{KB, MB, SECTOR_SIZE};

// Page size is 4KB. This is a property of x86 processors.
pub const PAGE_FRAME_SIZE: usize = 4 * KB;

// Any virtual address at or above OFFSET is a kernel address.
pub const OFFSET: usize = 0x80000000;

/// Number of disk sectors that hold exactly one page.
pub const SECTORS_PER_PAGE: u32 = PAGE_FRAME_SIZE as u32 / SECTOR_SIZE;

// User stacks start just below the kernel and grow down.
pub const USER_STACK_TOP: usize = OFFSET;
pub const MAX_USER_STACK_SIZE: usize = 8 * MB;

// Nothing is ever mapped in the first page, so null dereferences always fault.
pub const USER_VADDR_BOTTOM: usize = PAGE_FRAME_SIZE;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn page_offset(addr: usize) -> usize {
    addr & (PAGE_FRAME_SIZE - 1)
}

#[inline]
pub const fn is_user_vaddr(addr: usize) -> bool {
    addr < OFFSET
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        assert_eq!(page_round_down(0x1234), 0x1000);
        assert_eq!(page_round_down(0x1000), 0x1000);
        assert_eq!(page_offset(0x1234), 0x234);
        assert_eq!(SECTORS_PER_PAGE, 8);
    }

    #[test]
    fn test_user_vaddr() {
        assert!(is_user_vaddr(USER_STACK_TOP - 1));
        assert!(!is_user_vaddr(OFFSET));
    }
}
