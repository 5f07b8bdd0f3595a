//! User buffers passed to system calls.

use super::VirtAddr;
use kidneyos_shared::mem::{is_user_vaddr, PAGE_FRAME_SIZE};

/// The pages spanned by the user buffer `[addr, addr + len)`, or `None` if
/// any part of it lies outside user space.
pub fn user_pages(addr: usize, len: usize) -> Option<impl Iterator<Item = VirtAddr>> {
    let end = addr.checked_add(len)?;
    if len > 0 && !is_user_vaddr(end - 1) {
        return None;
    }

    let first = VirtAddr::page_round_down(addr);
    let pages = if len == 0 {
        0
    } else {
        (end - first.as_usize()).div_ceil(PAGE_FRAME_SIZE)
    };
    Some((0..pages).map(move |i| first.add_pages(i)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kidneyos_shared::mem::OFFSET;

    fn pages(addr: usize, len: usize) -> Option<Vec<usize>> {
        user_pages(addr, len).map(|pages| pages.map(VirtAddr::as_usize).collect())
    }

    #[test]
    fn test_buffer_within_one_page() {
        assert_eq!(pages(0x1000_0010, 16), Some(vec![0x1000_0000]));
        assert_eq!(pages(0x1000_0010, 0), Some(vec![]));
    }

    #[test]
    fn test_buffer_crossing_pages() {
        assert_eq!(
            pages(0x1000_0FFF, 2),
            Some(vec![0x1000_0000, 0x1000_1000])
        );
        assert_eq!(pages(0x1000_0000, 0x2000).map(|p| p.len()), Some(2));
    }

    #[test]
    fn test_buffer_reaching_kernel() {
        assert_eq!(pages(OFFSET - 4, 8), None);
        assert_eq!(pages(usize::MAX - 1, 4), None);
        assert!(pages(OFFSET - 4, 4).is_some());
    }
}
