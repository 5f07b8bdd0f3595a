//! What demand paging needs from the file system: reading file contents at an
//! offset. Executable pages are populated through [`FileRead`].

use alloc::{sync::Arc, vec::Vec};
use core::cmp::min;

pub trait FileRead: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at byte `offset`, returning how
    /// many bytes were read. Reads past the end of the file are short.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize;

    /// Length of the file in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shared handle to an open file. Every page of a segment holds one.
pub type FileRef = Arc<dyn FileRead>;

/// A file whose contents live in kernel memory.
#[derive(Debug, Default, Clone)]
pub struct MemFile {
    data: Vec<u8>,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_ref(self) -> FileRef {
        Arc::new(self)
    }
}

impl FileRead for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let Ok(offset) = usize::try_from(offset) else {
            return 0;
        };
        if offset >= self.data.len() {
            return 0;
        }
        let count = min(buf.len(), self.data.len() - offset);
        buf[..count].copy_from_slice(&self.data[offset..offset + count]);
        count
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_at_offset() {
        let file = MemFile::new((0..10).collect());
        let mut buf = [0; 4];
        assert_eq!(file.read_at(&mut buf, 3), 4);
        assert_eq!(buf, [3, 4, 5, 6]);
    }

    #[test]
    fn test_short_read_at_end() {
        let file = MemFile::new((0..10).collect());
        let mut buf = [0xFF; 4];
        assert_eq!(file.read_at(&mut buf, 8), 2);
        assert_eq!(buf, [8, 9, 0xFF, 0xFF]);
        assert_eq!(file.read_at(&mut buf, 10), 0);
        assert!(!file.is_empty());
    }
}
