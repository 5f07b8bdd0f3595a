//! Page fault handling for user pages.
//!
//! A fault moves through [`FaultState`]: it is first classified from the fault
//! itself and the process's supplemental page table, then resolved by bringing
//! the page in. Anything that cannot be resolved is fatal to the faulting
//! process only; the caller is expected to kill it.

use super::{
    frame_table::{AllocFlags, FrameTable},
    supplemental::{Backing, PageEntry},
    FrameNumber, VirtAddr,
};
use crate::threading::{Pid, UserProcess};
use alloc::sync::Arc;
use kidneyos_shared::mem::{is_user_vaddr, PAGE_FRAME_SIZE, USER_STACK_TOP, USER_VADDR_BOTTOM};
use log::{debug, trace};
use thiserror::Error;
use zerocopy::FromZeroes;

// Bits of the x86 page fault error code.
pub const PF_P: u32 = 0x1;
pub const PF_W: u32 = 0x2;
pub const PF_U: u32 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFault {
    /// The faulting address, from `cr2`.
    pub addr: usize,
    /// The page was present, so this is a protection violation.
    pub present: bool,
    pub write: bool,
    /// The access came from user mode.
    pub user: bool,
    /// The user `esp` at the time of the fault. Only meaningful for user faults.
    pub stack_ptr: usize,
}

impl PageFault {
    pub fn from_error_code(addr: usize, error_code: u32, stack_ptr: usize) -> Self {
        Self {
            addr,
            present: error_code & PF_P != 0,
            write: error_code & PF_W != 0,
            user: error_code & PF_U != 0,
            stack_ptr,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PageFaultError {
    #[error("kernel fault on a kernel address")]
    KernelAccess,
    #[error("null pointer access")]
    NullAccess,
    #[error("rights violation")]
    ProtectionViolation,
    #[error("not a valid user address")]
    InvalidAccess,
    #[error("memory-mapped pages are not supported")]
    Unsupported,
    #[error("short read from file: expected {expected} bytes, got {read}")]
    ShortRead { expected: usize, read: usize },
    #[error("could not install page mapping")]
    MappingFailed,
    #[error("no process with pid {0}")]
    UnknownProcess(Pid),
}

#[derive(Debug, Clone)]
pub enum FaultKind {
    /// The page became resident while we were getting here.
    Resident,
    /// The page has an entry and must be brought in.
    Demand(PageEntry),
    /// The page has no entry but is close enough to the stack pointer to be
    /// taken as the stack growing down.
    StackGrowth,
}

#[derive(Debug, Clone)]
pub enum FaultState {
    Unhandled,
    Classified(FaultKind),
    Resolved,
    Fatal(PageFaultError),
}

/// Whether a fault at `addr` with stack pointer `esp` is the stack growing.
/// The address must lie in the stack region and no more than a page below
/// `esp`. Addresses above `esp` are allowed.
pub fn is_stack_access(addr: usize, esp: usize, max_stack_size: usize) -> bool {
    let stack_bottom = USER_STACK_TOP.saturating_sub(max_stack_size);
    (stack_bottom..USER_STACK_TOP).contains(&addr) && addr.saturating_add(PAGE_FRAME_SIZE) > esp
}

pub struct PageFaultHandler {
    frames: Arc<FrameTable>,
    max_stack_size: usize,
}

impl PageFaultHandler {
    pub fn new(frames: Arc<FrameTable>, max_stack_size: usize) -> Self {
        Self {
            frames,
            max_stack_size,
        }
    }

    pub fn handle(&self, process: &UserProcess, fault: &PageFault) -> Result<(), PageFaultError> {
        let mut state = FaultState::Unhandled;
        loop {
            state = match state {
                FaultState::Unhandled => match self.classify(process, fault) {
                    Ok(kind) => FaultState::Classified(kind),
                    Err(err) => FaultState::Fatal(err),
                },
                FaultState::Classified(kind) => match self.resolve(process, fault, kind) {
                    Ok(()) => FaultState::Resolved,
                    Err(err) => FaultState::Fatal(err),
                },
                FaultState::Resolved => return Ok(()),
                FaultState::Fatal(err) => return Err(err),
            };
        }
    }

    fn classify(&self, process: &UserProcess, fault: &PageFault) -> Result<FaultKind, PageFaultError> {
        if !is_user_vaddr(fault.addr) {
            return Err(if fault.user {
                PageFaultError::InvalidAccess
            } else {
                PageFaultError::KernelAccess
            });
        }
        if fault.addr < USER_VADDR_BOTTOM {
            return Err(PageFaultError::NullAccess);
        }

        let vaddr = VirtAddr::page_round_down(fault.addr);
        let esp = if fault.user {
            fault.stack_ptr
        } else {
            process.syscall_stack()
        };

        // The entry may belong to a page that is being evicted right now.
        let _barrier = self.frames.eviction_barrier();
        let spt = process.spt().lock();
        let entry = spt.lookup(vaddr);

        if fault.present {
            return match entry {
                Some(_) => Err(PageFaultError::ProtectionViolation),
                None if is_stack_access(fault.addr, esp, self.max_stack_size) => {
                    Ok(FaultKind::StackGrowth)
                }
                None => Err(PageFaultError::ProtectionViolation),
            };
        }

        match entry {
            Some(entry) if fault.write && !entry.writable => {
                Err(PageFaultError::ProtectionViolation)
            }
            Some(entry) if entry.is_resident() => Ok(FaultKind::Resident),
            Some(entry) => Ok(FaultKind::Demand(entry.clone())),
            None if is_stack_access(fault.addr, esp, self.max_stack_size) => {
                Ok(FaultKind::StackGrowth)
            }
            None => Err(PageFaultError::InvalidAccess),
        }
    }

    fn resolve(
        &self,
        process: &UserProcess,
        fault: &PageFault,
        kind: FaultKind,
    ) -> Result<(), PageFaultError> {
        let vaddr = VirtAddr::page_round_down(fault.addr);
        match kind {
            FaultKind::Resident => Ok(()),
            FaultKind::Demand(entry) => self.load_page(process, vaddr, entry),
            FaultKind::StackGrowth => {
                debug!("pid {}: growing stack to {vaddr}", process.pid());
                let entry = {
                    let mut spt = process.spt().lock();
                    if spt.lookup(vaddr).is_none() {
                        spt.insert_zero(vaddr, true)
                            .map_err(|_| PageFaultError::InvalidAccess)?;
                    }
                    spt.lookup(vaddr).cloned()
                };
                match entry {
                    Some(entry) if entry.is_resident() => Ok(()),
                    Some(entry) => self.load_page(process, vaddr, entry),
                    None => Err(PageFaultError::InvalidAccess),
                }
            }
        }
    }

    /// Brings `vaddr` into a frame according to `entry` and maps it.
    pub fn load_page(
        &self,
        process: &UserProcess,
        vaddr: VirtAddr,
        entry: PageEntry,
    ) -> Result<(), PageFaultError> {
        if matches!(entry.backing, Backing::MemoryMapped) {
            return Err(PageFaultError::Unsupported);
        }

        let page_dir = process.page_dir();
        let frame = self.frames.allocate(process.pid(), vaddr, AllocFlags::DEFAULT);
        debug!(
            "pid {}: {} {vaddr} into {frame}",
            process.pid(),
            if entry.loaded { "reloading" } else { "loading" }
        );
        if !page_dir.install_mapping(vaddr, frame, entry.writable) {
            self.frames.release(frame);
            return Err(PageFaultError::MappingFailed);
        }

        let bound = self
            .populate(process, vaddr, frame, &entry.backing)
            .and_then(|()| {
                process
                    .spt()
                    .lock()
                    .bind_frame(vaddr, frame)
                    .map_err(|_| PageFaultError::InvalidAccess)
            });
        if let Err(err) = bound {
            page_dir.clear_mapping(vaddr);
            self.frames.release(frame);
            return Err(err);
        }

        self.frames.mark_ready(frame, true);
        page_dir.set_dirty(vaddr, false);
        Ok(())
    }

    fn populate(
        &self,
        process: &UserProcess,
        vaddr: VirtAddr,
        frame: FrameNumber,
        backing: &Backing,
    ) -> Result<(), PageFaultError> {
        match backing {
            Backing::File(file) => {
                trace!(
                    "pid {}: reading {} bytes at {:#X} into {vaddr}",
                    process.pid(),
                    file.read_bytes,
                    file.offset
                );
                let mut page = self.frames.pool().page(frame);
                let read = file.file.read_at(&mut page[..file.read_bytes], file.offset);
                if read != file.read_bytes {
                    return Err(PageFaultError::ShortRead {
                        expected: file.read_bytes,
                        read,
                    });
                }
                page[file.read_bytes..].fill(0);
            }
            Backing::Zero | Backing::Swap { slot: None } => {
                self.frames.pool().page(frame).zero();
            }
            Backing::Swap { slot: Some(_) } => {
                // Take the slot out of the entry first: reading it frees it.
                let slot = {
                    let mut spt = process.spt().lock();
                    let entry = spt.lookup_mut(vaddr).ok_or(PageFaultError::InvalidAccess)?;
                    let Backing::Swap { slot } = &mut entry.backing else {
                        return Err(PageFaultError::InvalidAccess);
                    };
                    slot.take().ok_or(PageFaultError::InvalidAccess)?
                };
                trace!("pid {}: reading {vaddr} back from {slot}", process.pid());
                self.frames.swap().read(slot, &mut self.frames.pool().page(frame));
            }
            Backing::MemoryMapped => return Err(PageFaultError::Unsupported),
        }
        Ok(())
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::{BlockManager, BlockType},
        drivers::ram_disk::RamDisk,
        fs::{FileRef, MemFile},
        paging::{AddressSpace, PageDirectory},
        swapping::swap_init,
        threading::ProcessTable,
    };
    use alloc::boxed::Box;
    use kidneyos_shared::mem::{MAX_USER_STACK_SIZE, SECTORS_PER_PAGE};
    use proptest::prelude::*;

    const CODE: VirtAddr = VirtAddr::page_round_down(0x0804_8000);
    const ESP: usize = USER_STACK_TOP - 0x100;

    struct Fixture {
        handler: PageFaultHandler,
        process: Arc<UserProcess>,
        page_dir: Arc<PageDirectory>,
    }

    fn fixture(frames: usize, page_dir: PageDirectory) -> Fixture {
        let mut blocks = BlockManager::new();
        let sectors = 8 * SECTORS_PER_PAGE;
        blocks.register_block(BlockType::Swap, "swap", sectors, Box::new(RamDisk::new(sectors)));
        let processes = Arc::new(ProcessTable::new());
        let frame_table = FrameTable::new(frames, Arc::new(swap_init(&blocks)), processes.clone());

        let page_dir = Arc::new(page_dir);
        let process = Arc::new(UserProcess::new(1, "test", page_dir.clone()));
        processes.add(process.clone());
        Fixture {
            handler: PageFaultHandler::new(Arc::new(frame_table), MAX_USER_STACK_SIZE),
            process,
            page_dir,
        }
    }

    fn user_fault(addr: usize, write: bool) -> PageFault {
        PageFault {
            addr,
            present: false,
            write,
            user: true,
            stack_ptr: ESP,
        }
    }

    impl Fixture {
        fn fault(&self, fault: PageFault) -> Result<(), PageFaultError> {
            self.handler.handle(&self.process, &fault)
        }

        fn contents(&self, vaddr: VirtAddr) -> Box<[u8]> {
            let frame = self.page_dir.translate(vaddr).expect("page is mapped");
            let page = self.handler.frames().pool().page(frame);
            page.to_vec().into_boxed_slice()
        }
    }

    fn elf_like_file() -> FileRef {
        MemFile::new((0..2 * PAGE_FRAME_SIZE).map(|i| (i % 251) as u8).collect()).into_ref()
    }

    #[test]
    fn test_error_code_decoding() {
        let fault = PageFault::from_error_code(0x1234, PF_W | PF_U, ESP);
        assert!(!fault.present);
        assert!(fault.write);
        assert!(fault.user);
    }

    #[test]
    fn test_file_page_read_then_zeroed() {
        let f = fixture(4, PageDirectory::new());
        f.process
            .spt()
            .lock()
            .insert_file(CODE, elf_like_file(), 0, 100, PAGE_FRAME_SIZE - 100, false)
            .expect("fresh page");

        f.fault(user_fault(CODE.as_usize() + 8, false)).expect("resolved");

        let contents = f.contents(CODE);
        assert!((0..100).all(|i| contents[i] == (i % 251) as u8));
        assert!(contents[100..].iter().all(|&b| b == 0));
        assert!(!f.page_dir.is_writable(CODE));

        let spt = f.process.spt().lock();
        let entry = spt.lookup(CODE).expect("entry");
        assert!(entry.loaded);
        let frame = entry.frame.expect("resident");
        assert!(f.handler.frames().is_ready(frame));
    }

    #[test]
    fn test_short_read_releases_frame() {
        let f = fixture(4, PageDirectory::new());
        let file = MemFile::new(vec![1; 10]).into_ref();
        f.process
            .spt()
            .lock()
            .insert_file(CODE, file, 0, 100, PAGE_FRAME_SIZE - 100, false)
            .expect("fresh page");

        assert_eq!(
            f.fault(user_fault(CODE.as_usize(), false)),
            Err(PageFaultError::ShortRead {
                expected: 100,
                read: 10
            })
        );
        assert_eq!(f.page_dir.translate(CODE), None);
        assert_eq!(f.handler.frames().pool().frames_allocated(), 0);
    }

    #[test]
    fn test_mapping_failure_releases_frame() {
        let f = fixture(4, PageDirectory::with_limit(0));
        f.process.spt().lock().insert_zero(CODE, true).expect("fresh page");
        assert_eq!(
            f.fault(user_fault(CODE.as_usize(), true)),
            Err(PageFaultError::MappingFailed)
        );
        assert_eq!(f.handler.frames().pool().frames_allocated(), 0);
    }

    #[test]
    fn test_invalid_addresses() {
        let f = fixture(2, PageDirectory::new());
        assert_eq!(
            f.fault(user_fault(0x10, false)),
            Err(PageFaultError::NullAccess)
        );
        assert_eq!(
            f.fault(user_fault(CODE.as_usize(), false)),
            Err(PageFaultError::InvalidAccess)
        );
        assert_eq!(
            f.fault(user_fault(0xC000_0000, false)),
            Err(PageFaultError::InvalidAccess)
        );

        let kernel = PageFault {
            user: false,
            ..user_fault(0xC000_0000, false)
        };
        assert_eq!(f.fault(kernel), Err(PageFaultError::KernelAccess));
    }

    #[test]
    fn test_write_to_read_only_page() {
        let f = fixture(2, PageDirectory::new());
        f.process.spt().lock().insert_zero(CODE, false).expect("fresh page");
        assert_eq!(
            f.fault(user_fault(CODE.as_usize(), true)),
            Err(PageFaultError::ProtectionViolation)
        );

        f.fault(user_fault(CODE.as_usize(), false)).expect("read is fine");
        let present = PageFault {
            present: true,
            ..user_fault(CODE.as_usize(), true)
        };
        assert_eq!(f.fault(present), Err(PageFaultError::ProtectionViolation));
    }

    #[test]
    fn test_memory_mapped_unsupported() {
        let f = fixture(2, PageDirectory::new());
        f.process.spt().lock().insert_mmap(CODE, true).expect("fresh page");
        assert_eq!(
            f.fault(user_fault(CODE.as_usize(), false)),
            Err(PageFaultError::Unsupported)
        );
        assert_eq!(f.handler.frames().pool().frames_allocated(), 0);
    }

    #[test]
    fn test_stack_growth() {
        let f = fixture(4, PageDirectory::new());
        f.fault(user_fault(ESP - 4, true)).expect("push");
        f.fault(user_fault(ESP - 32 - PAGE_FRAME_SIZE, true))
            .expect_err("more than a page below esp");

        let page = VirtAddr::page_round_down(ESP - 4);
        assert!(f.page_dir.is_writable(page));
        assert!(f.contents(page).iter().all(|&b| b == 0));
        let spt = f.process.spt().lock();
        assert!(matches!(
            spt.lookup(page).map(|e| &e.backing),
            Some(Backing::Zero)
        ));
    }

    #[test]
    fn test_kernel_fault_uses_saved_stack_pointer() {
        let f = fixture(4, PageDirectory::new());
        let below = USER_STACK_TOP - 3 * PAGE_FRAME_SIZE;
        let fault = PageFault {
            user: false,
            stack_ptr: 0,
            ..user_fault(below, true)
        };
        f.process.set_syscall_stack(ESP);
        assert_eq!(f.fault(fault), Err(PageFaultError::InvalidAccess));

        f.process.set_syscall_stack(below + 16);
        f.fault(fault).expect("within the saved stack pointer's page");
    }

    #[test]
    fn test_swapped_page_round_trips() {
        let f = fixture(1, PageDirectory::new());
        let stack = VirtAddr::page_round_down(ESP);
        f.fault(user_fault(ESP, true)).expect("stack page");
        let frame = f.page_dir.translate(stack).expect("mapped");
        f.handler.frames().pool().page(frame).fill(0x42);
        assert!(f.page_dir.access(stack, true));

        // Only one frame, so bringing in the code page evicts the stack.
        f.process.spt().lock().insert_zero(CODE, true).expect("fresh page");
        f.fault(user_fault(CODE.as_usize(), false)).expect("code page");
        assert!(f.process.spt().lock().lookup(stack).is_some_and(|e| e.is_swapped()));

        f.fault(user_fault(ESP, false)).expect("swapped back in");
        assert!(f.contents(stack).iter().all(|&b| b == 0x42));
        let spt = f.process.spt().lock();
        let entry = spt.lookup(stack).expect("entry");
        assert!(!entry.is_swapped());
        assert!(matches!(entry.backing, Backing::Swap { slot: None }));

        // The code page made room for it in turn.
        assert!(spt.lookup(CODE).is_some_and(|e| e.is_swapped()));
        assert_eq!(f.handler.frames().swap().free_slots(), 7);
    }

    proptest! {
        #[test]
        fn test_stack_boundary(offset in 1usize..2 * PAGE_FRAME_SIZE) {
            let addr = ESP - offset;
            prop_assert_eq!(
                is_stack_access(addr, ESP, MAX_USER_STACK_SIZE),
                offset < PAGE_FRAME_SIZE
            );
        }
    }

    #[test]
    fn test_stack_region_limits() {
        assert!(is_stack_access(ESP + 8, ESP, MAX_USER_STACK_SIZE));
        assert!(!is_stack_access(USER_STACK_TOP, ESP, MAX_USER_STACK_SIZE));
        let bottom = USER_STACK_TOP - MAX_USER_STACK_SIZE;
        assert!(is_stack_access(bottom, bottom + 4, MAX_USER_STACK_SIZE));
        assert!(!is_stack_access(bottom - 4, bottom, MAX_USER_STACK_SIZE));
    }
}
