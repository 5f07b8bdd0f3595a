//! The entry points the rest of the kernel uses: page faults, timer ticks,
//! process exit and pinning of system call buffers.

use crate::{
    block::BlockManager,
    config::VmConfig,
    mem::{
        frame_table::{FrameTable, FrameTableStats},
        page_fault::{PageFault, PageFaultError, PageFaultHandler},
        user::user_pages,
        VirtAddr, VmError,
    },
    swapping::{
        page_replacement::{Aging, PageReplacementPolicy},
        swap_init, SwapSpace,
    },
    threading::{Pid, ProcessRegistry, UserProcess},
    timer::AgingClock,
};
use alloc::{boxed::Box, sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicUsize, Ordering};
use log::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmStats {
    pub page_faults: usize,
    pub frames: FrameTableStats,
    pub swap_capacity: usize,
    pub swap_free: usize,
}

pub struct Vm {
    config: VmConfig,
    swap: Arc<SwapSpace>,
    frames: Arc<FrameTable>,
    handler: PageFaultHandler,
    registry: Arc<dyn ProcessRegistry>,
    clock: AgingClock,
    page_faults: AtomicUsize,
}

impl Vm {
    /// Sets up paging over the swap device registered in `blocks`.
    ///
    /// Panics if there is no swap device.
    pub fn new(config: VmConfig, blocks: &BlockManager, registry: Arc<dyn ProcessRegistry>) -> Self {
        Self::with_policy(config, blocks, registry, Box::new(Aging))
    }

    pub fn with_policy(
        config: VmConfig,
        blocks: &BlockManager,
        registry: Arc<dyn ProcessRegistry>,
        policy: Box<dyn PageReplacementPolicy>,
    ) -> Self {
        let swap = Arc::new(swap_init(blocks));
        let frames = Arc::new(FrameTable::with_policy(
            config.user_frames,
            swap.clone(),
            registry.clone(),
            policy,
        ));
        info!(
            "vm: {} user frames, {} swap slots",
            config.user_frames,
            swap.capacity()
        );

        Self {
            config,
            handler: PageFaultHandler::new(frames.clone(), config.max_stack_size),
            swap,
            frames,
            registry,
            clock: AgingClock::new(config.aging_interval),
            page_faults: AtomicUsize::new(0),
        }
    }

    fn process(&self, pid: Pid) -> Result<Arc<UserProcess>, PageFaultError> {
        self.registry
            .resolve(pid)
            .ok_or(PageFaultError::UnknownProcess(pid))
    }

    /// Resolves a page fault taken by process `pid`. An error means the
    /// process must be killed.
    pub fn handle_page_fault(&self, pid: Pid, fault: PageFault) -> Result<(), PageFaultError> {
        self.page_faults.fetch_add(1, Ordering::Relaxed);

        let process = match self.process(pid) {
            Ok(process) => process,
            Err(err) => {
                error!("page fault at {:#X} from unknown pid {pid}", fault.addr);
                return Err(err);
            }
        };

        let result = self.handler.handle(&process, &fault);
        if let Err(err) = &result {
            warn!(
                "{} (pid {pid}): dying due to page fault at {:#X} ({err})",
                process.name(),
                fault.addr
            );
        }
        result
    }

    /// Called on every timer interrupt. Returns whether an aging pass ran.
    pub fn timer_tick(&self) -> bool {
        let due = self.clock.tick();
        if due {
            self.age_tick();
        }
        due
    }

    pub fn age_tick(&self) {
        self.frames.age_tick();
    }

    pub fn release_all_frames(&self, pid: Pid) -> usize {
        self.frames.release_all_frames(pid)
    }

    /// Drops every supplemental page table entry of `pid`. Frames and swap
    /// slots must have been released already.
    pub fn destroy_all_entries(&self, pid: Pid) -> usize {
        self.registry
            .resolve(pid)
            .map_or(0, |process| process.spt().lock().destroy_all().len())
    }

    pub fn remove_swap_slots_owned_by(&self, pid: Pid) -> usize {
        self.swap.remove_owned_by(pid)
    }

    /// Frees everything `pid` holds. Must run before the process leaves the
    /// registry, so that its mappings and entries can still be reached.
    pub fn process_exit(&self, pid: Pid) {
        let frames = self.release_all_frames(pid);
        let pages = self.destroy_all_entries(pid);
        let slots = self.remove_swap_slots_owned_by(pid);
        info!("pid {pid}: released {frames} frames, {pages} pages and {slots} swap slots");
    }

    /// Unmaps page `vaddr` of `pid` and releases whatever holds its contents.
    pub fn free_page(&self, pid: Pid, vaddr: VirtAddr) -> Result<(), VmError> {
        let process = self.registry.resolve(pid).ok_or(VmError::NoEntry(vaddr))?;

        let _barrier = self.frames.eviction_barrier();
        let entry = process
            .spt()
            .lock()
            .destroy_entry(vaddr)
            .ok_or(VmError::NoEntry(vaddr))?;

        process.page_dir().clear_mapping(vaddr);
        if let Some(frame) = entry.frame {
            self.frames.release(frame);
        }
        if let Some(slot) = entry.swap_slot() {
            self.swap.remove(slot);
        }
        Ok(())
    }

    /// Brings in every page of the user buffer `[addr, addr + len)` and pins
    /// it, so that it stays resident while the kernel works on it. On error,
    /// nothing stays pinned.
    pub fn pin_user_range(
        &self,
        pid: Pid,
        addr: usize,
        len: usize,
        write: bool,
    ) -> Result<(), PageFaultError> {
        let process = self.process(pid)?;
        let pages = user_pages(addr, len).ok_or(PageFaultError::InvalidAccess)?;

        let mut pinned = Vec::new();
        for vaddr in pages {
            if let Err(err) = self.pin_page(&process, vaddr, addr, write) {
                for &vaddr in &pinned {
                    self.unpin_page(&process, vaddr);
                }
                return Err(err);
            }
            pinned.push(vaddr);
        }
        Ok(())
    }

    fn pin_page(
        &self,
        process: &UserProcess,
        vaddr: VirtAddr,
        buffer: usize,
        write: bool,
    ) -> Result<(), PageFaultError> {
        loop {
            {
                let _barrier = self.frames.eviction_barrier();
                let page_dir = process.page_dir();
                if let Some(frame) = page_dir.translate(vaddr) {
                    if write && !page_dir.is_writable(vaddr) {
                        return Err(PageFaultError::ProtectionViolation);
                    }
                    self.frames.set_pinned(frame, true);
                    return Ok(());
                }
            }

            // The page can be evicted again before we pin it, hence the loop.
            let fault = PageFault {
                addr: buffer.max(vaddr.as_usize()),
                present: false,
                write,
                user: false,
                stack_ptr: process.syscall_stack(),
            };
            self.handler.handle(process, &fault)?;
        }
    }

    pub fn unpin_user_range(&self, pid: Pid, addr: usize, len: usize) {
        let (Some(process), Some(pages)) = (self.registry.resolve(pid), user_pages(addr, len))
        else {
            return;
        };
        for vaddr in pages {
            self.unpin_page(&process, vaddr);
        }
    }

    fn unpin_page(&self, process: &UserProcess, vaddr: VirtAddr) {
        if let Some(frame) = process.page_dir().translate(vaddr) {
            self.frames.set_pinned(frame, false);
        }
    }

    pub fn fault_count(&self) -> usize {
        self.page_faults.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            page_faults: self.fault_count(),
            frames: self.frames.stats(),
            swap_capacity: self.swap.capacity(),
            swap_free: self.swap.free_slots(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn swap(&self) -> &SwapSpace {
        &self.swap
    }
}
