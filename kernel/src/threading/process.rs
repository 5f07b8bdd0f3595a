use crate::{mem::supplemental::SupplementalPageTable, paging::AddressSpace, sync::Mutex};
use alloc::{string::String, sync::Arc};
use core::sync::atomic::{AtomicUsize, Ordering};
use kidneyos_shared::mem::USER_STACK_TOP;

pub type Pid = u16;

pub struct UserProcess {
    pid: Pid,
    name: String,
    page_dir: Arc<dyn AddressSpace>,
    spt: Mutex<SupplementalPageTable>,
    /// The user stack pointer saved on the last entry into the kernel. Faults
    /// taken by the kernel on user buffers use it for stack growth.
    syscall_esp: AtomicUsize,
}

impl UserProcess {
    pub fn new(pid: Pid, name: impl Into<String>, page_dir: Arc<dyn AddressSpace>) -> Self {
        Self {
            pid,
            name: name.into(),
            page_dir,
            spt: Mutex::new(SupplementalPageTable::new()),
            syscall_esp: AtomicUsize::new(USER_STACK_TOP),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn page_dir(&self) -> &dyn AddressSpace {
        &*self.page_dir
    }

    pub fn spt(&self) -> &Mutex<SupplementalPageTable> {
        &self.spt
    }

    pub fn syscall_stack(&self) -> usize {
        self.syscall_esp.load(Ordering::Acquire)
    }

    /// Called on every system call entry with the user `esp`.
    pub fn set_syscall_stack(&self, esp: usize) {
        self.syscall_esp.store(esp, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paging::PageDirectory;

    #[test]
    fn test_new_process() {
        let process = UserProcess::new(3, "init", Arc::new(PageDirectory::new()));
        assert_eq!(process.pid(), 3);
        assert_eq!(process.name(), "init");
        assert!(process.spt().lock().is_empty());
        assert_eq!(process.syscall_stack(), USER_STACK_TOP);

        process.set_syscall_stack(0x7FFF_F000);
        assert_eq!(process.syscall_stack(), 0x7FFF_F000);
    }
}
