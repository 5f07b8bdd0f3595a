use super::{Pid, ProcessRegistry, UserProcess};
use crate::sync::Mutex;
use alloc::{collections::BTreeMap, sync::Arc};

#[derive(Default)]
pub struct ProcessTable {
    content: Mutex<BTreeMap<Pid, Arc<UserProcess>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, process: Arc<UserProcess>) {
        let mut content = self.content.lock();
        let pid = process.pid();
        assert!(
            !content.contains_key(&pid),
            "process with pid {pid} already added to process table."
        );
        content.insert(pid, process);
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<UserProcess>> {
        self.content.lock().remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<UserProcess>> {
        self.content.lock().get(&pid).cloned()
    }

    pub fn len(&self) -> usize {
        self.content.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProcessRegistry for ProcessTable {
    fn resolve(&self, pid: Pid) -> Option<Arc<UserProcess>> {
        self.get(pid)
    }
}
