use kidneyos_shared::mem::MAX_USER_STACK_SIZE;

/// Timer ticks between two aging passes over the frame table.
pub const AGING_INTERVAL_TICKS: u64 = 100;

/// Number of frames in the user pool when nothing else is configured.
pub const DEFAULT_USER_FRAMES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Frames in the user pool shared by every process.
    pub user_frames: usize,
    /// How far below the top of user space the stack may grow.
    pub max_stack_size: usize,
    pub aging_interval: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_frames: DEFAULT_USER_FRAMES,
            max_stack_size: MAX_USER_STACK_SIZE,
            aging_interval: AGING_INTERVAL_TICKS,
        }
    }
}

impl VmConfig {
    pub fn with_user_frames(self, user_frames: usize) -> Self {
        Self {
            user_frames,
            ..self
        }
    }

    pub fn with_max_stack_size(self, max_stack_size: usize) -> Self {
        Self {
            max_stack_size,
            ..self
        }
    }

    pub fn with_aging_interval(self, aging_interval: u64) -> Self {
        assert!(aging_interval > 0, "aging interval must be at least one tick");
        Self {
            aging_interval,
            ..self
        }
    }
}
