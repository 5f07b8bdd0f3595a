use core::sync::atomic::{AtomicU64, Ordering};

/// Counts timer interrupts and says when the frame table is due for aging.
#[derive(Debug)]
pub struct AgingClock {
    ticks: AtomicU64,
    interval: u64,
}

impl AgingClock {
    pub const fn new(interval: u64) -> Self {
        Self {
            ticks: AtomicU64::new(0),
            interval,
        }
    }

    /// Records one tick. Returns `true` on every `interval`-th tick.
    pub fn tick(&self) -> bool {
        let ticks = self.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        ticks % self.interval == 0
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_every_interval() {
        let clock = AgingClock::new(3);
        let fired: Vec<bool> = (0..7).map(|_| clock.tick()).collect();
        assert_eq!(fired, [false, false, true, false, false, true, false]);
        assert_eq!(clock.ticks(), 7);
    }
}
