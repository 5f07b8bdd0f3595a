use crate::mem::frame_table::FrameId;

/// A frame that may be evicted, as seen by the replacement policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VictimCandidate {
    pub id: FrameId,
    pub usage: u32,
}

pub trait PageReplacementPolicy: Send {
    /// Picks the frame to evict. `candidates` holds only frames that are ready
    /// and unpinned, in frame table order.
    fn select_victim(&mut self, candidates: &[VictimCandidate]) -> Option<FrameId>;

    /// The new usage counter of a frame after one aging tick.
    fn age(&mut self, usage: u32, accessed: bool) -> u32;
}

/// Evicts the frame that was seen accessed on the fewest aging ticks.
#[derive(Debug, Default)]
pub struct Aging;

impl PageReplacementPolicy for Aging {
    fn select_victim(&mut self, candidates: &[VictimCandidate]) -> Option<FrameId> {
        let mut victim: Option<&VictimCandidate> = None;
        for candidate in candidates {
            // Strictly lower, so the first of equal counters wins.
            if victim.map_or(true, |v| candidate.usage < v.usage) {
                victim = Some(candidate);
            }
        }
        victim.map(|v| v.id)
    }

    fn age(&mut self, usage: u32, accessed: bool) -> u32 {
        if accessed {
            usage.saturating_add(1)
        } else {
            usage
        }
    }
}
