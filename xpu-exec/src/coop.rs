//! Collective operations of a lock-step thread group.
//!
//! Kernel code never talks to other lanes directly; it goes through a
//! [`CooperativeGroup`]. [`LockstepWarp`] emulates one warp on a single host thread: the
//! lanes' inputs arrive as a slice, which stands in for the shared scratch area, and each
//! call returns only after every lane's contribution has been folded in.

use xpu_types::WARP_SIZE;

pub trait CooperativeGroup {
    /// Number of lanes.
    fn size(&self) -> usize;

    /// Inclusive prefix sums of `values` (one per active lane) and the group total.
    fn stair_add(&self, values: &[u32]) -> (Vec<u32>, u32);

    /// Bit `i` set iff lane `i` voted `true`.
    fn ballot(&self, votes: &[bool]) -> u32;

    /// The value held by `src_lane`, as seen by every lane.
    fn broadcast<T: Copy>(&self, values: &[T], src_lane: usize) -> Option<T>;

    fn reduce_max(&self, values: &[u32]) -> u32;
}

#[derive(Debug, Clone, Copy)]
pub struct LockstepWarp {
    width: usize,
}

impl Default for LockstepWarp {
    fn default() -> Self {
        Self { width: WARP_SIZE }
    }
}

impl LockstepWarp {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn lanes<'v, T>(&self, values: &'v [T]) -> &'v [T] {
        &values[..values.len().min(self.width)]
    }
}

impl CooperativeGroup for LockstepWarp {
    #[inline]
    fn size(&self) -> usize {
        self.width
    }

    fn stair_add(&self, values: &[u32]) -> (Vec<u32>, u32) {
        let mut sums = Vec::with_capacity(self.width);
        let mut total = 0u32;
        for &v in self.lanes(values) {
            total = total.saturating_add(v);
            sums.push(total);
        }
        (sums, total)
    }

    fn ballot(&self, votes: &[bool]) -> u32 {
        self.lanes(votes)
            .iter()
            .enumerate()
            .fold(0u32, |mask, (lane, &v)| if v { mask | (1 << lane) } else { mask })
    }

    fn broadcast<T: Copy>(&self, values: &[T], src_lane: usize) -> Option<T> {
        self.lanes(values).get(src_lane).copied()
    }

    fn reduce_max(&self, values: &[u32]) -> u32 {
        self.lanes(values).iter().copied().max().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stair_add_is_inclusive() {
        let warp = LockstepWarp::new();
        let (sums, total) = warp.stair_add(&[3, 0, 5, 2]);
        assert_eq!(sums, vec![3, 3, 8, 10]);
        assert_eq!(total, 10);
        assert_eq!(warp.stair_add(&[]), (vec![], 0));
    }

    #[test]
    fn ballot_and_reductions() {
        let warp = LockstepWarp::new();
        assert_eq!(warp.ballot(&[true, false, true]), 0b101);
        let all = vec![true; 40];
        // lanes past the warp width do not vote
        assert_eq!(warp.ballot(&all), u32::MAX);
        assert_eq!(warp.reduce_max(&[4, 9, 1]), 9);
        assert_eq!(warp.broadcast(&[7u8, 8, 9], 1), Some(8));
        assert_eq!(warp.broadcast(&[7u8], 5), None);
    }
}
