//! Scheduling policies.

use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64Mcg;
use racetrap_target::PtraceEvent;

use crate::thread::Thread;

/// Chooses which runnable thread continues at a scheduling point.
pub trait ThreadSelector {
    /// Called once at the start of every round, before the first pick.
    fn round_started(&mut self) {}

    /// Return an index into `candidates`.
    ///
    /// `current` is the position of the running thread among the candidates,
    /// or `None` on the first pick of a round and whenever the running thread
    /// cannot continue (it exited or blocked). `event` is the stop that caused
    /// the decision, absent on the first pick.
    fn select_thread(
        &mut self,
        current: Option<usize>,
        candidates: &[&Thread],
        elapsed_micros: u64,
        event: Option<&PtraceEvent>,
    ) -> usize;

    /// Short description for logs and run summaries.
    fn describe(&self) -> String {
        "custom".to_string()
    }
}

/// Uniformly random choice among the candidates.
pub struct RandomSelector {
    rng: Pcg64Mcg,
    seed: u64,
}

impl RandomSelector {
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Pcg64Mcg::seed_from_u64(seed), seed }
    }

    /// Seed from the thread-local generator. The seed is kept so a failing
    /// run can be replayed with [`with_seed`](Self::with_seed).
    pub fn from_entropy() -> Self {
        Self::with_seed(rand::random())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl ThreadSelector for RandomSelector {
    fn select_thread(&mut self, _current: Option<usize>, candidates: &[&Thread], _elapsed: u64, _event: Option<&PtraceEvent>) -> usize {
        if candidates.len() <= 1 {
            return 0;
        }
        self.rng.gen_range(0..candidates.len())
    }

    fn describe(&self) -> String {
        format!("random(seed={})", self.seed)
    }
}

/// Bucketed round-robin.
///
/// Runs the current thread for `buckets[i]` scheduling points, then moves to
/// the next candidate and to the next bucket size, cycling through the
/// buckets. The interleaving depends only on the buckets and the code.
pub struct BucketSelector {
    buckets: Vec<u32>,
    bucket: usize,
    remaining: u32,
    last: Option<usize>,
}

impl BucketSelector {
    /// An empty bucket list behaves like `[1]`.
    pub fn new(buckets: Vec<u32>) -> Self {
        let buckets = if buckets.is_empty() { vec![1] } else { buckets };
        let remaining = buckets[0];
        Self { buckets, bucket: 0, remaining, last: None }
    }

    pub fn buckets(&self) -> &[u32] {
        &self.buckets
    }

    fn next_bucket(&mut self) {
        self.bucket = (self.bucket + 1) % self.buckets.len();
        self.remaining = self.buckets[self.bucket];
    }
}

impl ThreadSelector for BucketSelector {
    fn round_started(&mut self) {
        self.bucket = 0;
        self.remaining = self.buckets[0];
        self.last = None;
    }

    fn select_thread(&mut self, current: Option<usize>, candidates: &[&Thread], _elapsed: u64, _event: Option<&PtraceEvent>) -> usize {
        let count = candidates.len().max(1);
        let pick = match current {
            Some(current) if self.remaining > 0 => {
                self.remaining -= 1;
                current
            }
            Some(current) => {
                self.next_bucket();
                (current + 1) % count
            }
            // The running thread left; whoever slid into its position takes over.
            None => {
                self.remaining = self.buckets[self.bucket];
                self.last.map_or(0, |last| last % count)
            }
        };
        self.last = Some(pick);
        pick
    }

    fn describe(&self) -> String {
        let sizes: Vec<String> = self.buckets.iter().map(|b| b.to_string()).collect();
        format!("buckets({})", sizes.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::ThreadId;

    fn threads(n: u32) -> Vec<Thread> {
        (0..n).map(|i| Thread::new(ThreadId(i), 0x1000, i as u64, 4096, 0)).collect()
    }

    fn picks(selector: &mut dyn ThreadSelector, n: u32, steps: usize) -> Vec<usize> {
        let threads = threads(n);
        let refs: Vec<&Thread> = threads.iter().collect();
        let mut current = selector.select_thread(None, &refs, 0, None);
        let mut out = vec![current];
        for _ in 0..steps {
            current = selector.select_thread(Some(current), &refs, 0, Some(&PtraceEvent::synthetic()));
            out.push(current);
        }
        out
    }

    #[test]
    fn test_random_stays_in_range() {
        let mut selector = RandomSelector::with_seed(7);
        let seen = picks(&mut selector, 3, 200);
        assert!(seen.iter().all(|&i| i < 3));
        for i in 0..3 {
            assert!(seen.contains(&i), "thread {} never picked", i);
        }
    }

    #[test]
    fn test_random_single_candidate() {
        let mut selector = RandomSelector::with_seed(1);
        assert!(picks(&mut selector, 1, 20).iter().all(|&i| i == 0));
    }

    #[test]
    fn test_random_seed_replays() {
        let a = picks(&mut RandomSelector::with_seed(42), 4, 50);
        let b = picks(&mut RandomSelector::with_seed(42), 4, 50);
        assert_eq!(a, b);
        assert_eq!(RandomSelector::with_seed(42).describe(), "random(seed=42)");
    }

    #[test]
    fn test_buckets_round_robin() {
        let mut selector = BucketSelector::new(vec![2, 0, 1]);
        // Stay 2, switch; bucket 0 switches immediately; bucket 1 stays once.
        assert_eq!(picks(&mut selector, 3, 8), vec![0, 0, 0, 1, 2, 2, 0, 0, 0]);
    }

    #[test]
    fn test_buckets_deterministic_across_rounds() {
        let mut selector = BucketSelector::new(vec![1, 3]);
        let first = picks(&mut selector, 2, 12);
        selector.round_started();
        let second = picks(&mut selector, 2, 12);
        assert_eq!(first, second);
    }

    #[test]
    fn test_buckets_after_thread_left() {
        let mut selector = BucketSelector::new(vec![0]);
        let threads = threads(3);
        let refs: Vec<&Thread> = threads.iter().collect();
        assert_eq!(selector.select_thread(None, &refs, 0, None), 0);
        assert_eq!(selector.select_thread(Some(0), &refs, 0, None), 1);
        assert_eq!(selector.select_thread(Some(1), &refs, 0, None), 2);
        // Thread 2 exits: two candidates remain, wrap to the first.
        assert_eq!(selector.select_thread(None, &refs[..2], 0, None), 0);
    }

    #[test]
    fn test_empty_buckets_default() {
        let selector = BucketSelector::new(vec![]);
        assert_eq!(selector.buckets(), &[1]);
        assert_eq!(selector.describe(), "buckets(1)");
    }
}
