use crate::cancel::CancelToken;
use crate::SyncError;
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{info, warn};

pub enum RoundOutcome {
    /// The round ran to completion; these units still fail.
    Finished(BTreeSet<u32>),
    /// The round observed cancellation before finishing.
    Interrupted,
}

/// One repair attempt over the working set, plus persistence of the loop's progress.
pub trait RepairRound {
    fn repair(&mut self, failing: &BTreeSet<u32>) -> Result<RoundOutcome, SyncError>;

    /// Called after every round with the updated counter and working set.
    fn checkpoint(&mut self, retry_count: u32, failing: &BTreeSet<u32>) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvergenceOutcome {
    Converged { rounds: u32 },
    CeilingReached { remaining: BTreeSet<u32>, rounds: u32 },
    Interrupted { remaining: BTreeSet<u32> },
}

impl ConvergenceOutcome {
    pub fn remaining(&self) -> BTreeSet<u32> {
        match self {
            ConvergenceOutcome::Converged { .. } => BTreeSet::new(),
            ConvergenceOutcome::CeilingReached { remaining, .. } | ConvergenceOutcome::Interrupted { remaining } => {
                remaining.clone()
            }
        }
    }
}

/// Bounded repair loop over the set of failing units.
///
/// A round that shrinks the failing set resets the retry counter. A round that does not
/// (same size or larger, even with different members) increments it, and the loop gives
/// up once the counter reaches the ceiling.
#[derive(Debug, Clone)]
pub struct ConvergenceController {
    ceiling: u32,
    settle_delay: Duration,
}

impl ConvergenceController {
    pub fn new(ceiling: u32, settle_delay: Duration) -> Self {
        Self { ceiling, settle_delay }
    }

    /// Drive repair rounds until the working set is empty, the ceiling is hit, or the
    /// run is cancelled. `retry_count` is the persisted counter and is updated in place.
    pub fn run<R: RepairRound>(
        &self,
        initial: BTreeSet<u32>,
        retry_count: &mut u32,
        round: &mut R,
        cancel: &CancelToken,
    ) -> Result<ConvergenceOutcome, SyncError> {
        let mut failing = initial;
        let mut rounds = 0u32;

        loop {
            if failing.is_empty() {
                return Ok(ConvergenceOutcome::Converged { rounds });
            }
            if *retry_count >= self.ceiling {
                return Ok(ConvergenceOutcome::CeilingReached { remaining: failing, rounds });
            }
            if cancel.is_cancelled() {
                return Ok(ConvergenceOutcome::Interrupted { remaining: failing });
            }

            info!(
                round = rounds + 1,
                failing = failing.len(),
                attempt = *retry_count + 1,
                ceiling = self.ceiling,
                "repair round starting"
            );

            let still_failing = match round.repair(&failing)? {
                RoundOutcome::Finished(set) => set,
                RoundOutcome::Interrupted => return Ok(ConvergenceOutcome::Interrupted { remaining: failing }),
            };
            rounds += 1;

            if still_failing.is_empty() {
                round.checkpoint(*retry_count, &still_failing)?;
                info!(rounds, "all failing units repaired");
                return Ok(ConvergenceOutcome::Converged { rounds });
            }

            if still_failing.len() >= failing.len() {
                *retry_count += 1;
                warn!(
                    before = failing.len(),
                    after = still_failing.len(),
                    retry_count = *retry_count,
                    "repair round made no progress"
                );
            } else {
                *retry_count = 0;
                info!(before = failing.len(), after = still_failing.len(), "repair round made progress");
            }

            failing = still_failing;
            round.checkpoint(*retry_count, &failing)?;

            if *retry_count >= self.ceiling {
                warn!(remaining = failing.len(), ceiling = self.ceiling, "retry ceiling reached");
                return Ok(ConvergenceOutcome::CeilingReached { remaining: failing, rounds });
            }

            if !self.settle_delay.is_zero() && cancel.sleep(self.settle_delay) {
                return Ok(ConvergenceOutcome::Interrupted { remaining: failing });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Plays back a fixed sequence of round results and records checkpoints.
    struct Scripted {
        results: VecDeque<BTreeSet<u32>>,
        checkpoints: Vec<(u32, usize)>,
        calls: usize,
    }

    impl Scripted {
        fn new(results: Vec<Vec<u32>>) -> Self {
            Self {
                results: results.into_iter().map(|r| r.into_iter().collect()).collect(),
                checkpoints: Vec::new(),
                calls: 0,
            }
        }
    }

    impl RepairRound for Scripted {
        fn repair(&mut self, failing: &BTreeSet<u32>) -> Result<RoundOutcome, SyncError> {
            self.calls += 1;
            Ok(RoundOutcome::Finished(self.results.pop_front().unwrap_or_else(|| failing.clone())))
        }

        fn checkpoint(&mut self, retry_count: u32, failing: &BTreeSet<u32>) -> Result<(), SyncError> {
            self.checkpoints.push((retry_count, failing.len()));
            Ok(())
        }
    }

    fn controller() -> ConvergenceController {
        ConvergenceController::new(3, Duration::ZERO)
    }

    #[test]
    fn test_empty_set_converges_without_rounds() {
        let mut round = Scripted::new(vec![]);
        let mut retry = 0;
        let outcome = controller().run(BTreeSet::new(), &mut retry, &mut round, &CancelToken::new()).unwrap();
        assert_eq!(outcome, ConvergenceOutcome::Converged { rounds: 0 });
        assert_eq!(round.calls, 0);
    }

    #[test]
    fn test_progress_resets_counter_then_stagnation_hits_ceiling() {
        let initial: BTreeSet<u32> = (1..=10).collect();
        let seven: Vec<u32> = (4..=10).collect();
        let mut round = Scripted::new(vec![seven.clone(), seven.clone(), seven.clone(), seven.clone()]);
        let mut retry = 2;

        let outcome = controller().run(initial, &mut retry, &mut round, &CancelToken::new()).unwrap();

        assert_eq!(
            outcome,
            ConvergenceOutcome::CeilingReached { remaining: seven.into_iter().collect(), rounds: 4 }
        );
        assert_eq!(retry, 3);
        assert_eq!(round.checkpoints, vec![(0, 7), (1, 7), (2, 7), (3, 7)]);
    }

    #[test]
    fn test_churn_with_same_size_counts_as_no_progress() {
        let initial: BTreeSet<u32> = [1, 2].into_iter().collect();
        let mut round = Scripted::new(vec![vec![3, 4], vec![5, 6], vec![7, 8]]);
        let mut retry = 0;

        let outcome = controller().run(initial, &mut retry, &mut round, &CancelToken::new()).unwrap();
        assert_eq!(outcome.remaining(), [7, 8].into_iter().collect());
        assert!(matches!(outcome, ConvergenceOutcome::CeilingReached { rounds: 3, .. }));
    }

    #[test]
    fn test_growth_counts_as_no_progress() {
        let initial: BTreeSet<u32> = [1].into_iter().collect();
        let mut round = Scripted::new(vec![vec![1, 2], vec![]]);
        let mut retry = 0;

        let outcome = controller().run(initial, &mut retry, &mut round, &CancelToken::new()).unwrap();
        assert_eq!(outcome, ConvergenceOutcome::Converged { rounds: 2 });
        assert_eq!(round.checkpoints, vec![(1, 2), (1, 0)]);
    }

    #[test]
    fn test_steady_shrinkage_is_unbounded() {
        let initial: BTreeSet<u32> = (1..=8).collect();
        let rounds: Vec<Vec<u32>> = (1..8).rev().map(|n| (1..=n).collect()).chain(std::iter::once(vec![])).collect();
        let mut round = Scripted::new(rounds);
        let mut retry = 0;

        let outcome = controller().run(initial, &mut retry, &mut round, &CancelToken::new()).unwrap();
        assert_eq!(outcome, ConvergenceOutcome::Converged { rounds: 8 });
        assert_eq!(retry, 0);
    }

    #[test]
    fn test_stagnation_bounded_regardless_of_size() {
        for size in [1u32, 50, 1000] {
            let initial: BTreeSet<u32> = (1..=size).collect();
            let mut round = Scripted::new(vec![]);
            let mut retry = 0;
            let outcome = controller().run(initial, &mut retry, &mut round, &CancelToken::new()).unwrap();
            assert!(matches!(outcome, ConvergenceOutcome::CeilingReached { rounds: 3, .. }));
            assert_eq!(round.calls, 3);
        }
    }

    #[test]
    fn test_counter_already_at_ceiling_runs_nothing() {
        let initial: BTreeSet<u32> = [1].into_iter().collect();
        let mut round = Scripted::new(vec![]);
        let mut retry = 3;
        let outcome = controller().run(initial, &mut retry, &mut round, &CancelToken::new()).unwrap();
        assert!(matches!(outcome, ConvergenceOutcome::CeilingReached { rounds: 0, .. }));
        assert_eq!(round.calls, 0);
    }

    #[test]
    fn test_cancellation_between_rounds() {
        let initial: BTreeSet<u32> = [1, 2].into_iter().collect();
        let mut round = Scripted::new(vec![]);
        let mut retry = 0;
        let cancel = CancelToken::new();
        cancel.cancel();

        let outcome = controller().run(initial.clone(), &mut retry, &mut round, &cancel).unwrap();
        assert_eq!(outcome, ConvergenceOutcome::Interrupted { remaining: initial });
        assert_eq!(round.calls, 0);
    }

    #[test]
    fn test_cancellation_cuts_settle_delay_short() {
        let initial: BTreeSet<u32> = [1, 2].into_iter().collect();
        let mut round = Scripted::new(vec![vec![2]]);
        let mut retry = 0;
        let cancel = CancelToken::new();
        let handle = cancel.clone();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            handle.cancel();
        });

        let started = std::time::Instant::now();
        let controller = ConvergenceController::new(3, Duration::from_secs(60));
        let outcome = controller.run(initial, &mut retry, &mut round, &cancel).unwrap();

        assert_eq!(outcome, ConvergenceOutcome::Interrupted { remaining: [2].into_iter().collect() });
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(round.calls, 1);
        assert_eq!(round.checkpoints, vec![(0, 1)]);
        canceller.join().unwrap();
    }
}
