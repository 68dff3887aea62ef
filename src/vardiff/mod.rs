//! Per-connection variable difficulty.
//!
//! Each session owns one controller. Accepted shares are recorded as they
//! arrive; on a bounded cadence the controller compares the observed share
//! rate against the configured target band and proposes at most one
//! difficulty step (double or halve) per evaluation. The session applies a
//! proposed difficulty on the next job it sends, never to work already in
//! flight.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Rate above `target × HIGH_RATE_FACTOR` doubles the difficulty.
const HIGH_RATE_FACTOR: f64 = 2.0;
/// Rate below `target × LOW_RATE_FACTOR` halves it.
const LOW_RATE_FACTOR: f64 = 0.5;
/// How much share history the rate window keeps.
const WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct VardiffSettings {
    /// Desired seconds between shares.
    pub target_share_secs: f64,
    /// Evaluate after this many shares since the last evaluation...
    pub min_shares: u32,
    /// ...or after this long, whichever comes first.
    pub eval_interval: Duration,
    pub min_difficulty: f64,
    pub max_difficulty: f64,
}

/// Sliding-window share-rate tracker and difficulty stepper.
pub struct DifficultyController {
    settings: VardiffSettings,
    difficulty: f64,
    shares: VecDeque<Instant>,
    shares_since_eval: u32,
    last_eval: Instant,
}

impl DifficultyController {
    /// Starts at the configured pool default, not at anything derived from
    /// history.
    pub fn new(start_difficulty: f64, settings: VardiffSettings) -> Self {
        DifficultyController {
            settings,
            difficulty: start_difficulty,
            shares: VecDeque::new(),
            shares_since_eval: 0,
            last_eval: Instant::now(),
        }
    }

    pub fn difficulty(&self) -> f64 {
        self.difficulty
    }

    /// Record one accepted share.
    pub fn record_share(&mut self, now: Instant) {
        self.shares.push_back(now);
        self.shares_since_eval = self.shares_since_eval.saturating_add(1);
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some(first) = self.shares.front() {
            if now.duration_since(*first) > WINDOW {
                self.shares.pop_front();
            } else {
                break;
            }
        }
    }

    /// Evaluate the current rate; returns the new difficulty when a step is
    /// due. At most one step (×2 or ÷2) per evaluation, clamped to the
    /// configured bounds.
    pub fn evaluate(&mut self, now: Instant) -> Option<f64> {
        let due = self.shares_since_eval >= self.settings.min_shares
            || now.duration_since(self.last_eval) >= self.settings.eval_interval;
        if !due {
            return None;
        }
        self.prune(now);

        let span = self
            .shares
            .front()
            .map(|first| now.duration_since(*first).as_secs_f64())
            .unwrap_or(0.0)
            .max(now.duration_since(self.last_eval).as_secs_f64())
            .max(1.0);
        let observed_rate = self.shares.len() as f64 / span;
        let target_rate = 1.0 / self.settings.target_share_secs;

        self.shares_since_eval = 0;
        self.last_eval = now;

        let next = if observed_rate > target_rate * HIGH_RATE_FACTOR {
            (self.difficulty * 2.0).min(self.settings.max_difficulty)
        } else if observed_rate < target_rate * LOW_RATE_FACTOR {
            (self.difficulty / 2.0).max(self.settings.min_difficulty)
        } else {
            return None;
        };

        if next == self.difficulty {
            return None;
        }
        self.difficulty = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> VardiffSettings {
        VardiffSettings {
            target_share_secs: 30.0,
            min_shares: 8,
            eval_interval: Duration::from_secs(120),
            min_difficulty: 1_000.0,
            max_difficulty: 100_000_000.0,
        }
    }

    #[test]
    fn test_no_evaluation_before_cadence() {
        let mut ctl = DifficultyController::new(10_000.0, settings());
        let now = Instant::now();
        for _ in 0..3 {
            ctl.record_share(now);
        }
        assert_eq!(ctl.evaluate(now), None);
        assert_eq!(ctl.difficulty(), 10_000.0);
    }

    #[test]
    fn test_fast_shares_double_once() {
        let mut ctl = DifficultyController::new(10_000.0, settings());
        let start = Instant::now();
        // 8 shares in ~8 seconds: far above 1 share / 30 s.
        for i in 0..8 {
            ctl.record_share(start + Duration::from_secs(i));
        }
        let new = ctl.evaluate(start + Duration::from_secs(8));
        assert_eq!(new, Some(20_000.0));
        // Exactly one step, never more, regardless of how extreme the rate.
        assert_eq!(ctl.difficulty(), 20_000.0);
    }

    #[test]
    fn test_slow_shares_halve_once() {
        let mut ctl = DifficultyController::new(10_000.0, settings());
        let start = Instant::now();
        ctl.record_share(start);
        // One share over the full 120 s interval: below half the target rate.
        let new = ctl.evaluate(start + Duration::from_secs(121));
        assert_eq!(new, Some(5_000.0));
    }

    #[test]
    fn test_in_band_rate_leaves_difficulty_unchanged() {
        let mut ctl = DifficultyController::new(10_000.0, settings());
        let start = Instant::now();
        // 8 shares at ~30 s apart: right on target.
        for i in 0..8u64 {
            ctl.record_share(start + Duration::from_secs(i * 30));
        }
        assert_eq!(ctl.evaluate(start + Duration::from_secs(8 * 30)), None);
        assert_eq!(ctl.difficulty(), 10_000.0);
    }

    #[test]
    fn test_bounds_are_never_exceeded() {
        let mut ctl = DifficultyController::new(1_500.0, settings());
        let mut now = Instant::now();
        // Starve it repeatedly; difficulty must floor at min_difficulty.
        for _ in 0..10 {
            now += Duration::from_secs(300);
            ctl.evaluate(now);
            assert!(ctl.difficulty() >= 1_000.0);
        }
        assert_eq!(ctl.difficulty(), 1_000.0);

        // Flood it; difficulty must cap at max_difficulty.
        let mut ctl = DifficultyController::new(90_000_000.0, settings());
        let mut now = Instant::now();
        for round in 0..10u64 {
            for i in 0..8u64 {
                ctl.record_share(now + Duration::from_millis(round * 8_000 + i));
            }
            now += Duration::from_secs(8);
            ctl.evaluate(now);
            assert!(ctl.difficulty() <= 100_000_000.0);
        }
        assert_eq!(ctl.difficulty(), 100_000_000.0);
    }

    #[test]
    fn test_step_is_at_most_double_or_half() {
        let mut ctl = DifficultyController::new(10_000.0, settings());
        let start = Instant::now();
        for i in 0..8 {
            ctl.record_share(start + Duration::from_millis(i * 10));
        }
        let before = ctl.difficulty();
        let after = ctl.evaluate(start + Duration::from_secs(1)).unwrap();
        assert!(after / before <= 2.0 + f64::EPSILON);
    }
}
