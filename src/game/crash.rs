//! Crash Point Generation
//!
//! Every round's secret crash point comes from here. A seeded PRNG draw
//! is blended with wall-clock jitter, then mapped through a bucketed
//! distribution onto a multiplier. The generator also owns the short
//! outcome history that drives the anti-streak rule.
//!
//! ## Distribution
//!
//! ```text
//! ┌────────────┬──────────────────┬───────┐
//! │ score      │ multiplier range │ share │
//! ├────────────┼──────────────────┼───────┤
//! │ 0.00-0.36  │ [ 1.00,  1.50)   │  36%  │
//! │ 0.36-0.63  │ [ 1.50,  2.20)   │  27%  │
//! │ 0.63-0.80  │ [ 2.20,  3.40)   │  17%  │
//! │ 0.80-0.92  │ [ 3.40,  5.60)   │  12%  │
//! │ 0.92-0.98  │ [ 5.60, 11.00)   │   6%  │
//! │ 0.98-1.00  │ [11.00, 50.00)   │   2%  │
//! └────────────┴──────────────────┴───────┘
//! ```
//!
//! Within a bucket the multiplier is linear in the score, so the whole
//! mapping is one piecewise-linear curve. Callers never learn the crash
//! point before the round crashes.

use std::collections::VecDeque;

use crate::core::fixed::{
    fixed_clamp, fixed_div, fixed_lerp, to_fixed, Fixed, FIXED_ONE, MULTIPLIER_MAX,
    MULTIPLIER_START, STREAK_LOW_THRESHOLD,
};
use crate::core::rng::DeterministicRng;

/// How many past outcomes the generator remembers.
pub const STREAK_WINDOW: usize = 6;

/// How many consecutive low outcomes trigger the forced-low draw.
pub const STREAK_TRIGGER: usize = 2;

/// Distribution table: (cumulative score threshold, range lo, range hi).
///
/// All values are Q16.16 integer literals; the derivation from the
/// percentages above is checked by `test_bucket_table`.
const BUCKETS: [(Fixed, Fixed, Fixed); 6] = [
    (23592, 65536, 98304),      // 36% -> [ 1.00,  1.50)
    (41287, 98304, 144179),     // 27% -> [ 1.50,  2.20)
    (52428, 144179, 222822),    // 17% -> [ 2.20,  3.40)
    (60293, 222822, 367001),    // 12% -> [ 3.40,  5.60)
    (64225, 367001, 720896),    //  6% -> [ 5.60, 11.00)
    (65536, 720896, 3276800),   //  2% -> [11.00, 50.00)
];

/// Map a score in [0, 1) onto a crash multiplier.
///
/// Pure function: the bucket is chosen by cumulative threshold, then
/// the score's position inside the bucket picks the value linearly.
/// Scores outside [0, 1) are clamped in.
pub fn sample_multiplier(score: Fixed) -> Fixed {
    let score = fixed_clamp(score, 0, FIXED_ONE - 1);

    let mut prev_cumulative = 0;
    for &(cumulative, lo, hi) in BUCKETS.iter() {
        if score < cumulative {
            let width = cumulative - prev_cumulative;
            let t = fixed_div(score - prev_cumulative, width);
            return fixed_lerp(lo, hi, t);
        }
        prev_cumulative = cumulative;
    }

    // The last threshold is FIXED_ONE and scores are clamped below it,
    // so the loop always returns.
    MULTIPLIER_MAX
}

/// Force a score into the lowest bucket's range [1.00, 1.50).
fn force_low(score: Fixed) -> Fixed {
    let score = fixed_clamp(score, 0, FIXED_ONE - 1);
    let (_, lo, hi) = BUCKETS[0];
    fixed_lerp(lo, hi, score)
}

/// Blend the PRNG draw with jitter, staying uniform on [0, 1).
///
/// Modular addition of anything to a uniform value is still uniform,
/// so the jitter decorrelates outcomes from the seed without bending
/// the published distribution.
#[inline]
fn blend(base: Fixed, jitter: Fixed) -> Fixed {
    (base + jitter) & (FIXED_ONE - 1)
}

/// Sub-millisecond wall clock bits as a score offset in [0, 1).
fn time_jitter() -> Fixed {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    (nanos & 0xFFFF) as Fixed
}

/// Generates crash points and tracks recent outcomes.
///
/// Owns all state the draw depends on: nothing outside this struct can
/// influence or predict the next crash point.
#[derive(Clone, Debug)]
pub struct CrashPointGenerator {
    rng: DeterministicRng,
    history: VecDeque<Fixed>,
}

impl Default for CrashPointGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl CrashPointGenerator {
    /// Create a generator seeded from boot entropy.
    pub fn new() -> Self {
        Self {
            rng: DeterministicRng::from_entropy(),
            history: VecDeque::with_capacity(STREAK_WINDOW),
        }
    }

    /// Create a generator with an explicit seed (replay and tests).
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: DeterministicRng::new(seed),
            history: VecDeque::with_capacity(STREAK_WINDOW),
        }
    }

    /// Draw the crash point for the next round.
    pub fn next_crash_point(&mut self) -> Fixed {
        self.next_with_jitter(time_jitter())
    }

    /// Draw with an explicit jitter value (replay and tests).
    pub fn next_with_jitter(&mut self, jitter: Fixed) -> Fixed {
        let base = self.rng.next_fixed(FIXED_ONE);
        let score = blend(base, jitter);

        let value = if self.in_low_streak() {
            force_low(score)
        } else {
            sample_multiplier(score)
        };

        // Contract: outputs stay inside the published range
        let value = fixed_clamp(value, MULTIPLIER_START, MULTIPLIER_MAX);
        self.record(value);
        value
    }

    /// Recent outcomes, oldest first. At most `STREAK_WINDOW` entries.
    pub fn last_outcomes(&self) -> Vec<Fixed> {
        self.history.iter().copied().collect()
    }

    /// True when the last `STREAK_TRIGGER` outcomes were all low.
    fn in_low_streak(&self) -> bool {
        if self.history.len() < STREAK_TRIGGER {
            return false;
        }
        self.history
            .iter()
            .rev()
            .take(STREAK_TRIGGER)
            .all(|&v| v < STREAK_LOW_THRESHOLD)
    }

    fn record(&mut self, value: Fixed) {
        if self.history.len() == STREAK_WINDOW {
            self.history.pop_front();
        }
        self.history.push_back(value);
    }
}

// =============================================================================
// TESTS
// =============================================================================
