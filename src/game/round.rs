//! Round State Machine
//!
//! A round moves through exactly three phases:
//!
//! ```text
//!   Waiting ──countdown hits 0──▶ Flying ──multiplier reaches──▶ Crashed
//!      ▲        (bets open)                 crash point                │
//!      └──────────────────── next round begins ──────────────────────┘
//! ```
//!
//! The struct holds the secret crash point but never exposes it before
//! the crash; callers see it only through [`Round::revealed_crash_point`].
//! Phase transitions happen exclusively through the tick methods.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::fixed::{fixed_mul, Fixed, GROWTH_BASE, GROWTH_FACTOR, MULTIPLIER_START};

/// Lifecycle phase of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// Countdown running, bets accepted.
    Waiting,
    /// Multiplier climbing, cash-outs accepted.
    Flying,
    /// Crash point revealed, bets settled, pause before the next round.
    Crashed,
}

impl RoundPhase {
    /// Lowercase name for log fields.
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundPhase::Waiting => "waiting",
            RoundPhase::Flying => "flying",
            RoundPhase::Crashed => "crashed",
        }
    }
}

/// Pacing and bet-admission tuning for every round.
#[derive(Clone, Debug)]
pub struct RoundConfig {
    /// Seconds of betting countdown before lift-off.
    pub countdown_secs: u32,
    /// Interval between multiplier updates while flying.
    pub flight_tick: Duration,
    /// Pause after a crash before the next round opens.
    pub crash_pause: Duration,
    /// Smallest accepted stake in minor units.
    pub min_bet: u64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            countdown_secs: 10,
            flight_tick: Duration::from_millis(100),
            crash_pause: Duration::from_secs(4),
            min_bet: 10,
        }
    }
}

impl RoundConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            countdown_secs: env_u64("SKYROCKET_COUNTDOWN_SECS")
                .map(|v| v as u32)
                .unwrap_or(defaults.countdown_secs),
            flight_tick: env_u64("SKYROCKET_FLIGHT_TICK_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.flight_tick),
            crash_pause: env_u64("SKYROCKET_CRASH_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.crash_pause),
            min_bet: env_u64("SKYROCKET_MIN_BET").unwrap_or(defaults.min_bet),
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Outcome of one countdown tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStep {
    /// Still counting; seconds remaining.
    Counting(u32),
    /// Countdown finished, the round is now flying.
    LiftOff,
}

/// Outcome of one flight tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightStep {
    /// Multiplier climbed to this value.
    Climbing(Fixed),
    /// Crash point reached; the round is over at this multiplier.
    Crashed(Fixed),
}

/// One betting round.
///
/// The crash point is decided at construction and kept private until
/// the round actually crashes.
#[derive(Debug, Clone)]
pub struct Round {
    id: u64,
    phase: RoundPhase,
    multiplier: Fixed,
    countdown_secs: u32,
    crash_point: Fixed,
    started_at: Option<DateTime<Utc>>,
}

impl Round {
    /// Open a new round in the Waiting phase.
    pub fn new(id: u64, crash_point: Fixed, countdown_secs: u32) -> Self {
        Self {
            id,
            phase: RoundPhase::Waiting,
            multiplier: MULTIPLIER_START,
            countdown_secs,
            crash_point,
            started_at: None,
        }
    }

    /// Sequential round id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current phase.
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    /// Current multiplier. 1.00x until lift-off, then climbing, frozen
    /// at the crash point after the crash.
    pub fn multiplier(&self) -> Fixed {
        self.multiplier
    }

    /// Seconds of countdown remaining. 0 once flying.
    pub fn countdown_secs(&self) -> u32 {
        self.countdown_secs
    }

    /// When the flight began. None until lift-off.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Bets are only admitted during the countdown.
    pub fn is_betting_open(&self) -> bool {
        self.phase == RoundPhase::Waiting
    }

    /// The crash point, visible only after the round has crashed.
    pub fn revealed_crash_point(&self) -> Option<Fixed> {
        match self.phase {
            RoundPhase::Crashed => Some(self.crash_point),
            _ => None,
        }
    }

    /// Advance the countdown by one second.
    ///
    /// Only valid while Waiting. The step that reaches zero flips the
    /// round to Flying and records the flight start time.
    pub fn tick_countdown(&mut self) -> CountdownStep {
        debug_assert_eq!(self.phase, RoundPhase::Waiting);

        self.countdown_secs = self.countdown_secs.saturating_sub(1);
        if self.countdown_secs == 0 {
            self.phase = RoundPhase::Flying;
            self.multiplier = MULTIPLIER_START;
            self.started_at = Some(Utc::now());
            CountdownStep::LiftOff
        } else {
            CountdownStep::Counting(self.countdown_secs)
        }
    }

    /// Advance the multiplier by one flight tick.
    ///
    /// The climb accelerates: each step adds a flat base plus a share
    /// of the current multiplier. The multiplier never overshoots the
    /// crash point; the tick that would pass it crashes the round at
    /// exactly that value.
    pub fn advance_flight(&mut self) -> FlightStep {
        debug_assert_eq!(self.phase, RoundPhase::Flying);

        let increment = GROWTH_BASE + fixed_mul(self.multiplier, GROWTH_FACTOR);
        let next = self.multiplier + increment;

        if next >= self.crash_point {
            self.multiplier = self.crash_point;
            self.phase = RoundPhase::Crashed;
            FlightStep::Crashed(self.crash_point)
        } else {
            self.multiplier = next;
            FlightStep::Climbing(next)
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
