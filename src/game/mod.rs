//! Game Logic Module
//!
//! Everything that decides round outcomes lives here, free of any
//! network or ledger concern.
//!
//! ## Module Structure
//!
//! - `crash`: Crash point generation and the anti-streak rule
//! - `round`: Round phases, countdown, and multiplier flight
//! - `bets`: Per-round bet book and cash-out accounting
//! - `chat`: Bounded chat history with join replay

pub mod bets;
pub mod chat;
pub mod crash;
pub mod round;

// Re-export key types
pub use bets::{Bet, BetBook, BetError, PlayerId};
pub use chat::{ChatBuffer, ChatEntry, ChatKind};
pub use crash::CrashPointGenerator;
pub use round::{CountdownStep, FlightStep, Round, RoundConfig, RoundPhase};
