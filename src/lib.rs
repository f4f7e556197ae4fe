//! # Skyrocket Crash-Game Server
//!
//! Authoritative round server for a multiplayer crash game: a shared
//! multiplier climbs from 1.00x toward a secret crash point, players
//! bet during a countdown window and cash out before the crash.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SKYROCKET SERVER                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Deterministic primitives                  │
//! │  ├── fixed.rs    - Q16.16 fixed-point arithmetic             │
//! │  └── rng.rs      - Deterministic Xorshift128+ PRNG           │
//! │                                                              │
//! │  game/           - Round logic (no I/O)                      │
//! │  ├── crash.rs    - Crash point generation, anti-streak rule  │
//! │  ├── round.rs    - Waiting/Flying/Crashed state machine      │
//! │  ├── bets.rs     - Per-round bet book                        │
//! │  └── chat.rs     - Bounded chat history                      │
//! │                                                              │
//! │  ledger/         - External store boundaries                 │
//! │  ├── mod.rs      - BalanceLedger / RoundHistorySink traits   │
//! │  ├── coordinator.rs - Bet placement and cash-out mediation   │
//! │  └── memory.rs   - In-process reference implementations      │
//! │                                                              │
//! │  network/        - Transport (non-deterministic)             │
//! │  ├── server.rs   - WebSocket server and round loop           │
//! │  ├── protocol.rs - JSON wire messages and validation         │
//! │  └── session.rs  - Game room, sessions, broadcasting         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority Model
//!
//! One `GameRoom` per process owns all round, bet, session, and chat
//! state behind a single lock. The round loop is the only source of
//! tick mutations, and the `BetCoordinator` is the only writer of bet
//! state and balance deltas, so bets, cash-outs, and phase transitions
//! never interleave destructively. Crash points are drawn from seeded
//! deterministic randomness and stay secret until the round crashes.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod ledger;
pub mod network;

// Re-export commonly used types
pub use core::fixed::{Fixed, FIXED_HALF, FIXED_ONE, FIXED_SCALE};
pub use core::rng::DeterministicRng;
pub use game::{Bet, BetBook, BetError, CrashPointGenerator, PlayerId, Round, RoundPhase};
pub use ledger::{BalanceLedger, BetCoordinator, RoundHistorySink, RoundRecord};
pub use network::{GameRoom, GameServer, ServerConfig};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
