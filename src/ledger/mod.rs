//! Ledger and History Boundaries
//!
//! The round server never owns player balances or long-term round
//! history; both live behind the traits in this module. The contract
//! that matters is atomicity at the call boundary: `debit` is a single
//! check-and-debit, never a read followed by a write, so there is no
//! race window for the server to inherit.
//!
//! [`memory`] provides in-process implementations for tests and demo
//! deployments; production wires these traits to the platform's stores.

use futures_util::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

use crate::core::fixed::Fixed;
use crate::game::bets::PlayerId;

pub mod coordinator;
pub mod memory;

pub use coordinator::BetCoordinator;
pub use memory::{MemoryHistory, MemoryLedger};

/// Why a balance operation failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The player's balance does not cover the debit.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// The store could not complete the operation.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Why a history write failed. Never fatal to gameplay.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HistoryError {
    /// The sink could not complete the write.
    #[error("history sink unavailable: {0}")]
    Unavailable(String),
}

/// One settled bet as persisted to long-term history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoundRecord {
    /// Internal player key.
    pub player: PlayerId,
    /// The round the bet rode.
    pub round_id: u64,
    /// Stake in minor units.
    pub bet_amount: u64,
    /// Multiplier achieved at cash-out; 0 for a loss.
    pub multiplier: Fixed,
    /// Payout in minor units; 0 for a loss.
    pub win_amount: u64,
    /// Demo bets settle like any other but carry no balance deltas.
    pub is_demo: bool,
}

/// External system of record for player balances.
///
/// Both operations must be atomic at the call boundary: a debit either
/// moves the full amount or moves nothing.
pub trait BalanceLedger: Send + Sync {
    /// Atomically check the balance and take `amount` from it.
    fn debit(&self, player: PlayerId, amount: u64) -> BoxFuture<'_, Result<(), LedgerError>>;

    /// Atomically add `amount` to the player's balance.
    fn credit(&self, player: PlayerId, amount: u64) -> BoxFuture<'_, Result<(), LedgerError>>;
}

/// Persistence sink for per-bet round history.
///
/// Writes are fire-and-forget tolerant: callers log failures and move
/// on rather than blocking the next round.
pub trait RoundHistorySink: Send + Sync {
    /// Persist one settled bet.
    fn record(&self, record: RoundRecord) -> BoxFuture<'_, Result<(), HistoryError>>;
}
