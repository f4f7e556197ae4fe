//! In-Process Ledger and History
//!
//! Reference implementations of the ledger boundary, used by tests and
//! demo deployments. One mutex per store makes every operation atomic
//! at the call boundary, which is exactly the contract production
//! implementations must also honor.

use std::collections::BTreeMap;

use futures_util::future::BoxFuture;
use tokio::sync::Mutex;

use crate::game::bets::PlayerId;

use super::{BalanceLedger, HistoryError, LedgerError, RoundHistorySink, RoundRecord};

/// Balance store backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    balances: Mutex<BTreeMap<PlayerId, u64>>,
}

impl MemoryLedger {
    /// An empty ledger; every unknown player has balance 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a player's balance outright (test and demo setup).
    pub async fn set_balance(&self, player: PlayerId, amount: u64) {
        self.balances.lock().await.insert(player, amount);
    }

    /// Current balance, 0 for unknown players.
    pub async fn balance(&self, player: PlayerId) -> u64 {
        self.balances.lock().await.get(&player).copied().unwrap_or(0)
    }
}

impl BalanceLedger for MemoryLedger {
    fn debit(&self, player: PlayerId, amount: u64) -> BoxFuture<'_, Result<(), LedgerError>> {
        Box::pin(async move {
            let mut balances = self.balances.lock().await;
            let balance = balances.entry(player).or_insert(0);
            if *balance < amount {
                return Err(LedgerError::InsufficientFunds);
            }
            *balance -= amount;
            Ok(())
        })
    }

    fn credit(&self, player: PlayerId, amount: u64) -> BoxFuture<'_, Result<(), LedgerError>> {
        Box::pin(async move {
            let mut balances = self.balances.lock().await;
            let balance = balances.entry(player).or_insert(0);
            *balance = balance.saturating_add(amount);
            Ok(())
        })
    }
}

/// History sink backed by a mutex-guarded vec.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<RoundRecord>>,
}

impl MemoryHistory {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far, in write order.
    pub async fn records(&self) -> Vec<RoundRecord> {
        self.records.lock().await.clone()
    }
}

impl RoundHistorySink for MemoryHistory {
    fn record(&self, record: RoundRecord) -> BoxFuture<'_, Result<(), HistoryError>> {
        Box::pin(async move {
            self.records.lock().await.push(record);
            Ok(())
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================
