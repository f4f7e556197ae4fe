//! Bet Ledger Coordinator
//!
//! The only writer of per-player bet state and balance deltas. Every
//! bet and cash-out runs the same shape: decide admission under the
//! room lock, do the ledger I/O with the lock released, then take the
//! lock again to commit or unwind. The tick loop never waits on the
//! ledger, and a slow store only delays the one player who called it.
//!
//! Per-player serialization falls out of the bet book: a pending
//! reservation blocks a concurrent duplicate `place_bet`, and the
//! cashed-out mark blocks a concurrent duplicate `cash_out`. Different
//! players never contend beyond the lock itself.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::core::fixed::Fixed;
use crate::game::bets::{Bet, BetError, PlayerId};
use crate::game::round::RoundPhase;
use crate::network::session::GameRoom;

use super::{BalanceLedger, LedgerError, RoundHistorySink, RoundRecord};

impl From<LedgerError> for BetError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds => BetError::InsufficientFunds,
            LedgerError::Unavailable(msg) => BetError::Ledger(msg),
        }
    }
}

/// What a successful cash-out locked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CashOutReceipt {
    /// The round the bet rode.
    pub round_id: u64,
    /// Multiplier captured at cash-out.
    pub multiplier: Fixed,
    /// Payout in minor units.
    pub win_amount: u64,
}

/// Mediates bets and cash-outs between the room and the ledger.
pub struct BetCoordinator {
    room: Arc<RwLock<GameRoom>>,
    ledger: Arc<dyn BalanceLedger>,
    history: Arc<dyn RoundHistorySink>,
}

impl BetCoordinator {
    /// Wire the coordinator to the room and the external stores.
    pub fn new(
        room: Arc<RwLock<GameRoom>>,
        ledger: Arc<dyn BalanceLedger>,
        history: Arc<dyn RoundHistorySink>,
    ) -> Self {
        Self {
            room,
            ledger,
            history,
        }
    }

    /// Place a bet on the current round.
    ///
    /// All-or-nothing: either the stake is debited and the bet is in
    /// the book, or neither happened. A failed debit frees the player
    /// to retry while the betting window is still open.
    pub async fn place_bet(
        &self,
        user_id: &str,
        user_name: &str,
        amount: u64,
        is_demo: bool,
    ) -> Result<(), BetError> {
        let player = PlayerId::from_user_id(user_id);

        // Admission under the lock: phase, minimum, uniqueness
        {
            let mut room = self.room.write().await;
            if !room.round().is_betting_open() {
                return Err(BetError::BettingClosed);
            }
            let min = room.config().min_bet;
            if amount < min {
                return Err(BetError::BetTooSmall { min });
            }
            room.book_mut().reserve(player)?;
        }

        // Stake debit with the lock released
        if !is_demo {
            if let Err(err) = self.ledger.debit(player, amount).await {
                self.room.write().await.book_mut().release(player);
                if matches!(err, LedgerError::Unavailable(_)) {
                    warn!(
                        player = %player.short_hex(),
                        amount,
                        %err,
                        "bet aborted, ledger debit failed"
                    );
                }
                return Err(err.into());
            }
        }

        // Commit, unless the betting window closed while we were away
        let stale = {
            let mut room = self.room.write().await;
            if room.round().is_betting_open() {
                let bet = Bet::new(
                    player,
                    user_id.to_string(),
                    user_name.to_string(),
                    amount,
                    is_demo,
                );
                if room.book_mut().commit(bet) {
                    info!(
                        player = %player.short_hex(),
                        round_id = room.round().id(),
                        amount,
                        is_demo,
                        "bet placed"
                    );
                    room.broadcast_snapshot();
                    false
                } else {
                    // Reservation gone (e.g. disconnect raced us)
                    true
                }
            } else {
                room.book_mut().release(player);
                true
            }
        };

        if stale {
            self.refund(player, amount, is_demo).await;
            return Err(BetError::BettingClosed);
        }
        Ok(())
    }

    /// Cash out the player's bet at the current multiplier.
    ///
    /// The mark happens under the lock, so a concurrent second attempt
    /// observes `cashed_out` and is rejected before any credit. The
    /// credit itself runs with the lock released; if it fails while the
    /// round is still flying, the mark is reverted and the bet rides on.
    pub async fn cash_out(&self, user_id: &str) -> Result<CashOutReceipt, BetError> {
        let player = PlayerId::from_user_id(user_id);

        let (receipt, is_demo) = {
            let mut room = self.room.write().await;
            if room.round().phase() != RoundPhase::Flying {
                return Err(BetError::RoundNotInFlight);
            }
            let round_id = room.round().id();
            let multiplier = room.round().multiplier();
            let is_demo = room
                .book()
                .bet(player)
                .map(|bet| bet.is_demo)
                .ok_or(BetError::NoActiveBet)?;
            let win_amount = room.book_mut().mark_cash_out(player, multiplier)?;
            room.broadcast_snapshot();
            (
                CashOutReceipt {
                    round_id,
                    multiplier,
                    win_amount,
                },
                is_demo,
            )
        };

        if !is_demo {
            if let Err(err) = self.ledger.credit(player, receipt.win_amount).await {
                self.unwind_cash_out(player, &receipt, &err).await;
                return Err(err.into());
            }
        }

        info!(
            player = %player.short_hex(),
            round_id = receipt.round_id,
            win = receipt.win_amount,
            "cash out"
        );
        Ok(receipt)
    }

    /// Persist the settled round's history records on a spawned task.
    ///
    /// Each record is attempted independently; a failed write is logged
    /// for the operator queue and never blocks the other records or the
    /// next round.
    pub fn persist_history(&self, records: Vec<RoundRecord>) {
        if records.is_empty() {
            return;
        }
        let history = self.history.clone();
        tokio::spawn(async move {
            Self::write_history(history.as_ref(), records).await;
        });
    }

    /// Write each record, logging failures individually.
    /// Returns how many writes failed.
    async fn write_history(history: &dyn RoundHistorySink, records: Vec<RoundRecord>) -> usize {
        let mut failures = 0;
        for record in records {
            if let Err(err) = history.record(record).await {
                failures += 1;
                error!(
                    player = %record.player.short_hex(),
                    round_id = record.round_id,
                    %err,
                    "history write failed, record queued for operator replay"
                );
            }
        }
        failures
    }

    /// Give back a stake whose bet never made it into the book.
    async fn refund(&self, player: PlayerId, amount: u64, is_demo: bool) {
        if is_demo {
            return;
        }
        if let Err(err) = self.ledger.credit(player, amount).await {
            error!(
                player = %player.short_hex(),
                amount,
                %err,
                "refund credit failed, needs operator reconciliation"
            );
        }
    }

    /// Roll back a cash-out mark after a failed credit.
    async fn unwind_cash_out(&self, player: PlayerId, receipt: &CashOutReceipt, err: &LedgerError) {
        let mut room = self.room.write().await;
        let same_round = room.round().id() == receipt.round_id;
        if same_round && room.round().phase() == RoundPhase::Flying {
            if room.book_mut().revert_cash_out(player) {
                room.broadcast_snapshot();
            }
            warn!(
                player = %player.short_hex(),
                %err,
                "cash-out credit failed, mark reverted"
            );
        } else {
            // The round ended under us; the recorded win stands and the
            // missing credit goes to the operator queue.
            error!(
                player = %player.short_hex(),
                round_id = receipt.round_id,
                win = receipt.win_amount,
                %err,
                "cash-out credit failed after round end, needs operator reconciliation"
            );
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures_util::future::BoxFuture;

    use super::*;
    use crate::core::fixed::{to_fixed, win_amount};
    use crate::game::crash::CrashPointGenerator;
    use crate::game::round::{CountdownStep, FlightStep, RoundConfig};
    use crate::ledger::{HistoryError, MemoryHistory, MemoryLedger};

    /// Ledger wrapper that fails every operation while tripped.
    struct FlakyLedger {
        inner: MemoryLedger,
        failing: AtomicBool,
    }

    impl FlakyLedger {
        fn new() -> Self {
            Self {
                inner: MemoryLedger::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    impl BalanceLedger for FlakyLedger {
        fn debit(&self, player: PlayerId, amount: u64) -> BoxFuture<'_, Result<(), LedgerError>> {
            Box::pin(async move {
                if self.failing.load(Ordering::SeqCst) {
                    return Err(LedgerError::Unavailable("store down".into()));
                }
                self.inner.debit(player, amount).await
            })
        }

        fn credit(&self, player: PlayerId, amount: u64) -> BoxFuture<'_, Result<(), LedgerError>> {
            Box::pin(async move {
                if self.failing.load(Ordering::SeqCst) {
                    return Err(LedgerError::Unavailable("store down".into()));
                }
                self.inner.credit(player, amount).await
            })
        }
    }

    /// Sink that refuses writes for one specific player.
    struct GrudgeSink {
        inner: MemoryHistory,
        refused: PlayerId,
    }

    impl RoundHistorySink for GrudgeSink {
        fn record(&self, record: RoundRecord) -> BoxFuture<'_, Result<(), HistoryError>> {
            Box::pin(async move {
                if record.player == self.refused {
                    return Err(HistoryError::Unavailable("write refused".into()));
                }
                self.inner.record(record).await
            })
        }
    }

    struct Harness {
        room: Arc<RwLock<GameRoom>>,
        ledger: Arc<MemoryLedger>,
        history: Arc<MemoryHistory>,
        coordinator: BetCoordinator,
    }

    /// Room with a known crash point so flights can be steered.
    fn harness(crash_point: Fixed) -> Harness {
        let room = Arc::new(RwLock::new(GameRoom::with_fixed_crash_point(
            RoundConfig::default(),
            CrashPointGenerator::with_seed(1),
            crash_point,
        )));
        let ledger = Arc::new(MemoryLedger::new());
        let history = Arc::new(MemoryHistory::new());
        let coordinator = BetCoordinator::new(room.clone(), ledger.clone(), history.clone());
        Harness {
            room,
            ledger,
            history,
            coordinator,
        }
    }

    async fn lift_off(room: &Arc<RwLock<GameRoom>>) {
        let mut room = room.write().await;
        while room.tick_countdown() != CountdownStep::LiftOff {}
    }

    /// Advance the flight until the multiplier reaches `target`.
    /// The crash point must sit above `target`.
    async fn fly_to(room: &Arc<RwLock<GameRoom>>, target: Fixed) {
        let mut room = room.write().await;
        while room.round().multiplier() < target {
            if let FlightStep::Crashed(_) = room.advance_flight() {
                panic!("round crashed before reaching target multiplier");
            }
        }
    }

    async fn crash(room: &Arc<RwLock<GameRoom>>) {
        let mut room = room.write().await;
        loop {
            if let FlightStep::Crashed(_) = room.advance_flight() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_bet_cash_out_settle_cycle() {
        let h = harness(to_fixed(3.1));
        let player = PlayerId::from_user_id("ada");
        h.ledger.set_balance(player, 1000).await;

        // Bet 100 during the countdown
        h.coordinator
            .place_bet("ada", "Ada", 100, false)
            .await
            .unwrap();
        assert_eq!(h.ledger.balance(player).await, 900);

        // Cash out somewhere past 2.5x, before the 3.1x crash
        lift_off(&h.room).await;
        fly_to(&h.room, to_fixed(2.5)).await;
        let receipt = h.coordinator.cash_out("ada").await.unwrap();

        assert!(receipt.multiplier >= to_fixed(2.5));
        assert_eq!(receipt.win_amount, win_amount(100, receipt.multiplier));
        assert_eq!(h.ledger.balance(player).await, 900 + receipt.win_amount);

        // The crash must not re-process the cashed-out bet
        crash(&h.room).await;
        let records = h.room.write().await.settle_crashed();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].win_amount, receipt.win_amount);
        assert_eq!(records[0].multiplier, receipt.multiplier);
        assert_eq!(h.ledger.balance(player).await, 900 + receipt.win_amount);
    }

    #[tokio::test]
    async fn test_uncashed_bet_settles_as_loss() {
        let h = harness(to_fixed(1.8));
        let player = PlayerId::from_user_id("bob");
        h.ledger.set_balance(player, 1000).await;

        h.coordinator
            .place_bet("bob", "Bob", 50, false)
            .await
            .unwrap();
        assert_eq!(h.ledger.balance(player).await, 950);

        lift_off(&h.room).await;
        crash(&h.room).await;
        let records = h.room.write().await.settle_crashed();

        // One loss record, no credit issued
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bet_amount, 50);
        assert_eq!(records[0].multiplier, 0);
        assert_eq!(records[0].win_amount, 0);
        assert_eq!(h.ledger.balance(player).await, 950);

        BetCoordinator::write_history(h.history.as_ref(), records).await;
        assert_eq!(h.history.records().await.len(), 1);
    }

    #[tokio::test]
    async fn test_bet_rejected_below_minimum() {
        let h = harness(to_fixed(2.0));
        let player = PlayerId::from_user_id("ada");
        h.ledger.set_balance(player, 1000).await;

        let min = RoundConfig::default().min_bet;
        assert_eq!(
            h.coordinator.place_bet("ada", "Ada", min - 1, false).await,
            Err(BetError::BetTooSmall { min })
        );
        assert_eq!(h.ledger.balance(player).await, 1000);
    }

    #[tokio::test]
    async fn test_bet_rejected_outside_waiting() {
        let h = harness(to_fixed(2.0));
        let player = PlayerId::from_user_id("ada");
        h.ledger.set_balance(player, 1000).await;

        lift_off(&h.room).await;
        assert_eq!(
            h.coordinator.place_bet("ada", "Ada", 100, false).await,
            Err(BetError::BettingClosed)
        );
        assert_eq!(h.ledger.balance(player).await, 1000);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_no_bet() {
        let h = harness(to_fixed(2.0));
        let player = PlayerId::from_user_id("ada");
        h.ledger.set_balance(player, 30).await;

        assert_eq!(
            h.coordinator.place_bet("ada", "Ada", 100, false).await,
            Err(BetError::InsufficientFunds)
        );
        assert_eq!(h.ledger.balance(player).await, 30);
        assert!(h.room.read().await.book().bet(player).is_none());

        // The slot is free again: an affordable retry succeeds
        h.coordinator
            .place_bet("ada", "Ada", 20, false)
            .await
            .unwrap();
        assert_eq!(h.ledger.balance(player).await, 10);
    }

    #[tokio::test]
    async fn test_debit_failure_allows_retry_same_round() {
        let room = Arc::new(RwLock::new(GameRoom::with_fixed_crash_point(
            RoundConfig::default(),
            CrashPointGenerator::with_seed(1),
            to_fixed(2.0),
        )));
        let ledger = Arc::new(FlakyLedger::new());
        let history = Arc::new(MemoryHistory::new());
        let coordinator = BetCoordinator::new(room.clone(), ledger.clone(), history);

        let player = PlayerId::from_user_id("ada");
        ledger.inner.set_balance(player, 1000).await;
        ledger.set_failing(true);

        assert!(matches!(
            coordinator.place_bet("ada", "Ada", 100, false).await,
            Err(BetError::Ledger(_))
        ));
        assert!(room.read().await.book().bet(player).is_none());
        assert_eq!(ledger.inner.balance(player).await, 1000);

        // Store recovers while Waiting is still open; retry succeeds
        ledger.set_failing(false);
        coordinator.place_bet("ada", "Ada", 100, false).await.unwrap();
        assert_eq!(ledger.inner.balance(player).await, 900);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_bet_debits_once() {
        let h = harness(to_fixed(2.0));
        let player = PlayerId::from_user_id("ada");
        h.ledger.set_balance(player, 1000).await;

        let (a, b) = tokio::join!(
            h.coordinator.place_bet("ada", "Ada", 100, false),
            h.coordinator.place_bet("ada", "Ada", 100, false),
        );

        let outcomes = [a, b];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(outcomes.contains(&Err(BetError::AlreadyHasBet)));
        assert_eq!(h.ledger.balance(player).await, 900);
    }

    #[tokio::test]
    async fn test_concurrent_duplicate_cash_out_credits_once() {
        let h = harness(to_fixed(3.0));
        let player = PlayerId::from_user_id("ada");
        h.ledger.set_balance(player, 1000).await;

        h.coordinator
            .place_bet("ada", "Ada", 100, false)
            .await
            .unwrap();
        lift_off(&h.room).await;
        fly_to(&h.room, to_fixed(1.5)).await;

        let (a, b) = tokio::join!(h.coordinator.cash_out("ada"), h.coordinator.cash_out("ada"));

        let ok = match (&a, &b) {
            (Ok(receipt), Err(BetError::AlreadyCashedOut)) => *receipt,
            (Err(BetError::AlreadyCashedOut), Ok(receipt)) => *receipt,
            other => panic!("expected one success and one rejection, got {:?}", other),
        };
        assert_eq!(h.ledger.balance(player).await, 900 + ok.win_amount);
    }

    #[tokio::test]
    async fn test_cash_out_requires_flight_and_bet() {
        let h = harness(to_fixed(2.0));
        let player = PlayerId::from_user_id("ada");
        h.ledger.set_balance(player, 1000).await;
        h.coordinator
            .place_bet("ada", "Ada", 100, false)
            .await
            .unwrap();

        // Still waiting
        assert_eq!(
            h.coordinator.cash_out("ada").await,
            Err(BetError::RoundNotInFlight)
        );

        lift_off(&h.room).await;

        // No bet for this player
        assert_eq!(
            h.coordinator.cash_out("ghost").await,
            Err(BetError::NoActiveBet)
        );
    }

    #[tokio::test]
    async fn test_credit_failure_reverts_mark_mid_flight() {
        let room = Arc::new(RwLock::new(GameRoom::with_fixed_crash_point(
            RoundConfig::default(),
            CrashPointGenerator::with_seed(1),
            to_fixed(5.0),
        )));
        let ledger = Arc::new(FlakyLedger::new());
        let history = Arc::new(MemoryHistory::new());
        let coordinator = BetCoordinator::new(room.clone(), ledger.clone(), history);

        let player = PlayerId::from_user_id("ada");
        ledger.inner.set_balance(player, 1000).await;
        coordinator.place_bet("ada", "Ada", 100, false).await.unwrap();

        {
            let mut r = room.write().await;
            while r.tick_countdown() != CountdownStep::LiftOff {}
            while r.round().multiplier() < to_fixed(2.0) {
                r.advance_flight();
            }
        }

        ledger.set_failing(true);
        assert!(matches!(
            coordinator.cash_out("ada").await,
            Err(BetError::Ledger(_))
        ));

        // The bet is live again and cashes out normally once the store recovers
        let bet = room.read().await.book().bet(player).cloned().unwrap();
        assert!(!bet.cashed_out);
        assert_eq!(ledger.inner.balance(player).await, 900);

        ledger.set_failing(false);
        let receipt = coordinator.cash_out("ada").await.unwrap();
        assert_eq!(
            ledger.inner.balance(player).await,
            900 + receipt.win_amount
        );
    }

    #[tokio::test]
    async fn test_demo_bets_never_touch_the_ledger() {
        let h = harness(to_fixed(3.0));
        let player = PlayerId::from_user_id("ada");

        // No balance needed for a demo bet
        h.coordinator
            .place_bet("ada", "Ada", 500, true)
            .await
            .unwrap();
        lift_off(&h.room).await;
        fly_to(&h.room, to_fixed(1.5)).await;

        let receipt = h.coordinator.cash_out("ada").await.unwrap();
        assert!(receipt.win_amount > 0);
        assert_eq!(h.ledger.balance(player).await, 0);

        // The outcome still gets a record, flagged demo for the sink
        crash(&h.room).await;
        let records = h.room.write().await.settle_crashed();
        assert_eq!(records.len(), 1);
        assert!(records[0].is_demo);
        assert_eq!(records[0].win_amount, receipt.win_amount);
        assert_eq!(h.ledger.balance(player).await, 0);
    }

    #[tokio::test]
    async fn test_settlement_reconciles_credits_with_wins() {
        let h = harness(to_fixed(4.0));
        let users = ["a", "b", "c", "d"];
        for user in users {
            let player = PlayerId::from_user_id(user);
            h.ledger.set_balance(player, 1000).await;
            h.coordinator.place_bet(user, user, 100, false).await.unwrap();
        }

        lift_off(&h.room).await;
        fly_to(&h.room, to_fixed(1.5)).await;
        let r1 = h.coordinator.cash_out("a").await.unwrap();
        fly_to(&h.room, to_fixed(2.5)).await;
        let r2 = h.coordinator.cash_out("b").await.unwrap();
        crash(&h.room).await;

        let records = h.room.write().await.settle_crashed();
        assert_eq!(records.len(), 4, "every bet has exactly one outcome");

        // Credits issued equal the sum of recorded wins
        let recorded_wins: u64 = records.iter().map(|r| r.win_amount).sum();
        assert_eq!(recorded_wins, r1.win_amount + r2.win_amount);

        let credited: u64 = h.ledger.balance(PlayerId::from_user_id("a")).await
            + h.ledger.balance(PlayerId::from_user_id("b")).await
            + h.ledger.balance(PlayerId::from_user_id("c")).await
            + h.ledger.balance(PlayerId::from_user_id("d")).await;
        assert_eq!(credited, 4 * 900 + recorded_wins);
    }

    #[tokio::test]
    async fn test_history_failure_does_not_block_other_records() {
        let refused = PlayerId::from_user_id("b");
        let sink = GrudgeSink {
            inner: MemoryHistory::new(),
            refused,
        };

        let records: Vec<RoundRecord> = ["a", "b", "c"]
            .iter()
            .map(|user| RoundRecord {
                player: PlayerId::from_user_id(user),
                round_id: 9,
                bet_amount: 100,
                multiplier: 0,
                win_amount: 0,
                is_demo: false,
            })
            .collect();

        let failures = BetCoordinator::write_history(&sink, records).await;
        assert_eq!(failures, 1);

        let written = sink.inner.records().await;
        assert_eq!(written.len(), 2);
        assert!(written.iter().all(|r| r.player != refused));
    }
}
