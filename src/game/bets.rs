//! Bets and the Per-Round Bet Book
//!
//! One book lives for exactly one round. It is the single record of who
//! staked what, and it enforces the per-player rules: one bet per round,
//! one cash-out per bet.
//!
//! Placing a bet is a two-step handshake with the ledger. The caller
//! first `reserve`s the player's slot, then debits the stake outside
//! the room lock, then either `commit`s the bet or `release`s the slot.
//! The reservation keeps a second bet from slipping in while the debit
//! is in flight.
//!
//! Uses BTreeMap for deterministic iteration order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::fixed::{win_amount, Fixed};

// =============================================================================
// PLAYER ID
// =============================================================================

/// Unique player identifier (16 bytes derived from the external user id).
///
/// Implements Ord for deterministic BTreeMap ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Default)]
pub struct PlayerId(pub [u8; 16]);

impl PlayerId {
    /// Create from raw bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Derive a deterministic id from an external user id string.
    /// Uses SHA256 so any id the platform hands us maps to 16 bytes.
    pub fn from_user_id(user_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"skyrocket-player:");
        hasher.update(user_id.as_bytes());
        let hash = hasher.finalize();

        let mut id = [0u8; 16];
        id.copy_from_slice(&hash[..16]);
        Self(id)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First 4 bytes as hex, for log fields.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

// =============================================================================
// BET
// =============================================================================

/// A single player's stake in the current round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Bet {
    /// Internal player key.
    pub player: PlayerId,
    /// External user id, echoed back on the wire.
    pub user_id: String,
    /// Display name shown in the bet list.
    pub player_name: String,
    /// Stake in minor units.
    pub amount: u64,
    /// Demo bets never touch the ledger.
    pub is_demo: bool,
    /// Set once the player cashes out; never cleared by settlement.
    pub cashed_out: bool,
    /// Multiplier captured at cash-out time.
    pub cash_out_multiplier: Option<Fixed>,
    /// Payout in minor units. Some(0) marks a settled loss.
    pub win_amount: Option<u64>,
}

impl Bet {
    /// A freshly placed, unresolved bet.
    pub fn new(
        player: PlayerId,
        user_id: String,
        player_name: String,
        amount: u64,
        is_demo: bool,
    ) -> Self {
        Self {
            player,
            user_id,
            player_name,
            amount,
            is_demo,
            cashed_out: false,
            cash_out_multiplier: None,
            win_amount: None,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Why a bet or cash-out was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BetError {
    /// Bets are only accepted during the countdown.
    #[error("betting is closed")]
    BettingClosed,
    /// Stake below the configured minimum.
    #[error("bet below minimum of {min}")]
    BetTooSmall {
        /// The configured minimum stake.
        min: u64,
    },
    /// One bet per player per round.
    #[error("player already has a bet this round")]
    AlreadyHasBet,
    /// The ledger refused the debit.
    #[error("insufficient funds")]
    InsufficientFunds,
    /// Cash-out without a live bet.
    #[error("no active bet")]
    NoActiveBet,
    /// One cash-out per bet.
    #[error("bet already cashed out")]
    AlreadyCashedOut,
    /// Cash-outs are only accepted while the multiplier is climbing.
    #[error("round is not in flight")]
    RoundNotInFlight,
    /// The ledger failed for a reason other than funds.
    #[error("ledger unavailable: {0}")]
    Ledger(String),
}

// =============================================================================
// BET BOOK
// =============================================================================

/// A player's slot in the book.
///
/// Pending means the stake debit is in flight; the slot blocks a second
/// bet but is invisible to snapshots and settlement.
#[derive(Clone, Debug)]
enum BetSlot {
    Pending,
    Placed(Bet),
}

/// All bets for one round, keyed by player.
#[derive(Clone, Debug, Default)]
pub struct BetBook {
    slots: BTreeMap<PlayerId, BetSlot>,
}

impl BetBook {
    /// An empty book for a fresh round.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the player's slot ahead of the ledger debit.
    pub fn reserve(&mut self, player: PlayerId) -> Result<(), BetError> {
        if self.slots.contains_key(&player) {
            return Err(BetError::AlreadyHasBet);
        }
        self.slots.insert(player, BetSlot::Pending);
        Ok(())
    }

    /// Turn the player's reservation into a placed bet.
    ///
    /// Returns false if the reservation is gone, which means the slot
    /// was released in between; the caller must not keep the stake.
    pub fn commit(&mut self, bet: Bet) -> bool {
        match self.slots.get_mut(&bet.player) {
            Some(slot @ BetSlot::Pending) => {
                *slot = BetSlot::Placed(bet);
                true
            }
            _ => false,
        }
    }

    /// Drop a pending reservation after a failed debit.
    pub fn release(&mut self, player: PlayerId) {
        if let Some(BetSlot::Pending) = self.slots.get(&player) {
            self.slots.remove(&player);
        }
    }

    /// The player's placed bet, if any.
    pub fn bet(&self, player: PlayerId) -> Option<&Bet> {
        match self.slots.get(&player) {
            Some(BetSlot::Placed(bet)) => Some(bet),
            _ => None,
        }
    }

    /// Mark the player's bet as cashed out at `multiplier`.
    ///
    /// Returns the payout in minor units. The caller credits the ledger
    /// after releasing the room lock.
    pub fn mark_cash_out(&mut self, player: PlayerId, multiplier: Fixed) -> Result<u64, BetError> {
        let bet = match self.slots.get_mut(&player) {
            Some(BetSlot::Placed(bet)) => bet,
            _ => return Err(BetError::NoActiveBet),
        };
        if bet.cashed_out {
            return Err(BetError::AlreadyCashedOut);
        }

        let win = win_amount(bet.amount, multiplier);
        bet.cashed_out = true;
        bet.cash_out_multiplier = Some(multiplier);
        bet.win_amount = Some(win);
        Ok(win)
    }

    /// Undo a cash-out mark after a failed ledger credit.
    ///
    /// Returns false if there was no cashed-out bet to revert.
    pub fn revert_cash_out(&mut self, player: PlayerId) -> bool {
        match self.slots.get_mut(&player) {
            Some(BetSlot::Placed(bet)) if bet.cashed_out => {
                bet.cashed_out = false;
                bet.cash_out_multiplier = None;
                bet.win_amount = None;
                true
            }
            _ => false,
        }
    }

    /// Remove the player's bet if it has not cashed out.
    ///
    /// Used when a session disappears during the round. Cashed-out bets
    /// stay for settlement, and a pending reservation stays too: its
    /// debit is in flight and the committed bet rides the round out.
    pub fn remove_open(&mut self, player: PlayerId) -> Option<Bet> {
        let open = matches!(
            self.slots.get(&player),
            Some(BetSlot::Placed(bet)) if !bet.cashed_out
        );
        if !open {
            return None;
        }
        match self.slots.remove(&player) {
            Some(BetSlot::Placed(bet)) => Some(bet),
            _ => None,
        }
    }

    /// Mark every un-cashed bet as a loss. Returns how many lost.
    pub fn settle_losses(&mut self) -> usize {
        let mut losses = 0;
        for slot in self.slots.values_mut() {
            if let BetSlot::Placed(bet) = slot {
                if !bet.cashed_out {
                    bet.win_amount = Some(0);
                    losses += 1;
                }
            }
        }
        losses
    }

    /// All placed bets in player order. Pending slots are skipped.
    pub fn bets(&self) -> impl Iterator<Item = &Bet> {
        self.slots.values().filter_map(|slot| match slot {
            BetSlot::Placed(bet) => Some(bet),
            BetSlot::Pending => None,
        })
    }

    /// Count and stake total across placed bets.
    pub fn totals(&self) -> (usize, u64) {
        let mut count = 0;
        let mut total = 0u64;
        for bet in self.bets() {
            count += 1;
            total = total.saturating_add(bet.amount);
        }
        (count, total)
    }
}

// =============================================================================
// TESTS
// =============================================================================
