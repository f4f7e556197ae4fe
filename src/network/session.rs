//! Game Room and Player Sessions
//!
//! Exactly one [`GameRoom`] exists per process. It owns the current
//! round, the bet book, every player session, the chat buffer, and the
//! crash point generator; the server wraps it in one `RwLock` and all
//! mutation goes through that lock.
//!
//! Broadcasts are issued while the lock is still held, so every client
//! sees snapshots in mutation order and the multiplier never appears to
//! go backwards. Sends are non-blocking: a slow client gets messages
//! dropped with a log line instead of stalling the room.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::game::bets::{BetBook, PlayerId};
use crate::game::chat::{ChatBuffer, ChatEntry};
use crate::game::crash::CrashPointGenerator;
use crate::game::round::{CountdownStep, FlightStep, Round, RoundConfig, RoundPhase};
use crate::ledger::RoundRecord;
use crate::network::protocol::{
    display_multiplier, BetSnapshot, GameCrashedInfo, GameStateInfo, ServerMessage,
};

/// Monotonic connection identifier, unique per accepted socket.
pub type ConnId = u64;

/// A joined player and the channel to their connection.
#[derive(Debug)]
pub struct PlayerSession {
    /// Internal player key.
    pub player: PlayerId,
    /// External user id the player joined with.
    pub user_id: String,
    /// Name shown in chat and the bet list.
    pub display_name: String,
    /// The connection currently backing this session.
    pub conn_id: ConnId,
    /// When the session was created.
    pub joined_at: DateTime<Utc>,
    /// Message channel to this player.
    pub sender: mpsc::Sender<ServerMessage>,
}

/// Compact room state for logs and the operational surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomStatus {
    /// Current round id.
    pub round_id: u64,
    /// Current phase.
    pub phase: RoundPhase,
    /// Joined player sessions.
    pub sessions: usize,
    /// Placed bets this round.
    pub bets: usize,
}

/// The single authoritative game room.
pub struct GameRoom {
    config: RoundConfig,
    generator: CrashPointGenerator,
    round: Round,
    book: BetBook,
    sessions: BTreeMap<PlayerId, PlayerSession>,
    chat: ChatBuffer,
}

impl GameRoom {
    /// Create a room with an entropy-seeded generator and open round 1.
    pub fn new(config: RoundConfig) -> Self {
        Self::with_generator(config, CrashPointGenerator::new())
    }

    /// Create a room with an explicit generator (replay and tests).
    pub fn with_generator(config: RoundConfig, mut generator: CrashPointGenerator) -> Self {
        let crash_point = generator.next_crash_point();
        let round = Round::new(1, crash_point, config.countdown_secs);
        Self {
            config,
            generator,
            round,
            book: BetBook::new(),
            sessions: BTreeMap::new(),
            chat: ChatBuffer::new(),
        }
    }

    /// Room whose first round crashes at a known point (tests only).
    #[cfg(test)]
    pub fn with_fixed_crash_point(
        config: RoundConfig,
        generator: CrashPointGenerator,
        crash_point: crate::core::fixed::Fixed,
    ) -> Self {
        let mut room = Self::with_generator(config, generator);
        room.round = Round::new(1, crash_point, room.config.countdown_secs);
        room
    }

    /// Round pacing configuration.
    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    /// The current round, read-only.
    pub fn round(&self) -> &Round {
        &self.round
    }

    /// The current round's bet book.
    pub fn book(&self) -> &BetBook {
        &self.book
    }

    /// Mutable bet book access for the bet coordinator.
    pub fn book_mut(&mut self) -> &mut BetBook {
        &mut self.book
    }

    /// Number of joined sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Look up a session by player.
    pub fn session(&self, player: PlayerId) -> Option<&PlayerSession> {
        self.sessions.get(&player)
    }

    /// Compact state for logs and health queries.
    pub fn status(&self) -> RoomStatus {
        let (bets, _) = self.book.totals();
        RoomStatus {
            round_id: self.round.id(),
            phase: self.round.phase(),
            sessions: self.sessions.len(),
            bets,
        }
    }

    // =========================================================================
    // SESSION LIFECYCLE
    // =========================================================================

    /// Register a session for this connection, replacing any prior one.
    ///
    /// Rejoining under the same user id swaps the connection handle but
    /// never touches bet state. First joins are announced in chat.
    pub fn register_session(
        &mut self,
        user_id: &str,
        display_name: &str,
        conn_id: ConnId,
        sender: mpsc::Sender<ServerMessage>,
    ) -> PlayerId {
        let player = PlayerId::from_user_id(user_id);
        let rejoin = self.sessions.contains_key(&player);

        self.sessions.insert(
            player,
            PlayerSession {
                player,
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                conn_id,
                joined_at: Utc::now(),
                sender,
            },
        );

        if rejoin {
            debug!(
                player = %player.short_hex(),
                conn_id,
                "session rejoined, connection handle replaced"
            );
        } else {
            info!(player = %player.short_hex(), name = %display_name, "player joined");
            let entry = self
                .chat
                .push_system(&format!("{} joined the game", display_name));
            self.broadcast(&ServerMessage::ChatMessage(entry));
            self.broadcast_snapshot();
        }

        player
    }

    /// Remove the session backed by this exact connection.
    ///
    /// A stale `conn_id` is ignored so a reconnect that already swapped
    /// the handle is not torn down by the old connection's cleanup. An
    /// open bet is forfeited with the session; a cashed-out bet stays
    /// for settlement.
    pub fn remove_session(&mut self, player: PlayerId, conn_id: ConnId) -> bool {
        match self.sessions.get(&player) {
            Some(session) if session.conn_id == conn_id => {}
            _ => return false,
        }

        self.sessions.remove(&player);

        if let Some(bet) = self.book.remove_open(player) {
            info!(
                player = %player.short_hex(),
                amount = bet.amount,
                "open bet forfeited by disconnect"
            );
        }

        self.broadcast_snapshot();
        true
    }

    // =========================================================================
    // CHAT
    // =========================================================================

    /// Append a validated player message and broadcast it.
    pub fn push_player_chat(&mut self, username: &str, message: &str) {
        let entry = self.chat.push_user(username, message);
        self.broadcast(&ServerMessage::ChatMessage(entry));
    }

    /// Recent chat entries for the join replay, oldest first.
    pub fn chat_replay(&self) -> Vec<ChatEntry> {
        self.chat.recent()
    }

    // =========================================================================
    // ROUND FLOW (driven by the round loop)
    // =========================================================================

    /// One second of countdown. Broadcasts the updated snapshot.
    pub fn tick_countdown(&mut self) -> CountdownStep {
        let step = self.round.tick_countdown();
        self.broadcast_snapshot();
        step
    }

    /// One flight tick. Broadcasts the updated snapshot.
    pub fn advance_flight(&mut self) -> FlightStep {
        let step = self.round.advance_flight();
        self.broadcast_snapshot();
        step
    }

    /// Settle the crashed round and announce it.
    ///
    /// Marks every open bet as a loss, reveals the crash point to all
    /// clients, and returns one history record per bet, demo bets
    /// included. Must be called in the Crashed phase.
    pub fn settle_crashed(&mut self) -> Vec<RoundRecord> {
        let crash_point = match self.round.revealed_crash_point() {
            Some(cp) => cp,
            None => {
                warn!(
                    round_id = self.round.id(),
                    phase = self.round.phase().as_str(),
                    "settle requested before crash; ignoring"
                );
                return Vec::new();
            }
        };

        let losses = self.book.settle_losses();
        let round_id = self.round.id();

        let records: Vec<RoundRecord> = self
            .book
            .bets()
            .map(|bet| RoundRecord {
                player: bet.player,
                round_id,
                bet_amount: bet.amount,
                multiplier: bet.cash_out_multiplier.unwrap_or(0),
                win_amount: bet.win_amount.unwrap_or(0),
                is_demo: bet.is_demo,
            })
            .collect();

        let (total_bets, _) = self.book.totals();
        info!(
            round_id,
            crash_point = display_multiplier(crash_point),
            bets = total_bets,
            losses,
            "round crashed"
        );

        let announcement = GameCrashedInfo {
            round_id,
            crash_point: display_multiplier(crash_point),
            bets: self.book.bets().map(BetSnapshot::from_bet).collect(),
            recent_crash_points: self
                .generator
                .last_outcomes()
                .into_iter()
                .map(display_multiplier)
                .collect(),
        };
        self.broadcast(&ServerMessage::GameCrashed(announcement));
        self.broadcast_snapshot();

        records
    }

    /// Open the next round with a fresh crash point and an empty book.
    pub fn begin_next_round(&mut self) {
        let next_id = self.round.id() + 1;
        let crash_point = self.generator.next_crash_point();
        self.round = Round::new(next_id, crash_point, self.config.countdown_secs);
        self.book = BetBook::new();

        debug!(round_id = next_id, "round opened");
        self.broadcast_snapshot();
    }

    // =========================================================================
    // BROADCAST
    // =========================================================================

    /// Build the full wire snapshot of the room.
    pub fn snapshot(&self) -> GameStateInfo {
        let (total_bets, total_bet_amount) = self.book.totals();
        GameStateInfo {
            round_id: self.round.id(),
            phase: self.round.phase(),
            multiplier: display_multiplier(self.round.multiplier()),
            countdown_seconds: self.round.countdown_secs(),
            bets: self.book.bets().map(BetSnapshot::from_bet).collect(),
            total_players: self.sessions.len(),
            total_bets,
            total_bet_amount,
        }
    }

    /// Broadcast the current snapshot to every session.
    pub fn broadcast_snapshot(&self) {
        self.broadcast(&ServerMessage::GameStateUpdate(self.snapshot()));
    }

    /// Fan a message out to every session.
    ///
    /// Runs with the room lock held, so delivery order matches mutation
    /// order. A full or closed channel only costs that one client the
    /// message; everyone else still gets it.
    pub fn broadcast(&self, message: &ServerMessage) {
        for session in self.sessions.values() {
            match session.sender.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(
                        player = %session.player.short_hex(),
                        conn_id = session.conn_id,
                        "client channel full, dropping message"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        player = %session.player.short_hex(),
                        conn_id = session.conn_id,
                        "client channel closed, dropping message"
                    );
                }
            }
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fixed::to_fixed;
    use crate::game::bets::Bet;

    fn test_room() -> GameRoom {
        GameRoom::with_generator(RoundConfig::default(), CrashPointGenerator::with_seed(7))
    }

    fn drain(rx: &mut mpsc::Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn place_test_bet(room: &mut GameRoom, user_id: &str, amount: u64, is_demo: bool) -> PlayerId {
        let player = PlayerId::from_user_id(user_id);
        room.book_mut().reserve(player).unwrap();
        room.book_mut().commit(Bet::new(
            player,
            user_id.into(),
            user_id.into(),
            amount,
            is_demo,
        ));
        player
    }

    #[tokio::test]
    async fn test_register_and_remove_session() {
        let mut room = test_room();
        let (tx, _rx) = mpsc::channel(10);

        let player = room.register_session("user-1", "Ada", 1, tx);
        assert_eq!(room.session_count(), 1);
        assert_eq!(room.session(player).unwrap().display_name, "Ada");

        assert!(room.remove_session(player, 1));
        assert_eq!(room.session_count(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_replaces_connection_handle() {
        let mut room = test_room();
        let (tx1, _rx1) = mpsc::channel(10);
        let (tx2, _rx2) = mpsc::channel(10);

        let player = room.register_session("user-1", "Ada", 1, tx1);
        let same = room.register_session("user-1", "Ada", 2, tx2);

        assert_eq!(player, same);
        assert_eq!(room.session_count(), 1);
        assert_eq!(room.session(player).unwrap().conn_id, 2);
    }

    #[tokio::test]
    async fn test_stale_conn_id_cannot_remove_session() {
        let mut room = test_room();
        let (tx1, _rx1) = mpsc::channel(10);
        let (tx2, _rx2) = mpsc::channel(10);

        let player = room.register_session("user-1", "Ada", 1, tx1);
        room.register_session("user-1", "Ada", 2, tx2);

        // The old connection's cleanup must not tear down the new session
        assert!(!room.remove_session(player, 1));
        assert_eq!(room.session_count(), 1);

        assert!(room.remove_session(player, 2));
        assert_eq!(room.session_count(), 0);
    }

    #[tokio::test]
    async fn test_join_is_announced_to_others() {
        let mut room = test_room();
        let (tx1, mut rx1) = mpsc::channel(10);
        let (tx2, _rx2) = mpsc::channel(10);

        room.register_session("user-1", "Ada", 1, tx1);
        drain(&mut rx1);

        room.register_session("user-2", "Bob", 2, tx2);
        let msgs = drain(&mut rx1);

        let chat = msgs.iter().find_map(|m| match m {
            ServerMessage::ChatMessage(entry) => Some(entry),
            _ => None,
        });
        let chat = chat.expect("join announcement");
        assert!(chat.message.contains("Bob"));
        assert_eq!(chat.username, "server");

        // The snapshot after the join shows both sessions
        let snapshot = msgs.iter().rev().find_map(|m| match m {
            ServerMessage::GameStateUpdate(info) => Some(info),
            _ => None,
        });
        assert_eq!(snapshot.expect("snapshot").total_players, 2);
    }

    #[tokio::test]
    async fn test_disconnect_forfeits_open_bet_only() {
        let mut room = test_room();
        let (tx1, _rx1) = mpsc::channel(10);
        let (tx2, _rx2) = mpsc::channel(10);

        let alice = room.register_session("alice", "Alice", 1, tx1);
        let bob = room.register_session("bob", "Bob", 2, tx2);
        place_test_bet(&mut room, "alice", 100, false);
        place_test_bet(&mut room, "bob", 200, false);

        room.book_mut().mark_cash_out(bob, to_fixed(1.5)).unwrap();

        room.remove_session(alice, 1);
        assert!(room.book().bet(alice).is_none(), "open bet removed");

        room.remove_session(bob, 2);
        assert!(
            room.book().bet(bob).is_some(),
            "cashed-out bet kept for settlement"
        );
    }

    #[tokio::test]
    async fn test_snapshot_contents() {
        let mut room = test_room();
        let (tx, _rx) = mpsc::channel(10);
        room.register_session("alice", "Alice", 1, tx);
        place_test_bet(&mut room, "alice", 150, false);

        let snap = room.snapshot();
        assert_eq!(snap.round_id, 1);
        assert_eq!(snap.phase, RoundPhase::Waiting);
        assert_eq!(snap.multiplier, 1.0);
        assert_eq!(snap.countdown_seconds, 10);
        assert_eq!(snap.total_players, 1);
        assert_eq!(snap.total_bets, 1);
        assert_eq!(snap.total_bet_amount, 150);
        assert_eq!(snap.bets[0].player_id, "alice");
    }

    #[tokio::test]
    async fn test_full_round_cycle() {
        let mut room = test_room();

        // Countdown to lift-off
        let mut steps = 0;
        loop {
            steps += 1;
            if room.tick_countdown() == CountdownStep::LiftOff {
                break;
            }
        }
        assert_eq!(steps, 10);
        assert_eq!(room.round().phase(), RoundPhase::Flying);

        // Fly until the crash
        loop {
            if let FlightStep::Crashed(_) = room.advance_flight() {
                break;
            }
        }
        assert_eq!(room.round().phase(), RoundPhase::Crashed);
        assert!(room.round().revealed_crash_point().is_some());

        // Next round resets everything
        room.begin_next_round();
        assert_eq!(room.round().id(), 2);
        assert_eq!(room.round().phase(), RoundPhase::Waiting);
        assert_eq!(room.round().countdown_secs(), 10);
        assert_eq!(room.book().totals(), (0, 0));
    }

    #[tokio::test]
    async fn test_settle_builds_one_record_per_bet() {
        let mut room = test_room();
        let alice = place_test_bet(&mut room, "alice", 100, false);
        let bob = place_test_bet(&mut room, "bob", 200, true); // demo

        room.book_mut().mark_cash_out(alice, to_fixed(2.0)).unwrap();

        // Drive to the crash
        while room.tick_countdown() != CountdownStep::LiftOff {}
        loop {
            if let FlightStep::Crashed(_) = room.advance_flight() {
                break;
            }
        }

        let records = room.settle_crashed();
        assert_eq!(records.len(), 2, "demo bets get records too");

        let win = records.iter().find(|r| r.player == alice).unwrap();
        assert_eq!(win.round_id, 1);
        assert_eq!(win.bet_amount, 100);
        assert_eq!(win.multiplier, to_fixed(2.0));
        assert_eq!(win.win_amount, 200);
        assert!(!win.is_demo);

        // The demo bet settled as a loss, flagged for the sink
        let loss = records.iter().find(|r| r.player == bob).unwrap();
        assert_eq!(loss.win_amount, 0);
        assert!(loss.is_demo);
        assert_eq!(room.book().bet(bob).unwrap().win_amount, Some(0));
    }

    #[tokio::test]
    async fn test_settle_before_crash_is_refused() {
        let mut room = test_room();
        place_test_bet(&mut room, "alice", 100, false);

        assert!(room.settle_crashed().is_empty());
        assert_eq!(
            room.book()
                .bet(PlayerId::from_user_id("alice"))
                .unwrap()
                .win_amount,
            None,
            "no settlement happened"
        );
    }

    #[tokio::test]
    async fn test_crash_announcement_reveals_crash_point() {
        let mut room = test_room();
        let (tx, mut rx) = mpsc::channel(64);
        room.register_session("alice", "Alice", 1, tx);

        while room.tick_countdown() != CountdownStep::LiftOff {}
        loop {
            if let FlightStep::Crashed(_) = room.advance_flight() {
                break;
            }
        }
        drain(&mut rx);

        room.settle_crashed();
        let msgs = drain(&mut rx);
        let crashed = msgs.iter().find_map(|m| match m {
            ServerMessage::GameCrashed(info) => Some(info),
            _ => None,
        });
        let crashed = crashed.expect("game_crashed broadcast");
        assert!(crashed.crash_point >= 1.0);
        assert_eq!(crashed.round_id, 1);
        assert!(!crashed.recent_crash_points.is_empty());
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_broadcast() {
        let mut room = test_room();
        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (fast_tx, mut fast_rx) = mpsc::channel(64);

        room.register_session("slow", "Slow", 1, slow_tx);
        room.register_session("fast", "Fast", 2, fast_tx);
        drain(&mut fast_rx);

        // The slow client's channel fills after one message; further
        // broadcasts must still reach the fast client.
        for _ in 0..5 {
            room.broadcast_snapshot();
        }
        let delivered = drain(&mut fast_rx);
        assert_eq!(delivered.len(), 5);
    }

    #[tokio::test]
    async fn test_chat_broadcast_and_replay() {
        let mut room = test_room();
        let (tx, mut rx) = mpsc::channel(10);
        room.register_session("alice", "Alice", 1, tx);
        drain(&mut rx);

        room.push_player_chat("Alice", "to the moon");
        let msgs = drain(&mut rx);
        assert!(matches!(
            msgs.first(),
            Some(ServerMessage::ChatMessage(entry)) if entry.message == "to the moon"
        ));

        // Replay contains the join notice plus the message
        let replay = room.chat_replay();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay.last().unwrap().message, "to the moon");
    }
}
