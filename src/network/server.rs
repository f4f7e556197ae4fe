//! WebSocket Game Server
//!
//! Owns the listener, the per-connection reader/writer tasks, and the
//! round loop that drives the state machine. All round state lives in
//! the shared [`GameRoom`]; connection tasks route validated messages
//! into it through the [`BetCoordinator`] and the room itself.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::time::interval;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::game::bets::PlayerId;
use crate::game::round::{CountdownStep, FlightStep, RoundConfig};
use crate::ledger::{BalanceLedger, BetCoordinator, RoundHistorySink};
use crate::network::protocol::{
    display_multiplier, sanitize_chat, validate_identity, CashOutInfo, ChatHistoryInfo,
    ClientMessage, ErrorCode, ServerMessage, WelcomeInfo,
};
use crate::network::session::{ConnId, GameRoom, RoomStatus};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket bind address.
    pub bind_addr: SocketAddr,
    /// Liveness/readiness listener address.
    pub health_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Connections idle longer than this are swept.
    pub idle_timeout: Duration,
    /// Server version string, echoed in the welcome.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".parse().expect("static addr"),
            health_addr: "0.0.0.0:8081".parse().expect("static addr"),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_addr("SKYROCKET_BIND_ADDR").unwrap_or(defaults.bind_addr),
            health_addr: env_addr("SKYROCKET_HEALTH_ADDR").unwrap_or(defaults.health_addr),
            max_connections: env_usize("SKYROCKET_MAX_CONNECTIONS")
                .unwrap_or(defaults.max_connections),
            idle_timeout: env_usize("SKYROCKET_IDLE_TIMEOUT_SECS")
                .map(|s| Duration::from_secs(s as u64))
                .unwrap_or(defaults.idle_timeout),
            version: defaults.version,
        }
    }
}

fn env_addr(name: &str) -> Option<SocketAddr> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Per-connection bookkeeping for the cleanup sweep.
struct ConnectionState {
    /// The joined player, if `player_join` was seen.
    player: Option<PlayerId>,
    /// Last inbound message time.
    last_activity: Instant,
}

type ConnectionMap = Arc<RwLock<BTreeMap<ConnId, ConnectionState>>>;

/// The crash-game server.
pub struct GameServer {
    config: ServerConfig,
    room: Arc<RwLock<GameRoom>>,
    coordinator: Arc<BetCoordinator>,
    connections: ConnectionMap,
    next_conn_id: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server wired to the given external stores.
    pub fn new(
        config: ServerConfig,
        round: RoundConfig,
        ledger: Arc<dyn BalanceLedger>,
        history: Arc<dyn RoundHistorySink>,
    ) -> Self {
        let room = Arc::new(RwLock::new(GameRoom::new(round)));
        let coordinator = Arc::new(BetCoordinator::new(room.clone(), ledger, history));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            room,
            coordinator,
            connections: Arc::new(RwLock::new(BTreeMap::new())),
            next_conn_id: AtomicU64::new(0),
            shutdown_tx,
        }
    }

    /// Run the accept loop, the round loop, and the cleanup sweep.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("game server listening on {}", self.config.bind_addr);

        let round_room = self.room.clone();
        let round_coordinator = self.coordinator.clone();
        let round_handle = tokio::spawn(async move {
            Self::run_round_loop(round_room, round_coordinator).await;
        });

        let cleanup_connections = self.connections.clone();
        let cleanup_room = self.room.clone();
        let idle_timeout = self.config.idle_timeout;
        let cleanup_handle = tokio::spawn(async move {
            Self::run_cleanup_loop(cleanup_connections, cleanup_room, idle_timeout).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let open = self.connections.read().await.len();
                            if open >= self.config.max_connections {
                                warn!("connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("new connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => {
                            error!("accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }

        round_handle.abort();
        cleanup_handle.abort();

        Ok(())
    }

    /// Signal every task to stop; connected clients get `server_shutdown`.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open connection count, for the operational surface.
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Current round/session summary, for the operational surface.
    pub async fn room_status(&self) -> RoomStatus {
        self.room.read().await.status()
    }

    // =========================================================================
    // ROUND LOOP
    // =========================================================================

    /// Drive rounds forever: countdown, flight, settlement, pause.
    ///
    /// This task is the only caller of the room's tick methods, so ticks
    /// never interleave and the multiplier stays monotonic per round.
    async fn run_round_loop(room: Arc<RwLock<GameRoom>>, coordinator: Arc<BetCoordinator>) {
        let (flight_tick, crash_pause) = {
            let room = room.read().await;
            (room.config().flight_tick, room.config().crash_pause)
        };

        loop {
            // Waiting: one-second countdown ticks
            let mut countdown = interval(Duration::from_secs(1));
            countdown.tick().await; // first tick fires immediately
            loop {
                countdown.tick().await;
                if room.write().await.tick_countdown() == CountdownStep::LiftOff {
                    break;
                }
            }
            {
                let room = room.read().await;
                info!(round_id = room.round().id(), "lift off");
            }

            // Flying: fixed-interval multiplier ticks until the crash
            let mut flight = interval(flight_tick);
            flight.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                flight.tick().await;
                if let FlightStep::Crashed(_) = room.write().await.advance_flight() {
                    break;
                }
            }

            // Crashed: settle, persist off the loop, pause, next round
            let records = room.write().await.settle_crashed();
            coordinator.persist_history(records);

            tokio::time::sleep(crash_pause).await;
            room.write().await.begin_next_round();
        }
    }

    // =========================================================================
    // CONNECTIONS
    // =========================================================================

    /// Handle a new WebSocket connection.
    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        let room = self.room.clone();
        let coordinator = self.coordinator.clone();
        let connections = self.connections.clone();
        let version = self.config.version.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let ws_stream = match accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("websocket handshake failed for {}: {}", addr, e);
                    return;
                }
            };

            let (mut ws_sender, mut ws_receiver) = ws_stream.split();
            let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

            connections.write().await.insert(
                conn_id,
                ConnectionState {
                    player: None,
                    last_activity: Instant::now(),
                },
            );

            // Writer task: serialize and push everything queued for this client
            let sender_task = tokio::spawn(async move {
                while let Some(msg) = msg_rx.recv().await {
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
            });

            // Greeting: welcome, chat replay, current snapshot
            let (replay, snapshot) = {
                let room = room.read().await;
                (room.chat_replay(), room.snapshot())
            };
            let _ = msg_tx
                .send(ServerMessage::Welcome(WelcomeInfo {
                    message: "welcome to skyrocket".to_string(),
                    server_version: version,
                }))
                .await;
            let _ = msg_tx
                .send(ServerMessage::ChatHistory(ChatHistoryInfo { entries: replay }))
                .await;
            let _ = msg_tx.send(ServerMessage::GameStateUpdate(snapshot)).await;

            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                if let Some(conn) = connections.write().await.get_mut(&conn_id) {
                                    conn.last_activity = Instant::now();
                                }

                                let client_msg = match ClientMessage::from_json(&text) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        debug!(conn_id, "invalid message: {}", e);
                                        let _ = msg_tx.send(ServerMessage::error(
                                            ErrorCode::InvalidMessage,
                                            "invalid message format",
                                        )).await;
                                        continue;
                                    }
                                };

                                Self::handle_client_message(
                                    conn_id,
                                    client_msg,
                                    &room,
                                    &coordinator,
                                    &connections,
                                    &msg_tx,
                                ).await;
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!(conn_id, "client disconnected");
                                break;
                            }
                            Some(Err(e)) => {
                                debug!(conn_id, "websocket error: {}", e);
                                break;
                            }
                            _ => {}
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        let _ = msg_tx.send(ServerMessage::ServerShutdown {
                            reason: "server shutting down".to_string(),
                        }).await;
                        break;
                    }
                }
            }

            sender_task.abort();

            let player = connections
                .write()
                .await
                .remove(&conn_id)
                .and_then(|conn| conn.player);
            if let Some(player) = player {
                room.write().await.remove_session(player, conn_id);
            }
            debug!(conn_id, "connection cleaned up");
        });
    }

    /// The joined player behind a connection, if any.
    async fn joined_player(connections: &ConnectionMap, conn_id: ConnId) -> Option<PlayerId> {
        connections
            .read()
            .await
            .get(&conn_id)
            .and_then(|conn| conn.player)
    }

    /// Route one validated client message.
    async fn handle_client_message(
        conn_id: ConnId,
        msg: ClientMessage,
        room: &Arc<RwLock<GameRoom>>,
        coordinator: &Arc<BetCoordinator>,
        connections: &ConnectionMap,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        match msg {
            ClientMessage::PlayerJoin(req) => {
                let (user_id, user_name) = match validate_identity(&req.user_id, &req.user_name) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = sender.send(ServerMessage::error(e.code(), e.to_string())).await;
                        return;
                    }
                };

                // A connection that joins again under a different identity
                // gives up its old session first; otherwise the room would
                // keep one orphan per identity the client cycled through.
                let joining = PlayerId::from_user_id(user_id);
                if let Some(prev) = Self::joined_player(connections, conn_id).await {
                    if prev != joining {
                        room.write().await.remove_session(prev, conn_id);
                    }
                }

                // Never hold the room and connection locks together
                let player = room
                    .write()
                    .await
                    .register_session(user_id, user_name, conn_id, sender.clone());
                if let Some(conn) = connections.write().await.get_mut(&conn_id) {
                    conn.player = Some(player);
                }

                // Rejoining connections get a targeted snapshot to resync
                let snapshot = room.read().await.snapshot();
                let _ = sender.send(ServerMessage::GameStateUpdate(snapshot)).await;
            }

            ClientMessage::PlaceBet(req) => {
                let Some(player) = Self::joined_player(connections, conn_id).await else {
                    let _ = sender
                        .send(ServerMessage::error(ErrorCode::NotJoined, "join first"))
                        .await;
                    return;
                };
                let (user_id, user_name) = match validate_identity(&req.user_id, &req.user_name) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = sender.send(ServerMessage::error(e.code(), e.to_string())).await;
                        return;
                    }
                };
                if PlayerId::from_user_id(user_id) != player {
                    let _ = sender
                        .send(ServerMessage::error(
                            ErrorCode::InvalidMessage,
                            "userId does not match the joined session",
                        ))
                        .await;
                    return;
                }

                if let Err(err) = coordinator
                    .place_bet(user_id, user_name, req.bet_amount, req.is_demo)
                    .await
                {
                    let _ = sender.send(ServerMessage::bet_error(&err)).await;
                }
            }

            ClientMessage::CashOut(req) => {
                let Some(player) = Self::joined_player(connections, conn_id).await else {
                    let _ = sender
                        .send(ServerMessage::error(ErrorCode::NotJoined, "join first"))
                        .await;
                    return;
                };
                let user_id = req.user_id.trim();
                if PlayerId::from_user_id(user_id) != player {
                    let _ = sender
                        .send(ServerMessage::error(
                            ErrorCode::InvalidMessage,
                            "userId does not match the joined session",
                        ))
                        .await;
                    return;
                }

                match coordinator.cash_out(user_id).await {
                    Ok(receipt) => {
                        let _ = sender
                            .send(ServerMessage::CashOutSuccess(CashOutInfo {
                                round_id: receipt.round_id,
                                multiplier: display_multiplier(receipt.multiplier),
                                win_amount: receipt.win_amount,
                            }))
                            .await;
                    }
                    Err(err) => {
                        let _ = sender.send(ServerMessage::bet_error(&err)).await;
                    }
                }
            }

            ClientMessage::ChatMessage(req) => {
                let Some(player) = Self::joined_player(connections, conn_id).await else {
                    let _ = sender
                        .send(ServerMessage::error(ErrorCode::NotJoined, "join first"))
                        .await;
                    return;
                };
                let (user_id, user_name) = match validate_identity(&req.user_id, &req.user_name) {
                    Ok(v) => v,
                    Err(e) => {
                        let _ = sender.send(ServerMessage::error(e.code(), e.to_string())).await;
                        return;
                    }
                };
                if PlayerId::from_user_id(user_id) != player {
                    let _ = sender
                        .send(ServerMessage::error(
                            ErrorCode::InvalidMessage,
                            "userId does not match the joined session",
                        ))
                        .await;
                    return;
                }
                match sanitize_chat(&req.message) {
                    Ok(text) => {
                        room.write().await.push_player_chat(user_name, &text);
                    }
                    Err(e) => {
                        let _ = sender.send(ServerMessage::error(e.code(), e.to_string())).await;
                    }
                }
            }
        }
    }

    // =========================================================================
    // CLEANUP
    // =========================================================================

    /// Sweep idle connections once a minute.
    ///
    /// Feeds the same teardown path as a socket close: the session goes,
    /// and with it any open bet.
    async fn run_cleanup_loop(
        connections: ConnectionMap,
        room: Arc<RwLock<GameRoom>>,
        idle_timeout: Duration,
    ) {
        let mut sweep = interval(Duration::from_secs(60));

        loop {
            sweep.tick().await;

            let now = Instant::now();
            let idle: Vec<ConnId> = {
                let connections = connections.read().await;
                connections
                    .iter()
                    .filter(|(_, conn)| now.duration_since(conn.last_activity) > idle_timeout)
                    .map(|(&conn_id, _)| conn_id)
                    .collect()
            };

            for conn_id in idle {
                let player = connections
                    .write()
                    .await
                    .remove(&conn_id)
                    .and_then(|conn| conn.player);
                if let Some(player) = player {
                    room.write().await.remove_session(player, conn_id);
                }
                info!(conn_id, "removed idle connection");
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
    use crate::ledger::{MemoryHistory, MemoryLedger};
    use crate::network::protocol::{ChatRequest, JoinRequest};

    fn test_server() -> GameServer {
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        GameServer::new(
            config,
            RoundConfig::default(),
            Arc::new(MemoryLedger::new()),
            Arc::new(MemoryHistory::new()),
        )
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = test_server();
        assert_eq!(server.connection_count().await, 0);

        let status = server.room_status().await;
        assert_eq!(status.round_id, 1);
        assert_eq!(status.sessions, 0);
        assert_eq!(status.bets, 0);
    }

    #[tokio::test]
    async fn test_server_shutdown() {
        let server = test_server();
        server.shutdown();
        // No subscriber panic on a quiet server
    }

    /// Seed the bookkeeping a live socket would have created.
    async fn open_conn(server: &GameServer, conn_id: ConnId) {
        server.connections.write().await.insert(
            conn_id,
            ConnectionState {
                player: None,
                last_activity: Instant::now(),
            },
        );
    }

    async fn join(
        server: &GameServer,
        conn_id: ConnId,
        user_id: &str,
        sender: &mpsc::Sender<ServerMessage>,
    ) {
        GameServer::handle_client_message(
            conn_id,
            ClientMessage::PlayerJoin(JoinRequest {
                user_id: user_id.to_string(),
                user_name: user_id.to_string(),
            }),
            &server.room,
            &server.coordinator,
            &server.connections,
            sender,
        )
        .await;
    }

    #[tokio::test]
    async fn test_identity_switch_drops_prior_session() {
        let server = test_server();
        let (tx, _rx) = mpsc::channel(64);
        open_conn(&server, 1).await;

        join(&server, 1, "alice", &tx).await;
        join(&server, 1, "bob", &tx).await;

        // Only the latest identity holds a session
        assert_eq!(server.room.read().await.session_count(), 1);
        let bob = PlayerId::from_user_id("bob");
        assert!(server.room.read().await.session(bob).is_some());
        assert_eq!(
            server.connections.read().await.get(&1).unwrap().player,
            Some(bob)
        );

        // The close teardown leaves the room empty
        let player = server
            .connections
            .write()
            .await
            .remove(&1)
            .and_then(|conn| conn.player);
        if let Some(player) = player {
            server.room.write().await.remove_session(player, 1);
        }
        assert_eq!(server.room.read().await.session_count(), 0);
    }

    #[tokio::test]
    async fn test_rejoin_same_identity_keeps_session() {
        let server = test_server();
        let (tx, _rx) = mpsc::channel(64);
        open_conn(&server, 1).await;

        join(&server, 1, "alice", &tx).await;
        join(&server, 1, "alice", &tx).await;

        assert_eq!(server.room.read().await.session_count(), 1);
    }

    #[tokio::test]
    async fn test_chat_under_foreign_identity_is_rejected() {
        let server = test_server();
        let (tx, mut rx) = mpsc::channel(64);
        open_conn(&server, 1).await;
        join(&server, 1, "alice", &tx).await;
        while rx.try_recv().is_ok() {}

        GameServer::handle_client_message(
            1,
            ClientMessage::ChatMessage(ChatRequest {
                user_id: "mallory".to_string(),
                user_name: "Mallory".to_string(),
                message: "trust me".to_string(),
            }),
            &server.room,
            &server.coordinator,
            &server.connections,
            &tx,
        )
        .await;

        let reply = rx.try_recv().expect("error reply");
        assert!(matches!(
            reply,
            ServerMessage::Error(e) if e.code == ErrorCode::InvalidMessage
        ));
        let replay = server.room.read().await.chat_replay();
        assert!(replay.iter().all(|entry| entry.message != "trust me"));
    }
}
