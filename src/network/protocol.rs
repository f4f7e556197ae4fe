//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every frame is a JSON envelope `{"type": ..., "data": ...}` with a
//! snake_case type tag and camelCase payload fields.
//!
//! Inbound payloads are validated here before any state is touched: a
//! malformed message produces a typed error for the sender and nothing
//! else.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::fixed::to_float;
use crate::game::bets::{Bet, BetError};
use crate::game::chat::ChatEntry;
use crate::game::round::RoundPhase;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register a player session on this connection.
    PlayerJoin(JoinRequest),

    /// Stake money on the current round.
    PlaceBet(BetRequest),

    /// Cash out the active bet at the current multiplier.
    CashOut(CashOutRequest),

    /// Send a chat message to everyone.
    ChatMessage(ChatRequest),
}

/// Join request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    /// External user id from the platform.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
}

/// Bet request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetRequest {
    /// External user id from the platform.
    pub user_id: String,
    /// Display name shown in the bet list.
    pub user_name: String,
    /// Stake in minor units.
    pub bet_amount: u64,
    /// Demo bets skip the ledger.
    #[serde(default)]
    pub is_demo: bool,
}

/// Cash-out request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashOutRequest {
    /// External user id from the platform.
    pub user_id: String,
}

/// Chat message from a player.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    /// External user id from the platform.
    pub user_id: String,
    /// Display name.
    pub user_name: String,
    /// Raw message text, validated server-side.
    pub message: String,
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First message on every new connection.
    Welcome(WelcomeInfo),

    /// Replay of recent chat, sent right after the welcome.
    ChatHistory(ChatHistoryInfo),

    /// Full round snapshot, sent after every state mutation.
    GameStateUpdate(GameStateInfo),

    /// The round crashed; crash point revealed.
    GameCrashed(GameCrashedInfo),

    /// Targeted acknowledgement of a successful cash-out.
    CashOutSuccess(CashOutInfo),

    /// A single chat entry, player or system.
    ChatMessage(ChatEntry),

    /// Request rejected.
    Error(ServerError),

    /// Server is shutting down.
    ServerShutdown { reason: String },
}

/// Welcome payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WelcomeInfo {
    /// Greeting shown in the client.
    pub message: String,
    /// Server version.
    pub server_version: String,
}

/// Chat replay payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatHistoryInfo {
    /// Oldest first.
    pub entries: Vec<ChatEntry>,
}

/// One bet as shown to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetSnapshot {
    /// External user id the bet was placed under.
    pub player_id: String,
    /// Display name.
    pub player_name: String,
    /// Stake in minor units.
    pub amount: u64,
    /// Demo flag.
    pub is_demo: bool,
    /// Whether the player already cashed out.
    pub cashed_out: bool,
    /// Multiplier at cash-out, 2 decimals.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cash_out_multiplier: Option<f64>,
    /// Payout in minor units. Some(0) after a settled loss.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub win_amount: Option<u64>,
}

impl BetSnapshot {
    /// Project a book entry onto the wire shape.
    pub fn from_bet(bet: &Bet) -> Self {
        Self {
            player_id: bet.user_id.clone(),
            player_name: bet.player_name.clone(),
            amount: bet.amount,
            is_demo: bet.is_demo,
            cashed_out: bet.cashed_out,
            cash_out_multiplier: bet.cash_out_multiplier.map(display_multiplier),
            win_amount: bet.win_amount,
        }
    }
}

/// Full round snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameStateInfo {
    /// Sequential round id.
    pub round_id: u64,
    /// waiting, flying, or crashed.
    pub phase: RoundPhase,
    /// Current multiplier, 2 decimals.
    pub multiplier: f64,
    /// Seconds of countdown remaining; 0 once flying.
    pub countdown_seconds: u32,
    /// Every placed bet this round.
    pub bets: Vec<BetSnapshot>,
    /// Connected player sessions.
    pub total_players: usize,
    /// Number of placed bets.
    pub total_bets: usize,
    /// Sum of stakes in minor units.
    pub total_bet_amount: u64,
}

/// Crash announcement.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameCrashedInfo {
    /// The round that just ended.
    pub round_id: u64,
    /// The revealed crash point, 2 decimals.
    pub crash_point: f64,
    /// Final bet list with wins and losses filled in.
    pub bets: Vec<BetSnapshot>,
    /// Recent crash points, oldest first, for the history bar.
    pub recent_crash_points: Vec<f64>,
}

/// Cash-out acknowledgement payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashOutInfo {
    /// The round the bet rode.
    pub round_id: u64,
    /// Multiplier locked in, 2 decimals.
    pub multiplier: f64,
    /// Payout in minor units.
    pub win_amount: u64,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Unparseable or structurally invalid message.
    InvalidMessage,
    /// The connection has not joined yet.
    NotJoined,
    /// Bet outside the Waiting phase.
    BettingClosed,
    /// Stake below the configured minimum.
    BetTooSmall,
    /// One bet per player per round.
    AlreadyHasBet,
    /// The ledger refused the debit.
    InsufficientFunds,
    /// Ledger failure other than funds.
    LedgerUnavailable,
    /// Cash-out without a live bet.
    NoActiveBet,
    /// One cash-out per bet.
    AlreadyCashedOut,
    /// Cash-out outside the Flying phase.
    RoundNotInFlight,
    /// Chat message rejected by the content filter.
    MessageRejected,
    /// Internal error.
    InternalError,
}

impl From<&BetError> for ErrorCode {
    fn from(err: &BetError) -> Self {
        match err {
            BetError::BettingClosed => ErrorCode::BettingClosed,
            BetError::BetTooSmall { .. } => ErrorCode::BetTooSmall,
            BetError::AlreadyHasBet => ErrorCode::AlreadyHasBet,
            BetError::InsufficientFunds => ErrorCode::InsufficientFunds,
            BetError::NoActiveBet => ErrorCode::NoActiveBet,
            BetError::AlreadyCashedOut => ErrorCode::AlreadyCashedOut,
            BetError::RoundNotInFlight => ErrorCode::RoundNotInFlight,
            BetError::Ledger(_) => ErrorCode::LedgerUnavailable,
        }
    }
}

impl ServerMessage {
    /// Shorthand for an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError {
            code,
            message: message.into(),
        })
    }

    /// Error reply for a rejected bet or cash-out.
    pub fn bet_error(err: &BetError) -> Self {
        Self::error(ErrorCode::from(err), err.to_string())
    }
}

/// Render a Q16.16 multiplier the way clients display it: 2 decimals.
pub fn display_multiplier(m: crate::core::fixed::Fixed) -> f64 {
    (to_float(m) * 100.0).round() / 100.0
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Longest accepted external user id.
pub const MAX_USER_ID_LEN: usize = 64;

/// Longest accepted display name.
pub const MAX_USER_NAME_LEN: usize = 32;

/// Chat messages are cut at this many characters after trimming.
pub const MAX_CHAT_LEN: usize = 200;

/// All-caps messages longer than this get lowercased.
pub const CAPS_FILTER_MIN_LEN: usize = 12;

/// Substrings that get a chat message rejected outright.
const BANNED_SUBSTRINGS: &[&str] = &["http://", "https://", "www.", "t.me/", "free money"];

/// Why an inbound payload was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Empty or whitespace-only user id.
    #[error("userId must not be empty")]
    EmptyUserId,
    /// User id over `MAX_USER_ID_LEN`.
    #[error("userId too long (max {MAX_USER_ID_LEN})")]
    UserIdTooLong,
    /// Empty or whitespace-only display name.
    #[error("userName must not be empty")]
    EmptyUserName,
    /// Display name over `MAX_USER_NAME_LEN`.
    #[error("userName too long (max {MAX_USER_NAME_LEN})")]
    UserNameTooLong,
    /// Empty or whitespace-only chat message.
    #[error("message must not be empty")]
    EmptyMessage,
    /// Chat message tripped the content filter.
    #[error("message rejected by content filter")]
    BannedContent,
}

impl ProtocolError {
    /// Wire code for this rejection.
    pub fn code(&self) -> ErrorCode {
        match self {
            ProtocolError::BannedContent => ErrorCode::MessageRejected,
            _ => ErrorCode::InvalidMessage,
        }
    }
}

/// Trim and bounds-check a user id and display name pair.
///
/// Returns the trimmed views; callers store those, never the raw input.
pub fn validate_identity<'a>(
    user_id: &'a str,
    user_name: &'a str,
) -> Result<(&'a str, &'a str), ProtocolError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ProtocolError::EmptyUserId);
    }
    if user_id.chars().count() > MAX_USER_ID_LEN {
        return Err(ProtocolError::UserIdTooLong);
    }

    let user_name = user_name.trim();
    if user_name.is_empty() {
        return Err(ProtocolError::EmptyUserName);
    }
    if user_name.chars().count() > MAX_USER_NAME_LEN {
        return Err(ProtocolError::UserNameTooLong);
    }

    Ok((user_id, user_name))
}

/// Trim, cap, and filter a chat message.
///
/// - whitespace trimmed, empty rejected
/// - cut to `MAX_CHAT_LEN` characters
/// - banned substrings rejected (case-insensitive)
/// - shouted messages beyond `CAPS_FILTER_MIN_LEN` are lowercased
pub fn sanitize_chat(message: &str) -> Result<String, ProtocolError> {
    let trimmed = message.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }

    let capped: String = trimmed.chars().take(MAX_CHAT_LEN).collect();

    let lowered = capped.to_lowercase();
    if BANNED_SUBSTRINGS.iter().any(|s| lowered.contains(s)) {
        return Err(ProtocolError::BannedContent);
    }

    let has_alpha = capped.chars().any(|c| c.is_alphabetic());
    let all_caps = has_alpha && !capped.chars().any(|c| c.is_lowercase());
    if all_caps && capped.chars().count() > CAPS_FILTER_MIN_LEN {
        return Ok(lowered);
    }

    Ok(capped)
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
