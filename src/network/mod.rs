//! Network Layer
//!
//! WebSocket server, wire protocol, and the shared game room. This
//! layer is the only non-deterministic part of the process - round
//! outcomes are decided entirely in `game/`.

pub mod protocol;
pub mod server;
pub mod session;

pub use protocol::{ClientMessage, ErrorCode, ProtocolError, ServerMessage};
pub use server::{GameServer, GameServerError, ServerConfig};
pub use session::{ConnId, GameRoom, PlayerSession, RoomStatus};
