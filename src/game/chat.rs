//! Chat History Buffer
//!
//! A bounded ring of recent chat entries. The room appends validated
//! player messages and system notices here, and new connections get a
//! replay of the tail so the chat panel is never empty on join.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entries kept in memory.
pub const CHAT_BUFFER_CAP: usize = 100;

/// Entries replayed to a new connection.
pub const CHAT_REPLAY_LEN: usize = 50;

/// Who produced a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    /// A player-typed message.
    User,
    /// A server-generated notice (joins, announcements).
    System,
}

/// One line of chat as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    /// Unique entry id.
    pub id: Uuid,
    /// Display name of the sender; "server" for system entries.
    pub username: String,
    /// Message body, already validated and trimmed.
    pub message: String,
    /// Server receive time.
    pub timestamp: DateTime<Utc>,
    /// User or system.
    pub kind: ChatKind,
}

/// Bounded chat history, oldest entries dropped first.
#[derive(Debug, Clone, Default)]
pub struct ChatBuffer {
    entries: VecDeque<ChatEntry>,
}

impl ChatBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a player message. Returns the stored entry so the caller
    /// can broadcast exactly what was recorded.
    pub fn push_user(&mut self, username: &str, message: &str) -> ChatEntry {
        self.push(ChatEntry {
            id: Uuid::new_v4(),
            username: username.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            kind: ChatKind::User,
        })
    }

    /// Append a server notice.
    pub fn push_system(&mut self, message: &str) -> ChatEntry {
        self.push(ChatEntry {
            id: Uuid::new_v4(),
            username: "server".to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            kind: ChatKind::System,
        })
    }

    /// The tail of the buffer for join replay, oldest first.
    pub fn recent(&self) -> Vec<ChatEntry> {
        let skip = self.entries.len().saturating_sub(CHAT_REPLAY_LEN);
        self.entries.iter().skip(skip).cloned().collect()
    }

    /// Number of entries currently held.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are held.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, entry: ChatEntry) -> ChatEntry {
        if self.entries.len() == CHAT_BUFFER_CAP {
            self.entries.pop_front();
        }
        self.entries.push_back(entry.clone());
        entry
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_and_replay_order() {
        let mut chat = ChatBuffer::new();
        chat.push_user("ada", "first");
        chat.push_system("round over");
        chat.push_user("bob", "second");

        let recent = chat.recent();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "first");
        assert_eq!(recent[1].kind, ChatKind::System);
        assert_eq!(recent[1].username, "server");
        assert_eq!(recent[2].message, "second");
    }

    #[test]
    fn test_buffer_is_bounded() {
        let mut chat = ChatBuffer::new();
        for i in 0..250 {
            chat.push_user("ada", &format!("msg {}", i));
        }

        assert_eq!(chat.len(), CHAT_BUFFER_CAP);

        // Oldest entries were dropped
        let recent = chat.recent();
        assert_eq!(recent.len(), CHAT_REPLAY_LEN);
        assert_eq!(recent.last().unwrap().message, "msg 249");
        assert_eq!(
            recent.first().unwrap().message,
            format!("msg {}", 250 - CHAT_REPLAY_LEN)
        );
    }

    #[test]
    fn test_entry_ids_are_unique() {
        let mut chat = ChatBuffer::new();
        let a = chat.push_user("ada", "hi");
        let b = chat.push_user("ada", "hi");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_returned_entry_matches_stored() {
        let mut chat = ChatBuffer::new();
        let entry = chat.push_user("ada", "hello there");
        assert_eq!(chat.recent().last().unwrap(), &entry);
    }
}
