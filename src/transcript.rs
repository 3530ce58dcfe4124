//! # Stage: Transcript Store
//!
//! ## Responsibility
//! Owns the chat list of one identity partition and the active-chat pointer.
//! Every structural mutation (add, finalize, remove, rename, delete, clear,
//! switch) is written through the persistence port before returning.
//!
//! ## Guarantees
//! - A message is open for in-place updates only between
//!   [`TranscriptStore::add_placeholder`] and its finalization or removal.
//! - `response_time` is only ever set on finalized assistant messages.
//! - Partial streaming content lives in memory only; a crash mid-stream keeps
//!   the persisted user message and empty placeholder.
//! - A failed write leaves memory intact and is parked for the caller to
//!   surface via [`TranscriptStore::take_persistence_error`].
//!
//! ## NOT Responsible For
//! - Cancellation of in-flight operations (that is the coordinator)
//! - Network I/O

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, error};

use crate::error::ChatError;
use crate::ids;
use crate::providers::{ChatMessage, Role};
use crate::storage::KeyValueStore;

pub const DEFAULT_TITLE: &str = "New Chat";
pub const UNTITLED_TITLE: &str = "Untitled Chat";
pub const MAX_TITLE_LENGTH: usize = 35;
pub const TITLE_WORDS: usize = 5;
pub const LOCAL_PARTITION: &str = "local";

const CHATS_KEY: &str = "aiChats";
const LAST_ACTIVE_KEY: &str = "aiChatLastActiveId";

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    #[default]
    Text,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    /// Seconds from request start to finalization, two decimals.
    #[serde(
        rename = "responseTime",
        default,
        deserialize_with = "lenient_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub response_time: Option<f64>,
}

/// Accepts a number, a numeric string (older records) or null.
fn lenient_seconds<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(serde_json::Value::Number(n)) => n.as_f64(),
        Some(serde_json::Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl Chat {
    fn new() -> Self {
        Chat {
            id: ids::chat_id(),
            title: DEFAULT_TITLE.to_string(),
            messages: Vec::new(),
        }
    }

    pub fn message(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id == id)
    }
}

/// First five space-separated words, cut to 35 characters plus `...`.
pub fn derive_title(content: &str) -> String {
    let joined = content.split(' ').take(TITLE_WORDS).collect::<Vec<_>>().join(" ");
    let title = if joined.chars().count() > MAX_TITLE_LENGTH {
        let cut: String = joined.chars().take(MAX_TITLE_LENGTH).collect();
        format!("{cut}...")
    } else {
        joined
    };
    if title.is_empty() {
        UNTITLED_TITLE.to_string()
    } else {
        title
    }
}

/// Round elapsed seconds to two decimals.
pub fn round_seconds(secs: f64) -> f64 {
    (secs.max(0.0) * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// TranscriptStore
// ---------------------------------------------------------------------------

pub struct TranscriptStore {
    port: Box<dyn KeyValueStore>,
    partition: String,
    chats: Vec<Chat>,
    active: Option<String>,
    open: HashSet<String>,
    persistence_error: Option<ChatError>,
}

impl TranscriptStore {
    /// An empty store bound to the `local` partition. Call [`activate`] to load.
    ///
    /// [`activate`]: TranscriptStore::activate
    pub fn new(port: Box<dyn KeyValueStore>) -> Self {
        TranscriptStore {
            port,
            partition: LOCAL_PARTITION.to_string(),
            chats: Vec::new(),
            active: None,
            open: HashSet::new(),
            persistence_error: None,
        }
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    pub fn chat(&self, id: &str) -> Option<&Chat> {
        self.chats.iter().find(|c| c.id == id)
    }

    pub fn active_chat_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_chat(&self) -> Option<&Chat> {
        self.active.as_deref().and_then(|id| self.chat(id))
    }

    pub fn is_open(&self, message_id: &str) -> bool {
        self.open.contains(message_id)
    }

    /// Pending persistence failure, cleared on read.
    pub fn take_persistence_error(&mut self) -> Option<ChatError> {
        self.persistence_error.take()
    }

    /// Direct access to the persistence port for records outside the
    /// transcript (settings share the same port).
    pub fn port_mut(&mut self) -> &mut dyn KeyValueStore {
        self.port.as_mut()
    }

    pub fn port(&self) -> &dyn KeyValueStore {
        self.port.as_ref()
    }

    fn key(&self, base: &str) -> String {
        format!("{base}_{}", self.partition)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Discard in-memory state and load the chats of `partition`
    /// (`None` selects the `local` partition).
    pub fn activate(&mut self, partition: Option<&str>) {
        self.partition = partition
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(LOCAL_PARTITION)
            .to_string();
        self.chats.clear();
        self.active = None;
        self.open.clear();

        let chats_key = self.key(CHATS_KEY);
        match self.port.get(&chats_key) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Chat>>(&raw) {
                Ok(chats) => self.chats = chats,
                Err(e) => error!(target: "streamchat::transcript", partition = %self.partition, error = %e, "stored chats unreadable, starting empty"),
            },
            Ok(None) => debug!(target: "streamchat::transcript", partition = %self.partition, "no stored chats"),
            Err(e) => {
                error!(target: "streamchat::transcript", partition = %self.partition, error = %e, "failed to read chats");
                self.persistence_error = Some(e);
            }
        }
        self.chats.sort_by(|a, b| b.id.cmp(&a.id));

        let last_active = self.port.get(&self.key(LAST_ACTIVE_KEY)).ok().flatten();
        self.active = match last_active {
            Some(id) if self.chat(&id).is_some() => Some(id),
            _ => self.chats.first().map(|c| c.id.clone()),
        };
        debug!(
            target: "streamchat::transcript",
            partition = %self.partition,
            chats = self.chats.len(),
            active = ?self.active,
            "transcript loaded"
        );
    }

    /// Drop in-memory state without touching persisted records.
    pub fn reset(&mut self) {
        self.chats.clear();
        self.active = None;
        self.open.clear();
    }

    fn persist(&mut self) {
        let chats_key = self.key(CHATS_KEY);
        let active_key = self.key(LAST_ACTIVE_KEY);
        let result = serde_json::to_string(&self.chats)
            .map_err(ChatError::from)
            .and_then(|json| self.port.set(&chats_key, &json))
            .and_then(|_| match &self.active {
                Some(id) => self.port.set(&active_key, id),
                None => self.port.remove(&active_key),
            });
        if let Err(e) = result {
            error!(target: "streamchat::transcript", partition = %self.partition, error = %e, "failed to save chat history");
            self.persistence_error = Some(e);
        }
    }

    // -- chats --------------------------------------------------------------

    /// New empty chat at the front of the list; it becomes active.
    pub fn create_chat(&mut self) -> String {
        let chat = Chat::new();
        let id = chat.id.clone();
        self.chats.insert(0, chat);
        self.active = Some(id.clone());
        self.persist();
        id
    }

    pub fn set_active(&mut self, id: Option<&str>) -> Result<(), ChatError> {
        if let Some(id) = id {
            if self.chat(id).is_none() {
                return Err(ChatError::chat_not_found(id));
            }
        }
        self.active = id.map(str::to_string);
        self.persist();
        Ok(())
    }

    pub fn rename_chat(&mut self, id: &str, title: &str) -> Result<(), ChatError> {
        let chat = self.chat_mut(id)?;
        let trimmed = title.trim();
        chat.title = if trimmed.is_empty() { UNTITLED_TITLE.to_string() } else { trimmed.to_string() };
        self.persist();
        Ok(())
    }

    /// Remove a chat. If it was active, the first remaining chat (or none)
    /// becomes active.
    pub fn delete_chat(&mut self, id: &str) -> Result<Chat, ChatError> {
        let idx = self
            .chats
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| ChatError::chat_not_found(id))?;
        let removed = self.chats.remove(idx);
        for m in &removed.messages {
            self.open.remove(&m.id);
        }
        if self.active.as_deref() == Some(id) {
            self.active = self.chats.first().map(|c| c.id.clone());
        }
        self.persist();
        Ok(removed)
    }

    pub fn clear_chat(&mut self, id: &str) -> Result<(), ChatError> {
        let chat = self.chat_mut(id)?;
        let dropped: Vec<String> = chat.messages.drain(..).map(|m| m.id).collect();
        for m in dropped {
            self.open.remove(&m);
        }
        self.persist();
        Ok(())
    }

    fn chat_mut(&mut self, id: &str) -> Result<&mut Chat, ChatError> {
        self.chats
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| ChatError::chat_not_found(id))
    }

    // -- messages -----------------------------------------------------------

    /// Append a finished message. The first user message of a chat still
    /// carrying the default title renames it.
    pub fn add_message(
        &mut self,
        chat_id: &str,
        role: Role,
        content: &str,
        kind: MessageKind,
    ) -> Result<String, ChatError> {
        let chat = self.chat_mut(chat_id)?;
        let id = ids::message_id();
        chat.messages.push(Message {
            id: id.clone(),
            role,
            content: content.to_string(),
            kind,
            response_time: None,
        });
        if role == Role::User
            && chat.title == DEFAULT_TITLE
            && chat.messages.iter().filter(|m| m.role == Role::User).count() == 1
        {
            chat.title = derive_title(content);
            debug!(target: "streamchat::transcript", chat_id = %chat_id, title = %chat.title, "derived chat title");
        }
        self.persist();
        Ok(id)
    }

    /// Append an empty assistant message that stays open for streaming.
    pub fn add_placeholder(&mut self, chat_id: &str) -> Result<String, ChatError> {
        let id = self.add_message(chat_id, Role::Assistant, "", MessageKind::Text)?;
        self.open.insert(id.clone());
        Ok(id)
    }

    /// Replace the content of an open message. In memory only.
    pub fn apply_partial(&mut self, chat_id: &str, message_id: &str, content: &str) -> Result<(), ChatError> {
        if !self.open.contains(message_id) {
            return Err(ChatError::message_not_found(message_id));
        }
        let msg = self
            .chat_mut(chat_id)?
            .message_mut(message_id)
            .ok_or_else(|| ChatError::message_not_found(message_id))?;
        msg.content.clear();
        msg.content.push_str(content);
        Ok(())
    }

    /// Close an open assistant message with its final content, kind and
    /// response time.
    pub fn finalize_message(
        &mut self,
        chat_id: &str,
        message_id: &str,
        content: &str,
        kind: MessageKind,
        response_time: Option<f64>,
    ) -> Result<(), ChatError> {
        if !self.open.contains(message_id) {
            return Err(ChatError::message_not_found(message_id));
        }
        let msg = self
            .chat_mut(chat_id)?
            .message_mut(message_id)
            .ok_or_else(|| ChatError::message_not_found(message_id))?;
        msg.content = content.to_string();
        msg.kind = kind;
        if msg.role == Role::Assistant {
            msg.response_time = response_time.map(round_seconds);
        }
        self.open.remove(message_id);
        self.persist();
        Ok(())
    }

    /// Remove a message. Returns whether anything was removed.
    pub fn remove_message(&mut self, chat_id: &str, message_id: &str) -> bool {
        self.open.remove(message_id);
        let Some(chat) = self.chats.iter_mut().find(|c| c.id == chat_id) else {
            return false;
        };
        let before = chat.messages.len();
        chat.messages.retain(|m| m.id != message_id);
        let removed = chat.messages.len() != before;
        if removed {
            self.persist();
        }
        removed
    }

    /// Request history for a chat: every message except assistant messages
    /// that are empty or errors.
    pub fn history_for_request(&self, chat_id: &str) -> Result<Vec<ChatMessage>, ChatError> {
        let chat = self.chat(chat_id).ok_or_else(|| ChatError::chat_not_found(chat_id))?;
        Ok(chat
            .messages
            .iter()
            .filter(|m| !(m.role == Role::Assistant && (m.content.is_empty() || m.kind == MessageKind::Error)))
            .map(|m| ChatMessage { role: m.role, content: m.content.clone() })
            .collect())
    }
}
