//! Conversation log and transcript accumulation
//!
//! The log is append-only except for the in-progress assistant message,
//! which grows in place until it is finalized. The accumulator tracks that
//! message by index so appends never scan the log.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// Who authored a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// Tool call metadata attached to tool messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ToolMeta {
    pub(crate) tool_name: String,
    pub(crate) tool_call_id: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct Message {
    pub(crate) id: Uuid,
    pub(crate) role: Role,
    pub(crate) content: String,
    /// Only meaningful for assistant messages; user and tool messages are created finalized
    pub(crate) finalized: bool,
    pub(crate) meta: Option<ToolMeta>,
    pub(crate) created_at: DateTime<Local>,
}

impl Message {
    fn new(role: Role, content: String, finalized: bool, meta: Option<ToolMeta>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content,
            finalized,
            meta,
            created_at: Local::now(),
        }
    }
}

/// Entry sent to the chat backend as prior context
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub(crate) struct HistoryEntry {
    pub(crate) role: Role,
    pub(crate) content: String,
}

/// Change notifications for incremental rendering
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ConversationEvent {
    Appended { id: Uuid },
    ContentAppended { id: Uuid, chunk: String },
    Finalized { id: Uuid },
    Cleared,
}

/// The ordered conversation log
#[derive(Debug, Default)]
pub(crate) struct Conversation {
    messages: Vec<Message>,
    in_progress: Option<usize>,
    events: Vec<ConversationEvent>,
}

impl Conversation {
    pub(crate) fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub(crate) fn push_user(&mut self, content: &str) -> Uuid {
        self.push(Message::new(Role::User, content.to_string(), true, None))
    }

    /// Append an empty, non-finalized assistant message to stream into
    ///
    /// A still-open assistant message is finalized first so the log never
    /// holds more than one.
    pub(crate) fn begin_assistant(&mut self) -> Uuid {
        if self.in_progress.is_some() {
            warn!("Starting a new assistant message while one is still open");
            self.finalize_assistant();
        }
        let id = self.push(Message::new(Role::Assistant, String::new(), false, None));
        self.in_progress = Some(self.messages.len() - 1);
        debug_assert_eq!(self.open_assistant_count(), 1);
        id
    }

    /// Append text to the in-progress assistant message (no-op when none is open)
    pub(crate) fn append_assistant(&mut self, chunk: &str) {
        let Some(idx) = self.in_progress else {
            if !chunk.is_empty() {
                debug!("Dropping {} chars with no open assistant message", chunk.len());
            }
            return;
        };
        if chunk.is_empty() {
            return;
        }
        let message = &mut self.messages[idx];
        message.content.push_str(chunk);
        self.events.push(ConversationEvent::ContentAppended {
            id: message.id,
            chunk: chunk.to_string(),
        });
    }

    /// Mark the in-progress assistant message finalized (idempotent)
    pub(crate) fn finalize_assistant(&mut self) {
        if let Some(idx) = self.in_progress.take() {
            let message = &mut self.messages[idx];
            message.finalized = true;
            self.events.push(ConversationEvent::Finalized { id: message.id });
        }
    }

    pub(crate) fn push_tool(&mut self, content: String, meta: ToolMeta) -> Uuid {
        self.push(Message::new(Role::Tool, content, true, Some(meta)))
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
        self.in_progress = None;
        self.events.push(ConversationEvent::Cleared);
    }

    /// Prior user and assistant turns, tool messages excluded
    pub(crate) fn history(&self) -> Vec<HistoryEntry> {
        self.messages
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Assistant))
            .map(|m| HistoryEntry {
                role: m.role,
                content: m.content.clone(),
            })
            .collect()
    }

    pub(crate) fn open_assistant_count(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role == Role::Assistant && !m.finalized)
            .count()
    }

    fn push(&mut self, message: Message) -> Uuid {
        let id = message.id;
        self.messages.push(message);
        self.events.push(ConversationEvent::Appended { id });
        id
    }
}

/// Shared handle to the conversation log
///
/// All mutation goes through [`TranscriptAccumulator::update`], which
/// publishes the resulting change events once the lock is released.
#[derive(Clone)]
pub(crate) struct TranscriptAccumulator {
    inner: Arc<Mutex<Conversation>>,
    event_tx: broadcast::Sender<ConversationEvent>,
}

impl TranscriptAccumulator {
    pub(crate) fn new() -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(Conversation::default())),
            event_tx,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConversationEvent> {
        self.event_tx.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, Conversation> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Conversation mutex was poisoned, recovering data");
                poisoned.into_inner()
            }
        }
    }

    /// Apply a mutation atomically and broadcast what changed
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let (result, events) = {
            let mut conversation = self.lock();
            let result = f(&mut *conversation);
            (result, std::mem::take(&mut conversation.events))
        };
        for event in events {
            // No subscribers is fine
            let _ = self.event_tx.send(event);
        }
        result
    }

    /// Read the log without mutating it
    pub(crate) fn read<R>(&self, f: impl FnOnce(&Conversation) -> R) -> R {
        f(&*self.lock())
    }

    pub(crate) fn snapshot(&self) -> Vec<Message> {
        self.read(|c| c.messages().to_vec())
    }

    pub(crate) fn finalize_assistant(&self) {
        self.update(Conversation::finalize_assistant)
    }

    pub(crate) fn clear(&self) {
        self.update(Conversation::clear)
    }
}

impl Default for TranscriptAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
