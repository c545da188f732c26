//! Chat transport coordination
//!
//! One logical send can come back three ways: a server-sent event stream
//! (applied frame by frame as it arrives), a single JSON object, or plain
//! text. The coordinator detects which from the content type and drives the
//! conversation log accordingly.
//!
//! # Cancellation
//! Every log mutation made on behalf of a send happens under the
//! transcript lock after checking the send's cancellation token. Since
//! [`ChatCoordinator::stop`] cancels before it finalizes, nothing from an
//! aborted send reaches the log once the stop is observed. Frames applied
//! before that stay applied.

pub(crate) mod backend;
pub(crate) mod router;

use crate::conversation::{Conversation, TranscriptAccumulator};
use crate::error::ChatError;
use crate::playback::AudioPlayer;
use crate::session::HistoryClearScheduler;
use crate::sse;
use backend::{ByteStream, ChatBackend, ChatRequest};
use futures_util::StreamExt;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// How a chat response was delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportKind {
    EventStream,
    Json,
    PlainText,
}

impl TransportKind {
    pub(crate) fn classify(content_type: &str) -> Self {
        let content_type = content_type.to_ascii_lowercase();
        if content_type.contains("text/event-stream") {
            TransportKind::EventStream
        } else if content_type.contains("application/json") {
            TransportKind::Json
        } else {
            TransportKind::PlainText
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::EventStream => write!(f, "event stream"),
            TransportKind::Json => write!(f, "json"),
            TransportKind::PlainText => write!(f, "text"),
        }
    }
}

struct ActiveSend {
    id: u64,
    cancel: CancellationToken,
}

#[derive(Default)]
struct ChatState {
    active: Option<ActiveSend>,
    next_id: u64,
    last_error: Option<String>,
    last_transport: Option<TransportKind>,
}

struct ChatInner {
    transcript: TranscriptAccumulator,
    backend: Arc<dyn ChatBackend>,
    player: Arc<dyn AudioPlayer>,
    history_clear: HistoryClearScheduler,
    state: Mutex<ChatState>,
    streaming_tx: watch::Sender<bool>,
    log_events: bool,
}

/// Sends user messages and applies the replies to the conversation log
#[derive(Clone)]
pub(crate) struct ChatCoordinator {
    inner: Arc<ChatInner>,
}

impl ChatCoordinator {
    pub(crate) fn new(
        transcript: TranscriptAccumulator,
        backend: Arc<dyn ChatBackend>,
        player: Arc<dyn AudioPlayer>,
        history_clear: HistoryClearScheduler,
        log_events: bool,
    ) -> Self {
        let (streaming_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChatInner {
                transcript,
                backend,
                player,
                history_clear,
                state: Mutex::new(ChatState::default()),
                streaming_tx,
                log_events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ChatState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("Chat state mutex was poisoned, recovering data");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn is_streaming(&self) -> bool {
        *self.inner.streaming_tx.borrow()
    }

    /// Observe whether a send is active
    pub(crate) fn streaming(&self) -> watch::Receiver<bool> {
        self.inner.streaming_tx.subscribe()
    }

    pub(crate) fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    pub(crate) fn clear_last_error(&self) {
        self.state().last_error = None;
    }

    pub(crate) fn last_transport(&self) -> Option<TransportKind> {
        self.state().last_transport
    }

    /// Send a message and apply the reply
    ///
    /// The user message and an empty assistant message are appended before
    /// any network activity. A send started while another is active
    /// replaces it as the cancellable send; callers stop the old one first.
    ///
    /// # Arguments
    /// - `user_text` - Message as typed or dictated, appended to the log verbatim
    ///
    /// # Returns
    /// `Ok(())` once the reply is applied or the send was stopped.
    ///
    /// # Errors
    /// Returns `ChatError` if:
    /// - The endpoint is unreachable or the reply body breaks off (`Network`)
    /// - The endpoint answers with a non-success status (`ServerError`)
    /// - A JSON reply cannot be parsed (`InvalidResponse`)
    ///
    /// Errors are also recorded as the last error, unless the send was stopped.
    #[instrument(skip(self, user_text), fields(len = user_text.len()))]
    pub(crate) async fn send(&self, user_text: &str) -> Result<(), ChatError> {
        let cancel = CancellationToken::new();
        let send_id = {
            let mut st = self.state();
            if st.active.is_some() {
                warn!("Starting a send while another is still active");
            }
            st.next_id += 1;
            st.last_transport = None;
            st.active = Some(ActiveSend {
                id: st.next_id,
                cancel: cancel.clone(),
            });
            st.next_id
        };
        self.inner.history_clear.cancel();
        self.inner.streaming_tx.send_replace(true);

        let request = self.inner.transcript.update(|c| {
            let history = c.history();
            c.push_user(user_text);
            c.begin_assistant();
            ChatRequest {
                message: user_text.to_string(),
                history,
            }
        });

        let result = self.run(&request, &cancel).await;
        if let Err(ref e) = result {
            error!("Chat send failed: {}", e);
            self.apply(&cancel, Conversation::finalize_assistant);
            if !cancel.is_cancelled() {
                self.state().last_error = Some(e.to_string());
            }
        }

        self.finish(send_id);
        result
    }

    /// Abort the active send and finalize its assistant message. No-op when idle.
    pub(crate) fn stop(&self) {
        let active = self.state().active.take();
        if let Some(active) = active {
            active.cancel.cancel();
            info!("Chat send cancelled");
        }
        self.inner.transcript.finalize_assistant();
        self.inner.streaming_tx.send_replace(false);
    }

    fn finish(&self, send_id: u64) {
        let mut st = self.state();
        if st.active.as_ref().map(|a| a.id) == Some(send_id) {
            st.active = None;
            drop(st);
            self.inner.streaming_tx.send_replace(false);
        }
    }

    /// Mutate the log unless the send has been cancelled
    fn apply<R>(
        &self,
        cancel: &CancellationToken,
        f: impl FnOnce(&mut Conversation) -> R,
    ) -> Option<R> {
        self.inner.transcript.update(|c| {
            if cancel.is_cancelled() {
                None
            } else {
                Some(f(c))
            }
        })
    }

    async fn run(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<(), ChatError> {
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            reply = self.inner.backend.send(request) => reply?,
        };

        let kind = TransportKind::classify(&reply.content_type);
        self.state().last_transport = Some(kind);
        info!(transport = %kind, content_type = %reply.content_type, "Chat reply received");

        match kind {
            TransportKind::EventStream => self.consume_event_stream(reply.body, cancel).await,
            TransportKind::Json => self.apply_json(reply.body, cancel).await,
            TransportKind::PlainText => self.apply_text(reply.body, cancel).await,
        }
    }

    async fn consume_event_stream(
        &self,
        body: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let mut frames = Box::pin(sse::decode_stream(body));
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                next = frames.next() => next,
            };
            match next {
                Some(Ok(frame)) => {
                    if self.inner.log_events {
                        debug!(event = %frame.event, data = %frame.data, "Frame");
                    }
                    let Some(effect) = self.apply(cancel, |c| router::route(c, &frame)) else {
                        return Ok(());
                    };
                    if let Some(message) = effect.error {
                        warn!("Chat stream reported error: {}", message);
                        self.state().last_error = Some(message);
                    }
                    if effect.clear_history {
                        self.inner.history_clear.schedule_clear();
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        // End of input finalizes whether or not a done frame arrived
        self.apply(cancel, Conversation::finalize_assistant);
        Ok(())
    }

    async fn apply_json(
        &self,
        body: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let Some(bytes) = read_body(body, cancel).await? else {
            return Ok(());
        };
        let data: Value = serde_json::from_slice(&bytes).map_err(|e| {
            ChatError::InvalidResponse(format!("Failed to parse chat reply: {}", e))
        })?;

        let text = ["reply", "content"]
            .iter()
            .find_map(|key| data.get(*key).and_then(Value::as_str))
            .unwrap_or("");
        let applied = self.apply(cancel, |c| {
            c.append_assistant(text);
            c.finalize_assistant();
        });
        if applied.is_none() {
            return Ok(());
        }

        let audio = data.get("audio").and_then(Value::as_str);
        let mime = data.get("audioMimeType").and_then(Value::as_str);
        if let (Some(audio), Some(mime)) = (audio, mime) {
            // Decoding and launching the player block, and the send does not wait on them
            let player = self.inner.player.clone();
            let (audio, mime) = (audio.to_string(), mime.to_string());
            tokio::task::spawn_blocking(move || {
                if let Err(e) = player.play(&audio, &mime) {
                    warn!("Reply audio playback failed: {}", e);
                }
            });
        }

        if router::history_cleared(&data) {
            self.inner.history_clear.schedule_clear();
        }
        Ok(())
    }

    async fn apply_text(
        &self,
        body: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<(), ChatError> {
        let Some(bytes) = read_body(body, cancel).await? else {
            return Ok(());
        };
        let text = String::from_utf8_lossy(&bytes);
        self.apply(cancel, |c| {
            c.append_assistant(&text);
            c.finalize_assistant();
        });
        Ok(())
    }
}

/// Collect the whole body; `None` when the send was cancelled first
async fn read_body(
    mut body: ByteStream,
    cancel: &CancellationToken,
) -> Result<Option<Vec<u8>>, ChatError> {
    let mut bytes = Vec::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            next = body.next() => next,
        };
        match next {
            Some(chunk) => bytes.extend_from_slice(&chunk?),
            None => break,
        }
    }
    debug!(bytes = bytes.len(), "Chat reply body read");
    Ok(Some(bytes))
}
