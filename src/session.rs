//! Voice session identity and server-directed history clearing

use crate::conversation::TranscriptAccumulator;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// Opaque id scoping one continuous capture interval on the speech backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct VoiceSession {
    id: Uuid,
}

impl VoiceSession {
    pub(crate) fn new() -> Self {
        Self { id: Uuid::new_v4() }
    }

    /// Replace the id so the next capture starts a fresh server-side session
    pub(crate) fn rotate(&mut self) {
        self.id = Uuid::new_v4();
    }
}

impl Default for VoiceSession {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for VoiceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// Debounced single-shot timer that empties the conversation log
///
/// Re-arming cancels the pending clear and restarts the delay, so a burst
/// of directives produces one clear measured from the last of them.
#[derive(Clone)]
pub(crate) struct HistoryClearScheduler {
    delay: Duration,
    transcript: TranscriptAccumulator,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl HistoryClearScheduler {
    pub(crate) fn new(transcript: TranscriptAccumulator, delay: Duration) -> Self {
        Self {
            delay,
            transcript,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    pub(crate) fn schedule_clear(&self) {
        let transcript = self.transcript.clone();
        let delay = self.delay;
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }
        info!(delay_secs = delay.as_secs(), "History clear scheduled");
        *pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            info!("Clearing conversation history");
            transcript.clear();
        }));
    }

    pub(crate) fn cancel(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(handle) = pending.take() {
            handle.abort();
        }
    }
}

impl Drop for HistoryClearScheduler {
    fn drop(&mut self) {
        // Last handle going away disarms the timer
        if Arc::strong_count(&self.pending) == 1 {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationEvent;
    use tokio::sync::broadcast::error::TryRecvError;
    use tokio::time::sleep;

    fn seeded() -> TranscriptAccumulator {
        let transcript = TranscriptAccumulator::new();
        transcript.update(|c| {
            c.push_user("hello");
        });
        transcript
    }

    fn clear_count(rx: &mut tokio::sync::broadcast::Receiver<ConversationEvent>) -> usize {
        let mut count = 0;
        loop {
            match rx.try_recv() {
                Ok(ConversationEvent::Cleared) => count += 1,
                Ok(_) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return count,
                Err(TryRecvError::Lagged(_)) => {}
            }
        }
    }

    #[test]
    fn test_voice_session_rotates() {
        let mut session = VoiceSession::new();
        let before = session;
        session.rotate();
        assert_ne!(before, session);
        assert_eq!(session.to_string().len(), 36);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_fires_after_delay() {
        let transcript = seeded();
        let scheduler = HistoryClearScheduler::new(transcript.clone(), Duration::from_secs(10));
        scheduler.schedule_clear();

        sleep(Duration::from_millis(9_900)).await;
        assert_eq!(transcript.snapshot().len(), 1);

        sleep(Duration::from_millis(200)).await;
        assert!(transcript.snapshot().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_directive_restarts_delay() {
        let transcript = seeded();
        let mut rx = transcript.subscribe();
        let scheduler = HistoryClearScheduler::new(transcript.clone(), Duration::from_secs(10));

        scheduler.schedule_clear();
        sleep(Duration::from_secs(5)).await;
        scheduler.schedule_clear();

        // 11s after the first directive, 6s after the second
        sleep(Duration::from_secs(6)).await;
        assert_eq!(transcript.snapshot().len(), 1);
        assert_eq!(clear_count(&mut rx), 0);

        sleep(Duration::from_secs(5)).await;
        assert!(transcript.snapshot().is_empty());
        assert_eq!(clear_count(&mut rx), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_disarms() {
        let transcript = seeded();
        let scheduler = HistoryClearScheduler::new(transcript.clone(), Duration::from_secs(10));
        scheduler.schedule_clear();
        scheduler.cancel();
        scheduler.cancel();

        sleep(Duration::from_secs(20)).await;
        assert_eq!(transcript.snapshot().len(), 1);
    }
}
