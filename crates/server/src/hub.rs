//! The subscription hub: subscribe-first, then-backfill fan-out of session
//! events.
//!
//! Subscribers register under a session-local async lock while their
//! backfill is read from the store, so no event can be emitted between
//! registration and backfill. The session actor takes the same lock around
//! each write+emit pair (via [`SubscriptionHub::guard`]), which makes the
//! live stream exactly consistent with a post-hoc `read`.
//!
//! `stream_*` events are ephemeral: they are not replayable, but the
//! current partial assistant text is included in `initial_state` for
//! subscribers that attach mid-inference.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};

use wuhu_domain::entry::SessionEntry;
use wuhu_domain::queue::{QueueBackfill, QueueJournalEntry, QueueLane};
use wuhu_domain::session::{ModelSelection, SessionRecord, SessionStatus};

/// Default transcript page size for backfills.
pub const TRANSCRIPT_PAGE_SIZE: usize = 200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Events
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Live events delivered to subscribers, in actor emission order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    TranscriptAppended { entry: SessionEntry },
    SystemUrgentQueue { journal: Vec<QueueJournalEntry> },
    UserQueue {
        lane: QueueLane,
        journal: Vec<QueueJournalEntry>,
    },
    SettingsUpdated { selection: ModelSelection },
    StatusUpdated { status: SessionStatus },
    StreamBegan,
    StreamDelta { delta: String },
    StreamEnded,
}

/// Snapshot delivered before any live event.
#[derive(Debug, Clone, Serialize)]
pub struct InitialState {
    pub session: SessionRecord,
    pub status: SessionStatus,
    /// Entries after the subscriber's cursor, in cursor order.
    pub transcript: Vec<SessionEntry>,
    pub system_urgent: QueueBackfill,
    pub steer: QueueBackfill,
    pub follow_up: QueueBackfill,
    /// Partial assistant text when subscribed mid-inference (ephemeral).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial_assistant: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeCursors {
    pub transcript_since: Option<u64>,
    pub system_since: Option<u64>,
    pub steer_since: Option<u64>,
    pub follow_up_since: Option<u64>,
}

pub struct Subscription {
    pub initial: InitialState,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
struct SessionChannel {
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
    /// Text of the in-flight assistant message, if any.
    partial_assistant: Option<String>,
}

pub struct SubscriptionHub {
    channels: parking_lot::Mutex<HashMap<String, Arc<Mutex<SessionChannel>>>>,
}

impl Default for SubscriptionHub {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self {
            channels: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, session_id: &str) -> Arc<Mutex<SessionChannel>> {
        self.channels
            .lock()
            .entry(session_id.to_owned())
            .or_default()
            .clone()
    }

    /// Take the session's emission lock. The actor holds the guard across
    /// each store-write + emit pair so a concurrent subscriber cannot
    /// observe the write in its backfill *and* receive the emit.
    pub async fn guard(&self, session_id: &str) -> EmitGuard {
        EmitGuard {
            inner: self.channel(session_id).lock_owned().await,
        }
    }

    /// Emit without an explicit guard (takes and releases the lock).
    pub async fn emit(&self, session_id: &str, event: SessionEvent) {
        self.guard(session_id).await.emit(event);
    }

    /// Register a subscriber and build its backfill atomically.
    ///
    /// `backfill` reads the initial state from the store; it runs while the
    /// session's emission lock is held, so no event can land between the
    /// reads and the registration. A failed backfill registers nothing.
    pub async fn subscribe<F, Fut>(
        &self,
        session_id: &str,
        backfill: F,
    ) -> wuhu_domain::Result<Subscription>
    where
        F: FnOnce(Option<String>) -> Fut,
        Fut: std::future::Future<Output = wuhu_domain::Result<InitialState>>,
    {
        let channel = self.channel(session_id);
        let mut locked = channel.lock().await;
        let initial = backfill(locked.partial_assistant.clone()).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        locked.subscribers.push(tx);
        drop(locked);
        Ok(Subscription {
            initial,
            events: rx,
        })
    }

    /// Current subscriber count (monitoring/tests).
    pub async fn subscriber_count(&self, session_id: &str) -> usize {
        self.channel(session_id).lock().await.subscribers.len()
    }
}

/// Held by the actor for the duration of one write+emit pair.
pub struct EmitGuard {
    inner: OwnedMutexGuard<SessionChannel>,
}

impl EmitGuard {
    pub fn emit(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::StreamBegan => {
                self.inner.partial_assistant = Some(String::new());
            }
            SessionEvent::StreamDelta { delta } => {
                if let Some(partial) = &mut self.inner.partial_assistant {
                    partial.push_str(delta);
                }
            }
            SessionEvent::StreamEnded => {
                self.inner.partial_assistant = None;
            }
            _ => {}
        }
        self.inner
            .subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
