//! Per-session actors.
//!
//! All mutation for a session flows through its actor's mailbox: prompts,
//! model changes, and queue nudges. Stop requests set a cancellation flag
//! observed by the running turn at every yield point; the stop outcome is
//! delivered to waiters when the turn finalizes.

pub mod compact;
pub mod context;
pub mod status;
mod turn;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use wuhu_domain::config::ServerConfig;
use wuhu_domain::entry::{EntryPayload, SessionEntry, CUSTOM_ASYNC_CALLBACK};
use wuhu_domain::error::{Error, Result};
use wuhu_domain::queue::{QueueItem, QueueLane, QueuePayload, UrgentSource};
use wuhu_domain::session::ModelSelection;
use wuhu_providers::ProviderRegistry;
use wuhu_store::{reconcile_session, QueueStore, TranscriptStore};

use crate::hub::{SessionEvent, SubscriptionHub};
use crate::runners::RunnerRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcomes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum PromptOutcome {
    /// The prompt started a turn; the user entry is already appended.
    Started { user_entry: SessionEntry },
    /// A turn was in flight; the prompt was queued.
    Queued { lane: QueueLane, item: QueueItem },
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopOutcome {
    pub stop_entry: Option<SessionEntry>,
    pub repaired_entries: Vec<SessionEntry>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOutcome {
    pub applied: bool,
    pub selection: ModelSelection,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Dependencies & shared actor state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<ServerConfig>,
    pub transcripts: TranscriptStore,
    pub queues: QueueStore,
    pub providers: Arc<ProviderRegistry>,
    pub runners: Arc<RunnerRegistry>,
    pub hub: Arc<SubscriptionHub>,
}

pub(crate) enum SessionCommand {
    Prompt {
        text: String,
        user: Option<String>,
        reply: oneshot::Sender<Result<SessionEntry>>,
    },
    ApplyModel {
        selection: ModelSelection,
        reply: oneshot::Sender<Result<()>>,
    },
    Nudge,
}

/// State shared between the actor task and external callers (stop and
/// set-model must act while a turn is in flight, when the mailbox is not
/// being read).
pub(crate) struct Shared {
    busy: AtomicBool,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
    stop_waiters: parking_lot::Mutex<Vec<oneshot::Sender<StopOutcome>>>,
    pending_model: parking_lot::Mutex<Option<ModelSelection>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            cancel: parking_lot::Mutex::new(None),
            stop_waiters: parking_lot::Mutex::new(Vec::new()),
            pending_model: parking_lot::Mutex::new(None),
        }
    }

    /// Deliver the stop outcome to every waiter and clear the turn state.
    pub(crate) fn finish_turn(&self, outcome: StopOutcome) {
        *self.cancel.lock() = None;
        self.busy.store(false, Ordering::Release);
        for waiter in self.stop_waiters.lock().drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    pub(crate) fn begin_turn(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock() = Some(token.clone());
        self.busy.store(true, Ordering::Release);
        token
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
    shared: Arc<Shared>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    deps: SessionDeps,
    actors: parking_lot::Mutex<HashMap<String, SessionHandle>>,
}

impl SessionManager {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            actors: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    pub fn deps(&self) -> &SessionDeps {
        &self.deps
    }

    fn handle(&self, session_id: &str) -> SessionHandle {
        let mut actors = self.actors.lock();
        if let Some(handle) = actors.get(session_id) {
            return handle.clone();
        }
        let handle = spawn_actor(self.deps.clone(), session_id.to_owned());
        actors.insert(session_id.to_owned(), handle.clone());
        handle
    }

    /// Reconcile all sessions after a restart and resume any that were
    /// mid-execution.
    pub async fn recover_all(&self) -> Result<()> {
        for record in self.deps.transcripts.list_sessions(None).await? {
            let repaired =
                reconcile_session(&self.deps.transcripts, &self.deps.queues, &record.id).await?;
            if !repaired.is_empty() {
                tracing::info!(
                    session_id = %record.id,
                    entries = repaired.len(),
                    "repaired transcript after restart"
                );
            }
            let entries = self.deps.transcripts.read_all(&record.id).await?;
            let mut owed = status::work_owed(&entries);
            if !owed {
                // Queued input that never reached a drain checkpoint also
                // restarts the loop.
                for lane in QueueLane::ALL {
                    if !self.deps.queues.pending(&record.id, lane).await?.is_empty() {
                        owed = true;
                        break;
                    }
                }
            }
            if owed {
                tracing::info!(session_id = %record.id, "resuming mid-execution session");
                self.handle(&record.id).nudge();
            }
        }
        Ok(())
    }

    /// Route a prompt: start a turn when the session is idle, queue it
    /// when one is in flight (`steer` unless the caller picked a lane).
    pub async fn prompt(
        &self,
        session_id: &str,
        text: String,
        user: Option<String>,
        lane: Option<QueueLane>,
    ) -> Result<PromptOutcome> {
        let handle = self.handle(session_id);

        let queue_to = match lane {
            Some(QueueLane::SystemUrgent) => {
                return Err(Error::Config(
                    "the system_urgent lane has no user-facing producer".into(),
                ))
            }
            Some(lane) => Some(lane),
            None if handle.shared.busy.load(Ordering::Acquire) => Some(QueueLane::Steer),
            None => None,
        };

        match queue_to {
            Some(lane) => {
                let payload = QueuePayload::UserMessage {
                    user,
                    text,
                };
                let (item, journal) = self
                    .deps
                    .queues
                    .enqueue(session_id, lane, payload)
                    .await?;
                self.deps
                    .hub
                    .emit(
                        session_id,
                        SessionEvent::UserQueue {
                            lane,
                            journal: vec![journal],
                        },
                    )
                    .await;
                handle.nudge();
                Ok(PromptOutcome::Queued { lane, item })
            }
            None => {
                let (reply, rx) = oneshot::channel();
                handle
                    .tx
                    .send(SessionCommand::Prompt { text, user, reply })
                    .await
                    .map_err(|_| Error::ExecutorFault("session actor is gone".into()))?;
                let user_entry = rx
                    .await
                    .map_err(|_| Error::ExecutorFault("session actor dropped reply".into()))??;
                Ok(PromptOutcome::Started { user_entry })
            }
        }
    }

    /// Stop the in-flight turn, if any. Stop during idle writes nothing.
    pub async fn stop(&self, session_id: &str) -> Result<StopOutcome> {
        let handle = self.handle(session_id);
        let waiter = {
            let cancel = handle.shared.cancel.lock();
            match cancel.as_ref() {
                None => return Ok(StopOutcome::default()),
                Some(token) => {
                    let (tx, rx) = oneshot::channel();
                    handle.shared.stop_waiters.lock().push(tx);
                    token.cancel();
                    rx
                }
            }
        };
        waiter
            .await
            .map_err(|_| Error::ExecutorFault("session actor dropped stop outcome".into()))
    }

    /// Change the model. Applied immediately during idle; pending until
    /// the next idle boundary otherwise.
    pub async fn set_model(
        &self,
        session_id: &str,
        selection: ModelSelection,
    ) -> Result<ModelOutcome> {
        let handle = self.handle(session_id);

        if handle.shared.busy.load(Ordering::Acquire) {
            *handle.shared.pending_model.lock() = Some(selection.clone());
            return Ok(ModelOutcome {
                applied: false,
                selection,
            });
        }

        let (reply, rx) = oneshot::channel();
        handle
            .tx
            .send(SessionCommand::ApplyModel {
                selection: selection.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::ExecutorFault("session actor is gone".into()))?;
        rx.await
            .map_err(|_| Error::ExecutorFault("session actor dropped reply".into()))??;
        Ok(ModelOutcome {
            applied: true,
            selection,
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Actor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl SessionHandle {
    fn nudge(&self) {
        // A full mailbox already guarantees a wakeup.
        let _ = self.tx.try_send(SessionCommand::Nudge);
    }
}

fn spawn_actor(deps: SessionDeps, session_id: String) -> SessionHandle {
    let (tx, mut rx) = mpsc::channel::<SessionCommand>(64);
    let shared = Arc::new(Shared::new());
    let self_tx = tx.clone();
    let actor_shared = shared.clone();

    tokio::spawn(async move {
        tracing::debug!(session_id = %session_id, "session actor started");

        while let Some(command) = rx.recv().await {
            match command {
                SessionCommand::Prompt { text, user, reply } => {
                    let appended =
                        append_user_entry(&deps, &session_id, text, user).await;
                    match appended {
                        Ok(entry) => {
                            let _ = reply.send(Ok(entry));
                            run_work(&deps, &session_id, &actor_shared, &self_tx, true).await;
                        }
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    }
                }
                SessionCommand::ApplyModel { selection, reply } => {
                    let _ = reply.send(apply_model(&deps, &session_id, &selection).await);
                }
                SessionCommand::Nudge => {
                    run_work(&deps, &session_id, &actor_shared, &self_tx, false).await;
                }
            }
        }

        tracing::debug!(session_id = %session_id, "session actor stopped");
    });

    SessionHandle { tx, shared }
}

async fn append_user_entry(
    deps: &SessionDeps,
    session_id: &str,
    text: String,
    user: Option<String>,
) -> Result<SessionEntry> {
    let payload = EntryPayload::user_text(user, text);
    append_emit(deps, session_id, payload).await
}

async fn apply_model(
    deps: &SessionDeps,
    session_id: &str,
    selection: &ModelSelection,
) -> Result<()> {
    deps.transcripts
        .update_settings(session_id, selection)
        .await?;
    append_emit(
        deps,
        session_id,
        EntryPayload::SessionSettings {
            provider: selection.provider,
            model: selection.model.clone(),
            reasoning_effort: selection.reasoning_effort,
        },
    )
    .await?;
    deps.hub
        .emit(
            session_id,
            SessionEvent::SettingsUpdated {
                selection: selection.clone(),
            },
        )
        .await;
    Ok(())
}

/// Append one entry and emit it to subscribers without a gap.
pub(crate) async fn append_emit(
    deps: &SessionDeps,
    session_id: &str,
    payload: EntryPayload,
) -> Result<SessionEntry> {
    let mut guard = deps.hub.guard(session_id).await;
    let entry = deps.transcripts.append(session_id, payload, None).await?;
    guard.emit(SessionEvent::TranscriptAppended {
        entry: entry.clone(),
    });
    Ok(entry)
}

/// Run turns until the queues are dry or a stop lands.
async fn run_work(
    deps: &SessionDeps,
    session_id: &str,
    shared: &Arc<Shared>,
    self_tx: &mpsc::Sender<SessionCommand>,
    prompt_appended: bool,
) {
    let cancel = shared.begin_turn();
    deps.hub
        .emit(
            session_id,
            SessionEvent::StatusUpdated {
                status: wuhu_domain::session::SessionStatus::Executing {
                    pending_tool_call_ids: Vec::new(),
                },
            },
        )
        .await;

    let mut first = true;
    let outcome = loop {
        // Turn-boundary checkpoint: all three lanes in priority order.
        let drained = match drain_turn_boundary(deps, session_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(session_id, error = %e, "queue drain failed");
                break StopOutcome::default();
            }
        };

        // A turn also runs when a prompt was just appended, or when the
        // transcript itself shows unfinished work (crash resume). A
        // stopped session stays stopped until the next prompt.
        let resume = first
            && match deps.transcripts.read_all(session_id).await {
                Ok(entries) => status::work_owed(&entries),
                Err(_) => false,
            };
        if drained == 0 && !(first && prompt_appended) && !resume {
            break StopOutcome::default();
        }
        first = false;

        match turn::run_turn(deps, session_id, &cancel, self_tx).await {
            Ok(turn::TurnEnd::Idle) => continue,
            Ok(turn::TurnEnd::Stopped(outcome)) => break outcome,
            Err(e) => {
                tracing::error!(session_id, error = %e, "turn failed");
                break StopOutcome::default();
            }
        }
    };

    let stopped = outcome.stop_entry.is_some();
    shared.finish_turn(outcome);

    // A model change requested mid-turn applies at this idle boundary,
    // before the next prompt is processed.
    let pending = shared.pending_model.lock().take();
    if let Some(selection) = pending {
        if let Err(e) = apply_model(deps, session_id, &selection).await {
            tracing::error!(session_id, error = %e, "pending model change failed");
        }
    }

    let status = if stopped {
        wuhu_domain::session::SessionStatus::Stopped
    } else {
        wuhu_domain::session::SessionStatus::Idle
    };
    deps.hub
        .emit(session_id, SessionEvent::StatusUpdated { status })
        .await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Queue drains
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn queue_payload_to_entry(lane: QueueLane, item: &QueueItem) -> EntryPayload {
    match &item.payload {
        QueuePayload::UserMessage { user, text } => {
            EntryPayload::user_text(user.clone(), text.clone())
        }
        QueuePayload::SystemNotice { source, text } => EntryPayload::CustomMessage {
            custom_type: CUSTOM_ASYNC_CALLBACK.into(),
            content: vec![wuhu_domain::entry::ContentItem::text(text.clone())],
            details: serde_json::json!({ "source": source }),
            display: false,
            timestamp: chrono::Utc::now(),
        },
    }
}

/// Materialize every pending item of one lane, oldest first. Each
/// materialization is atomic with its transcript append.
pub(crate) async fn drain_lane(
    deps: &SessionDeps,
    session_id: &str,
    lane: QueueLane,
) -> Result<usize> {
    let pending = deps.queues.pending(session_id, lane).await?;
    let count = pending.len();
    for item in pending {
        let payload = queue_payload_to_entry(lane, &item);
        let mut guard = deps.hub.guard(session_id).await;
        let (entry, journal) = deps
            .queues
            .materialize_with_append(session_id, lane, item.item_id, payload, None)
            .await?;
        guard.emit(SessionEvent::TranscriptAppended { entry });
        let event = match lane {
            QueueLane::SystemUrgent => SessionEvent::SystemUrgentQueue {
                journal: vec![journal],
            },
            QueueLane::Steer | QueueLane::FollowUp => SessionEvent::UserQueue {
                lane,
                journal: vec![journal],
            },
        };
        guard.emit(event);
    }
    Ok(count)
}

async fn drain_turn_boundary(deps: &SessionDeps, session_id: &str) -> Result<usize> {
    let mut total = 0;
    for lane in QueueLane::ALL {
        total += drain_lane(deps, session_id, lane).await?;
    }
    Ok(total)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Async tool completions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Build the async-completion callback for a session's tool executor:
/// enqueue the outcome on the system-urgent lane and nudge the actor.
pub(crate) fn async_completion_callback(
    deps: SessionDeps,
    session_id: String,
    self_tx: mpsc::Sender<SessionCommand>,
) -> wuhu_tools::AsyncTaskCallback {
    Arc::new(move |outcome| {
        let deps = deps.clone();
        let session_id = session_id.clone();
        let self_tx = self_tx.clone();
        tokio::spawn(async move {
            let text = serde_json::json!({
                "task_id": outcome.task_id,
                "command": outcome.command,
                "duration": outcome.duration_ms,
                "exit_code": outcome.exit_code,
                "output": outcome.output,
            })
            .to_string();
            let payload = QueuePayload::SystemNotice {
                source: UrgentSource::AsyncBashCallback,
                text,
            };
            match deps
                .queues
                .enqueue(&session_id, QueueLane::SystemUrgent, payload)
                .await
            {
                Ok((_, journal)) => {
                    deps.hub
                        .emit(
                            &session_id,
                            SessionEvent::SystemUrgentQueue {
                                journal: vec![journal],
                            },
                        )
                        .await;
                    let _ = self_tx.try_send(SessionCommand::Nudge);
                }
                Err(e) => {
                    tracing::error!(
                        session_id = %session_id,
                        error = %e,
                        "failed to enqueue async completion"
                    );
                }
            }
        });
    })
}
