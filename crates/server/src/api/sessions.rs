//! Session endpoints: create, list, read, prompt (SSE or detached), stop,
//! model change, and follow (SSE).

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json};
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use wuhu_domain::entry::{EntryPayload, SessionEntry};
use wuhu_domain::queue::QueueLane;
use wuhu_domain::session::{
    ModelSelection, ProviderKind, ReasoningEffort, SessionRecord, SessionStatus,
};

use crate::hub::{InitialState, SessionEvent, Subscription, SubscribeCursors};
use crate::session::{status, PromptOutcome, StopOutcome};
use crate::state::AppState;
use crate::{environment, DEFAULT_SYSTEM_PROMPT};

use super::error::ApiError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream event shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SessionStreamEvent {
    EntryAppended { entry: SessionEntry },
    AssistantTextDelta { delta: String },
    Idle,
    Done,
}

impl SessionStreamEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionStreamEvent::EntryAppended { .. } => "entry_appended",
            SessionStreamEvent::AssistantTextDelta { .. } => "assistant_text_delta",
            SessionStreamEvent::Idle => "idle",
            SessionStreamEvent::Done => "done",
        }
    }

    fn to_sse(&self) -> Event {
        Event::default()
            .event(self.name())
            .data(serde_json::to_string(self).unwrap_or_default())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Create / list / read
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Named environment; defaults to the server's working directory.
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub parent_session_id: Option<String>,
}

pub async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<SessionRecord>, ApiError> {
    let session_id = format!("sess_{}", uuid::Uuid::new_v4().as_simple());

    let environment = environment::resolve(
        &state.config,
        &state.runners,
        &session_id,
        body.environment.as_deref(),
    )
    .await?;

    let record = state
        .transcripts
        .create_session(wuhu_store::NewSession {
            id: session_id.clone(),
            selection: ModelSelection {
                provider: body.provider,
                model: body.model,
                reasoning_effort: body.reasoning_effort,
            },
            environment: environment.clone(),
            cwd: environment.cwd.clone(),
            parent_session_id: body.parent_session_id,
        })
        .await?;

    // The header is always entry 1.
    let system_prompt = body
        .system_prompt
        .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
    state
        .transcripts
        .append(&session_id, EntryPayload::Header { system_prompt }, None)
        .await?;

    tracing::info!(
        session_id = %session_id,
        provider = record.provider.as_str(),
        model = %record.model,
        environment = %environment.name,
        "session created"
    );

    let record = state
        .transcripts
        .get_session(&session_id)
        .await?
        .expect("session was just created");
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SessionRecord>>, ApiError> {
    Ok(Json(state.transcripts.list_sessions(query.limit).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadQuery {
    #[serde(default)]
    pub since_cursor: Option<u64>,
    #[serde(default)]
    pub since_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session: SessionRecord,
    pub status: SessionStatus,
    pub transcript: Vec<SessionEntry>,
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Result<Json<SessionView>, ApiError> {
    let session = require_session(&state, &id).await?;
    let all = state.transcripts.read_all(&id).await?;
    let status = status::infer(&all);
    let transcript = state
        .transcripts
        .read(&id, query.since_cursor, query.since_time)
        .await?;
    Ok(Json(SessionView {
        session,
        status,
        transcript,
    }))
}

async fn require_session(state: &AppState, id: &str) -> Result<SessionRecord, ApiError> {
    state
        .transcripts
        .get_session(id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no session '{id}'")))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub input: String,
    #[serde(default)]
    pub user: Option<String>,
    /// When true, return the queued/appended entry instead of streaming.
    #[serde(default)]
    pub detach: bool,
    /// Explicit lane: `steer` or `follow_up`. Default: start a turn when
    /// idle, steer when one is in flight.
    #[serde(default)]
    pub queue: Option<QueueLane>,
}

pub async fn prompt(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PromptRequest>,
) -> Result<axum::response::Response, ApiError> {
    require_session(&state, &id).await?;

    if body.detach {
        let outcome = state
            .sessions
            .prompt(&id, body.input, body.user, body.queue)
            .await?;
        let json = match outcome {
            PromptOutcome::Started { user_entry } => {
                serde_json::json!({ "userEntry": user_entry })
            }
            PromptOutcome::Queued { lane, item } => {
                serde_json::json!({ "queued": { "lane": lane, "item": item } })
            }
        };
        return Ok(Json(json).into_response());
    }

    // Subscribe first so nothing between the prompt and the stream is lost.
    let tail = state.transcripts.tail(&id).await?;
    let subscription = subscribe_backfilled(
        &state,
        &id,
        SubscribeCursors {
            transcript_since: tail,
            ..Default::default()
        },
    )
    .await?;

    state
        .sessions
        .prompt(&id, body.input, body.user, body.queue)
        .await?;

    let stream = bridge_stream(subscription, tail.unwrap_or(0), BridgeMode::Prompt);
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stop / model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
pub struct StopRequest {
    #[serde(default)]
    pub user: Option<String>,
}

pub async fn stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(_body): Json<StopRequest>,
) -> Result<Json<StopOutcome>, ApiError> {
    require_session(&state, &id).await?;
    Ok(Json(state.sessions.stop(&id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetModelRequest {
    pub provider: ProviderKind,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub reasoning_effort: Option<ReasoningEffort>,
}

#[derive(Debug, Serialize)]
pub struct SetModelResponse {
    pub applied: bool,
    pub selection: ModelSelection,
}

pub async fn set_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SetModelRequest>,
) -> Result<Json<SetModelResponse>, ApiError> {
    let record = require_session(&state, &id).await?;
    let selection = ModelSelection {
        provider: body.provider,
        model: body.model.unwrap_or(record.model),
        reasoning_effort: body.reasoning_effort,
    };
    let outcome = state.sessions.set_model(&id, selection).await?;
    Ok(Json(SetModelResponse {
        applied: outcome.applied,
        selection: outcome.selection,
    }))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Follow
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowQuery {
    #[serde(default)]
    pub since_cursor: Option<u64>,
    #[serde(default)]
    pub since_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stop_after_idle: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

pub async fn follow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<FollowQuery>,
) -> Result<axum::response::Response, ApiError> {
    require_session(&state, &id).await?;

    let subscription = subscribe_backfilled(
        &state,
        &id,
        SubscribeCursors {
            transcript_since: query.since_cursor,
            ..Default::default()
        },
    )
    .await?;

    let last_cursor = subscription
        .initial
        .transcript
        .last()
        .map(|e| e.entry_id)
        .or(query.since_cursor)
        .unwrap_or(0);

    let stream = bridge_stream(
        subscription,
        last_cursor,
        BridgeMode::Follow {
            stop_after_idle: query.stop_after_idle,
            timeout: query.timeout_seconds.map(std::time::Duration::from_secs),
        },
    );
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::default())
        .into_response())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Subscription plumbing
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Register with the hub, reading the initial state inside its lock.
pub(crate) async fn subscribe_backfilled(
    state: &AppState,
    session_id: &str,
    cursors: SubscribeCursors,
) -> Result<Subscription, ApiError> {
    let state = state.clone();
    let id = session_id.to_owned();
    let subscription = state
        .hub
        .clone()
        .subscribe(session_id, move |partial_assistant| async move {
            let session = state
                .transcripts
                .get_session(&id)
                .await?
                .ok_or_else(|| wuhu_domain::Error::Storage(format!("no session '{id}'")))?;
            let all = state.transcripts.read_all(&id).await?;
            let status = status::infer(&all);
            // Page the backfill out of the store; the snapshot still
            // carries every entry past the cursor.
            let mut transcript = Vec::new();
            let mut cursor = cursors.transcript_since;
            loop {
                let page = state
                    .transcripts
                    .read_page(&id, cursor, crate::hub::TRANSCRIPT_PAGE_SIZE)
                    .await?;
                let Some(last) = page.last() else { break };
                cursor = Some(last.entry_id);
                let full_page = page.len() == crate::hub::TRANSCRIPT_PAGE_SIZE;
                transcript.extend(page);
                if !full_page {
                    break;
                }
            }
            Ok(InitialState {
                session,
                status,
                transcript,
                system_urgent: state
                    .queues
                    .snapshot(&id, QueueLane::SystemUrgent, cursors.system_since)
                    .await?,
                steer: state
                    .queues
                    .snapshot(&id, QueueLane::Steer, cursors.steer_since)
                    .await?,
                follow_up: state
                    .queues
                    .snapshot(&id, QueueLane::FollowUp, cursors.follow_up_since)
                    .await?,
                partial_assistant,
            })
        })
        .await?;
    Ok(subscription)
}

enum BridgeMode {
    /// One-turn stream for `POST /prompt`: ends at the first idle (or
    /// stopped) transition after the prompt.
    Prompt,
    /// Long-lived stream for `GET /follow`.
    Follow {
        stop_after_idle: bool,
        timeout: Option<std::time::Duration>,
    },
}

/// Bridge a hub subscription into the v2 SSE event stream.
///
/// Backfilled entries replay as `entry_appended`; live transcript events
/// at or below the backfill cursor are dropped (the guard protocol makes
/// them impossible in practice, the filter keeps reconnects airtight).
fn bridge_stream(
    subscription: Subscription,
    mut last_cursor: u64,
    mode: BridgeMode,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let Subscription { initial, mut events } = subscription;

    async_stream::stream! {
        for entry in initial.transcript {
            last_cursor = entry.entry_id;
            yield Ok(SessionStreamEvent::EntryAppended { entry }.to_sse());
        }

        let prompt_mode = matches!(mode, BridgeMode::Prompt);
        let (stop_after_idle, timeout) = match mode {
            BridgeMode::Prompt => (true, None),
            BridgeMode::Follow {
                stop_after_idle,
                timeout,
            } => {
                if !matches!(
                    initial.status,
                    SessionStatus::Executing { .. }
                ) {
                    yield Ok(SessionStreamEvent::Idle.to_sse());
                    if stop_after_idle {
                        yield Ok(SessionStreamEvent::Done.to_sse());
                        return;
                    }
                }
                (stop_after_idle, timeout)
            }
        };

        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut idle_grace: Option<tokio::time::Instant> = None;
        // Prompt mode must not end on an idle transition left over from
        // earlier work; wait until this prompt's entries have streamed.
        let mut saw_entry = false;

        loop {
            let wake = [deadline, idle_grace].into_iter().flatten().min();

            let event = match wake {
                Some(wake) => {
                    match tokio::time::timeout_at(wake, events.recv()).await {
                        Ok(event) => event,
                        Err(_) => {
                            // Idle grace elapsed or wall clock exhausted.
                            yield Ok(SessionStreamEvent::Done.to_sse());
                            return;
                        }
                    }
                }
                None => events.recv().await,
            };

            let Some(event) = event else {
                yield Ok(SessionStreamEvent::Done.to_sse());
                return;
            };

            match event {
                SessionEvent::TranscriptAppended { entry } => {
                    if entry.entry_id > last_cursor {
                        last_cursor = entry.entry_id;
                        saw_entry = true;
                        yield Ok(SessionStreamEvent::EntryAppended { entry }.to_sse());
                    }
                }
                SessionEvent::StreamDelta { delta } => {
                    yield Ok(SessionStreamEvent::AssistantTextDelta { delta }.to_sse());
                }
                SessionEvent::StatusUpdated { status } => {
                    if !matches!(status, SessionStatus::Executing { .. }) {
                        if prompt_mode && !saw_entry {
                            continue;
                        }
                        yield Ok(SessionStreamEvent::Idle.to_sse());
                        if prompt_mode {
                            yield Ok(SessionStreamEvent::Done.to_sse());
                            return;
                        }
                        if stop_after_idle {
                            // End once the session stays idle for 500ms.
                            idle_grace = Some(
                                tokio::time::Instant::now()
                                    + std::time::Duration::from_millis(500),
                            );
                        }
                    } else {
                        idle_grace = None;
                    }
                }
                // Queue and settings changes have no v2 SSE representation.
                _ => {}
            }
        }
    }
}
