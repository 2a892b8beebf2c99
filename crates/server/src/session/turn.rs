//! The agent loop: one turn of drafting and tool execution.
//!
//! The loop is an idempotent reducer over the transcript: each iteration
//! re-reads the log and either finishes an unresolved tool batch (normal
//! flow and crash resume look identical) or runs one LLM inference. Every
//! observation is appended before the loop moves on.

use std::collections::HashSet;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wuhu_domain::entry::{
    ContentItem, EntryPayload, SessionEntry, StopReason, ToolExecutionPhase,
    CUSTOM_EXECUTION_STOPPED, CUSTOM_LLM_GIVE_UP, CUSTOM_LLM_RETRY, EXECUTION_STOPPED_MESSAGE,
    STEER_SKIPPED_MESSAGE,
};
use wuhu_domain::error::Result;
use wuhu_domain::queue::QueueLane;
use wuhu_domain::session::ModelSelection;
use wuhu_domain::stream::{AssistantDraft, AssistantEvent};
use wuhu_domain::tool::ToolCall;
use wuhu_providers::{CacheMode, ModelRequest, RetryPolicy};
use wuhu_tools::builtin_definitions;

use crate::executor::ToolExecutor;
use crate::hub::SessionEvent;

use super::{
    append_emit, async_completion_callback, compact, context, drain_lane, SessionDeps,
    StopOutcome,
};

pub(super) enum TurnEnd {
    Idle,
    Stopped(StopOutcome),
}

enum BatchEnd {
    Completed,
    Preempted,
    Stopped(StopOutcome),
}

pub(super) async fn run_turn(
    deps: &SessionDeps,
    session_id: &str,
    cancel: &CancellationToken,
    self_tx: &mpsc::Sender<super::SessionCommand>,
) -> Result<TurnEnd> {
    loop {
        if cancel.is_cancelled() {
            return Ok(TurnEnd::Stopped(
                finalize_stop(deps, session_id, String::new()).await?,
            ));
        }

        let record = deps
            .transcripts
            .get_session(session_id)
            .await?
            .ok_or_else(|| {
                wuhu_domain::Error::Storage(format!("session '{session_id}' not found"))
            })?;
        let selection = record.selection();
        let entries = deps.transcripts.read_all(session_id).await?;

        // An unfinished tool batch (fresh from drafting, or left behind by
        // a crash) is always completed before the next inference.
        if let Some(calls) = unresolved_batch(&entries) {
            let executor = ToolExecutor::new(
                record.environment.clone(),
                deps.runners.clone(),
                async_completion_callback(deps.clone(), session_id.to_owned(), self_tx.clone()),
            );
            match run_batch(deps, session_id, &executor, &calls, cancel).await? {
                BatchEnd::Completed | BatchEnd::Preempted => continue,
                BatchEnd::Stopped(outcome) => return Ok(TurnEnd::Stopped(outcome)),
            }
        }

        // ── Drafting ───────────────────────────────────────────────
        let mut ctx = context::assemble(&entries, &selection);
        let provider = deps.providers.get(selection.provider)?;

        if compact::should_compact(&ctx, &selection.model) {
            let tokens_before = compact::estimated_tokens(&ctx);
            let freeze = deps.transcripts.tail(session_id).await?.unwrap_or(0);
            match compact::summarize(provider.as_ref(), &selection, &ctx).await {
                Ok(summary) => {
                    append_emit(
                        deps,
                        session_id,
                        compact::compaction_payload(tokens_before, freeze, summary),
                    )
                    .await?;
                    let entries = deps.transcripts.read_all(session_id).await?;
                    ctx = context::assemble(&entries, &selection);
                }
                Err(e) => {
                    tracing::warn!(
                        session_id,
                        error = %e,
                        "compaction failed; continuing with full history"
                    );
                }
            }
        }

        let mut req = ModelRequest::new(selection.model.clone());
        req.system_prompt = ctx.system_prompt.clone();
        req.messages = ctx.messages.clone();
        req.tools = builtin_definitions();
        req.reasoning_effort = selection.reasoning_effort;
        req.session_id = Some(session_id.to_owned());
        req.cache_mode = CacheMode::Automatic;

        // ── Establish the stream, retrying transient failures ──────
        let policy = RetryPolicy::default();
        let mut retry_index = 0u32;
        let stream = loop {
            match provider.stream(&req).await {
                Ok(stream) => break Some(stream),
                Err(e) if e.is_retryable() && retry_index < policy.max_retries => {
                    let backoff = policy.backoff(retry_index);
                    append_emit(
                        deps,
                        session_id,
                        EntryPayload::Custom {
                            custom_type: CUSTOM_LLM_RETRY.into(),
                            data: serde_json::json!({
                                "retry_index": retry_index,
                                "max_retries": policy.max_retries,
                                "backoff_seconds": backoff.as_secs_f64(),
                                "error": e.to_string(),
                                "purpose": "turn",
                            }),
                        },
                    )
                    .await?;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => {
                            return Ok(TurnEnd::Stopped(
                                finalize_stop(deps, session_id, String::new()).await?,
                            ));
                        }
                    }
                    retry_index += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        append_emit(
                            deps,
                            session_id,
                            EntryPayload::Custom {
                                custom_type: CUSTOM_LLM_GIVE_UP.into(),
                                data: serde_json::json!({
                                    "retries": retry_index,
                                    "error": e.to_string(),
                                }),
                            },
                        )
                        .await?;
                    }
                    append_assistant_error(deps, session_id, &selection, &e.to_string(), "")
                        .await?;
                    return Ok(TurnEnd::Idle);
                }
            }
        };
        let mut stream = stream.expect("loop breaks with a stream");

        // ── Accumulate the inference ───────────────────────────────
        deps.hub.emit(session_id, SessionEvent::StreamBegan).await;
        let mut partial_text = String::new();
        let mut draft: Option<AssistantDraft> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Dropping the stream aborts the HTTP request.
                    drop(stream);
                    deps.hub.emit(session_id, SessionEvent::StreamEnded).await;
                    return Ok(TurnEnd::Stopped(
                        finalize_stop(deps, session_id, partial_text).await?,
                    ));
                }
                event = stream.next() => match event {
                    Some(Ok(AssistantEvent::TextDelta { delta })) => {
                        partial_text.push_str(&delta);
                        deps.hub
                            .emit(session_id, SessionEvent::StreamDelta { delta })
                            .await;
                    }
                    Some(Ok(AssistantEvent::Done { message })) => {
                        draft = Some(message);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        deps.hub.emit(session_id, SessionEvent::StreamEnded).await;
                        append_assistant_error(
                            deps,
                            session_id,
                            &selection,
                            &e.to_string(),
                            &partial_text,
                        )
                        .await?;
                        return Ok(TurnEnd::Idle);
                    }
                    None => {
                        deps.hub.emit(session_id, SessionEvent::StreamEnded).await;
                        append_assistant_error(
                            deps,
                            session_id,
                            &selection,
                            "provider stream ended before completion",
                            &partial_text,
                        )
                        .await?;
                        return Ok(TurnEnd::Idle);
                    }
                }
            }
        }
        let draft = draft.expect("loop breaks with a draft");

        let has_tool_calls = draft
            .content
            .iter()
            .any(|c| matches!(c, ContentItem::ToolCall { .. }));

        {
            let mut guard = deps.hub.guard(session_id).await;
            let entry = deps
                .transcripts
                .append(
                    session_id,
                    EntryPayload::AssistantMessage {
                        provider: selection.provider,
                        model: selection.model.clone(),
                        content: draft.content,
                        usage: draft.usage,
                        stop_reason: draft.stop_reason,
                        error_message: None,
                        timestamp: chrono::Utc::now(),
                    },
                    None,
                )
                .await?;
            guard.emit(SessionEvent::TranscriptAppended { entry });
            guard.emit(SessionEvent::StreamEnded);
        }

        if !has_tool_calls {
            return Ok(TurnEnd::Idle);
        }
        // Tool calls are picked up as the unresolved batch next iteration.
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool batch
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_batch(
    deps: &SessionDeps,
    session_id: &str,
    executor: &ToolExecutor,
    calls: &[ToolCall],
    cancel: &CancellationToken,
) -> Result<BatchEnd> {
    for (idx, call) in calls.iter().enumerate() {
        if cancel.is_cancelled() {
            return Ok(BatchEnd::Stopped(
                finalize_stop(deps, session_id, String::new()).await?,
            ));
        }

        // Pre-tool checkpoint: async notifications first, then steers.
        drain_lane(deps, session_id, QueueLane::SystemUrgent).await?;

        if !deps
            .queues
            .pending(session_id, QueueLane::Steer)
            .await?
            .is_empty()
        {
            // A queued user message preempts the rest of the batch: the
            // remaining calls are skipped with error results, and the
            // steered message lands after them.
            for skipped in &calls[idx..] {
                append_emit(
                    deps,
                    session_id,
                    EntryPayload::error_tool_result(
                        skipped.id.clone(),
                        skipped.name.clone(),
                        STEER_SKIPPED_MESSAGE,
                    ),
                )
                .await?;
            }
            drain_lane(deps, session_id, QueueLane::Steer).await?;
            return Ok(BatchEnd::Preempted);
        }

        append_emit(
            deps,
            session_id,
            EntryPayload::ToolExecution {
                phase: ToolExecutionPhase::Start,
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: Some(call.arguments.clone()),
                result: None,
                is_error: None,
            },
        )
        .await?;

        let result = executor
            .execute(
                session_id,
                &call.id,
                &call.name,
                call.arguments.clone(),
                cancel.clone(),
            )
            .await;

        append_emit(
            deps,
            session_id,
            EntryPayload::ToolExecution {
                phase: ToolExecutionPhase::End,
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: None,
                result: Some(serde_json::to_value(&result)?),
                is_error: Some(result.is_error),
            },
        )
        .await?;

        append_emit(
            deps,
            session_id,
            EntryPayload::ToolResultMessage {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                content: result.content,
                details: result.details,
                is_error: result.is_error,
                timestamp: chrono::Utc::now(),
            },
        )
        .await?;
    }

    Ok(BatchEnd::Completed)
}

/// The unresolved tool calls of the most recent assistant message, unless
/// a later user input or stop marker supersedes them.
fn unresolved_batch(entries: &[SessionEntry]) -> Option<Vec<ToolCall>> {
    let resolved: HashSet<&str> = entries
        .iter()
        .filter_map(|e| match &e.payload {
            EntryPayload::ToolResultMessage { tool_call_id, .. } => Some(tool_call_id.as_str()),
            _ => None,
        })
        .collect();

    for entry in entries.iter().rev() {
        match &entry.payload {
            EntryPayload::AssistantMessage { content, .. } => {
                let remaining: Vec<ToolCall> = content
                    .iter()
                    .filter_map(|c| match c {
                        ContentItem::ToolCall {
                            id,
                            name,
                            arguments,
                            item_id,
                        } if !resolved.contains(id.as_str()) => Some(ToolCall {
                            id: id.clone(),
                            name: name.clone(),
                            arguments: arguments.clone(),
                            item_id: item_id.clone(),
                        }),
                        _ => None,
                    })
                    .collect();
                return (!remaining.is_empty()).then_some(remaining);
            }
            // Newer user input (or a stop) supersedes the old batch.
            EntryPayload::UserMessage { .. } => return None,
            EntryPayload::CustomMessage { custom_type, .. } => {
                if custom_type == CUSTOM_EXECUTION_STOPPED {
                    return None;
                }
            }
            _ => {}
        }
    }
    None
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Terminal paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn append_assistant_error(
    deps: &SessionDeps,
    session_id: &str,
    selection: &ModelSelection,
    message: &str,
    partial_text: &str,
) -> Result<()> {
    let content = if partial_text.is_empty() {
        Vec::new()
    } else {
        vec![ContentItem::text(partial_text)]
    };
    append_emit(
        deps,
        session_id,
        EntryPayload::AssistantMessage {
            provider: selection.provider,
            model: selection.model.clone(),
            content,
            usage: None,
            stop_reason: StopReason::Error,
            error_message: Some(message.to_owned()),
            timestamp: chrono::Utc::now(),
        },
    )
    .await?;
    Ok(())
}

/// The stop-repair flow: append the partial assistant (if any deltas
/// arrived), resolve every pending tool call with a synthetic error
/// result, and mark the transcript with an execution-stopped entry.
async fn finalize_stop(
    deps: &SessionDeps,
    session_id: &str,
    partial_text: String,
) -> Result<StopOutcome> {
    let record = deps.transcripts.get_session(session_id).await?;

    if !partial_text.is_empty() {
        if let Some(record) = &record {
            append_emit(
                deps,
                session_id,
                EntryPayload::AssistantMessage {
                    provider: record.provider,
                    model: record.model.clone(),
                    content: vec![ContentItem::text(partial_text)],
                    usage: None,
                    stop_reason: StopReason::Stop,
                    error_message: Some(EXECUTION_STOPPED_MESSAGE.into()),
                    timestamp: chrono::Utc::now(),
                },
            )
            .await?;
        }
    }

    let entries = deps.transcripts.read_all(session_id).await?;
    let pending = unresolved_batch(&entries)
        .unwrap_or_default()
        .into_iter()
        .map(|c| (c.id, c.name))
        .collect::<Vec<_>>();

    let repaired = deps.transcripts.repair(session_id, &pending).await?;
    {
        let mut guard = deps.hub.guard(session_id).await;
        for entry in &repaired {
            guard.emit(SessionEvent::TranscriptAppended {
                entry: entry.clone(),
            });
        }
    }

    let stop_entry = append_emit(
        deps,
        session_id,
        EntryPayload::custom_text(
            CUSTOM_EXECUTION_STOPPED,
            EXECUTION_STOPPED_MESSAGE,
            true,
        ),
    )
    .await?;

    tracing::info!(
        session_id,
        repaired = repaired.len(),
        "execution stopped by user"
    );

    Ok(StopOutcome {
        stop_entry: Some(stop_entry),
        repaired_entries: repaired,
    })
}
