//! Subscription semantics: subscribe-then-backfill, reconnect exactness,
//! and the prompt/follow event bridge ordering guarantees.

mod common;

use std::time::Duration;

use common::*;
use wuhu_domain::entry::{ContentItem, EntryPayload};
use wuhu_domain::queue::{QueueJournalRecord, QueueLane, QueuePayload};
use wuhu_domain::session::SessionStatus;
use wuhu_server::hub::{InitialState, SessionEvent, SubscribeCursors, Subscription};
use wuhu_server::session::status;
use wuhu_server::state::AppState;

/// Test-side subscription helper mirroring the API layer's backfill: read
/// the snapshot inside the hub's session lock.
async fn subscribe(
    state: &AppState,
    session_id: &str,
    cursors: SubscribeCursors,
) -> Subscription {
    let state = state.clone();
    let id = session_id.to_owned();
    state
        .hub
        .clone()
        .subscribe(session_id, move |partial_assistant| async move {
            let session = state
                .transcripts
                .get_session(&id)
                .await?
                .expect("session exists");
            let all = state.transcripts.read_all(&id).await?;
            let status = status::infer(&all);
            let transcript = state
                .transcripts
                .read(&id, cursors.transcript_since, None)
                .await?;
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
        .await
        .unwrap()
}

#[tokio::test]
async fn reconnect_receives_exactly_the_missed_entries() {
    let ws = tempfile::tempdir().unwrap();
    let provider = MockProvider::new(vec![text_response("one"), text_response("two")]);
    let state = test_state(provider).await;
    create_session(&state, "s1", ws.path()).await;

    // First connection: observe the first exchange live.
    let mut sub = subscribe(&state, "s1", SubscribeCursors::default()).await;
    assert_eq!(sub.initial.transcript.len(), 1); // header

    state
        .sessions
        .prompt("s1", "first".into(), None, None)
        .await
        .unwrap();
    assert_eq!(wait_settled(&state, "s1").await, SessionStatus::Idle);

    let mut seen = Vec::new();
    while let Ok(event) = sub.events.try_recv() {
        if let SessionEvent::TranscriptAppended { entry } = event {
            seen.push(entry.entry_id);
        }
    }
    assert_eq!(seen, vec![2, 3]); // user + assistant

    // Disconnect, miss a whole turn, reconnect with the recorded cursors.
    let transcript_cursor = *seen.last().unwrap();
    let steer_cursor = sub.initial.steer.cursor;
    drop(sub);

    state
        .sessions
        .prompt("s1", "second".into(), None, None)
        .await
        .unwrap();
    assert_eq!(wait_settled(&state, "s1").await, SessionStatus::Idle);

    let sub2 = subscribe(
        &state,
        "s1",
        SubscribeCursors {
            transcript_since: Some(transcript_cursor),
            steer_since: Some(steer_cursor),
            ..Default::default()
        },
    )
    .await;

    // Exactly the missed entries, in order, no duplicates, no gaps.
    let ids: Vec<u64> = sub2
        .initial
        .transcript
        .iter()
        .map(|e| e.entry_id)
        .collect();
    assert_eq!(ids, vec![4, 5]);
    for pair in ids.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }
    assert!(sub2.initial.steer.journal.is_empty());
}

#[tokio::test]
async fn queue_journal_delta_is_exact_on_reconnect() {
    let ws = tempfile::tempdir().unwrap();
    let provider = MockProvider::new(vec![]);
    let state = test_state(provider).await;
    create_session(&state, "s1", ws.path()).await;

    let baseline = state
        .queues
        .snapshot("s1", QueueLane::Steer, None)
        .await
        .unwrap();

    let (item, _) = state
        .queues
        .enqueue(
            "s1",
            QueueLane::Steer,
            QueuePayload::UserMessage {
                user: None,
                text: "queued".into(),
            },
        )
        .await
        .unwrap();
    state
        .queues
        .cancel("s1", QueueLane::Steer, item.item_id)
        .await
        .unwrap();

    let delta = state
        .queues
        .snapshot("s1", QueueLane::Steer, Some(baseline.cursor))
        .await
        .unwrap();
    assert_eq!(delta.journal.len(), 2);
    assert!(matches!(
        &delta.journal[0].record,
        QueueJournalRecord::Enqueued { item } if item.payload.text() == "queued"
    ));
    assert!(matches!(
        &delta.journal[1].record,
        QueueJournalRecord::Canceled { item_id } if *item_id == item.item_id
    ));
    assert!(delta.pending.is_empty());
}

#[tokio::test]
async fn mid_stream_subscriber_gets_partial_text() {
    let ws = tempfile::tempdir().unwrap();
    let provider =
        MockProvider::with_delay(vec![text_response("slow")], Duration::from_millis(200));
    let state = test_state(provider).await;
    create_session(&state, "s1", ws.path()).await;

    state
        .sessions
        .prompt("s1", "hi".into(), None, None)
        .await
        .unwrap();

    // Attach while the text delta has been emitted but the stream has not
    // ended (delays: start at ~200ms, delta at ~400ms, done at ~600ms).
    tokio::time::sleep(Duration::from_millis(500)).await;
    let sub = subscribe(&state, "s1", SubscribeCursors::default()).await;
    assert_eq!(sub.initial.partial_assistant.as_deref(), Some("slow"));

    assert_eq!(wait_settled(&state, "s1").await, SessionStatus::Idle);
}

#[tokio::test]
async fn live_events_follow_backfill_without_duplicates() {
    let ws = tempfile::tempdir().unwrap();
    let provider = MockProvider::new(vec![text_response("reply")]);
    let state = test_state(provider).await;
    create_session(&state, "s1", ws.path()).await;

    let mut sub = subscribe(&state, "s1", SubscribeCursors::default()).await;
    let backfill_tail = sub
        .initial
        .transcript
        .last()
        .map(|e| e.entry_id)
        .unwrap_or(0);

    state
        .sessions
        .prompt("s1", "hello".into(), None, None)
        .await
        .unwrap();
    assert_eq!(wait_settled(&state, "s1").await, SessionStatus::Idle);

    let mut live = Vec::new();
    while let Ok(event) = sub.events.try_recv() {
        if let SessionEvent::TranscriptAppended { entry } = event {
            live.push(entry.entry_id);
        }
    }
    // Every live entry is past the backfill tail and contiguous.
    assert!(!live.is_empty());
    assert_eq!(live[0], backfill_tail + 1);
    for pair in live.windows(2) {
        assert_eq!(pair[1], pair[0] + 1);
    }

    // Stream lifecycle events arrived in order around the deltas.
    // (They were drained above only for transcript entries; a fresh
    // subscriber sees the post-hoc read match the appended ids.)
    let stored: Vec<u64> = entries(&state, "s1")
        .await
        .iter()
        .map(|e| e.entry_id)
        .collect();
    let mut expected = vec![backfill_tail];
    expected.extend(live.clone());
    assert_eq!(stored, expected);
}

#[tokio::test]
async fn cancel_of_materialized_item_is_noop() {
    let ws = tempfile::tempdir().unwrap();
    let provider = MockProvider::new(vec![text_response("after steer")]);
    let state = test_state(provider).await;
    create_session(&state, "s1", ws.path()).await;

    let (item, _) = state
        .queues
        .enqueue(
            "s1",
            QueueLane::Steer,
            QueuePayload::UserMessage {
                user: None,
                text: "steer me".into(),
            },
        )
        .await
        .unwrap();

    // A steer enqueued during idle starts the next turn with the steered
    // message appended.
    state.sessions.recover_all().await.unwrap();
    assert_eq!(wait_settled(&state, "s1").await, SessionStatus::Idle);

    let all = entries(&state, "s1").await;
    assert!(all.iter().any(|e| matches!(&e.payload,
        EntryPayload::UserMessage { content, .. }
            if ContentItem::joined_text(content) == "steer me")));

    // The item was materialized; cancel is a no-op now.
    let canceled = state
        .queues
        .cancel("s1", QueueLane::Steer, item.item_id)
        .await
        .unwrap();
    assert!(canceled.is_none());
}
