use super::*;

async fn memory_store() -> SqliteStore {
    SqliteStore::new("sqlite::memory:").await.expect("db")
}

fn alice() -> ParticipantId {
    ParticipantId::new("alice")
}

fn bob() -> ParticipantId {
    ParticipantId::new("bob")
}

fn new_call(caller: &ParticipantId, receiver: &ParticipantId) -> NewCallSession {
    NewCallSession {
        caller_id: caller.clone(),
        caller_label: format!("{caller} label"),
        receiver_id: receiver.clone(),
        receiver_label: format!("{receiver} label"),
        media_kind: MediaKind::Video,
    }
}

fn sample_candidate(seq: u16) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{seq} 1 udp 2122260223 192.0.2.{seq} 54400 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

fn history_attempt(
    session: &CallSession,
    owner: &ParticipantId,
    direction: CallDirection,
    status: CallStatus,
) -> NewHistoryEntry {
    let other = session.other_party(owner).expect("party of session").clone();
    let other_label = session.label_of(&other).expect("label").to_string();
    NewHistoryEntry {
        owner_id: owner.clone(),
        call_id: session.call_id,
        other_id: other,
        other_label,
        direction,
        media_kind: session.media_kind,
        status,
        started_at: session.created_at,
    }
}

async fn created(store: &SqliteStore, new_session: NewCallSession) -> CallSession {
    match store.create_session(new_session).await.expect("create") {
        SessionCreate::Created(session) => session,
        SessionCreate::Live(session) => panic!("expected a fresh session, got {session:?}"),
    }
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let store = memory_store().await;
    store.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("nested").join("calls.db");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let store = SqliteStore::new(&database_url).await.expect("db");
    drop(store);

    assert!(db_path.exists(), "database file should exist: {}", db_path.display());
}

#[tokio::test]
async fn create_session_is_order_independent() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;
    assert_eq!(session.pair_key.as_str(), "alice_bob");
    assert_eq!(session.status, CallStatus::Ringing);

    // The other side dialing the same pair sees the live document, not a new one.
    match store.create_session(new_call(&bob(), &alice())).await.expect("create") {
        SessionCreate::Live(live) => {
            assert_eq!(live.pair_key, session.pair_key);
            assert_eq!(live.call_id, session.call_id);
            assert_eq!(live.caller_id, alice());
        }
        SessionCreate::Created(_) => panic!("second create must observe the live session"),
    }
}

#[tokio::test]
async fn recycled_sessions_get_a_fresh_lifecycle() {
    let store = memory_store().await;
    let first = created(&store, new_call(&alice(), &bob())).await;
    store
        .set_offer(&first.pair_key, &alice(), &SessionDescription {
            kind: "offer".into(),
            payload: "v1".into(),
        })
        .await
        .expect("offer");
    store
        .append_candidate(&first.pair_key, CallRole::Caller, &sample_candidate(1))
        .await
        .expect("append");
    store
        .finalize_session(&first.pair_key, CallStatus::Missed, Utc::now())
        .await
        .expect("finalize");

    let mut rx = store.subscribe();
    let second = created(&store, new_call(&bob(), &alice())).await;
    assert_eq!(second.pair_key, first.pair_key);
    assert_ne!(second.call_id, first.call_id);
    assert_eq!(second.status, CallStatus::Ringing);
    assert_eq!(second.caller_id, bob());
    assert!(second.offer.is_none());
    assert!(second.ended_at.is_none());

    // The recycle is announced only after the purge commits, so a subscriber
    // snapshotting the logs on this event cannot see the old lifecycle.
    match rx.recv().await.expect("event") {
        StoreEvent::SessionChanged { session } => assert_eq!(session.call_id, second.call_id),
        other => panic!("expected SessionChanged, got {other:?}"),
    }
    let stale = store
        .list_candidates(&first.pair_key, CallRole::Caller)
        .await
        .expect("list");
    assert!(stale.is_empty(), "recycle must purge old candidate logs");
}

#[tokio::test]
async fn offer_and_answer_write_once_by_role() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;
    let pair = &session.pair_key;
    let offer = SessionDescription {
        kind: "offer".into(),
        payload: "offer-sdp".into(),
    };
    let answer = SessionDescription {
        kind: "answer".into(),
        payload: "answer-sdp".into(),
    };

    // No answer before the offer exists.
    assert!(!store.set_answer(pair, &bob(), &answer).await.expect("answer"));
    // Only the recorded caller writes the offer.
    assert!(!store.set_offer(pair, &bob(), &offer).await.expect("offer"));
    assert!(store.set_offer(pair, &alice(), &offer).await.expect("offer"));
    // The duplicate is a silent no-op.
    let duplicate = SessionDescription {
        kind: "offer".into(),
        payload: "offer-sdp-v2".into(),
    };
    assert!(!store.set_offer(pair, &alice(), &duplicate).await.expect("offer"));

    assert!(!store.set_answer(pair, &alice(), &answer).await.expect("answer"));
    assert!(store.set_answer(pair, &bob(), &answer).await.expect("answer"));
    assert!(!store.set_answer(pair, &bob(), &answer).await.expect("answer"));

    let loaded = store.load_session(pair).await.expect("load").expect("session");
    assert_eq!(loaded.offer.expect("offer").payload, "offer-sdp");
    assert_eq!(loaded.answer.expect("answer").payload, "answer-sdp");
}

#[tokio::test]
async fn accept_requires_the_recorded_receiver() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;

    assert!(store
        .accept_session(&session.pair_key, &alice())
        .await
        .expect("accept")
        .is_none());

    let accepted = store
        .accept_session(&session.pair_key, &bob())
        .await
        .expect("accept")
        .expect("session");
    assert_eq!(accepted.status, CallStatus::Connected);

    // Idempotent: the session is no longer ringing.
    assert!(store
        .accept_session(&session.pair_key, &bob())
        .await
        .expect("accept")
        .is_none());
}

#[tokio::test]
async fn finalize_transitions_are_monotonic() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;
    let pair = &session.pair_key;

    // `ended` only applies to connected sessions.
    assert!(store
        .finalize_session(pair, CallStatus::Ended, Utc::now())
        .await
        .expect("finalize")
        .is_none());

    let ended_at = Utc::now();
    let missed = store
        .finalize_session(pair, CallStatus::Missed, ended_at)
        .await
        .expect("finalize")
        .expect("session");
    assert_eq!(missed.status, CallStatus::Missed);

    // Terminal once written: no rewrite to another terminal status.
    assert!(store
        .finalize_session(pair, CallStatus::Declined, Utc::now())
        .await
        .expect("finalize")
        .is_none());

    let loaded = store.load_session(pair).await.expect("load").expect("session");
    assert_eq!(loaded.status, CallStatus::Missed);
    assert_eq!(loaded.ended_at, Some(ended_at));

    // Live targets are never a finalization.
    assert!(store
        .finalize_session(pair, CallStatus::Connected, Utc::now())
        .await
        .expect("finalize")
        .is_none());
}

#[tokio::test]
async fn candidate_logs_append_in_order_per_role() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;
    let pair = &session.pair_key;

    for seq in 1..=3 {
        store
            .append_candidate(pair, CallRole::Caller, &sample_candidate(seq))
            .await
            .expect("append")
            .expect("record");
    }
    store
        .append_candidate(pair, CallRole::Receiver, &sample_candidate(9))
        .await
        .expect("append")
        .expect("record");

    let caller_log = store.list_candidates(pair, CallRole::Caller).await.expect("list");
    assert_eq!(caller_log.len(), 3);
    assert!(caller_log.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(
        caller_log
            .iter()
            .map(|r| r.candidate.candidate.as_str())
            .collect::<Vec<_>>(),
        vec![
            sample_candidate(1).candidate.as_str(),
            sample_candidate(2).candidate.as_str(),
            sample_candidate(3).candidate.as_str(),
        ]
    );

    let receiver_log = store.list_candidates(pair, CallRole::Receiver).await.expect("list");
    assert_eq!(receiver_log.len(), 1);
    assert_eq!(receiver_log[0].role, CallRole::Receiver);
}

#[tokio::test]
async fn candidates_are_dropped_once_terminal() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;
    store
        .finalize_session(&session.pair_key, CallStatus::Missed, Utc::now())
        .await
        .expect("finalize");

    let appended = store
        .append_candidate(&session.pair_key, CallRole::Caller, &sample_candidate(1))
        .await
        .expect("append");
    assert!(appended.is_none());
    assert!(store
        .list_candidates(&session.pair_key, CallRole::Caller)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn clear_candidates_is_idempotent() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;
    store
        .append_candidate(&session.pair_key, CallRole::Caller, &sample_candidate(1))
        .await
        .expect("append")
        .expect("record");

    store.clear_candidates(&session.pair_key).await.expect("clear");
    assert!(store
        .list_candidates(&session.pair_key, CallRole::Caller)
        .await
        .expect("list")
        .is_empty());
    store.clear_candidates(&session.pair_key).await.expect("clear again");
}

#[tokio::test]
async fn glare_swap_normalizes_roles_and_resets_negotiation() {
    let store = memory_store().await;
    // Bob's dial won the create race, so the document starts inverted.
    let session = created(&store, new_call(&bob(), &alice())).await;
    let pair = &session.pair_key;
    store
        .set_offer(pair, &bob(), &SessionDescription {
            kind: "offer".into(),
            payload: "bob-offer".into(),
        })
        .await
        .expect("offer");
    store
        .append_candidate(pair, CallRole::Caller, &sample_candidate(1))
        .await
        .expect("append")
        .expect("record");
    store
        .append_candidate(pair, CallRole::Receiver, &sample_candidate(2))
        .await
        .expect("append")
        .expect("record");

    let resolved = store
        .resolve_glare(pair, &alice())
        .await
        .expect("glare")
        .expect("session");
    assert_eq!(resolved.caller_id, alice());
    assert_eq!(resolved.receiver_id, bob());
    assert_eq!(resolved.caller_label, "alice label");
    assert_eq!(resolved.receiver_label, "bob label");
    assert_eq!(resolved.status, CallStatus::Connected);
    assert_eq!(resolved.call_id, session.call_id);
    assert!(resolved.offer.is_none());
    assert!(resolved.answer.is_none());
    assert!(store
        .list_candidates(pair, CallRole::Caller)
        .await
        .expect("list")
        .is_empty());
    assert!(store
        .list_candidates(pair, CallRole::Receiver)
        .await
        .expect("list")
        .is_empty());

    // A second resolve finds nothing ringing to swap.
    assert!(store.resolve_glare(pair, &alice()).await.expect("glare").is_none());

    // The settled caller may now publish a fresh offer into the cleared slot.
    assert!(store
        .set_offer(pair, &alice(), &SessionDescription {
            kind: "offer".into(),
            payload: "alice-offer".into(),
        })
        .await
        .expect("offer"));
    // A stale retry from the pre-swap caller no longer lands.
    assert!(!store
        .set_offer(pair, &bob(), &SessionDescription {
            kind: "offer".into(),
            payload: "bob-offer-retry".into(),
        })
        .await
        .expect("offer"));
}

#[tokio::test]
async fn glare_swap_requires_the_inverted_ringing_shape() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;

    // Roles already settled the right way.
    assert!(store
        .resolve_glare(&session.pair_key, &alice())
        .await
        .expect("glare")
        .is_none());

    store
        .accept_session(&session.pair_key, &bob())
        .await
        .expect("accept")
        .expect("session");
    assert!(store
        .resolve_glare(&session.pair_key, &bob())
        .await
        .expect("glare")
        .is_none());
}

#[tokio::test]
async fn history_records_then_finalizes_write_once() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;

    let first = store
        .record_history(history_attempt(
            &session,
            &alice(),
            CallDirection::Outgoing,
            CallStatus::Ringing,
        ))
        .await
        .expect("record");
    assert!(first.id.0 > 0);
    assert_eq!(first.status, CallStatus::Ringing);
    assert!(first.reason.is_none());

    let refreshed = store
        .record_history(history_attempt(
            &session,
            &alice(),
            CallDirection::Outgoing,
            CallStatus::Connected,
        ))
        .await
        .expect("record");
    assert_eq!(refreshed.id, first.id, "same lifecycle upserts one row");
    assert_eq!(refreshed.status, CallStatus::Connected);

    let ended_at = Utc::now();
    store
        .finalize_history(
            history_attempt(&session, &alice(), CallDirection::Outgoing, CallStatus::Ended),
            EndReason::HungUp,
            ended_at,
        )
        .await
        .expect("finalize");

    let entries = store.list_history(&alice()).await.expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, CallStatus::Ended);
    assert_eq!(entries[0].reason, Some(EndReason::HungUp));
    assert_eq!(entries[0].ended_at, Some(ended_at));

    // Write-once: a later finalize cannot rewrite the outcome.
    store
        .finalize_history(
            history_attempt(&session, &alice(), CallDirection::Outgoing, CallStatus::Declined),
            EndReason::Declined,
            Utc::now(),
        )
        .await
        .expect("finalize");
    let entries = store.list_history(&alice()).await.expect("list");
    assert_eq!(entries[0].status, CallStatus::Ended);
    assert_eq!(entries[0].ended_at, Some(ended_at));
}

#[tokio::test]
async fn finalize_history_inserts_a_missing_entry() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;

    store
        .finalize_history(
            history_attempt(&session, &bob(), CallDirection::Incoming, CallStatus::Missed),
            EndReason::Missed,
            Utc::now(),
        )
        .await
        .expect("finalize");

    let entries = store.list_history(&bob()).await.expect("list");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].direction, CallDirection::Incoming);
    assert_eq!(entries[0].other_id, alice());
    assert_eq!(entries[0].other_label, "alice label");
    assert_eq!(entries[0].status, CallStatus::Missed);
}

#[tokio::test]
async fn delete_history_skips_foreign_ids() {
    let store = memory_store().await;
    let session = created(&store, new_call(&alice(), &bob())).await;

    let alice_entry = store
        .record_history(history_attempt(
            &session,
            &alice(),
            CallDirection::Outgoing,
            CallStatus::Ringing,
        ))
        .await
        .expect("record");
    let bob_entry = store
        .record_history(history_attempt(
            &session,
            &bob(),
            CallDirection::Incoming,
            CallStatus::Ringing,
        ))
        .await
        .expect("record");

    let removed = store
        .delete_history(
            &alice(),
            &[alice_entry.id, bob_entry.id, HistoryEntryId(424242)],
        )
        .await
        .expect("delete");
    assert_eq!(removed, 1, "only the owner's entry goes");
    assert!(store.list_history(&alice()).await.expect("list").is_empty());
    assert_eq!(store.list_history(&bob()).await.expect("list").len(), 1);

    let removed = store.delete_history(&alice(), &[]).await.expect("delete");
    assert_eq!(removed, 0);
}

#[tokio::test]
async fn list_history_is_newest_first() {
    let store = memory_store().await;
    let carol = ParticipantId::new("carol");

    let first = created(&store, new_call(&alice(), &bob())).await;
    store
        .record_history(history_attempt(
            &first,
            &alice(),
            CallDirection::Outgoing,
            CallStatus::Ringing,
        ))
        .await
        .expect("record");

    let second = created(&store, new_call(&alice(), &carol)).await;
    let mut later = history_attempt(&second, &alice(), CallDirection::Outgoing, CallStatus::Ringing);
    later.started_at = first.created_at + chrono::Duration::seconds(5);
    store.record_history(later).await.expect("record");

    let entries = store.list_history(&alice()).await.expect("list");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].other_id, carol);
    assert_eq!(entries[1].other_id, bob());
}

#[tokio::test]
async fn store_changes_fan_out_as_events() {
    let store = memory_store().await;
    let mut rx = store.subscribe();

    let session = created(&store, new_call(&alice(), &bob())).await;
    match rx.recv().await.expect("event") {
        StoreEvent::SessionChanged { session: changed } => {
            assert_eq!(changed.pair_key, session.pair_key);
            assert_eq!(changed.status, CallStatus::Ringing);
        }
        other => panic!("expected SessionChanged, got {other:?}"),
    }

    store
        .append_candidate(&session.pair_key, CallRole::Caller, &sample_candidate(1))
        .await
        .expect("append")
        .expect("record");
    match rx.recv().await.expect("event") {
        StoreEvent::CandidateAdded { record } => {
            assert_eq!(record.pair_key, session.pair_key);
            assert_eq!(record.role, CallRole::Caller);
        }
        other => panic!("expected CandidateAdded, got {other:?}"),
    }

    store.clear_candidates(&session.pair_key).await.expect("clear");
    match rx.recv().await.expect("event") {
        StoreEvent::CandidatesCleared { pair_key } => assert_eq!(pair_key, session.pair_key),
        other => panic!("expected CandidatesCleared, got {other:?}"),
    }

    store
        .record_history(history_attempt(
            &session,
            &alice(),
            CallDirection::Outgoing,
            CallStatus::Ringing,
        ))
        .await
        .expect("record");
    match rx.recv().await.expect("event") {
        StoreEvent::HistoryChanged { owner_id } => assert_eq!(owner_id, alice()),
        other => panic!("expected HistoryChanged, got {other:?}"),
    }
}
