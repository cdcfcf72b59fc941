use axum::{
    body::Body,
    http::{header, Request},
    response::Response,
};
use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use shared::domain::{
    CallDirection, CallStatus, EndReason, IceCandidate, MediaKind, SessionDescription,
};
use tower::ServiceExt;

use super::*;

async fn test_app() -> Router {
    let store = SqliteStore::new("sqlite::memory:").await.expect("db");
    build_router(Arc::new(AppState { store }))
}

fn post_json(uri: &str, body: &impl Serialize) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).expect("encode")))
        .expect("request")
}

fn delete_json(uri: &str, body: &impl Serialize) -> Request<Body> {
    Request::delete(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(serde_json::to_vec(body).expect("encode")))
        .expect("request")
}

async fn json_body<T: DeserializeOwned>(response: Response) -> T {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("decode")
}

fn new_session() -> NewCallSession {
    NewCallSession {
        caller_id: ParticipantId::new("alice"),
        caller_label: "Alice".into(),
        receiver_id: ParticipantId::new("bob"),
        receiver_label: "Bob".into(),
        media_kind: MediaKind::Audio,
    }
}

fn description(kind: &str) -> SessionDescription {
    SessionDescription {
        kind: kind.into(),
        payload: format!("sdp-{kind}"),
    }
}

#[tokio::test]
async fn healthz_reports_ok() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::get("/healthz").body(Body::empty()).expect("request"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn create_call_validates_participants() {
    let app = test_app().await;
    let mut bad = new_session();
    bad.receiver_id = bad.caller_id.clone();
    let response = app
        .oneshot(post_json("/calls", &bad))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn call_lifecycle_over_http() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(post_json("/calls", &new_session()))
        .await
        .expect("create");
    assert_eq!(response.status(), StatusCode::OK);
    let created: CreateCallResponse = json_body(response).await;
    assert!(created.created);
    assert_eq!(created.session.status, CallStatus::Ringing);
    let pair = created.session.pair_key.clone();

    // A second create while the first rings joins the live document.
    let response = app
        .clone()
        .oneshot(post_json("/calls", &new_session()))
        .await
        .expect("recreate");
    let joined: CreateCallResponse = json_body(response).await;
    assert!(!joined.created);
    assert_eq!(joined.session.call_id, created.session.call_id);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/calls/{pair}/offer"),
            &PublishDescriptionRequest {
                writer_id: ParticipantId::new("alice"),
                description: description("offer"),
            },
        ))
        .await
        .expect("offer");
    let published: PublishDescriptionResponse = json_body(response).await;
    assert!(published.wrote);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/calls/{pair}/accept"),
            &AcceptCallRequest {
                receiver_id: ParticipantId::new("bob"),
            },
        ))
        .await
        .expect("accept");
    let accepted: SessionResponse = json_body(response).await;
    assert_eq!(
        accepted.session.expect("accepted session").status,
        CallStatus::Connected
    );

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/calls/{pair}/answer"),
            &PublishDescriptionRequest {
                writer_id: ParticipantId::new("bob"),
                description: description("answer"),
            },
        ))
        .await
        .expect("answer");
    let published: PublishDescriptionResponse = json_body(response).await;
    assert!(published.wrote);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/calls/{pair}/end"),
            &FinalizeCallRequest {
                status: CallStatus::Ended,
                ended_at: Utc::now(),
            },
        ))
        .await
        .expect("end");
    let finalized: SessionResponse = json_body(response).await;
    assert_eq!(
        finalized.session.expect("finalized session").status,
        CallStatus::Ended
    );

    // Finalizing a terminal document matches nothing.
    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/calls/{pair}/end"),
            &FinalizeCallRequest {
                status: CallStatus::Ended,
                ended_at: Utc::now(),
            },
        ))
        .await
        .expect("repeat end");
    let repeated: SessionResponse = json_body(response).await;
    assert!(repeated.session.is_none());

    let response = app
        .oneshot(
            Request::get(format!("/calls/{pair}"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("load");
    let loaded: SessionResponse = json_body(response).await;
    assert_eq!(loaded.session.expect("doc").status, CallStatus::Ended);
}

#[tokio::test]
async fn finalize_rejects_non_terminal_status() {
    let app = test_app().await;
    let response = app
        .clone()
        .oneshot(post_json("/calls", &new_session()))
        .await
        .expect("create");
    let created: CreateCallResponse = json_body(response).await;
    let pair = created.session.pair_key;

    let response = app
        .oneshot(post_json(
            &format!("/calls/{pair}/end"),
            &FinalizeCallRequest {
                status: CallStatus::Connected,
                ended_at: Utc::now(),
            },
        ))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn candidate_routes_append_list_and_clear() {
    let app = test_app().await;
    let response = app
        .clone()
        .oneshot(post_json("/calls", &new_session()))
        .await
        .expect("create");
    let created: CreateCallResponse = json_body(response).await;
    let pair = created.session.pair_key;

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/calls/{pair}/candidates"),
            &AppendCandidateRequest {
                role: CallRole::Caller,
                candidate: IceCandidate {
                    candidate: "candidate:1 1 udp 1 192.0.2.1 4000 typ host".into(),
                    sdp_mid: Some("0".into()),
                    sdp_mline_index: Some(0),
                },
            },
        ))
        .await
        .expect("append");
    let record: Option<CandidateRecord> = json_body(response).await;
    assert!(record.is_some());

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/calls/{pair}/candidates/caller"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("list");
    let records: Vec<CandidateRecord> = json_body(response).await;
    assert_eq!(records.len(), 1);

    let response = app
        .clone()
        .oneshot(
            Request::get(format!("/calls/{pair}/candidates/spectator"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("bad role");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(
            Request::delete(format!("/calls/{pair}/candidates"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("clear");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::get(format!("/calls/{pair}/candidates/caller"))
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("list after clear");
    let records: Vec<CandidateRecord> = json_body(response).await;
    assert!(records.is_empty());
}

#[tokio::test]
async fn history_routes_record_finalize_and_delete() {
    let app = test_app().await;
    let response = app
        .clone()
        .oneshot(post_json("/calls", &new_session()))
        .await
        .expect("create");
    let created: CreateCallResponse = json_body(response).await;

    let entry = NewHistoryEntry {
        owner_id: ParticipantId::new("alice"),
        call_id: created.session.call_id,
        other_id: ParticipantId::new("bob"),
        other_label: "Bob".into(),
        direction: CallDirection::Outgoing,
        media_kind: MediaKind::Audio,
        status: CallStatus::Ringing,
        started_at: created.session.created_at,
    };
    let response = app
        .clone()
        .oneshot(post_json("/history", &entry))
        .await
        .expect("record");
    let stored: CallHistoryEntry = json_body(response).await;
    assert_eq!(stored.status, CallStatus::Ringing);

    let response = app
        .clone()
        .oneshot(post_json(
            "/history/finalize",
            &FinalizeHistoryRequest {
                entry: NewHistoryEntry {
                    status: CallStatus::Ended,
                    ..entry.clone()
                },
                reason: EndReason::HungUp,
                ended_at: Utc::now(),
            },
        ))
        .await
        .expect("finalize");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(
            Request::get("/users/alice/history")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("list");
    let listed: HistoryListResponse = json_body(response).await;
    assert_eq!(listed.entries.len(), 1);
    assert_eq!(listed.entries[0].status, CallStatus::Ended);
    assert_eq!(listed.entries[0].reason, Some(EndReason::HungUp));

    let response = app
        .oneshot(delete_json(
            "/users/alice/history",
            &DeleteHistoryRequest {
                entry_ids: vec![listed.entries[0].id],
            },
        ))
        .await
        .expect("delete");
    let deleted: DeleteHistoryResponse = json_body(response).await;
    assert_eq!(deleted.removed, 1);
}
