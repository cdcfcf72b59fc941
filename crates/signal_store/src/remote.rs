//! [`SignalStore`] over a `signal_server` instance: REST for the operations,
//! a WebSocket pump for the change feed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use shared::domain::{
    CallHistoryEntry, CallRole, CallSession, CallStatus, CandidateRecord, EndReason,
    HistoryEntryId, IceCandidate, NewCallSession, NewHistoryEntry, PairKey, ParticipantId,
    SessionDescription,
};
use shared::protocol::{
    AcceptCallRequest, AppendCandidateRequest, CreateCallResponse, DeleteHistoryRequest,
    DeleteHistoryResponse, FinalizeCallRequest, FinalizeHistoryRequest, HistoryListResponse,
    PublishDescriptionRequest, PublishDescriptionResponse, ResolveGlareRequest, SessionResponse,
    StoreEvent,
};

use crate::{SessionCreate, SignalStore, StoreError, EVENT_CAPACITY};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

pub struct RemoteStore {
    http: reqwest::Client,
    base_url: String,
    events: broadcast::Sender<StoreEvent>,
    pump: JoinHandle<()>,
}

impl RemoteStore {
    /// Connects the change feed for `participant` and returns the store
    /// handle. The feed reconnects on its own after stream loss; REST calls
    /// are independent of it.
    pub fn connect(base_url: impl Into<String>, participant: &ParticipantId) -> Arc<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let ws_url = format!(
            "{}/ws?participant={}",
            base_url.replacen("http", "ws", 1),
            participant
        );
        let pump = tokio::spawn(pump_events(ws_url, events.clone()));
        Arc::new(Self {
            http: reqwest::Client::new(),
            base_url,
            events,
            pump,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for RemoteStore {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_events(ws_url: String, events: broadcast::Sender<StoreEvent>) {
    loop {
        match connect_async(ws_url.as_str()).await {
            Ok((stream, _)) => {
                tracing::debug!(url = %ws_url, "store event stream connected");
                let (_write, mut read) = stream.split();
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            match serde_json::from_str::<StoreEvent>(&text) {
                                Ok(event) => {
                                    let _ = events.send(event);
                                }
                                Err(err) => {
                                    tracing::warn!(?err, "dropping undecodable store event");
                                }
                            }
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(?err, "store event stream error");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(?err, "store event stream connect failed");
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

async fn expect_ok(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    match status.as_u16() {
        409 => Err(StoreError::Conflict),
        400..=499 => Err(StoreError::Malformed(format!("{status}: {body}"))),
        _ => Err(StoreError::Unavailable(format!("{status}: {body}"))),
    }
}

#[async_trait]
impl SignalStore for RemoteStore {
    async fn create_session(
        &self,
        new_session: NewCallSession,
    ) -> Result<SessionCreate, StoreError> {
        let response = self
            .http
            .post(self.url("/calls"))
            .json(&new_session)
            .send()
            .await?;
        let body: CreateCallResponse = expect_ok(response).await?.json().await?;
        if body.created {
            Ok(SessionCreate::Created(body.session))
        } else {
            Ok(SessionCreate::Live(body.session))
        }
    }

    async fn load_session(&self, pair: &PairKey) -> Result<Option<CallSession>, StoreError> {
        let response = self.http.get(self.url(&format!("/calls/{pair}"))).send().await?;
        let body: SessionResponse = expect_ok(response).await?.json().await?;
        Ok(body.session)
    }

    async fn set_offer(
        &self,
        pair: &PairKey,
        writer: &ParticipantId,
        description: &SessionDescription,
    ) -> Result<bool, StoreError> {
        let response = self
            .http
            .post(self.url(&format!("/calls/{pair}/offer")))
            .json(&PublishDescriptionRequest {
                writer_id: writer.clone(),
                description: description.clone(),
            })
            .send()
            .await?;
        let body: PublishDescriptionResponse = expect_ok(response).await?.json().await?;
        Ok(body.wrote)
    }

    async fn set_answer(
        &self,
        pair: &PairKey,
        writer: &ParticipantId,
        description: &SessionDescription,
    ) -> Result<bool, StoreError> {
        let response = self
            .http
            .post(self.url(&format!("/calls/{pair}/answer")))
            .json(&PublishDescriptionRequest {
                writer_id: writer.clone(),
                description: description.clone(),
            })
            .send()
            .await?;
        let body: PublishDescriptionResponse = expect_ok(response).await?.json().await?;
        Ok(body.wrote)
    }

    async fn accept_session(
        &self,
        pair: &PairKey,
        acceptor: &ParticipantId,
    ) -> Result<Option<CallSession>, StoreError> {
        let response = self
            .http
            .post(self.url(&format!("/calls/{pair}/accept")))
            .json(&AcceptCallRequest {
                receiver_id: acceptor.clone(),
            })
            .send()
            .await?;
        let body: SessionResponse = expect_ok(response).await?.json().await?;
        Ok(body.session)
    }

    async fn resolve_glare(
        &self,
        pair: &PairKey,
        caller: &ParticipantId,
    ) -> Result<Option<CallSession>, StoreError> {
        let response = self
            .http
            .post(self.url(&format!("/calls/{pair}/glare")))
            .json(&ResolveGlareRequest {
                caller_id: caller.clone(),
            })
            .send()
            .await?;
        let body: SessionResponse = expect_ok(response).await?.json().await?;
        Ok(body.session)
    }

    async fn finalize_session(
        &self,
        pair: &PairKey,
        status: CallStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<CallSession>, StoreError> {
        let response = self
            .http
            .post(self.url(&format!("/calls/{pair}/end")))
            .json(&FinalizeCallRequest { status, ended_at })
            .send()
            .await?;
        let body: SessionResponse = expect_ok(response).await?.json().await?;
        Ok(body.session)
    }

    async fn append_candidate(
        &self,
        pair: &PairKey,
        role: CallRole,
        candidate: &IceCandidate,
    ) -> Result<Option<CandidateRecord>, StoreError> {
        let response = self
            .http
            .post(self.url(&format!("/calls/{pair}/candidates")))
            .json(&AppendCandidateRequest {
                role,
                candidate: candidate.clone(),
            })
            .send()
            .await?;
        let record: Option<CandidateRecord> = expect_ok(response).await?.json().await?;
        Ok(record)
    }

    async fn list_candidates(
        &self,
        pair: &PairKey,
        role: CallRole,
    ) -> Result<Vec<CandidateRecord>, StoreError> {
        let response = self
            .http
            .get(self.url(&format!("/calls/{pair}/candidates/{}", role.as_str())))
            .send()
            .await?;
        let records: Vec<CandidateRecord> = expect_ok(response).await?.json().await?;
        Ok(records)
    }

    async fn clear_candidates(&self, pair: &PairKey) -> Result<(), StoreError> {
        let response = self
            .http
            .delete(self.url(&format!("/calls/{pair}/candidates")))
            .send()
            .await?;
        expect_ok(response).await?;
        Ok(())
    }

    async fn record_history(
        &self,
        entry: NewHistoryEntry,
    ) -> Result<CallHistoryEntry, StoreError> {
        let response = self.http.post(self.url("/history")).json(&entry).send().await?;
        let stored: CallHistoryEntry = expect_ok(response).await?.json().await?;
        Ok(stored)
    }

    async fn finalize_history(
        &self,
        entry: NewHistoryEntry,
        reason: EndReason,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let response = self
            .http
            .post(self.url("/history/finalize"))
            .json(&FinalizeHistoryRequest {
                entry,
                reason,
                ended_at,
            })
            .send()
            .await?;
        expect_ok(response).await?;
        Ok(())
    }

    async fn list_history(
        &self,
        owner: &ParticipantId,
    ) -> Result<Vec<CallHistoryEntry>, StoreError> {
        let response = self
            .http
            .get(self.url(&format!("/users/{owner}/history")))
            .send()
            .await?;
        let body: HistoryListResponse = expect_ok(response).await?.json().await?;
        Ok(body.entries)
    }

    async fn delete_history(
        &self,
        owner: &ParticipantId,
        entry_ids: &[HistoryEntryId],
    ) -> Result<u64, StoreError> {
        let response = self
            .http
            .delete(self.url(&format!("/users/{owner}/history")))
            .json(&DeleteHistoryRequest {
                entry_ids: entry_ids.to_vec(),
            })
            .send()
            .await?;
        let body: DeleteHistoryResponse = expect_ok(response).await?.json().await?;
        Ok(body.removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}
