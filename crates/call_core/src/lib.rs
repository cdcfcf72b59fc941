//! Client-side call coordination: the session state machine, glare
//! resolution, candidate relay, connection health and the per-user ledger,
//! behind one [`CallClient`] facade.
//!
//! A client owns at most one active call. Every call runs a small task
//! fabric: a session watch on the store's change feed, two candidate pumps,
//! a connection monitor and (for the dialing side) a ring timer. Cross-party
//! coordination happens only through the signal store; correctness rests on
//! the store's monotonic conditional writes, not on locks.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use media_transport::{MediaConnector, MediaSession, TransportEvent};
use serde::{Deserialize, Serialize};
use shared::domain::{
    CallDirection, CallHistoryEntry, CallRole, CallSession, CallStatus, ConnectionStatus,
    EndReason, HistoryEntryId, MediaKind, NewCallSession, PairKey, ParticipantId,
    SessionDescription,
};
use shared::protocol::StoreEvent;
use signal_store::{SessionCreate, SignalStore, StoreError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

mod history;
mod monitor;
mod relay;

const EVENT_CAPACITY: usize = 256;

fn default_reconnect_grace() -> Duration {
    Duration::from_secs(12)
}

fn default_ring_timeout() -> Duration {
    Duration::from_secs(45)
}

/// Tunables for one client. The reconnect grace is how long a degraded
/// connection may stay `disconnected` before the call is ended as a network
/// failure; the ring timeout is how long the dialing side lets a call ring
/// before recording it missed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallConfig {
    #[serde(default = "default_reconnect_grace")]
    pub reconnect_grace: Duration,
    #[serde(default = "default_ring_timeout")]
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            reconnect_grace: default_reconnect_grace(),
            ring_timeout: default_ring_timeout(),
        }
    }
}

/// Coordinator-boundary error taxonomy. Store and transport failures are
/// converted into one of these before reaching the UI; raw errors never
/// escape.
#[derive(Debug, Error)]
pub enum CallError {
    /// Transient persistence failure; the same idempotent operation can be
    /// retried.
    #[error("signaling store failed: {0}")]
    Store(#[from] StoreError),
    /// Rejected locally before any write reached the store.
    #[error("cannot {attempted} a {} call", from.as_str())]
    InvalidTransition {
        from: CallStatus,
        attempted: &'static str,
    },
    /// The media transport rejected a negotiation step; the coordinator ends
    /// the call with a `negotiation_failure` reason.
    #[error("media negotiation failed: {0}")]
    Negotiation(String),
    #[error("no active call")]
    NoActiveCall,
    #[error("another call is already active")]
    Busy,
    #[error("cannot call yourself")]
    SelfCall,
}

/// UI-facing event stream of one client.
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// A ringing session names this participant as receiver.
    IncomingCall { session: CallSession },
    /// The active call's session document changed.
    SessionChanged { session: CallSession },
    ConnectionStatus(ConnectionStatus),
    LocalStreamChanged(String),
    RemoteStreamChanged(Option<String>),
    CallEnded {
        session: CallSession,
        reason: EndReason,
    },
    Error(String),
}

struct ActiveCall {
    session: CallSession,
    role: CallRole,
    direction: CallDirection,
    media: Arc<dyn MediaSession>,
    muted: bool,
    camera_enabled: bool,
    applied_remote: bool,
    local_offer: Option<SessionDescription>,
    local_answer: Option<SessionDescription>,
    watch_task: JoinHandle<()>,
    call_tasks: Vec<JoinHandle<()>>,
}

/// Outcome of pushing a terminal status into the store.
enum StoreFinalize {
    Finalized(CallSession),
    /// The other side got there first; its document is authoritative.
    AlreadyTerminal(CallSession),
    /// The document is gone entirely.
    Vanished,
    /// The call moved on (an accept raced a ring timeout); nothing to do.
    StillLive,
}

pub struct CallClient {
    id: ParticipantId,
    label: String,
    config: CallConfig,
    store: Arc<dyn SignalStore>,
    connector: Arc<dyn MediaConnector>,
    active: Mutex<Option<ActiveCall>>,
    pending_incoming: Mutex<Option<CallSession>>,
    /// Pair currently being dialed or accepted, so discovery never mistakes
    /// our own in-flight join for a fresh incoming ring.
    engaging: Mutex<Option<PairKey>>,
    events: broadcast::Sender<CallEvent>,
}

impl CallClient {
    pub fn new(
        id: ParticipantId,
        label: impl Into<String>,
        store: Arc<dyn SignalStore>,
        connector: Arc<dyn MediaConnector>,
    ) -> Arc<Self> {
        Self::with_config(id, label, store, connector, CallConfig::default())
    }

    /// Builds the client and starts its incoming-call discovery task. Must
    /// run inside a tokio runtime.
    pub fn with_config(
        id: ParticipantId,
        label: impl Into<String>,
        store: Arc<dyn SignalStore>,
        connector: Arc<dyn MediaConnector>,
        config: CallConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let client = Arc::new(Self {
            id,
            label: label.into(),
            config,
            store,
            connector,
            active: Mutex::new(None),
            pending_incoming: Mutex::new(None),
            engaging: Mutex::new(None),
            events,
        });
        let feed = client.store.subscribe();
        tokio::spawn(Arc::clone(&client).run_discovery(feed));
        client
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Raw store change feed, for history views that want live updates.
    pub fn store_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.store.subscribe()
    }

    pub async fn current_session(&self) -> Option<CallSession> {
        self.active.lock().await.as_ref().map(|a| a.session.clone())
    }

    pub async fn pending_incoming(&self) -> Option<CallSession> {
        self.pending_incoming.lock().await.clone()
    }

    /// Dials `other`. Creates the pair's session document (`ringing`, self as
    /// caller), opens the local media session and publishes the offer. When
    /// the other side dialed us in the same window, the call is joined
    /// instead of competing: the lexicographically smaller id ends up as the
    /// recorded caller and this initiate becomes an implicit accept.
    pub async fn initiate(
        self: &Arc<Self>,
        other: &ParticipantId,
        other_label: &str,
        media_kind: MediaKind,
    ) -> Result<PairKey, CallError> {
        if *other == self.id {
            return Err(CallError::SelfCall);
        }
        if self.active.lock().await.is_some() {
            return Err(CallError::Busy);
        }

        let pair = PairKey::new(&self.id, other);
        *self.engaging.lock().await = Some(pair.clone());
        let result = self
            .initiate_inner(&pair, other, other_label, media_kind)
            .await;
        *self.engaging.lock().await = None;
        result.map(|()| pair)
    }

    async fn initiate_inner(
        self: &Arc<Self>,
        pair: &PairKey,
        other: &ParticipantId,
        other_label: &str,
        media_kind: MediaKind,
    ) -> Result<(), CallError> {
        // Two rounds cover the narrow window where the pair's document moves
        // between our read and our conditional write.
        for _ in 0..2 {
            let new_session = NewCallSession {
                caller_id: self.id.clone(),
                caller_label: self.label.clone(),
                receiver_id: other.clone(),
                receiver_label: other_label.to_string(),
                media_kind,
            };
            match self.store.create_session(new_session).await? {
                SessionCreate::Created(session) => {
                    tracing::info!(pair = %pair, callee = %other, kind = media_kind.as_str(), "dialing");
                    history::record_attempt(&self.store, &session, &self.id, CallDirection::Outgoing)
                        .await;
                    self.install_call(session, CallDirection::Outgoing, true)
                        .await?;
                    if let Err(err) = self.create_and_publish_offer().await {
                        if matches!(err, CallError::Negotiation(_)) {
                            let _ = self.finalize(EndReason::NegotiationFailure, false).await;
                        }
                        return Err(err);
                    }
                    return Ok(());
                }
                SessionCreate::Live(existing) => {
                    match existing.role_of(&self.id) {
                        Some(CallRole::Receiver) if existing.status == CallStatus::Ringing => {
                            // Glare: the other side is already ringing us.
                            self.clear_pending_for(pair).await;
                            if self.join_glare(pair, &existing).await? {
                                return Ok(());
                            }
                            // The document moved underneath the join; retry.
                        }
                        _ => return Err(CallError::Busy),
                    }
                }
            }
        }
        Err(CallError::Busy)
    }

    /// Accepts the pending incoming call. Idempotent: accepting a call that
    /// is already the active one does nothing.
    pub async fn accept(self: &Arc<Self>) -> Result<(), CallError> {
        let pending = {
            // Mark the pair as engaging before releasing the pending slot, or
            // discovery re-arms the still-queued ring mid-accept.
            let mut slot = self.pending_incoming.lock().await;
            match slot.take() {
                Some(pending) => {
                    *self.engaging.lock().await = Some(pending.pair_key.clone());
                    pending
                }
                None => {
                    drop(slot);
                    if self.active.lock().await.is_some() {
                        return Ok(());
                    }
                    return Err(CallError::NoActiveCall);
                }
            }
        };
        let result = self.accept_inner(pending).await;
        *self.engaging.lock().await = None;
        result
    }

    async fn accept_inner(self: &Arc<Self>, pending: CallSession) -> Result<(), CallError> {
        let pair = pending.pair_key.clone();

        let accepted = match self.store.accept_session(&pair, &self.id).await {
            Ok(accepted) => accepted,
            Err(err) => {
                *self.pending_incoming.lock().await = Some(pending);
                return Err(err.into());
            }
        };
        let session = match accepted {
            Some(session) => session,
            None => match self.store.load_session(&pair).await? {
                Some(doc)
                    if doc.status == CallStatus::Connected
                        && doc.role_of(&self.id) == Some(CallRole::Receiver) =>
                {
                    doc
                }
                Some(doc) => {
                    return Err(CallError::InvalidTransition {
                        from: doc.status,
                        attempted: "accept",
                    })
                }
                None => return Err(CallError::NoActiveCall),
            },
        };

        tracing::info!(pair = %pair, "call accepted");
        self.install_call(session, CallDirection::Incoming, false)
            .await?;
        if let Err(err) = self.drive_negotiation().await {
            if matches!(err, CallError::Negotiation(_)) {
                let _ = self.finalize(EndReason::NegotiationFailure, false).await;
            }
            return Err(err);
        }
        Ok(())
    }

    /// Declines the pending incoming call: `ringing -> declined`. Idempotent
    /// once the ring is gone.
    pub async fn decline(&self) -> Result<(), CallError> {
        let pending = self.pending_incoming.lock().await.take();
        let Some(pending) = pending else {
            return Ok(());
        };
        let pair = pending.pair_key.clone();

        let finalized = match self
            .store
            .finalize_session(&pair, CallStatus::Declined, Utc::now())
            .await
        {
            Ok(finalized) => finalized,
            Err(err) => {
                *self.pending_incoming.lock().await = Some(pending);
                return Err(err.into());
            }
        };
        let doc = match finalized {
            Some(doc) => doc,
            // Already terminal elsewhere is a success; anything else means
            // the ring moved on and there is nothing left to decline.
            None => match self.store.load_session(&pair).await? {
                Some(doc) if doc.status.is_terminal() => doc,
                Some(doc) => {
                    return Err(CallError::InvalidTransition {
                        from: doc.status,
                        attempted: "decline",
                    })
                }
                None => return Err(CallError::NoActiveCall),
            },
        };

        let _ = self.store.clear_candidates(&pair).await;
        let reason = EndReason::from_terminal(doc.status).unwrap_or(EndReason::Declined);
        history::finalize(&self.store, &doc, &self.id, CallDirection::Incoming, reason).await;
        tracing::info!(pair = %pair, "call declined");
        let _ = self.events.send(CallEvent::CallEnded {
            session: doc,
            reason,
        });
        Ok(())
    }

    /// Hangs up the active call. From `connected` this records `ended`; a
    /// caller hanging up a still-ringing call records `missed` for the
    /// callee, never `declined`. A receiver hanging up before answering
    /// declines the ring. Idempotent once the call is gone.
    pub async fn end(&self) -> Result<(), CallError> {
        match self.finalize(EndReason::HungUp, false).await {
            // No active call: an unanswered incoming ring is declined
            // instead, and declining nothing is a no-op.
            Err(CallError::NoActiveCall) => self.decline().await,
            other => other,
        }
    }

    /// Republishes the locally created offer; a no-op when the slot is
    /// already filled. The retry affordance after a transient store failure.
    pub async fn publish_offer(&self) -> Result<bool, CallError> {
        let (pair, offer) = {
            let guard = self.active.lock().await;
            let Some(active) = guard.as_ref() else {
                return Err(CallError::NoActiveCall);
            };
            let Some(offer) = active.local_offer.clone() else {
                return Err(CallError::NoActiveCall);
            };
            (active.session.pair_key.clone(), offer)
        };
        Ok(self.store.set_offer(&pair, &self.id, &offer).await?)
    }

    /// Counterpart of [`Self::publish_offer`] for the receiving side.
    pub async fn publish_answer(&self) -> Result<bool, CallError> {
        let (pair, answer) = {
            let guard = self.active.lock().await;
            let Some(active) = guard.as_ref() else {
                return Err(CallError::NoActiveCall);
            };
            let Some(answer) = active.local_answer.clone() else {
                return Err(CallError::NoActiveCall);
            };
            (active.session.pair_key.clone(), answer)
        };
        Ok(self.store.set_answer(&pair, &self.id, &answer).await?)
    }

    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let mut guard = self.active.lock().await;
        let Some(active) = guard.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let next = !active.muted;
        active
            .media
            .set_muted(next)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))?;
        active.muted = next;
        Ok(next)
    }

    pub async fn toggle_camera(&self) -> Result<bool, CallError> {
        let mut guard = self.active.lock().await;
        let Some(active) = guard.as_mut() else {
            return Err(CallError::NoActiveCall);
        };
        let next = !active.camera_enabled;
        active
            .media
            .set_camera_enabled(next)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))?;
        active.camera_enabled = next;
        Ok(next)
    }

    /// Flips the camera by replacing the outgoing track. Happens entirely
    /// below the signaling layer: no session write, no renegotiation, and
    /// the health monitor never sees it.
    pub async fn switch_camera(&self) -> Result<(), CallError> {
        let guard = self.active.lock().await;
        let Some(active) = guard.as_ref() else {
            return Err(CallError::NoActiveCall);
        };
        active
            .media
            .switch_camera()
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))
    }

    pub async fn history(&self) -> Result<Vec<CallHistoryEntry>, CallError> {
        Ok(self.store.list_history(&self.id).await?)
    }

    /// Removes ledger entries by id. Purely local bookkeeping: deleting
    /// history never touches live signaling state or the other side's copy.
    pub async fn delete_history(&self, entry_ids: &[HistoryEntryId]) -> Result<u64, CallError> {
        Ok(self.store.delete_history(&self.id, entry_ids).await?)
    }

    // ---- call setup -------------------------------------------------------

    /// Joins an existing ring from the other side. Returns `false` when the
    /// document changed shape before our conditional write landed.
    async fn join_glare(
        self: &Arc<Self>,
        pair: &PairKey,
        existing: &CallSession,
    ) -> Result<bool, CallError> {
        let settled = if self.id < existing.caller_id {
            // The smaller id must be the recorded caller: swap roles, which
            // also resets offers, answers and both candidate logs.
            self.store.resolve_glare(pair, &self.id).await?
        } else {
            self.store.accept_session(pair, &self.id).await?
        };
        let Some(session) = settled else {
            return Ok(false);
        };

        tracing::info!(pair = %pair, caller = %session.caller_id, "glare joined as implicit accept");
        // Direction stays subjective: this user dialed.
        history::record_attempt(&self.store, &session, &self.id, CallDirection::Outgoing).await;
        self.install_call(session.clone(), CallDirection::Outgoing, false)
            .await?;
        let result = match session.role_of(&self.id) {
            Some(CallRole::Caller) => self.create_and_publish_offer().await,
            _ => self.drive_negotiation().await,
        };
        if let Err(err) = result {
            if matches!(err, CallError::Negotiation(_)) {
                let _ = self.finalize(EndReason::NegotiationFailure, false).await;
            }
            return Err(err);
        }
        Ok(true)
    }

    /// Opens the media session and installs the per-call task fabric.
    async fn install_call(
        self: &Arc<Self>,
        session: CallSession,
        direction: CallDirection,
        arm_ring_timer: bool,
    ) -> Result<(), CallError> {
        let Some(role) = session.role_of(&self.id) else {
            return Err(CallError::NoActiveCall);
        };
        let media = self
            .connector
            .open(session.media_kind)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))?;

        let mut guard = self.active.lock().await;
        if guard.is_some() {
            media.close().await;
            return Err(CallError::Busy);
        }
        let pair = session.pair_key.clone();
        let call_tasks =
            self.spawn_call_tasks(&pair, role, &media, arm_ring_timer && role == CallRole::Caller);
        let watch_feed = self.store.subscribe();
        let watch_task = tokio::spawn(Arc::clone(self).run_session_watch(pair, watch_feed));
        let camera_enabled = session.media_kind == MediaKind::Video;
        *guard = Some(ActiveCall {
            session,
            role,
            direction,
            media,
            muted: false,
            camera_enabled,
            applied_remote: false,
            local_offer: None,
            local_answer: None,
            watch_task,
            call_tasks,
        });
        Ok(())
    }

    /// Spawns the pumps that live exactly as long as one media session:
    /// local and remote candidate relays, connection monitor and stream
    /// forwarder, plus the caller's ring timer.
    fn spawn_call_tasks(
        self: &Arc<Self>,
        pair: &PairKey,
        role: CallRole,
        media: &Arc<dyn MediaSession>,
        arm_ring_timer: bool,
    ) -> Vec<JoinHandle<()>> {
        // Subscribe everything before negotiation starts so the first
        // transport events cannot slip past.
        let transport_candidates = media.subscribe_events();
        let transport_monitor = media.subscribe_events();
        let transport_streams = media.subscribe_events();
        let candidate_feed = self.store.subscribe();

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(relay::pump_local_candidates(
            Arc::clone(&self.store),
            pair.clone(),
            role,
            transport_candidates,
        )));
        tasks.push(tokio::spawn(relay::deliver_remote_candidates(
            Arc::clone(&self.store),
            pair.clone(),
            role,
            Arc::clone(media),
            candidate_feed,
        )));

        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let status_events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                let _ = status_events.send(CallEvent::ConnectionStatus(status));
            }
        }));
        let monitor_client = Arc::clone(self);
        let grace = self.config.reconnect_grace;
        tasks.push(tokio::spawn(async move {
            if monitor::run(transport_monitor, grace, status_tx).await == monitor::MonitorExit::Failed
            {
                monitor_client.spawn_finalize(EndReason::NetworkFailure, false);
            }
        }));

        let stream_events = self.events.clone();
        tasks.push(tokio::spawn(async move {
            let mut transport = transport_streams;
            loop {
                match transport.recv().await {
                    Ok(TransportEvent::LocalStream(stream)) => {
                        let _ = stream_events.send(CallEvent::LocalStreamChanged(stream));
                    }
                    Ok(TransportEvent::RemoteStream(stream)) => {
                        let _ = stream_events.send(CallEvent::RemoteStreamChanged(stream));
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        }));

        if arm_ring_timer {
            let timer_client = Arc::clone(self);
            let timer_pair = pair.clone();
            let ring_timeout = self.config.ring_timeout;
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(ring_timeout).await;
                match timer_client.store.load_session(&timer_pair).await {
                    Ok(Some(doc)) if doc.status == CallStatus::Ringing => {
                        tracing::info!(pair = %timer_pair, "ring timeout, recording missed");
                        timer_client.spawn_finalize(EndReason::Missed, true);
                    }
                    _ => {}
                }
            }));
        }

        tasks
    }

    async fn create_and_publish_offer(&self) -> Result<(), CallError> {
        let media = {
            let guard = self.active.lock().await;
            match guard.as_ref() {
                Some(active) => Arc::clone(&active.media),
                None => return Err(CallError::NoActiveCall),
            }
        };
        let offer = media
            .create_offer()
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))?;
        let pair = {
            let mut guard = self.active.lock().await;
            let Some(active) = guard.as_mut() else {
                return Err(CallError::NoActiveCall);
            };
            active.local_offer = Some(offer.clone());
            active.session.pair_key.clone()
        };
        let wrote = self.store.set_offer(&pair, &self.id, &offer).await?;
        if !wrote {
            tracing::debug!(pair = %pair, "offer slot already filled");
        }
        Ok(())
    }

    /// Moves negotiation forward from the latest session snapshot: the
    /// caller applies the answer once it appears, the receiver applies the
    /// offer and publishes its answer once accepted. Every step is guarded
    /// so replayed events and duplicate triggers are no-ops.
    async fn drive_negotiation(&self) -> Result<(), CallError> {
        let mut guard = self.active.lock().await;
        let Some(active) = guard.as_mut() else {
            return Ok(());
        };
        match active.role {
            CallRole::Caller => {
                if active.applied_remote {
                    return Ok(());
                }
                let Some(answer) = active.session.answer.clone() else {
                    return Ok(());
                };
                active
                    .media
                    .apply_remote_description(answer)
                    .await
                    .map_err(|err| CallError::Negotiation(err.to_string()))?;
                active.applied_remote = true;
                tracing::debug!(pair = %active.session.pair_key, "remote answer applied");
            }
            CallRole::Receiver => {
                if active.session.status != CallStatus::Connected {
                    return Ok(());
                }
                if active.local_answer.is_none() {
                    let Some(offer) = active.session.offer.clone() else {
                        return Ok(());
                    };
                    if !active.applied_remote {
                        active
                            .media
                            .apply_remote_description(offer)
                            .await
                            .map_err(|err| CallError::Negotiation(err.to_string()))?;
                        active.applied_remote = true;
                    }
                    let answer = active
                        .media
                        .create_answer()
                        .await
                        .map_err(|err| CallError::Negotiation(err.to_string()))?;
                    active.local_answer = Some(answer);
                }
                let pair = active.session.pair_key.clone();
                if let Some(answer) = active.local_answer.clone() {
                    let wrote = self.store.set_answer(&pair, &self.id, &answer).await?;
                    if wrote {
                        tracing::debug!(pair = %pair, "answer published");
                    }
                }
            }
        }
        Ok(())
    }

    // ---- teardown ---------------------------------------------------------

    /// Detached finalize for tasks that are themselves part of the call's
    /// task set; running it inline would cancel the teardown midway.
    fn spawn_finalize(self: &Arc<Self>, reason: EndReason, only_from_ringing: bool) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            match client.finalize(reason, only_from_ringing).await {
                Ok(()) | Err(CallError::NoActiveCall) => {}
                Err(err) => tracing::warn!(%err, "automatic call teardown failed"),
            }
        });
    }

    async fn finalize(&self, reason: EndReason, only_from_ringing: bool) -> Result<(), CallError> {
        let taken = self.active.lock().await.take();
        let Some(active) = taken else {
            if only_from_ringing {
                return Ok(());
            }
            return Err(CallError::NoActiveCall);
        };
        let pair = active.session.pair_key.clone();
        let role = active.role;

        match self.finalize_in_store(&pair, role, only_from_ringing).await {
            Err(err) => {
                // A failed write never half-applies; keep the call and let
                // the user retry.
                *self.active.lock().await = Some(active);
                Err(err.into())
            }
            Ok(StoreFinalize::StillLive) => {
                *self.active.lock().await = Some(active);
                Ok(())
            }
            Ok(StoreFinalize::Vanished) => {
                self.teardown(active, None, reason).await;
                Ok(())
            }
            Ok(StoreFinalize::Finalized(doc)) => {
                let reason = if reason == EndReason::HungUp {
                    EndReason::from_terminal(doc.status).unwrap_or(reason)
                } else {
                    reason
                };
                let _ = self.store.clear_candidates(&pair).await;
                tracing::info!(pair = %pair, status = doc.status.as_str(), reason = reason.as_str(), "call finalized");
                self.teardown(active, Some(doc), reason).await;
                Ok(())
            }
            Ok(StoreFinalize::AlreadyTerminal(doc)) => {
                let reason = EndReason::from_terminal(doc.status).unwrap_or(EndReason::HungUp);
                let _ = self.store.clear_candidates(&pair).await;
                self.teardown(active, Some(doc), reason).await;
                Ok(())
            }
        }
    }

    /// Pushes the terminal status implied by the current document and our
    /// role. The conditional write loses gracefully: a concurrent accept or
    /// a concurrent finalize from the other side is re-read, not fought.
    async fn finalize_in_store(
        &self,
        pair: &PairKey,
        role: CallRole,
        only_from_ringing: bool,
    ) -> Result<StoreFinalize, StoreError> {
        for _ in 0..2 {
            let Some(doc) = self.store.load_session(pair).await? else {
                return Ok(StoreFinalize::Vanished);
            };
            if doc.status.is_terminal() {
                return Ok(StoreFinalize::AlreadyTerminal(doc));
            }
            if doc.status == CallStatus::Connected && only_from_ringing {
                return Ok(StoreFinalize::StillLive);
            }
            let target = match doc.status {
                CallStatus::Ringing if role == CallRole::Caller => CallStatus::Missed,
                CallStatus::Ringing => CallStatus::Declined,
                _ => CallStatus::Ended,
            };
            if let Some(doc) = self.store.finalize_session(pair, target, Utc::now()).await? {
                return Ok(StoreFinalize::Finalized(doc));
            }
            // The document transitioned between read and write; go around.
        }
        tracing::warn!(pair = %pair, "finalize kept losing the transition race");
        Ok(StoreFinalize::StillLive)
    }

    async fn teardown(&self, active: ActiveCall, doc: Option<CallSession>, reason: EndReason) {
        for task in &active.call_tasks {
            task.abort();
        }
        active.watch_task.abort();
        active.media.close().await;
        if let Some(doc) = doc {
            history::finalize(&self.store, &doc, &self.id, active.direction, reason).await;
            let _ = self.events.send(CallEvent::CallEnded {
                session: doc,
                reason,
            });
        }
    }

    /// Terminal status observed from the other side: mirror the cleanup the
    /// finalizer did, which is safe to repeat.
    async fn conclude_remote(&self, active: ActiveCall, session: CallSession) {
        for task in &active.call_tasks {
            task.abort();
        }
        active.media.close().await;
        let _ = self.store.clear_candidates(&session.pair_key).await;
        let reason = EndReason::from_terminal(session.status).unwrap_or(EndReason::HungUp);
        history::finalize(&self.store, &session, &self.id, active.direction, reason).await;
        tracing::info!(pair = %session.pair_key, status = session.status.as_str(), "call ended remotely");
        let _ = self.events.send(CallEvent::CallEnded {
            session,
            reason,
        });
    }

    // ---- per-call session watch ------------------------------------------

    async fn run_session_watch(
        self: Arc<Self>,
        pair: PairKey,
        mut feed: broadcast::Receiver<StoreEvent>,
    ) {
        loop {
            match feed.recv().await {
                Ok(StoreEvent::SessionChanged { session }) if session.pair_key == pair => {
                    if !self.handle_session_update(session).await {
                        return;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, pair = %pair, "session watch lagged, re-reading");
                    match self.store.load_session(&pair).await {
                        Ok(Some(session)) => {
                            if !self.handle_session_update(session).await {
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(err) => tracing::warn!(pair = %pair, %err, "session re-read failed"),
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Reacts to one session document change. Returns whether the watch
    /// should keep running.
    async fn handle_session_update(self: &Arc<Self>, session: CallSession) -> bool {
        let mut guard = self.active.lock().await;
        let Some(active_pair) = guard.as_ref().map(|a| a.session.pair_key.clone()) else {
            // Our side already finalized and took the slot.
            return false;
        };
        if active_pair != session.pair_key {
            return true;
        }

        let _ = self.events.send(CallEvent::SessionChanged {
            session: session.clone(),
        });

        if session.status.is_terminal() {
            if let Some(active) = guard.take() {
                drop(guard);
                self.conclude_remote(active, session).await;
            }
            return false;
        }

        if let Some(active) = guard.as_mut() {
            active.session = session.clone();
            if let Some(doc_role) = session.role_of(&self.id) {
                if doc_role != active.role {
                    tracing::info!(pair = %session.pair_key, role = doc_role.as_str(), "glare settled, reopening media in new role");
                    if let Err(err) = self.reopen_for_role(active, &session, doc_role).await {
                        drop(guard);
                        let _ = self.events.send(CallEvent::Error(err.to_string()));
                        self.spawn_finalize(EndReason::NegotiationFailure, false);
                        return false;
                    }
                }
            }
        }
        drop(guard);

        match self.drive_negotiation().await {
            Ok(()) => true,
            Err(err @ CallError::Negotiation(_)) => {
                let _ = self.events.send(CallEvent::Error(err.to_string()));
                self.spawn_finalize(EndReason::NegotiationFailure, false);
                false
            }
            Err(err) => {
                // Transient; the next store event (or an explicit republish)
                // retries the step.
                let _ = self.events.send(CallEvent::Error(err.to_string()));
                true
            }
        }
    }

    /// The glare loser swapped roles underneath us: drop the old media
    /// session and pumps, reopen in the settled role and renegotiate from
    /// scratch.
    async fn reopen_for_role(
        self: &Arc<Self>,
        active: &mut ActiveCall,
        session: &CallSession,
        role: CallRole,
    ) -> Result<(), CallError> {
        for task in active.call_tasks.drain(..) {
            task.abort();
        }
        active.media.close().await;

        let media = self
            .connector
            .open(session.media_kind)
            .await
            .map_err(|err| CallError::Negotiation(err.to_string()))?;
        active.call_tasks = self.spawn_call_tasks(&session.pair_key, role, &media, false);
        active.media = media;
        active.role = role;
        active.applied_remote = false;
        active.local_offer = None;
        active.local_answer = None;
        active.muted = false;
        active.camera_enabled = session.media_kind == MediaKind::Video;

        if role == CallRole::Caller {
            let offer = active
                .media
                .create_offer()
                .await
                .map_err(|err| CallError::Negotiation(err.to_string()))?;
            active.local_offer = Some(offer.clone());
            self.store
                .set_offer(&session.pair_key, &self.id, &offer)
                .await?;
        }
        Ok(())
    }

    // ---- incoming-call discovery -----------------------------------------

    async fn run_discovery(self: Arc<Self>, mut feed: broadcast::Receiver<StoreEvent>) {
        loop {
            match feed.recv().await {
                Ok(StoreEvent::SessionChanged { session }) => {
                    self.handle_discovery(session).await;
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "discovery feed lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    async fn handle_discovery(&self, session: CallSession) {
        {
            let mut pending = self.pending_incoming.lock().await;
            if let Some(current) = pending.as_ref() {
                if current.pair_key == session.pair_key {
                    if session.status.is_terminal() {
                        // The caller gave up (or timed out) while we rang.
                        *pending = None;
                        drop(pending);
                        let reason =
                            EndReason::from_terminal(session.status).unwrap_or(EndReason::HungUp);
                        history::finalize(
                            &self.store,
                            &session,
                            &self.id,
                            CallDirection::Incoming,
                            reason,
                        )
                        .await;
                        tracing::info!(pair = %session.pair_key, status = session.status.as_str(), "incoming ring withdrawn");
                        let _ = self.events.send(CallEvent::CallEnded { session, reason });
                    } else {
                        *pending = Some(session);
                    }
                    return;
                }
            }
        }

        if session.status != CallStatus::Ringing
            || session.role_of(&self.id) != Some(CallRole::Receiver)
        {
            return;
        }
        if self.engaging.lock().await.as_ref() == Some(&session.pair_key) {
            // Our own dial or accept is already joining this ring.
            return;
        }
        if self.active.lock().await.is_some() {
            tracing::debug!(pair = %session.pair_key, "ignoring incoming ring while busy");
            return;
        }
        {
            let mut pending = self.pending_incoming.lock().await;
            if pending.is_some() {
                tracing::debug!(pair = %session.pair_key, "ignoring second simultaneous ring");
                return;
            }
            *pending = Some(session.clone());
        }
        tracing::info!(pair = %session.pair_key, caller = %session.caller_id, "incoming call");
        history::record_attempt(&self.store, &session, &self.id, CallDirection::Incoming).await;
        let _ = self.events.send(CallEvent::IncomingCall { session });
    }

    async fn clear_pending_for(&self, pair: &PairKey) {
        let mut pending = self.pending_incoming.lock().await;
        if pending.as_ref().map_or(false, |p| p.pair_key == *pair) {
            *pending = None;
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
