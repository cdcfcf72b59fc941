//! In-process transport that negotiates instantly: descriptions are
//! synthesized, a couple of host candidates are emitted per side, and the
//! session reports `Connected` once both descriptions and at least one remote
//! candidate are in place. `force_state` scripts connectivity loss for tests.

use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use shared::domain::{IceCandidate, MediaKind, SessionDescription};
use tokio::sync::{broadcast, Mutex};

use crate::{MediaConnector, MediaSession, TransportEvent, TransportState};

const EVENT_CAPACITY: usize = 64;
const CANDIDATES_PER_SIDE: u32 = 2;

/// Keeps handles to every session it opens so tests can script connectivity
/// on the session a client is actually using.
#[derive(Default)]
pub struct SimulatedConnector {
    opened: Mutex<Vec<Arc<SimulatedSession>>>,
}

impl SimulatedConnector {
    pub async fn last_session(&self) -> Option<Arc<SimulatedSession>> {
        self.opened.lock().await.last().cloned()
    }
}

#[async_trait]
impl MediaConnector for SimulatedConnector {
    async fn open(&self, kind: MediaKind) -> anyhow::Result<Arc<dyn MediaSession>> {
        let session = SimulatedSession::open(kind);
        self.opened.lock().await.push(Arc::clone(&session));
        Ok(session)
    }
}

pub struct SimulatedSession {
    kind: MediaKind,
    inner: Mutex<SessionState>,
    events: broadcast::Sender<TransportEvent>,
}

struct SessionState {
    state: TransportState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_candidates: Vec<IceCandidate>,
    next_candidate: u32,
    local_stream_announced: bool,
    muted: bool,
    camera_enabled: bool,
    front_camera: bool,
}

impl SimulatedSession {
    pub fn open(kind: MediaKind) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            kind,
            inner: Mutex::new(SessionState {
                state: TransportState::New,
                local_description: None,
                remote_description: None,
                remote_candidates: Vec::new(),
                next_candidate: 0,
                local_stream_announced: false,
                muted: false,
                camera_enabled: kind == MediaKind::Video,
                front_camera: true,
            }),
            events,
        })
    }

    /// Scripts a raw connectivity transition, as a flaky network would.
    pub async fn force_state(&self, state: TransportState) {
        let mut inner = self.inner.lock().await;
        if inner.state != state {
            inner.state = state;
            let _ = self.events.send(TransportEvent::ConnectionState(state));
        }
    }

    pub async fn is_muted(&self) -> bool {
        self.inner.lock().await.muted
    }

    pub async fn is_camera_enabled(&self) -> bool {
        self.inner.lock().await.camera_enabled
    }

    pub async fn is_front_camera(&self) -> bool {
        self.inner.lock().await.front_camera
    }

    pub async fn remote_candidate_count(&self) -> usize {
        self.inner.lock().await.remote_candidates.len()
    }

    fn describe_local(&self, kind: &str, inner: &mut SessionState) -> SessionDescription {
        let description = SessionDescription {
            kind: kind.to_string(),
            payload: format!("sim-{kind}-{}", self.kind.as_str()),
        };
        inner.local_description = Some(description.clone());
        if !inner.local_stream_announced {
            inner.local_stream_announced = true;
            let _ = self.events.send(TransportEvent::LocalStream(format!(
                "sim-local-{}",
                self.kind.as_str()
            )));
        }
        if inner.state == TransportState::New {
            inner.state = TransportState::Connecting;
            let _ = self
                .events
                .send(TransportEvent::ConnectionState(TransportState::Connecting));
        }
        for _ in 0..CANDIDATES_PER_SIDE {
            inner.next_candidate += 1;
            let seq = inner.next_candidate;
            let _ = self.events.send(TransportEvent::LocalCandidate(IceCandidate {
                candidate: format!("candidate:{seq} 1 udp 2122260223 192.0.2.{seq} 54400 typ host"),
                sdp_mid: Some("0".to_string()),
                sdp_mline_index: Some(0),
            }));
        }
        description
    }

    fn maybe_connect(&self, inner: &mut SessionState) {
        let negotiated = inner.local_description.is_some()
            && inner.remote_description.is_some()
            && !inner.remote_candidates.is_empty();
        let live = matches!(
            inner.state,
            TransportState::New | TransportState::Connecting
        );
        if negotiated && live {
            inner.state = TransportState::Connected;
            let _ = self
                .events
                .send(TransportEvent::ConnectionState(TransportState::Connected));
            let _ = self.events.send(TransportEvent::RemoteStream(Some(format!(
                "sim-remote-{}",
                self.kind.as_str()
            ))));
        }
    }
}

#[async_trait]
impl MediaSession for SimulatedSession {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        let mut inner = self.inner.lock().await;
        if inner.state == TransportState::Closed {
            return Err(anyhow!("session is closed"));
        }
        let description = self.describe_local("offer", &mut inner);
        self.maybe_connect(&mut inner);
        Ok(description)
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        let mut inner = self.inner.lock().await;
        if inner.state == TransportState::Closed {
            return Err(anyhow!("session is closed"));
        }
        if inner.remote_description.is_none() {
            return Err(anyhow!("no remote offer applied"));
        }
        let description = self.describe_local("answer", &mut inner);
        self.maybe_connect(&mut inner);
        Ok(description)
    }

    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == TransportState::Closed {
            return Err(anyhow!("session is closed"));
        }
        inner.remote_description = Some(description);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == TransportState::Closed {
            return Err(anyhow!("session is closed"));
        }
        inner.remote_candidates.push(candidate);
        self.maybe_connect(&mut inner);
        Ok(())
    }

    async fn set_muted(&self, muted: bool) -> anyhow::Result<()> {
        self.inner.lock().await.muted = muted;
        Ok(())
    }

    async fn set_camera_enabled(&self, enabled: bool) -> anyhow::Result<()> {
        if self.kind != MediaKind::Video {
            return Err(anyhow!("not a video session"));
        }
        self.inner.lock().await.camera_enabled = enabled;
        Ok(())
    }

    async fn switch_camera(&self) -> anyhow::Result<()> {
        if self.kind != MediaKind::Video {
            return Err(anyhow!("not a video session"));
        }
        let mut inner = self.inner.lock().await;
        inner.front_camera = !inner.front_camera;
        Ok(())
    }

    async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != TransportState::Closed {
            inner.state = TransportState::Closed;
            let _ = self.events.send(TransportEvent::RemoteStream(None));
            let _ = self
                .events
                .send(TransportEvent::ConnectionState(TransportState::Closed));
        }
    }

    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}
