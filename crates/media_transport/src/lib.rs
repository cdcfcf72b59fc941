use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use shared::domain::{IceCandidate, MediaKind, SessionDescription};
use tokio::sync::broadcast;

pub mod simulated;

/// Raw connectivity vocabulary of the underlying transport. These six inputs
/// are the only thing the health monitor folds; track-level changes (mute,
/// camera replacement) never appear here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(TransportState),
    LocalStream(String),
    RemoteStream(Option<String>),
}

/// One live peer transport. Implementations wrap a real WebRTC peer
/// connection; this workspace ships [`simulated`] for tests and demos.
#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn apply_remote_description(
        &self,
        description: SessionDescription,
    ) -> anyhow::Result<()>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn set_muted(&self, muted: bool) -> anyhow::Result<()>;
    async fn set_camera_enabled(&self, enabled: bool) -> anyhow::Result<()>;
    /// Replaces the outgoing video track in place. Connectivity state is
    /// untouched; subscribers see no transition.
    async fn switch_camera(&self) -> anyhow::Result<()>;
    async fn close(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent>;
}

#[async_trait]
pub trait MediaConnector: Send + Sync {
    async fn open(&self, kind: MediaKind) -> anyhow::Result<Arc<dyn MediaSession>>;
}

/// Fallback connector for wiring a client with no transport attached.
pub struct NullConnector;

#[async_trait]
impl MediaConnector for NullConnector {
    async fn open(&self, _kind: MediaKind) -> anyhow::Result<Arc<dyn MediaSession>> {
        Err(anyhow!("media transport is unavailable"))
    }
}
