//! Folds raw transport connectivity into the user-facing connection status
//! and decides when a degraded connection becomes a dead call.
//!
//! `disconnected` is treated as transient: a grace timer starts, and recovery
//! before expiry keeps the session untouched. Expiry or a hard `failed` makes
//! the verdict final; the owner then ends the call as a network failure.

use std::time::Duration;

use media_transport::{TransportEvent, TransportState};
use shared::domain::ConnectionStatus;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Why the monitor stopped watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorExit {
    /// Grace expired or the transport failed outright; the call must end.
    Failed,
    /// The transport closed during ordinary teardown.
    Closed,
}

/// Runs until the transport fails or closes. Status updates are
/// edge-triggered: consumers only see changes.
pub(crate) async fn run(
    mut transport: broadcast::Receiver<TransportEvent>,
    grace: Duration,
    statuses: mpsc::UnboundedSender<ConnectionStatus>,
) -> MonitorExit {
    let mut current: Option<ConnectionStatus> = None;
    let mut grace_deadline: Option<Instant> = None;

    let mut emit = |status: ConnectionStatus| {
        if current != Some(status) {
            current = Some(status);
            let _ = statuses.send(status);
        }
    };

    loop {
        let grace_timer = async {
            match grace_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = transport.recv() => match event {
                Ok(TransportEvent::ConnectionState(state)) => match state {
                    TransportState::New | TransportState::Connecting => {
                        emit(ConnectionStatus::Connecting);
                    }
                    TransportState::Connected => {
                        if grace_deadline.take().is_some() {
                            tracing::info!("transport recovered within the grace window");
                        }
                        emit(ConnectionStatus::Connected);
                    }
                    TransportState::Disconnected => {
                        if grace_deadline.is_none() {
                            grace_deadline = Some(Instant::now() + grace);
                            tracing::warn!(grace_secs = grace.as_secs(), "transport disconnected, grace timer armed");
                        }
                        emit(ConnectionStatus::Disconnected);
                    }
                    TransportState::Failed => {
                        emit(ConnectionStatus::Failed);
                        return MonitorExit::Failed;
                    }
                    TransportState::Closed => return MonitorExit::Closed,
                },
                // Track and stream changes are not connectivity.
                Ok(_) => {}
                // Connectivity is stateful; the next transition re-syncs us.
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "monitor lagged behind transport events");
                }
                Err(broadcast::error::RecvError::Closed) => return MonitorExit::Closed,
            },
            _ = grace_timer => {
                tracing::warn!("grace window expired without recovery");
                emit(ConnectionStatus::Failed);
                return MonitorExit::Failed;
            }
        }
    }
}
