//! Candidate exchange between the local transport and the store.
//!
//! Each role owns an append-only log; this module pumps the local transport's
//! candidates into our role's log and delivers the opposite role's log to the
//! transport, snapshot first and live tail after. Delivery deduplicates by
//! record id so the transport sees each candidate exactly once even across
//! the snapshot/live seam or after channel lag.

use std::collections::HashSet;
use std::sync::Arc;

use media_transport::{MediaSession, TransportEvent};
use shared::domain::{CallRole, CandidateId, PairKey};
use shared::protocol::StoreEvent;
use signal_store::{SignalStore, StoreError};
use tokio::sync::broadcast;

/// Forwards every candidate the local transport gathers into our role's log.
/// Appends racing teardown come back as `None` and are dropped.
pub(crate) async fn pump_local_candidates(
    store: Arc<dyn SignalStore>,
    pair: PairKey,
    role: CallRole,
    mut transport: broadcast::Receiver<TransportEvent>,
) {
    loop {
        match transport.recv().await {
            Ok(TransportEvent::LocalCandidate(candidate)) => {
                match store.append_candidate(&pair, role, &candidate).await {
                    Ok(Some(record)) => {
                        tracing::debug!(pair = %pair, id = record.id.0, "local candidate appended");
                    }
                    Ok(None) => {
                        tracing::debug!(pair = %pair, "candidate dropped, session no longer live");
                    }
                    Err(err) => {
                        tracing::warn!(pair = %pair, %err, "candidate append failed");
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // The transport re-gathers on its own; skipped candidates are
                // lost locally but never corrupt the log.
                tracing::warn!(skipped, "local candidate pump lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Delivers the opposite role's candidates to the local transport: stored
/// snapshot in append order, then the live feed. `feed` must be subscribed
/// before this task starts so nothing falls between snapshot and tail.
pub(crate) async fn deliver_remote_candidates(
    store: Arc<dyn SignalStore>,
    pair: PairKey,
    local_role: CallRole,
    media: Arc<dyn MediaSession>,
    mut feed: broadcast::Receiver<StoreEvent>,
) {
    let remote_role = local_role.opposite();
    let mut seen: HashSet<CandidateId> = HashSet::new();

    if let Err(err) = replay_snapshot(&store, &pair, remote_role, &media, &mut seen).await {
        tracing::warn!(pair = %pair, %err, "candidate snapshot replay failed");
    }

    loop {
        match feed.recv().await {
            Ok(StoreEvent::CandidateAdded { record })
                if record.pair_key == pair && record.role == remote_role =>
            {
                if seen.insert(record.id) {
                    if let Err(err) = media.add_remote_candidate(record.candidate).await {
                        tracing::warn!(pair = %pair, %err, "transport rejected remote candidate");
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, pair = %pair, "candidate feed lagged, replaying snapshot");
                if let Err(err) =
                    replay_snapshot(&store, &pair, remote_role, &media, &mut seen).await
                {
                    tracing::warn!(pair = %pair, %err, "candidate snapshot replay failed");
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

async fn replay_snapshot(
    store: &Arc<dyn SignalStore>,
    pair: &PairKey,
    remote_role: CallRole,
    media: &Arc<dyn MediaSession>,
    seen: &mut HashSet<CandidateId>,
) -> Result<(), StoreError> {
    for record in store.list_candidates(pair, remote_role).await? {
        if seen.insert(record.id) {
            if let Err(err) = media.add_remote_candidate(record.candidate).await {
                tracing::warn!(pair = %pair, %err, "transport rejected snapshot candidate");
            }
        }
    }
    Ok(())
}
