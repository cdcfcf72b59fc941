//! Per-participant call ledger writes.
//!
//! Each side owns its own denormalized entries; the two sides' copies of one
//! lifecycle correlate on the call id and agree on `ended_at` because both
//! copy it from the session document rather than their local clocks.

use std::sync::Arc;

use chrono::Utc;
use shared::domain::{CallDirection, CallSession, EndReason, NewHistoryEntry, ParticipantId};
use signal_store::SignalStore;

/// Builds the owner's entry for this lifecycle. `None` when `owner` is not a
/// party to the session, which callers treat as a filtered-out event.
pub(crate) fn entry_for(
    session: &CallSession,
    owner: &ParticipantId,
    direction: CallDirection,
) -> Option<NewHistoryEntry> {
    let other = session.other_party(owner)?.clone();
    let other_label = session.label_of(&other)?.to_string();
    Some(NewHistoryEntry {
        owner_id: owner.clone(),
        call_id: session.call_id,
        other_id: other,
        other_label,
        direction,
        media_kind: session.media_kind,
        status: session.status,
        started_at: session.created_at,
    })
}

pub(crate) async fn record_attempt(
    store: &Arc<dyn SignalStore>,
    session: &CallSession,
    owner: &ParticipantId,
    direction: CallDirection,
) {
    let Some(entry) = entry_for(session, owner, direction) else {
        return;
    };
    if let Err(err) = store.record_history(entry).await {
        tracing::warn!(owner = %owner, call = %session.call_id, %err, "history attempt not recorded");
    }
}

/// Marks the owner's entry terminal. The session document's `ended_at` is the
/// source of truth; `now` only backstops a document that lost the field.
pub(crate) async fn finalize(
    store: &Arc<dyn SignalStore>,
    session: &CallSession,
    owner: &ParticipantId,
    direction: CallDirection,
    reason: EndReason,
) {
    let Some(entry) = entry_for(session, owner, direction) else {
        return;
    };
    let ended_at = session.ended_at.unwrap_or_else(Utc::now);
    if let Err(err) = store.finalize_history(entry, reason, ended_at).await {
        tracing::warn!(owner = %owner, call = %session.call_id, %err, "history finalize failed");
    }
}
