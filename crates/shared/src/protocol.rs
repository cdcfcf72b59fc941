use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    CallHistoryEntry, CallRole, CallSession, CallStatus, CandidateRecord, EndReason,
    HistoryEntryId, IceCandidate, NewHistoryEntry, PairKey, ParticipantId, SessionDescription,
};

/// Store change feed, pushed over the WebSocket endpoint and mirrored by the
/// in-process broadcast of every store handle. One firehose; consumers filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum StoreEvent {
    SessionChanged {
        session: CallSession,
    },
    CandidateAdded {
        record: CandidateRecord,
    },
    CandidatesCleared {
        pair_key: PairKey,
    },
    HistoryChanged {
        owner_id: ParticipantId,
    },
}

impl StoreEvent {
    /// Whether this event concerns `id` at all. Pair-key matches may
    /// over-deliver; exact filtering happens at the consumer.
    pub fn concerns(&self, id: &ParticipantId) -> bool {
        match self {
            StoreEvent::SessionChanged { session } => {
                session.caller_id == *id || session.receiver_id == *id
            }
            StoreEvent::CandidateAdded { record } => record.pair_key.includes(id),
            StoreEvent::CandidatesCleared { pair_key } => pair_key.includes(id),
            StoreEvent::HistoryChanged { owner_id } => owner_id == id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCallResponse {
    pub created: bool,
    pub session: CallSession,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishDescriptionRequest {
    pub writer_id: ParticipantId,
    pub description: SessionDescription,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishDescriptionResponse {
    pub wrote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptCallRequest {
    pub receiver_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveGlareRequest {
    pub caller_id: ParticipantId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeCallRequest {
    pub status: CallStatus,
    pub ended_at: DateTime<Utc>,
}

/// Accept/glare/finalize all answer with the resulting document, or `None`
/// when the conditional write matched nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<CallSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendCandidateRequest {
    pub role: CallRole,
    pub candidate: IceCandidate,
}

/// Carries the whole entry so a finalize that arrives before (or without)
/// the ringing-time record can still insert a complete row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeHistoryRequest {
    pub entry: NewHistoryEntry,
    pub reason: EndReason,
    pub ended_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteHistoryRequest {
    pub entry_ids: Vec<HistoryEntryId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteHistoryResponse {
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryListResponse {
    pub entries: Vec<CallHistoryEntry>,
}
