use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! row_id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

row_id_newtype!(CandidateId);
row_id_newtype!(HistoryEntryId);

/// Opaque participant identity. Ordering is plain lexicographic byte order,
/// which is what pair-key normalization and glare resolution sort by.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Deterministic session key for a participant pair: the two ids sorted
/// ascending and joined with `_`. Order-independent, so both sides of a call
/// address the same session document without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairKey(String);

impl PairKey {
    pub fn new(a: &ParticipantId, b: &ParticipantId) -> Self {
        if a <= b {
            Self(format!("{}_{}", a.0, b.0))
        } else {
            Self(format!("{}_{}", b.0, a.0))
        }
    }

    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Positional membership test. Can over-match ids that contain `_`;
    /// consumers always re-check against an exact pair key.
    pub fn includes(&self, id: &ParticipantId) -> bool {
        self.0.len() > id.0.len()
            && (self.0.as_bytes()[id.0.len()] == b'_' && self.0.starts_with(id.as_str())
                || self.0.as_bytes()[self.0.len() - id.0.len() - 1] == b'_'
                    && self.0.ends_with(id.as_str()))
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one call lifecycle. A recycled session document on the same
/// pair key gets a fresh one; history entries on both sides correlate on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Ringing,
    Connected,
    Declined,
    Missed,
    Ended,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Ringing => "ringing",
            CallStatus::Connected => "connected",
            CallStatus::Declined => "declined",
            CallStatus::Missed => "missed",
            CallStatus::Ended => "ended",
        }
    }

    /// Terminal statuses never change once written.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallStatus::Declined | CallStatus::Missed | CallStatus::Ended
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallRole {
    Caller,
    Receiver,
}

impl CallRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallRole::Caller => "caller",
            CallRole::Receiver => "receiver",
        }
    }

    pub fn opposite(&self) -> CallRole {
        match self {
            CallRole::Caller => CallRole::Receiver,
            CallRole::Receiver => CallRole::Caller,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallDirection {
    Incoming,
    Outgoing,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Incoming => "incoming",
            CallDirection::Outgoing => "outgoing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    HungUp,
    Declined,
    Missed,
    NetworkFailure,
    NegotiationFailure,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::HungUp => "hung_up",
            EndReason::Declined => "declined",
            EndReason::Missed => "missed",
            EndReason::NetworkFailure => "network_failure",
            EndReason::NegotiationFailure => "negotiation_failure",
        }
    }

    /// Default reason a bystander infers when the other side finalized the
    /// session and no richer reason travelled with it.
    pub fn from_terminal(status: CallStatus) -> Option<EndReason> {
        match status {
            CallStatus::Declined => Some(EndReason::Declined),
            CallStatus::Missed => Some(EndReason::Missed),
            CallStatus::Ended => Some(EndReason::HungUp),
            CallStatus::Ringing | CallStatus::Connected => None,
        }
    }
}

/// User-facing connectivity, folded from raw transport transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Opaque negotiation blob. Stored and forwarded verbatim, never parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// The session document. At most one exists per pair key; `status` moves
/// monotonically through the call state machine and sticks once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    pub pair_key: PairKey,
    pub call_id: CallId,
    pub caller_id: ParticipantId,
    pub receiver_id: ParticipantId,
    pub caller_label: String,
    pub receiver_label: String,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl CallSession {
    /// Resolve which side of the document `id` is. Code branches on the
    /// returned role once per read instead of comparing ids ad hoc.
    pub fn role_of(&self, id: &ParticipantId) -> Option<CallRole> {
        if *id == self.caller_id {
            Some(CallRole::Caller)
        } else if *id == self.receiver_id {
            Some(CallRole::Receiver)
        } else {
            None
        }
    }

    pub fn other_party(&self, id: &ParticipantId) -> Option<&ParticipantId> {
        match self.role_of(id)? {
            CallRole::Caller => Some(&self.receiver_id),
            CallRole::Receiver => Some(&self.caller_id),
        }
    }

    pub fn label_of(&self, id: &ParticipantId) -> Option<&str> {
        match self.role_of(id)? {
            CallRole::Caller => Some(&self.caller_label),
            CallRole::Receiver => Some(&self.receiver_label),
        }
    }
}

/// Inputs for creating (or recycling) a session document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCallSession {
    pub caller_id: ParticipantId,
    pub caller_label: String,
    pub receiver_id: ParticipantId,
    pub receiver_label: String,
    pub media_kind: MediaKind,
}

impl NewCallSession {
    pub fn pair_key(&self) -> PairKey {
        PairKey::new(&self.caller_id, &self.receiver_id)
    }
}

/// One appended trickle candidate. `id` is the append order within the pair
/// and the dedup key for delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub id: CandidateId,
    pub pair_key: PairKey,
    pub role: CallRole,
    pub candidate: IceCandidate,
    pub created_at: DateTime<Utc>,
}

/// A participant's private view of one call. Each side owns its copy;
/// `call_id` ties the two copies to the same lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallHistoryEntry {
    pub id: HistoryEntryId,
    pub owner_id: ParticipantId,
    pub call_id: CallId,
    pub other_id: ParticipantId,
    pub other_label: String,
    pub direction: CallDirection,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<EndReason>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewHistoryEntry {
    pub owner_id: ParticipantId,
    pub call_id: CallId,
    pub other_id: ParticipantId,
    pub other_label: String,
    pub direction: CallDirection,
    pub media_kind: MediaKind,
    pub status: CallStatus,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_order_independent() {
        let a = ParticipantId::new("alice");
        let b = ParticipantId::new("bob");
        assert_eq!(PairKey::new(&a, &b), PairKey::new(&b, &a));
        assert_eq!(PairKey::new(&a, &b).as_str(), "alice_bob");
    }

    #[test]
    fn pair_key_membership_matches_both_positions() {
        let a = ParticipantId::new("alice");
        let b = ParticipantId::new("bob");
        let key = PairKey::new(&b, &a);
        assert!(key.includes(&a));
        assert!(key.includes(&b));
        assert!(!key.includes(&ParticipantId::new("carol")));
        assert!(!key.includes(&ParticipantId::new("ali")));
    }

    #[test]
    fn terminal_statuses_are_flagged() {
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Connected.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
        assert!(CallStatus::Missed.is_terminal());
        assert!(CallStatus::Ended.is_terminal());
    }

    #[test]
    fn session_resolves_roles_once() {
        let caller = ParticipantId::new("alice");
        let receiver = ParticipantId::new("bob");
        let session = CallSession {
            pair_key: PairKey::new(&caller, &receiver),
            call_id: CallId::new(),
            caller_id: caller.clone(),
            receiver_id: receiver.clone(),
            caller_label: "Alice".into(),
            receiver_label: "Bob".into(),
            media_kind: MediaKind::Video,
            status: CallStatus::Ringing,
            offer: None,
            answer: None,
            created_at: Utc::now(),
            ended_at: None,
        };
        assert_eq!(session.role_of(&caller), Some(CallRole::Caller));
        assert_eq!(session.role_of(&receiver), Some(CallRole::Receiver));
        assert_eq!(session.role_of(&ParticipantId::new("carol")), None);
        assert_eq!(session.other_party(&caller), Some(&receiver));
        assert_eq!(session.label_of(&receiver), Some("Bob"));
    }
}
