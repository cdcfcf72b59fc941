use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;
use tokio::sync::broadcast;
use uuid::Uuid;

use shared::domain::{
    CallDirection, CallHistoryEntry, CallId, CallRole, CallSession, CallStatus, CandidateId,
    CandidateRecord, EndReason, HistoryEntryId, IceCandidate, MediaKind, NewCallSession,
    NewHistoryEntry, PairKey, ParticipantId, SessionDescription,
};
use shared::protocol::StoreEvent;

pub mod remote;

pub use remote::RemoteStore;

const EVENT_CAPACITY: usize = 256;

/// Why a store call failed. `Unavailable` is the transient class: the same
/// idempotent operation can be retried, and a failed write never half-applies
/// a transition.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("session create raced and no live session was readable")]
    Conflict,
    #[error("malformed stored value: {0}")]
    Malformed(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                StoreError::Malformed(err.to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

/// Outcome of the atomic create-if-absent on a pair key.
#[derive(Debug, Clone)]
pub enum SessionCreate {
    /// This side's document won (fresh insert or recycled terminal row).
    Created(CallSession),
    /// A live session already exists; the caller decides between joining it
    /// (glare) and surfacing it.
    Live(CallSession),
}

/// Persistence boundary for sessions, candidate logs and history ledgers.
///
/// Every mutation is either idempotent or a conditional write that matches
/// nothing when its precondition no longer holds, so callers can retry after
/// transient failures without re-checking state first.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Atomic create-if-absent. A terminal document on the same pair key is
    /// recycled in place (fresh call id, negotiation state cleared) so at
    /// most one document per pair ever exists.
    async fn create_session(&self, new_session: NewCallSession)
        -> Result<SessionCreate, StoreError>;

    async fn load_session(&self, pair: &PairKey) -> Result<Option<CallSession>, StoreError>;

    /// First write wins; repeats and writes by the wrong role are no-ops.
    /// Returns whether this call stored the description.
    async fn set_offer(
        &self,
        pair: &PairKey,
        writer: &ParticipantId,
        description: &SessionDescription,
    ) -> Result<bool, StoreError>;

    /// Same contract as [`Self::set_offer`]; additionally requires the offer
    /// to be present already.
    async fn set_answer(
        &self,
        pair: &PairKey,
        writer: &ParticipantId,
        description: &SessionDescription,
    ) -> Result<bool, StoreError>;

    /// `ringing -> connected`, only when `acceptor` is the recorded receiver.
    /// `None` when the precondition did not hold.
    async fn accept_session(
        &self,
        pair: &PairKey,
        acceptor: &ParticipantId,
    ) -> Result<Option<CallSession>, StoreError>;

    /// Glare resolution: swaps the recorded roles so `caller` (currently the
    /// recorded receiver) becomes the caller, marks the session connected and
    /// resets negotiation state, candidate logs included. `None` unless the
    /// session is ringing with exactly that inversion in place.
    async fn resolve_glare(
        &self,
        pair: &PairKey,
        caller: &ParticipantId,
    ) -> Result<Option<CallSession>, StoreError>;

    /// Conditional transition to a terminal status; the allowed source is
    /// implied by the target (`ended` from connected, `missed`/`declined`
    /// from ringing). `None` when already terminal, which callers treat as
    /// success.
    async fn finalize_session(
        &self,
        pair: &PairKey,
        status: CallStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<CallSession>, StoreError>;

    /// Appends to the role's log. `None` when the session is gone or
    /// terminal; stragglers racing teardown are dropped, not stored.
    async fn append_candidate(
        &self,
        pair: &PairKey,
        role: CallRole,
        candidate: &IceCandidate,
    ) -> Result<Option<CandidateRecord>, StoreError>;

    /// Snapshot of one role's log in append order.
    async fn list_candidates(
        &self,
        pair: &PairKey,
        role: CallRole,
    ) -> Result<Vec<CandidateRecord>, StoreError>;

    /// Purges both role logs. Safe to call redundantly.
    async fn clear_candidates(&self, pair: &PairKey) -> Result<(), StoreError>;

    /// Upserts the owner's entry for the lifecycle (keyed on owner and call
    /// id), refreshing status, direction and label. A glare loser re-records
    /// its dial as outgoing over a ring surfaced moments earlier.
    async fn record_history(&self, entry: NewHistoryEntry)
        -> Result<CallHistoryEntry, StoreError>;

    /// Marks the owner's entry terminal, write-once: a finalized entry is
    /// never overwritten. Inserts the entry when it was never recorded.
    async fn finalize_history(
        &self,
        entry: NewHistoryEntry,
        reason: EndReason,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_history(
        &self,
        owner: &ParticipantId,
    ) -> Result<Vec<CallHistoryEntry>, StoreError>;

    /// Deletes the owner's entries by id, skipping ids that do not exist or
    /// belong to someone else. Returns how many were removed.
    async fn delete_history(
        &self,
        owner: &ParticipantId,
        entry_ids: &[HistoryEntryId],
    ) -> Result<u64, StoreError>;

    /// Change feed for everything this store persists. One firehose per
    /// handle; consumers filter.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

const SESSION_COLUMNS: &str = "pair_key, call_id, caller_id, receiver_id, caller_label, \
     receiver_label, media_kind, status, offer_type, offer_payload, answer_type, \
     answer_payload, created_at, ended_at";

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool<Sqlite>,
    events: broadcast::Sender<StoreEvent>,
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A pooled in-memory database is one database per connection; force a
        // single connection so every handle sees the same data.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self { pool, events })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        let _: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    async fn emit_session(&self, pair: &PairKey) -> Result<Option<CallSession>, StoreError> {
        let session = self.load_session(pair).await?;
        if let Some(session) = session.clone() {
            self.emit(StoreEvent::SessionChanged { session });
        }
        Ok(session)
    }
}

#[async_trait]
impl SignalStore for SqliteStore {
    async fn create_session(
        &self,
        new_session: NewCallSession,
    ) -> Result<SessionCreate, StoreError> {
        let pair = new_session.pair_key();
        let call_id = CallId::new();
        let created_at = Utc::now();

        let sql = format!(
            "INSERT INTO call_sessions (pair_key, call_id, caller_id, receiver_id, \
                 caller_label, receiver_label, media_kind, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 'ringing', ?) \
             ON CONFLICT(pair_key) DO UPDATE SET \
                 call_id = excluded.call_id, \
                 caller_id = excluded.caller_id, \
                 receiver_id = excluded.receiver_id, \
                 caller_label = excluded.caller_label, \
                 receiver_label = excluded.receiver_label, \
                 media_kind = excluded.media_kind, \
                 status = 'ringing', \
                 offer_type = NULL, offer_payload = NULL, \
                 answer_type = NULL, answer_payload = NULL, \
                 created_at = excluded.created_at, \
                 ended_at = NULL \
             WHERE call_sessions.status IN ('declined', 'missed', 'ended') \
             RETURNING {SESSION_COLUMNS}"
        );
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&sql)
            .bind(pair.as_str())
            .bind(call_id.to_string())
            .bind(new_session.caller_id.as_str())
            .bind(new_session.receiver_id.as_str())
            .bind(&new_session.caller_label)
            .bind(&new_session.receiver_label)
            .bind(new_session.media_kind.as_str())
            .bind(created_at)
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = row {
            let session = session_from_row(&row)?;
            // logs from a recycled lifecycle must not leak into this one
            sqlx::query("DELETE FROM call_candidates WHERE pair_key = ?")
                .bind(pair.as_str())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            self.emit(StoreEvent::SessionChanged {
                session: session.clone(),
            });
            tracing::debug!(pair = %pair, call = %session.call_id, "session created");
            return Ok(SessionCreate::Created(session));
        }
        tx.rollback().await?;

        match self.load_session(&pair).await? {
            Some(existing) => Ok(SessionCreate::Live(existing)),
            None => Err(StoreError::Conflict),
        }
    }

    async fn load_session(&self, pair: &PairKey) -> Result<Option<CallSession>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM call_sessions WHERE pair_key = ?");
        let row = sqlx::query(&sql)
            .bind(pair.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    async fn set_offer(
        &self,
        pair: &PairKey,
        writer: &ParticipantId,
        description: &SessionDescription,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE call_sessions SET offer_type = ?, offer_payload = ? \
             WHERE pair_key = ? AND caller_id = ? AND offer_payload IS NULL \
               AND status IN ('ringing', 'connected')",
        )
        .bind(&description.kind)
        .bind(&description.payload)
        .bind(pair.as_str())
        .bind(writer.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            self.emit_session(pair).await?;
        }
        Ok(updated > 0)
    }

    async fn set_answer(
        &self,
        pair: &PairKey,
        writer: &ParticipantId,
        description: &SessionDescription,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE call_sessions SET answer_type = ?, answer_payload = ? \
             WHERE pair_key = ? AND receiver_id = ? AND answer_payload IS NULL \
               AND offer_payload IS NOT NULL AND status IN ('ringing', 'connected')",
        )
        .bind(&description.kind)
        .bind(&description.payload)
        .bind(pair.as_str())
        .bind(writer.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated > 0 {
            self.emit_session(pair).await?;
        }
        Ok(updated > 0)
    }

    async fn accept_session(
        &self,
        pair: &PairKey,
        acceptor: &ParticipantId,
    ) -> Result<Option<CallSession>, StoreError> {
        let updated = sqlx::query(
            "UPDATE call_sessions SET status = 'connected' \
             WHERE pair_key = ? AND receiver_id = ? AND status = 'ringing'",
        )
        .bind(pair.as_str())
        .bind(acceptor.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        self.emit_session(pair).await
    }

    async fn resolve_glare(
        &self,
        pair: &PairKey,
        caller: &ParticipantId,
    ) -> Result<Option<CallSession>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE call_sessions SET \
                 caller_id = receiver_id, receiver_id = caller_id, \
                 caller_label = receiver_label, receiver_label = caller_label, \
                 status = 'connected', \
                 offer_type = NULL, offer_payload = NULL, \
                 answer_type = NULL, answer_payload = NULL \
             WHERE pair_key = ? AND status = 'ringing' AND receiver_id = ?",
        )
        .bind(pair.as_str())
        .bind(caller.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return Ok(None);
        }
        sqlx::query("DELETE FROM call_candidates WHERE pair_key = ?")
            .bind(pair.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        self.emit(StoreEvent::CandidatesCleared { pair_key: pair.clone() });
        let session = self.emit_session(pair).await?;
        tracing::info!(pair = %pair, caller = %caller, "glare resolved, roles swapped");
        Ok(session)
    }

    async fn finalize_session(
        &self,
        pair: &PairKey,
        status: CallStatus,
        ended_at: DateTime<Utc>,
    ) -> Result<Option<CallSession>, StoreError> {
        let from_status = match status {
            CallStatus::Ended => CallStatus::Connected,
            CallStatus::Missed | CallStatus::Declined => CallStatus::Ringing,
            // live targets are not finalization; the conditional write below
            // would be unsound for them
            CallStatus::Ringing | CallStatus::Connected => return Ok(None),
        };

        let updated = sqlx::query(
            "UPDATE call_sessions SET status = ?, ended_at = ? \
             WHERE pair_key = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(ended_at)
        .bind(pair.as_str())
        .bind(from_status.as_str())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Ok(None);
        }
        tracing::info!(pair = %pair, status = status.as_str(), "session finalized");
        self.emit_session(pair).await
    }

    async fn append_candidate(
        &self,
        pair: &PairKey,
        role: CallRole,
        candidate: &IceCandidate,
    ) -> Result<Option<CandidateRecord>, StoreError> {
        let created_at = Utc::now();
        let row = sqlx::query(
            "INSERT INTO call_candidates (pair_key, role, candidate, sdp_mid, \
                 sdp_mline_index, created_at) \
             SELECT ?, ?, ?, ?, ?, ? \
             WHERE EXISTS (SELECT 1 FROM call_sessions \
                           WHERE pair_key = ? AND status IN ('ringing', 'connected')) \
             RETURNING id",
        )
        .bind(pair.as_str())
        .bind(role.as_str())
        .bind(&candidate.candidate)
        .bind(candidate.sdp_mid.as_deref())
        .bind(candidate.sdp_mline_index)
        .bind(created_at)
        .bind(pair.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let record = CandidateRecord {
            id: CandidateId(row.get::<i64, _>(0)),
            pair_key: pair.clone(),
            role,
            candidate: candidate.clone(),
            created_at,
        };
        self.emit(StoreEvent::CandidateAdded {
            record: record.clone(),
        });
        Ok(Some(record))
    }

    async fn list_candidates(
        &self,
        pair: &PairKey,
        role: CallRole,
    ) -> Result<Vec<CandidateRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, pair_key, role, candidate, sdp_mid, sdp_mline_index, created_at \
             FROM call_candidates WHERE pair_key = ? AND role = ? ORDER BY id ASC",
        )
        .bind(pair.as_str())
        .bind(role.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(candidate_from_row).collect()
    }

    async fn clear_candidates(&self, pair: &PairKey) -> Result<(), StoreError> {
        let removed = sqlx::query("DELETE FROM call_candidates WHERE pair_key = ?")
            .bind(pair.as_str())
            .execute(&self.pool)
            .await?
            .rows_affected();
        if removed > 0 {
            self.emit(StoreEvent::CandidatesCleared { pair_key: pair.clone() });
        }
        Ok(())
    }

    async fn record_history(
        &self,
        entry: NewHistoryEntry,
    ) -> Result<CallHistoryEntry, StoreError> {
        let row = sqlx::query(
            "INSERT INTO call_history (owner_id, call_id, other_id, other_label, \
                 direction, media_kind, status, started_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(owner_id, call_id) DO UPDATE SET \
                 status = excluded.status, \
                 direction = excluded.direction, \
                 other_label = excluded.other_label \
             RETURNING id, owner_id, call_id, other_id, other_label, direction, \
                 media_kind, status, reason, started_at, ended_at",
        )
        .bind(entry.owner_id.as_str())
        .bind(entry.call_id.to_string())
        .bind(entry.other_id.as_str())
        .bind(&entry.other_label)
        .bind(entry.direction.as_str())
        .bind(entry.media_kind.as_str())
        .bind(entry.status.as_str())
        .bind(entry.started_at)
        .fetch_one(&self.pool)
        .await?;

        let stored = history_from_row(&row)?;
        self.emit(StoreEvent::HistoryChanged {
            owner_id: entry.owner_id.clone(),
        });
        Ok(stored)
    }

    async fn finalize_history(
        &self,
        entry: NewHistoryEntry,
        reason: EndReason,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO call_history (owner_id, call_id, other_id, other_label, \
                 direction, media_kind, status, reason, started_at, ended_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(owner_id, call_id) DO UPDATE SET \
                 status = excluded.status, \
                 reason = excluded.reason, \
                 ended_at = excluded.ended_at \
             WHERE call_history.ended_at IS NULL",
        )
        .bind(entry.owner_id.as_str())
        .bind(entry.call_id.to_string())
        .bind(entry.other_id.as_str())
        .bind(&entry.other_label)
        .bind(entry.direction.as_str())
        .bind(entry.media_kind.as_str())
        .bind(entry.status.as_str())
        .bind(reason.as_str())
        .bind(entry.started_at)
        .bind(ended_at)
        .execute(&self.pool)
        .await?;

        self.emit(StoreEvent::HistoryChanged {
            owner_id: entry.owner_id.clone(),
        });
        Ok(())
    }

    async fn list_history(
        &self,
        owner: &ParticipantId,
    ) -> Result<Vec<CallHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, owner_id, call_id, other_id, other_label, direction, media_kind, \
                 status, reason, started_at, ended_at \
             FROM call_history WHERE owner_id = ? \
             ORDER BY started_at DESC, id DESC",
        )
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn delete_history(
        &self,
        owner: &ParticipantId,
        entry_ids: &[HistoryEntryId],
    ) -> Result<u64, StoreError> {
        if entry_ids.is_empty() {
            return Ok(0);
        }
        let placeholders = vec!["?"; entry_ids.len()].join(", ");
        let sql = format!("DELETE FROM call_history WHERE owner_id = ? AND id IN ({placeholders})");
        let mut query = sqlx::query(&sql).bind(owner.as_str());
        for id in entry_ids {
            query = query.bind(id.0);
        }
        let removed = query.execute(&self.pool).await?.rows_affected();
        if removed > 0 {
            self.emit(StoreEvent::HistoryChanged {
                owner_id: owner.clone(),
            });
        }
        Ok(removed)
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

fn session_from_row(row: &SqliteRow) -> Result<CallSession, StoreError> {
    Ok(CallSession {
        pair_key: PairKey::from_raw(row.try_get::<String, _>("pair_key")?),
        call_id: parse_call_id(&row.try_get::<String, _>("call_id")?)?,
        caller_id: ParticipantId::new(row.try_get::<String, _>("caller_id")?),
        receiver_id: ParticipantId::new(row.try_get::<String, _>("receiver_id")?),
        caller_label: row.try_get("caller_label")?,
        receiver_label: row.try_get("receiver_label")?,
        media_kind: parse_media_kind(&row.try_get::<String, _>("media_kind")?)?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        offer: description_from_parts(
            row.try_get("offer_type")?,
            row.try_get("offer_payload")?,
        ),
        answer: description_from_parts(
            row.try_get("answer_type")?,
            row.try_get("answer_payload")?,
        ),
        created_at: row.try_get("created_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn candidate_from_row(row: &SqliteRow) -> Result<CandidateRecord, StoreError> {
    Ok(CandidateRecord {
        id: CandidateId(row.try_get("id")?),
        pair_key: PairKey::from_raw(row.try_get::<String, _>("pair_key")?),
        role: parse_role(&row.try_get::<String, _>("role")?)?,
        candidate: IceCandidate {
            candidate: row.try_get("candidate")?,
            sdp_mid: row.try_get("sdp_mid")?,
            sdp_mline_index: row.try_get("sdp_mline_index")?,
        },
        created_at: row.try_get("created_at")?,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<CallHistoryEntry, StoreError> {
    let reason = row
        .try_get::<Option<String>, _>("reason")?
        .map(|r| parse_reason(&r))
        .transpose()?;
    Ok(CallHistoryEntry {
        id: HistoryEntryId(row.try_get("id")?),
        owner_id: ParticipantId::new(row.try_get::<String, _>("owner_id")?),
        call_id: parse_call_id(&row.try_get::<String, _>("call_id")?)?,
        other_id: ParticipantId::new(row.try_get::<String, _>("other_id")?),
        other_label: row.try_get("other_label")?,
        direction: parse_direction(&row.try_get::<String, _>("direction")?)?,
        media_kind: parse_media_kind(&row.try_get::<String, _>("media_kind")?)?,
        status: parse_status(&row.try_get::<String, _>("status")?)?,
        reason,
        started_at: row.try_get("started_at")?,
        ended_at: row.try_get("ended_at")?,
    })
}

fn description_from_parts(
    kind: Option<String>,
    payload: Option<String>,
) -> Option<SessionDescription> {
    match (kind, payload) {
        (Some(kind), Some(payload)) => Some(SessionDescription { kind, payload }),
        _ => None,
    }
}

fn parse_call_id(raw: &str) -> Result<CallId, StoreError> {
    Uuid::parse_str(raw)
        .map(CallId)
        .map_err(|_| StoreError::Malformed(format!("bad call id '{raw}'")))
}

fn parse_status(raw: &str) -> Result<CallStatus, StoreError> {
    match raw {
        "ringing" => Ok(CallStatus::Ringing),
        "connected" => Ok(CallStatus::Connected),
        "declined" => Ok(CallStatus::Declined),
        "missed" => Ok(CallStatus::Missed),
        "ended" => Ok(CallStatus::Ended),
        other => Err(StoreError::Malformed(format!("unknown call status '{other}'"))),
    }
}

fn parse_media_kind(raw: &str) -> Result<MediaKind, StoreError> {
    match raw {
        "audio" => Ok(MediaKind::Audio),
        "video" => Ok(MediaKind::Video),
        other => Err(StoreError::Malformed(format!("unknown media kind '{other}'"))),
    }
}

fn parse_role(raw: &str) -> Result<CallRole, StoreError> {
    match raw {
        "caller" => Ok(CallRole::Caller),
        "receiver" => Ok(CallRole::Receiver),
        other => Err(StoreError::Malformed(format!("unknown role '{other}'"))),
    }
}

fn parse_direction(raw: &str) -> Result<CallDirection, StoreError> {
    match raw {
        "incoming" => Ok(CallDirection::Incoming),
        "outgoing" => Ok(CallDirection::Outgoing),
        other => Err(StoreError::Malformed(format!("unknown direction '{other}'"))),
    }
}

fn parse_reason(raw: &str) -> Result<EndReason, StoreError> {
    match raw {
        "hung_up" => Ok(EndReason::HungUp),
        "declined" => Ok(EndReason::Declined),
        "missed" => Ok(EndReason::Missed),
        "network_failure" => Ok(EndReason::NetworkFailure),
        "negotiation_failure" => Ok(EndReason::NegotiationFailure),
        other => Err(StoreError::Malformed(format!("unknown end reason '{other}'"))),
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<(), StoreError> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).map_err(|err| {
        StoreError::Unavailable(format!(
            "failed to create parent directory '{}' for database url '{database_url}': {err}",
            parent.display()
        ))
    })
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
