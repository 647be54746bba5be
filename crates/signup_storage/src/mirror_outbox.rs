#![forbid(unsafe_code)]

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use signup_contracts::mirror::{CommitLabel, MirrorSyncKind, MirrorSyncState};
use signup_contracts::MonotonicTimeNs;

use crate::fsutil::{atomic_write, read_optional};
use crate::store::StorageError;

const TABLE: &str = "mirror_outbox";
const OUTBOX_SCHEMA_VERSION: u8 = 1;

/// Acked rows kept for inspection; older ones are pruned on the next ack.
pub const ACKED_RETENTION_MAX: usize = 256;

/// Dead-lettered rows kept for requeue. Every push carries the full CSV, so
/// dropping the oldest ones loses no registration data.
pub const DEAD_LETTER_RETENTION_MAX: usize = 256;

/// One pending (or settled) push of the registration CSV to the remote mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSyncQueueRecord {
    pub sync_job_id: String,
    pub sync_kind: MirrorSyncKind,
    /// Serial of the registration that caused the job, when there is one.
    pub record_key: Option<String>,
    pub commit_label: CommitLabel,
    pub state: MirrorSyncState,
    pub enqueued_at: MonotonicTimeNs,
    pub attempt_count: u16,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<MonotonicTimeNs>,
    pub acked_at: Option<MonotonicTimeNs>,
    pub last_error: Option<String>,
    pub idempotency_key: String,
}

impl MirrorSyncQueueRecord {
    fn is_due(&self, now: MonotonicTimeNs) -> bool {
        match self.state {
            MirrorSyncState::Queued => true,
            MirrorSyncState::InFlight => self.lease_expires_at.is_some_and(|at| at <= now),
            MirrorSyncState::Acked | MirrorSyncState::DeadLetter => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct OutboxDocument {
    schema_version: u8,
    next_seq: u64,
    rows: Vec<MirrorSyncQueueRecord>,
}

/// Durable queue of mirror pushes, persisted as one JSON document.
#[derive(Debug)]
pub struct MirrorOutbox {
    path: Option<PathBuf>,
    next_seq: u64,
    rows: Vec<MirrorSyncQueueRecord>,
}

impl MirrorOutbox {
    pub fn new_in_memory() -> Self {
        Self {
            path: None,
            next_seq: 1,
            rows: Vec::new(),
        }
    }

    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        let doc = match read_optional(&path)? {
            Some(bytes) if !bytes.iter().all(u8::is_ascii_whitespace) => {
                let doc = serde_json::from_slice::<OutboxDocument>(&bytes)?;
                if doc.schema_version != OUTBOX_SCHEMA_VERSION {
                    return Err(StorageError::UnsupportedSchema {
                        table: TABLE,
                        found: doc.schema_version,
                    });
                }
                doc
            }
            _ => OutboxDocument {
                schema_version: OUTBOX_SCHEMA_VERSION,
                next_seq: 1,
                rows: Vec::new(),
            },
        };
        Ok(Self {
            path: Some(path),
            next_seq: doc.next_seq.max(1),
            rows: doc.rows,
        })
    }

    pub fn queue_rows(&self) -> &[MirrorSyncQueueRecord] {
        &self.rows
    }

    /// In-flight rows whose lease (or retry delay) has expired.
    pub fn replay_due_rows(&self, now: MonotonicTimeNs) -> Vec<&MirrorSyncQueueRecord> {
        self.rows
            .iter()
            .filter(|r| r.state == MirrorSyncState::InFlight && r.is_due(now))
            .collect()
    }

    pub fn dead_letter_rows(&self) -> Vec<&MirrorSyncQueueRecord> {
        self.rows
            .iter()
            .filter(|r| r.state == MirrorSyncState::DeadLetter)
            .collect()
    }

    /// Queues a push. A job whose idempotency key matches an unsettled row is
    /// not duplicated; the existing job id is returned instead.
    pub fn enqueue(
        &mut self,
        now: MonotonicTimeNs,
        sync_kind: MirrorSyncKind,
        record_key: Option<String>,
        commit_label: CommitLabel,
    ) -> Result<String, StorageError> {
        let seq = self.next_seq;
        let idempotency_key = match record_key.as_deref() {
            Some(key) => format!("{}:{key}", sync_kind.as_str()),
            None => format!("{}:seq{seq}", sync_kind.as_str()),
        };
        if let Some(existing) = self.rows.iter().find(|r| {
            r.idempotency_key == idempotency_key
                && matches!(
                    r.state,
                    MirrorSyncState::Queued | MirrorSyncState::InFlight
                )
        }) {
            return Ok(existing.sync_job_id.clone());
        }

        let sync_job_id = format!("mirror_job_{seq:08}");
        let mut rows = self.rows.clone();
        rows.push(MirrorSyncQueueRecord {
            sync_job_id: sync_job_id.clone(),
            sync_kind,
            record_key,
            commit_label,
            state: MirrorSyncState::Queued,
            enqueued_at: now,
            attempt_count: 0,
            lease_owner: None,
            lease_expires_at: None,
            acked_at: None,
            last_error: None,
            idempotency_key,
        });
        self.commit(rows, seq + 1)?;
        Ok(sync_job_id)
    }

    /// Leases up to `max_items` due rows to `worker_id`, oldest first.
    pub fn dequeue_batch(
        &mut self,
        now: MonotonicTimeNs,
        max_items: u16,
        lease_duration_ms: u32,
        worker_id: String,
    ) -> Result<Vec<MirrorSyncQueueRecord>, StorageError> {
        let mut rows = self.rows.clone();
        let mut leased = Vec::new();
        for row in rows.iter_mut() {
            if leased.len() >= max_items as usize {
                break;
            }
            if !row.is_due(now) {
                continue;
            }
            row.state = MirrorSyncState::InFlight;
            row.attempt_count = row.attempt_count.saturating_add(1);
            row.lease_owner = Some(worker_id.clone());
            row.lease_expires_at = Some(now.saturating_add_ms(lease_duration_ms));
            leased.push(row.clone());
        }
        if leased.is_empty() {
            return Ok(leased);
        }
        self.commit(rows, self.next_seq)?;
        Ok(leased)
    }

    pub fn ack_commit(
        &mut self,
        now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let mut rows = self.rows.clone();
        let row = find_in_flight(&mut rows, sync_job_id, worker_id)?;
        row.state = MirrorSyncState::Acked;
        row.acked_at = Some(now);
        row.lease_owner = None;
        row.lease_expires_at = None;
        prune_settled(&mut rows, MirrorSyncState::Acked, ACKED_RETENTION_MAX);
        self.commit(rows, self.next_seq)
    }

    /// Records a failed attempt; the row becomes due again after `retry_after_ms`.
    pub fn fail_commit(
        &mut self,
        now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
        last_error: String,
        retry_after_ms: u32,
    ) -> Result<(), StorageError> {
        let mut rows = self.rows.clone();
        let row = find_in_flight(&mut rows, sync_job_id, worker_id)?;
        row.last_error = Some(last_error);
        row.lease_owner = None;
        row.lease_expires_at = Some(now.saturating_add_ms(retry_after_ms));
        self.commit(rows, self.next_seq)
    }

    pub fn dead_letter_commit(
        &mut self,
        _now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
        last_error: String,
    ) -> Result<(), StorageError> {
        let mut rows = self.rows.clone();
        let row = find_in_flight(&mut rows, sync_job_id, worker_id)?;
        row.state = MirrorSyncState::DeadLetter;
        row.last_error = Some(last_error);
        row.lease_owner = None;
        row.lease_expires_at = None;
        prune_settled(&mut rows, MirrorSyncState::DeadLetter, DEAD_LETTER_RETENTION_MAX);
        self.commit(rows, self.next_seq)
    }

    /// Moves dead-lettered rows back to the queue with a fresh attempt budget.
    pub fn requeue_dead_letters(&mut self) -> Result<usize, StorageError> {
        let mut rows = self.rows.clone();
        let mut moved = 0;
        for row in rows
            .iter_mut()
            .filter(|r| r.state == MirrorSyncState::DeadLetter)
        {
            row.state = MirrorSyncState::Queued;
            row.attempt_count = 0;
            row.lease_expires_at = None;
            moved += 1;
        }
        if moved > 0 {
            self.commit(rows, self.next_seq)?;
        }
        Ok(moved)
    }

    fn commit(
        &mut self,
        rows: Vec<MirrorSyncQueueRecord>,
        next_seq: u64,
    ) -> Result<(), StorageError> {
        if let Some(path) = self.path.as_ref() {
            let doc = OutboxDocument {
                schema_version: OUTBOX_SCHEMA_VERSION,
                next_seq,
                rows,
            };
            let bytes = serde_json::to_vec_pretty(&doc)?;
            atomic_write(path, &bytes)?;
            self.rows = doc.rows;
        } else {
            self.rows = rows;
        }
        self.next_seq = next_seq;
        Ok(())
    }
}

fn find_in_flight<'a>(
    rows: &'a mut [MirrorSyncQueueRecord],
    sync_job_id: &str,
    worker_id: Option<&str>,
) -> Result<&'a mut MirrorSyncQueueRecord, StorageError> {
    let row = rows
        .iter_mut()
        .find(|r| r.sync_job_id == sync_job_id)
        .ok_or_else(|| StorageError::NotFound {
            table: TABLE,
            key: sync_job_id.to_string(),
        })?;
    if row.state != MirrorSyncState::InFlight {
        return Err(StorageError::InvalidTransition {
            table: TABLE,
            key: sync_job_id.to_string(),
            from: state_label(row.state),
        });
    }
    if let (Some(worker), Some(owner)) = (worker_id, row.lease_owner.as_deref()) {
        if worker != owner {
            return Err(StorageError::LeaseMismatch {
                table: TABLE,
                key: sync_job_id.to_string(),
            });
        }
    }
    Ok(row)
}

/// Drops the oldest rows in `state` beyond `keep`.
fn prune_settled(rows: &mut Vec<MirrorSyncQueueRecord>, state: MirrorSyncState, keep: usize) {
    let settled = rows.iter().filter(|r| r.state == state).count();
    let mut excess = settled.saturating_sub(keep);
    rows.retain(|r| {
        if excess > 0 && r.state == state {
            excess -= 1;
            return false;
        }
        true
    });
}

fn state_label(state: MirrorSyncState) -> &'static str {
    match state {
        MirrorSyncState::Queued => "Queued",
        MirrorSyncState::InFlight => "InFlight",
        MirrorSyncState::Acked => "Acked",
        MirrorSyncState::DeadLetter => "DeadLetter",
    }
}
