#![forbid(unsafe_code)]

use std::env;
use std::sync::{Mutex, MutexGuard, TryLockError};

use signup_contracts::mirror::{CommitLabel, MirrorSyncState};
use signup_contracts::{ContractViolation, MonotonicTimeNs};
use signup_engines::mirror_client::{
    push_with_retry, HttpMirrorTransport, MirrorContentsConfig, MirrorPushError,
};
use signup_storage::mirror_outbox::MirrorSyncQueueRecord;
use signup_storage::repo::{MirrorOutboxRepo, RegistrationRepo};
use signup_storage::{SignupStore, StorageError};
use tracing::{info, warn};

use crate::SignupError;

pub const MIRROR_SYNC_WORKER_MAX_ITEMS: u16 = 16;
/// Lease for senders with no network timeouts, and the slack added on top of
/// the worst-case HTTP push.
pub const MIRROR_SYNC_LEASE_FLOOR_MS: u32 = 30_000;
pub const MIRROR_SYNC_MAX_ATTEMPTS_DEFAULT: u16 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MirrorSyncQueueMetrics {
    pub queued_count: u32,
    pub in_flight_count: u32,
    pub acked_count: u32,
    pub dead_letter_count: u32,
    pub replay_due_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MirrorSyncWorkerPassMetrics {
    pub dequeued_count: u16,
    pub acked_count: u16,
    pub retry_scheduled_count: u16,
    pub dead_lettered_count: u16,
    pub queue_after: MirrorSyncQueueMetrics,
}

/// Jobs leased by one worker pass plus the CSV snapshot that satisfies them.
///
/// Every job in the batch was enqueued after its local write committed, so
/// pushing the snapshot taken at claim time covers all of them at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSyncBatch {
    pub worker_id: String,
    pub jobs: Vec<MirrorSyncQueueRecord>,
    pub csv_bytes: Vec<u8>,
    pub commit_label: CommitLabel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSyncSendReceipt {
    pub remote_ack_ref: Option<String>,
}

/// Delivers one claimed batch to the remote mirror.
pub trait MirrorBatchSender {
    fn send(&self, batch: &MirrorSyncBatch) -> Result<MirrorSyncSendReceipt, MirrorPushError>;

    fn mode(&self) -> &'static str;

    /// How long a claimed job stays leased. Must outlast one `send`.
    fn lease_ms(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorSenderRuntime {
    LoopbackAck,
    Http(MirrorContentsConfig),
    AlwaysFail(MirrorPushError),
}

impl MirrorSenderRuntime {
    /// HTTP sender when `lookup` names a mirror target, loopback otherwise.
    pub fn from_lookup_or_loopback<F>(lookup: F) -> Result<Self, ContractViolation>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(match MirrorContentsConfig::from_lookup(lookup)? {
            Some(config) => {
                if config.token.is_none() {
                    warn!("mirror target configured without a token");
                }
                Self::Http(config)
            }
            None => Self::LoopbackAck,
        })
    }

}

impl MirrorBatchSender for MirrorSenderRuntime {
    fn send(&self, batch: &MirrorSyncBatch) -> Result<MirrorSyncSendReceipt, MirrorPushError> {
        match self {
            Self::LoopbackAck => Ok(MirrorSyncSendReceipt {
                remote_ack_ref: Some(format!("loopback_ack:{}", batch.worker_id)),
            }),
            Self::AlwaysFail(err) => Err(err.clone()),
            Self::Http(config) => {
                let transport = HttpMirrorTransport::new(config.clone());
                let receipt = push_with_retry(
                    &transport,
                    &batch.csv_bytes,
                    &batch.commit_label,
                    config.target.branch.as_deref(),
                )?;
                Ok(MirrorSyncSendReceipt {
                    remote_ack_ref: receipt.revision,
                })
            }
        }
    }

    fn mode(&self) -> &'static str {
        match self {
            Self::LoopbackAck => "loopback",
            Self::Http(_) => "http",
            Self::AlwaysFail(_) => "always_fail",
        }
    }

    fn lease_ms(&self) -> u32 {
        match self {
            Self::Http(config) => {
                let ms = config
                    .worst_case_push_ms()
                    .saturating_add(u64::from(MIRROR_SYNC_LEASE_FLOOR_MS));
                u32::try_from(ms).unwrap_or(u32::MAX)
            }
            Self::LoopbackAck | Self::AlwaysFail(_) => MIRROR_SYNC_LEASE_FLOOR_MS,
        }
    }
}

/// Runs outbox passes one at a time.
///
/// A pass pushes a CSV snapshot taken when it claimed its jobs. Two passes in
/// flight at once could land an older snapshot after a newer one and still ack
/// both batches, so every pass holds `pass_lock` from claim to settle. The
/// store lock is only taken for the claim and the settle.
#[derive(Debug)]
pub struct MirrorSyncWorker<S = MirrorSenderRuntime> {
    sender: S,
    max_attempts: u16,
    pass_lock: Mutex<()>,
}

impl<S: MirrorBatchSender> MirrorSyncWorker<S> {
    pub fn new(sender: S, max_attempts: u16) -> Self {
        Self {
            sender,
            max_attempts: max_attempts.max(1),
            pass_lock: Mutex::new(()),
        }
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    /// Waits for any running pass, then claims, sends and settles.
    pub fn run_pass(
        &self,
        store: &Mutex<SignupStore>,
        worker_id: &str,
        clock: impl Fn() -> MonotonicTimeNs,
    ) -> Result<MirrorSyncWorkerPassMetrics, SignupError> {
        let _pass = self
            .pass_lock
            .lock()
            .map_err(|_| SignupError::LockPoisoned("mirror sync pass"))?;
        self.run_exclusive(store, worker_id, &clock)
    }

    /// Like [`Self::run_pass`], but returns `Ok(None)` when another pass is running.
    pub fn try_run_pass(
        &self,
        store: &Mutex<SignupStore>,
        worker_id: &str,
        clock: impl Fn() -> MonotonicTimeNs,
    ) -> Result<Option<MirrorSyncWorkerPassMetrics>, SignupError> {
        let _pass = match self.pass_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Ok(None),
            Err(TryLockError::Poisoned(_)) => {
                return Err(SignupError::LockPoisoned("mirror sync pass"))
            }
        };
        self.run_exclusive(store, worker_id, &clock).map(Some)
    }

    fn run_exclusive(
        &self,
        store: &Mutex<SignupStore>,
        worker_id: &str,
        clock: &dyn Fn() -> MonotonicTimeNs,
    ) -> Result<MirrorSyncWorkerPassMetrics, SignupError> {
        let claimed_at = clock();
        let claimed = {
            let mut guard = lock_store(store)?;
            match claim_mirror_sync_batch(&mut guard, claimed_at, worker_id, self.sender.lease_ms())? {
                Some(batch) => batch,
                None => {
                    return Ok(MirrorSyncWorkerPassMetrics {
                        queue_after: snapshot_queue_metrics(&guard, claimed_at),
                        ..MirrorSyncWorkerPassMetrics::default()
                    })
                }
            }
        };
        let result = self.sender.send(&claimed);
        // the push may take a while; settle against a fresh clock
        let settled_at = clock().max(claimed_at);
        let mut guard = lock_store(store)?;
        Ok(settle_mirror_sync_batch(
            &mut guard,
            settled_at,
            &claimed,
            result,
            self.max_attempts,
        )?)
    }
}

fn lock_store(store: &Mutex<SignupStore>) -> Result<MutexGuard<'_, SignupStore>, SignupError> {
    store
        .lock()
        .map_err(|_| SignupError::LockPoisoned("signup store"))
}

/// Leases due jobs and snapshots the CSV. Runs under the store lock.
pub fn claim_mirror_sync_batch(
    store: &mut SignupStore,
    now: MonotonicTimeNs,
    worker_id: &str,
    lease_ms: u32,
) -> Result<Option<MirrorSyncBatch>, StorageError> {
    let jobs = store.mirror_outbox_dequeue_batch_row(
        now,
        MIRROR_SYNC_WORKER_MAX_ITEMS,
        lease_ms,
        worker_id.to_string(),
    )?;
    let Some(last) = jobs.last() else {
        return Ok(None);
    };
    let commit_label = if jobs.len() == 1 {
        last.commit_label.clone()
    } else {
        CommitLabel::new(format!(
            "{} (+{} more)",
            last.commit_label.as_str(),
            jobs.len() - 1
        ))?
    };
    Ok(Some(MirrorSyncBatch {
        worker_id: worker_id.to_string(),
        csv_bytes: store.registration_csv_bytes()?,
        jobs,
        commit_label,
    }))
}

/// Acks, reschedules or dead-letters the batch. Runs under the store lock.
pub fn settle_mirror_sync_batch(
    store: &mut SignupStore,
    now: MonotonicTimeNs,
    batch: &MirrorSyncBatch,
    result: Result<MirrorSyncSendReceipt, MirrorPushError>,
    max_attempts: u16,
) -> Result<MirrorSyncWorkerPassMetrics, StorageError> {
    let max_attempts = max_attempts.max(1);
    let worker = Some(batch.worker_id.as_str());
    let mut metrics = MirrorSyncWorkerPassMetrics {
        dequeued_count: batch.jobs.len() as u16,
        ..MirrorSyncWorkerPassMetrics::default()
    };
    match result {
        Ok(receipt) => {
            for job in &batch.jobs {
                if settle_step(store.mirror_outbox_ack_commit_row(now, &job.sync_job_id, worker))? {
                    metrics.acked_count = metrics.acked_count.saturating_add(1);
                }
            }
            info!(
                jobs = metrics.acked_count,
                remote_ack_ref = receipt.remote_ack_ref.as_deref().unwrap_or("-"),
                "mirror push acknowledged"
            );
        }
        Err(err) => {
            let message = err.to_string();
            for job in &batch.jobs {
                if err.is_permanent() || job.attempt_count >= max_attempts {
                    if settle_step(store.mirror_outbox_dead_letter_commit_row(
                        now,
                        &job.sync_job_id,
                        worker,
                        message.clone(),
                    ))? {
                        metrics.dead_lettered_count = metrics.dead_lettered_count.saturating_add(1);
                    }
                } else if settle_step(store.mirror_outbox_fail_commit_row(
                    now,
                    &job.sync_job_id,
                    worker,
                    message.clone(),
                    err.retry_after_ms(),
                ))? {
                    metrics.retry_scheduled_count = metrics.retry_scheduled_count.saturating_add(1);
                }
            }
            warn!(
                error = %message,
                retry = metrics.retry_scheduled_count,
                dead_lettered = metrics.dead_lettered_count,
                "mirror push failed"
            );
        }
    }
    metrics.queue_after = snapshot_queue_metrics(store, now);
    Ok(metrics)
}

/// A job whose lease was lost to another worker is skipped; other storage
/// errors abort the pass.
fn settle_step(result: Result<(), StorageError>) -> Result<bool, StorageError> {
    match result {
        Ok(()) => Ok(true),
        Err(err @ (StorageError::LeaseMismatch { .. } | StorageError::InvalidTransition { .. })) => {
            warn!(error = %err, "mirror job lease lost before settle");
            Ok(false)
        }
        Err(err) => Err(err),
    }
}

/// Puts every dead-lettered job back on the queue with a fresh attempt budget.
pub fn requeue_dead_letter_jobs(store: &mut SignupStore) -> Result<usize, StorageError> {
    let moved = store.mirror_outbox_requeue_dead_letters_row()?;
    if moved > 0 {
        info!(jobs = moved, "dead-lettered mirror jobs requeued");
    }
    Ok(moved)
}

pub fn snapshot_queue_metrics(store: &SignupStore, now: MonotonicTimeNs) -> MirrorSyncQueueMetrics {
    let mut out = MirrorSyncQueueMetrics::default();
    for row in store.mirror_outbox_rows() {
        match row.state {
            MirrorSyncState::Queued => out.queued_count = out.queued_count.saturating_add(1),
            MirrorSyncState::InFlight => {
                out.in_flight_count = out.in_flight_count.saturating_add(1)
            }
            MirrorSyncState::Acked => out.acked_count = out.acked_count.saturating_add(1),
            MirrorSyncState::DeadLetter => {
                out.dead_letter_count = out.dead_letter_count.saturating_add(1)
            }
        }
    }
    out.replay_due_count = store.mirror_outbox_replay_due_rows(now).len() as u32;
    out
}

pub fn mirror_sync_max_attempts_from_env() -> u16 {
    env::var("SIGNUP_MIRROR_MAX_ATTEMPTS")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .filter(|v| (1..=100).contains(v))
        .unwrap_or(MIRROR_SYNC_MAX_ATTEMPTS_DEFAULT)
}
