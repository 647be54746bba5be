#![forbid(unsafe_code)]

use signup_contracts::mirror::{CommitLabel, MirrorSyncKind};
use signup_contracts::registration::RegistrationRecord;
use signup_contracts::MonotonicTimeNs;

use crate::mirror_outbox::MirrorSyncQueueRecord;
use crate::store::{SignupStore, StorageError};

/// Typed repository interface for the registration table.
pub trait RegistrationRepo {
    fn registration_rows(&self) -> &[RegistrationRecord];
    fn registration_count(&self) -> usize;
    fn reload_registration_rows(&mut self) -> Result<usize, StorageError>;
    fn append_registration_row(
        &mut self,
        record: RegistrationRecord,
    ) -> Result<RegistrationRecord, StorageError>;
    fn clear_registration_rows(&mut self) -> Result<usize, StorageError>;
    fn registration_rows_by_email(&self, email: &str) -> Vec<&RegistrationRecord>;
    fn registration_csv_bytes(&self) -> Result<Vec<u8>, StorageError>;
}

/// Typed repository interface for the mirror outbox lifecycle.
pub trait MirrorOutboxRepo {
    fn mirror_outbox_rows(&self) -> &[MirrorSyncQueueRecord];

    fn mirror_outbox_enqueue_row(
        &mut self,
        now: MonotonicTimeNs,
        sync_kind: MirrorSyncKind,
        record_key: Option<String>,
        commit_label: CommitLabel,
    ) -> Result<String, StorageError>;

    fn mirror_outbox_dequeue_batch_row(
        &mut self,
        now: MonotonicTimeNs,
        max_items: u16,
        lease_duration_ms: u32,
        worker_id: String,
    ) -> Result<Vec<MirrorSyncQueueRecord>, StorageError>;

    fn mirror_outbox_ack_commit_row(
        &mut self,
        now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
    ) -> Result<(), StorageError>;

    fn mirror_outbox_fail_commit_row(
        &mut self,
        now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
        last_error: String,
        retry_after_ms: u32,
    ) -> Result<(), StorageError>;

    fn mirror_outbox_dead_letter_commit_row(
        &mut self,
        now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
        last_error: String,
    ) -> Result<(), StorageError>;

    fn mirror_outbox_replay_due_rows(&self, now: MonotonicTimeNs) -> Vec<&MirrorSyncQueueRecord>;

    fn mirror_outbox_dead_letter_rows(&self) -> Vec<&MirrorSyncQueueRecord>;

    fn mirror_outbox_requeue_dead_letters_row(&mut self) -> Result<usize, StorageError>;
}

impl RegistrationRepo for SignupStore {
    fn registration_rows(&self) -> &[RegistrationRecord] {
        self.registrations().rows()
    }

    fn registration_count(&self) -> usize {
        self.registrations().len()
    }

    fn reload_registration_rows(&mut self) -> Result<usize, StorageError> {
        Ok(self.registrations_mut().load()?.len())
    }

    fn append_registration_row(
        &mut self,
        record: RegistrationRecord,
    ) -> Result<RegistrationRecord, StorageError> {
        self.registrations_mut().append_row(record).cloned()
    }

    fn clear_registration_rows(&mut self) -> Result<usize, StorageError> {
        self.registrations_mut().clear()
    }

    fn registration_rows_by_email(&self, email: &str) -> Vec<&RegistrationRecord> {
        self.registrations().find_by_email(email)
    }

    fn registration_csv_bytes(&self) -> Result<Vec<u8>, StorageError> {
        self.registrations().to_csv_bytes()
    }
}

impl MirrorOutboxRepo for SignupStore {
    fn mirror_outbox_rows(&self) -> &[MirrorSyncQueueRecord] {
        self.outbox().queue_rows()
    }

    fn mirror_outbox_enqueue_row(
        &mut self,
        now: MonotonicTimeNs,
        sync_kind: MirrorSyncKind,
        record_key: Option<String>,
        commit_label: CommitLabel,
    ) -> Result<String, StorageError> {
        self.outbox_mut()
            .enqueue(now, sync_kind, record_key, commit_label)
    }

    fn mirror_outbox_dequeue_batch_row(
        &mut self,
        now: MonotonicTimeNs,
        max_items: u16,
        lease_duration_ms: u32,
        worker_id: String,
    ) -> Result<Vec<MirrorSyncQueueRecord>, StorageError> {
        self.outbox_mut()
            .dequeue_batch(now, max_items, lease_duration_ms, worker_id)
    }

    fn mirror_outbox_ack_commit_row(
        &mut self,
        now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
    ) -> Result<(), StorageError> {
        self.outbox_mut().ack_commit(now, sync_job_id, worker_id)
    }

    fn mirror_outbox_fail_commit_row(
        &mut self,
        now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
        last_error: String,
        retry_after_ms: u32,
    ) -> Result<(), StorageError> {
        self.outbox_mut()
            .fail_commit(now, sync_job_id, worker_id, last_error, retry_after_ms)
    }

    fn mirror_outbox_dead_letter_commit_row(
        &mut self,
        now: MonotonicTimeNs,
        sync_job_id: &str,
        worker_id: Option<&str>,
        last_error: String,
    ) -> Result<(), StorageError> {
        self.outbox_mut()
            .dead_letter_commit(now, sync_job_id, worker_id, last_error)
    }

    fn mirror_outbox_replay_due_rows(&self, now: MonotonicTimeNs) -> Vec<&MirrorSyncQueueRecord> {
        self.outbox().replay_due_rows(now)
    }

    fn mirror_outbox_dead_letter_rows(&self) -> Vec<&MirrorSyncQueueRecord> {
        self.outbox().dead_letter_rows()
    }

    fn mirror_outbox_requeue_dead_letters_row(&mut self) -> Result<usize, StorageError> {
        self.outbox_mut().requeue_dead_letters()
    }
}
