#![forbid(unsafe_code)]

use signup_contracts::mirror::{CommitLabel, MirrorSyncKind, MirrorSyncState};
use signup_contracts::MonotonicTimeNs;
use signup_storage::repo::MirrorOutboxRepo;
use signup_storage::{SignupStore, StorePaths};

fn label(text: &str) -> CommitLabel {
    CommitLabel::new(text).unwrap()
}

#[test]
fn at_outbox_db_01_dequeue_fail_replay_ack_lifecycle() {
    let mut s = SignupStore::new_in_memory();
    let job = s
        .mirror_outbox_enqueue_row(
            MonotonicTimeNs(10),
            MirrorSyncKind::RegistrationAppended,
            Some("001".to_string()),
            label("新增報名 001"),
        )
        .unwrap();

    let dequeued = s
        .mirror_outbox_dequeue_batch_row(MonotonicTimeNs(11), 4, 1_000, "worker_1".to_string())
        .unwrap();
    assert_eq!(dequeued.len(), 1);
    assert_eq!(dequeued[0].sync_job_id, job);
    assert_eq!(dequeued[0].state, MirrorSyncState::InFlight);
    assert_eq!(dequeued[0].attempt_count, 1);

    // leased rows are not handed out twice while the lease holds
    assert!(s
        .mirror_outbox_dequeue_batch_row(MonotonicTimeNs(12), 4, 1_000, "worker_2".to_string())
        .unwrap()
        .is_empty());

    s.mirror_outbox_fail_commit_row(
        MonotonicTimeNs(13),
        &job,
        Some("worker_1"),
        "http status 502".to_string(),
        5_000,
    )
    .unwrap();
    assert!(s.mirror_outbox_replay_due_rows(MonotonicTimeNs(14)).is_empty());
    let due_at = MonotonicTimeNs(13).saturating_add_ms(5_000);
    assert_eq!(s.mirror_outbox_replay_due_rows(due_at).len(), 1);

    let replay = s
        .mirror_outbox_dequeue_batch_row(due_at, 4, 1_000, "worker_2".to_string())
        .unwrap();
    assert_eq!(replay.len(), 1);
    assert_eq!(replay[0].attempt_count, 2);
    assert_eq!(replay[0].last_error.as_deref(), Some("http status 502"));

    s.mirror_outbox_ack_commit_row(due_at, &job, Some("worker_2"))
        .unwrap();
    let row = &s.mirror_outbox_rows()[0];
    assert_eq!(row.state, MirrorSyncState::Acked);
    assert_eq!(row.acked_at, Some(due_at));
}

#[test]
fn at_outbox_db_02_expired_lease_is_replayed_without_explicit_fail() {
    let mut s = SignupStore::new_in_memory();
    s.mirror_outbox_enqueue_row(
        MonotonicTimeNs(1),
        MirrorSyncKind::StoreCleared,
        None,
        label("clear all"),
    )
    .unwrap();
    s.mirror_outbox_dequeue_batch_row(MonotonicTimeNs(2), 1, 1_000, "crashed".to_string())
        .unwrap();
    let later = MonotonicTimeNs(2).saturating_add_ms(1_000);
    let replay = s
        .mirror_outbox_dequeue_batch_row(later, 1, 1_000, "worker_2".to_string())
        .unwrap();
    assert_eq!(replay.len(), 1);
    assert_eq!(replay[0].lease_owner.as_deref(), Some("worker_2"));
}

#[test]
fn at_outbox_db_03_dead_letter_then_requeue() {
    let mut s = SignupStore::new_in_memory();
    let job = s
        .mirror_outbox_enqueue_row(
            MonotonicTimeNs(1),
            MirrorSyncKind::RegistrationAppended,
            Some("R12345".to_string()),
            label("add R12345"),
        )
        .unwrap();
    s.mirror_outbox_dequeue_batch_row(MonotonicTimeNs(2), 1, 1_000, "w".to_string())
        .unwrap();
    s.mirror_outbox_dead_letter_commit_row(
        MonotonicTimeNs(3),
        &job,
        Some("w"),
        "unauthorized".to_string(),
    )
    .unwrap();
    assert_eq!(s.mirror_outbox_dead_letter_rows().len(), 1);
    assert!(s
        .mirror_outbox_dequeue_batch_row(MonotonicTimeNs(4), 1, 1_000, "w".to_string())
        .unwrap()
        .is_empty());

    assert_eq!(s.mirror_outbox_requeue_dead_letters_row().unwrap(), 1);
    let again = s
        .mirror_outbox_dequeue_batch_row(MonotonicTimeNs(5), 1, 1_000, "w".to_string())
        .unwrap();
    assert_eq!(again[0].attempt_count, 1);
}

#[test]
fn at_outbox_db_04_queue_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    let job = {
        let mut s = SignupStore::open(&paths).unwrap();
        let job = s
            .mirror_outbox_enqueue_row(
                MonotonicTimeNs(1),
                MirrorSyncKind::RegistrationAppended,
                Some("001".to_string()),
                label("add 001"),
            )
            .unwrap();
        s.mirror_outbox_dequeue_batch_row(MonotonicTimeNs(2), 1, 1_000, "w".to_string())
            .unwrap();
        job
    };
    let mut s = SignupStore::open(&paths).unwrap();
    let row = &s.mirror_outbox_rows()[0];
    assert_eq!(row.sync_job_id, job);
    assert_eq!(row.state, MirrorSyncState::InFlight);
    assert_eq!(row.commit_label.as_str(), "add 001");

    let next = s
        .mirror_outbox_enqueue_row(
            MonotonicTimeNs(3),
            MirrorSyncKind::RegistrationAppended,
            Some("002".to_string()),
            label("add 002"),
        )
        .unwrap();
    assert_ne!(next, job);
}
