#![forbid(unsafe_code)]

use std::path::Path;

use signup_contracts::MonotonicTimeNs;
use signup_engines::password::validate_admin_password;
use signup_os::gate::{bootstrap_admin_password_from_env, GateConfigRuntime};
use signup_os::mirror_sync::{requeue_dead_letter_jobs, snapshot_queue_metrics};
use signup_storage::gate_config::GateConfigFile;
use signup_storage::repo::RegistrationRepo;
use signup_storage::{SignupStore, StorePaths};

pub const ADMIN_USAGE: &str =
    "usage: signup admin <set-password|set-limit|requeue-mirror> [limit]";

/// Offline admin edits. Gate changes reach a running HTTP adapter after an
/// admin config reload or a restart. `requeue-mirror` rewrites the outbox file
/// and must run while the adapter is stopped; a running adapter takes
/// `POST /v1/admin/mirror/requeue` instead.
pub fn execute_admin_command(
    paths: &StorePaths,
    subcommand: &str,
    value: Option<&str>,
) -> Result<String, String> {
    if subcommand == "requeue-mirror" {
        ensure_parent_dir(&paths.mirror_outbox)?;
        let mut store =
            SignupStore::open(paths).map_err(|e| format!("failed to open store: {e}"))?;
        let moved = requeue_dead_letter_jobs(&mut store)
            .map_err(|e| format!("failed to requeue mirror jobs: {e}"))?;
        return Ok(format!("requeued={moved}"));
    }
    let mut gate = open_gate(paths)?;
    let limit = u32::from(gate.capacity_limit().get());
    match subcommand {
        "set-password" => {
            let password = value.ok_or_else(|| "missing new password".to_string())?;
            if password.trim().is_empty() {
                return Err("new password must not be blank".to_string());
            }
            validate_admin_password(password).map_err(|e| e.to_string())?;
            gate.update_settings(limit, Some(password))
                .map_err(|e| format!("failed to update password: {e}"))?;
            Ok("OK".to_string())
        }
        "set-limit" => {
            let raw = value.ok_or_else(|| ADMIN_USAGE.to_string())?;
            let next = raw
                .trim()
                .parse::<u32>()
                .map_err(|_| format!("limit must be a number, got '{raw}'"))?;
            gate.update_settings(next, None)
                .map_err(|e| format!("failed to update limit: {e}"))?;
            Ok(format!("limit={next}"))
        }
        _ => Err(format!(
            "unknown admin subcommand: {subcommand}. expected one of: set-password, set-limit, requeue-mirror"
        )),
    }
}

pub fn execute_status_command(paths: &StorePaths, now: MonotonicTimeNs) -> Result<String, String> {
    let gate = open_gate(paths)?;
    let store = SignupStore::open(paths).map_err(|e| format!("failed to open store: {e}"))?;
    let capacity = gate.capacity(store.registration_count());
    let queue = snapshot_queue_metrics(&store, now);
    Ok(format!(
        "registrations={} limit={} remaining={} full={}\nmirror queued={} in_flight={} acked={} dead_letter={}",
        capacity.count,
        capacity.limit,
        capacity.remaining,
        capacity.is_full,
        queue.queued_count,
        queue.in_flight_count,
        queue.acked_count,
        queue.dead_letter_count,
    ))
}

fn open_gate(paths: &StorePaths) -> Result<GateConfigRuntime, String> {
    ensure_parent_dir(&paths.gate_config)?;
    GateConfigRuntime::load_or_init(
        GateConfigFile::new(paths.gate_config.clone()),
        bootstrap_admin_password_from_env,
    )
    .map_err(|e| format!("failed to load gate config: {e}"))
}

fn ensure_parent_dir(path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("failed to create '{}': {e}", parent.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use signup_contracts::mirror::{CommitLabel, MirrorSyncKind};
    use signup_storage::repo::MirrorOutboxRepo;
    use std::fs;

    fn paths_in(dir: &tempfile::TempDir) -> StorePaths {
        StorePaths::in_dir(dir.path().join("data"))
    }

    fn seed(paths: &StorePaths, password: &str) {
        fs::create_dir_all(paths.gate_config.parent().unwrap()).unwrap();
        GateConfigRuntime::load_or_init(GateConfigFile::new(paths.gate_config.clone()), || {
            password.to_string()
        })
        .unwrap();
    }

    fn verifies(gate: &GateConfigRuntime, candidate: &str) -> bool {
        signup_engines::password::verify_password(candidate, &gate.admin_password_hash())
    }

    fn reopen(paths: &StorePaths) -> GateConfigRuntime {
        GateConfigRuntime::load_or_init(GateConfigFile::new(paths.gate_config.clone()), || {
            unreachable!("config already exists")
        })
        .unwrap()
    }

    #[test]
    fn at_admin_cli_01_set_password_keeps_limit() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(&dir);
        seed(&paths, "old-pass");
        execute_admin_command(&paths, "set-limit", Some("8")).unwrap();
        assert_eq!(
            execute_admin_command(&paths, "set-password", Some("new-pass")).unwrap(),
            "OK"
        );
        let gate = reopen(&paths);
        assert_eq!(gate.capacity_limit().get(), 8);
        assert!(verifies(&gate, "new-pass"));
        assert!(!verifies(&gate, "old-pass"));
    }

    #[test]
    fn at_admin_cli_02_invalid_input_leaves_config_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(&dir);
        seed(&paths, "pw");
        let before = fs::read(&paths.gate_config).unwrap();
        assert!(execute_admin_command(&paths, "set-limit", Some("1000")).is_err());
        assert!(execute_admin_command(&paths, "set-limit", Some("many")).is_err());
        assert!(execute_admin_command(&paths, "set-password", Some("a\nb")).is_err());
        assert!(execute_admin_command(&paths, "set-password", None).is_err());
        assert!(execute_admin_command(&paths, "set-password", Some("   ")).is_err());
        assert!(execute_admin_command(&paths, "set-password", Some(" padded ")).is_err());
        assert!(execute_admin_command(&paths, "set-password", Some("密碼")).is_err());
        assert!(execute_admin_command(&paths, "wipe", None).is_err());
        assert_eq!(fs::read(&paths.gate_config).unwrap(), before);
    }

    #[test]
    fn at_admin_cli_03_status_reports_capacity_and_queue() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(&dir);
        seed(&paths, "pw");
        let out = execute_status_command(&paths, MonotonicTimeNs(1)).unwrap();
        assert!(out.starts_with("registrations=0 limit=5 remaining=5 full=false"));
        assert!(out.contains("mirror queued=0"));
    }

    #[test]
    fn at_admin_cli_04_requeue_mirror_moves_dead_letters_back() {
        let dir = tempfile::tempdir().unwrap();
        let paths = paths_in(&dir);
        seed(&paths, "pw");
        {
            let mut store = SignupStore::open(&paths).unwrap();
            let job = store
                .mirror_outbox_enqueue_row(
                    MonotonicTimeNs(1),
                    MirrorSyncKind::StoreCleared,
                    None,
                    CommitLabel::new("clear").unwrap(),
                )
                .unwrap();
            store
                .mirror_outbox_dequeue_batch_row(MonotonicTimeNs(2), 1, 1_000, "w".to_string())
                .unwrap();
            store
                .mirror_outbox_dead_letter_commit_row(
                    MonotonicTimeNs(3),
                    &job,
                    Some("w"),
                    "unauthorized (http 401)".to_string(),
                )
                .unwrap();
        }
        assert_eq!(
            execute_admin_command(&paths, "requeue-mirror", None).unwrap(),
            "requeued=1"
        );
        let out = execute_status_command(&paths, MonotonicTimeNs(4)).unwrap();
        assert!(out.contains("mirror queued=1 in_flight=0 acked=0 dead_letter=0"));
        assert_eq!(
            execute_admin_command(&paths, "requeue-mirror", None).unwrap(),
            "requeued=0"
        );
    }
}
