#![forbid(unsafe_code)]

use std::fs;

use signup_contracts::gate::{CapacityLimit, PasswordHash, StoredAdminSecret, StoredGateConfig};
use signup_storage::gate_config::GateConfigFile;
use signup_storage::{StorageError, StorePaths};

#[test]
fn at_gate_config_db_01_missing_file_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let file = GateConfigFile::new(StorePaths::in_dir(dir.path()).gate_config);
    assert!(file.load().unwrap().is_none());
}

#[test]
fn at_gate_config_db_02_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let file = GateConfigFile::new(StorePaths::in_dir(dir.path()).gate_config);
    let cfg = StoredGateConfig {
        capacity_limit: CapacityLimit::new(42).unwrap(),
        admin_secret: StoredAdminSecret::Hashed(
            PasswordHash::v1(8, "c2FsdHNhbHQ=", "ZGlnZXN0ZGlnZXN0").unwrap(),
        ),
    };
    file.save(&cfg).unwrap();
    assert_eq!(file.load().unwrap(), Some(cfg));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[test]
fn at_gate_config_db_03_legacy_file_written_by_older_deployments() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    fs::write(&paths.gate_config, "limit=5\npassword=123456").unwrap();
    let cfg = GateConfigFile::new(paths.gate_config).load().unwrap().unwrap();
    assert_eq!(cfg.capacity_limit.get(), 5);
    assert_eq!(
        cfg.admin_secret,
        StoredAdminSecret::LegacyPlaintext("123456".to_string())
    );
}

#[test]
fn at_gate_config_db_04_non_utf8_file_is_malformed() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    fs::write(&paths.gate_config, [0xff, 0xfe, b'=', b'1']).unwrap();
    let err = GateConfigFile::new(paths.gate_config).load().unwrap_err();
    assert!(matches!(err, StorageError::MalformedConfig { .. }));
}
