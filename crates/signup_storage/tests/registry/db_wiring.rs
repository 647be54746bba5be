#![forbid(unsafe_code)]

use std::fs;

use signup_contracts::registration::RegistrationRecord;
use signup_storage::repo::RegistrationRepo;
use signup_storage::{SignupStore, StorageError, StorePaths};

fn record(name: &str, email: &str, serial: &str) -> RegistrationRecord {
    RegistrationRecord {
        name: name.to_string(),
        email: email.to_string(),
        phone: "0912345678".to_string(),
        serial: serial.to_string(),
        registered_at: "2025-03-01 10:00:00".to_string(),
    }
}

#[test]
fn at_registry_db_01_open_creates_file_with_canonical_header() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    let store = SignupStore::open(&paths).unwrap();
    assert_eq!(store.registration_count(), 0);
    let raw = fs::read_to_string(&paths.registrations).unwrap();
    assert_eq!(raw, "姓名,Email,電話,報名序號,報名時間\n");
}

#[test]
fn at_registry_db_02_rows_survive_reopen_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    {
        let mut store = SignupStore::open(&paths).unwrap();
        store
            .append_registration_row(record("Tom", "tom@x.com", "001"))
            .unwrap();
        store
            .append_registration_row(record("王小明", "ming@x.com", "002"))
            .unwrap();
    }
    let store = SignupStore::open(&paths).unwrap();
    let serials: Vec<&str> = store
        .registration_rows()
        .iter()
        .map(|r| r.serial.as_str())
        .collect();
    assert_eq!(serials, vec!["001", "002"]);
    assert_eq!(store.registration_rows()[1].name, "王小明");
}

#[test]
fn at_registry_db_03_clear_then_load_is_empty_with_schema_intact() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    let mut store = SignupStore::open(&paths).unwrap();
    store
        .append_registration_row(record("Tom", "tom@x.com", "001"))
        .unwrap();
    assert_eq!(store.clear_registration_rows().unwrap(), 1);
    assert_eq!(store.reload_registration_rows().unwrap(), 0);
    let raw = fs::read_to_string(&paths.registrations).unwrap();
    assert_eq!(raw, "姓名,Email,電話,報名序號,報名時間\n");
}

#[test]
fn at_registry_db_04_reload_picks_up_external_edits() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    let mut store = SignupStore::open(&paths).unwrap();
    fs::write(
        &paths.registrations,
        "姓名,Email,電話,序號\nAmy,amy@x.com,555,001\nBen,ben@x.com,,002\n",
    )
    .unwrap();
    assert_eq!(store.reload_registration_rows().unwrap(), 2);
    assert_eq!(store.registration_rows_by_email("ben@x.com").len(), 1);
}

#[test]
fn at_registry_db_05_invalid_row_is_rejected_without_touching_file() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    let mut store = SignupStore::open(&paths).unwrap();
    let before = fs::read(&paths.registrations).unwrap();
    let err = store
        .append_registration_row(record("", "tom@x.com", "001"))
        .unwrap_err();
    assert!(matches!(err, StorageError::ContractViolation(_)));
    assert_eq!(fs::read(&paths.registrations).unwrap(), before);
    assert_eq!(store.registration_count(), 0);
}

#[test]
fn at_registry_db_06_no_temp_file_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    let mut store = SignupStore::open(&paths).unwrap();
    store
        .append_registration_row(record("Tom", "tom@x.com", "001"))
        .unwrap();
    let leftovers: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn at_registry_db_07_csv_bytes_match_file_contents() {
    let dir = tempfile::tempdir().unwrap();
    let paths = StorePaths::in_dir(dir.path());
    let mut store = SignupStore::open(&paths).unwrap();
    store
        .append_registration_row(record("Tom", "tom@x.com", "001"))
        .unwrap();
    assert_eq!(
        store.registration_csv_bytes().unwrap(),
        fs::read(&paths.registrations).unwrap()
    );
}
