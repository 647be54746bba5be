#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use signup_contracts::ContractViolation;
use thiserror::Error;

use crate::mirror_outbox::MirrorOutbox;
use crate::registry::RegistrationTable;

pub const REGISTRATIONS_FILE_NAME: &str = "signup_data.csv";
pub const GATE_CONFIG_FILE_NAME: &str = "config.txt";
pub const MIRROR_OUTBOX_FILE_NAME: &str = "mirror_outbox.json";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("duplicate key in {table}: {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("unknown key in {table}: {key}")]
    NotFound { table: &'static str, key: String },
    #[error("{table} row {key} is leased by another worker")]
    LeaseMismatch { table: &'static str, key: String },
    #[error("{table} row {key} cannot move from {from}")]
    InvalidTransition {
        table: &'static str,
        key: String,
        from: &'static str,
    },
    #[error("malformed config at line {line}: {reason}")]
    MalformedConfig { line: usize, reason: String },
    #[error("unsupported {table} schema_version={found}")]
    UnsupportedSchema { table: &'static str, found: u8 },
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ContractViolation),
}

pub const DATA_DIR_ENV: &str = "SIGNUP_DATA_DIR";

/// `SIGNUP_DATA_DIR`, else `$HOME/.signup`, else `./.signup`.
pub fn data_dir_from_env() -> PathBuf {
    let non_blank = |key: &str| {
        std::env::var(key)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    if let Some(dir) = non_blank(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    match non_blank("HOME") {
        Some(home) => PathBuf::from(home).join(".signup"),
        None => PathBuf::from(".signup"),
    }
}

/// File layout of one signup deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    pub registrations: PathBuf,
    pub gate_config: PathBuf,
    pub mirror_outbox: PathBuf,
}

impl StorePaths {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            registrations: dir.join(REGISTRATIONS_FILE_NAME),
            gate_config: dir.join(GATE_CONFIG_FILE_NAME),
            mirror_outbox: dir.join(MIRROR_OUTBOX_FILE_NAME),
        }
    }
}

/// The registration table plus the mirror outbox that tracks its remote copy.
///
/// Callers serialize access to one `SignupStore` (the adapter keeps it behind a
/// single mutex), so capacity checks, serial assignment and the append happen
/// as one step.
#[derive(Debug)]
pub struct SignupStore {
    registrations: RegistrationTable,
    outbox: MirrorOutbox,
}

impl SignupStore {
    pub fn new_in_memory() -> Self {
        Self {
            registrations: RegistrationTable::new_in_memory(),
            outbox: MirrorOutbox::new_in_memory(),
        }
    }

    pub fn open(paths: &StorePaths) -> Result<Self, StorageError> {
        Ok(Self {
            registrations: RegistrationTable::open(paths.registrations.clone())?,
            outbox: MirrorOutbox::open(paths.mirror_outbox.clone())?,
        })
    }

    pub fn registrations(&self) -> &RegistrationTable {
        &self.registrations
    }

    pub fn registrations_mut(&mut self) -> &mut RegistrationTable {
        &mut self.registrations
    }

    pub fn outbox(&self) -> &MirrorOutbox {
        &self.outbox
    }

    pub fn outbox_mut(&mut self) -> &mut MirrorOutbox {
        &mut self.outbox
    }
}
