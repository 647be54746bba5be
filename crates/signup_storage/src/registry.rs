#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::path::PathBuf;

use signup_contracts::registration::{RegistrationRecord, REGISTRATION_COLUMNS};
use signup_contracts::Validate;
use tracing::info;

use crate::fsutil::{atomic_write, read_optional};
use crate::store::StorageError;

const TABLE: &str = "registrations";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Registration rows in submission order, mirrored to a CSV file.
///
/// Every mutation rewrites the whole file through a temp file and rename, and
/// the in-memory rows only change once that write succeeded.
#[derive(Debug)]
pub struct RegistrationTable {
    path: Option<PathBuf>,
    rows: Vec<RegistrationRecord>,
}

impl RegistrationTable {
    pub fn new_in_memory() -> Self {
        Self {
            path: None,
            rows: Vec::new(),
        }
    }

    /// Opens the CSV at `path`, creating it with the canonical header if absent.
    pub fn open(path: PathBuf) -> Result<Self, StorageError> {
        let mut table = Self {
            path: Some(path),
            rows: Vec::new(),
        };
        let created = table.load_from_disk()?;
        if created {
            table.persist(&[])?;
        }
        Ok(table)
    }

    /// Re-reads the backing file. An absent file yields an empty table.
    pub fn load(&mut self) -> Result<&[RegistrationRecord], StorageError> {
        self.load_from_disk()?;
        Ok(&self.rows)
    }

    fn load_from_disk(&mut self) -> Result<bool, StorageError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(false);
        };
        match read_optional(path)? {
            Some(bytes) => {
                self.rows = decode_registration_csv(&bytes)?;
                Ok(false)
            }
            None => {
                self.rows.clear();
                Ok(true)
            }
        }
    }

    pub fn rows(&self) -> &[RegistrationRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn serials(&self) -> BTreeSet<&str> {
        self.rows.iter().map(|r| r.serial.as_str()).collect()
    }

    /// Exact, case-sensitive match on the email column.
    pub fn find_by_email(&self, email: &str) -> Vec<&RegistrationRecord> {
        self.rows.iter().filter(|r| r.email == email).collect()
    }

    pub fn append_row(
        &mut self,
        record: RegistrationRecord,
    ) -> Result<&RegistrationRecord, StorageError> {
        record.validate()?;
        if self.rows.iter().any(|r| r.serial == record.serial) {
            return Err(StorageError::DuplicateKey {
                table: TABLE,
                key: record.serial,
            });
        }
        let mut next = Vec::with_capacity(self.rows.len() + 1);
        next.extend_from_slice(&self.rows);
        next.push(record);
        self.persist(&next)?;
        self.rows = next;
        let last = self.rows.len() - 1;
        Ok(&self.rows[last])
    }

    /// Replaces the store with an empty dataset under the canonical header.
    pub fn clear(&mut self) -> Result<usize, StorageError> {
        let removed = self.rows.len();
        self.persist(&[])?;
        self.rows.clear();
        info!(removed, "registration table cleared");
        Ok(removed)
    }

    pub fn to_csv_bytes(&self) -> Result<Vec<u8>, StorageError> {
        encode_registration_csv(&self.rows)
    }

    fn persist(&self, rows: &[RegistrationRecord]) -> Result<(), StorageError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let bytes = encode_registration_csv(rows)?;
        atomic_write(path, &bytes)
    }
}

pub fn encode_registration_csv(rows: &[RegistrationRecord]) -> Result<Vec<u8>, StorageError> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(REGISTRATION_COLUMNS)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer
        .into_inner()
        .map_err(|err| StorageError::Csv(csv::Error::from(err.into_error())))
}

pub fn decode_registration_csv(bytes: &[u8]) -> Result<Vec<RegistrationRecord>, StorageError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for record in reader.deserialize::<RegistrationRecord>() {
        rows.push(record?);
    }
    Ok(rows)
}
