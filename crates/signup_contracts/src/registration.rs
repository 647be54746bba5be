#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::common::require_text;
use crate::{ContractViolation, Validate};

/// Canonical header row of the registration CSV, in column order.
pub const REGISTRATION_COLUMNS: [&str; 5] = ["姓名", "Email", "電話", "報名序號", "報名時間"];

pub const NAME_MAX_CHARS: usize = 100;
pub const EMAIL_MAX_CHARS: usize = 254;
pub const PHONE_MAX_CHARS: usize = 32;

pub const SEQUENTIAL_SERIAL_WIDTH: usize = 3;
pub const RANDOM_SERIAL_PREFIX: &str = "R";
pub const RANDOM_SERIAL_MIN: u32 = 10_000;
pub const RANDOM_SERIAL_MAX: u32 = 99_999;

/// `YYYY-MM-DD HH:MM:SS`, local time.
pub const REGISTERED_AT_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SerialScheme {
    #[default]
    Sequential,
    Random,
}

impl SerialScheme {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Random => "random",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sequential" | "seq" => Some(Self::Sequential),
            "random" | "rand" => Some(Self::Random),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Serial(String);

impl Serial {
    /// `ordinal` is the 1-based position of the new row (`count + 1`).
    pub fn sequential(ordinal: u32) -> Result<Self, ContractViolation> {
        if ordinal == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "serial",
                reason: "sequential ordinal must be >= 1",
            });
        }
        Ok(Self(format!(
            "{:0width$}",
            ordinal,
            width = SEQUENTIAL_SERIAL_WIDTH
        )))
    }

    pub fn random(token: u32) -> Result<Self, ContractViolation> {
        if !(RANDOM_SERIAL_MIN..=RANDOM_SERIAL_MAX).contains(&token) {
            return Err(ContractViolation::InvalidRange {
                field: "serial",
                min: RANDOM_SERIAL_MIN as u64,
                max: RANDOM_SERIAL_MAX as u64,
                got: token as u64,
            });
        }
        Ok(Self(format!("{RANDOM_SERIAL_PREFIX}{token}")))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl std::fmt::Display for Serial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated form submission, before serial and timestamp assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationDraft {
    pub name: String,
    pub email: String,
    pub phone: String,
}

impl RegistrationDraft {
    pub fn v1(
        name: impl Into<String>,
        email: impl Into<String>,
        phone: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let draft = Self {
            name: name.into().trim().to_string(),
            email: email.into().trim().to_string(),
            phone: phone.into().trim().to_string(),
        };
        draft.validate()?;
        Ok(draft)
    }
}

impl Validate for RegistrationDraft {
    fn validate(&self) -> Result<(), ContractViolation> {
        require_text("name", &self.name, NAME_MAX_CHARS)?;
        require_text("email", &self.email, EMAIL_MAX_CHARS)?;
        require_text("phone", &self.phone, PHONE_MAX_CHARS)?;
        Ok(())
    }
}

/// One row of the registration store.
///
/// Serde names match the CSV header so the store can be read and written
/// with header-keyed records. Older stores used `序號` for the serial column
/// and had no timestamp column; both still load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRecord {
    #[serde(rename = "姓名")]
    pub name: String,
    #[serde(rename = "Email")]
    pub email: String,
    #[serde(rename = "電話", default)]
    pub phone: String,
    #[serde(rename = "報名序號", alias = "序號")]
    pub serial: String,
    #[serde(rename = "報名時間", default)]
    pub registered_at: String,
}

impl RegistrationRecord {
    pub fn v1(draft: RegistrationDraft, serial: Serial, registered_at: String) -> Self {
        Self {
            name: draft.name,
            email: draft.email,
            phone: draft.phone,
            serial: serial.into_string(),
            registered_at,
        }
    }
}

impl Validate for RegistrationRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        require_text("name", &self.name, NAME_MAX_CHARS)?;
        require_text("email", &self.email, EMAIL_MAX_CHARS)?;
        if self.serial.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "serial",
                reason: "must not be empty",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_registration_01_sequential_serial_is_zero_padded() {
        assert_eq!(Serial::sequential(1).unwrap().as_str(), "001");
        assert_eq!(Serial::sequential(42).unwrap().as_str(), "042");
        assert_eq!(Serial::sequential(999).unwrap().as_str(), "999");
        assert!(Serial::sequential(0).is_err());
    }

    #[test]
    fn at_registration_02_random_serial_is_prefixed_five_digits() {
        assert_eq!(Serial::random(12_345).unwrap().as_str(), "R12345");
        assert!(Serial::random(9_999).is_err());
        assert!(Serial::random(100_000).is_err());
    }

    #[test]
    fn at_registration_03_draft_rejects_blank_required_fields() {
        let err = RegistrationDraft::v1("", "tom@x.com", "123").unwrap_err();
        assert_eq!(err.field(), "name");
        let err = RegistrationDraft::v1("Tom", "   ", "123").unwrap_err();
        assert_eq!(err.field(), "email");
        let err = RegistrationDraft::v1("Tom", "tom@x.com", "").unwrap_err();
        assert_eq!(err.field(), "phone");
    }

    #[test]
    fn at_registration_04_draft_trims_but_keeps_email_case() {
        let draft = RegistrationDraft::v1(" Tom ", " Tom@X.com ", " 123 ").unwrap();
        assert_eq!(draft.name, "Tom");
        assert_eq!(draft.email, "Tom@X.com");
        assert_eq!(draft.phone, "123");
    }

    #[test]
    fn at_registration_05_draft_rejects_embedded_newline() {
        let err = RegistrationDraft::v1("Tom\nEvil", "tom@x.com", "123").unwrap_err();
        assert_eq!(
            err,
            ContractViolation::InvalidValue {
                field: "name",
                reason: "must not contain control characters",
            }
        );
    }

    #[test]
    fn at_registration_06_serial_scheme_parse() {
        assert_eq!(SerialScheme::parse("Random"), Some(SerialScheme::Random));
        assert_eq!(SerialScheme::parse("seq"), Some(SerialScheme::Sequential));
        assert_eq!(SerialScheme::parse("uuid"), None);
    }
}
