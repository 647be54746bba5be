#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const CAPACITY_LIMIT_MIN: u16 = 1;
pub const CAPACITY_LIMIT_MAX: u16 = 999;
pub const CAPACITY_LIMIT_DEFAULT: u16 = 5;

pub const PASSWORD_HASH_SCHEME: &str = "sha256i";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CapacityLimit(u16);

impl CapacityLimit {
    pub fn new(value: u32) -> Result<Self, ContractViolation> {
        if !(CAPACITY_LIMIT_MIN as u32..=CAPACITY_LIMIT_MAX as u32).contains(&value) {
            return Err(ContractViolation::InvalidRange {
                field: "capacity_limit",
                min: CAPACITY_LIMIT_MIN as u64,
                max: CAPACITY_LIMIT_MAX as u64,
                got: value as u64,
            });
        }
        Ok(Self(value as u16))
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl Default for CapacityLimit {
    fn default() -> Self {
        Self(CAPACITY_LIMIT_DEFAULT)
    }
}

/// Salted, iterated password digest in its encoded form.
///
/// Encoding: `sha256i$<iterations>$<salt_b64>$<digest_b64>`. Hashing itself
/// lives in the engines crate; this type only carries and validates the parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordHash {
    pub iterations: u32,
    pub salt_b64: String,
    pub digest_b64: String,
}

impl PasswordHash {
    pub fn v1(
        iterations: u32,
        salt_b64: impl Into<String>,
        digest_b64: impl Into<String>,
    ) -> Result<Self, ContractViolation> {
        let hash = Self {
            iterations,
            salt_b64: salt_b64.into(),
            digest_b64: digest_b64.into(),
        };
        hash.validate()?;
        Ok(hash)
    }

    pub fn encode(&self) -> String {
        format!(
            "{PASSWORD_HASH_SCHEME}${}${}${}",
            self.iterations, self.salt_b64, self.digest_b64
        )
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        let mut parts = raw.trim().split('$');
        let scheme = parts.next().unwrap_or_default();
        if scheme != PASSWORD_HASH_SCHEME {
            return Err(ContractViolation::InvalidValue {
                field: "password_hash",
                reason: "unknown hash scheme",
            });
        }
        let (Some(iterations), Some(salt), Some(digest), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ContractViolation::InvalidValue {
                field: "password_hash",
                reason: "expected scheme$iterations$salt$digest",
            });
        };
        let iterations = iterations
            .parse::<u32>()
            .map_err(|_| ContractViolation::InvalidValue {
                field: "password_hash",
                reason: "iterations must be an integer",
            })?;
        Self::v1(iterations, salt, digest)
    }
}

impl Validate for PasswordHash {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.iterations == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "password_hash",
                reason: "iterations must be >= 1",
            });
        }
        if self.salt_b64.is_empty() || self.digest_b64.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "password_hash",
                reason: "salt and digest must not be empty",
            });
        }
        if self.salt_b64.contains('$') || self.digest_b64.contains('$') {
            return Err(ContractViolation::InvalidValue {
                field: "password_hash",
                reason: "salt and digest must not contain '$'",
            });
        }
        Ok(())
    }
}

/// Admin password as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredAdminSecret {
    Hashed(PasswordHash),
    /// Written by older deployments as `password=<plain>`; migrated on next save.
    LegacyPlaintext(String),
}

/// Gate configuration as persisted, before any legacy migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredGateConfig {
    pub capacity_limit: CapacityLimit,
    pub admin_secret: StoredAdminSecret,
}

/// Gate configuration as used at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateConfig {
    pub capacity_limit: CapacityLimit,
    pub admin_password: PasswordHash,
}

impl GateConfig {
    pub fn to_stored(&self) -> StoredGateConfig {
        StoredGateConfig {
            capacity_limit: self.capacity_limit,
            admin_secret: StoredAdminSecret::Hashed(self.admin_password.clone()),
        }
    }
}
