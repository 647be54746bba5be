#![forbid(unsafe_code)]

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use signup_contracts::gate::PasswordHash;
use signup_contracts::ContractViolation;
use subtle::ConstantTimeEq;

pub const PASSWORD_HASH_ITERATIONS_DEFAULT: u32 = 100_000;
pub const PASSWORD_HASH_ITERATIONS_MAX: u32 = 5_000_000;
pub const PASSWORD_SALT_LEN: usize = 16;
pub const ADMIN_PASSWORD_MAX_CHARS: usize = 128;

/// Checks `password` against the admin password policy, then hashes it with
/// a fresh random salt.
pub fn new_password_hash(password: &str) -> Result<PasswordHash, ContractViolation> {
    validate_admin_password(password)?;
    hash_with_fresh_salt(password)
}

/// Hashes a plaintext password found in an old config file as is. The policy
/// is not applied here so an existing login keeps working after migration.
pub fn hash_legacy_password(password: &str) -> Result<PasswordHash, ContractViolation> {
    hash_with_fresh_salt(password)
}

fn hash_with_fresh_salt(password: &str) -> Result<PasswordHash, ContractViolation> {
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    hash_password_with_salt(password, &salt, PASSWORD_HASH_ITERATIONS_DEFAULT)
}

pub fn hash_password_with_salt(
    password: &str,
    salt: &[u8],
    iterations: u32,
) -> Result<PasswordHash, ContractViolation> {
    let digest = iterated_digest(password.as_bytes(), salt, iterations);
    PasswordHash::v1(iterations, BASE64.encode(salt), BASE64.encode(digest))
}

/// Constant-time check of `candidate` against a stored hash. A hash whose
/// parts cannot be decoded never verifies.
pub fn verify_password(candidate: &str, stored: &PasswordHash) -> bool {
    if stored.iterations == 0 || stored.iterations > PASSWORD_HASH_ITERATIONS_MAX {
        return false;
    }
    let (Ok(salt), Ok(expected)) = (
        BASE64.decode(stored.salt_b64.as_bytes()),
        BASE64.decode(stored.digest_b64.as_bytes()),
    ) else {
        return false;
    };
    let actual = iterated_digest(candidate.as_bytes(), &salt, stored.iterations);
    actual.as_slice().ct_eq(expected.as_slice()).into()
}

/// Admin passwords travel in an HTTP header, so they are limited to visible
/// ASCII plus interior spaces.
pub fn validate_admin_password(password: &str) -> Result<(), ContractViolation> {
    if password.is_empty() {
        return Err(ContractViolation::InvalidValue {
            field: "admin_password",
            reason: "must not be empty",
        });
    }
    if password.chars().count() > ADMIN_PASSWORD_MAX_CHARS {
        return Err(ContractViolation::InvalidValue {
            field: "admin_password",
            reason: "exceeds maximum length",
        });
    }
    if !password.chars().all(|c| (' '..='~').contains(&c)) {
        return Err(ContractViolation::InvalidValue {
            field: "admin_password",
            reason: "must be printable ASCII",
        });
    }
    if password.trim() != password {
        return Err(ContractViolation::InvalidValue {
            field: "admin_password",
            reason: "must not start or end with a space",
        });
    }
    Ok(())
}

fn iterated_digest(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(password);
    let mut digest: [u8; 32] = hasher.finalize().into();
    for _ in 1..iterations {
        let mut hasher = Sha256::new();
        hasher.update(digest);
        hasher.update(salt);
        hasher.update(password);
        digest = hasher.finalize().into();
    }
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_password_01_hash_verifies_only_the_same_password() {
        let hash = hash_password_with_salt("s3cret=ok", b"0123456789abcdef", 16).unwrap();
        assert!(verify_password("s3cret=ok", &hash));
        assert!(!verify_password("s3cret=OK", &hash));
        assert!(!verify_password("", &hash));
    }

    #[test]
    fn at_password_02_fresh_salt_per_hash() {
        let a = new_password_hash("123456").unwrap();
        let b = new_password_hash("123456").unwrap();
        assert_ne!(a.salt_b64, b.salt_b64);
        assert_ne!(a.digest_b64, b.digest_b64);
        assert!(verify_password("123456", &a));
        assert!(verify_password("123456", &b));
    }

    #[test]
    fn at_password_03_encoded_hash_survives_parse() {
        let hash = hash_password_with_salt("admin", b"saltsaltsaltsalt", 8).unwrap();
        let parsed = PasswordHash::parse(&hash.encode()).unwrap();
        assert!(verify_password("admin", &parsed));
    }

    #[test]
    fn at_password_04_undecodable_hash_never_verifies() {
        let hash = PasswordHash::v1(4, "***", "***").unwrap();
        assert!(!verify_password("anything", &hash));
    }

    #[test]
    fn at_password_05_policy_accepts_only_header_safe_passwords() {
        assert!(validate_admin_password("").is_err());
        assert!(validate_admin_password("a\nb").is_err());
        assert!(validate_admin_password("tab\there").is_err());
        assert!(validate_admin_password(&"x".repeat(ADMIN_PASSWORD_MAX_CHARS + 1)).is_err());
        assert!(validate_admin_password("密碼123").is_err());
        assert!(validate_admin_password("  spaced  ").is_err());
        assert!(validate_admin_password("trailing ").is_err());
        assert!(validate_admin_password("in ner").is_ok());
        assert!(validate_admin_password("P@ss=w0rd!~").is_ok());
        assert!(validate_admin_password(&"x".repeat(ADMIN_PASSWORD_MAX_CHARS)).is_ok());
    }

    #[test]
    fn at_password_06_legacy_plaintext_hashes_outside_policy() {
        assert!(new_password_hash("密碼").is_err());
        let hash = hash_legacy_password("密碼").unwrap();
        assert!(verify_password("密碼", &hash));
    }
}
