#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use signup_contracts::gate::{
    CapacityLimit, PasswordHash, StoredAdminSecret, StoredGateConfig,
};
use tracing::warn;

use crate::fsutil::{atomic_write, read_optional, restrict_permissions};
use crate::store::StorageError;

pub const KEY_LIMIT: &str = "limit";
pub const KEY_PASSWORD_HASH: &str = "password_hash";
pub const KEY_LEGACY_PASSWORD: &str = "password";

/// `key=value` config file holding the capacity limit and the admin password hash.
#[derive(Debug, Clone)]
pub struct GateConfigFile {
    path: PathBuf,
}

impl GateConfigFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<StoredGateConfig>, StorageError> {
        let Some(bytes) = read_optional(&self.path)? else {
            return Ok(None);
        };
        let raw = String::from_utf8(bytes).map_err(|_| StorageError::MalformedConfig {
            line: 0,
            reason: "config file is not valid UTF-8".to_string(),
        })?;
        parse_gate_config(&raw).map(Some)
    }

    pub fn save(&self, config: &StoredGateConfig) -> Result<(), StorageError> {
        atomic_write(&self.path, render_gate_config(config).as_bytes())?;
        restrict_permissions(&self.path)
    }
}

/// Parses `key=value` lines. The split happens on the first `=` only, so values
/// may themselves contain `=`. Blank lines and `#` comments are skipped.
pub fn parse_gate_config(raw: &str) -> Result<StoredGateConfig, StorageError> {
    let mut capacity_limit = None;
    let mut password_hash = None;
    let mut legacy_password = None;

    for (idx, line) in raw.lines().enumerate() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            return Err(StorageError::MalformedConfig {
                line: line_no,
                reason: "expected key=value".to_string(),
            });
        };
        match key.trim() {
            KEY_LIMIT => {
                let parsed = value.trim().parse::<u32>().map_err(|_| {
                    StorageError::MalformedConfig {
                        line: line_no,
                        reason: "limit must be an integer".to_string(),
                    }
                })?;
                let limit =
                    CapacityLimit::new(parsed).map_err(|err| StorageError::MalformedConfig {
                        line: line_no,
                        reason: err.to_string(),
                    })?;
                capacity_limit = Some(limit);
            }
            KEY_PASSWORD_HASH => {
                let hash =
                    PasswordHash::parse(value).map_err(|err| StorageError::MalformedConfig {
                        line: line_no,
                        reason: err.to_string(),
                    })?;
                password_hash = Some(hash);
            }
            KEY_LEGACY_PASSWORD => {
                legacy_password = Some(value.to_string());
            }
            other => {
                warn!(key = other, line = line_no, "ignoring unknown config key");
            }
        }
    }

    let admin_secret = match (password_hash, legacy_password) {
        (Some(hash), _) => StoredAdminSecret::Hashed(hash),
        (None, Some(plain)) if !plain.is_empty() => StoredAdminSecret::LegacyPlaintext(plain),
        _ => {
            return Err(StorageError::MalformedConfig {
                line: 0,
                reason: "missing admin password".to_string(),
            })
        }
    };

    Ok(StoredGateConfig {
        capacity_limit: capacity_limit.unwrap_or_default(),
        admin_secret,
    })
}

pub fn render_gate_config(config: &StoredGateConfig) -> String {
    let secret_line = match &config.admin_secret {
        StoredAdminSecret::Hashed(hash) => format!("{KEY_PASSWORD_HASH}={}", hash.encode()),
        StoredAdminSecret::LegacyPlaintext(plain) => format!("{KEY_LEGACY_PASSWORD}={plain}"),
    };
    format!(
        "{KEY_LIMIT}={}\n{secret_line}\n",
        config.capacity_limit.get()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_gate_config_01_legacy_file_parses_as_plaintext() {
        let cfg = parse_gate_config("limit=5\npassword=123456").unwrap();
        assert_eq!(cfg.capacity_limit.get(), 5);
        assert_eq!(
            cfg.admin_secret,
            StoredAdminSecret::LegacyPlaintext("123456".to_string())
        );
    }

    #[test]
    fn at_gate_config_02_value_may_contain_equals_sign() {
        let cfg = parse_gate_config("password=a=b=c\n").unwrap();
        assert_eq!(
            cfg.admin_secret,
            StoredAdminSecret::LegacyPlaintext("a=b=c".to_string())
        );
        assert_eq!(cfg.capacity_limit, CapacityLimit::default());
    }

    #[test]
    fn at_gate_config_03_hash_wins_over_legacy_line() {
        let raw = "# signup\nlimit=30\npassword=old\npassword_hash=sha256i$2$c2FsdA==$ZGln\n";
        let cfg = parse_gate_config(raw).unwrap();
        assert_eq!(cfg.capacity_limit.get(), 30);
        assert!(matches!(cfg.admin_secret, StoredAdminSecret::Hashed(_)));
    }

    #[test]
    fn at_gate_config_04_rejects_bad_lines() {
        assert!(matches!(
            parse_gate_config("limit=5\ngarbage\npassword=x"),
            Err(StorageError::MalformedConfig { line: 2, .. })
        ));
        assert!(matches!(
            parse_gate_config("limit=0\npassword=x"),
            Err(StorageError::MalformedConfig { line: 1, .. })
        ));
        assert!(matches!(
            parse_gate_config("limit=5\n"),
            Err(StorageError::MalformedConfig { line: 0, .. })
        ));
    }

    #[test]
    fn at_gate_config_05_render_then_parse_keeps_hash() {
        let cfg = StoredGateConfig {
            capacity_limit: CapacityLimit::new(120).unwrap(),
            admin_secret: StoredAdminSecret::Hashed(
                PasswordHash::v1(4, "c2FsdA==", "ZGlnZXN0").unwrap(),
            ),
        };
        let rendered = render_gate_config(&cfg);
        assert_eq!(
            rendered,
            "limit=120\npassword_hash=sha256i$4$c2FsdA==$ZGlnZXN0\n"
        );
        assert_eq!(parse_gate_config(&rendered).unwrap(), cfg);
    }
}
