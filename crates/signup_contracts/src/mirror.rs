#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, Validate};

pub const COMMIT_LABEL_MAX_CHARS: usize = 200;
pub const MIRROR_SEGMENT_MAX_CHARS: usize = 100;
pub const MIRROR_PATH_MAX_CHARS: usize = 512;

/// Where the registration CSV is mirrored on the remote contents API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorTarget {
    pub owner: String,
    pub repo: String,
    pub path: String,
    pub branch: Option<String>,
}

impl MirrorTarget {
    pub fn v1(
        owner: impl Into<String>,
        repo: impl Into<String>,
        path: impl Into<String>,
        branch: Option<String>,
    ) -> Result<Self, ContractViolation> {
        let target = Self {
            owner: owner.into().trim().to_string(),
            repo: repo.into().trim().to_string(),
            path: path.into().trim().trim_matches('/').to_string(),
            branch: branch
                .map(|b| b.trim().to_string())
                .filter(|b| !b.is_empty()),
        };
        target.validate()?;
        Ok(target)
    }

    pub fn path_segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/')
    }
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.chars().count() > MIRROR_SEGMENT_MAX_CHARS {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "exceeds maximum length",
        });
    }
    if value.contains('/') || value == "." || value == ".." {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be a single path segment",
        });
    }
    Ok(())
}

impl Validate for MirrorTarget {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_segment("mirror_owner", &self.owner)?;
        validate_segment("mirror_repo", &self.repo)?;
        if self.path.is_empty() || self.path.chars().count() > MIRROR_PATH_MAX_CHARS {
            return Err(ContractViolation::InvalidValue {
                field: "mirror_path",
                reason: "must be 1..=512 chars",
            });
        }
        if self
            .path
            .split('/')
            .any(|seg| seg.is_empty() || seg == "." || seg == "..")
        {
            return Err(ContractViolation::InvalidValue {
                field: "mirror_path",
                reason: "must not contain empty, '.' or '..' segments",
            });
        }
        if let Some(branch) = self.branch.as_deref() {
            if branch.chars().any(|c| c.is_control() || c.is_whitespace()) {
                return Err(ContractViolation::InvalidValue {
                    field: "mirror_branch",
                    reason: "must not contain whitespace or control characters",
                });
            }
        }
        Ok(())
    }
}

/// Human-readable description attached to a remote mirror update.
///
/// Any Unicode text is allowed; it travels as a JSON string, so only control
/// characters are removed and the length is bounded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommitLabel(String);

impl CommitLabel {
    pub fn new(raw: impl Into<String>) -> Result<Self, ContractViolation> {
        let raw = raw.into();
        let cleaned: String = raw
            .chars()
            .map(|c| if c.is_control() { ' ' } else { c })
            .collect::<String>()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if cleaned.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "commit_label",
                reason: "must not be empty",
            });
        }
        Ok(Self(cleaned.chars().take(COMMIT_LABEL_MAX_CHARS).collect()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorSyncKind {
    RegistrationAppended,
    StoreCleared,
}

impl MirrorSyncKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RegistrationAppended => "RegistrationAppended",
            Self::StoreCleared => "StoreCleared",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MirrorSyncState {
    Queued,
    InFlight,
    Acked,
    DeadLetter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_mirror_contract_01_commit_label_keeps_unicode_and_strips_controls() {
        let label = CommitLabel::new("新增報名\n序號 001\t(Tom)").unwrap();
        assert_eq!(label.as_str(), "新增報名 序號 001 (Tom)");
    }

    #[test]
    fn at_mirror_contract_02_commit_label_bounded_and_non_empty() {
        assert!(CommitLabel::new(" \n\t ").is_err());
        let long = "x".repeat(COMMIT_LABEL_MAX_CHARS + 50);
        assert_eq!(
            CommitLabel::new(long).unwrap().as_str().chars().count(),
            COMMIT_LABEL_MAX_CHARS
        );
    }

    #[test]
    fn at_mirror_contract_03_target_normalizes_and_validates_path() {
        let target =
            MirrorTarget::v1("acme", "signup-data", "/data/報名.csv/", Some(" ".into())).unwrap();
        assert_eq!(target.path, "data/報名.csv");
        assert_eq!(target.branch, None);
        assert_eq!(
            target.path_segments().collect::<Vec<_>>(),
            vec!["data", "報名.csv"]
        );
        assert!(MirrorTarget::v1("acme", "repo", "a/../b.csv", None).is_err());
        assert!(MirrorTarget::v1("ac/me", "repo", "b.csv", None).is_err());
        assert!(MirrorTarget::v1("acme", "repo", "", None).is_err());
    }
}
