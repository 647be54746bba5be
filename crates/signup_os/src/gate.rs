#![forbid(unsafe_code)]

use std::env;

use signup_contracts::gate::{
    CapacityLimit, GateConfig, PasswordHash, StoredAdminSecret, StoredGateConfig,
};
use signup_engines::capacity::CapacitySnapshot;
use signup_engines::password::{hash_legacy_password, new_password_hash};
use signup_storage::gate_config::GateConfigFile;
use tracing::{info, warn};

use crate::SignupError;

pub const BOOTSTRAP_ADMIN_PASSWORD_ENV: &str = "SIGNUP_BOOTSTRAP_ADMIN_PASSWORD";
pub const BOOTSTRAP_ADMIN_PASSWORD_DEFAULT: &str = "123456";

/// Password used to seed a config file that does not exist yet.
pub fn bootstrap_admin_password_from_env() -> String {
    match env::var(BOOTSTRAP_ADMIN_PASSWORD_ENV) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => {
            warn!(
                env = BOOTSTRAP_ADMIN_PASSWORD_ENV,
                "no bootstrap admin password set, using the built-in default; change it after first login"
            );
            BOOTSTRAP_ADMIN_PASSWORD_DEFAULT.to_string()
        }
    }
}

/// The capacity/password gate: an explicit config object read from disk once
/// and re-read only through [`GateConfigRuntime::reload`].
#[derive(Debug)]
pub struct GateConfigRuntime {
    file: GateConfigFile,
    current: GateConfig,
}

impl GateConfigRuntime {
    /// Loads the config file, creating it with the default limit and the
    /// bootstrap password when absent. A legacy plaintext password is hashed
    /// and written back.
    pub fn load_or_init(
        file: GateConfigFile,
        bootstrap_password: impl FnOnce() -> String,
    ) -> Result<Self, SignupError> {
        let current = match file.load()? {
            Some(stored) => migrate_stored(&file, stored)?,
            None => {
                let config = GateConfig {
                    capacity_limit: CapacityLimit::default(),
                    admin_password: new_password_hash(&bootstrap_password())?,
                };
                file.save(&config.to_stored())?;
                info!(
                    path = %file.path().display(),
                    limit = config.capacity_limit.get(),
                    "created default gate config"
                );
                config
            }
        };
        Ok(Self { file, current })
    }

    pub fn capacity_limit(&self) -> CapacityLimit {
        self.current.capacity_limit
    }

    pub fn capacity(&self, count: usize) -> CapacitySnapshot {
        CapacitySnapshot::new(count, self.current.capacity_limit)
    }

    /// Re-reads the config file. A file removed since startup is recreated
    /// from the in-memory config.
    pub fn reload(&mut self) -> Result<&GateConfig, SignupError> {
        match self.file.load()? {
            Some(stored) => {
                self.current = migrate_stored(&self.file, stored)?;
                info!(limit = self.current.capacity_limit.get(), "gate config reloaded");
            }
            None => {
                warn!(
                    path = %self.file.path().display(),
                    "gate config file missing on reload, rewriting current config"
                );
                self.file.save(&self.current.to_stored())?;
            }
        }
        Ok(&self.current)
    }

    /// Sets the capacity limit and, when `new_password` is non-blank, the admin
    /// password. Nothing changes unless the file write succeeds.
    pub fn update_settings(
        &mut self,
        limit: u32,
        new_password: Option<&str>,
    ) -> Result<&GateConfig, SignupError> {
        let capacity_limit = CapacityLimit::new(limit)?;
        let admin_password = match new_password.filter(|p| !p.trim().is_empty()) {
            Some(password) => new_password_hash(password)?,
            None => self.current.admin_password.clone(),
        };
        let next = GateConfig {
            capacity_limit,
            admin_password,
        };
        self.file.save(&next.to_stored())?;
        let password_changed = next.admin_password != self.current.admin_password;
        self.current = next;
        info!(
            limit = capacity_limit.get(),
            password_changed, "gate settings updated"
        );
        Ok(&self.current)
    }

    /// Copy of the stored hash, for verifying without holding the gate.
    pub fn admin_password_hash(&self) -> PasswordHash {
        self.current.admin_password.clone()
    }
}

fn migrate_stored(
    file: &GateConfigFile,
    stored: StoredGateConfig,
) -> Result<GateConfig, SignupError> {
    match stored.admin_secret {
        StoredAdminSecret::Hashed(admin_password) => Ok(GateConfig {
            capacity_limit: stored.capacity_limit,
            admin_password,
        }),
        StoredAdminSecret::LegacyPlaintext(plain) => {
            let config = GateConfig {
                capacity_limit: stored.capacity_limit,
                admin_password: hash_legacy_password(&plain)?,
            };
            file.save(&config.to_stored())?;
            info!(path = %file.path().display(), "migrated plaintext admin password to hash");
            Ok(config)
        }
    }
}
