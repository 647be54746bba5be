#![forbid(unsafe_code)]

use std::env;

use rand::Rng;
use signup_contracts::gate::CapacityLimit;
use signup_contracts::mirror::{CommitLabel, MirrorSyncKind};
use signup_contracts::registration::{
    RegistrationDraft, RegistrationRecord, SerialScheme, REGISTERED_AT_FORMAT,
};
use signup_contracts::MonotonicTimeNs;
use signup_engines::capacity::{evaluate_capacity, CapacityDecision};
use signup_engines::serial::assign_serial;
use signup_storage::repo::{MirrorOutboxRepo, RegistrationRepo};
use signup_storage::SignupStore;
use tracing::{error, info};

use crate::SignupError;

pub const EVENT_TITLE_DEFAULT: &str = "3490第36屆年會報名系統";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignupFlowConfig {
    pub serial_scheme: SerialScheme,
    pub event_title: String,
}

impl SignupFlowConfig {
    pub fn mvp_v1() -> Self {
        Self {
            serial_scheme: SerialScheme::Sequential,
            event_title: EVENT_TITLE_DEFAULT.to_string(),
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::mvp_v1();
        let serial_scheme = env::var("SIGNUP_SERIAL_SCHEME")
            .ok()
            .and_then(|v| SerialScheme::parse(&v))
            .unwrap_or(defaults.serial_scheme);
        let event_title = env::var("SIGNUP_EVENT_TITLE")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or(defaults.event_title);
        Self {
            serial_scheme,
            event_title,
        }
    }
}

/// Form fields as entered, before trimming or validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignupForm {
    pub name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted(RegistrationRecord),
    Full { count: usize, limit: u16 },
}

/// Local wall-clock time in the registration timestamp format.
pub fn local_registered_at_now() -> String {
    chrono::Local::now().format(REGISTERED_AT_FORMAT).to_string()
}

#[derive(Debug, Clone)]
pub struct RegistrationRuntime {
    config: SignupFlowConfig,
}

impl RegistrationRuntime {
    pub fn new(config: SignupFlowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SignupFlowConfig {
        &self.config
    }

    /// Capacity check, field validation, serial assignment and append as one
    /// step against `store`. The caller holds the store lock for the whole call.
    ///
    /// A full event answers `Full` whatever the form holds.
    ///
    /// The row is durable once this returns `Accepted`; a failure to queue the
    /// mirror push is logged and left for the next push to cover.
    pub fn submit<R: Rng + ?Sized>(
        &self,
        store: &mut SignupStore,
        limit: CapacityLimit,
        form: SignupForm,
        now: MonotonicTimeNs,
        registered_at: String,
        rng: &mut R,
    ) -> Result<SubmitOutcome, SignupError> {
        let count = store.registration_count();
        if let CapacityDecision::Full { count, limit } = evaluate_capacity(count, limit) {
            info!(count, limit, "registration rejected, event is full");
            return Ok(SubmitOutcome::Full { count, limit });
        }
        let draft = RegistrationDraft::v1(form.name, form.email, form.phone)?;

        let serial = assign_serial(
            self.config.serial_scheme,
            count,
            &store.registrations().serials(),
            rng,
        )?;
        let record = RegistrationRecord::v1(draft, serial, registered_at);
        let record = store.append_registration_row(record)?;
        info!(serial = %record.serial, count = count + 1, "registration accepted");

        let label = CommitLabel::new(format!("新增報名 {} {}", record.serial, record.name))?;
        if let Err(err) = store.mirror_outbox_enqueue_row(
            now,
            MirrorSyncKind::RegistrationAppended,
            Some(record.serial.clone()),
            label,
        ) {
            error!(serial = %record.serial, error = %err, "mirror push could not be queued");
        }
        Ok(SubmitOutcome::Accepted(record))
    }

    /// Empties the store, keeping the canonical header, and queues a mirror push.
    pub fn clear_all(
        &self,
        store: &mut SignupStore,
        now: MonotonicTimeNs,
    ) -> Result<usize, SignupError> {
        let removed = store.clear_registration_rows()?;
        let label = CommitLabel::new(format!("清除全部報名資料 ({removed} 筆)"))?;
        if let Err(err) =
            store.mirror_outbox_enqueue_row(now, MirrorSyncKind::StoreCleared, None, label)
        {
            error!(error = %err, "mirror push could not be queued after clear");
        }
        Ok(removed)
    }

    /// Rows whose email equals `email` exactly.
    pub fn lookup(&self, store: &SignupStore, email: &str) -> Vec<RegistrationRecord> {
        store
            .registration_rows_by_email(email)
            .into_iter()
            .cloned()
            .collect()
    }
}
