#![forbid(unsafe_code)]

use std::collections::HashMap;

use signup_contracts::MonotonicTimeNs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminAuthConfig {
    pub max_failures: u16,
    pub failure_window_ms: u32,
    pub lockout_ms: u32,
    pub max_tracked_clients: usize,
}

impl AdminAuthConfig {
    pub fn mvp_v1() -> Self {
        Self {
            max_failures: 5,
            failure_window_ms: 60_000,
            lockout_ms: 300_000,
            max_tracked_clients: 4_096,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Granted,
    Denied { remaining_attempts: u16 },
    LockedOut { retry_after_ms: u32 },
}

impl AuthDecision {
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    window_started_at: MonotonicTimeNs,
    failures: u16,
    locked_until: Option<MonotonicTimeNs>,
}

/// Failed-attempt limiter for the admin password, keyed by client (remote
/// address or any stable caller id).
#[derive(Debug)]
pub struct AdminAuthRuntime {
    config: AdminAuthConfig,
    clients: HashMap<String, FailureWindow>,
}

impl AdminAuthRuntime {
    pub fn new(config: AdminAuthConfig) -> Self {
        Self {
            config,
            clients: HashMap::new(),
        }
    }

    /// Refuses `client_key` while it is locked out. Password verification is
    /// slow, so callers run it between [`Self::admit`] and [`Self::record`]
    /// without holding the limiter.
    pub fn admit(&self, client_key: &str, now: MonotonicTimeNs) -> Result<(), AuthDecision> {
        match self.lockout_remaining_ms(client_key, now) {
            Some(retry_after_ms) => Err(AuthDecision::LockedOut { retry_after_ms }),
            None => Ok(()),
        }
    }

    /// Records a verification outcome. A success clears the client's failure
    /// history; a failure that lands while the client is already locked out
    /// keeps the existing lockout.
    pub fn record(&mut self, client_key: &str, now: MonotonicTimeNs, verified: bool) -> AuthDecision {
        if verified {
            self.clients.remove(client_key);
            return AuthDecision::Granted;
        }
        if let Some(retry_after_ms) = self.lockout_remaining_ms(client_key, now) {
            return AuthDecision::LockedOut { retry_after_ms };
        }
        self.record_failure(client_key, now)
    }

    pub fn lockout_remaining_ms(&self, client_key: &str, now: MonotonicTimeNs) -> Option<u32> {
        let locked_until = self.clients.get(client_key)?.locked_until?;
        if locked_until <= now {
            return None;
        }
        let remaining_ns = locked_until.0 - now.0;
        Some(u32::try_from(remaining_ns.div_ceil(1_000_000)).unwrap_or(u32::MAX))
    }

    fn record_failure(&mut self, client_key: &str, now: MonotonicTimeNs) -> AuthDecision {
        if !self.clients.contains_key(client_key)
            && self.clients.len() >= self.config.max_tracked_clients
        {
            self.evict_stale(now);
        }
        let config = self.config;
        let entry = self
            .clients
            .entry(client_key.to_string())
            .or_insert(FailureWindow {
                window_started_at: now,
                failures: 0,
                locked_until: None,
            });
        let window_end = entry
            .window_started_at
            .saturating_add_ms(config.failure_window_ms);
        if entry.locked_until.is_some() || window_end <= now {
            *entry = FailureWindow {
                window_started_at: now,
                failures: 0,
                locked_until: None,
            };
        }
        entry.failures = entry.failures.saturating_add(1);
        if entry.failures >= config.max_failures {
            entry.locked_until = Some(now.saturating_add_ms(config.lockout_ms));
            return AuthDecision::LockedOut {
                retry_after_ms: config.lockout_ms,
            };
        }
        AuthDecision::Denied {
            remaining_attempts: config.max_failures - entry.failures,
        }
    }

    fn evict_stale(&mut self, now: MonotonicTimeNs) {
        let window_ms = self.config.failure_window_ms;
        self.clients.retain(|_, w| match w.locked_until {
            Some(until) => until > now,
            None => w.window_started_at.saturating_add_ms(window_ms) > now,
        });
        if self.clients.len() >= self.config.max_tracked_clients {
            self.clients.clear();
        }
    }
}
