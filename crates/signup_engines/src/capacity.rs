#![forbid(unsafe_code)]

use serde::Serialize;
use signup_contracts::gate::CapacityLimit;

/// Row count against the configured limit at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CapacitySnapshot {
    pub count: usize,
    pub limit: u16,
    pub remaining: usize,
    pub is_full: bool,
}

impl CapacitySnapshot {
    pub fn new(count: usize, limit: CapacityLimit) -> Self {
        let limit_rows = limit.get() as usize;
        Self {
            count,
            limit: limit.get(),
            remaining: limit_rows.saturating_sub(count),
            is_full: count >= limit_rows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityDecision {
    Admit,
    Full { count: usize, limit: u16 },
}

pub fn evaluate_capacity(count: usize, limit: CapacityLimit) -> CapacityDecision {
    let snapshot = CapacitySnapshot::new(count, limit);
    if snapshot.is_full {
        CapacityDecision::Full {
            count,
            limit: snapshot.limit,
        }
    } else {
        CapacityDecision::Admit
    }
}
