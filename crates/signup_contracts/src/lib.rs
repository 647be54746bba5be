#![forbid(unsafe_code)]

pub mod common;
pub mod gate;
pub mod mirror;
pub mod registration;

pub use common::{ContractViolation, MonotonicTimeNs, Validate};
