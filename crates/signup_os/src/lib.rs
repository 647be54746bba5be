#![forbid(unsafe_code)]

pub mod error;
pub mod gate;
pub mod mirror_sync;
pub mod registration;

pub use error::SignupError;
