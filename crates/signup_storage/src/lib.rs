#![forbid(unsafe_code)]

mod fsutil;
pub mod gate_config;
pub mod mirror_outbox;
pub mod registry;
pub mod repo;
pub mod store;

pub use store::{data_dir_from_env, SignupStore, StorageError, StorePaths};
