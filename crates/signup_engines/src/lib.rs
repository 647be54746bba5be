#![forbid(unsafe_code)]

pub mod admin_auth;
pub mod capacity;
pub mod mirror_client;
pub mod password;
pub mod serial;
