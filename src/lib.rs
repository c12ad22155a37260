#![forbid(unsafe_code)]

//! Lab environment orchestration: pooled remote-desktop sessions and
//! template-backed dedicated lab instances.

pub mod compute;
pub mod config;
pub mod errors;
pub mod http;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod provisioner;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
