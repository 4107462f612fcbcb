#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod host;
pub mod loader;
pub mod target;
pub mod wire;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
