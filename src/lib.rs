#![allow(clippy::uninlined_format_args)]

pub mod api;
pub mod app;
pub mod auth;
pub mod comments;
pub mod config;
pub mod credential;
pub mod error;
pub mod identity;
pub mod signal;
pub mod storage;
pub mod transport;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
