//! Sandbox studio server library.

pub mod attachments;
pub mod broadcaster;
pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod executor;
pub mod hooks;
pub mod projects;
pub mod router;
pub mod run_spec;
pub mod runtime;
pub mod sandbox;
pub mod services;
pub mod telemetry;

pub(crate) fn now_unix_ms() -> i64 {
    let now = time::OffsetDateTime::now_utc();
    (now.unix_timestamp_nanos() / 1_000_000) as i64
}
