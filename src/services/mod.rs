//! Device protocol and override bookkeeping
//!
//! Everything below works against the [`crate::http_client::Transport`] and
//! [`crate::time_control_client::TimeControl`] seams so it can be exercised
//! without a device.

pub mod auth;
pub mod interval;
pub mod interval_store;
pub mod schedule;
pub mod scheduler;
pub mod settings;
