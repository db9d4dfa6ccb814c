pub mod config;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod services;
pub mod time_control_client;

pub use services::{auth, interval, interval_store, schedule, settings};
