//! Core tether library (domain types, config, app-server client, session coordinator).

pub mod app_server;
pub mod config;
pub mod coordinator;
pub mod logging;
pub mod types;
