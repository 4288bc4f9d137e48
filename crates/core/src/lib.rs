//! Core crate for the vidgen server: task registry, poller, sessions,
//! uploads, the remote API client and the HTTP surface.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod poller;
pub mod registry;
pub mod remote;
pub mod server;
pub mod sessions;
pub mod task;
pub mod uploads;
