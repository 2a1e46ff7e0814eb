//! Lifecycle agent for a fleet of Minecraft servers on one host.

pub mod api;
pub mod command;
pub mod config;
pub mod controller;
pub mod error;
pub mod fleet;
pub mod hub;
pub mod idle;
pub mod message;
pub mod probe;
pub mod process;
pub mod properties;
pub mod protocol;
pub mod runtime;
pub mod schedule;
pub mod server_config;
pub mod state;
pub mod usage;
pub mod wake;
