//! Relays new entries of a PalGate device activity log to Telegram.

pub mod config;
pub mod models;
pub mod poller;
pub mod services;
