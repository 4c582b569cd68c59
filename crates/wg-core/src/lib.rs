//! Core of the WhatsGram bridge: session persistence, the connection state
//! machine, the module registry and the orchestrator.
//!
//! Telegram, the WhatsApp web client and the remote blob store live behind
//! ports (traits) implemented in adapter crates.

pub mod archive;
pub mod chat;
pub mod config;
pub mod domain;
pub mod errors;
pub mod handshake;
pub mod logging;
pub mod messaging;
pub mod modules;
pub mod orchestrator;
pub mod registry;
pub mod session_store;
pub mod store;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use errors::{Error, Result};
