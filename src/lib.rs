//! Voice calling agent core.
//!
//! A carrier-agnostic outbound/inbound voice agent: a realtime STT/LLM/TTS
//! bridge between a telephony media WebSocket and a voice provider, an IVR
//! navigator, a Thompson-sampling prompt-version bandit, and a campaign
//! dispatcher with SMS fallback.

pub mod types;
pub mod error;
pub mod codec;
pub mod config;
pub mod security;

pub mod store;
pub mod registry;
pub mod bandit;
pub mod ivr;
pub mod dtmf_handler;

pub mod provider;
pub mod carrier;
pub mod executor;

pub mod session;
pub mod bridge;
pub mod campaign;

pub mod server;

pub use config::Config;
pub use server::{start as start_server, ServerState};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
