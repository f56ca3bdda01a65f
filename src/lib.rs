//! callbridge - carrier-to-model voice bridge library
//!
//! Bridges a telephony carrier's G.711 μ-law media stream to a cloud
//! realtime speech-to-speech model:
//! - Per-call dual-WebSocket relay with barge-in and 20 ms pacing
//! - Ephemeral credential minting with session sanitization
//! - Call-control XML documents (SIP dial or media stream)
//! - Control webhook for mid-call session updates
//! - Live transcript fan-out over server-sent events

pub mod bridge;
pub mod carrier;
pub mod cli;
pub mod config;
pub mod server;
pub mod session;
pub mod token;
pub mod transcript;
pub mod twiml;

// Re-export commonly used types for convenience
pub use config::Config;
pub use server::{router, start as start_server, AppState};
pub use session::{ControlState, SessionConfig};
pub use token::{EphemeralCredential, TokenMinter};
pub use transcript::TranscriptStore;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
