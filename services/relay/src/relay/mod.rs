//! Realtime Transcription Relay
//!
//! Bridges a browser WebSocket to the streaming speech-recognition provider.
//! It is structured into submodules:
//!
//! - `settings`: Derives per-session settings from server config and the client query.
//! - `protocol`: Defines the JSON envelopes sent to the browser.
//! - `upstream`: Connects to the provider and normalizes its events.
//! - `downstream`: Classifies frames arriving from the browser.
//! - `session`: Owns both connections and ties their lifecycles together.
//! - `send`: The best-effort write helpers used at every socket boundary.

pub mod downstream;
pub mod protocol;
mod send;
pub mod session;
pub mod settings;
pub mod upstream;

pub use session::realtime_handler;
