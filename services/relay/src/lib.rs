//! Realtime Relay Library Crate
//!
//! This library contains the realtime transcription relay: configuration,
//! the gated listener, routing, and the per-session bridge between the
//! browser and the speech-recognition provider. The `relay` binary is a thin
//! wrapper around this library.

pub mod config;
pub mod error;
pub mod listener;
pub mod relay;
pub mod router;
pub mod state;
