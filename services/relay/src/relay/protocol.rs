//! Defines the JSON envelopes the relay sends to the browser client.

use serde::Serialize;
use serde_json::Value;

/// Messages sent from the relay to the client (browser).
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirms the upstream connection is open and reports the settings in effect.
    ProxyOpen {
        params: ThresholdParams,
        upstream: String,
    },
    /// A transcript extracted from a provider turn event.
    Message { data: NormalizedTranscript },
    /// Reports a relay-side failure. The socket is closed right after.
    ProxyError { message: String },
    /// Reports a missing provider credential. The socket is closed right after.
    Error { message: String },
}

/// Threshold values as echoed back in `proxy_open`, named like the provider's query parameters.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ThresholdParams {
    pub end_of_turn_confidence_threshold: f64,
    pub min_end_of_turn_silence_when_confident: i64,
    pub max_turn_silence: i64,
}

/// The canonical transcript shape forwarded to the client.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct NormalizedTranscript {
    pub text: String,
    pub end_of_turn: bool,
    /// The provider event this transcript was extracted from, untouched.
    pub raw: Value,
}
