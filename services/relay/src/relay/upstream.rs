//! The outbound connection to the transcription provider and the decoding of
//! its events into client-facing messages.

use super::protocol::{NormalizedTranscript, ServerMessage};
use crate::error::SessionError;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        client::IntoClientRequest,
        handshake::client::Request,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::info;
use url::Url;

pub type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Arrays longer than this are collapsed in verbose logs.
const DEBUG_MAX_ARRAY_LEN: usize = 50;
/// Strings longer than this are truncated in verbose logs.
const DEBUG_MAX_STRING_LEN: usize = 1000;

/// Builds the provider handshake request.
///
/// The credential travels only in the `Authorization` header, so the URL
/// stays safe to log and to echo back to the client.
pub fn build_request(url: &Url, api_key: &SecretString) -> Result<Request, SessionError> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| SessionError::UpstreamRequest(e.to_string()))?;
    let mut value = HeaderValue::from_str(api_key.expose_secret())
        .map_err(|_| SessionError::UpstreamRequest("API key is not a valid header value".into()))?;
    value.set_sensitive(true);
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

/// Opens the provider connection. Never retried: a failure ends the session.
pub async fn connect(request: Request) -> Result<UpstreamSocket, SessionError> {
    let (ws_stream, _) = connect_async(request).await?;
    Ok(ws_stream)
}

/// A provider payload, classified by the fixed rules applied to every message.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    /// Not JSON. Forwarded verbatim.
    PlainText(String),
    /// Already in a client-facing shape (`type: "message"` or has `text`).
    Passthrough(Value),
    /// A provider turn, normalized.
    Turn(NormalizedTranscript),
    /// Anything else. Dropped.
    Unrecognized,
}

impl UpstreamEvent {
    /// Decodes a text payload from the provider.
    ///
    /// When `verbose` is set every JSON payload is logged in a size-bounded form.
    pub fn decode(text: String, verbose: bool) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => {
                if verbose {
                    log_raw(&value);
                }
                Self::from_value(value)
            }
            Err(_) => UpstreamEvent::PlainText(text),
        }
    }

    /// Applies the dispatch rules, in order, to a parsed payload.
    pub fn from_value(value: Value) -> Self {
        let Some(obj) = value.as_object() else {
            return UpstreamEvent::Unrecognized;
        };

        let field = |name: &str| obj.get(name).is_some_and(truthy);

        if obj.get("type").and_then(Value::as_str) == Some("message") || field("text") {
            return UpstreamEvent::Passthrough(value);
        }

        if obj.get("type").and_then(Value::as_str) == Some("Turn")
            || field("transcript")
            || field("words")
        {
            let text = transcript_text(&value);
            let end_of_turn = obj.get("end_of_turn").is_some_and(truthy);
            return UpstreamEvent::Turn(NormalizedTranscript {
                text,
                end_of_turn,
                raw: value,
            });
        }

        UpstreamEvent::Unrecognized
    }

    /// Serializes the event for the client, or `None` if it is not forwarded.
    pub fn into_client_text(self) -> Result<Option<String>, serde_json::Error> {
        match self {
            UpstreamEvent::PlainText(text) => Ok(Some(text)),
            UpstreamEvent::Passthrough(value) => serde_json::to_string(&value).map(Some),
            UpstreamEvent::Turn(data) => {
                serde_json::to_string(&ServerMessage::Message { data }).map(Some)
            }
            UpstreamEvent::Unrecognized => Ok(None),
        }
    }
}

/// Picks the best available transcript: `transcript`, then `utterance`,
/// then the space-joined `text` of each entry in `words`.
fn transcript_text(value: &Value) -> String {
    for name in ["transcript", "utterance"] {
        if let Some(v) = value.get(name).filter(|v| truthy(v)) {
            return display(v);
        }
    }

    match value.get("words").and_then(Value::as_array) {
        Some(words) => words
            .iter()
            .map(|w| match w.get("text") {
                None | Some(Value::Null) => String::new(),
                Some(v) => display(v),
            })
            .collect::<Vec<_>>()
            .join(" "),
        None => String::new(),
    }
}

/// JSON truthiness: null, false, 0, "" are false; arrays and objects are true.
pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn log_raw(value: &Value) {
    match serde_json::to_string_pretty(&bounded_repr(value)) {
        Ok(repr) => info!(payload = %repr, "Upstream raw payload"),
        Err(_) => info!(payload = %value, "Upstream raw payload"),
    }
}

/// A copy of `value` safe to log: long arrays become a placeholder and long
/// strings are cut with a marker.
pub fn bounded_repr(value: &Value) -> Value {
    match value {
        Value::Array(items) if items.len() > DEBUG_MAX_ARRAY_LEN => {
            Value::String(format!("[Array({})]", items.len()))
        }
        Value::Array(items) => Value::Array(items.iter().map(bounded_repr).collect()),
        Value::String(s) if s.chars().count() > DEBUG_MAX_STRING_LEN => {
            let cut: String = s.chars().take(DEBUG_MAX_STRING_LEN).collect();
            Value::String(format!("{cut}...[truncated]"))
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), bounded_repr(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}
