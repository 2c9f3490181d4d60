//! Per-session settings derived once when a client connects.
//!
//! Only `sample_rate` is read from the client. Endpointing thresholds come
//! from server configuration and cannot be overridden by the query string.

use super::protocol::ThresholdParams;
use crate::{
    config::{Config, RawThresholds},
    error::SessionError,
};
use secrecy::SecretString;
use tracing::warn;
use url::Url;

pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Query parameter names a client may try to use to override thresholds.
pub const CLIENT_THRESHOLD_PARAMS: [&str; 3] = ["min_silence", "max_silence", "end_of_turn"];

const UPSTREAM_PARAMS: [&str; 7] = [
    "sample_rate",
    "punctuate",
    "format_turns",
    "itn",
    "end_of_turn_confidence_threshold",
    "min_end_of_turn_silence_when_confident",
    "max_turn_silence",
];

/// The parts of the client's query string the relay looks at.
#[derive(Debug, Default, PartialEq)]
pub struct ClientQuery {
    pub sample_rate: Option<String>,
    /// Threshold names the client supplied a value for. These are never used.
    pub overrides: Vec<String>,
}

impl ClientQuery {
    /// Parses a raw query string. The first occurrence of a key wins.
    pub fn parse(raw: Option<&str>) -> Self {
        let mut query = ClientQuery::default();
        let Some(raw) = raw else {
            return query;
        };
        for (key, value) in url::form_urlencoded::parse(raw.as_bytes()) {
            if key == "sample_rate" {
                if query.sample_rate.is_none() {
                    query.sample_rate = Some(value.into_owned());
                }
            } else if CLIENT_THRESHOLD_PARAMS.contains(&key.as_ref())
                && !value.is_empty()
                && !query.overrides.iter().any(|k| k == key.as_ref())
            {
                query.overrides.push(key.into_owned());
            }
        }
        query
    }

    /// The requested sample rate, or the default when absent or not a positive integer.
    pub fn sample_rate(&self) -> u32 {
        match self.sample_rate.as_deref() {
            None | Some("") => DEFAULT_SAMPLE_RATE,
            Some(value) => match value.trim().parse::<u32>() {
                Ok(rate) if rate > 0 => rate,
                _ => {
                    warn!(sample_rate = %value, "Invalid sample_rate from client, using default");
                    DEFAULT_SAMPLE_RATE
                }
            },
        }
    }
}

/// Validated endpointing thresholds. Immutable for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub min_silence_ms: i64,
    pub max_silence_ms: i64,
    pub end_of_turn_confidence: f64,
}

impl Thresholds {
    /// Validates the raw environment values.
    ///
    /// Presence is checked for all three before any of them is parsed, so a
    /// missing value is always reported as missing. Each value is read from
    /// its leading number and trailing text is ignored, so `"500ms"` is 500
    /// and `"1.5"` is 1 for the silence values. A value with no leading
    /// number is invalid.
    pub fn from_raw(raw: &RawThresholds) -> Result<Self, SessionError> {
        let (Some(min), Some(max), Some(end_of_turn)) = (
            present(raw.min_silence.as_deref()),
            present(raw.max_silence.as_deref()),
            present(raw.end_of_turn.as_deref()),
        ) else {
            return Err(SessionError::MissingThresholds);
        };

        Ok(Self {
            min_silence_ms: leading_int(min).ok_or(SessionError::InvalidThresholds)?,
            max_silence_ms: leading_int(max).ok_or(SessionError::InvalidThresholds)?,
            end_of_turn_confidence: leading_float(end_of_turn)
                .ok_or(SessionError::InvalidThresholds)?,
        })
    }

    pub fn params(&self) -> ThresholdParams {
        ThresholdParams {
            end_of_turn_confidence_threshold: self.end_of_turn_confidence,
            min_end_of_turn_silence_when_confident: self.min_silence_ms,
            max_turn_silence: self.max_silence_ms,
        }
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn digit_run(bytes: &[u8]) -> usize {
    bytes.iter().take_while(|b| b.is_ascii_digit()).count()
}

/// The optionally signed decimal integer at the start of `s`, after leading
/// whitespace. Out-of-range values saturate.
fn leading_int(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let digits = &rest.as_bytes()[..digit_run(rest.as_bytes())];
    if digits.is_empty() {
        return None;
    }
    let magnitude = digits.iter().fold(0i64, |acc, d| {
        acc.saturating_mul(10).saturating_add(i64::from(d - b'0'))
    });
    Some(if negative { -magnitude } else { magnitude })
}

/// The decimal number at the start of `s`, after leading whitespace:
/// digits with an optional fraction and exponent, or `Infinity`.
fn leading_float(s: &str) -> Option<f64> {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let sign = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    if s[sign..].starts_with("Infinity") {
        return Some(if s.starts_with('-') {
            f64::NEG_INFINITY
        } else {
            f64::INFINITY
        });
    }

    let int_digits = digit_run(&bytes[sign..]);
    let mut end = sign + int_digits;
    if bytes.get(end) == Some(&b'.') {
        let frac_digits = digit_run(&bytes[end + 1..]);
        if int_digits + frac_digits > 0 {
            end += 1 + frac_digits;
        }
    }
    if end == sign {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let exp_sign = usize::from(matches!(bytes.get(end + 1), Some(b'+' | b'-')));
        let exp_digits = digit_run(&bytes[end + 1 + exp_sign..]);
        if exp_digits > 0 {
            end += 1 + exp_sign + exp_digits;
        }
    }
    s[..end].parse().ok()
}

/// Formats a float the way the provider expects numeric query values.
fn number_param(value: f64) -> String {
    if value.is_infinite() {
        let sign = if value < 0.0 { "-" } else { "" };
        format!("{sign}Infinity")
    } else {
        value.to_string()
    }
}

/// Everything a session needs to open its upstream connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub sample_rate: u32,
    pub thresholds: Thresholds,
    pub upstream_url: Url,
}

impl SessionSettings {
    /// Derives the session settings from server configuration and the client's query.
    pub fn resolve(config: &Config, query: &ClientQuery) -> Result<Self, SessionError> {
        let thresholds = Thresholds::from_raw(&config.thresholds)?;

        if !query.overrides.is_empty() {
            warn!(
                params = ?query.overrides,
                "Client attempted to override ASR params; ignoring client-supplied values"
            );
        }

        let sample_rate = query.sample_rate();
        let upstream_url = upstream_url(&config.upstream_url, sample_rate, &thresholds);

        Ok(Self {
            sample_rate,
            thresholds,
            upstream_url,
        })
    }
}

/// Returns the provider credential, failing the session when none is configured.
pub fn api_key(config: &Config) -> Result<&SecretString, SessionError> {
    config.api_key.as_ref().ok_or(SessionError::MissingApiKey)
}

/// Builds the provider URL. Relay-owned parameters replace any already on `base`.
pub fn upstream_url(base: &Url, sample_rate: u32, thresholds: &Thresholds) -> Url {
    let mut url = base.clone();
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !UPSTREAM_PARAMS.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair("sample_rate", &sample_rate.to_string())
        .append_pair("punctuate", "true")
        .append_pair("format_turns", "true")
        .append_pair("itn", "true")
        .append_pair(
            "end_of_turn_confidence_threshold",
            &number_param(thresholds.end_of_turn_confidence),
        )
        .append_pair(
            "min_end_of_turn_silence_when_confident",
            &thresholds.min_silence_ms.to_string(),
        )
        .append_pair("max_turn_silence", &thresholds.max_silence_ms.to_string());
    url
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_UPSTREAM_URL, Environment};
    use approx::assert_relative_eq;
    use std::time::Duration;

    fn raw(min: Option<&str>, max: Option<&str>, eot: Option<&str>) -> RawThresholds {
        RawThresholds {
            min_silence: min.map(String::from),
            max_silence: max.map(String::from),
            end_of_turn: eot.map(String::from),
        }
    }

    fn config_with(thresholds: RawThresholds, api_key: Option<&str>) -> Config {
        Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            log_level: tracing::Level::INFO,
            environment: Environment::Development,
            upstream_url: Url::parse(DEFAULT_UPSTREAM_URL).unwrap(),
            api_key: api_key.map(|k| SecretString::from(k.to_string())),
            thresholds,
            upstream_debug: false,
            handshake_timeout: Duration::from_secs(10),
        }
    }

    fn query_map(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[test]
    fn test_client_query_defaults() {
        let query = ClientQuery::parse(None);
        assert_eq!(query, ClientQuery::default());
        assert_eq!(query.sample_rate(), DEFAULT_SAMPLE_RATE);
    }

    #[test]
    fn test_client_query_reads_sample_rate_and_overrides() {
        let query =
            ClientQuery::parse(Some("sample_rate=48000&min_silence=1&end_of_turn=0.1&foo=bar"));
        assert_eq!(query.sample_rate.as_deref(), Some("48000"));
        assert_eq!(query.sample_rate(), 48000);
        assert_eq!(query.overrides, vec!["min_silence", "end_of_turn"]);
    }

    #[test]
    fn test_client_query_first_sample_rate_wins() {
        let query = ClientQuery::parse(Some("sample_rate=8000&sample_rate=44100"));
        assert_eq!(query.sample_rate(), 8000);
    }

    #[test]
    fn test_empty_override_values_are_not_overrides() {
        let query = ClientQuery::parse(Some("max_silence="));
        assert!(query.overrides.is_empty());
    }

    #[test]
    fn test_invalid_sample_rate_falls_back_to_default() {
        assert_eq!(
            ClientQuery::parse(Some("sample_rate=abc")).sample_rate(),
            DEFAULT_SAMPLE_RATE
        );
        assert_eq!(
            ClientQuery::parse(Some("sample_rate=0")).sample_rate(),
            DEFAULT_SAMPLE_RATE
        );
    }

    #[test]
    fn test_thresholds_parse() {
        let thresholds = Thresholds::from_raw(&raw(Some("400"), Some(" 1500 "), Some("0.7"))).unwrap();
        assert_eq!(thresholds.min_silence_ms, 400);
        assert_eq!(thresholds.max_silence_ms, 1500);
        assert_relative_eq!(thresholds.end_of_turn_confidence, 0.7);
    }

    #[test]
    fn test_any_missing_threshold_is_reported_as_missing() {
        for case in [
            raw(None, Some("1500"), Some("0.7")),
            raw(Some("400"), None, Some("0.7")),
            raw(Some("400"), Some("1500"), None),
            raw(Some("abc"), Some("1500"), None),
            raw(Some(""), Some("1500"), Some("0.7")),
        ] {
            assert!(matches!(
                Thresholds::from_raw(&case),
                Err(SessionError::MissingThresholds)
            ));
        }
    }

    #[test]
    fn test_thresholds_read_leading_numbers() {
        let thresholds =
            Thresholds::from_raw(&raw(Some("500ms"), Some("1.5"), Some(" .75 confident"))).unwrap();
        assert_eq!(thresholds.min_silence_ms, 500);
        assert_eq!(thresholds.max_silence_ms, 1);
        assert_relative_eq!(thresholds.end_of_turn_confidence, 0.75);

        let thresholds = Thresholds::from_raw(&raw(Some("-1"), Some("+20s"), Some("5e-1x"))).unwrap();
        assert_eq!(thresholds.min_silence_ms, -1);
        assert_eq!(thresholds.max_silence_ms, 20);
        assert_relative_eq!(thresholds.end_of_turn_confidence, 0.5);
    }

    #[test]
    fn test_leading_int() {
        assert_eq!(leading_int("  42"), Some(42));
        assert_eq!(leading_int("1e3"), Some(1));
        assert_eq!(leading_int("0x10"), Some(0));
        assert_eq!(leading_int("-"), None);
        assert_eq!(leading_int("ms500"), None);
        assert_eq!(leading_int("99999999999999999999"), Some(i64::MAX));
    }

    #[test]
    fn test_leading_float() {
        assert_eq!(leading_float("0.7"), Some(0.7));
        assert_eq!(leading_float("5."), Some(5.0));
        assert_eq!(leading_float("-.5"), Some(-0.5));
        assert_eq!(leading_float("1e"), Some(1.0));
        assert_eq!(leading_float("2E+2"), Some(200.0));
        assert_eq!(leading_float("Infinity"), Some(f64::INFINITY));
        assert_eq!(leading_float("-Infinityx"), Some(f64::NEG_INFINITY));
        assert_eq!(leading_float("."), None);
        assert_eq!(leading_float("e5"), None);
        assert_eq!(leading_float("inf"), None);
    }

    #[test]
    fn test_non_numeric_threshold_is_invalid() {
        for case in [
            raw(Some("abc"), Some("1500"), Some("0.7")),
            raw(Some("400"), Some("ms1500"), Some("0.7")),
            raw(Some("400"), Some("1500"), Some("high")),
            raw(Some("400"), Some("1500"), Some("NaN")),
            raw(Some("   "), Some("1500"), Some("0.7")),
        ] {
            assert!(matches!(
                Thresholds::from_raw(&case),
                Err(SessionError::InvalidThresholds)
            ));
        }
    }

    #[test]
    fn test_infinite_confidence_in_upstream_url() {
        let thresholds = Thresholds {
            min_silence_ms: -1,
            max_silence_ms: 1500,
            end_of_turn_confidence: f64::INFINITY,
        };
        let url = upstream_url(&Url::parse(DEFAULT_UPSTREAM_URL).unwrap(), 16000, &thresholds);
        let pairs = query_map(&url);
        assert!(pairs.contains(&(
            "end_of_turn_confidence_threshold".to_string(),
            "Infinity".to_string()
        )));
        assert!(pairs.contains(&(
            "min_end_of_turn_silence_when_confident".to_string(),
            "-1".to_string()
        )));
    }

    #[test]
    fn test_threshold_params() {
        let thresholds = Thresholds {
            min_silence_ms: 160,
            max_silence_ms: 2400,
            end_of_turn_confidence: 0.4,
        };
        let params = thresholds.params();
        assert_eq!(params.min_end_of_turn_silence_when_confident, 160);
        assert_eq!(params.max_turn_silence, 2400);
        assert_relative_eq!(params.end_of_turn_confidence_threshold, 0.4);
    }

    #[test]
    fn test_upstream_url_parameters() {
        let thresholds = Thresholds {
            min_silence_ms: 400,
            max_silence_ms: 1500,
            end_of_turn_confidence: 0.7,
        };
        let url = upstream_url(&Url::parse(DEFAULT_UPSTREAM_URL).unwrap(), 16000, &thresholds);

        assert_eq!(
            url.as_str(),
            "wss://streaming.assemblyai.com/v3/ws?sample_rate=16000&punctuate=true&format_turns=true&itn=true&end_of_turn_confidence_threshold=0.7&min_end_of_turn_silence_when_confident=400&max_turn_silence=1500"
        );
    }

    #[test]
    fn test_upstream_url_replaces_relay_owned_params_on_base() {
        let thresholds = Thresholds {
            min_silence_ms: 400,
            max_silence_ms: 1500,
            end_of_turn_confidence: 0.7,
        };
        let base = Url::parse("ws://localhost:9000/ws?region=eu&max_turn_silence=1").unwrap();
        let url = upstream_url(&base, 8000, &thresholds);
        let pairs = query_map(&url);

        assert_eq!(pairs[0], ("region".to_string(), "eu".to_string()));
        assert_eq!(
            pairs
                .iter()
                .filter(|(k, _)| k == "max_turn_silence")
                .collect::<Vec<_>>(),
            vec![&("max_turn_silence".to_string(), "1500".to_string())]
        );
    }

    #[test]
    fn test_resolve_ignores_client_threshold_overrides() {
        let config = config_with(raw(Some("400"), Some("1500"), Some("0.7")), Some("key"));
        let query = ClientQuery::parse(Some(
            "sample_rate=24000&min_silence=1&max_silence=2&end_of_turn=0.01",
        ));

        let settings = SessionSettings::resolve(&config, &query).unwrap();
        let pairs = query_map(&settings.upstream_url);
        let get = |name: &str| {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };

        assert_eq!(settings.sample_rate, 24000);
        assert_eq!(get("sample_rate").as_deref(), Some("24000"));
        assert_eq!(get("min_end_of_turn_silence_when_confident").as_deref(), Some("400"));
        assert_eq!(get("max_turn_silence").as_deref(), Some("1500"));
        assert_eq!(get("end_of_turn_confidence_threshold").as_deref(), Some("0.7"));
        assert_eq!(get("min_silence"), None);
    }

    #[test]
    fn test_resolve_fails_on_missing_thresholds_before_api_key() {
        let config = config_with(raw(None, None, None), None);
        assert!(matches!(
            SessionSettings::resolve(&config, &ClientQuery::default()),
            Err(SessionError::MissingThresholds)
        ));
    }

    #[test]
    fn test_api_key_required() {
        let config = config_with(RawThresholds::default(), None);
        assert!(matches!(api_key(&config), Err(SessionError::MissingApiKey)));

        let config = config_with(RawThresholds::default(), Some("key"));
        assert!(api_key(&config).is_ok());
    }
}
