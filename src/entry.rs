//! Log entry model and severity classification.
//!
//! Every line read from a source becomes one immutable [`LogEntry`]. Severity is
//! never supplied by the source; it is derived from the message text.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SourceDescriptor;

/// Static per-source tags attached to every entry (environment, service, ...).
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Keyword groups checked in order; the first group with a hit wins.
const KEYWORD_GROUPS: &[(&[&str], Severity)] = &[
    (&["error", "fail"], Severity::Error),
    (&["warn"], Severity::Warning),
    (&["crit", "alert"], Severity::Critical),
    (&["debug"], Severity::Debug),
];

/// Severity tag assigned to a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a message by case-insensitive keyword match.
///
/// Groups are checked in a fixed order, so a line mentioning both "warn" and
/// "error" is an error. Anything without a keyword is `info`.
pub fn classify(message: &str) -> Severity {
    let lowered = message.to_lowercase();
    KEYWORD_GROUPS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| lowered.contains(k)))
        .map(|(_, severity)| *severity)
        .unwrap_or(Severity::Info)
}

/// Format an instant as ISO-8601 UTC with microseconds and a trailing `Z`.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) mod iso8601 {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_timestamp(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

/// One observed log line plus its metadata.
///
/// The message is never empty or whitespace-only; constructors return `None`
/// for such lines instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Instant the line was observed
    #[serde(with = "iso8601")]
    pub timestamp: DateTime<Utc>,

    /// Machine or process that produced the line
    pub host: String,

    /// Logical name of the originating stream
    pub source: String,

    /// Derived severity
    pub severity: Severity,

    /// Line content with trailing whitespace removed
    pub message: String,

    /// Static tags from the source configuration
    #[serde(default)]
    pub fields: Fields,
}

impl LogEntry {
    /// Build an entry observed now. Returns `None` for blank messages.
    pub fn new(
        host: impl Into<String>,
        source: impl Into<String>,
        message: &str,
        fields: Fields,
    ) -> Option<Self> {
        let message = message.trim_end();
        if message.is_empty() {
            return None;
        }

        Some(Self {
            timestamp: Utc::now(),
            host: host.into(),
            source: source.into(),
            severity: classify(message),
            message: message.to_string(),
            fields,
        })
    }

    /// Build an entry from raw line bytes read from `descriptor`'s stream.
    ///
    /// Invalid UTF-8 is replaced rather than rejected.
    pub fn from_line(raw: &[u8], descriptor: &SourceDescriptor) -> Option<Self> {
        let text = String::from_utf8_lossy(raw);
        Self::new(
            descriptor.host.as_str(),
            descriptor.name.as_str(),
            &text,
            descriptor.fields.clone(),
        )
    }
}
