//! Shared data model for the devtools bridge: what each pipeline stage hands
//! to the next.

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub mod error;

pub use error::Fault;

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| String::new())
}

/// Snapshot of one OS process. May be stale as soon as it is taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessHandle {
    pub pid: u32,
    pub name: String,
    pub command_line: Vec<String>,
}

impl ProcessHandle {
    pub fn joined_command_line(&self) -> String {
        self.command_line.join(" ")
    }
}

/// A port that answered the discovery protocol during this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugEndpoint {
    pub host: String,
    pub port: u16,
    pub confirmed_at: OffsetDateTime,
}

impl DebugEndpoint {
    /// Only the prober should call this, after a confirmed response.
    pub fn confirmed(host: impl Into<String>, port: u16) -> Self {
        DebugEndpoint { host: host.into(), port, confirmed_at: OffsetDateTime::now_utc() }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn discovery_url(&self) -> String {
        format!("{}/json", self.base_url())
    }

    pub fn confirmed_at_rfc3339(&self) -> String {
        self.confirmed_at.format(&Rfc3339).unwrap_or_default()
    }
}

/// One debuggable context as listed by the discovery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetDescriptor {
    #[serde(default, deserialize_with = "null_as_empty")]
    pub id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub url: String,
    #[serde(rename(deserialize = "webSocketDebuggerUrl"), alias = "stream_address", default, deserialize_with = "null_as_empty")]
    pub stream_address: String,
    #[serde(rename = "type", default, deserialize_with = "null_as_empty")]
    pub kind: String,
    #[serde(rename(deserialize = "devtoolsFrontendUrl"), default, skip_serializing_if = "Option::is_none")]
    pub frontend_url: Option<String>,
}

// Endpoints send `null` for fields they have no value for.
fn null_as_empty<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

impl TargetDescriptor {
    pub fn is_streamable(&self) -> bool {
        !self.stream_address.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Warn,
    Error,
    Unknown,
}

impl LogLevel {
    /// Map a console level/type tag from the wire onto the four levels we keep.
    pub fn from_protocol(tag: &str) -> Self {
        match tag.to_ascii_lowercase().as_str() {
            "log" | "info" | "debug" | "verbose" => LogLevel::Log,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "assert" => LogLevel::Error,
            _ => LogLevel::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub text: String,
    pub timestamp: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!version().is_empty());
    }

    #[test]
    fn level_mapping() {
        assert_eq!(LogLevel::from_protocol("warning"), LogLevel::Warn);
        assert_eq!(LogLevel::from_protocol("INFO"), LogLevel::Log);
        assert_eq!(LogLevel::from_protocol("assert"), LogLevel::Error);
        assert_eq!(LogLevel::from_protocol("table"), LogLevel::Unknown);
    }

    #[test]
    fn descriptor_reads_wire_names() {
        let raw = r#"{"id":"A1","title":"pages/index","url":"http://127.0.0.1/miniprogram","type":"page",
            "webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/page/A1","devtoolsFrontendUrl":"/devtools/inspector.html"}"#;
        let t: TargetDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(t.kind, "page");
        assert_eq!(t.stream_address, "ws://127.0.0.1:9222/devtools/page/A1");
        assert!(t.is_streamable());
        let out = serde_json::to_value(&t).unwrap();
        assert_eq!(out["type"], "page");
        assert_eq!(out["stream_address"], "ws://127.0.0.1:9222/devtools/page/A1");
    }

    #[test]
    fn descriptor_tolerates_missing_fields() {
        let t: TargetDescriptor = serde_json::from_str(r#"{"title":"unrelated","type":"page"}"#).unwrap();
        assert!(t.id.is_empty());
        assert!(!t.is_streamable());
    }

    #[test]
    fn descriptor_treats_null_as_empty() {
        let raw = r#"{"id":"P","title":null,"url":null,"type":"page","webSocketDebuggerUrl":"ws://127.0.0.1:9222/devtools/page/P"}"#;
        let t: TargetDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(t.id, "P");
        assert!(t.title.is_empty());
        assert!(t.url.is_empty());
        assert!(t.is_streamable());
    }

    #[test]
    fn endpoint_urls() {
        let e = DebugEndpoint::confirmed("127.0.0.1", 9222);
        assert_eq!(e.discovery_url(), "http://127.0.0.1:9222/json");
        assert!(!e.confirmed_at_rfc3339().is_empty());
    }
}
