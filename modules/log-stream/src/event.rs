//! Decoding of inbound protocol messages into `LogEvent`s.

use bridge_core::{LogEvent, LogLevel};
use serde_json::Value;

pub const CONSOLE_API_CALLED: &str = "Runtime.consoleAPICalled";
pub const MESSAGE_ADDED: &str = "Console.messageAdded";
pub const EXCEPTION_THROWN: &str = "Runtime.exceptionThrown";

/// What one inbound text frame turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(LogEvent),
    /// Valid JSON that is not a console event (command replies, other domains).
    Other,
    /// Not JSON at all.
    Malformed,
}

pub fn classify(text: &str) -> Inbound {
    let v: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Inbound::Malformed,
    };
    match parse_event(&v) {
        Some(ev) => Inbound::Event(ev),
        None => Inbound::Other,
    }
}

pub fn parse_event(msg: &Value) -> Option<LogEvent> {
    let params = msg.get("params")?;
    match msg.get("method")?.as_str()? {
        CONSOLE_API_CALLED => Some(LogEvent {
            level: LogLevel::from_protocol(params.get("type").and_then(Value::as_str).unwrap_or("log")),
            text: join_args(params.get("args")),
            timestamp: params.get("timestamp").and_then(Value::as_f64),
        }),
        MESSAGE_ADDED => {
            let m = params.get("message")?;
            Some(LogEvent {
                level: LogLevel::from_protocol(m.get("level").and_then(Value::as_str).unwrap_or("log")),
                text: m.get("text").and_then(Value::as_str).unwrap_or_default().to_string(),
                timestamp: m.get("timestamp").or_else(|| params.get("timestamp")).and_then(Value::as_f64),
            })
        }
        EXCEPTION_THROWN => {
            let details = params.get("exceptionDetails");
            let text = details
                .and_then(|d| d.pointer("/exception/description"))
                .or_else(|| details.and_then(|d| d.get("text")))
                .and_then(Value::as_str)
                .unwrap_or("uncaught exception")
                .to_string();
            Some(LogEvent { level: LogLevel::Error, text, timestamp: params.get("timestamp").and_then(Value::as_f64) })
        }
        _ => None,
    }
}

/// Render console arguments the way a console panel would, space separated.
fn join_args(args: Option<&Value>) -> String {
    let Some(args) = args.and_then(Value::as_array) else { return String::new() };
    args.iter().map(render_arg).collect::<Vec<_>>().join(" ")
}

fn render_arg(arg: &Value) -> String {
    match arg.get("value") {
        Some(Value::String(s)) => return s.clone(),
        Some(Value::Null) | None => {}
        Some(other) => return other.to_string(),
    }
    for key in ["unserializableValue", "description"] {
        if let Some(s) = arg.get(key).and_then(Value::as_str) {
            return s.to_string();
        }
    }
    arg.get("type").and_then(Value::as_str).unwrap_or("undefined").to_string()
}
