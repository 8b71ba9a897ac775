//! Time-bounded console/log listener over a target's debugger WebSocket.
//!
//! The protocol has no end-of-burst marker, so a session ends on whichever
//! comes first: `idle_bound` consecutive receive timeouts, `cap` events, or
//! the overall `window_ms`. Worst case against a silent peer is roughly
//! `connect_timeout + idle_bound * receive_timeout`.

use bridge_core::{Fault, LogEvent, TargetDescriptor};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;

pub mod event;
pub mod session;

pub use session::{Budget, Phase, SessionEnd, StopReason, StreamSession};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOptions {
    pub connect_timeout_ms: u64,
    pub receive_timeout_ms: u64,
    pub idle_bound: u32,
    pub cap: usize,
    /// Hard ceiling on listening time for peers that never go quiet.
    pub window_ms: u64,
    /// Evaluated once after enabling, e.g. `console.log('devbridge attached')`.
    pub probe_expression: Option<String>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        StreamOptions {
            connect_timeout_ms: 5000,
            receive_timeout_ms: 1000,
            idle_bound: 3,
            cap: 50,
            window_ms: 30_000,
            probe_expression: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamOutcome {
    pub target_id: String,
    pub events: Vec<LogEvent>,
    pub stop: StopReason,
    /// Session phases passed through, in order.
    pub phases: Vec<Phase>,
    #[serde(skip_serializing_if = "Option::is_none", serialize_with = "fault_as_string")]
    pub fault: Option<Fault>,
}

fn fault_as_string<S: serde::Serializer>(f: &Option<Fault>, s: S) -> Result<S::Ok, S::Error> {
    match f {
        Some(f) => s.serialize_str(&f.to_string()),
        None => s.serialize_none(),
    }
}

impl StreamOutcome {
    fn failed(target: &TargetDescriptor, fault: Fault) -> Self {
        StreamOutcome {
            target_id: target.id.clone(),
            events: Vec::new(),
            stop: StopReason::ConnectFailed,
            phases: vec![Phase::Connecting],
            fault: Some(fault),
        }
    }

    /// The newest `n` events, oldest first.
    pub fn last(&self, n: usize) -> &[LogEvent] {
        &self.events[self.events.len().saturating_sub(n)..]
    }
}

/// Open one session to `target`, enable the console domains, listen within
/// the bounds and close. No retries: a failed connect is reported in `fault`.
pub async fn stream(target: &TargetDescriptor, opts: &StreamOptions) -> StreamOutcome {
    if !target.is_streamable() {
        return StreamOutcome::failed(target, Fault::Configuration(format!("target {:?} has no stream address", target.id)));
    }
    log::debug!("connecting to {}", target.stream_address);
    let conn = match timeout(Duration::from_millis(opts.connect_timeout_ms), connect_async(target.stream_address.as_str())).await {
        Ok(Ok((ws, _resp))) => ws,
        Ok(Err(e)) => {
            log::warn!("connect to {} failed: {}", target.stream_address, e);
            return StreamOutcome::failed(target, Fault::transport(e));
        }
        Err(_) => {
            log::warn!("connect to {} timed out", target.stream_address);
            return StreamOutcome::failed(target, Fault::Transport(format!("connect timed out after {} ms", opts.connect_timeout_ms)));
        }
    };
    let end = StreamSession::new(conn, target.id.clone()).run(opts).await;
    if let Some(f) = &end.fault {
        log::warn!("stream from {} ended early: {}", target.id, f);
    }
    StreamOutcome { target_id: target.id.clone(), events: end.events, stop: end.stop, phases: end.phases, fault: end.fault }
}
