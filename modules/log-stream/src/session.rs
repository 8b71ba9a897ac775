//! One open connection to one target: Enabling -> Listening -> Closing.

use crate::event::{classify, Inbound};
use crate::StreamOptions;
use bridge_core::{Fault, LogEvent};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Connecting,
    Enabling,
    Listening,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    /// Connection never opened.
    ConnectFailed,
    /// `idle_bound` consecutive receive timeouts.
    IdleBound,
    CapReached,
    /// Total listening window elapsed while the peer kept talking.
    WindowElapsed,
    PeerClosed,
    TransportFault,
}

/// The two independent exit counters of the listening loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Budget {
    pub idle: u32,
    pub idle_bound: u32,
    pub events: usize,
    pub cap: usize,
}

impl Budget {
    pub fn new(idle_bound: u32, cap: usize) -> Self {
        Budget { idle: 0, idle_bound, events: 0, cap }
    }

    /// Any inbound frame breaks an idle streak.
    pub fn on_message(&mut self) {
        self.idle = 0;
    }

    pub fn on_event(&mut self) {
        self.events += 1;
    }

    pub fn on_timeout(&mut self) {
        self.idle += 1;
    }

    pub fn exhausted(&self) -> Option<StopReason> {
        if self.events >= self.cap {
            return Some(StopReason::CapReached);
        }
        if self.idle >= self.idle_bound {
            return Some(StopReason::IdleBound);
        }
        None
    }
}

#[derive(Serialize)]
struct Command<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// Domain subscriptions sent right after connecting, plus an optional
/// evaluation that makes the target print something.
pub fn enable_commands(probe_expression: Option<&str>) -> Vec<String> {
    let mut cmds = vec![
        Command { id: 1, method: "Runtime.enable", params: None },
        Command { id: 2, method: "Console.enable", params: None },
    ];
    if let Some(expr) = probe_expression.filter(|e| !e.is_empty()) {
        cmds.push(Command { id: 3, method: "Runtime.evaluate", params: Some(serde_json::json!({ "expression": expr })) });
    }
    cmds.iter().filter_map(|c| serde_json::to_string(c).ok()).collect()
}

/// Read frames until one of the budget counters trips, the window elapses or
/// the peer goes away. Events are kept in arrival order.
pub async fn listen<S>(source: &mut S, opts: &StreamOptions, events: &mut Vec<LogEvent>) -> (StopReason, Option<Fault>)
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let mut budget = Budget::new(opts.idle_bound, opts.cap);
    let per_receive = Duration::from_millis(opts.receive_timeout_ms);
    let deadline = Instant::now() + Duration::from_millis(opts.window_ms);

    loop {
        if let Some(reason) = budget.exhausted() {
            return (reason, None);
        }
        if Instant::now() >= deadline {
            return (StopReason::WindowElapsed, None);
        }
        let frame = match timeout(per_receive, source.next()).await {
            Err(_) => {
                budget.on_timeout();
                continue;
            }
            Ok(None) => return (StopReason::PeerClosed, None),
            Ok(Some(Err(e))) => return (StopReason::TransportFault, Some(Fault::transport(e))),
            Ok(Some(Ok(frame))) => frame,
        };
        budget.on_message();
        let text = match frame {
            Message::Text(t) => t,
            Message::Binary(b) => String::from_utf8_lossy(&b).into_owned(),
            Message::Close(_) => return (StopReason::PeerClosed, None),
            _ => continue,
        };
        match classify(&text) {
            Inbound::Event(ev) => {
                events.push(ev);
                budget.on_event();
            }
            Inbound::Other => {}
            Inbound::Malformed => log::debug!("ignoring non-JSON frame ({} bytes)", text.len()),
        }
    }
}

/// How a session ended, with the phases it went through in order.
#[derive(Debug)]
pub struct SessionEnd {
    pub events: Vec<LogEvent>,
    pub stop: StopReason,
    pub fault: Option<Fault>,
    pub phases: Vec<Phase>,
}

/// Owns the connection for its whole life; `run` consumes the session so the
/// connection is closed exactly once whichever way listening ends.
pub struct StreamSession<C> {
    conn: C,
    phases: Vec<Phase>,
    target_id: String,
}

impl<C> StreamSession<C>
where
    C: Stream<Item = Result<Message, WsError>> + Sink<Message, Error = WsError> + Unpin,
{
    pub fn new(conn: C, target_id: impl Into<String>) -> Self {
        StreamSession { conn, phases: vec![Phase::Connecting], target_id: target_id.into() }
    }

    fn enter(&mut self, next: Phase) {
        log::trace!("session {}: {:?}", self.target_id, next);
        self.phases.push(next);
    }

    async fn enable(&mut self, probe_expression: Option<&str>) -> Result<(), Fault> {
        self.enter(Phase::Enabling);
        for cmd in enable_commands(probe_expression) {
            self.conn.feed(Message::Text(cmd)).await.map_err(Fault::transport)?;
        }
        self.conn.flush().await.map_err(Fault::transport)
    }

    pub async fn run(mut self, opts: &StreamOptions) -> SessionEnd {
        let mut events = Vec::new();
        let (stop, fault) = match self.enable(opts.probe_expression.as_deref()).await {
            Ok(()) => {
                self.enter(Phase::Listening);
                listen(&mut self.conn, opts, &mut events).await
            }
            Err(f) => (StopReason::TransportFault, Some(f)),
        };
        self.enter(Phase::Closing);
        if let Err(e) = self.conn.close().await {
            log::debug!("closing session for {}: {}", self.target_id, e);
        }
        log::info!("session {} ended ({:?}) with {} events", self.target_id, stop, events.len());
        SessionEnd { events, stop, fault, phases: self.phases }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};

    /// In-memory connection: yields `inbound` then stays pending, records
    /// sent frames, counts `close` calls, and can refuse every send.
    struct FakeConn {
        inbound: VecDeque<Result<Message, WsError>>,
        sent: Vec<String>,
        refuse_sends: bool,
        closes: Arc<AtomicUsize>,
    }

    impl FakeConn {
        fn new(inbound: Vec<Result<Message, WsError>>) -> (Self, Arc<AtomicUsize>) {
            let closes = Arc::new(AtomicUsize::new(0));
            (FakeConn { inbound: inbound.into(), sent: Vec::new(), refuse_sends: false, closes: closes.clone() }, closes)
        }
    }

    impl Stream for FakeConn {
        type Item = Result<Message, WsError>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.inbound.pop_front() {
                Some(item) => Poll::Ready(Some(item)),
                None => Poll::Pending,
            }
        }
    }

    impl Sink<Message> for FakeConn {
        type Error = WsError;

        fn poll_ready(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            if self.refuse_sends {
                Poll::Ready(Err(WsError::AlreadyClosed))
            } else {
                Poll::Ready(Ok(()))
            }
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), WsError> {
            if let Message::Text(t) = item {
                self.sent.push(t);
            }
            Ok(())
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), WsError>> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Poll::Ready(Ok(()))
        }
    }

    fn opts(idle_bound: u32, cap: usize) -> StreamOptions {
        StreamOptions { receive_timeout_ms: 30, idle_bound, cap, ..StreamOptions::default() }
    }

    fn console(text: &str) -> Result<Message, WsError> {
        Ok(Message::Text(format!(
            r#"{{"method":"Runtime.consoleAPICalled","params":{{"type":"log","args":[{{"type":"string","value":"{}"}}]}}}}"#,
            text
        )))
    }

    #[test]
    fn budget_counters_are_independent() {
        let mut b = Budget::new(3, 2);
        b.on_timeout();
        b.on_timeout();
        assert_eq!(b.exhausted(), None);
        b.on_message();
        b.on_timeout();
        b.on_timeout();
        assert_eq!(b.exhausted(), None);
        b.on_timeout();
        assert_eq!(b.exhausted(), Some(StopReason::IdleBound));

        let mut b = Budget::new(3, 2);
        b.on_event();
        b.on_event();
        assert_eq!(b.exhausted(), Some(StopReason::CapReached));
    }

    #[test]
    fn zero_cap_stops_immediately() {
        assert_eq!(Budget::new(3, 0).exhausted(), Some(StopReason::CapReached));
    }

    #[test]
    fn enable_sequence() {
        let cmds = enable_commands(None);
        assert_eq!(cmds, vec![r#"{"id":1,"method":"Runtime.enable"}"#, r#"{"id":2,"method":"Console.enable"}"#]);
        let cmds = enable_commands(Some("console.log('hi')"));
        assert_eq!(cmds.len(), 3);
        assert!(cmds[2].contains(r#""method":"Runtime.evaluate""#));
        assert_eq!(enable_commands(Some("")).len(), 2);
    }

    #[tokio::test]
    async fn two_events_then_silence() {
        let mut src = stream::iter(vec![console("a"), console("b")]).chain(stream::pending());
        let mut events = Vec::new();
        let started = std::time::Instant::now();
        let (stop, fault) = listen(&mut src, &opts(3, 50), &mut events).await;
        assert_eq!(stop, StopReason::IdleBound);
        assert!(fault.is_none());
        assert_eq!(events.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn cap_bounds_collected_events() {
        let frames: Vec<_> = (0..10).map(|i| console(&i.to_string())).collect();
        let mut src = stream::iter(frames).chain(stream::pending());
        let mut events = Vec::new();
        let (stop, _) = listen(&mut src, &opts(3, 4), &mut events).await;
        assert_eq!(stop, StopReason::CapReached);
        assert_eq!(events.len(), 4);
        assert_eq!(events[3].text, "3");
    }

    #[tokio::test]
    async fn noise_does_not_count_as_events() {
        let frames = vec![
            Ok(Message::Text(r#"{"id":1,"result":{}}"#.into())),
            Ok(Message::Text("not json".into())),
            Ok(Message::Ping(vec![1])),
            console("only"),
        ];
        let mut src = stream::iter(frames).chain(stream::pending());
        let mut events = Vec::new();
        listen(&mut src, &opts(2, 50), &mut events).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn end_of_stream_and_errors() {
        let mut src = stream::iter(vec![console("x")]);
        let mut events = Vec::new();
        assert_eq!(listen(&mut src, &opts(3, 50), &mut events).await.0, StopReason::PeerClosed);

        let mut src = stream::iter(vec![console("x"), Err(WsError::ConnectionClosed)]);
        let mut events = Vec::new();
        let (stop, fault) = listen(&mut src, &opts(3, 50), &mut events).await;
        assert_eq!(stop, StopReason::TransportFault);
        assert!(matches!(fault, Some(Fault::Transport(_))));
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn idle_session_walks_every_phase_and_closes_once() {
        let (conn, closes) = FakeConn::new(vec![console("a")]);
        let end = StreamSession::new(conn, "T").run(&opts(2, 50)).await;
        assert_eq!(end.stop, StopReason::IdleBound);
        assert_eq!(end.events.len(), 1);
        assert_eq!(end.phases, vec![Phase::Connecting, Phase::Enabling, Phase::Listening, Phase::Closing]);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_enable_still_closes_once() {
        let (mut conn, closes) = FakeConn::new(vec![console("never read")]);
        conn.refuse_sends = true;
        let end = StreamSession::new(conn, "T").run(&opts(2, 50)).await;
        assert_eq!(end.stop, StopReason::TransportFault);
        assert!(matches!(end.fault, Some(Fault::Transport(_))));
        assert!(end.events.is_empty());
        assert_eq!(end.phases, vec![Phase::Connecting, Phase::Enabling, Phase::Closing]);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_error_mid_listen_closes_once() {
        let (conn, closes) = FakeConn::new(vec![console("kept"), Err(WsError::ConnectionClosed), console("lost")]);
        let end = StreamSession::new(conn, "T").run(&opts(2, 50)).await;
        assert_eq!(end.stop, StopReason::TransportFault);
        assert!(matches!(end.fault, Some(Fault::Transport(_))));
        assert_eq!(end.events.iter().map(|e| e.text.as_str()).collect::<Vec<_>>(), vec!["kept"]);
        assert_eq!(end.phases.last(), Some(&Phase::Closing));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cap_and_peer_close_each_close_once() {
        let (conn, closes) = FakeConn::new(vec![console("1"), console("2"), console("3")]);
        let end = StreamSession::new(conn, "T").run(&opts(2, 2)).await;
        assert_eq!(end.stop, StopReason::CapReached);
        assert_eq!(closes.load(Ordering::SeqCst), 1);

        let (conn, closes) = FakeConn::new(vec![console("1"), Ok(Message::Close(None))]);
        let end = StreamSession::new(conn, "T").run(&opts(2, 50)).await;
        assert_eq!(end.stop, StopReason::PeerClosed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn chatty_peer_is_cut_by_window() {
        let noise = stream::repeat_with(|| Ok(Message::Text(r#"{"method":"Network.dataReceived","params":{}}"#.into())))
            .then(|m| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                m
            });
        let mut src = Box::pin(noise);
        let mut events = Vec::new();
        let o = StreamOptions { window_ms: 150, ..opts(3, 50) };
        let (stop, _) = listen(&mut src, &o, &mut events).await;
        assert_eq!(stop, StopReason::WindowElapsed);
        assert!(events.is_empty());
    }
}
