//! Find the remote-debugging port: TCP connect test, then confirm the listener
//! speaks the discovery protocol.

use anyhow::{anyhow, Result};
use bridge_core::DebugEndpoint;
use reqwest::header::CONNECTION;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::timeout;

/// Path answered by a discovery endpoint with a small version object.
pub const VERSION_PATH: &str = "/json/version";

/// Parse a comma-separated list of ports/ranges (e.g. "9222,9223" or "9222-9225,8080").
/// Order is priority: the first occurrence of a port keeps its position.
pub fn parse_ports(spec: &str) -> Result<Vec<u16>> {
    let mut ports: Vec<u16> = Vec::new();
    let mut push = |p: u16| if !ports.contains(&p) { ports.push(p) };
    for part in spec.split(',').map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let s: u16 = start.trim().parse()?;
            let e: u16 = end.trim().parse()?;
            if s == 0 || e == 0 || s > e {
                return Err(anyhow!("invalid port range: {}", part));
            }
            for p in s..=e { push(p); }
        } else {
            let p: u16 = part.parse()?;
            if p == 0 {
                return Err(anyhow!("invalid port: {}", part));
            }
            push(p);
        }
    }
    Ok(ports)
}

/// Default protocol port first, then the usual alternates.
pub fn default_candidate_ports() -> Vec<u16> { vec![9222, 9223, 9224, 9225] }

/// Wider list used by the open-port sweep (dev servers often sit on 8080/3000).
pub fn sweep_ports() -> Vec<u16> { vec![9222, 9223, 9224, 9225, 8080, 3000] }

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeMode {
    /// An open TCP port is enough.
    TcpOnly,
    /// Open port plus a 2xx answer on `/json/version`.
    #[default]
    Confirmed,
}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub host: String,
    pub timeout_per_attempt: Duration,
    pub mode: ProbeMode,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions { host: "127.0.0.1".into(), timeout_per_attempt: Duration::from_secs(2), mode: ProbeMode::Confirmed }
    }
}

/// HTTP client for talking to local debug endpoints. Proxies are bypassed,
/// they would never route to loopback. Nothing is pooled: every probe
/// connection is closed as soon as its response is in.
pub fn http_client(request_timeout: Duration) -> Result<Client> {
    let client = Client::builder()
        .timeout(request_timeout)
        .connect_timeout(request_timeout)
        .pool_max_idle_per_host(0)
        .no_proxy()
        .user_agent(format!("devbridge/{}", bridge_core::version()))
        .build()?;
    Ok(client)
}

/// Connect test. Refused and timed-out attempts are an ordinary "closed";
/// anything else is logged and also reported as closed.
pub async fn tcp_open(host: &str, port: u16, per_attempt: Duration) -> bool {
    match timeout(per_attempt, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            drop(stream);
            true
        }
        Ok(Err(e)) if matches!(e.kind(), ErrorKind::ConnectionRefused | ErrorKind::TimedOut | ErrorKind::AddrNotAvailable) => {
            log::debug!("{}:{} closed ({})", host, port, e);
            false
        }
        Ok(Err(e)) => {
            log::warn!("{}:{} unexpected connect error: {}", host, port, e);
            false
        }
        Err(_) => {
            log::debug!("{}:{} connect timed out", host, port);
            false
        }
    }
}

/// GET `/json/version` and require a success status.
pub async fn confirm(client: &Client, host: &str, port: u16) -> Result<bool> {
    let url = format!("http://{}:{}{}", host, port, VERSION_PATH);
    let resp = client.get(&url).header(CONNECTION, "close").send().await?;
    let status = resp.status();
    log::debug!("{} -> {}", url, status);
    drop(resp);
    Ok(status.is_success())
}

async fn probe_port(client: Option<&Client>, port: u16, opts: &ProbeOptions) -> bool {
    if !tcp_open(&opts.host, port, opts.timeout_per_attempt).await {
        return false;
    }
    let client = match (opts.mode, client) {
        (ProbeMode::TcpOnly, _) => return true,
        (ProbeMode::Confirmed, Some(c)) => c,
        (ProbeMode::Confirmed, None) => return false,
    };
    match confirm(client, &opts.host, port).await {
        Ok(ok) => ok,
        Err(e) => {
            log::warn!("{}:{} open but discovery confirmation failed: {}", opts.host, port, e);
            false
        }
    }
}

/// Try each port in order and stop at the first confirmed one; later ports
/// are never touched.
pub async fn probe(ports: &[u16], opts: &ProbeOptions) -> Option<DebugEndpoint> {
    let client = match opts.mode {
        ProbeMode::TcpOnly => None,
        ProbeMode::Confirmed => match http_client(opts.timeout_per_attempt) {
            Ok(c) => Some(c),
            Err(e) => {
                log::error!("cannot build http client: {}", e);
                return None;
            }
        },
    };
    for &port in ports {
        if probe_port(client.as_ref(), port, opts).await {
            log::info!("debug endpoint confirmed on {}:{}", opts.host, port);
            return Some(DebugEndpoint::confirmed(opts.host.clone(), port));
        }
    }
    log::info!("no debug endpoint among {} candidate ports", ports.len());
    None
}

/// Connect-test every port concurrently and return the open ones in
/// candidate order.
pub async fn sweep_open(host: &str, ports: &[u16], per_attempt: Duration, concurrency: usize) -> Vec<u16> {
    let sem = Arc::new(Semaphore::new(concurrency.max(1)));
    let (tx, mut rx) = mpsc::channel::<u16>(ports.len().max(1));

    for &port in ports {
        let tx = tx.clone();
        let sem = sem.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else { return };
            if tcp_open(&host, port, per_attempt).await {
                let _ = tx.send(port).await;
            }
        });
    }
    drop(tx);

    let mut open = Vec::new();
    while let Some(p) = rx.recv().await {
        open.push(p);
    }
    open.sort_by_key(|p| ports.iter().position(|c| c == p));
    open
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP responder answering every request with the same status/body.
    async fn http_stub(status: &'static str, body: &'static str) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = sock.read(&mut buf).await;
                    let resp = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status, body.len(), body
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        (port, hits)
    }

    /// Keep-alive responder answering 404 to every request on a connection;
    /// `released` flips once a connection that carried a request is closed
    /// by the client.
    async fn keep_alive_404() -> (u16, Arc<AtomicBool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let released = Arc::new(AtomicBool::new(false));
        let flag = released.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let flag = flag.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let mut served = false;
                    loop {
                        match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(_) => {
                                served = true;
                                let resp = "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: keep-alive\r\n\r\n";
                                if sock.write_all(resp.as_bytes()).await.is_err() { break; }
                            }
                        }
                    }
                    if served { flag.store(true, Ordering::SeqCst); }
                });
            }
        });
        (port, released)
    }

    fn unused_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    fn opts() -> ProbeOptions {
        ProbeOptions { timeout_per_attempt: Duration::from_millis(500), ..ProbeOptions::default() }
    }

    #[test]
    fn parse_keeps_priority_order() {
        assert_eq!(parse_ports("9223,9222,9223").unwrap(), vec![9223, 9222]);
        assert_eq!(parse_ports("9224-9225, 3000").unwrap(), vec![9224, 9225, 3000]);
    }

    #[test]
    fn parse_rejects_invalid() {
        assert!(parse_ports("0").is_err());
        assert!(parse_ports("10-5").is_err());
        assert!(parse_ports("http").is_err());
    }

    #[tokio::test]
    async fn returns_first_confirmed_and_skips_the_rest() {
        let closed = unused_port();
        let (b, _) = http_stub("200 OK", r#"{"Browser":"Chrome/120"}"#).await;
        let (c, c_hits) = http_stub("200 OK", r#"{"Browser":"Chrome/120"}"#).await;
        let ep = probe(&[closed, b, c], &opts()).await.expect("endpoint");
        assert_eq!(ep.port, b);
        assert_eq!(c_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn open_port_without_discovery_is_not_enough() {
        let (wrong, _) = http_stub("404 Not Found", "").await;
        let (right, _) = http_stub("200 OK", "{}").await;
        let ep = probe(&[wrong, right], &opts()).await.expect("endpoint");
        assert_eq!(ep.port, right);
    }

    #[tokio::test]
    async fn rejected_port_is_released_before_the_next_one() {
        let (a, a_released) = keep_alive_404().await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b = listener.local_addr().unwrap().port();
        let seen = Arc::new(AtomicBool::new(false));
        let record = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                let a_released = a_released.clone();
                let record = record.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    if sock.read(&mut buf).await.unwrap_or(0) == 0 { return; }
                    // give the client a moment to drop A's socket, but never wait on it
                    for _ in 0..50 {
                        if a_released.load(Ordering::SeqCst) { break; }
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                    record.store(a_released.load(Ordering::SeqCst), Ordering::SeqCst);
                    let resp = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{}";
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });
        let o = ProbeOptions { timeout_per_attempt: Duration::from_secs(2), ..opts() };
        let ep = probe(&[a, b], &o).await.expect("endpoint");
        assert_eq!(ep.port, b);
        assert!(seen.load(Ordering::SeqCst), "socket to {} still open while probing {}", a, b);
    }

    #[tokio::test]
    async fn tcp_only_accepts_any_listener() {
        let (wrong, _) = http_stub("404 Not Found", "").await;
        let o = ProbeOptions { mode: ProbeMode::TcpOnly, ..opts() };
        assert_eq!(probe(&[wrong], &o).await.map(|e| e.port), Some(wrong));
    }

    #[tokio::test]
    async fn nothing_listening_is_none() {
        let ports = [unused_port(), unused_port()];
        assert!(probe(&ports, &opts()).await.is_none());
        assert!(probe(&[], &opts()).await.is_none());
    }

    #[tokio::test]
    async fn sweep_reports_open_ports_in_candidate_order() {
        let (a, _) = http_stub("200 OK", "{}").await;
        let (b, _) = http_stub("200 OK", "{}").await;
        let closed = unused_port();
        let open = sweep_open("127.0.0.1", &[b, closed, a], Duration::from_millis(500), 4).await;
        assert_eq!(open, vec![b, a]);
    }
}
