//! Locate -> probe -> enumerate -> stream, strictly in order. Each stage only
//! runs when the previous one produced something.

use bridge_core::{DebugEndpoint, ProcessHandle, TargetDescriptor};
use log_stream::{StreamOptions, StreamOutcome};
use port_probe::{ProbeMode, ProbeOptions};
use process_locate::ProcessHints;
use serde::Serialize;
use std::time::Duration;
use target_enum::RelevancePolicy;

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Process,
    Port,
    Targets,
    Events,
}

impl Stage {
    pub fn headline(&self) -> &'static str {
        match self {
            Stage::Process => "devtools is not running",
            Stage::Port => "debug port is not open",
            Stage::Targets => "no relevant debug targets",
            Stage::Events => "no console output captured",
        }
    }

    pub fn remedy(&self) -> &'static str {
        match self {
            Stage::Process => "start the devtools application and open the project",
            Stage::Port => "enable the debugger: Settings > General > enable the Chrome debugger, then restart the tool",
            Stage::Targets => "open the project in the tool so a debuggable page exists, or widen the relevance substrings",
            Stage::Events => "trigger some actions in the app and re-run `devbridge logs`",
        }
    }
}

/// How far to run the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Endpoint,
    Targets,
    Events,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub hints: ProcessHints,
    pub skip_process: bool,
    /// Upper bound on the process-table scan; expiry counts as not found.
    pub locate_timeout: Duration,
    pub ports: Vec<u16>,
    pub probe: ProbeOptions,
    pub relevance: RelevancePolicy,
    /// Bypass the relevance filter.
    pub all_targets: bool,
    pub fetch_timeout: Duration,
    pub stream: StreamOptions,
    pub target_id: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            hints: ProcessHints::default(),
            skip_process: false,
            locate_timeout: Duration::from_secs(5),
            ports: port_probe::default_candidate_ports(),
            probe: ProbeOptions::default(),
            relevance: RelevancePolicy::default(),
            all_targets: false,
            fetch_timeout: Duration::from_secs(5),
            stream: StreamOptions::default(),
            target_id: None,
        }
    }
}

impl Settings {
    /// Defaults overlaid with whatever the config file sets.
    pub fn from_config(cfg: Option<&Config>) -> anyhow::Result<Self> {
        let mut s = Settings::default();
        let Some(cfg) = cfg else { return Ok(s) };
        if let Some(h) = &cfg.host { s.probe.host = h.clone(); }
        if let Some(p) = &cfg.ports { s.ports = port_probe::parse_ports(p)?; }
        if let Some(t) = cfg.probe_timeout_ms { s.probe.timeout_per_attempt = Duration::from_millis(t); }
        if let Some(m) = cfg.probe_mode { s.probe.mode = m; }
        if let Some(t) = cfg.fetch_timeout_ms { s.fetch_timeout = Duration::from_millis(t); }
        if let Some(t) = cfg.locate_timeout_ms { s.locate_timeout = Duration::from_millis(t); }
        if let Some(h) = &cfg.process { s.hints = h.clone(); }
        if let Some(r) = &cfg.relevance { s.relevance = r.clone(); }
        if let Some(o) = &cfg.stream { s.stream = o.clone(); }
        Ok(s)
    }

    pub fn tcp_only(mut self, yes: bool) -> Self {
        if yes { self.probe.mode = ProbeMode::TcpOnly; }
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineRun {
    pub process: Option<ProcessHandle>,
    #[serde(skip)]
    pub endpoint: Option<DebugEndpoint>,
    pub targets: Vec<TargetDescriptor>,
    pub stream: Option<StreamOutcome>,
    pub stopped_at: Option<Stage>,
}

impl PipelineRun {
    fn stop(mut self, stage: Stage) -> Self {
        log::info!("pipeline stopped: {}", stage.headline());
        self.stopped_at = Some(stage);
        self
    }

    pub fn port(&self) -> Option<u16> {
        self.endpoint.as_ref().map(|e| e.port)
    }
}

/// The target to stream from: the requested id, else the first one that can
/// be streamed.
pub fn select_target<'a>(targets: &'a [TargetDescriptor], wanted: Option<&str>) -> Option<&'a TargetDescriptor> {
    match wanted {
        Some(id) => targets.iter().find(|t| t.id == id),
        None => targets.iter().find(|t| t.is_streamable()),
    }
}

async fn locate_live(hints: ProcessHints) -> Option<ProcessHandle> {
    match tokio::task::spawn_blocking(move || process_locate::locate(&hints)).await {
        Ok(p) => p,
        Err(e) => {
            log::error!("process scan aborted: {}", e);
            None
        }
    }
}

pub async fn run(settings: &Settings, depth: Depth) -> PipelineRun {
    let hints = settings.hints.clone();
    run_with(settings, depth, move || locate_live(hints)).await
}

/// Same as [`run`] with the process scan supplied by the caller.
pub async fn run_with<L, F>(settings: &Settings, depth: Depth, locate: L) -> PipelineRun
where
    L: FnOnce() -> F,
    F: std::future::Future<Output = Option<ProcessHandle>>,
{
    let mut out = PipelineRun::default();

    if !settings.skip_process {
        out.process = match tokio::time::timeout(settings.locate_timeout, locate()).await {
            Ok(p) => p,
            Err(_) => {
                log::warn!("process scan did not finish within {:?}, treating as not running", settings.locate_timeout);
                None
            }
        };
        if out.process.is_none() {
            return out.stop(Stage::Process);
        }
    }

    out.endpoint = port_probe::probe(&settings.ports, &settings.probe).await;
    let Some(endpoint) = out.endpoint.clone() else { return out.stop(Stage::Port) };
    if depth == Depth::Endpoint {
        return out;
    }

    out.targets = if settings.all_targets {
        target_enum::enumerate_all(&endpoint, settings.fetch_timeout).await
    } else {
        target_enum::enumerate(&endpoint, |t| settings.relevance.is_relevant(t), settings.fetch_timeout).await
    };
    if out.targets.is_empty() {
        return out.stop(Stage::Targets);
    }
    if depth == Depth::Targets {
        return out;
    }

    let Some(target) = select_target(&out.targets, settings.target_id.as_deref()).cloned() else {
        if let Some(id) = &settings.target_id {
            log::warn!("no relevant target with id {}", id);
        }
        return out.stop(Stage::Targets);
    };
    let outcome = log_stream::stream(&target, &settings.stream).await;
    let empty = outcome.events.is_empty();
    out.stream = Some(outcome);
    if empty {
        return out.stop(Stage::Events);
    }
    out
}
