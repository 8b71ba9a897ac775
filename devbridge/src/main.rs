use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::future::Future;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

mod config;
mod pipeline;
mod report;

use config::Config;
use pipeline::{Depth, PipelineRun, Settings};
use report::Report;

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum OutputFormat { Text, Json, Jsonl }

#[derive(Debug, Parser)]
#[command(name = "devbridge", version, about = "Find a running devtools instance, its debug port and targets, and read its console")]
struct Cli {
    /// Optional config file (YAML). If omitted, loads ./devbridge.yaml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// More log output on stderr (-v info, -vv debug, -vvv trace). RUST_LOG also applies.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    /// Output format: text, json, or jsonl
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
    /// Exit non-zero when any stage comes back empty
    #[arg(long, global = true, default_value_t = false)]
    strict: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Args)]
struct BridgeArgs {
    /// Host running the debug endpoint
    #[arg(long)]
    host: Option<String>,
    /// Candidate ports in priority order (e.g. 9222,9223 or 9222-9225)
    #[arg(long)]
    ports: Option<String>,
    /// Timeout per probe attempt in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Accept an open TCP port without the /json/version confirmation
    #[arg(long, default_value_t = false)]
    tcp_only: bool,
    /// Probe even when no devtools process is found
    #[arg(long, default_value_t = false)]
    skip_process: bool,
}

impl BridgeArgs {
    fn settings(&self, cfg: Option<&Config>) -> Result<Settings> {
        let mut s = Settings::from_config(cfg)?.tcp_only(self.tcp_only);
        if let Some(h) = &self.host { s.probe.host = h.clone(); }
        if let Some(p) = &self.ports { s.ports = port_probe::parse_ports(p)?; }
        if let Some(t) = self.timeout_ms { s.probe.timeout_per_attempt = Duration::from_millis(t); }
        s.skip_process = self.skip_process;
        if s.ports.is_empty() { return Err(anyhow!("no candidate ports to probe")); }
        Ok(s)
    }
}

#[derive(Debug, Args)]
struct StreamArgs {
    /// Stream from this target id instead of the first relevant one
    #[arg(long)]
    target_id: Option<String>,
    /// Stop after this many events
    #[arg(long)]
    cap: Option<usize>,
    /// Consecutive empty receives before giving up
    #[arg(long)]
    idle_bound: Option<u32>,
    /// Per-receive timeout in milliseconds
    #[arg(long)]
    receive_timeout_ms: Option<u64>,
    /// Expression evaluated after attaching, e.g. "console.log('attached')"
    #[arg(long)]
    probe_expression: Option<String>,
    /// How many of the newest events to print
    #[arg(long)]
    keep_last: Option<usize>,
}

impl StreamArgs {
    fn apply(&self, s: &mut Settings) {
        if let Some(id) = &self.target_id { s.target_id = Some(id.clone()); }
        if let Some(c) = self.cap { s.stream.cap = c; }
        if let Some(b) = self.idle_bound { s.stream.idle_bound = b; }
        if let Some(t) = self.receive_timeout_ms { s.stream.receive_timeout_ms = t; }
        if let Some(e) = &self.probe_expression { s.stream.probe_expression = Some(e.clone()); }
    }

    fn keep_last(&self, cfg: Option<&Config>) -> usize {
        self.keep_last.or_else(|| cfg.and_then(|c| c.keep_last)).unwrap_or(10)
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print version information
    Version,
    /// Is devtools running, which port answers, which targets are relevant
    Status {
        #[command(flatten)]
        bridge: BridgeArgs,
    },
    /// Connect-test candidate ports and list the open ones
    Ports {
        /// Host to test
        #[arg(long)]
        host: Option<String>,
        /// Ports to test (default: configured ports, else 9222-9225,8080,3000)
        #[arg(long)]
        ports: Option<String>,
        /// Timeout per port in milliseconds
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
        /// Max concurrent connection attempts
        #[arg(long, default_value_t = 8)]
        concurrency: usize,
    },
    /// List debug targets behind the confirmed port
    Targets {
        #[command(flatten)]
        bridge: BridgeArgs,
        /// List every target, not only relevant ones
        #[arg(long, default_value_t = false)]
        all: bool,
        /// Write the list as CSV to this file
        #[arg(long, value_name = "FILE")]
        csv: Option<PathBuf>,
    },
    /// Attach to one target and print its console output
    Logs {
        #[command(flatten)]
        bridge: BridgeArgs,
        #[command(flatten)]
        stream: StreamArgs,
    },
    /// Tail the log files the tool keeps on disk
    LogFiles {
        /// Project root used for relative log directories
        #[arg(long)]
        project: Option<PathBuf>,
        /// Log directory to walk (repeatable; replaces the configured list)
        #[arg(long = "dir", value_name = "DIR")]
        dirs: Vec<String>,
        /// Maximum number of lines to show
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Check project files: required files, JSON syntax, source stats
    Check {
        /// Project root (default: project_root from config, else current directory)
        #[arg(long)]
        project: Option<PathBuf>,
    },
    /// Full diagnosis: pipeline, open ports and project check
    Report {
        #[command(flatten)]
        bridge: BridgeArgs,
        #[command(flatten)]
        stream: StreamArgs,
        /// Project root (default: project_root from config, else current directory)
        #[arg(long)]
        project: Option<PathBuf>,
        /// Skip attaching to a target
        #[arg(long, default_value_t = false)]
        no_stream: bool,
        /// Also write the JSON report to this file
        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
    /// How to enable the remote debugger
    Guide,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new().filter_level(level).parse_default_env().init();
}

fn project_root(flag: Option<PathBuf>, cfg: Option<&Config>) -> Result<PathBuf> {
    if let Some(p) = flag.or_else(|| cfg.and_then(|c| c.project_root.clone())) {
        return Ok(p);
    }
    Ok(std::env::current_dir()?)
}

fn layout(cfg: Option<&Config>) -> project_check::ProjectLayout {
    cfg.and_then(|c| c.layout.clone()).unwrap_or_default()
}

fn log_sources(cfg: Option<&Config>) -> log_files::LogSources {
    cfg.and_then(|c| c.log_files.clone()).unwrap_or_default()
}

/// Ports for the open-port sweep: flag, else the configured candidates,
/// else the wider sweep list.
fn sweep_port_list(flag: Option<&str>, cfg: Option<&Config>) -> Result<Vec<u16>> {
    match flag.or_else(|| cfg.and_then(|c| c.ports.as_deref())) {
        Some(spec) => port_probe::parse_ports(spec),
        None => Ok(port_probe::sweep_ports()),
    }
}

/// Run `fut` on a fresh runtime. A process scan abandoned on timeout may
/// still hold a blocking thread, so shutdown does not wait for it.
fn block_on<F: Future>(fut: F) -> Result<F::Output> {
    let rt = tokio::runtime::Runtime::new()?;
    let out = rt.block_on(fut);
    rt.shutdown_timeout(Duration::from_millis(100));
    Ok(out)
}

fn print_json<T: serde::Serialize>(v: &T, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(v)?),
        _ => println!("{}", serde_json::to_string(v)?),
    }
    Ok(())
}

fn strict_check(strict: bool, run: &PipelineRun) -> Result<()> {
    match (strict, run.stopped_at) {
        (true, Some(stage)) => Err(anyhow!("{}: {}", stage.headline(), stage.remedy())),
        _ => Ok(()),
    }
}

fn write_targets_csv(path: &Path, targets: &[bridge_core::TargetDescriptor]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(std::fs::File::create(path)?);
    wtr.write_record(["id", "type", "title", "url", "stream_address"])?;
    for t in targets {
        wtr.write_record([&t.id, &t.kind, &t.title, &t.url, &t.stream_address])?;
    }
    wtr.flush()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let loaded_cfg = config::load_config(cli.config.as_deref());
    let cfg = loaded_cfg.as_ref();
    let format = cli.format;

    match cli.command {
        Commands::Version => {
            println!("devbridge {} (core {})", env!("CARGO_PKG_VERSION"), bridge_core::version());
        }
        Commands::Guide => print!("{}", report::guide()),
        Commands::Status { bridge } => {
            let settings = bridge.settings(cfg)?;
            let run = block_on(pipeline::run(&settings, Depth::Targets))?;
            let r = Report::build(&run, Vec::new(), None, None, 0);
            match format {
                OutputFormat::Text => print!("{}", r.render_text()),
                _ => print_json(&r, format)?,
            }
            strict_check(cli.strict, &run)?;
        }
        Commands::Ports { host, ports, timeout_ms, concurrency } => {
            let host = host.or_else(|| cfg.and_then(|c| c.host.clone())).unwrap_or_else(|| "127.0.0.1".to_string());
            let ports_vec = sweep_port_list(ports.as_deref(), cfg)?;
            let started = Instant::now();
            let open = block_on(port_probe::sweep_open(&host, &ports_vec, Duration::from_millis(timeout_ms), concurrency))?;
            let duration_ms = started.elapsed().as_millis();
            match format {
                OutputFormat::Text => {
                    if open.is_empty() {
                        println!("{}: no open ports ({} tested)", host, ports_vec.len());
                    } else {
                        for p in &open { println!("http://{}:{} - possible debug interface", host, p); }
                        println!("({} tested, {} ms)", ports_vec.len(), duration_ms);
                    }
                }
                OutputFormat::Json => {
                    let obj = serde_json::json!({ "host": host, "tested": ports_vec, "open": open, "duration_ms": duration_ms });
                    println!("{}", serde_json::to_string(&obj)?);
                }
                OutputFormat::Jsonl => {
                    for p in &open { println!("{}", serde_json::json!({ "host": host, "port": p })); }
                }
            }
            if cli.strict && open.is_empty() { return Err(anyhow!("no open ports on {}", host)); }
        }
        Commands::Targets { bridge, all, csv } => {
            let mut settings = bridge.settings(cfg)?;
            settings.all_targets = all;
            let run = block_on(pipeline::run(&settings, Depth::Targets))?;
            if let Some(path) = &csv {
                write_targets_csv(path, &run.targets)?;
            }
            match format {
                OutputFormat::Text => {
                    if let Some(stage) = run.stopped_at {
                        println!("{}", stage.headline());
                        println!("hint: {}", stage.remedy());
                    }
                    for t in &run.targets {
                        println!("{}  [{}] {}  {}", t.id, t.kind, t.title, t.url);
                    }
                }
                OutputFormat::Json => print_json(&run.targets, format)?,
                OutputFormat::Jsonl => {
                    for t in &run.targets { println!("{}", serde_json::to_string(t)?); }
                }
            }
            strict_check(cli.strict, &run)?;
        }
        Commands::Logs { bridge, stream } => {
            let mut settings = bridge.settings(cfg)?;
            stream.apply(&mut settings);
            let keep_last = stream.keep_last(cfg);
            let run = block_on(pipeline::run(&settings, Depth::Events))?;
            let events = run.stream.as_ref().map(|s| s.last(keep_last)).unwrap_or_default();
            match format {
                OutputFormat::Text => {
                    if let Some(s) = &run.stream {
                        println!("{} event(s) from target {}", s.events.len(), s.target_id);
                        if let Some(f) = &s.fault {
                            println!("{} (hint: {})", f, f.remedy());
                        }
                    }
                    for ev in events { println!("{}", report::format_event(ev)); }
                    if let Some(stage) = run.stopped_at {
                        println!("{}", stage.headline());
                        println!("hint: {}", stage.remedy());
                    }
                }
                OutputFormat::Json => print_json(&run, format)?,
                OutputFormat::Jsonl => {
                    for ev in events { println!("{}", serde_json::to_string(ev)?); }
                }
            }
            strict_check(cli.strict, &run)?;
        }
        Commands::LogFiles { project, dirs, limit } => {
            let root = project_root(project, cfg)?;
            let mut sources = log_sources(cfg);
            if !dirs.is_empty() { sources.dirs = dirs; }
            if let Some(l) = limit { sources.limit = l; }
            let tail = log_files::read_latest(&sources, &root);
            match format {
                OutputFormat::Text => {
                    if tail.files.is_empty() {
                        println!("no log files found in {} director(ies)", sources.dirs.len());
                    }
                    for f in &tail.files { println!("read {}", f.display()); }
                    for f in &tail.unreadable { println!("unreadable {}", f.display()); }
                    for l in &tail.lines { println!("[{}] {}", l.file, l.line); }
                }
                OutputFormat::Json => print_json(&tail, format)?,
                OutputFormat::Jsonl => {
                    for l in &tail.lines { println!("{}", serde_json::to_string(l)?); }
                }
            }
            if cli.strict && tail.files.is_empty() { return Err(anyhow!("no log files found")); }
        }
        Commands::Check { project } => {
            let root = project_root(project, cfg)?;
            let findings = project_check::check_project(&root, &layout(cfg));
            match format {
                OutputFormat::Text => {
                    println!("project: {}", root.display());
                    if findings.is_clean() {
                        println!("no problems found");
                    }
                    for issue in findings.issues() { println!("  - {}", issue); }
                    let st = &findings.stats;
                    println!("js: {} ({} lines)  wxml: {}  wxss: {}  json: {}", st.js_files, st.total_js_lines, st.wxml_files, st.wxss_files, st.json_files);
                    for c in &findings.call_sites { println!("  {}:{} {}", c.path, c.line, c.content); }
                }
                _ => print_json(&findings, format)?,
            }
            if cli.strict && !findings.is_clean() { return Err(anyhow!("project check found {} issue(s)", findings.issues().len())); }
        }
        Commands::Report { bridge, stream, project, no_stream, out } => {
            let mut settings = bridge.settings(cfg)?;
            stream.apply(&mut settings);
            let keep_last = stream.keep_last(cfg);
            let root = project_root(project, cfg)?;
            let depth = if no_stream { Depth::Targets } else { Depth::Events };
            let host = settings.probe.host.clone();
            let sweep = sweep_port_list(bridge.ports.as_deref(), cfg)?;
            let (run, open_ports) = block_on(async {
                let open = port_probe::sweep_open(&host, &sweep, Duration::from_millis(1000), 8).await;
                (pipeline::run(&settings, depth).await, open)
            })?;
            let findings = project_check::check_project(&root, &layout(cfg));
            let tail = log_files::read_latest(&log_sources(cfg), &root);
            let r = Report::build(&run, open_ports, Some(findings), Some(tail), keep_last);
            if let Some(path) = &out {
                let mut w = BufWriter::new(std::fs::File::create(path)?);
                writeln!(w, "{}", serde_json::to_string_pretty(&r)?)?;
                log::info!("report written to {}", path.display());
            }
            match format {
                OutputFormat::Text => print!("{}", r.render_text()),
                _ => print_json(&r, format)?,
            }
            if cli.strict && !r.issues.is_empty() { return Err(anyhow!("{}", r.status)); }
        }
    }
    Ok(())
}
