//! Human and JSON renderings of a pipeline run plus project findings.

use bridge_core::{LogEvent, ProcessHandle, TargetDescriptor};
use log_files::LogTail;
use log_stream::StopReason;
use project_check::ProjectFindings;
use serde::Serialize;
use std::fmt::Write as _;

use crate::pipeline::{PipelineRun, Stage};

#[derive(Debug, Clone, Serialize)]
pub struct EndpointInfo {
    pub port: u16,
    pub url: String,
    pub confirmed_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSummary {
    pub target_id: String,
    pub stop: StopReason,
    pub captured: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub generated_at: String,
    pub status: String,
    pub process: Option<ProcessHandle>,
    pub endpoint: Option<EndpointInfo>,
    pub open_ports: Vec<u16>,
    pub targets: Vec<TargetDescriptor>,
    pub stream: Option<StreamSummary>,
    pub events: Vec<LogEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<ProjectFindings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_files: Option<LogTail>,
    pub stopped_at: Option<Stage>,
    pub issues: Vec<String>,
    pub fixes: Vec<String>,
}

impl Report {
    pub fn build(
        run: &PipelineRun,
        open_ports: Vec<u16>,
        project: Option<ProjectFindings>,
        log_files: Option<LogTail>,
        keep_last: usize,
    ) -> Self {
        let mut issues = Vec::new();
        let mut fixes = Vec::new();
        if let Some(stage) = run.stopped_at {
            issues.push(stage.headline().to_string());
            fixes.push(stage.remedy().to_string());
        }
        let stream = run.stream.as_ref().map(|s| {
            if let Some(f) = &s.fault {
                issues.push(f.to_string());
                fixes.push(f.remedy().to_string());
            }
            StreamSummary { target_id: s.target_id.clone(), stop: s.stop, captured: s.events.len(), fault: s.fault.as_ref().map(|f| f.to_string()) }
        });
        if let Some(p) = &project {
            for issue in p.issues() {
                issues.push(issue);
            }
            if p.configuration.is_some() {
                fixes.push("pass --project <dir> or set project_root in devbridge.yaml".to_string());
            }
            if !p.missing_files.is_empty() {
                fixes.push("restore the missing project files".to_string());
            }
            for e in &p.json_errors {
                fixes.push(format!("fix the JSON syntax in {}", e.path));
            }
        }
        let status = if issues.is_empty() { "ready".to_string() } else { format!("{} issue(s) found", issues.len()) };
        Report {
            generated_at: bridge_core::now_rfc3339(),
            status,
            process: run.process.clone(),
            endpoint: run.endpoint.as_ref().map(|e| EndpointInfo { port: e.port, url: e.base_url(), confirmed_at: e.confirmed_at_rfc3339() }),
            open_ports,
            targets: run.targets.clone(),
            stream,
            events: run.stream.as_ref().map(|s| s.last(keep_last).to_vec()).unwrap_or_default(),
            project,
            log_files,
            stopped_at: run.stopped_at,
            issues,
            fixes,
        }
    }

    pub fn render_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "devbridge report ({})", self.generated_at);
        match &self.process {
            Some(p) => { let _ = writeln!(out, "process:  running (pid {}, {})", p.pid, p.name); }
            None if self.stopped_at == Some(Stage::Process) => { let _ = writeln!(out, "process:  not found"); }
            None => {}
        }
        match &self.endpoint {
            Some(e) => { let _ = writeln!(out, "endpoint: {} (targets at {}/json)", e.url, e.url); }
            None if self.process.is_some() || self.stopped_at == Some(Stage::Port) => { let _ = writeln!(out, "endpoint: no debug port answered"); }
            None => {}
        }
        if !self.open_ports.is_empty() {
            let list = self.open_ports.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(",");
            let _ = writeln!(out, "open ports: [{}]", list);
        }
        if self.endpoint.is_some() {
            let _ = writeln!(out, "targets:  {}", self.targets.len());
            for (i, t) in self.targets.iter().take(5).enumerate() {
                let _ = writeln!(out, "  {}. [{}] {} {}", i + 1, t.kind, truncate(&t.title, 40), t.url);
            }
        }
        if let Some(s) = &self.stream {
            let _ = writeln!(out, "stream:   {} event(s) from {} ({:?})", s.captured, s.target_id, s.stop);
            for ev in &self.events {
                let _ = writeln!(out, "  {}", format_event(ev));
            }
        }
        if let Some(p) = &self.project {
            let st = &p.stats;
            let _ = writeln!(out, "project:  {}", p.root.display());
            let _ = writeln!(
                out,
                "  js: {} ({} lines)  wxml: {}  wxss: {}  json: {}  console calls: {}",
                st.js_files, st.total_js_lines, st.wxml_files, st.wxss_files, st.json_files, p.call_sites.len()
            );
        }
        if let Some(t) = &self.log_files {
            let _ = writeln!(out, "log files: {} read, {} matching line(s)", t.files.len(), t.lines.len());
            for l in &t.lines {
                let _ = writeln!(out, "  [{}] {}", l.file, l.line);
            }
        }
        if self.issues.is_empty() {
            let _ = writeln!(out, "status:   {}", self.status);
        } else {
            let _ = writeln!(out, "issues:");
            for i in &self.issues {
                let _ = writeln!(out, "  - {}", i);
            }
            let _ = writeln!(out, "suggested fixes:");
            for f in &self.fixes {
                let _ = writeln!(out, "  - {}", f);
            }
        }
        out
    }
}

pub fn format_event(ev: &LogEvent) -> String {
    format!("[{}] {}", ev.level.as_str().to_uppercase(), ev.text)
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max { s.to_string() } else { s.chars().take(max).collect::<String>() + "..." }
}

pub fn guide() -> &'static str {
    "\
Enabling the remote debugger
  1. Open the devtools application.
  2. Settings > General: tick \"enable Chrome debugger\" (remote debugging port).
  3. Restart the tool; `devbridge ports` should now list 9222 (or an alternate).
  4. Browse http://127.0.0.1:<port>/json to see the debuggable targets.

Reading console output
  devbridge status        process, port and target summary
  devbridge targets       list relevant targets (--all for every target)
  devbridge logs          stream console events from the first relevant target
  devbridge log-files     tail the log files the tool writes to disk
  devbridge report --out debug-report.json
"
}
