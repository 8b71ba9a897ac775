//! Project sanity checks fed into the report: expected files, JSON
//! well-formedness, source statistics and console call sites.

use anyhow::Result;
use bridge_core::Fault;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectLayout {
    /// Paths relative to the project root that must exist.
    pub required_files: Vec<String>,
    /// Paths relative to the project root that must parse as JSON when present.
    pub json_files: Vec<String>,
    /// Directory (relative) walked for statistics and call sites.
    pub source_dir: String,
    pub max_call_sites: usize,
}

impl Default for ProjectLayout {
    fn default() -> Self {
        ProjectLayout {
            required_files: vec![
                "project.config.json".into(),
                "miniprogram/app.js".into(),
                "miniprogram/app.json".into(),
                "miniprogram/app.wxss".into(),
            ],
            json_files: vec!["project.config.json".into(), "miniprogram/app.json".into()],
            source_dir: "miniprogram".into(),
            max_call_sites: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JsonError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeStats {
    pub js_files: usize,
    pub wxml_files: usize,
    pub wxss_files: usize,
    pub json_files: usize,
    pub total_js_lines: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallSite {
    pub path: String,
    pub line: usize,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectFindings {
    pub root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    pub missing_files: Vec<String>,
    pub json_errors: Vec<JsonError>,
    pub stats: CodeStats,
    pub call_sites: Vec<CallSite>,
}

impl ProjectFindings {
    pub fn is_clean(&self) -> bool {
        self.configuration.is_none() && self.missing_files.is_empty() && self.json_errors.is_empty()
    }

    /// One line per problem, suitable for a report issue list.
    pub fn issues(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Some(c) = &self.configuration {
            out.push(c.clone());
        }
        out.extend(self.missing_files.iter().map(|f| format!("missing file: {}", f)));
        out.extend(self.json_errors.iter().map(|e| format!("malformed JSON: {}: {}", e.path, e.message)));
        out
    }
}

const MESSAGE_LIMIT: usize = 80;

fn short(msg: &str) -> String {
    if msg.chars().count() <= MESSAGE_LIMIT {
        return msg.to_string();
    }
    let mut s: String = msg.chars().take(MESSAGE_LIMIT).collect();
    s.push_str("...");
    s
}

fn relative(root: &Path, p: &Path) -> String {
    p.strip_prefix(root).unwrap_or(p).to_string_lossy().replace('\\', "/")
}

fn check_json(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str::<serde_json::Value>(&text)?;
    Ok(())
}

fn is_console_call(line: &str) -> bool {
    ["console.log", "console.warn", "console.error"].iter().any(|c| line.contains(c))
}

fn scan_source(root: &Path, layout: &ProjectLayout, findings: &mut ProjectFindings) {
    let dir = root.join(&layout.source_dir);
    if !dir.is_dir() {
        log::debug!("source dir {} not present", dir.display());
        return;
    }
    for de in WalkDir::new(&dir).follow_links(false).into_iter().filter_map(|e| e.ok()) {
        let p = de.path();
        if !p.is_file() { continue; }
        let ext = p.extension().and_then(|e| e.to_str()).unwrap_or_default().to_ascii_lowercase();
        match ext.as_str() {
            "js" => {
                findings.stats.js_files += 1;
                let Ok(text) = fs::read_to_string(p) else { continue };
                findings.stats.total_js_lines += text.lines().count();
                for (i, line) in text.lines().enumerate() {
                    if findings.call_sites.len() >= layout.max_call_sites { break; }
                    if is_console_call(line) {
                        findings.call_sites.push(CallSite { path: relative(root, p), line: i + 1, content: short(line.trim()) });
                    }
                }
            }
            "wxml" => findings.stats.wxml_files += 1,
            "wxss" => findings.stats.wxss_files += 1,
            "json" => {
                findings.stats.json_files += 1;
                let rel = relative(root, p);
                if findings.json_errors.iter().any(|e| e.path == rel) { continue; }
                if let Err(e) = check_json(p) {
                    findings.json_errors.push(JsonError { path: rel, message: short(&e.to_string()) });
                }
            }
            _ => {}
        }
    }
}

/// Check `root` against `layout`. A missing root is reported as a
/// configuration finding; everything else is best effort.
pub fn check_project(root: &Path, layout: &ProjectLayout) -> ProjectFindings {
    let mut findings = ProjectFindings { root: root.to_path_buf(), ..Default::default() };
    if !root.is_dir() {
        let fault = Fault::Configuration(format!("project path does not exist: {}", root.display()));
        log::warn!("{}", fault);
        findings.configuration = Some(fault.to_string());
        return findings;
    }
    for f in &layout.required_files {
        if !root.join(f).exists() {
            findings.missing_files.push(f.clone());
        }
    }
    for f in &layout.json_files {
        let p = root.join(f);
        if !p.exists() { continue; }
        if let Err(e) = check_json(&p) {
            findings.json_errors.push(JsonError { path: f.clone(), message: short(&e.to_string()) });
        }
    }
    scan_source(root, layout, &mut findings);
    log::info!(
        "project check: {} missing, {} malformed JSON, {} js files",
        findings.missing_files.len(),
        findings.json_errors.len(),
        findings.stats.js_files
    );
    findings
}
