use log_files::LogSources;
use log_stream::StreamOptions;
use port_probe::ProbeMode;
use process_locate::ProcessHints;
use project_check::ProjectLayout;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use target_enum::RelevancePolicy;

/// File-level settings. Every field is optional; unset values fall back to
/// the built-in defaults and CLI flags win over the file.
#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub host: Option<String>,
    pub ports: Option<String>,
    pub probe_timeout_ms: Option<u64>,
    pub probe_mode: Option<ProbeMode>,
    pub fetch_timeout_ms: Option<u64>,
    pub locate_timeout_ms: Option<u64>,
    pub project_root: Option<PathBuf>,
    pub keep_last: Option<usize>,
    pub process: Option<ProcessHints>,
    pub relevance: Option<RelevancePolicy>,
    pub stream: Option<StreamOptions>,
    pub layout: Option<ProjectLayout>,
    pub log_files: Option<LogSources>,
}

pub const DEFAULT_CONFIG_FILE: &str = "devbridge.yaml";

pub fn parse_config(s: &str) -> Result<Config, serde_yaml::Error> {
    serde_yaml::from_str(s)
}

pub fn load_config(path: Option<&Path>) -> Option<Config> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => {
            let p = Path::new(DEFAULT_CONFIG_FILE);
            if p.exists() { p.to_path_buf() } else { return None; }
        }
    };
    let s = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("cannot read config {}: {}", path.display(), e);
            return None;
        }
    };
    match parse_config(&s) {
        Ok(c) => {
            log::debug!("loaded config from {}", path.display());
            Some(c)
        }
        Err(e) => {
            log::warn!("ignoring malformed config {}: {}", path.display(), e);
            None
        }
    }
}
