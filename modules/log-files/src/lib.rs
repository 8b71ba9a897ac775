//! Read-only fallback for "what is the tool logging": pick the newest log
//! files the tool left on disk and keep the interesting tail lines.

use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSources {
    /// Directories to walk. `~/` expands to the home directory, relative
    /// entries are taken against the project root.
    pub dirs: Vec<String>,
    /// A file qualifies when its name contains one of these (case-insensitive).
    pub name_keywords: Vec<String>,
    pub extensions: Vec<String>,
    /// A line is kept when it contains one of these (case-insensitive).
    pub line_keywords: Vec<String>,
    pub newest_files: usize,
    /// Lines read from the end of each file, and lines returned overall.
    pub limit: usize,
}

impl Default for LogSources {
    fn default() -> Self {
        LogSources {
            dirs: vec![
                "~/Library/Application Support/微信开发者工具/Default/logs".into(),
                "~/Library/Application Support/wechatdevtools/Default/logs".into(),
                "~/Library/Logs/微信开发者工具".into(),
                ".logs".into(),
                "logs".into(),
            ],
            name_keywords: vec!["console".into(), "debug".into(), "error".into(), "main".into()],
            extensions: vec!["log".into(), "txt".into()],
            line_keywords: vec!["error".into(), "warn".into(), "console".into(), "debug".into()],
            newest_files: 3,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogLine {
    pub file: String,
    pub line: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogTail {
    /// Files read, newest first.
    pub files: Vec<PathBuf>,
    pub lines: Vec<LogLine>,
    pub unreadable: Vec<PathBuf>,
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")).map(PathBuf::from)
}

/// Where `dir` points; `None` when it needs a home directory we cannot find.
pub fn resolve_dir(dir: &str, base: &Path) -> Option<PathBuf> {
    if let Some(rest) = dir.strip_prefix("~/") {
        return home_dir().map(|h| h.join(rest));
    }
    let p = Path::new(dir);
    Some(if p.is_absolute() { p.to_path_buf() } else { base.join(p) })
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    let haystack = haystack.to_lowercase();
    needles.iter().filter(|n| !n.is_empty()).any(|n| haystack.contains(&n.to_lowercase()))
}

impl LogSources {
    fn wants_file(&self, path: &Path) -> bool {
        let ext_ok = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false);
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        ext_ok && contains_any(&name, &self.name_keywords)
    }

    fn wants_line(&self, line: &str) -> bool {
        !line.trim().is_empty() && contains_any(line, &self.line_keywords)
    }
}

/// Every qualifying file under the configured directories, newest first.
/// Directories that do not exist are skipped.
pub fn find_log_files(sources: &LogSources, base: &Path) -> Vec<PathBuf> {
    let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
    for dir in sources.dirs.iter().filter_map(|d| resolve_dir(d, base)) {
        if !dir.is_dir() {
            log::debug!("log dir {} not present", dir.display());
            continue;
        }
        for de in WalkDir::new(&dir).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            if !de.file_type().is_file() || !sources.wants_file(de.path()) {
                continue;
            }
            let modified = de.metadata().ok().and_then(|m| m.modified().ok()).unwrap_or(SystemTime::UNIX_EPOCH);
            if !found.iter().any(|(_, p)| p == de.path()) {
                found.push((modified, de.path().to_path_buf()));
            }
        }
    }
    found.sort_by(|a, b| Reverse(a.0).cmp(&Reverse(b.0)).then_with(|| a.1.cmp(&b.1)));
    found.into_iter().map(|(_, p)| p).collect()
}

/// Tail the newest log files and keep the matching lines, at most `limit`
/// of them, oldest file first so the newest lines end up last.
pub fn read_latest(sources: &LogSources, base: &Path) -> LogTail {
    let mut tail = LogTail::default();
    let newest: Vec<PathBuf> = find_log_files(sources, base).into_iter().take(sources.newest_files).collect();
    for path in newest.iter().rev() {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                log::warn!("cannot read {}: {}", path.display(), e);
                tail.unreadable.push(path.clone());
                continue;
            }
        };
        let text = String::from_utf8_lossy(&bytes);
        let lines: Vec<&str> = text.lines().collect();
        let file = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        for line in &lines[lines.len().saturating_sub(sources.limit)..] {
            if sources.wants_line(line) {
                tail.lines.push(LogLine { file: file.clone(), line: line.trim().to_string() });
            }
        }
    }
    let excess = tail.lines.len().saturating_sub(sources.limit);
    tail.lines.drain(..excess);
    tail.files = newest;
    log::info!("log files: {} read, {} lines kept", tail.files.len(), tail.lines.len());
    tail
}
