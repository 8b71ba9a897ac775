//! Find the devtools process in the OS process table by substring heuristics.

use bridge_core::ProcessHandle;
use serde::{Deserialize, Serialize};
use sysinfo::System;

/// Substrings used to recognise the tool. All comparisons are case-insensitive
/// containment because the same tool ships under several binary names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessHints {
    /// Any of these in the process name is a match on its own.
    pub name_hints: Vec<String>,
    /// Generic names that only count together with an `app_keywords` hit in the command line.
    pub generic_names: Vec<String>,
    pub app_keywords: Vec<String>,
    /// Localised or alternate product strings searched in the command line.
    pub alt_cmdline: Vec<String>,
}

impl Default for ProcessHints {
    fn default() -> Self {
        ProcessHints {
            name_hints: vec!["wechatwebdevtools".into(), "wechatdevtools".into(), "wx_dev_tools".into()],
            generic_names: vec!["devtools".into()],
            app_keywords: vec!["wechat".into()],
            alt_cmdline: vec!["微信开发者工具".into()],
        }
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().filter(|n| !n.is_empty()).any(|n| haystack.contains(&n.to_lowercase()))
}

impl ProcessHints {
    pub fn matches(&self, name: &str, command_line: &str) -> bool {
        let name = name.to_lowercase();
        let cmd = command_line.to_lowercase();
        contains_any(&name, &self.name_hints)
            || (contains_any(&name, &self.generic_names) && contains_any(&cmd, &self.app_keywords))
            || contains_any(&cmd, &self.alt_cmdline)
    }

    pub fn matches_handle(&self, p: &ProcessHandle) -> bool {
        self.matches(&p.name, &p.joined_command_line())
    }
}

/// First matching process from an already captured process list.
pub fn locate_in<I>(processes: I, hints: &ProcessHints) -> Option<ProcessHandle>
where
    I: IntoIterator<Item = ProcessHandle>,
{
    processes.into_iter().find(|p| hints.matches_handle(p))
}

/// Capture the live process table once. Entries the OS refuses to describe
/// come back with an empty command line and are still matched on name.
pub fn snapshot() -> Vec<ProcessHandle> {
    let mut sys = System::new();
    sys.refresh_processes();
    let procs: Vec<ProcessHandle> = sys
        .processes()
        .iter()
        .map(|(pid, p)| ProcessHandle {
            pid: pid.as_u32(),
            name: p.name().to_string(),
            command_line: p.cmd().to_vec(),
        })
        .collect();
    log::debug!("process table snapshot: {} entries", procs.len());
    procs
}

/// Scan the OS process table; `None` when nothing matches.
pub fn locate(hints: &ProcessHints) -> Option<ProcessHandle> {
    let found = locate_in(snapshot(), hints);
    match &found {
        Some(p) => log::info!("devtools process found: pid={} name={}", p.pid, p.name),
        None => log::info!("no process matched the configured hints"),
    }
    found
}
