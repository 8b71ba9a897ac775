//! List the debuggable targets behind a confirmed endpoint and keep the ones
//! that look like they belong to the application.

use anyhow::Result;
use bridge_core::{DebugEndpoint, Fault, TargetDescriptor};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Substring heuristics for picking targets. The discovery protocol offers no
/// stable application id, so both false positives and misses are expected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelevancePolicy {
    /// Target types that count as an application context on their own
    /// (case-insensitive). Empty means only the substrings decide.
    pub page_types: Vec<String>,
    /// Case-insensitive substrings searched in title and url.
    pub substrings: Vec<String>,
}

impl Default for RelevancePolicy {
    fn default() -> Self {
        RelevancePolicy {
            page_types: vec!["page".into(), "webview".into()],
            substrings: vec!["miniprogram".into(), "devtools".into(), "微信开发者工具".into()],
        }
    }
}

impl RelevancePolicy {
    pub fn is_relevant(&self, t: &TargetDescriptor) -> bool {
        if self.page_types.iter().any(|k| t.kind.eq_ignore_ascii_case(k)) {
            return true;
        }
        let title = t.title.to_lowercase();
        let url = t.url.to_lowercase();
        self.substrings
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .any(|s| title.contains(&s) || url.contains(&s))
    }
}

/// Decode a discovery response. Entries that are not objects are skipped;
/// a body that is not a JSON array is a parse fault.
pub fn parse_targets(body: &str) -> Result<Vec<TargetDescriptor>, Fault> {
    let v: Value = serde_json::from_str(body).map_err(Fault::parse)?;
    let items = match v {
        Value::Array(items) => items,
        other => return Err(Fault::Parse(format!("expected a JSON array, got {}", type_name(&other)))),
    };
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        match serde_json::from_value::<TargetDescriptor>(item) {
            Ok(t) => out.push(t),
            Err(e) => log::debug!("skipping malformed target entry: {}", e),
        }
    }
    Ok(out)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

async fn fetch_targets(client: &Client, endpoint: &DebugEndpoint) -> Result<Option<String>> {
    let url = endpoint.discovery_url();
    let resp = client.get(&url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        log::warn!("{} answered {}", url, status);
        return Ok(None);
    }
    Ok(Some(resp.text().await?))
}

/// Every target the endpoint lists, in endpoint order. Any failure yields an
/// empty list since the surface is often not ready right after the port opens.
pub async fn enumerate_all(endpoint: &DebugEndpoint, fetch_timeout: Duration) -> Vec<TargetDescriptor> {
    let client = match Client::builder().timeout(fetch_timeout).no_proxy().build() {
        Ok(c) => c,
        Err(e) => {
            log::error!("cannot build http client: {}", e);
            return Vec::new();
        }
    };
    let body = match fetch_targets(&client, endpoint).await {
        Ok(Some(b)) => b,
        Ok(None) => return Vec::new(),
        Err(e) => {
            log::warn!("{}", Fault::transport(e));
            return Vec::new();
        }
    };
    match parse_targets(&body) {
        Ok(targets) => targets,
        Err(fault) => {
            log::warn!("{}: {}", endpoint.discovery_url(), fault);
            Vec::new()
        }
    }
}

/// Targets accepted by `relevance`, original order kept, descriptors untouched.
pub async fn enumerate<F>(endpoint: &DebugEndpoint, relevance: F, fetch_timeout: Duration) -> Vec<TargetDescriptor>
where
    F: Fn(&TargetDescriptor) -> bool,
{
    let all = enumerate_all(endpoint, fetch_timeout).await;
    let total = all.len();
    let kept: Vec<TargetDescriptor> = all.into_iter().filter(|t| relevance(t)).collect();
    log::info!("{} of {} targets relevant", kept.len(), total);
    kept
}
