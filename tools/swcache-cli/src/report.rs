//! Printable summaries of proxy results.

use serde::Serialize;
use swcache_net::{Response, ResponseSource};
use swcache_sw::{FailureKind, GenerationInfo, StrategyTag};

/// Outcome of one `fetch`.
#[derive(Debug, Serialize)]
pub struct FetchReport {
    pub url: String,
    pub strategy: StrategyTag,
    pub status: u16,
    pub source: &'static str,
    pub error: Option<FailureKind>,
    pub headers: Vec<(String, String)>,
    pub body_bytes: usize,
}

impl FetchReport {
    pub fn new(strategy: StrategyTag, response: &Response) -> Self {
        Self {
            url: response.url.to_string(),
            strategy,
            status: response.status,
            source: source_name(response.source),
            error: FailureKind::of(response),
            headers: response
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect(),
            body_bytes: response.body.len(),
        }
    }

    pub fn print(&self) {
        println!("{} {}", self.strategy, self.url);
        println!("  Status:  {}", self.status);
        println!("  Source:  {}", self.source);
        if let Some(kind) = self.error {
            println!("  Error:   {kind}");
        }
        println!("  Body:    {} bytes", self.body_bytes);
        for (name, value) in &self.headers {
            println!("  {name}: {value}");
        }
    }
}

fn source_name(source: ResponseSource) -> &'static str {
    match source {
        ResponseSource::Network => "network",
        ResponseSource::Cache => "cache",
        ResponseSource::Synthetic => "synthetic",
    }
}

/// One line of `generations`.
#[derive(Debug, Serialize)]
pub struct GenerationRow {
    pub name: String,
    pub entries: usize,
    pub role: &'static str,
}

impl From<&GenerationInfo> for GenerationRow {
    fn from(info: &GenerationInfo) -> Self {
        let role = if info.current {
            "current"
        } else if info.staging {
            "staging"
        } else {
            "stale"
        };
        Self {
            name: info.name.clone(),
            entries: info.entries,
            role,
        }
    }
}
