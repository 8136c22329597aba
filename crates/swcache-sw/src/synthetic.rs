//! Synthetic failure responses.
//!
//! Every failure a caller can observe is a well-formed response: a stable
//! status, an `x-swcache-error` header naming the [`FailureKind`], and a small
//! JSON body.

use std::fmt;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use swcache_net::{Response, ResponseSource};
use url::Url;

/// Header carrying the failure kind on synthetic responses.
pub const ERROR_HEADER: &str = "x-swcache-error";

/// Why a synthetic response was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// A network-only fetch failed.
    NetworkUnreachable,
    /// Cache-first missed and the network failed.
    ServiceUnavailable,
    /// Network-first failed and nothing was cached.
    OfflineCacheMiss,
    /// The strategy itself failed.
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NetworkUnreachable => "network-unreachable",
            FailureKind::ServiceUnavailable => "service-unavailable",
            FailureKind::OfflineCacheMiss => "offline-cache-miss",
            FailureKind::Internal => "internal",
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            FailureKind::Internal => 500,
            _ => 503,
        }
    }

    fn parse(value: &str) -> Option<Self> {
        [
            FailureKind::NetworkUnreachable,
            FailureKind::ServiceUnavailable,
            FailureKind::OfflineCacheMiss,
            FailureKind::Internal,
        ]
        .into_iter()
        .find(|kind| kind.as_str() == value)
    }

    /// The failure kind of a synthetic response, if it is one.
    pub fn of(response: &Response) -> Option<Self> {
        if response.source != ResponseSource::Synthetic {
            return None;
        }
        response.header(ERROR_HEADER).and_then(Self::parse)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body of a synthetic response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureBody {
    pub error: FailureKind,
    pub message: String,
    pub url: String,
}

/// Build the synthetic response for `kind`.
pub fn failure_response(kind: FailureKind, url: &Url, message: impl Into<String>) -> Response {
    let body = FailureBody {
        error: kind,
        message: message.into(),
        url: url.to_string(),
    };
    // Serializing a struct of strings cannot fail; an empty body is the fallback.
    let body = serde_json::to_vec(&body).map(Bytes::from).unwrap_or_default();

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ERROR_HEADER, HeaderValue::from_static(kind.as_str()));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    let mut response = Response::new(url.clone(), kind.status(), headers, body);
    response.source = ResponseSource::Synthetic;
    response
}
