//! Request classification.
//!
//! An ordered table of rules; the first rule whose matcher accepts the
//! request picks the strategy. Requests no rule accepts are cache-first.

use std::fmt;

use http::Method;
use serde::{Deserialize, Serialize};
use swcache_net::{Request, UrlPattern};

use crate::config::CacheConfig;

/// How a request is served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyTag {
    CacheFirst,
    NetworkFirst,
    NetworkOnly,
}

impl StrategyTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTag::CacheFirst => "cache-first",
            StrategyTag::NetworkFirst => "network-first",
            StrategyTag::NetworkOnly => "network-only",
        }
    }
}

impl fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Predicate over a request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestMatcher {
    /// URL matches the pattern.
    Url(UrlPattern),
    /// Method is anything but the given one.
    MethodIsNot(Method),
    /// Top-level navigation.
    Navigation,
    /// `Accept` header contains the given media type.
    AcceptContains(String),
}

impl RequestMatcher {
    pub fn matches(&self, request: &Request) -> bool {
        match self {
            RequestMatcher::Url(pattern) => pattern.matches(&request.url),
            RequestMatcher::MethodIsNot(method) => request.method != *method,
            RequestMatcher::Navigation => request.is_navigation(),
            RequestMatcher::AcceptContains(media) => request
                .accept_header()
                .is_some_and(|accept| accept.to_ascii_lowercase().contains(media.as_str())),
        }
    }
}

/// One row of the routing table.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Short name, used in logs.
    pub name: &'static str,
    pub matcher: RequestMatcher,
    pub strategy: StrategyTag,
}

impl Rule {
    pub fn new(name: &'static str, matcher: RequestMatcher, strategy: StrategyTag) -> Self {
        Self {
            name,
            matcher,
            strategy,
        }
    }
}

/// Maps requests to strategies. Pure and side-effect free.
#[derive(Debug, Clone)]
pub struct Classifier {
    rules: Vec<Rule>,
    fallback: StrategyTag,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}

impl Classifier {
    /// Build a classifier from an explicit rule table.
    pub fn new(rules: Vec<Rule>, fallback: StrategyTag) -> Self {
        Self { rules, fallback }
    }

    /// Build the standard rule table for a configuration.
    ///
    /// API origins come first, then non-GET methods, volatile assets, and
    /// finally the HTML checks (navigation, `.html` path, `Accept`).
    pub fn from_config(config: &CacheConfig) -> Self {
        let mut rules = Vec::new();

        for origin in &config.api_origins {
            rules.push(Rule::new(
                "api-origin",
                RequestMatcher::Url(UrlPattern::host(origin)),
                StrategyTag::NetworkOnly,
            ));
        }

        rules.push(Rule::new(
            "non-get",
            RequestMatcher::MethodIsNot(Method::GET),
            StrategyTag::NetworkOnly,
        ));

        for pattern in &config.volatile_assets {
            rules.push(Rule::new(
                "volatile-asset",
                RequestMatcher::Url(pattern.clone()),
                StrategyTag::NetworkFirst,
            ));
        }

        rules.push(Rule::new("navigation", RequestMatcher::Navigation, StrategyTag::NetworkFirst));
        rules.push(Rule::new(
            "html-path",
            RequestMatcher::Url(UrlPattern::path_suffix(".html")),
            StrategyTag::NetworkFirst,
        ));
        rules.push(Rule::new(
            "accepts-html",
            RequestMatcher::AcceptContains("text/html".to_string()),
            StrategyTag::NetworkFirst,
        ));

        Self::new(rules, StrategyTag::CacheFirst)
    }

    /// The strategy for `request`.
    pub fn classify(&self, request: &Request) -> StrategyTag {
        self.matching_rule(request)
            .map_or(self.fallback, |rule| rule.strategy)
    }

    /// The first rule accepting `request`, if any.
    pub fn matching_rule(&self, request: &Request) -> Option<&Rule> {
        self.rules.iter().find(|rule| rule.matcher.matches(request))
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn fallback(&self) -> StrategyTag {
        self.fallback
    }
}
