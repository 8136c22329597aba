//! URL patterns used to route requests.

use serde::{Deserialize, Serialize};
use url::Url;

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// Exact URL match.
    Exact,
    /// Prefix of the full URL.
    Prefix,
    /// Suffix of the full URL.
    Suffix,
    /// Substring anywhere in the full URL.
    Contains,
    /// Substring of the path only.
    PathContains,
    /// Suffix of the path only (e.g. `.html`).
    PathSuffix,
    /// Host equals the pattern, or is a subdomain of it.
    Host,
}

/// URL pattern for matching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

impl UrlPattern {
    fn with_type(pattern_type: PatternType, pattern: &str) -> Self {
        Self {
            pattern_type,
            pattern: pattern.to_string(),
        }
    }

    /// Create an exact match pattern.
    pub fn exact(url: &str) -> Self {
        Self::with_type(PatternType::Exact, url)
    }

    /// Create a prefix match pattern.
    pub fn prefix(prefix: &str) -> Self {
        Self::with_type(PatternType::Prefix, prefix)
    }

    /// Create a suffix match pattern.
    pub fn suffix(suffix: &str) -> Self {
        Self::with_type(PatternType::Suffix, suffix)
    }

    /// Create a contains pattern.
    pub fn contains(substring: &str) -> Self {
        Self::with_type(PatternType::Contains, substring)
    }

    /// Create a path substring pattern.
    pub fn path_contains(substring: &str) -> Self {
        Self::with_type(PatternType::PathContains, substring)
    }

    /// Create a path suffix pattern.
    pub fn path_suffix(suffix: &str) -> Self {
        Self::with_type(PatternType::PathSuffix, suffix)
    }

    /// Create a host pattern.
    pub fn host(host: &str) -> Self {
        Self::with_type(PatternType::Host, host)
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        let url_str = url.as_str();
        match self.pattern_type {
            PatternType::Exact => url_str == self.pattern,
            PatternType::Prefix => url_str.starts_with(&self.pattern),
            PatternType::Suffix => url_str.ends_with(&self.pattern),
            PatternType::Contains => url_str.contains(&self.pattern),
            PatternType::PathContains => url.path().contains(&self.pattern),
            PatternType::PathSuffix => url.path().ends_with(&self.pattern),
            PatternType::Host => match url.host_str() {
                Some(host) => {
                    let host = host.to_ascii_lowercase();
                    let pattern = self.pattern.to_ascii_lowercase();
                    host == pattern
                        || host
                            .strip_suffix(&pattern)
                            .is_some_and(|rest| rest.ends_with('.'))
                }
                None => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_url_pattern_exact() {
        let pattern = UrlPattern::exact("https://example.com/");
        assert!(pattern.matches(&url("https://example.com/")));
        assert!(!pattern.matches(&url("https://example.com/page")));
    }

    #[test]
    fn test_url_pattern_prefix_and_suffix() {
        assert!(UrlPattern::prefix("https://cdn.example.com/").matches(&url("https://cdn.example.com/a.js")));
        assert!(UrlPattern::suffix(".css").matches(&url("https://example.com/main.css")));
    }

    #[test]
    fn test_path_contains_ignores_host_and_query() {
        let pattern = UrlPattern::path_contains("/images/sarbarg");
        assert!(pattern.matches(&url("https://example.com/images/sarbarg-2.jpg")));
        assert!(!pattern.matches(&url("https://images.example.com/?q=/images/sarbarg")));
    }

    #[test]
    fn test_path_suffix() {
        let pattern = UrlPattern::path_suffix(".html");
        assert!(pattern.matches(&url("https://example.com/message.html?id=3")));
        assert!(!pattern.matches(&url("https://example.com/message.htm")));
    }

    #[test]
    fn test_host_matches_subdomains_only_on_label_boundary() {
        let pattern = UrlPattern::host("API.example.com");
        assert!(pattern.matches(&url("https://api.example.com/signin")));
        assert!(pattern.matches(&url("https://eu.api.example.com/signin")));
        assert!(!pattern.matches(&url("https://notapi.example.com/")));
        assert!(!pattern.matches(&url("https://example.com/api.example.com")));
    }

    #[test]
    fn test_pattern_deserializes_from_config_shape() {
        let pattern: UrlPattern =
            serde_json::from_str(r#"{"pattern_type":"path_contains","pattern":"/images/sarbarg"}"#).unwrap();
        assert_eq!(pattern, UrlPattern::path_contains("/images/sarbarg"));
    }
}
