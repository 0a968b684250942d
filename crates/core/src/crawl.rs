//! Crawl request/result records exchanged between the worker pool and the
//! crawler collaborator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{CrawlFailure, FailureKind};

/// Upstream cache verdict for a response, normalised across CDN header
/// conventions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    Stale,
    Expired,
    Bypass,
    Dynamic,
    Unknown,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "hit",
            CacheStatus::Miss => "miss",
            CacheStatus::Stale => "stale",
            CacheStatus::Expired => "expired",
            CacheStatus::Bypass => "bypass",
            CacheStatus::Dynamic => "dynamic",
            CacheStatus::Unknown => "unknown",
        }
    }

    /// Derive the cache verdict from response headers.
    ///
    /// Checks `cf-cache-status`, `x-vercel-cache` and `x-cache` (Fastly,
    /// CloudFront, Varnish style), falling back to a nonzero `age` header.
    pub fn from_headers(headers: &BTreeMap<String, String>) -> CacheStatus {
        for key in ["cf-cache-status", "x-vercel-cache"] {
            if let Some(v) = headers.get(key) {
                return Self::parse_token(v);
            }
        }
        if let Some(v) = headers.get("x-cache") {
            let lower = v.to_ascii_lowercase();
            if lower.contains("hit") {
                return CacheStatus::Hit;
            }
            if lower.contains("miss") {
                return CacheStatus::Miss;
            }
        }
        if let Some(age) = headers.get("age") {
            if age.trim().parse::<u64>().map(|a| a > 0).unwrap_or(false) {
                return CacheStatus::Hit;
            }
        }
        CacheStatus::Unknown
    }

    fn parse_token(raw: &str) -> CacheStatus {
        match raw.trim().to_ascii_uppercase().as_str() {
            "HIT" | "REVALIDATED" | "UPDATING" => CacheStatus::Hit,
            "MISS" | "PRERENDER" => CacheStatus::Miss,
            "STALE" => CacheStatus::Stale,
            "EXPIRED" => CacheStatus::Expired,
            "BYPASS" | "NONE" => CacheStatus::Bypass,
            "DYNAMIC" => CacheStatus::Dynamic,
            _ => CacheStatus::Unknown,
        }
    }
}

impl std::fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phase timings for one request. Phases the transport cannot observe are
/// left unset rather than estimated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingBreakdown {
    pub dns_ms: Option<u64>,
    pub connect_ms: Option<u64>,
    pub tls_ms: Option<u64>,
    pub ttfb_ms: Option<u64>,
    pub transfer_ms: Option<u64>,
}

/// The second, re-measured request used to quantify the warming effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondAttempt {
    pub status_code: u16,
    pub response_time_ms: u64,
    pub cache_status: CacheStatus,
    pub ttfb_ms: Option<u64>,
}

/// What the worker hands to the crawler.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub task_id: String,
    pub job_id: String,
    /// Fully-qualified URL to fetch.
    pub url: String,
    /// Whether the caller wants links extracted from HTML responses.
    pub find_links: bool,
}

/// Result record for a successfully executed crawl (the HTTP exchange ran to
/// completion; the status code itself may still be an upstream error).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlOutcome {
    pub status_code: u16,
    pub response_time_ms: u64,
    pub cache_status: CacheStatus,
    pub timing: TimingBreakdown,
    pub content_length: Option<i64>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub redirect_url: Option<String>,
    pub second: Option<SecondAttempt>,
    /// Links extracted from the body, when requested.
    #[serde(default)]
    pub discovered_links: Vec<String>,
}

impl CrawlOutcome {
    /// Classify a completed exchange into success or an upstream failure.
    pub fn failure(&self) -> Option<CrawlFailure> {
        FailureKind::from_status(self.status_code).map(|kind| CrawlFailure {
            kind,
            message: format!("upstream status {}", self.status_code),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn cloudflare_tokens() {
        assert_eq!(
            CacheStatus::from_headers(&headers(&[("cf-cache-status", "HIT")])),
            CacheStatus::Hit
        );
        assert_eq!(
            CacheStatus::from_headers(&headers(&[("cf-cache-status", "DYNAMIC")])),
            CacheStatus::Dynamic
        );
        assert_eq!(
            CacheStatus::from_headers(&headers(&[("cf-cache-status", "EXPIRED")])),
            CacheStatus::Expired
        );
    }

    #[test]
    fn x_cache_substring_match() {
        assert_eq!(
            CacheStatus::from_headers(&headers(&[("x-cache", "Hit from cloudfront")])),
            CacheStatus::Hit
        );
        assert_eq!(
            CacheStatus::from_headers(&headers(&[("x-cache", "Miss from cloudfront")])),
            CacheStatus::Miss
        );
    }

    #[test]
    fn age_fallback() {
        assert_eq!(
            CacheStatus::from_headers(&headers(&[("age", "120")])),
            CacheStatus::Hit
        );
        assert_eq!(
            CacheStatus::from_headers(&headers(&[("age", "0")])),
            CacheStatus::Unknown
        );
        assert_eq!(CacheStatus::from_headers(&headers(&[])), CacheStatus::Unknown);
    }

    #[test]
    fn outcome_failure_classification() {
        let mut outcome = CrawlOutcome {
            status_code: 200,
            response_time_ms: 42,
            cache_status: CacheStatus::Miss,
            timing: TimingBreakdown::default(),
            content_length: None,
            content_type: None,
            headers: BTreeMap::new(),
            redirect_url: None,
            second: None,
            discovered_links: Vec::new(),
        };
        assert!(outcome.failure().is_none());

        outcome.status_code = 404;
        let failure = outcome.failure().unwrap();
        assert!(!failure.retryable());

        outcome.status_code = 429;
        let failure = outcome.failure().unwrap();
        assert!(failure.retryable());
    }
}
