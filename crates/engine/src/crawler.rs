//! The crawler collaborator: one HTTP GET (plus an optional re-measurement)
//! per task, with timing capture and cache diagnostics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use warmfront_core::crawl::{CacheStatus, CrawlOutcome, CrawlRequest, SecondAttempt, TimingBreakdown};
use warmfront_core::error::CrawlFailure;

use crate::source::UrlSource;

/// Executes one crawl request. Implementations must be at-least-once safe:
/// the same URL may be fetched again after a retry.
#[async_trait]
pub trait Crawler: Send + Sync + 'static {
    async fn crawl(&self, request: &CrawlRequest) -> Result<CrawlOutcome, CrawlFailure>;
}

#[derive(Debug, Clone)]
pub struct HttpCrawlerConfig {
    pub request_timeout: Duration,
    pub user_agent: String,
    /// Re-fetch once after a non-hit response to measure the warming effect.
    pub second_request: bool,
    /// Cap on links extracted from a single page.
    pub max_links: usize,
}

impl Default for HttpCrawlerConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            user_agent: format!("warmfront/{}", env!("CARGO_PKG_VERSION")),
            second_request: true,
            max_links: 200,
        }
    }
}

/// reqwest-backed [`Crawler`].
pub struct HttpCrawler {
    http: reqwest::Client,
    /// Link-extraction capability, used for `find_links` jobs.
    source: Option<Arc<dyn UrlSource>>,
    config: HttpCrawlerConfig,
}

struct Fetched {
    status: u16,
    total_ms: u64,
    ttfb_ms: u64,
    cache_status: CacheStatus,
    headers: BTreeMap<String, String>,
    content_length: Option<i64>,
    content_type: Option<String>,
    final_url: String,
    body: Option<String>,
}

impl HttpCrawler {
    pub fn new(
        config: HttpCrawlerConfig,
        source: Option<Arc<dyn UrlSource>>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            source,
            config,
        })
    }

    async fn fetch(&self, url: &str, want_body: bool) -> Result<Fetched, CrawlFailure> {
        let started = Instant::now();
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(classify_transport)?;
        let ttfb_ms = started.elapsed().as_millis() as u64;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .or_insert_with(|| value.to_string());
            }
        }
        let cache_status = CacheStatus::from_headers(&headers);
        let content_type = headers.get("content-type").cloned();
        let header_length = headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<i64>().ok());

        let is_html = content_type
            .as_deref()
            .map(|ct| ct.contains("text/html"))
            .unwrap_or(false);
        let (body, body_len) = if want_body && is_html {
            let text = response.text().await.map_err(classify_transport)?;
            let len = text.len() as i64;
            (Some(text), len)
        } else {
            let bytes = response.bytes().await.map_err(classify_transport)?;
            (None, bytes.len() as i64)
        };
        let total_ms = started.elapsed().as_millis() as u64;

        Ok(Fetched {
            status,
            total_ms,
            ttfb_ms,
            cache_status,
            headers,
            content_length: header_length.or(Some(body_len)),
            content_type,
            final_url,
            body,
        })
    }
}

#[async_trait]
impl Crawler for HttpCrawler {
    async fn crawl(&self, request: &CrawlRequest) -> Result<CrawlOutcome, CrawlFailure> {
        let first = self.fetch(&request.url, request.find_links).await?;

        let discovered_links = match (&self.source, &first.body) {
            (Some(source), Some(body)) => {
                let mut links = source.extract_links(&request.url, body);
                links.truncate(self.config.max_links);
                links
            }
            _ => Vec::new(),
        };

        // A hit proves the cache is already warm; re-measuring it tells us
        // nothing about the warming effect.
        let second = if self.config.second_request
            && first.cache_status != CacheStatus::Hit
            && (200..400).contains(&first.status)
        {
            match self.fetch(&request.url, false).await {
                Ok(fetched) => Some(SecondAttempt {
                    status_code: fetched.status,
                    response_time_ms: fetched.total_ms,
                    cache_status: fetched.cache_status,
                    ttfb_ms: Some(fetched.ttfb_ms),
                }),
                Err(_) => None,
            }
        } else {
            None
        };

        let redirect_url = (first.final_url != request.url).then(|| first.final_url.clone());
        Ok(CrawlOutcome {
            status_code: first.status,
            response_time_ms: first.total_ms,
            cache_status: first.cache_status,
            timing: TimingBreakdown {
                dns_ms: None,
                connect_ms: None,
                tls_ms: None,
                ttfb_ms: Some(first.ttfb_ms),
                transfer_ms: Some(first.total_ms.saturating_sub(first.ttfb_ms)),
            },
            content_length: first.content_length,
            content_type: first.content_type,
            headers: first.headers,
            redirect_url,
            second,
            discovered_links,
        })
    }
}

fn classify_transport(err: reqwest::Error) -> CrawlFailure {
    CrawlFailure::transport(format!("{err:#}"))
}
