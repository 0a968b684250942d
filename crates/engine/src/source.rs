//! The URL-source capability: sitemap discovery and HTML link extraction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;

/// URLs discovered for a domain, plus the robots.txt crawl-delay when one
/// was advertised.
#[derive(Debug, Clone, Default)]
pub struct DomainUrls {
    pub urls: Vec<String>,
    pub crawl_delay_secs: Option<f64>,
    /// The sitemap the URLs came from (recorded as task source metadata).
    pub sitemap_url: Option<String>,
}

/// Where URLs come from: sitemap enumeration up front, link extraction
/// mid-crawl.
#[async_trait]
pub trait UrlSource: Send + Sync + 'static {
    async fn discover(&self, domain: &str) -> anyhow::Result<DomainUrls>;
    fn extract_links(&self, base_url: &str, html: &str) -> Vec<String>;
}

/// reqwest-backed sitemap source: robots.txt for sitemap locations and
/// crawl-delay, then `<loc>` entries from the sitemaps (indexes recursed).
pub struct SitemapSource {
    http: reqwest::Client,
    max_urls: usize,
    max_sitemaps: usize,
}

impl SitemapSource {
    pub fn new(user_agent: &str, timeout: Duration, max_urls: usize) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()?;
        Ok(Self {
            http,
            max_urls: max_urls.max(1),
            max_sitemaps: 50,
        })
    }

    async fn fetch_text(&self, url: &str) -> anyhow::Result<String> {
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("http {} fetching {url}", response.status());
        }
        Ok(response.text().await?)
    }
}

#[async_trait]
impl UrlSource for SitemapSource {
    async fn discover(&self, domain: &str) -> anyhow::Result<DomainUrls> {
        let robots = self
            .fetch_text(&format!("https://{domain}/robots.txt"))
            .await
            .unwrap_or_default();
        let (mut sitemaps, crawl_delay_secs) = parse_robots(&robots);
        if sitemaps.is_empty() {
            sitemaps.push(format!("https://{domain}/sitemap.xml"));
        }
        let first_sitemap = sitemaps.first().cloned();

        let mut queue: VecDeque<String> = sitemaps.into();
        let mut seen: HashSet<String> = queue.iter().cloned().collect();
        let mut urls = Vec::new();
        let mut fetched = 0usize;

        while let Some(sitemap_url) = queue.pop_front() {
            if fetched >= self.max_sitemaps || urls.len() >= self.max_urls {
                break;
            }
            fetched += 1;
            let xml = match self.fetch_text(&sitemap_url).await {
                Ok(xml) => xml,
                Err(err) => {
                    tracing::debug!(sitemap_url = %sitemap_url, "sitemap fetch failed: {err:#}");
                    continue;
                }
            };
            let locs = extract_tag_values(&xml, "loc");
            if xml.contains("<sitemapindex") {
                for loc in locs {
                    if seen.insert(loc.clone()) {
                        queue.push_back(loc);
                    }
                }
            } else {
                for loc in locs {
                    if urls.len() >= self.max_urls {
                        break;
                    }
                    urls.push(loc);
                }
            }
        }

        Ok(DomainUrls {
            urls,
            crawl_delay_secs,
            sitemap_url: first_sitemap,
        })
    }

    fn extract_links(&self, base_url: &str, html: &str) -> Vec<String> {
        extract_hrefs(base_url, html)
    }
}

/// Sitemap locations and crawl-delay from a robots.txt body.
fn parse_robots(robots: &str) -> (Vec<String>, Option<f64>) {
    let mut sitemaps = Vec::new();
    let mut crawl_delay = None;
    for line in robots.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "sitemap" if !value.is_empty() => sitemaps.push(value.to_string()),
            "crawl-delay" => {
                if let Ok(secs) = value.parse::<f64>() {
                    if secs >= 0.0 {
                        // Multiple agent sections: keep the strictest delay.
                        crawl_delay = Some(crawl_delay.map_or(secs, |prev: f64| prev.max(secs)));
                    }
                }
            }
            _ => {}
        }
    }
    (sitemaps, crawl_delay)
}

/// Values of `<tag>…</tag>` elements, CDATA unwrapped.
fn extract_tag_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        rest = &rest[start + open.len()..];
        let Some(end) = rest.find(&close) else { break };
        let raw = rest[..end].trim();
        let value = raw
            .strip_prefix("<![CDATA[")
            .and_then(|v| v.strip_suffix("]]>"))
            .unwrap_or(raw)
            .trim();
        if !value.is_empty() {
            values.push(value.to_string());
        }
        rest = &rest[end + close.len()..];
    }
    values
}

/// `href` targets resolved against the base URL; http(s) only.
fn extract_hrefs(base_url: &str, html: &str) -> Vec<String> {
    let Ok(base) = reqwest::Url::parse(base_url) else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for quote in ['"', '\''] {
        let marker = format!("href={quote}");
        let mut rest = html;
        while let Some(start) = rest.find(&marker) {
            rest = &rest[start + marker.len()..];
            let Some(end) = rest.find(quote) else { break };
            let raw = rest[..end].trim();
            rest = &rest[end + 1..];
            if raw.is_empty() || raw.starts_with('#') || raw.starts_with("javascript:") {
                continue;
            }
            let Ok(resolved) = base.join(raw) else {
                continue;
            };
            if !matches!(resolved.scheme(), "http" | "https") {
                continue;
            }
            let mut resolved = resolved;
            resolved.set_fragment(None);
            let url = resolved.to_string();
            if seen.insert(url.clone()) {
                links.push(url);
            }
        }
    }
    links
}

/// Scripted source for tests and the development profile.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    pub urls: Vec<String>,
    pub crawl_delay_secs: Option<f64>,
    /// Links "found" on a page, keyed by page URL.
    pub links: HashMap<String, Vec<String>>,
}

impl StaticSource {
    pub fn with_urls<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl UrlSource for StaticSource {
    async fn discover(&self, _domain: &str) -> anyhow::Result<DomainUrls> {
        Ok(DomainUrls {
            urls: self.urls.clone(),
            crawl_delay_secs: self.crawl_delay_secs,
            sitemap_url: None,
        })
    }

    fn extract_links(&self, base_url: &str, _html: &str) -> Vec<String> {
        self.links.get(base_url).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn robots_parsing() {
        let robots = "User-agent: *\n\
                      Crawl-delay: 2\n\
                      Sitemap: https://example.com/sitemap.xml\n\
                      User-agent: other\n\
                      Crawl-delay: 5\n\
                      # Sitemap: https://example.com/ignored.xml\n";
        let (sitemaps, delay) = parse_robots(robots);
        assert_eq!(sitemaps, vec!["https://example.com/sitemap.xml".to_string()]);
        assert_eq!(delay, Some(5.0));
    }

    #[test]
    fn loc_extraction_handles_cdata() {
        let xml = "<urlset>\
                     <url><loc>https://example.com/a</loc></url>\
                     <url><loc><![CDATA[https://example.com/b]]></loc></url>\
                     <url><loc>  </loc></url>\
                   </urlset>";
        assert_eq!(
            extract_tag_values(xml, "loc"),
            vec![
                "https://example.com/a".to_string(),
                "https://example.com/b".to_string(),
            ]
        );
    }

    #[test]
    fn href_extraction_resolves_and_filters() {
        let html = r##"<a href="/docs">docs</a>
                       <a href="https://example.com/abs">abs</a>
                       <a href="https://other.org/page">other</a>
                       <a href="#frag">frag</a>
                       <a href="mailto:x@example.com">mail</a>
                       <a href='/docs'>duplicate</a>"##;
        let links = extract_hrefs("https://example.com/start", html);
        assert_eq!(
            links,
            vec![
                "https://example.com/docs".to_string(),
                "https://example.com/abs".to_string(),
                "https://other.org/page".to_string(),
            ]
        );
    }
}
