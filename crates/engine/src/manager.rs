//! Job lifecycle: creation, URL seeding, discovered-link ingestion and
//! cancellation.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use warmfront_core::filter::{FilterDecision, PathFilters};
use warmfront_core::model::{Job, JobOptions, SourceKind};
use warmfront_store::{EnqueueEntry, EnqueueOutcome, Store, StoreResult};

use crate::source::UrlSource;

/// Creates jobs and materialises their tasks from the URL source.
pub struct JobManager {
    store: Arc<dyn Store>,
    source: Arc<dyn UrlSource>,
}

impl JobManager {
    pub fn new(store: Arc<dyn Store>, source: Arc<dyn UrlSource>) -> Arc<Self> {
        Arc::new(Self { store, source })
    }

    /// Insert the job and start seeding its tasks.
    ///
    /// Seeding is asynchronous: the job is returned in `pending` status
    /// immediately and transitions to `running` when the first task is
    /// claimed.
    pub async fn create_job(&self, options: JobOptions) -> StoreResult<Job> {
        let job = self.store.create_job(&options).await?;
        info!(job_id = %job.id, domain = %job.domain, "job created, seeding URLs");

        let store = self.store.clone();
        let source = self.source.clone();
        let seeded = job.clone();
        tokio::spawn(async move {
            seed_job(store, source, seeded).await;
        });
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> StoreResult<Job> {
        self.store.get_job(job_id).await
    }

    /// Cancel: terminal `cancelled`, queued tasks skipped, in-flight tasks
    /// drain naturally.
    pub async fn cancel_job(&self, job_id: &str) -> StoreResult<Job> {
        let job = self.store.cancel_job(job_id).await?;
        info!(job_id = %job.id, "job cancelled");
        Ok(job)
    }

    /// Enqueue links found mid-crawl (`find_links` jobs). Filters and the
    /// `max_pages` cap apply on every call, same as the initial seeding.
    pub async fn ingest_discovered(
        &self,
        job_id: &str,
        links: Vec<String>,
    ) -> StoreResult<EnqueueOutcome> {
        let job = self.store.get_job(job_id).await?;
        if !job.find_links || job.status.is_terminal() {
            return Ok(EnqueueOutcome::default());
        }
        let outcome = enqueue_urls(&self.store, &job, &links, SourceKind::Discovered, None).await?;
        if outcome.inserted > 0 {
            debug!(job_id = %job.id, inserted = outcome.inserted, "discovered links enqueued");
        }
        Ok(outcome)
    }
}

/// Collect the job's URLs from the source and enqueue them.
async fn seed_job(store: Arc<dyn Store>, source: Arc<dyn UrlSource>, job: Job) {
    let discovered = match source.discover(&job.domain).await {
        Ok(discovered) => discovered,
        Err(err) => {
            warn!(job_id = %job.id, domain = %job.domain, "URL discovery failed: {err:#}");
            let message = format!("url discovery failed: {err:#}");
            let _ = store.set_job_error_message(&job.id, &message).await;
            // A job with zero tasks completes immediately.
            let _ = store.complete_job_if_done(&job.id).await;
            return;
        }
    };

    if let Some(delay) = discovered.crawl_delay_secs {
        if let Err(err) = store
            .set_domain_crawl_delay(job.domain_id, Some(delay))
            .await
        {
            debug!(job_id = %job.id, "storing crawl-delay failed: {err}");
        }
    }

    match enqueue_urls(
        &store,
        &job,
        &discovered.urls,
        SourceKind::Sitemap,
        discovered.sitemap_url,
    )
    .await
    {
        Ok(outcome) => {
            info!(
                job_id = %job.id,
                inserted = outcome.inserted,
                excluded = outcome.excluded,
                capped = outcome.capped,
                "job seeded"
            );
            if outcome.inserted == 0 {
                let _ = store
                    .set_job_error_message(&job.id, "no crawlable URLs found for domain")
                    .await;
                let _ = store.complete_job_if_done(&job.id).await;
            }
        }
        Err(err) => {
            warn!(job_id = %job.id, "seeding enqueue failed: {err}");
            let message = format!("seeding enqueue failed: {err}");
            let _ = store.set_job_error_message(&job.id, &message).await;
        }
    }
}

/// Filter, deduplicate and enqueue one batch of URLs for a job.
async fn enqueue_urls(
    store: &Arc<dyn Store>,
    job: &Job,
    urls: &[String],
    source: SourceKind,
    source_url: Option<String>,
) -> StoreResult<EnqueueOutcome> {
    let filters = PathFilters::new(&job.include_paths, &job.exclude_paths);
    let mut seen = HashSet::new();
    let mut paths: Vec<(String, bool)> = Vec::new();
    for url in urls {
        let Some(path) = path_for_domain(url, &job.domain) else {
            continue;
        };
        if !seen.insert(path.clone()) {
            continue;
        }
        let excluded = filters.decide(&path) == FilterDecision::Excluded;
        paths.push((path, excluded));
    }
    if paths.is_empty() {
        return Ok(EnqueueOutcome::default());
    }

    let path_list: Vec<String> = paths.iter().map(|(path, _)| path.clone()).collect();
    let page_ids = store.get_or_create_pages(job.domain_id, &path_list).await?;
    let entries: Vec<EnqueueEntry> = page_ids
        .into_iter()
        .zip(paths)
        .map(|(page_id, (path, excluded))| EnqueueEntry {
            page_id,
            path,
            source,
            source_url: source_url.clone(),
            priority: source.base_priority(),
            excluded,
        })
        .collect();
    store.enqueue_tasks(&job.id, &entries).await
}

/// Reduce a discovered URL to request-URI form when it belongs to the job's
/// domain (`www.` treated as equivalent); everything else is off-site and
/// dropped.
fn path_for_domain(url: &str, domain: &str) -> Option<String> {
    if url.starts_with('/') {
        return Some(url.to_string());
    }
    let parsed = reqwest::Url::parse(url).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?;
    if !host_matches(host, domain) {
        return None;
    }
    let mut path = parsed.path().to_string();
    if path.is_empty() {
        path.push('/');
    }
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }
    Some(path)
}

fn host_matches(host: &str, domain: &str) -> bool {
    host == domain
        || host.strip_prefix("www.") == Some(domain)
        || domain.strip_prefix("www.") == Some(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_reduce_to_request_uri_form() {
        assert_eq!(
            path_for_domain("https://example.com/docs/intro", "example.com"),
            Some("/docs/intro".to_string())
        );
        assert_eq!(
            path_for_domain("https://example.com/search?q=bees&page=2", "example.com"),
            Some("/search?q=bees&page=2".to_string())
        );
        assert_eq!(
            path_for_domain("https://example.com", "example.com"),
            Some("/".to_string())
        );
        assert_eq!(path_for_domain("/relative", "example.com"), Some("/relative".to_string()));
    }

    #[test]
    fn off_site_urls_are_dropped() {
        assert_eq!(path_for_domain("https://other.org/a", "example.com"), None);
        assert_eq!(path_for_domain("ftp://example.com/a", "example.com"), None);
        assert_eq!(path_for_domain("not a url", "example.com"), None);
    }

    #[test]
    fn www_is_equivalent() {
        assert_eq!(
            path_for_domain("https://www.example.com/a", "example.com"),
            Some("/a".to_string())
        );
        assert_eq!(
            path_for_domain("https://example.com/a", "www.example.com"),
            Some("/a".to_string())
        );
    }
}
