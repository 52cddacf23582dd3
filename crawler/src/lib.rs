//! Breadth-first web crawler feeding the index store.
//!
//! The crawler visits each URL at most once per run, fetches and parses
//! pages, short-circuits on unmodified documents, and replaces a
//! document's index entries atomically through the store.

use anyhow::Result;
use quarry_core::{analyzer, DocumentUpdate, Store};
use scraper::{Html, Selector};
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use time::format_description::well_known::{Rfc2822, Rfc3339};
use time::OffsetDateTime;
use url::Url;

/// Per-page failure classification. Any of these is logged and skipped;
/// the crawl itself keeps going.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("parse failed: {0}")]
    Parse(String),
    #[error("storage conflict: {0}")]
    Storage(#[from] anyhow::Error),
}

pub struct FetchedPage {
    pub html: String,
}

/// Fetches one page. Abstracted so tests can crawl an in-memory site.
pub trait PageFetcher {
    fn fetch(&self, url: &Url) -> impl Future<Output = Result<FetchedPage, PageError>> + Send;
}

/// Production fetcher over a shared reqwest client. Non-2xx statuses,
/// network errors and timeouts all surface as `PageError::Fetch`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration, user_agent: &str) -> Result<HttpFetcher> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()?;
        Ok(HttpFetcher { client })
    }
}

impl PageFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, PageError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PageError::Fetch(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(PageError::Fetch(format!("{status} for {url}")));
        }
        let html = resp
            .text()
            .await
            .map_err(|e| PageError::Fetch(e.to_string()))?;
        Ok(FetchedPage { html })
    }
}

/// What one page parses into before indexing. Missing pieces degrade
/// per-field: no title means no title indexing, no body means size 0.
#[derive(Debug)]
pub struct ParsedPage {
    pub last_modified: Option<i64>,
    pub title: Option<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub links: Vec<Url>,
}

/// Extract last-modified, title, body text and absolute http(s) links
/// from an HTML page.
pub fn parse_page(html: &str, base: &Url) -> ParsedPage {
    let sel_title = Selector::parse("title").expect("valid selector");
    let sel_body = Selector::parse("body").expect("valid selector");
    let sel_a = Selector::parse("a[href]").expect("valid selector");
    let sel_meta = Selector::parse(r#"meta[name="last-modified"]"#).expect("valid selector");

    let doc = Html::parse_document(html);

    let last_modified = doc
        .select(&sel_meta)
        .next()
        .and_then(|m| m.value().attr("content"))
        .and_then(parse_http_date);

    let title = doc
        .select(&sel_title)
        .next()
        .map(|n| n.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty());

    let body = doc.select(&sel_body).next();
    let body_text = body.map(|n| n.text().collect::<String>());
    let body_html = body.map(|n| n.html());

    let mut links = Vec::new();
    if let Some(body) = body {
        for a in body.select(&sel_a) {
            if let Some(href) = a.value().attr("href") {
                if let Ok(u) = Url::parse(href).or_else(|_| base.join(href)) {
                    if u.scheme().starts_with("http") {
                        links.push(u);
                    }
                }
            }
        }
    }

    ParsedPage {
        last_modified,
        title,
        body_text,
        body_html,
        links,
    }
}

fn parse_http_date(raw: &str) -> Option<i64> {
    OffsetDateTime::parse(raw, &Rfc2822)
        .or_else(|_| OffsetDateTime::parse(raw, &Rfc3339))
        .ok()
        .map(|t| t.unix_timestamp())
}

/// Fragment-stripped form of a URL, used as the dedup key and the
/// document's stored url.
pub fn normalize(url: &Url) -> String {
    let mut u = url.clone();
    u.set_fragment(None);
    u.to_string()
}

/// BFS frontier where enqueue is a no-op for anything already queued or
/// already visited this run.
#[derive(Default)]
struct UniqueQueue {
    queue: VecDeque<String>,
    seen: HashSet<String>,
}

impl UniqueQueue {
    fn enqueue(&mut self, url: String) {
        if self.seen.insert(url.clone()) {
            self.queue.push_back(url);
        }
    }

    fn dequeue(&mut self) -> Option<String> {
        self.queue.pop_front()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlStats {
    pub fetched: usize,
    pub indexed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub discovered: usize,
}

pub struct Crawler<F> {
    store: Store,
    fetcher: F,
    max_docs: usize,
}

impl<F: PageFetcher> Crawler<F> {
    pub fn new(store: Store, fetcher: F) -> Crawler<F> {
        Crawler::with_limit(store, fetcher, usize::MAX)
    }

    pub fn with_limit(store: Store, fetcher: F, max_docs: usize) -> Crawler<F> {
        Crawler {
            store,
            fetcher,
            max_docs,
        }
    }

    /// Breadth-first traversal from the seed, indexing each reachable
    /// page at most once. Per-page failures are logged and counted, never
    /// fatal. Re-running against an unchanged site re-indexes nothing.
    pub async fn crawl(&self, seed: &str) -> Result<CrawlStats> {
        let seed =
            Url::parse(seed).or_else(|_| Url::parse(&format!("https://{seed}")))?;
        // Stands in for last-modified on pages that do not declare one.
        let started_at = OffsetDateTime::now_utc().unix_timestamp();
        let mut stats = CrawlStats::default();
        let mut frontier = UniqueQueue::default();
        frontier.enqueue(normalize(&seed));

        while let Some(url) = frontier.dequeue() {
            if stats.fetched >= self.max_docs {
                tracing::info!(max_docs = self.max_docs, "page limit reached");
                break;
            }
            let url = match Url::parse(&url) {
                Ok(u) => u,
                Err(e) => {
                    stats.failed += 1;
                    tracing::warn!(url = %url, error = %PageError::Parse(e.to_string()), "bad url in frontier");
                    continue;
                }
            };
            if let Err(err) = self
                .process(&url, started_at, &mut frontier, &mut stats)
                .await
            {
                stats.failed += 1;
                tracing::warn!(url = %url, error = %err, "page failed, continuing");
            }
        }

        self.store.flush()?;
        tracing::info!(
            fetched = stats.fetched,
            indexed = stats.indexed,
            skipped = stats.skipped,
            failed = stats.failed,
            discovered = stats.discovered,
            "crawl complete"
        );
        Ok(stats)
    }

    async fn process(
        &self,
        url: &Url,
        started_at: i64,
        frontier: &mut UniqueQueue,
        stats: &mut CrawlStats,
    ) -> Result<(), PageError> {
        let doc = self.store.resolve_or_create(url.as_str())?;
        let page = self.fetcher.fetch(url).await?;
        stats.fetched += 1;

        let parsed = parse_page(&page.html, url);
        let last_modified = parsed.last_modified.unwrap_or(started_at);

        // A page that declares no timestamp is always treated as stale;
        // only a declared one can short-circuit against the stored value.
        if let (Some(declared), Some(stored)) = (parsed.last_modified, doc.last_modified) {
            if declared <= stored {
                // Unchanged page: skip re-indexing but keep traversing
                // through its previously stored links.
                stats.skipped += 1;
                tracing::debug!(url = %url, "unmodified, skipping reindex");
                for child in self.store.children(doc.id)? {
                    if let Some(child_doc) = self.store.document(child)? {
                        frontier.enqueue(child_doc.url);
                    }
                }
                return Ok(());
            }
        }

        let title_tokens = parsed
            .title
            .as_deref()
            .map(analyzer::analyze)
            .unwrap_or_default();
        let body_tokens = parsed
            .body_text
            .as_deref()
            .map(analyzer::analyze)
            .unwrap_or_default();

        let mut children = Vec::with_capacity(parsed.links.len());
        for link in &parsed.links {
            let key = normalize(link);
            let child = self.store.resolve_or_create(&key)?;
            children.push(child.id);
            frontier.enqueue(key);
        }
        stats.discovered += children.len();

        self.store.reindex(
            doc.id,
            DocumentUpdate {
                title: parsed.title,
                content: parsed.body_html,
                last_modified,
                title_tokens,
                body_tokens,
                children,
            },
        )?;
        stats.indexed += 1;
        tracing::debug!(url = %url, doc_id = doc.id, "indexed");
        Ok(())
    }
}
