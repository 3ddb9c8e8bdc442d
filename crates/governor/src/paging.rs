//! Cursor pagination and batched submission
//!
//! Paged responses look like `{ "data": [...], "paging": { "cursors":
//! { "before", "after" }, "next", "previous" } }`. Cursors are opaque and are
//! only ever copied into the next request's `after` parameter.
//!
//! `PageStream` is pull-based: each `next_page()` call issues at most one
//! fetch. It owns a copy of the parameters it was built with and nothing
//! else, so restarting a traversal means building a new stream.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures_util::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ApiError, Result};

pub const DEFAULT_MAX_PAGES: usize = 100;
pub const DEFAULT_MAX_ITEMS: usize = 5000;
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_DELAY: Duration = Duration::from_millis(1000);

/// Query parameters for a page request. Ordered so URLs are reproducible.
pub type PageParams = BTreeMap<String, String>;

/// Boxed page future, for callers that need to name the fetch closure type.
pub type PageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<PageResult<T>>> + Send + 'a>>;

#[derive(Debug, Deserialize)]
struct RawPage<T> {
    data: Option<Vec<T>>,
    paging: Option<RawPaging>,
}

#[derive(Debug, Default, Deserialize)]
struct RawPaging {
    #[serde(default)]
    cursors: Option<PageCursors>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    previous: Option<String>,
}

/// Opaque position markers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursors {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

/// One normalized page.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult<T> {
    pub data: Vec<T>,
    pub cursors: PageCursors,
    pub next: Option<String>,
    pub previous: Option<String>,
    pub has_next_page: bool,
    pub has_previous_page: bool,
}

impl<T> PageResult<T> {
    fn from_raw(raw: RawPage<T>) -> Self {
        let paging = raw.paging.unwrap_or_default();
        let cursors = paging.cursors.unwrap_or_default();
        let has_next_page = paging.next.is_some() || cursors.after.is_some();
        let has_previous_page = paging.previous.is_some() || cursors.before.is_some();
        Self {
            data: raw.data.unwrap_or_default(),
            cursors,
            next: paging.next,
            previous: paging.previous,
            has_next_page,
            has_previous_page,
        }
    }

    /// Cursor for the following page: the `after` cursor, else the `after`
    /// parameter of the `next` link. A `before` cursor never moves forward.
    pub fn next_cursor(&self) -> Option<String> {
        self.cursors.after.clone().or_else(|| {
            let next = reqwest::Url::parse(self.next.as_deref()?).ok()?;
            query_value(&next, "after")
        })
    }

    /// Parameters for the following page, or `None` on the last page.
    pub fn next_params(&self, params: &PageParams) -> Option<PageParams> {
        if !self.has_next_page {
            return None;
        }
        let cursor = self.next_cursor()?;
        let mut next = params.clone();
        next.remove("before");
        next.insert("after".to_string(), cursor);
        Some(next)
    }
}

impl<T: DeserializeOwned> PageResult<T> {
    /// Normalize a raw JSON page.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let raw: RawPage<T> = serde_json::from_value(value)
            .map_err(|e| ApiError::processing(format!("malformed page response: {e}"), None))?;
        Ok(Self::from_raw(raw))
    }
}

/// Normalize a raw JSON page. Missing or null `data` becomes an empty list.
pub fn parse_page<T: DeserializeOwned>(raw: serde_json::Value) -> Result<PageResult<T>> {
    PageResult::from_value(raw)
}

/// Pull the `after` (preferred) or `before` query parameter out of a URL.
/// Malformed URLs yield `None`.
pub fn extract_cursor(url: &str) -> Option<String> {
    let url = reqwest::Url::parse(url).ok()?;
    query_value(&url, "after").or_else(|| query_value(&url, "before"))
}

/// First non-empty value of query parameter `name`.
fn query_value(url: &reqwest::Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(key, value)| key == name && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// Lazy multi-page traversal.
pub struct PageStream<T, F> {
    fetch: F,
    params: PageParams,
    max_pages: usize,
    pages_fetched: usize,
    done: bool,
    _item: std::marker::PhantomData<fn() -> T>,
}

impl<T, F, Fut> PageStream<T, F>
where
    F: FnMut(PageParams) -> Fut,
    Fut: Future<Output = Result<PageResult<T>>>,
{
    pub fn new(fetch: F, initial_params: PageParams, max_pages: usize) -> Self {
        Self {
            fetch,
            params: initial_params,
            max_pages,
            pages_fetched: 0,
            done: false,
            _item: std::marker::PhantomData,
        }
    }

    /// Fetch the next page's items. `None` once the last page has been
    /// returned, the page ceiling is reached, or a fetch has failed.
    pub async fn next_page(&mut self) -> Option<Result<Vec<T>>> {
        if self.done {
            return None;
        }
        if self.pages_fetched >= self.max_pages {
            debug!(max_pages = self.max_pages, "page ceiling reached");
            self.done = true;
            return None;
        }

        self.pages_fetched += 1;
        let page = match (self.fetch)(self.params.clone()).await {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        crate::metrics::record_page_fetched();

        match page.next_params(&self.params) {
            Some(next) => self.params = next,
            None => {
                if page.has_next_page {
                    warn!(
                        page = self.pages_fetched,
                        "next page advertised without a usable cursor, stopping"
                    );
                }
                self.done = true;
            }
        }
        debug!(
            page = self.pages_fetched,
            items = page.data.len(),
            more = !self.done,
            "page fetched"
        );
        Some(Ok(page.data))
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }

    /// Adapt into a `Stream` of page item batches.
    pub fn into_stream(self) -> impl Stream<Item = Result<Vec<T>>> {
        futures_util::stream::unfold(self, |mut pages| async move {
            pages.next_page().await.map(|item| (item, pages))
        })
    }
}

/// Start a lazy traversal from `initial_params`, fetching at most `max_pages`.
pub fn fetch_all_pages<T, F, Fut>(
    fetch: F,
    initial_params: PageParams,
    max_pages: usize,
) -> PageStream<T, F>
where
    F: FnMut(PageParams) -> Fut,
    Fut: Future<Output = Result<PageResult<T>>>,
{
    PageStream::new(fetch, initial_params, max_pages)
}

/// Drain a traversal into one list of at most `max_items` elements.
///
/// Stops fetching as soon as the ceiling is reached; surplus items from the
/// final page are dropped.
pub async fn collect_all_pages<T, F, Fut>(
    fetch: F,
    initial_params: PageParams,
    max_pages: usize,
    max_items: usize,
) -> Result<Vec<T>>
where
    F: FnMut(PageParams) -> Fut,
    Fut: Future<Output = Result<PageResult<T>>>,
{
    let mut pages = fetch_all_pages(fetch, initial_params, max_pages);
    let mut items = Vec::new();

    while items.len() < max_items {
        let Some(page) = pages.next_page().await else {
            break;
        };
        let page = page?;
        let room = max_items - items.len();
        if page.len() > room {
            debug!(dropped = page.len() - room, max_items, "item ceiling reached, truncating page");
        }
        items.extend(page.into_iter().take(room));
    }

    Ok(items)
}

/// Split `items` into contiguous chunks of `batch_size` (the last may be
/// shorter). A zero batch size is treated as one.
pub fn create_batches<T: Clone>(items: &[T], batch_size: usize) -> Vec<Vec<T>> {
    items
        .chunks(batch_size.max(1))
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// Submit `items` to `processor` in order, `batch_size` at a time, sleeping
/// `delay` between submissions (never after the last).
///
/// The first failing batch aborts the run; later batches are not submitted.
pub async fn process_batches<T, R, E, F, Fut>(
    items: Vec<T>,
    mut processor: F,
    batch_size: usize,
    delay: Duration,
) -> std::result::Result<Vec<R>, E>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = std::result::Result<Vec<R>, E>>,
{
    let batch_size = batch_size.max(1);
    let total = items.len().div_ceil(batch_size);
    let mut results = Vec::with_capacity(items.len());
    let mut remaining = items.into_iter().peekable();
    let mut index = 0usize;

    while remaining.peek().is_some() {
        let batch: Vec<T> = remaining.by_ref().take(batch_size).collect();
        index += 1;
        debug!(batch = index, total, size = batch.len(), "submitting batch");
        results.extend(processor(batch).await?);

        if remaining.peek().is_some() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    /// Fetcher over an in-memory list of pages keyed by `after` cursor.
    /// Records the params of every call.
    fn scripted(
        pages: Vec<serde_json::Value>,
        calls: Arc<Mutex<Vec<PageParams>>>,
    ) -> impl FnMut(PageParams) -> std::future::Ready<Result<PageResult<i64>>> {
        move |params: PageParams| {
            calls.lock().unwrap().push(params.clone());
            let index = params
                .get("after")
                .map(|c| c.trim_start_matches('c').parse::<usize>().unwrap())
                .unwrap_or(0);
            std::future::ready(parse_page(pages[index].clone()))
        }
    }

    /// An endless source: every page has `size` items and a next cursor.
    fn endless(
        size: i64,
        calls: Arc<Mutex<usize>>,
    ) -> impl FnMut(PageParams) -> std::future::Ready<Result<PageResult<i64>>> {
        move |_params: PageParams| {
            let n = {
                let mut calls = calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            let data: Vec<i64> = (0..size).collect();
            std::future::ready(parse_page(json!({
                "data": data,
                "paging": { "cursors": { "after": format!("c{n}") } }
            })))
        }
    }

    fn three_pages() -> Vec<serde_json::Value> {
        vec![
            json!({ "data": [1, 2], "paging": { "cursors": { "after": "c1" }, "next": "https://graph.example/v19.0/act_1/ads?after=c1" } }),
            json!({ "data": [3, 4], "paging": { "cursors": { "before": "c0", "after": "c2" } } }),
            json!({ "data": [5], "paging": { "cursors": { "before": "c1" }, "previous": "https://graph.example/v19.0/act_1/ads?before=c1" } }),
        ]
    }

    #[test]
    fn parse_page_derives_flags() {
        let page: PageResult<i64> = parse_page(three_pages()[1].clone()).unwrap();
        assert_eq!(page.data, vec![3, 4]);
        assert!(page.has_next_page);
        assert!(page.has_previous_page);
        assert_eq!(page.cursors.after.as_deref(), Some("c2"));
    }

    #[test]
    fn parse_page_next_link_alone_means_more() {
        let page: PageResult<i64> =
            parse_page(json!({ "data": [], "paging": { "next": "https://x/y?after=zz" } })).unwrap();
        assert!(page.has_next_page);
        assert!(!page.has_previous_page);
        assert_eq!(page.next_cursor().as_deref(), Some("zz"));
    }

    #[test]
    fn parse_page_missing_data_is_empty() {
        let page: PageResult<i64> = parse_page(json!({})).unwrap();
        assert!(page.data.is_empty());
        assert!(!page.has_next_page);
        assert!(!page.has_previous_page);

        let page: PageResult<i64> = parse_page(json!({ "data": null })).unwrap();
        assert!(page.data.is_empty());
    }

    #[test]
    fn parse_page_accepts_items_without_default() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Campaign {
            id: String,
            status: CampaignStatus,
        }

        #[derive(Debug, Deserialize, PartialEq)]
        enum CampaignStatus {
            #[serde(rename = "ACTIVE")]
            Active,
        }

        let page: PageResult<Campaign> = parse_page(json!({
            "data": [{ "id": "c_1", "status": "ACTIVE" }],
            "paging": { "cursors": { "after": "c1" } }
        }))
        .unwrap();
        assert_eq!(
            page.data,
            vec![Campaign {
                id: "c_1".into(),
                status: CampaignStatus::Active,
            }]
        );

        let page: PageResult<Campaign> = parse_page(json!({})).unwrap();
        assert!(page.data.is_empty());
    }

    #[test]
    fn parse_page_rejects_non_list_data() {
        let err = parse_page::<i64>(json!({ "data": "nope" })).unwrap_err();
        assert!(err.message().contains("malformed page"), "got: {err}");
    }

    #[test]
    fn extract_cursor_prefers_after() {
        assert_eq!(
            extract_cursor("https://graph.example/v19.0/act_1/ads?before=b1&limit=25&after=a1")
                .as_deref(),
            Some("a1")
        );
        assert_eq!(
            extract_cursor("https://graph.example/v19.0/act_1/ads?before=b1").as_deref(),
            Some("b1")
        );
    }

    #[test]
    fn extract_cursor_handles_garbage() {
        assert_eq!(extract_cursor("not a url"), None);
        assert_eq!(extract_cursor("https://graph.example/act_1/ads"), None);
        assert_eq!(extract_cursor("https://graph.example/act_1/ads?after="), None);
    }

    #[test]
    fn next_params_replaces_cursor_and_keeps_filters() {
        let page: PageResult<i64> = parse_page(three_pages()[1].clone()).unwrap();
        let mut params = PageParams::new();
        params.insert("fields".into(), "id,name".into());
        params.insert("before".into(), "old".into());

        let next = page.next_params(&params).unwrap();
        assert_eq!(next.get("after").map(String::as_str), Some("c2"));
        assert_eq!(next.get("fields").map(String::as_str), Some("id,name"));
        assert!(!next.contains_key("before"));
    }

    #[test]
    fn next_link_with_only_before_is_not_followed() {
        let page: PageResult<i64> = parse_page(json!({
            "data": [1],
            "paging": { "next": "https://graph.example/v19.0/act_1/ads?before=b9" }
        }))
        .unwrap();
        assert!(page.has_next_page);
        assert_eq!(page.next_cursor(), None);
        assert_eq!(page.next_params(&PageParams::new()), None);
    }

    #[tokio::test]
    async fn traversal_stops_on_backward_only_next_link() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let mut pages = fetch_all_pages(
            move |_params: PageParams| {
                *counter.lock().unwrap() += 1;
                std::future::ready(parse_page::<i64>(json!({
                    "data": [7],
                    "paging": { "next": "https://graph.example/v19.0/act_1/ads?before=b9" }
                })))
            },
            PageParams::new(),
            10,
        );

        assert_eq!(pages.next_page().await.unwrap().unwrap(), vec![7]);
        assert!(pages.next_page().await.is_none());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn traversal_follows_cursors_to_the_end() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut pages = fetch_all_pages(scripted(three_pages(), calls.clone()), PageParams::new(), 100);

        assert_eq!(pages.next_page().await.unwrap().unwrap(), vec![1, 2]);
        assert_eq!(pages.next_page().await.unwrap().unwrap(), vec![3, 4]);
        assert_eq!(pages.next_page().await.unwrap().unwrap(), vec![5]);
        assert!(pages.next_page().await.is_none());
        assert_eq!(pages.pages_fetched(), 3);

        let calls = calls.lock().unwrap();
        assert_eq!(calls[0].get("after"), None);
        assert_eq!(calls[1].get("after").map(String::as_str), Some("c1"));
        assert_eq!(calls[2].get("after").map(String::as_str), Some("c2"));
    }

    #[tokio::test]
    async fn traversal_never_exceeds_max_pages() {
        let calls = Arc::new(Mutex::new(0));
        let mut pages = fetch_all_pages(endless(10, calls.clone()), PageParams::new(), 4);

        let mut seen = 0;
        while let Some(page) = pages.next_page().await {
            page.unwrap();
            seen += 1;
        }
        assert_eq!(seen, 4);
        assert_eq!(*calls.lock().unwrap(), 4);
    }

    #[tokio::test]
    async fn traversal_stops_after_error() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let mut pages = fetch_all_pages(
            move |_params: PageParams| {
                *counter.lock().unwrap() += 1;
                std::future::ready(Err::<PageResult<i64>, _>(ApiError::processing("boom", Some(500))))
            },
            PageParams::new(),
            10,
        );

        assert!(pages.next_page().await.unwrap().is_err());
        assert!(pages.next_page().await.is_none());
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn fresh_params_restart_independently() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut first = fetch_all_pages(scripted(three_pages(), calls.clone()), PageParams::new(), 100);
        first.next_page().await.unwrap().unwrap();
        first.next_page().await.unwrap().unwrap();

        let mut second = fetch_all_pages(scripted(three_pages(), calls.clone()), PageParams::new(), 100);
        assert_eq!(second.next_page().await.unwrap().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn into_stream_yields_each_page() {
        use futures_util::StreamExt;

        let calls = Arc::new(Mutex::new(Vec::new()));
        let stream = fetch_all_pages(scripted(three_pages(), calls), PageParams::new(), 100).into_stream();
        let pages: Vec<Vec<i64>> = stream.map(|page| page.unwrap()).collect().await;
        assert_eq!(pages, vec![vec![1, 2], vec![3, 4], vec![5]]);
    }

    #[tokio::test]
    async fn collect_truncates_to_max_items() {
        let calls = Arc::new(Mutex::new(0));
        let items = collect_all_pages(endless(30, calls.clone()), PageParams::new(), 100, 75)
            .await
            .unwrap();

        assert_eq!(items.len(), 75);
        // 30 + 30 + 15 of the third page; no fourth fetch
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn collect_respects_page_ceiling() {
        let calls = Arc::new(Mutex::new(0));
        let items = collect_all_pages(endless(10, calls.clone()), PageParams::new(), 3, 5000)
            .await
            .unwrap();
        assert_eq!(items.len(), 30);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn collect_gathers_everything_when_under_limits() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let items = collect_all_pages(scripted(three_pages(), calls), PageParams::new(), 100, 5000)
            .await
            .unwrap();
        assert_eq!(items, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn collect_with_zero_limit_fetches_nothing() {
        let calls = Arc::new(Mutex::new(0));
        let items = collect_all_pages(endless(10, calls.clone()), PageParams::new(), 100, 0)
            .await
            .unwrap();
        assert!(items.is_empty());
        assert_eq!(*calls.lock().unwrap(), 0);
    }

    #[test]
    fn create_batches_splits_contiguously() {
        let items: Vec<u32> = (0..120).collect();
        let batches = create_batches(&items, 50);
        let sizes: Vec<usize> = batches.iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![50, 50, 20]);
        assert_eq!(batches[1][0], 50);
        assert_eq!(batches[2][19], 119);
    }

    #[test]
    fn create_batches_edge_sizes() {
        assert!(create_batches::<u32>(&[], 50).is_empty());
        assert_eq!(create_batches(&[1, 2, 3], 0).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn process_batches_throttles_between_batches_only() {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let recorded = sizes.clone();
        let start = Instant::now();

        let items: Vec<u32> = (0..120).collect();
        let results = process_batches(
            items,
            move |batch: Vec<u32>| {
                recorded.lock().unwrap().push(batch.len());
                async move { Ok::<_, ApiError>(batch.into_iter().map(|i| i * 2).collect::<Vec<_>>()) }
            },
            50,
            Duration::from_millis(1000),
        )
        .await
        .unwrap();

        assert_eq!(*sizes.lock().unwrap(), vec![50, 50, 20]);
        assert_eq!(results.len(), 120);
        assert_eq!(results[119], 238);
        // Two inter-batch delays, none after the final batch
        assert_eq!(start.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn process_batches_aborts_on_first_failure() {
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let items: Vec<u32> = (0..150).collect();
        let result = process_batches(
            items,
            move |batch: Vec<u32>| {
                let n = {
                    let mut calls = counter.lock().unwrap();
                    *calls += 1;
                    *calls
                };
                async move {
                    if n == 2 {
                        Err(ApiError::Validation {
                            message: format!("batch starting at {} rejected", batch[0]),
                            detail: Default::default(),
                        })
                    } else {
                        Ok(batch)
                    }
                }
            },
            50,
            Duration::from_millis(1000),
        )
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.message(), "batch starting at 50 rejected");
        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn process_batches_single_batch_has_no_delay() {
        let start = Instant::now();
        let results = process_batches(
            vec![1, 2, 3],
            |batch: Vec<i32>| async move { Ok::<_, ApiError>(batch) },
            DEFAULT_BATCH_SIZE,
            DEFAULT_BATCH_DELAY,
        )
        .await
        .unwrap();
        assert_eq!(results, vec![1, 2, 3]);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
