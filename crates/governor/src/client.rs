//! Governed access to the remote API
//!
//! Every attempt, including each retry, is admitted by the account's rate
//! limiter before it reaches the transport. Non-success responses are
//! classified, and the retry policy decides whether to go again.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;
use transport::{ApiRequest, Method, Transport};

use crate::classify::classify_response;
use crate::error::{ApiError, RemoteDetail, Result};
use crate::paging::{
    PageFuture, PageParams, PageResult, PageStream, collect_all_pages, fetch_all_pages, parse_page,
};
use crate::rate_limit::RateLimiter;
use crate::retry::RetryPolicy;

pub struct GovernedClient {
    transport: Arc<dyn Transport>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    base_url: String,
    api_version: String,
}

impl GovernedClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        limiter: Arc<RateLimiter>,
        base_url: impl Into<String>,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            limiter,
            retry: RetryPolicy::default(),
            base_url: base_url.into(),
            api_version: api_version.into(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Absolute URL for `path` under the versioned base, with `params` as
    /// the query string.
    pub fn endpoint(&self, path: &str, params: &PageParams) -> Result<String> {
        let raw = format!(
            "{}/{}/{}",
            self.base_url.trim_end_matches('/'),
            self.api_version.trim_matches('/'),
            path.trim_start_matches('/')
        );
        let mut url = reqwest::Url::parse(&raw).map_err(|e| ApiError::Validation {
            message: format!("invalid endpoint {raw:?}: {e}"),
            detail: RemoteDetail::default(),
        })?;
        if !params.is_empty() {
            url.query_pairs_mut().extend_pairs(params.iter());
        }
        Ok(url.into())
    }

    /// Issue a governed call and return the decoded JSON body.
    pub async fn request(
        &self,
        account_id: &str,
        method: Method,
        path: &str,
        params: &PageParams,
        body: Option<Value>,
    ) -> Result<Value> {
        let mut request = ApiRequest::new(method.clone(), self.endpoint(path, params)?);
        request.body = body;
        let context = format!("{method} {path}");

        self.retry
            .retry_with_backoff(&context, || self.send_once(account_id, request.clone()))
            .await
    }

    /// One attempt: admission, transport, classification.
    async fn send_once(&self, account_id: &str, request: ApiRequest) -> Result<Value> {
        self.limiter
            .check_rate_limit(account_id, request.is_write())
            .await?;

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| ApiError::processing(format!("transport failure: {e}"), None))?;

        if !response.is_success() {
            let error = classify_response(response.status, &response.body);
            debug!(
                account_id,
                status = response.status,
                kind = error.kind().label(),
                "remote call failed"
            );
            return Err(error);
        }

        if response.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&response.body).map_err(|e| {
            ApiError::processing(
                format!("malformed response body: {e}"),
                Some(response.status),
            )
        })
    }

    pub async fn get_json(&self, account_id: &str, path: &str, params: &PageParams) -> Result<Value> {
        self.request(account_id, Method::GET, path, params, None)
            .await
    }

    pub async fn post_json(&self, account_id: &str, path: &str, body: Value) -> Result<Value> {
        self.request(account_id, Method::POST, path, &PageParams::new(), Some(body))
            .await
    }

    /// Fetch and normalize a single page of an edge.
    pub async fn fetch_page<T: DeserializeOwned>(
        &self,
        account_id: &str,
        path: &str,
        params: PageParams,
    ) -> Result<PageResult<T>> {
        let value = self.get_json(account_id, path, &params).await?;
        parse_page(value)
    }

    /// Lazy traversal of an edge, one governed request per page.
    pub fn edge_pages<'a, T>(
        &'a self,
        account_id: &'a str,
        path: &'a str,
        params: PageParams,
        max_pages: usize,
    ) -> PageStream<T, impl FnMut(PageParams) -> PageFuture<'a, T> + 'a>
    where
        T: DeserializeOwned + Send + 'a,
    {
        let fetch = move |params: PageParams| -> PageFuture<'a, T> {
            Box::pin(self.fetch_page(account_id, path, params))
        };
        fetch_all_pages(fetch, params, max_pages)
    }

    /// Collect an edge into one list, bounded by both ceilings.
    pub async fn collect_edge<T: DeserializeOwned>(
        &self,
        account_id: &str,
        path: &str,
        params: PageParams,
        max_pages: usize,
        max_items: usize,
    ) -> Result<Vec<T>> {
        collect_all_pages(
            |params| self.fetch_page(account_id, path, params),
            params,
            max_pages,
            max_items,
        )
        .await
    }
}
