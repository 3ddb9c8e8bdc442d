//! reqwest-backed transport with bearer-token and static header injection.

use crate::{ApiRequest, ApiResponse, Transport, TransportError};
use common::Secret;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Header injection rule (name + value pair from config).
#[derive(Debug, Clone)]
pub struct HeaderInjection {
    pub name: String,
    pub value: String,
}

/// HTTP transport for the remote API.
///
/// Injects `Authorization: Bearer <token>` when a token is configured, then
/// any static headers. A caller-supplied Authorization header is never
/// overwritten.
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
    access_token: Option<Secret<String>>,
    headers: Vec<HeaderInjection>,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            access_token: None,
            headers: Vec::new(),
        }
    }

    pub fn with_access_token(mut self, token: Secret<String>) -> Self {
        self.access_token = Some(token);
        self
    }

    pub fn with_headers(mut self, headers: Vec<HeaderInjection>) -> Self {
        self.headers = headers;
        self
    }

    /// Apply credential and static headers to an outbound header map.
    fn prepare_headers(&self, headers: &mut HeaderMap) {
        if let Some(token) = &self.access_token
            && !headers.contains_key(AUTHORIZATION)
        {
            match HeaderValue::from_str(&format!("Bearer {}", token.expose())) {
                Ok(mut value) => {
                    value.set_sensitive(true);
                    headers.insert(AUTHORIZATION, value);
                }
                Err(_) => warn!("access token contains invalid header characters, not sent"),
            }
        }

        for injection in &self.headers {
            let name = match HeaderName::from_str(&injection.name) {
                Ok(n) => n,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header name");
                    continue;
                }
            };
            if name == AUTHORIZATION {
                warn!(header = %injection.name, "refusing to overwrite authorization header");
                continue;
            }
            let value = match HeaderValue::from_str(&injection.value) {
                Ok(v) => v,
                Err(e) => {
                    warn!(header = %injection.name, error = %e, "skipping invalid header value");
                    continue;
                }
            };
            headers.insert(name, value);
        }
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        request: ApiRequest,
    ) -> Pin<Box<dyn Future<Output = crate::Result<ApiResponse>> + Send + '_>> {
        Box::pin(async move {
            let ApiRequest {
                method,
                url,
                mut headers,
                body,
            } = request;
            self.prepare_headers(&mut headers);

            debug!(%method, %url, "sending upstream request");

            let mut builder = self
                .client
                .request(method, &url)
                .headers(headers)
                .timeout(self.timeout);
            if let Some(body) = &body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout(self.timeout.as_secs())
                } else {
                    TransportError::Request(e.to_string())
                }
            })?;

            let status = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::Body(e.to_string()))?;

            Ok(ApiResponse {
                status,
                headers,
                body,
            })
        })
    }
}
