//! Authenticated request layer over [`HttpTransport`].
//!
//! All retry policy lives here. Callers state whether a request may be
//! repeated; the client attaches the bearer token, retries a 401 once with a
//! fresh token, retries transient failures of idempotent requests with
//! backoff, and maps what remains onto [`graphfs_common::Error`].

use chrono::Utc;
use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};
use uuid::Uuid;

use graphfs_common::{Error, Result};

use crate::auth::TokenManager;
use crate::models::GraphErrorBody;
use crate::retry::{is_retryable_status, retry_after, RetryConfig};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};

/// Correlation header understood by Graph.
const CLIENT_REQUEST_ID: HeaderName = HeaderName::from_static("client-request-id");

/// Whether a request may be sent again after an ambiguous failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Idempotency {
    /// Reads, status queries, cancellations.
    Idempotent,
    /// Uploads, moves, deletes and other state changes.
    NonIdempotent,
}

/// Microsoft Graph API client.
pub struct DriveClient {
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
    retry: RetryConfig,
    timeout: Duration,
}

impl DriveClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        tokens: Arc<TokenManager>,
        retry: RetryConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            transport,
            tokens,
            retry,
            timeout,
        }
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Send a request with the bearer token attached.
    ///
    /// Returns any 2xx or 3xx response; everything else is classified.
    pub async fn send(&self, request: HttpRequest, idempotency: Idempotency) -> Result<HttpResponse> {
        self.execute(request, idempotency, true).await
    }

    /// Send a request without credentials, for pre-authenticated URLs such
    /// as upload sessions and download redirects.
    pub async fn send_anonymous(
        &self,
        request: HttpRequest,
        idempotency: Idempotency,
    ) -> Result<HttpResponse> {
        self.execute(request, idempotency, false).await
    }

    /// GET a URL and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        self.send(HttpRequest::get(url), Idempotency::Idempotent)
            .await?
            .json()
    }

    async fn execute(
        &self,
        mut request: HttpRequest,
        idempotency: Idempotency,
        authenticate: bool,
    ) -> Result<HttpResponse> {
        let request_id = Uuid::new_v4().to_string();
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            request.headers.insert(CLIENT_REQUEST_ID, value);
        }
        if request.timeout.is_none() {
            request.timeout = Some(self.timeout);
        }

        let mut attempt = 0u32;
        let mut reauthenticated = false;

        loop {
            let mut outgoing = request.clone();
            let token = if authenticate {
                let token = self.tokens.get_token().await?;
                let bearer = HeaderValue::from_str(&format!("Bearer {}", token.secret()))
                    .map_err(|e| Error::Authentication(format!("Unusable access token: {}", e)))?;
                outgoing.headers.insert(AUTHORIZATION, bearer);
                Some(token)
            } else {
                None
            };

            debug!(
                method = %request.method,
                url = %request.url,
                request_id = %request_id,
                attempt,
                "Sending Graph request"
            );

            let response = match self.transport.execute(outgoing).await {
                Ok(response) => response,
                Err(e) => {
                    if idempotency == Idempotency::Idempotent && attempt < self.retry.max_retries {
                        let delay = self.retry.delay_for_attempt(attempt);
                        warn!(
                            method = %request.method,
                            url = %request.url,
                            request_id = %request_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Transport failure, retrying"
                        );
                        sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    warn!(
                        method = %request.method,
                        url = %request.url,
                        request_id = %request_id,
                        error = %e,
                        "Transport failure"
                    );
                    return Err(Error::Unavailable(format!(
                        "{} {} failed (request id {}): {}",
                        request.method, request.url, request_id, e
                    )));
                }
            };

            if response.status == 401 {
                if let Some(token) = token {
                    if !reauthenticated {
                        debug!(request_id = %request_id, "Access token rejected, refreshing");
                        self.tokens.invalidate(&token).await;
                        reauthenticated = true;
                        continue;
                    }
                }
            }

            if is_retryable_status(response.status)
                && idempotency == Idempotency::Idempotent
                && attempt < self.retry.max_retries
            {
                let delay = retry_after(&response.headers, Utc::now())
                    .unwrap_or_else(|| self.retry.delay_for_attempt(attempt));
                warn!(
                    method = %request.method,
                    url = %request.url,
                    request_id = %request_id,
                    status = response.status,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Transient Graph response, retrying"
                );
                sleep(delay).await;
                attempt += 1;
                continue;
            }

            if response.status < 400 {
                return Ok(response);
            }

            let error = classify_error(&request, &response);
            if response.status != 404 {
                warn!(
                    method = %request.method,
                    url = %request.url,
                    request_id = %request_id,
                    status = response.status,
                    error = %error,
                    "Graph request failed"
                );
            }
            return Err(error);
        }
    }
}

/// Map a failed response onto the error taxonomy.
pub fn classify_error(request: &HttpRequest, response: &HttpResponse) -> Error {
    let (code, message) = match serde_json::from_slice::<GraphErrorBody>(&response.body) {
        Ok(body) => (body.error.code, body.error.message),
        Err(_) => (
            String::new(),
            String::from_utf8_lossy(&response.body).into_owned(),
        ),
    };
    let detail = if message.is_empty() {
        format!("{} {}", request.method, request.url)
    } else {
        message.clone()
    };

    match response.status {
        401 => Error::Authentication(format!("Request rejected after token refresh: {}", detail)),
        404 => Error::NotFound(target_of(&request.url)),
        409 | 412 => Error::Conflict(detail),
        429 => Error::RateLimited(detail),
        500..=599 => Error::Unavailable(format!("status {}: {}", response.status, detail)),
        status => Error::Request {
            status,
            code,
            message,
        },
    }
}

/// Drive path named by a `root:/...:` URL, or the URL itself.
fn target_of(url: &str) -> String {
    let without_query = url.split('?').next().unwrap_or(url);
    match without_query.split_once("root:") {
        Some((_, rest)) => {
            let path = rest.split(':').next().unwrap_or(rest);
            percent_encoding::percent_decode_str(path)
                .decode_utf8_lossy()
                .into_owned()
        }
        None => without_query.to_string(),
    }
}
