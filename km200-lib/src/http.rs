//! The layered HTTP transport to the gateway
//!
//! The device tolerates only one in-flight exchange and fails sporadically
//! under load. The transport is therefore a chain of decorators around one
//! plain reqwest exchange:
//!
//! retry -> serialization lock -> status classification -> network
//!
//! Each layer implements [`Http`] and wraps another implementor. The chain
//! is composed by nesting values, see `KM200::assemble`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::Url;
use reqwest::header;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::constants::{RETRY_DELAY_MAX, RETRY_DELAY_MIN, USER_AGENT};
use crate::error::KM200Error;

/// One HTTP exchange with the device.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Get { path: String },
    Post { path: String, body: Bytes },
}

impl Request {
    pub fn get(path: &str) -> Self {
        Request::Get { path: path.to_string() }
    }

    pub fn post(path: &str, body: Bytes) -> Self {
        Request::Post { path: path.to_string(), body }
    }

    pub fn path(&self) -> &str {
        match self {
            Request::Get { path } => path,
            Request::Post { path, .. } => path,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Get { path } => write!(f, "GET {path}"),
            Request::Post { path, .. } => write!(f, "POST {path}"),
        }
    }
}

/// Status and raw body of one exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Bytes,
}

impl Response {
    /// Map the status code onto the error taxonomy, 2xx passes through.
    ///
    /// Classification happens below the retry layer, so retry policies
    /// decide on already classified errors.
    pub fn classified(self, request: &Request) -> Result<Response, KM200Error> {
        match self.status {
            200..=299 => Ok(self),
            400 => Err(KM200Error::BadRequest { request: request.to_string() }),
            403 => Err(KM200Error::Forbidden { request: request.to_string() }),
            404 => Err(KM200Error::NotFound { request: request.to_string() }),
            423 => Err(KM200Error::Locked { request: request.to_string() }),
            500 => Err(KM200Error::ServerError { request: request.to_string() }),
            status => Err(KM200Error::UnexpectedStatus { request: request.to_string(), status }),
        }
    }
}

/// A transport performing one exchange with the gateway.
#[async_trait]
pub trait Http: Send + Sync {
    async fn exchange(&self, request: &Request) -> Result<Response, KM200Error>;
}

/// The base transport, one plain HTTP request per call.
///
/// The wrapped client must never retry on its own: a transparently repeated
/// POST could mutate device state twice. reqwest performs no automatic
/// request retries, so every `exchange` puts exactly one request on the
/// wire and all retrying remains [`RetryHttp`]'s decision.
pub struct ReqwestHttp {
    client: reqwest::Client,
    base_uri: String,
    timeout: Duration,
}

impl ReqwestHttp {
    /// Validate the base URI and build the client.
    ///
    /// Redirects are followed transparently, the per-attempt `timeout`
    /// bounds connecting and reading the whole response.
    pub fn new(uri: &str, timeout: Duration) -> Result<Self, KM200Error> {
        let parsed = Url::parse(uri)
            .map_err(|e| KM200Error::Configuration(format!("Invalid base URI {uri}: {e}")))?;
        match parsed.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(KM200Error::Configuration(format!(
                    "Unsupported scheme {scheme} in base URI {uri}"
                )));
            }
        }
        if parsed.host_str().is_none() {
            return Err(KM200Error::Configuration(format!("Base URI {uri} has no host")));
        }

        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| KM200Error::Configuration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_uri: uri.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl Http for ReqwestHttp {
    async fn exchange(&self, request: &Request) -> Result<Response, KM200Error> {
        let url = format!("{}{}", self.base_uri, request.path());
        let builder = match request {
            Request::Get { .. } => self.client.get(&url),
            Request::Post { body, .. } => self.client.post(&url).body(body.clone()),
        };

        debug!("{request}");
        let response = builder
            .header(header::USER_AGENT, USER_AGENT)
            .header(header::ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| KM200Error::Transport(format!("{request} failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| KM200Error::Transport(format!("{request} failed reading the body: {e}")))?;

        Response { status, body }.classified(request)
    }
}

/// Serializes all exchanges of one client instance.
///
/// The gateway handles a single session only, concurrent requests make it
/// fail or lock up. The lock is released on every exit path. Waiting on
/// the lock is cancellable and surfaces [`KM200Error::Cancelled`].
pub struct SerializedHttp {
    inner: Arc<dyn Http>,
    lock: Mutex<()>,
    cancel: CancellationToken,
}

impl SerializedHttp {
    pub fn new(inner: Arc<dyn Http>, cancel: CancellationToken) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
            cancel,
        }
    }
}

#[async_trait]
impl Http for SerializedHttp {
    async fn exchange(&self, request: &Request) -> Result<Response, KM200Error> {
        let _guard = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(KM200Error::Cancelled),
            guard = self.lock.lock() => guard,
        };
        self.inner.exchange(request).await
    }
}

/// Retries an inner transport's exchanges under a policy.
///
/// `max_retries` counts additional attempts, 0 disables retrying. Between
/// attempts it sleeps a jittered backoff. Exhausting the budget surfaces
/// the last observed failure unchanged. Cancellation during the backoff
/// aborts immediately without another attempt.
pub struct RetryHttp {
    inner: Arc<dyn Http>,
    max_retries: u32,
    retryable: fn(&KM200Error) -> bool,
    cancel: CancellationToken,
}

impl RetryHttp {
    pub fn new(
        inner: Arc<dyn Http>,
        max_retries: u32,
        retryable: fn(&KM200Error) -> bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            inner,
            max_retries,
            retryable,
            cancel,
        }
    }
}

#[async_trait]
impl Http for RetryHttp {
    async fn exchange(&self, request: &Request) -> Result<Response, KM200Error> {
        let mut remaining = self.max_retries;
        loop {
            let error = match self.inner.exchange(request).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            if remaining == 0 || !(self.retryable)(&error) {
                return Err(error);
            }
            remaining -= 1;

            let delay = backoff_delay();
            warn!("{request} failed, retrying in {delay:?}: {error}");
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(KM200Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Failures worth a second attempt when reading from the device.
pub(crate) fn retryable_for_query(error: &KM200Error) -> bool {
    matches!(
        error,
        KM200Error::Transport(_) | KM200Error::ServerError { .. }
    )
}

/// A POST that reached the device must not be blindly repeated. Only a
/// server error is known to have left no state behind, a transport
/// failure may have happened after the body was sent.
pub(crate) fn retryable_for_update(error: &KM200Error) -> bool {
    matches!(error, KM200Error::ServerError { .. })
}

fn backoff_delay() -> Duration {
    let min = RETRY_DELAY_MIN.as_millis() as u64;
    let max = RETRY_DELAY_MAX.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(min..=max))
}
