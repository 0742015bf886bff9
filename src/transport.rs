use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderName, CONTENT_LENGTH};
use reqwest::Method;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio_util::io::ReaderStream;

use crate::error::Result;

/// Maximum redirect hops followed by the transport.
const MAX_REDIRECTS: usize = 10;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Transport-level settings, fixed at client construction.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Switches the scheme to `http` AND disables TLS verification.
    pub insecure: bool,
    /// Connection deadline; there is no overall read deadline, downloads of
    /// large blobs may legitimately run for a long time.
    pub connect_timeout: Duration,
    /// Maximum retry attempts for transient failures (5xx, 408, 429,
    /// connection resets).  Zero disables retries.
    pub retry_attempts: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            insecure: false,
            connect_timeout: Duration::from_secs(30),
            retry_attempts: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Thin wrapper around the HTTP client enforcing TLS policy, the redirect
/// cap, and the retry policy.
///
/// Redirects are followed up to ten hops; reqwest drops `Authorization`,
/// `Cookie`, and other sensitive headers whenever a hop changes host.
pub struct Transport {
    /// Client with the retry middleware installed.
    client: ClientWithMiddleware,
    /// Same underlying client without retries.  Streamed file bodies
    /// cannot be replayed by the middleware, so they are sent once.
    streaming_client: ClientWithMiddleware,
    scheme: &'static str,
}

impl Transport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .user_agent(concat!("ocidist/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .connect_timeout(config.connect_timeout);
        if config.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let inner = builder.build()?;

        // Exponential backoff: 200 ms base, doubling with jitter.
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(200), Duration::from_secs(10))
            .build_with_max_retries(config.retry_attempts);
        let client = ClientBuilder::new(inner.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let streaming_client = ClientBuilder::new(inner).build();

        Ok(Self {
            client,
            streaming_client,
            scheme: if config.insecure { "http" } else { "https" },
        })
    }

    /// `http` when insecure, `https` otherwise.
    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url)
    }

    fn request_for_body(&self, method: Method, url: &str, body: &Body) -> RequestBuilder {
        match body {
            Body::File(_) => self.streaming_client.request(method, url),
            _ => self.client.request(method, url),
        }
    }
}

// ---------------------------------------------------------------------------
// Request body
// ---------------------------------------------------------------------------

/// A replayable request body.
///
/// Auth negotiation may need to send a request twice (anonymous attempt,
/// then authenticated retry), so bodies are described by their source rather
/// than consumed: byte bodies are cloned, file bodies are reopened and
/// streamed without buffering.
#[derive(Debug, Clone)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    File(PathBuf),
}

impl Body {
    pub async fn apply(&self, builder: RequestBuilder) -> Result<RequestBuilder> {
        match self {
            Body::Empty => Ok(builder),
            Body::Bytes(bytes) => Ok(builder.body(bytes.clone())),
            Body::File(path) => {
                let file = tokio::fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                let stream = ReaderStream::new(file);
                Ok(builder
                    .header(CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(stream)))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound request description
// ---------------------------------------------------------------------------

/// A request the auth negotiator can issue (and reissue) on our behalf.
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(HeaderName, String)>,
    pub body: Body,
}

impl OutboundRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    pub fn header(mut self, name: HeaderName, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Materialize a fresh builder for one send attempt.
    pub async fn builder(&self, transport: &Transport) -> Result<RequestBuilder> {
        let mut builder = transport.request_for_body(self.method.clone(), &self.url, &self.body);
        for (name, value) in &self.headers {
            builder = builder.header(name.clone(), value.as_str());
        }
        self.body.apply(builder).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
