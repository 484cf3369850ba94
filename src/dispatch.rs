//! Dispatch executor: turns a batch of [`RequestSpec`]s into concurrently running requests.
//!
//! Dispatching happens in two steps. [`Dispatch::prepare`] does everything that can fail
//! before any I/O: URL parsing, header merging, body negotiation and stream registration. A
//! batch that fails to prepare never issues a single request. [`Dispatch::run`] then spawns
//! one task per request and reports every outcome, in completion order, to a callback.

use crate::config::FanoutConfig;
use crate::errors::FanoutError;
use crate::net::body::{negotiate, ByteSource, ByteStream, Negotiated, Payload};
use crate::net::fetch::{fetch, Connector, OutboundBody, OutboundRequest};
use crate::net::request::RequestSpec;
use crate::net::{Name, Resolve, Resolving};
use crate::response::ResponseHandle;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::HeaderMap;
use std::fmt::{Debug, Display};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use url::Url;
use uuid::Uuid;

/// Terminal outcome of one request
pub type Outcome = Result<ResponseHandle, FanoutError>;

/// Receives the outcome of each request together with its batch index
pub(crate) type OnComplete = Arc<dyn Fn(usize, Outcome) + Send + Sync>;

/// A unique identifier for a batch, used to correlate log lines
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Settings shared by all requests of a batch
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Body for requests that don't carry their own
    pub body: Option<Payload>,
    /// Headers sent with every request. Request headers with the same name win.
    pub headers: HeaderMap,
    /// Name resolution for requests that use the batch's default client
    pub resolver: Option<Arc<dyn Resolve>>,
    pub config: FanoutConfig,
}

impl Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("body", &self.body)
            .field("headers", &self.headers)
            .field("custom_resolver", &self.resolver.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl BatchOptions {
    pub fn with_body(mut self, body: impl Into<Payload>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_config(mut self, config: FanoutConfig) -> Self {
        self.config = config;
        self
    }
}

/// One request, ready to be sent
struct PreparedCall {
    index: usize,
    timeout: Duration,
    request: OutboundRequest,
}

impl PreparedCall {
    async fn execute(self, runtime: Handle) -> Outcome {
        let PreparedCall {
            index,
            timeout,
            request,
        } = self;

        match tokio::time::timeout(timeout, fetch(request)).await {
            Ok(Ok(raw)) => Ok(ResponseHandle::wrap(raw, index, runtime)),
            Ok(Err(source)) => Err(FanoutError::Transport { index, source }),
            Err(_) => {
                // The in-flight request was dropped by the timeout, closing its connection
                log::debug!("request {index}: no response after {timeout:?}, connection aborted");
                Err(FanoutError::Timeout { index, after: timeout })
            }
        }
    }
}

/// A prepared batch that has not been sent yet
pub(crate) struct Dispatch {
    id: BatchId,
    runtime: Handle,
    calls: Vec<PreparedCall>,
    /// Stream payloads used by the batch, started once every request has tapped them
    streams: Vec<ByteStream>,
}

impl Dispatch {
    /// Prepares every request of the batch without sending anything.
    pub(crate) fn prepare(batch: &[RequestSpec], options: &BatchOptions) -> Result<Self, FanoutError> {
        let config = &options.config;
        let runtime = match &config.runtime {
            Some(runtime) => runtime.clone(),
            None => Handle::try_current().map_err(|_| FanoutError::NoRuntime)?,
        };

        let shared_body = negotiate(options.body.as_ref(), batch.len())?;

        let mut default_client = None;
        let mut calls = Vec::with_capacity(batch.len());
        let mut streams = Vec::new();

        for (index, spec) in batch.iter().enumerate() {
            let url = Url::parse(&spec.url).map_err(|source| FanoutError::InvalidUrl { index, source })?;
            let mut headers = merge_headers(&options.headers, &spec.headers);

            let connector = match &spec.socket_path {
                Some(path) => Connector::Unix(path.clone()),
                None => {
                    if !matches!(url.scheme(), "http" | "https") {
                        return Err(FanoutError::UnsupportedScheme {
                            index,
                            scheme: url.scheme().to_string(),
                        });
                    }
                    Connector::Tcp(select_client(spec, options, &mut default_client)?)
                }
            };

            let negotiated = match negotiate(spec.body.as_ref(), 1)? {
                Some(negotiated) => Some(negotiated),
                None => shared_body.clone(),
            };
            let body = match negotiated {
                Some(negotiated) => attach_body(negotiated, &mut headers, &mut streams)?,
                None => OutboundBody::Empty,
            };

            calls.push(PreparedCall {
                index,
                timeout: spec.timeout.unwrap_or(config.default_timeout),
                request: OutboundRequest {
                    method: spec.method.clone(),
                    url,
                    headers,
                    body,
                    connector,
                },
            });
        }

        Ok(Self {
            id: BatchId::new(),
            runtime,
            calls,
            streams,
        })
    }

    pub(crate) fn id(&self) -> BatchId {
        self.id
    }

    pub(crate) fn len(&self) -> usize {
        self.calls.len()
    }

    /// Spawns every request at once. `on_complete` is called exactly once per request.
    pub(crate) fn run(self, on_complete: OnComplete) {
        let Dispatch {
            id,
            runtime,
            calls,
            streams,
        } = self;

        log::debug!("batch {id}: dispatching {} requests", calls.len());

        for call in calls {
            let on_complete = Arc::clone(&on_complete);
            let handle = runtime.clone();

            runtime.spawn(async move {
                let index = call.index;
                let outcome = call.execute(handle).await;
                log::trace!(
                    "batch {id}: request {index} completed ({})",
                    if outcome.is_ok() { "response" } else { "error" }
                );
                on_complete(index, outcome);
            });
        }

        for stream in streams {
            stream.start(&runtime);
        }
    }
}

/// Shared headers first, then the request's own headers replace those with the same name.
pub(crate) fn merge_headers(common: &HeaderMap, specific: &HeaderMap) -> HeaderMap {
    let mut merged = common.clone();

    for name in specific.keys() {
        merged.remove(name);
        for value in specific.get_all(name) {
            merged.append(name.clone(), value.clone());
        }
    }

    merged
}

fn attach_body(
    negotiated: Negotiated,
    headers: &mut HeaderMap,
    streams: &mut Vec<ByteStream>,
) -> Result<OutboundBody, FanoutError> {
    if let Some(content_type) = negotiated.format.content_type() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    }

    match negotiated.source {
        ByteSource::Buffer(bytes) => {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(bytes.len()));
            Ok(OutboundBody::Buffer(bytes))
        }
        ByteSource::Stream(stream) => {
            let tap = stream.tap()?;
            streams.push(stream);
            Ok(OutboundBody::Stream(tap))
        }
    }
}

// The request's own client wins, then a client for the request's own resolver, then the
// batch's default client (built once, with the batch resolver).
fn select_client(
    spec: &RequestSpec,
    options: &BatchOptions,
    default_client: &mut Option<reqwest::Client>,
) -> Result<reqwest::Client, FanoutError> {
    if let Some(client) = &spec.client {
        if spec.resolver.is_some() {
            log::debug!("{}: custom resolver ignored, the request brings its own client", spec.url);
        }
        return Ok(client.clone());
    }

    if let Some(resolver) = &spec.resolver {
        return build_client(&options.config, Some(resolver));
    }

    if let Some(client) = default_client.as_ref() {
        return Ok(client.clone());
    }

    let client = build_client(&options.config, options.resolver.as_ref())?;
    *default_client = Some(client.clone());
    Ok(client)
}

fn build_client(
    config: &FanoutConfig,
    resolver: Option<&Arc<dyn Resolve>>,
) -> Result<reqwest::Client, FanoutError> {
    let mut builder = config.client_builder();
    if let Some(resolver) = resolver {
        builder = builder.dns_resolver(Arc::new(SharedResolver(Arc::clone(resolver))));
    }
    builder.build().map_err(FanoutError::Client)
}

/// Lets a type-erased resolver be installed on a client
struct SharedResolver(Arc<dyn Resolve>);

impl Resolve for SharedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        self.0.resolve(name)
    }
}
