//! Request payload negotiation.
//!
//! A [`Payload`] is whatever the caller wants to send: a byte stream, or a JSON value (strings
//! are sent as text, objects and arrays as JSON). [`negotiate`] turns it into a [`Negotiated`]
//! wire format plus byte source, once per batch for the shared body and once per request for
//! request-specific bodies.
//!
//! A [`ByteStream`] can be shared by every request of a batch. Each request registers a tap on
//! it before the batch starts; when the batch starts, a single pump drains the source once and
//! copies every chunk to every tap. Taps are bounded: the pump reads the next chunk only once
//! every live tap has room for the current one.

use crate::errors::FanoutError;
use crate::lock;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::stream::BoxStream;
use futures::{SinkExt, Stream, StreamExt};
use std::fmt::Debug;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;
use tokio::runtime::Handle;
use tokio_util::io::ReaderStream;

/// Number of taps a stream accepts before warning about a possible leak
const DEFAULT_MAX_LISTENERS: usize = 10;

/// Chunks buffered per tap before the pump waits for the request to catch up
const TAP_CAPACITY: usize = 8;

/// One request's view of a [`ByteStream`]
pub(crate) type Tap = mpsc::Receiver<io::Result<Bytes>>;

type TapSender = mpsc::Sender<io::Result<Bytes>>;

/// Body payload of a request (or the shared default body of a batch)
#[derive(Debug, Clone)]
pub enum Payload {
    /// Readable byte stream, piped to the request as it arrives
    Stream(ByteStream),
    /// JSON value. Strings are sent as text, objects and arrays as JSON, `null` means no body.
    Value(serde_json::Value),
}

impl From<ByteStream> for Payload {
    fn from(stream: ByteStream) -> Self {
        Payload::Stream(stream)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Value(value)
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Value(serde_json::Value::String(text))
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Value(serde_json::Value::String(text.to_string()))
    }
}

/// Format of a negotiated body on the wire
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WireFormat {
    /// Piped byte stream (chunked transfer)
    Stream,
    /// Serialized JSON
    Structured,
    /// UTF-8 text
    Text,
}

impl WireFormat {
    /// Content type that the format imposes on the request, if any
    pub fn content_type(&self) -> Option<&'static str> {
        match self {
            WireFormat::Structured => Some("application/json"),
            WireFormat::Stream | WireFormat::Text => None,
        }
    }
}

/// Where the bytes of a negotiated body come from
#[derive(Debug, Clone)]
pub enum ByteSource {
    Buffer(Bytes),
    Stream(ByteStream),
}

/// A payload that has been classified and encoded for the wire
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub format: WireFormat,
    pub source: ByteSource,
}

/// Classifies a payload into a wire format and byte source.
///
/// Returns `Ok(None)` when there is no body to send (no payload, JSON `null` or an empty string).
/// `span` is the number of requests that may read a stream payload; the stream's listener
/// capacity is raised to at least that.
pub fn negotiate(payload: Option<&Payload>, span: usize) -> Result<Option<Negotiated>, FanoutError> {
    let Some(payload) = payload else {
        return Ok(None);
    };

    let negotiated = match payload {
        Payload::Stream(stream) => {
            stream.raise_max_listeners(span);
            Negotiated {
                format: WireFormat::Stream,
                source: ByteSource::Stream(stream.clone()),
            }
        }
        Payload::Value(serde_json::Value::Null) => return Ok(None),
        Payload::Value(serde_json::Value::String(text)) if text.is_empty() => return Ok(None),
        Payload::Value(serde_json::Value::String(text)) => Negotiated {
            format: WireFormat::Text,
            source: ByteSource::Buffer(Bytes::from(text.clone())),
        },
        Payload::Value(value @ (serde_json::Value::Object(_) | serde_json::Value::Array(_))) => {
            Negotiated {
                format: WireFormat::Structured,
                source: ByteSource::Buffer(Bytes::from(value.to_string())),
            }
        }
        Payload::Value(serde_json::Value::Bool(_)) => {
            return Err(FanoutError::UnsupportedBody("boolean"));
        }
        Payload::Value(serde_json::Value::Number(_)) => {
            return Err(FanoutError::UnsupportedBody("number"));
        }
    };

    Ok(Some(negotiated))
}

/// A byte stream payload that can be read by several requests at once.
///
/// Cloning shares the same underlying source. The source is drained at most once.
#[derive(Clone)]
pub struct ByteStream {
    inner: Arc<Mutex<StreamState>>,
}

struct StreamState {
    /// Source of the chunks, `None` once the pump has taken it
    source: Option<BoxStream<'static, io::Result<Bytes>>>,
    /// Senders of all taps registered so far
    taps: Vec<TapSender>,
    max_listeners: usize,
}

impl Debug for ByteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner);
        f.debug_struct("ByteStream")
            .field("started", &state.source.is_none())
            .field("taps", &state.taps.len())
            .field("max_listeners", &state.max_listeners)
            .finish()
    }
}

impl ByteStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Mutex::new(StreamState {
                source: Some(stream.boxed()),
                taps: Vec::new(),
                max_listeners: DEFAULT_MAX_LISTENERS,
            })),
        }
    }

    /// Creates a stream payload that reads from an async reader
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        Self::new(ReaderStream::new(reader))
    }

    pub fn max_listeners(&self) -> usize {
        lock(&self.inner).max_listeners
    }

    /// Returns true when the source has been handed to a pump (and can't be tapped anymore)
    pub fn is_started(&self) -> bool {
        lock(&self.inner).source.is_none()
    }

    pub(crate) fn raise_max_listeners(&self, at_least: usize) {
        let mut state = lock(&self.inner);
        state.max_listeners = state.max_listeners.max(at_least);
    }

    /// Number of registered taps that still have a reader
    pub fn listeners(&self) -> usize {
        let mut state = lock(&self.inner);
        state.taps.retain(|tap| !tap.is_closed());
        state.taps.len()
    }

    /// Registers a new reader. Every tap registered before [`ByteStream::start`] receives all chunks.
    pub(crate) fn tap(&self) -> Result<Tap, FanoutError> {
        let mut state = lock(&self.inner);
        if state.source.is_none() {
            return Err(FanoutError::StreamConsumed);
        }

        // taps of batches that were dropped or failed to prepare
        state.taps.retain(|tap| !tap.is_closed());

        let (tx, rx) = mpsc::channel(TAP_CAPACITY);
        state.taps.push(tx);

        if state.taps.len() > state.max_listeners {
            log::warn!(
                "possible body stream leak: {} readers registered, max listeners is {}",
                state.taps.len(),
                state.max_listeners
            );
        }

        Ok(rx)
    }

    /// Starts copying the source into all registered taps. Does nothing when already started.
    pub(crate) fn start(&self, runtime: &Handle) {
        let (source, taps) = {
            let mut state = lock(&self.inner);
            match state.source.take() {
                Some(source) => (source, std::mem::take(&mut state.taps)),
                None => return,
            }
        };

        runtime.spawn(pump(source, taps));
    }
}

async fn pump(mut source: BoxStream<'static, io::Result<Bytes>>, mut taps: Vec<TapSender>) {
    taps.retain(|tap| !tap.is_closed());

    while !taps.is_empty() {
        let Some(chunk) = source.next().await else {
            return;
        };

        match chunk {
            Ok(bytes) => {
                // A tap whose request already finished fails here and is dropped
                futures::future::join_all(taps.iter_mut().map(|tap| tap.send(Ok(bytes.clone())))).await;
                taps.retain(|tap| !tap.is_closed());
            }
            Err(err) => {
                let sends = taps
                    .iter_mut()
                    .map(|tap| tap.send(Err(io::Error::new(err.kind(), err.to_string()))));
                futures::future::join_all(sends).await;
                return;
            }
        }
    }

    log::debug!("body stream has no readers left, stopped pumping");
}
