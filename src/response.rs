//! Response handles with lazy, memoized body access.
//!
//! A [`ResponseHandle`] wraps one inbound response. Its body is read from the network only when
//! one of the accessors ([`bytes`](ResponseHandle::bytes), [`text`](ResponseHandle::text),
//! [`json`](ResponseHandle::json)) is called for the first time. The bytes are then cached, and
//! every later call (of any accessor, from any clone of the handle) is served from that cache.
//!
//! An empty body is not an error: all accessors return `Ok(None)` for it.
//!
//! Every accessor has a completion-style twin (`bytes_then`, `text_then`, `json_then`) that
//! hands the result to a callback instead of returning a future.

use crate::errors::FanoutError;
use crate::net::response::{BodyStream, RawResponse};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use http::{HeaderMap, StatusCode, Version};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OnceCell};
use url::Url;

/// Handle to one inbound response of a batch. Cloning is cheap and shares the body cache.
#[derive(Clone)]
pub struct ResponseHandle {
    inner: Arc<Inner>,
}

struct Inner {
    /// Position of the originating request in its batch
    index: usize,
    url: Url,
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    /// Body read so far. Survives an accessor future that is dropped mid-read.
    body: Mutex<BodyState>,
    /// Memoized body. `None` inside means the body was empty.
    bytes: OnceCell<Option<Bytes>>,
    /// Runtime on which completion-style accessors run
    runtime: Handle,
}

struct BodyState {
    /// Unread part of the body, `None` once fully read or taken
    stream: Option<BodyStream>,
    /// Chunks received by reads that didn't finish
    chunks: Vec<Bytes>,
    /// Message of the stream error that ended the body, if any
    failure: Option<String>,
}

impl Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("index", &self.inner.index)
            .field("url", &self.inner.url.as_str())
            .field("status", &self.inner.status)
            .field("consumed", &self.is_consumed())
            .finish()
    }
}

impl ResponseHandle {
    /// Wraps a raw response that was produced by the request at `index` of its batch.
    pub fn wrap(raw: RawResponse, index: usize, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner {
                index,
                url: raw.url,
                status: raw.status,
                version: raw.version,
                headers: raw.headers,
                body: Mutex::new(BodyState {
                    stream: Some(raw.body),
                    chunks: Vec::new(),
                    failure: None,
                }),
                bytes: OnceCell::new(),
                runtime,
            }),
        }
    }

    /// Batch index of the request that produced this response
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn status(&self) -> StatusCode {
        self.inner.status
    }

    pub fn version(&self) -> Version {
        self.inner.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.headers
    }

    /// Final URL of the response (after redirects, if any)
    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// True once the body has been read and cached
    pub fn is_consumed(&self) -> bool {
        self.inner.bytes.initialized()
    }

    /// Takes the unread body stream. After this, the body accessors fail with
    /// [`FanoutError::BodyConsumed`] unless the body was already cached.
    ///
    /// Returns `None` once an accessor has started reading the body.
    pub fn take_body_stream(&self) -> Option<BodyStream> {
        let mut body = self.inner.body.try_lock().ok()?;
        if !body.chunks.is_empty() || body.failure.is_some() {
            return None;
        }
        body.stream.take()
    }

    /// Returns the body bytes, reading them from the network on first use.
    ///
    /// Concurrent calls wait for the same read. An empty body yields `Ok(None)`. Dropping the
    /// returned future mid-read keeps what was received; the next call continues from there.
    /// When the stream fails, this and every later call report that same failure.
    pub async fn bytes(&self) -> Result<Option<Bytes>, FanoutError> {
        self.inner.bytes.get_or_try_init(|| self.drain()).await.cloned()
    }

    /// Returns the body decoded as UTF-8 text (invalid sequences are replaced).
    pub async fn text(&self) -> Result<Option<String>, FanoutError> {
        Ok(self.bytes().await?.map(|bytes| decode_text(&bytes)))
    }

    /// Returns the body parsed as JSON. Malformed content fails with [`FanoutError::Decode`].
    pub async fn json<T: DeserializeOwned>(&self) -> Result<Option<T>, FanoutError> {
        let Some(bytes) = self.bytes().await? else {
            return Ok(None);
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| FanoutError::Decode {
                index: self.inner.index,
                source,
            })
    }

    /// Completion-style [`bytes`](Self::bytes). The callback runs immediately when the body is
    /// already cached, otherwise on the batch runtime once the body has been read.
    pub fn bytes_then<F>(&self, callback: F)
    where
        F: FnOnce(Result<Option<Bytes>, FanoutError>) + Send + 'static,
    {
        if let Some(bytes) = self.inner.bytes.get() {
            callback(Ok(bytes.clone()));
            return;
        }

        let this = self.clone();
        self.inner.runtime.spawn(async move {
            callback(this.bytes().await);
        });
    }

    /// Completion-style [`text`](Self::text)
    pub fn text_then<F>(&self, callback: F)
    where
        F: FnOnce(Result<Option<String>, FanoutError>) + Send + 'static,
    {
        self.bytes_then(move |bytes| callback(bytes.map(|b| b.map(|b| decode_text(&b)))));
    }

    /// Completion-style [`json`](Self::json)
    pub fn json_then<T, F>(&self, callback: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: FnOnce(Result<Option<T>, FanoutError>) + Send + 'static,
    {
        let index = self.inner.index;
        self.bytes_then(move |bytes| {
            callback(bytes.and_then(|bytes| match bytes {
                Some(bytes) => serde_json::from_slice(&bytes)
                    .map(Some)
                    .map_err(|source| FanoutError::Decode { index, source }),
                None => Ok(None),
            }))
        });
    }

    // Reads the rest of the body stream. Only ever called through the once-cell.
    async fn drain(&self) -> Result<Option<Bytes>, FanoutError> {
        let index = self.inner.index;
        let mut body = self.inner.body.lock().await;
        let state = &mut *body;

        if let Some(reason) = &state.failure {
            return Err(FanoutError::Body {
                index,
                source: reason.clone().into(),
            });
        }
        let Some(stream) = state.stream.as_mut() else {
            return Err(FanoutError::BodyConsumed { index });
        };

        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => state.chunks.push(bytes),
                Err(source) => {
                    state.failure = Some(source.to_string());
                    state.stream = None;
                    state.chunks.clear();
                    return Err(FanoutError::Body { index, source });
                }
            }
        }

        state.stream = None;
        let bytes = concat(std::mem::take(&mut state.chunks));
        log::trace!(
            "response {index}: body read ({} bytes)",
            bytes.as_ref().map_or(0, Bytes::len)
        );
        Ok(bytes)
    }
}

fn concat(chunks: Vec<Bytes>) -> Option<Bytes> {
    let total: usize = chunks.iter().map(Bytes::len).sum();
    if total == 0 {
        return None;
    }

    if chunks.len() == 1 {
        return chunks.into_iter().next();
    }

    let mut buf = BytesMut::with_capacity(total);
    for chunk in chunks {
        buf.extend_from_slice(&chunk);
    }
    Some(buf.freeze())
}

fn decode_text(body: &[u8]) -> String {
    String::from_utf8_lossy(body).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BoxError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn raw(chunks: &[&'static str], polled: Arc<AtomicUsize>) -> RawResponse {
        let items: Vec<Result<Bytes, BoxError>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        let body = futures::stream::iter(items)
            .inspect(move |_| {
                polled.fetch_add(1, Ordering::SeqCst);
            })
            .boxed();

        RawResponse {
            url: Url::parse("http://localhost/").unwrap(),
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body,
        }
    }

    fn handle(chunks: &[&'static str]) -> (ResponseHandle, Arc<AtomicUsize>) {
        let polled = Arc::new(AtomicUsize::new(0));
        let handle = ResponseHandle::wrap(raw(chunks, polled.clone()), 4, Handle::current());
        (handle, polled)
    }

    #[tokio::test]
    async fn body_is_read_once_and_cached() {
        let (res, polled) = handle(&[r#"{"a":"#, "1}"]);
        assert_eq!(res.index(), 4);
        assert!(!res.is_consumed());

        let first = res.bytes().await.unwrap();
        let second = res.bytes().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.as_deref(), Some(&b"{\"a\":1}"[..]));
        assert!(res.is_consumed());

        assert_eq!(res.text().await.unwrap().as_deref(), Some(r#"{"a":1}"#));
        let value: serde_json::Value = res.json().await.unwrap().unwrap();
        assert_eq!(value["a"], 1);

        // two chunks, read exactly once
        assert_eq!(polled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_accessors_share_one_read() {
        let (res, polled) = handle(&["hello", " ", "world"]);
        let other = res.clone();

        let (a, b) = tokio::join!(res.text(), other.bytes());
        assert_eq!(a.unwrap().as_deref(), Some("hello world"));
        assert_eq!(b.unwrap().as_deref(), Some(&b"hello world"[..]));
        assert_eq!(polled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn empty_body_maps_to_none() {
        let (res, _) = handle(&[]);
        assert!(res.bytes().await.unwrap().is_none());
        assert!(res.text().await.unwrap().is_none());
        assert!(res.json::<serde_json::Value>().await.unwrap().is_none());
        assert!(res.is_consumed());
    }

    #[tokio::test]
    async fn malformed_json_fails_only_the_accessor() {
        let (res, _) = handle(&["not json"]);

        match res.json::<serde_json::Value>().await {
            Err(FanoutError::Decode { index: 4, .. }) => {}
            other => panic!("expected decode error, got {:?}", other),
        }

        // the bytes are still cached and usable
        assert_eq!(res.text().await.unwrap().as_deref(), Some("not json"));
    }

    #[tokio::test]
    async fn completion_style_sees_the_same_cached_value() {
        let (res, polled) = handle(&["cached"]);

        let (tx, rx) = oneshot::channel();
        res.bytes_then(move |bytes| {
            let _ = tx.send(bytes);
        });
        let from_callback = rx.await.unwrap().unwrap();
        assert_eq!(from_callback, res.bytes().await.unwrap());

        let (tx, rx) = oneshot::channel();
        res.text_then(move |text| {
            let _ = tx.send(text);
        });
        assert_eq!(rx.await.unwrap().unwrap().as_deref(), Some("cached"));

        let (tx, rx) = oneshot::channel();
        res.json_then::<serde_json::Value, _>(move |value| {
            let _ = tx.send(value.map(|_| ()));
        });
        assert!(matches!(rx.await.unwrap(), Err(FanoutError::Decode { .. })));

        assert_eq!(polled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn taken_stream_leaves_nothing_to_read() {
        let (res, _) = handle(&["raw"]);
        let stream = res.take_body_stream().unwrap();
        let chunks: Vec<_> = stream.collect().await;
        assert_eq!(chunks.len(), 1);

        assert!(res.take_body_stream().is_none());
        match res.bytes().await {
            Err(FanoutError::BodyConsumed { index: 4 }) => {}
            other => panic!("expected consumed body, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn stream_errors_surface_as_body_errors() {
        let items: Vec<Result<Bytes, BoxError>> = vec![Ok(Bytes::from_static(b"part")), Err("reset".into())];
        let raw = RawResponse {
            url: Url::parse("http://localhost/").unwrap(),
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: futures::stream::iter(items).boxed(),
        };
        let res = ResponseHandle::wrap(raw, 0, Handle::current());

        match res.bytes().await {
            Err(FanoutError::Body { index: 0, .. }) => {}
            other => panic!("expected body error, got {:?}", other),
        }
        assert!(!res.is_consumed());

        // retrying reports the same failure
        match res.text().await {
            Err(FanoutError::Body { index: 0, source }) => assert_eq!(source.to_string(), "reset"),
            other => panic!("expected body error, got {:?}", other),
        }
        assert!(res.take_body_stream().is_none());
    }

    #[tokio::test]
    async fn interrupted_read_resumes_on_next_call() {
        let body = futures::stream::unfold(0u8, |step| async move {
            match step {
                0 => Some((Ok::<_, BoxError>(Bytes::from_static(b"first ")), 1)),
                1 => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Some((Ok(Bytes::from_static(b"second")), 2))
                }
                _ => None,
            }
        });
        let raw = RawResponse {
            url: Url::parse("http://localhost/").unwrap(),
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            body: body.boxed(),
        };
        let res = ResponseHandle::wrap(raw, 0, Handle::current());

        assert!(tokio::time::timeout(Duration::from_millis(10), res.bytes()).await.is_err());
        assert!(!res.is_consumed());
        assert!(res.take_body_stream().is_none());

        assert_eq!(res.bytes().await.unwrap().as_deref(), Some(&b"first second"[..]));
        assert!(res.is_consumed());
    }

    #[test]
    fn concat_joins_chunks() {
        assert_eq!(concat(vec![]), None);
        assert_eq!(concat(vec![Bytes::new()]), None);
        assert_eq!(
            concat(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"cd")]).as_deref(),
            Some(&b"abcd"[..])
        );
    }
}
