//! Raw HTTP response model.
//!
//! This struct represents a response **as it arrives** from the transport: the final URL
//! (after redirects, if the client follows them), status code, HTTP version, response headers,
//! and the body as a stream of chunks that has not been read yet.
//!
//! ## Notes
//! - The body is only read when the response is wrapped in a
//!   [`ResponseHandle`](crate::response::ResponseHandle) and one of its accessors is called.
//! - `headers` is an `http::HeaderMap`, which is **case-insensitive** for header names.
//!
use crate::errors::BoxError;
use bytes::Bytes;
use futures::stream::BoxStream;
use http::{HeaderMap, StatusCode, Version};
use std::fmt::Debug;

/// Stream of inbound body chunks
pub type BodyStream = BoxStream<'static, Result<Bytes, BoxError>>;

/// Simple structure for unread HTTP responses.
pub struct RawResponse {
    /// Final URL of the response (after redirects, if any).
    pub url: url::Url,

    /// HTTP status code (e.g., `200`, `404`).
    pub status: StatusCode,

    /// HTTP version the response was received with
    pub version: Version,

    /// Response headers as a case-insensitive map.
    pub headers: HeaderMap,

    /// Unread body chunks.
    pub body: BodyStream,
}

impl Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("url", &self.url.as_str())
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
