use crate::net::body::Payload;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method};
use reqwest::dns::Resolve;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Description of one outbound request in a batch.
///
/// A batch only reads its requests, so the same slice can be fanned out again to restart it.
#[derive(Clone, Default)]
pub struct RequestSpec {
    /// Target URL. Its scheme selects plain or TLS transport unless `socket_path` is set.
    pub url: String,
    /// HTTP method (defaults to GET)
    pub method: Method,
    /// Request headers. These override the batch's shared headers with the same name.
    pub headers: HeaderMap,
    /// Request body. Overrides the batch's shared body.
    pub body: Option<Payload>,
    /// Time to wait for the response before the connection is aborted
    pub timeout: Option<Duration>,
    /// Connection-reuse handle. Requests sharing a client share its connection pool.
    pub client: Option<reqwest::Client>,
    /// Send the request over this unix socket instead of connecting to the URL's host
    pub socket_path: Option<PathBuf>,
    /// Name resolution for this request only. Ignored when `client` is set.
    pub resolver: Option<Arc<dyn Resolve>>,
}

impl Debug for RequestSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestSpec")
            .field("url", &self.url)
            .field("method", &self.method)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("timeout", &self.timeout)
            .field("socket_path", &self.socket_path)
            .field("custom_client", &self.client.is_some())
            .field("custom_resolver", &self.resolver.is_some())
            .finish()
    }
}

impl RequestSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Sets a header, replacing earlier values with the same name
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn body(mut self, body: impl Into<Payload>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn socket_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.socket_path = Some(path.into());
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = Some(resolver);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::USER_AGENT;

    #[test]
    fn defaults_to_get_without_body_or_timeout() {
        let spec = RequestSpec::new("http://localhost/");
        assert_eq!(spec.method, Method::GET);
        assert!(spec.body.is_none());
        assert!(spec.timeout.is_none());
        assert!(spec.headers.is_empty());
    }

    #[test]
    fn header_replaces_previous_value() {
        let spec = RequestSpec::new("http://localhost/")
            .header(USER_AGENT, HeaderValue::from_static("first"))
            .header(USER_AGENT, HeaderValue::from_static("second"));

        assert_eq!(spec.headers.get_all(USER_AGENT).iter().count(), 1);
        assert_eq!(spec.headers[USER_AGENT], "second");
    }
}
