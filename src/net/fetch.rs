use crate::errors::BoxError;
use crate::net::body::Tap;
use crate::net::response::RawResponse;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::{HeaderMap, Method};
use std::path::PathBuf;
use url::Url;

/// How the request reaches the server
pub(crate) enum Connector {
    /// Plain or TLS TCP connection, chosen by the URL scheme
    Tcp(reqwest::Client),
    /// HTTP/1.1 over a unix domain socket
    Unix(PathBuf),
}

/// Body of an outbound request, ready for the transport
pub(crate) enum OutboundBody {
    Empty,
    Buffer(Bytes),
    Stream(Tap),
}

/// A fully prepared outbound request
pub(crate) struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: OutboundBody,
    pub connector: Connector,
}

// Sends the request and returns the response as soon as its headers are in. The body is
// not read here.
pub(crate) async fn fetch(request: OutboundRequest) -> Result<RawResponse, BoxError> {
    let OutboundRequest {
        method,
        url,
        headers,
        body,
        connector,
    } = request;

    match connector {
        Connector::Tcp(client) => fetch_tcp(client, method, url, headers, body).await,
        Connector::Unix(path) => unix::fetch(path, method, url, headers, body).await,
    }
}

async fn fetch_tcp(
    client: reqwest::Client,
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: OutboundBody,
) -> Result<RawResponse, BoxError> {
    let builder = client.request(method, url).headers(headers);
    let builder = match body {
        OutboundBody::Empty => builder,
        OutboundBody::Buffer(bytes) => builder.body(bytes),
        OutboundBody::Stream(tap) => builder.body(reqwest::Body::wrap_stream(tap)),
    };

    let res = builder.send().await?;

    let url = res.url().clone();
    let status = res.status();
    let version = res.version();
    let headers = res.headers().clone();

    Ok(RawResponse {
        url,
        status,
        version,
        headers,
        body: res.bytes_stream().map_err(BoxError::from).boxed(),
    })
}

#[cfg(unix)]
mod unix {
    use super::*;
    use http::header::{HeaderValue, HOST};
    use http_body_util::combinators::UnsyncBoxBody;
    use http_body_util::{BodyExt, Full, StreamBody};
    use hyper::body::Frame;
    use hyper_util::rt::TokioIo;
    use tokio::net::UnixStream;
    use tokio::task::AbortHandle;
    use url::Position;

    /// Aborts the task driving a connection when dropped. Kept alive by the response body.
    struct ConnectionGuard(AbortHandle);

    impl Drop for ConnectionGuard {
        fn drop(&mut self) {
            self.0.abort();
        }
    }

    pub(super) async fn fetch(
        path: PathBuf,
        method: Method,
        url: Url,
        mut headers: HeaderMap,
        body: OutboundBody,
    ) -> Result<RawResponse, BoxError> {
        let stream = UnixStream::connect(&path).await?;
        let (mut sender, conn) =
            hyper::client::conn::http1::handshake::<_, UnsyncBoxBody<Bytes, BoxError>>(TokioIo::new(stream))
                .await?;

        let task = tokio::spawn(async move {
            if let Err(err) = conn.await {
                log::debug!("unix socket connection closed with error: {err}");
            }
        });
        let guard = ConnectionGuard(task.abort_handle());

        if !headers.contains_key(HOST) {
            if let Some(host) = host_header(&url) {
                headers.insert(HOST, HeaderValue::from_str(&host)?);
            }
        }

        let mut request = http::Request::builder()
            .method(method)
            .uri(&url[Position::BeforePath..Position::AfterQuery])
            .body(into_hyper_body(body))?;
        *request.headers_mut() = headers;

        let response = sender.send_request(request).await?;
        let (parts, incoming) = response.into_parts();

        let body = incoming
            .into_data_stream()
            .map(move |chunk| {
                // the connection lives as long as its body is being read
                let _ = &guard;
                chunk.map_err(BoxError::from)
            })
            .boxed();

        Ok(RawResponse {
            url,
            status: parts.status,
            version: parts.version,
            headers: parts.headers,
            body,
        })
    }

    fn host_header(url: &Url) -> Option<String> {
        let host = url.host_str()?;
        Some(match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        })
    }

    fn into_hyper_body(body: OutboundBody) -> UnsyncBoxBody<Bytes, BoxError> {
        match body {
            OutboundBody::Empty => http_body_util::Empty::<Bytes>::new()
                .map_err(|never| match never {})
                .boxed_unsync(),
            OutboundBody::Buffer(bytes) => Full::new(bytes).map_err(|never| match never {}).boxed_unsync(),
            OutboundBody::Stream(tap) => StreamBody::new(tap.map_ok(Frame::data).map_err(BoxError::from))
                .boxed_unsync(),
        }
    }

}

#[cfg(not(unix))]
mod unix {
    use super::*;

    pub(super) async fn fetch(
        path: PathBuf,
        _method: Method,
        _url: Url,
        _headers: HeaderMap,
        _body: OutboundBody,
    ) -> Result<RawResponse, BoxError> {
        Err(format!("unix sockets are not supported on this platform: {}", path.display()).into())
    }
}
