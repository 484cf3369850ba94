//! Disposable HTTP/1.1 server for the integration tests.
//!
//! The behaviour of each response is controlled through query parameters:
//!
//! - `l=<ms>`: wait this long before answering
//! - `s=<code>`: answer with this status (default 200)
//! - `eh=1`: echo the request headers as a JSON object
//! - `eb=1`: echo the request body
//! - `e=1`: answer with an empty body
//! - `d=1`: drop the connection instead of answering

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A running test server. Stops accepting connections when dropped.
pub struct TestServer {
    pub port: u16,
    calls: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind test server");
        let port = listener.local_addr().expect("test server address").port();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, Arc::clone(&counter)));
            }
        });

        Self { port, calls, task }
    }

    pub fn url(&self, query: &str) -> String {
        format!("http://127.0.0.1:{}/?{}", self.port, query)
    }

    /// Number of requests that reached the server so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Same server, listening on a unix socket inside a temporary directory
#[cfg(unix)]
pub struct UnixTestServer {
    pub path: std::path::PathBuf,
    calls: Arc<AtomicUsize>,
    task: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

#[cfg(unix)]
impl UnixTestServer {
    pub async fn start() -> Self {
        let dir = tempfile::tempdir().expect("temp dir for unix socket");
        let path = dir.path().join("fanout.sock");
        let listener = tokio::net::UnixListener::bind(&path).expect("bind unix socket");

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_connection(stream, Arc::clone(&counter)));
            }
        });

        Self {
            path,
            calls,
            task,
            _dir: dir,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[cfg(unix)]
impl Drop for UnixTestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_connection<I>(io: I, calls: Arc<AtomicUsize>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handle(req, Arc::clone(&calls)));
    // Dropped connections end here with an error, which is what `d=1` asks for
    let _ = http1::Builder::new().serve_connection(TokioIo::new(io), service).await;
}

async fn handle(req: Request<Incoming>, calls: Arc<AtomicUsize>) -> Result<Response<Full<Bytes>>, BoxError> {
    calls.fetch_add(1, Ordering::SeqCst);

    let params: HashMap<String, String> = req
        .uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();
    let flag = |name: &str| params.get(name).is_some_and(|v| v == "1");
    let latency: u64 = params.get("l").and_then(|l| l.parse().ok()).unwrap_or(0);
    let status: u16 = params.get("s").and_then(|s| s.parse().ok()).unwrap_or(200);

    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            let value = value.to_str().unwrap_or_default().to_string();
            (name.to_string(), serde_json::Value::String(value))
        })
        .collect();
    let body = req.into_body().collect().await?.to_bytes();

    tokio::time::sleep(Duration::from_millis(latency)).await;

    if flag("d") {
        return Err("dropping connection on request".into());
    }

    let payload = if flag("eh") {
        Bytes::from(serde_json::to_vec(&headers)?)
    } else if flag("eb") {
        body
    } else if flag("e") {
        Bytes::new()
    } else {
        Bytes::from_static(b"OK")
    };

    Ok(Response::builder()
        .status(StatusCode::from_u16(status)?)
        .body(Full::new(payload))?)
}
