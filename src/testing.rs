use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

use crate::config::ClientSettings;
use crate::delivery::{Completion, Outcome, OutcomeSink};

#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// How the mock ingest endpoint answers every request.
#[derive(Debug, Clone, Copy)]
pub struct Reply {
    pub status: u16,
    pub body: &'static str,
    pub delay: Duration,
}

impl Reply {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: "",
            delay: Duration::ZERO,
        }
    }

    pub fn with_body(mut self, body: &'static str) -> Self {
        self.body = body;
        self
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

type RequestStore = Arc<Mutex<Vec<CapturedRequest>>>;

/// In-process ingest endpoint on its own runtime, so tests can stay
/// synchronous like the sender's callers.
///
/// Requests are recorded as soon as their body has been read, before any
/// reply delay.
pub struct MockIngest {
    _runtime: Runtime,
    addr: SocketAddr,
    requests: RequestStore,
}

impl MockIngest {
    pub fn start(reply: Reply) -> Self {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let requests: RequestStore = Arc::new(Mutex::new(Vec::new()));
        runtime.spawn(serve(listener, reply, Arc::clone(&requests)));

        Self {
            _runtime: runtime,
            addr,
            requests,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/api/v2/metrics/ingest", self.addr)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Poll until at least `count` requests arrived or `timeout` passes.
    pub fn wait_for_requests(&self, count: usize, timeout: Duration) -> Vec<CapturedRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let requests = self.requests();
            if requests.len() >= count || Instant::now() >= deadline {
                return requests;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

async fn serve(listener: TcpListener, reply: Reply, store: RequestStore) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            continue;
        };
        let store = store.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle(req, reply, store.clone()));
            let _ = Builder::new(TokioExecutor::new())
                .serve_connection(TokioIo::new(stream), service)
                .await;
        });
    }
}

async fn handle<B>(
    req: Request<B>,
    reply: Reply,
    store: RequestStore,
) -> Result<Response<Full<Bytes>>, Infallible>
where
    B: hyper::body::Body<Data = Bytes> + Send + 'static,
{
    let method = req.method().to_string();
    let path = req.uri().path().to_owned();
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_owned(),
                v.to_str().unwrap_or_default().to_owned(),
            )
        })
        .collect();
    let body = req
        .collect()
        .await
        .map(|c| c.to_bytes())
        .unwrap_or_default();

    store.lock().unwrap().push(CapturedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    });

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    Ok(Response::builder()
        .status(StatusCode::from_u16(reply.status).unwrap())
        .body(Full::new(Bytes::from_static(reply.body.as_bytes())))
        .unwrap())
}

/// Outcome as seen by a test, without the non-comparable error values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recorded {
    Delivered(usize),
    Rejected(u16, String),
    Failed(String),
    Cancelled,
}

#[derive(Default)]
pub struct RecordingSink {
    seen: Mutex<Vec<Recorded>>,
}

impl RecordingSink {
    pub fn outcomes(&self) -> Vec<Recorded> {
        self.seen.lock().unwrap().clone()
    }

    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Recorded> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.outcomes();
            if seen.len() >= count || Instant::now() >= deadline {
                return seen;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

impl OutcomeSink for RecordingSink {
    fn record(&self, completion: &Completion<'_>) {
        let recorded = match &completion.outcome {
            Outcome::Delivered { records } => Recorded::Delivered(*records),
            Outcome::Rejected { status, body } => Recorded::Rejected(status.as_u16(), body.clone()),
            Outcome::Failed(e) => Recorded::Failed(e.to_string()),
            Outcome::Cancelled => Recorded::Cancelled,
        };
        self.seen.lock().unwrap().push(recorded);
    }
}

/// Defaults with enough slack that a busy CI box does not trip pool or
/// shutdown timeouts.
pub fn test_settings() -> ClientSettings {
    ClientSettings {
        pool_wait_timeout: Duration::from_secs(5),
        shutdown_timeout: Duration::from_secs(10),
        ..ClientSettings::default()
    }
}

/// An address nothing is listening on.
pub fn refused_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{port}/api/v2/metrics/ingest")
}
