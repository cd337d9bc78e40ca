//! Asynchronous delivery of drained batches to the ingest endpoint.
//!
//! The engine owns a small dedicated tokio runtime and a pooled `reqwest`
//! client. `dispatch` never waits on the network: it renders the batch, builds
//! a fresh request, and spawns the send onto the engine runtime. Outcomes are
//! handed to an [`OutcomeSink`] from the spawned task.

mod outcome;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use thiserror::Error;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

pub use outcome::{Completion, DeliveryError, Outcome, OutcomeSink, TracingSink};

use crate::buffers::Batch;
use crate::config::{ClientSettings, ConfigError, Endpoint};
use crate::record::{LINE_SEPARATOR, MetricRecord};

const TEXT_PLAIN_UTF8: &str = "text/plain; charset=utf-8";

/// Time cancelled deliveries get to report themselves before the runtime goes away.
const ABORT_GRACE: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start delivery runtime: {0}")]
    Runtime(#[from] std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// What a call to [`DeliveryEngine::dispatch`] did with its batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing to send; no request was made.
    Empty,
    /// A request carrying `records` lines is on its way.
    Sent { records: usize },
    /// The request could not be built; the batch was dropped.
    Abandoned,
}

/// Deliveries that have not been joined yet, plus how many of the joined ones
/// ended in a panic.
#[derive(Default)]
struct InFlight {
    tasks: JoinSet<()>,
    failed: usize,
}

impl InFlight {
    fn spawn(&mut self, delivery: Delivery, handle: &Handle) {
        self.reap();
        self.tasks.spawn_on(delivery.run(), handle);
    }

    /// Join every task that has already finished, logging the ones that failed.
    fn reap(&mut self) {
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                log_task_failure(&e);
                self.failed += 1;
            }
        }
    }

    fn pending(&mut self) -> usize {
        self.reap();
        self.tasks.len()
    }

    fn take(&mut self) -> JoinSet<()> {
        std::mem::take(&mut self.tasks)
    }
}

fn log_task_failure(e: &JoinError) {
    error!(error = %e, "metrics delivery task failed");
}

pub struct DeliveryEngine {
    endpoint: Endpoint,
    client: Client,
    handle: Handle,
    // `None` once shut down.
    runtime: Option<Runtime>,
    permits: Arc<Semaphore>,
    pool_wait_timeout: Duration,
    shutdown_timeout: Duration,
    cancel: CancellationToken,
    in_flight: InFlight,
    sink: Arc<dyn OutcomeSink>,
}

impl DeliveryEngine {
    pub fn new(
        endpoint: Endpoint,
        settings: &ClientSettings,
        sink: Arc<dyn OutcomeSink>,
    ) -> Result<Self, SetupError> {
        install_crypto_provider();

        // Client first: a runtime built before a failing client would have to
        // be dropped here, which panics if the caller is itself async.
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.read_timeout)
            .pool_max_idle_per_host(settings.max_connections)
            .user_agent(settings.user_agent.as_str())
            .build()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(settings.io_threads)
            .thread_name("mint-sender-io")
            .enable_all()
            .build()?;

        debug!(url = %endpoint.url(), "created metric delivery engine");

        Ok(Self {
            endpoint,
            client,
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
            permits: Arc::new(Semaphore::new(settings.max_connections)),
            pool_wait_timeout: settings.pool_wait_timeout,
            shutdown_timeout: settings.shutdown_timeout,
            cancel: CancellationToken::new(),
            in_flight: InFlight::default(),
            sink,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Number of dispatched deliveries that have not finished yet.
    pub fn in_flight(&mut self) -> usize {
        self.in_flight.pending()
    }

    /// Render `batch` into one request and send it in the background.
    ///
    /// Returns as soon as the send is spawned. Earlier deliveries keep running
    /// independently of this one.
    pub fn dispatch<R: MetricRecord>(&mut self, batch: Batch<R>) -> Dispatch {
        if batch.is_empty() {
            return Dispatch::Empty;
        }

        let records = batch.len();
        let payload = Bytes::from(batch.render(LINE_SEPARATOR));
        drop(batch);

        let request = match self.build_request(payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                error!(
                    url = %self.endpoint.url(),
                    records,
                    error = %e,
                    "failed to build metrics request, dropping batch"
                );
                return Dispatch::Abandoned;
            }
        };

        let delivery = Delivery {
            client: self.client.clone(),
            request,
            url: self.endpoint.url().clone(),
            payload,
            records,
            permits: Arc::clone(&self.permits),
            pool_wait_timeout: self.pool_wait_timeout,
            cancel: self.cancel.clone(),
            sink: Arc::clone(&self.sink),
        };
        self.in_flight.spawn(delivery, &self.handle);

        Dispatch::Sent { records }
    }

    /// A new request per dispatch; nothing mutable is shared between sends.
    fn build_request(&self, payload: Bytes) -> Result<reqwest::Request, reqwest::Error> {
        let mut builder = self
            .client
            .post(self.endpoint.url().clone())
            .header(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN_UTF8))
            .body(payload);
        if let Some(auth) = self.endpoint.authorization() {
            builder = builder.header(AUTHORIZATION, auth.clone());
        }
        builder.build()
    }

    /// Wait for outstanding deliveries, cancel whatever is left, and release
    /// the connection pool and runtime.
    ///
    /// Blocks the calling thread for at most the shutdown timeout plus a short
    /// abort grace. Nothing is returned; every problem is logged.
    pub fn shutdown(mut self) {
        self.close();
    }

    /// Returns how many delivery tasks ended in a panic, as far as the bounded
    /// wait could observe.
    fn close(&mut self) -> usize {
        let Some(runtime) = self.runtime.take() else {
            return 0;
        };

        let pending = self.in_flight.pending();
        info!(url = %self.endpoint.url(), pending, "shutting down metric delivery");

        let mut failed = self.in_flight.failed;
        let mut tasks = self.in_flight.take();
        if !tasks.is_empty() {
            let remaining = Arc::new(AtomicUsize::new(tasks.len()));
            let (done_tx, done_rx) = mpsc::channel();
            // The wait runs on the engine runtime and reports back over a std
            // channel, so the caller blocks without entering the runtime.
            let counter = Arc::clone(&remaining);
            self.handle.spawn(async move {
                let mut panicked: usize = 0;
                while let Some(result) = tasks.join_next().await {
                    if let Err(e) = result {
                        log_task_failure(&e);
                        panicked += 1;
                    }
                    counter.fetch_sub(1, Ordering::Relaxed);
                }
                let _ = done_tx.send(panicked);
            });

            match done_rx.recv_timeout(self.shutdown_timeout) {
                Ok(joined) => failed += joined,
                Err(RecvTimeoutError::Timeout) => {
                    error!(
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        pending = remaining.load(Ordering::Relaxed),
                        "timed out waiting for in-flight metrics to be sent"
                    );
                    self.cancel.cancel();
                    match done_rx.recv_timeout(ABORT_GRACE) {
                        Ok(joined) => failed += joined,
                        Err(_) => warn!("in-flight metrics requests did not stop before teardown"),
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    error!("lost track of in-flight metrics requests during shutdown");
                }
            }
        }

        self.cancel.cancel();
        // Drops every pooled connection along with the tasks driving them.
        runtime.shutdown_background();
        debug!("metric delivery engine closed");
        failed
    }
}

impl Drop for DeliveryEngine {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            self.cancel.cancel();
            runtime.shutdown_background();
        }
    }
}

/// One spawned send.
struct Delivery {
    client: Client,
    request: reqwest::Request,
    url: Url,
    payload: Bytes,
    records: usize,
    permits: Arc<Semaphore>,
    pool_wait_timeout: Duration,
    cancel: CancellationToken,
    sink: Arc<dyn OutcomeSink>,
}

impl Delivery {
    async fn run(self) {
        let Delivery {
            client,
            request,
            url,
            payload,
            records,
            permits,
            pool_wait_timeout,
            cancel,
            sink,
        } = self;

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Outcome::Cancelled,
            outcome = send(&client, request, &permits, pool_wait_timeout, records) => outcome,
        };

        sink.record(&Completion {
            url: &url,
            records,
            payload: &payload,
            outcome,
        });
    }
}

async fn send(
    client: &Client,
    request: reqwest::Request,
    permits: &Semaphore,
    pool_wait_timeout: Duration,
    records: usize,
) -> Outcome {
    let _permit = match tokio::time::timeout(pool_wait_timeout, permits.acquire()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => return Outcome::Cancelled,
        Err(_) => return Outcome::Failed(DeliveryError::PoolExhausted(pool_wait_timeout)),
    };

    let response = match client.execute(request).await {
        Ok(response) => response,
        Err(e) => return Outcome::Failed(DeliveryError::Transport(e)),
    };

    let status = response.status();
    if status.is_success() {
        Outcome::Delivered { records }
    } else {
        // Best effort: an unreadable body is reported as empty.
        let body = response.text().await.unwrap_or_default();
        Outcome::Rejected { status, body }
    }
}

fn install_crypto_provider() {
    // Err only means a provider is already installed for this process.
    let _ = rustls::crypto::ring::default_provider().install_default();
}
