use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::buffers::MetricBuffer;
use crate::config::{ClientSettings, Config, Endpoint};
use crate::delivery::{DeliveryEngine, Dispatch, OutcomeSink, SetupError, TracingSink};
use crate::record::MetricRecord;

#[derive(Debug, Error)]
pub enum SenderError {
    #[error("metric sender setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("metric sender has not been set up")]
    NotReady,

    #[error("metric sender has been shut down")]
    Closed,
}

enum EngineState {
    Uninitialized,
    Ready(DeliveryEngine),
    Closed,
}

/// Buffers metrics from any number of producers and ships them to one
/// ingest endpoint whenever the host calls [`flush`](Self::flush).
///
/// `add_metric` only ever takes the buffer lock. Engine state sits behind a
/// separate lock, so producers never wait on a flush or a shutdown.
pub struct MetricSender<R> {
    buffer: MetricBuffer<R>,
    // Set once `shutdown` starts; read by producers without the engine lock.
    closed: AtomicBool,
    engine: Mutex<EngineState>,
    settings: ClientSettings,
    sink: Arc<dyn OutcomeSink>,
}

impl<R: MetricRecord> Default for MetricSender<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: MetricRecord> MetricSender<R> {
    pub fn new() -> Self {
        Self::with_settings(ClientSettings::default())
    }

    pub fn with_settings(settings: ClientSettings) -> Self {
        Self {
            buffer: MetricBuffer::new(),
            closed: AtomicBool::new(false),
            engine: Mutex::new(EngineState::Uninitialized),
            settings,
            sink: Arc::new(TracingSink),
        }
    }

    /// Route delivery outcomes somewhere other than the log.
    pub fn with_sink(mut self, sink: Arc<dyn OutcomeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate the endpoint and start the delivery engine.
    ///
    /// Calling this again replaces the engine; the old one is shut down first
    /// so its connections are released.
    pub fn setup(&self, url: &str, token: &str) -> Result<(), SenderError> {
        let endpoint = Endpoint::parse(url, token).map_err(SetupError::from)?;
        self.install(endpoint, &self.settings)
    }

    pub fn setup_from_config(&self, config: &Config) -> Result<(), SenderError> {
        self.install(config.endpoint.clone(), &config.settings)
    }

    fn install(&self, endpoint: Endpoint, settings: &ClientSettings) -> Result<(), SenderError> {
        let engine = DeliveryEngine::new(endpoint, settings, Arc::clone(&self.sink))?;

        let previous = {
            let mut state = self.lock_engine();
            if matches!(*state, EngineState::Closed) {
                return Err(SenderError::Closed);
            }
            std::mem::replace(&mut *state, EngineState::Ready(engine))
        };

        if let EngineState::Ready(previous) = previous {
            debug!(url = %previous.endpoint().url(), "replacing metric delivery engine");
            previous.shutdown();
        }
        Ok(())
    }

    /// Accept a record for the next flush. Never blocks on I/O.
    ///
    /// After shutdown the record is dropped with a warning, since nothing
    /// could ever send it.
    pub fn add_metric(&self, record: R) {
        if self.closed.load(Ordering::Acquire) {
            warn!(?record, "metric sender is shut down, dropping metric");
            return;
        }
        debug!(?record, "add metric");
        self.buffer.add(record);
    }

    /// Drain the buffer and hand it to the delivery engine.
    ///
    /// Returns once the request is spawned. Delivery failures are logged,
    /// never returned. Before setup the buffer is left untouched.
    pub fn flush(&self) -> Result<Dispatch, SenderError> {
        let mut state = self.lock_engine();
        match &mut *state {
            EngineState::Uninitialized => Err(SenderError::NotReady),
            EngineState::Closed => Err(SenderError::Closed),
            // Draining under the engine lock keeps batches in flush-call order.
            EngineState::Ready(engine) => Ok(engine.dispatch(self.buffer.drain_and_swap())),
        }
    }

    /// Send what is still buffered, wait (bounded) for outstanding requests,
    /// then release every network resource.
    ///
    /// Blocks the calling thread. A second call is a no-op.
    pub fn shutdown(&self) {
        let previous = {
            let mut state = self.lock_engine();
            self.closed.store(true, Ordering::Release);
            let mut previous = std::mem::replace(&mut *state, EngineState::Closed);
            if let EngineState::Ready(engine) = &mut previous {
                engine.dispatch(self.buffer.drain_and_swap());
            }
            previous
        };

        match previous {
            EngineState::Ready(engine) => {
                engine.shutdown();
                // Producers that raced the final drain.
                let late = self.buffer.drain_and_swap().len();
                if late > 0 {
                    warn!(records = late, "metrics added during shutdown were never sent");
                }
            }
            EngineState::Uninitialized => {
                let records = self.buffer.pending();
                if records > 0 {
                    warn!(records, "shut down before setup, buffered metrics were never sent");
                }
                info!("metric sender closed");
            }
            EngineState::Closed => debug!("metric sender already shut down"),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.lock_engine(), EngineState::Ready(_))
    }

    /// Records accepted but not yet flushed.
    pub fn pending(&self) -> usize {
        self.buffer.pending()
    }

    fn lock_engine(&self) -> MutexGuard<'_, EngineState> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
