//! Batched, non-blocking delivery of metric lines to a MINT-style ingest
//! endpoint.
//!
//! Producers hand records to a [`MetricSender`] from any thread. The host
//! decides when to [`flush`](MetricSender::flush); each flush drains the
//! buffer and sends it as one `text/plain` POST on a small dedicated runtime,
//! so neither producers nor the flushing thread ever wait on the network.
//! [`shutdown`](MetricSender::shutdown) waits a bounded time for outstanding
//! requests and then releases every connection.
//!
//! ```no_run
//! use mint_metric_sender::MetricSender;
//!
//! let sender: MetricSender<String> = MetricSender::new();
//! sender.setup("https://ingest.example/api/v2/metrics/ingest", "tok123")?;
//! sender.add_metric("jmeter.responsetime,label=home gauge,min=3,max=9,sum=12,count=2".into());
//! sender.flush()?;
//! sender.shutdown();
//! # Ok::<(), mint_metric_sender::SenderError>(())
//! ```

pub mod buffers;
pub mod config;
pub mod delivery;
pub mod logging;
pub mod record;
pub mod sender;

#[cfg(test)]
mod testing;

pub use buffers::{Batch, MetricBuffer};
pub use config::{ClientSettings, Config, ConfigError, Endpoint};
pub use delivery::{
    Completion, DeliveryEngine, DeliveryError, Dispatch, Outcome, OutcomeSink, SetupError,
    TracingSink,
};
pub use record::{LINE_SEPARATOR, MetricRecord};
pub use sender::{MetricSender, SenderError};
