use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::record::MetricRecord;

/// The records captured by one drain.
///
/// Owned and immutable: once drained, nothing else can append to it.
#[derive(Debug)]
pub struct Batch<R> {
    records: Vec<R>,
}

impl<R> Batch<R> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<R> {
        self.records
    }
}

impl<R: MetricRecord> Batch<R> {
    /// Join every record's rendered line with `separator`.
    /// There is no separator after the last line.
    pub fn render(&self, separator: &str) -> String {
        let mut body = String::new();
        for (i, record) in self.records.iter().enumerate() {
            if i > 0 {
                body.push_str(separator);
            }
            body.push_str(&record.render());
        }
        body
    }
}

impl<R> From<Vec<R>> for Batch<R> {
    fn from(records: Vec<R>) -> Self {
        Self { records }
    }
}

/// Pending records shared by every producer.
///
/// Uses `std::sync::Mutex` (not tokio) because the lock is never held across
/// I/O or `.await`. `add` is a push and `drain_and_swap` is a field swap.
pub struct MetricBuffer<R> {
    live: Mutex<Vec<R>>,
}

impl<R> Default for MetricBuffer<R> {
    fn default() -> Self {
        Self {
            live: Mutex::new(Vec::new()),
        }
    }
}

impl<R> MetricBuffer<R> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, record: R) {
        self.lock().push(record);
    }

    /// Take everything buffered so far, leaving an empty buffer for new arrivals.
    pub fn drain_and_swap(&self) -> Batch<R> {
        Batch {
            records: std::mem::take(&mut *self.lock()),
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    // A producer that panicked mid-push cannot leave the Vec torn, so the
    // records behind a poisoned lock are still good to send.
    fn lock(&self) -> MutexGuard<'_, Vec<R>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
