use std::borrow::Cow;
use std::fmt::Debug;
use std::sync::Arc;

/// Separator placed between rendered lines in a request body.
#[cfg(windows)]
pub const LINE_SEPARATOR: &str = "\r\n";
#[cfg(not(windows))]
pub const LINE_SEPARATOR: &str = "\n";

/// A metric that can render itself as one line of ingest text.
///
/// The sender never looks inside a record; it only buffers records and joins
/// their rendered lines into a request body.
pub trait MetricRecord: Debug + Send + 'static {
    fn render(&self) -> Cow<'_, str>;
}

impl MetricRecord for String {
    fn render(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl MetricRecord for &'static str {
    fn render(&self) -> Cow<'_, str> {
        Cow::Borrowed(self)
    }
}

impl<T: MetricRecord + ?Sized> MetricRecord for Box<T> {
    fn render(&self) -> Cow<'_, str> {
        (**self).render()
    }
}

impl<T: MetricRecord + Sync + ?Sized> MetricRecord for Arc<T> {
    fn render(&self) -> Cow<'_, str> {
        (**self).render()
    }
}
