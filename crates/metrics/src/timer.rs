use std::time::{
    Duration,
    Instant,
};

use prometheus::HistogramVec;

use crate::{
    get_desc,
    labels::MetricLabel,
    log_distribution_with_labels,
};

/// Status timer that defaults to error unless `.finish()` is explicitly called
/// upon success. The histogram must be registered with `STATUS_LABEL`.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: Vec<MetricLabel>,
    status: MetricLabel,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self::new_with_labels(histogram, vec![])
    }

    /// The histogram must be registered with `labels`' keys plus
    /// `STATUS_LABEL`.
    pub fn new_with_labels(histogram: &'static HistogramVec, labels: Vec<MetricLabel>) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            labels,
            status: MetricLabel::STATUS_ERROR,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn finish(mut self) -> Duration {
        self.status = MetricLabel::STATUS_SUCCESS;
        self.elapsed()
    }

    /// Finish with a caller-chosen status, e.g. "canceled".
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.status = MetricLabel::new_const("status", status);
        self.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed();
        tracing::debug!(
            "{elapsed:?} for timer {:?} {:?}",
            get_desc(self.histogram),
            self.status
        );
        let mut labels = std::mem::take(&mut self.labels);
        labels.push(self.status.clone());
        log_distribution_with_labels(self.histogram, elapsed.as_secs_f64(), labels);
    }
}
