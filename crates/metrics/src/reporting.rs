use std::collections::HashMap;

use prometheus::{
    core::Collector,
    Gauge,
    Histogram,
    HistogramVec,
    IntCounter,
    IntCounterVec,
};

use crate::{
    labels::Labels,
    log_invalid_metric,
    MetricLabel,
};

fn label_map(labels: &Labels) -> HashMap<&str, &str> {
    labels.iter().map(MetricLabel::split_key_value).collect()
}

pub fn log_counter(prometheus_counter: &IntCounter, increment: u64) {
    prometheus_counter.inc_by(increment);
}

pub fn log_counter_with_labels(prometheus_counter: &IntCounterVec, increment: u64, labels: Labels) {
    match prometheus_counter.get_metric_with(&label_map(&labels)) {
        Ok(metric) => metric.inc_by(increment),
        Err(e) => log_invalid_metric(get_desc(prometheus_counter), e),
    }
}

pub fn log_gauge(prometheus_gauge: &Gauge, value: f64) {
    prometheus_gauge.set(value);
}

pub fn log_distribution(prometheus_histogram: &Histogram, value: f64) {
    prometheus_histogram.observe(value);
}

pub fn log_distribution_with_labels(
    prometheus_histogram: &HistogramVec,
    value: f64,
    labels: Labels,
) {
    match prometheus_histogram.get_metric_with(&label_map(&labels)) {
        Ok(metric) => metric.observe(value),
        Err(e) => log_invalid_metric(get_desc(prometheus_histogram), e),
    }
}

pub fn get_desc<M: Collector>(metric: &M) -> String {
    metric
        .desc()
        .first()
        .map(|d| d.fq_name.clone())
        .unwrap_or_else(|| "unknown".to_string())
}
