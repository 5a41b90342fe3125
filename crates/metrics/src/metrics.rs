//! Common functions for metrics logging.
//!
//! We follow [Prometheus's conventions](https://prometheus.io/docs/practices/naming/) for metric
//! names:
//!
//! 1. Metrics may only contain alphanumerics and underscores.
//! 2. Metrics are prefixed with `METRICS_PREFIX` by the registry.
//! 3. Metrics end with their unit (`_seconds`, `_rows`, `_total`, ...). See
//!    `ALLOWED_SUFFIXES`.
//!
//! Each crate keeps its metrics in a `metrics` module whose interface is
//! "this event happened" rather than raw metric handles.
use std::{
    borrow::Cow,
    collections::HashSet,
    env,
    ops::Deref,
    sync::LazyLock,
};

use parking_lot::RwLock;
use prometheus::Registry;

use crate::{
    log_counter_with_labels,
    register_node_counter,
    MetricLabel,
};

const ALLOWED_SUFFIXES: &[&str] = &[
    "_seconds",
    "_bytes",
    // Storage units.
    "_rows",
    "_entries",
    "_batches",
    "_commits",
    "_transactions",
    "_partitions",
    "_indexes",
    "_tables",
    // Scheduling units.
    "_tasks",
    "_retries",
    "_passes",
    "_errors",
    "_total",
    "_info",
];

pub const METRICS_PREFIX: &str = "node";

pub static NODE_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let labels = env::var("NODE_NAME")
        .ok()
        .map(|node| [("node_name".to_owned(), node)].into_iter().collect());
    Registry::new_custom(Some(METRICS_PREFIX.to_owned()), labels)
        .expect("Failed to initialize Prometheus metrics registry")
});

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MetricName(Cow<'static, str>);

impl MetricName {
    pub const fn new(name: &'static str) -> Self {
        validate_metric_name(name);
        Self(Cow::Borrowed(name))
    }
}

impl Deref for MetricName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0[..]
    }
}

const fn ends_with(s: &[u8], suffix: &[u8]) -> bool {
    if s.len() < suffix.len() {
        return false;
    }
    let s_base = s.len() - suffix.len();
    let mut i = 0;
    while i < suffix.len() {
        if s[s_base + i] != suffix[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn validate_metric_name(name: &str) {
    let name_bytes = name.as_bytes();

    let mut i = 0;
    while i < name_bytes.len() {
        let c = name_bytes[i];
        if !(c.is_ascii_alphanumeric() || c == b'_') {
            panic!("Metric names can only contain alphanumeric characters and underscores");
        }
        i += 1;
    }

    let mut i = 0;
    let mut found_suffix = false;
    while i < ALLOWED_SUFFIXES.len() {
        if ends_with(name_bytes, ALLOWED_SUFFIXES[i].as_bytes()) {
            found_suffix = true;
            break;
        }
        i += 1;
    }
    if !found_suffix {
        panic!("Metric names must end with their units as a suffix (e.g. `_seconds`, `_total`)");
    }
}

// Forces metric name validation to happen at compile time.
#[macro_export]
macro_rules! metric_name {
    ($name: expr) => {{
        use $crate::MetricName;
        const METRIC_NAME: MetricName = MetricName::new($name);
        METRIC_NAME
    }};
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricHelp(&'static str);

impl MetricHelp {
    pub const fn new(help_str: &'static str) -> Self {
        if help_str.is_empty() {
            panic!("Metric help strings must be nonempty");
        }
        Self(help_str)
    }
}

impl Deref for MetricHelp {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

#[macro_export]
macro_rules! metric_help {
    ($help: literal) => {{
        use $crate::MetricHelp;
        const METRIC_HELP: MetricHelp = MetricHelp::new($help);
        METRIC_HELP
    }};
}

register_node_counter!(
    INVALID_METRIC_TOTAL,
    "Count of metrics that failed to be reported",
    &["metric_name"]
);

// Only log each broken metric once; a bad label set would otherwise flood the
// logs on every observation.
static METRICS_ERROR_ONCE: LazyLock<RwLock<HashSet<String>>> = LazyLock::new(Default::default);

pub fn log_invalid_metric(name: String, error: prometheus::Error) {
    log_counter_with_labels(
        &INVALID_METRIC_TOTAL,
        1,
        vec![MetricLabel::new("metric_name", name.clone())],
    );
    if METRICS_ERROR_ONCE.read().contains(&name) {
        return;
    }
    if METRICS_ERROR_ONCE.write().insert(name.clone()) {
        let msg = format!("Failed to record metric {name:?}: {error}");
        if cfg!(any(test, feature = "testing")) {
            panic!("{msg}");
        }
        let err = anyhow::anyhow!(error).context(msg);
        tracing::error!("{:?}", err);
        sentry::integrations::anyhow::capture_anyhow(&err);
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        log_counter,
        log_counter_with_labels,
        register_node_counter,
        MetricLabel,
        NODE_METRICS_REGISTRY,
    };

    register_node_counter!(TEST_EVENTS_TOTAL, "Events recorded by the metrics test");
    register_node_counter!(
        TEST_LABELED_EVENTS_TOTAL,
        "Labeled events recorded by the metrics test",
        &["kind"]
    );

    #[test]
    fn test_registered_metrics_are_prefixed() {
        log_counter(&TEST_EVENTS_TOTAL, 2);
        log_counter_with_labels(
            &TEST_LABELED_EVENTS_TOTAL,
            1,
            vec![MetricLabel::new_const("kind", "populate")],
        );
        let names: Vec<String> = NODE_METRICS_REGISTRY
            .gather()
            .into_iter()
            .map(|family| family.get_name().to_owned())
            .collect();
        assert!(names.contains(&"node_test_events_total".to_owned()));
        assert!(names.contains(&"node_test_labeled_events_total".to_owned()));
        assert_eq!(TEST_EVENTS_TOTAL.get(), 2);
    }
}
