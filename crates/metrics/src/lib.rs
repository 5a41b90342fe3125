//! Metrics registration and logging helpers shared by every crate in the
//! node.

mod labels;
mod macros;
mod metrics;
mod reporting;
mod timer;

pub use crate::{
    labels::{
        IntoLabel,
        Labels,
        MetricLabel,
        STATUS_LABEL,
    },
    macros::*,
    metrics::*,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
    },
    timer::StatusTimer,
};
