pub use paste::paste;
pub use prometheus;

/// Register a histogram with the node metrics registry and store it in a
/// static. An optional third argument lists label names. The reported metric
/// name is the lower_snake_case version of the static's name.
#[macro_export]
macro_rules! register_node_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_histogram_with_registry!(
                    &*name,
                    &*help,
                    $crate::NODE_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_histogram_vec_with_registry!(
                    &*name,
                    &*help,
                    $LABELS,
                    $crate::NODE_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
}

/// Register an integer counter with the node metrics registry and store it
/// in a static. An optional third argument lists label names.
#[macro_export]
macro_rules! register_node_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_int_counter_with_registry!(
                    &*name,
                    &*help,
                    $crate::NODE_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_int_counter_vec_with_registry!(
                    &*name,
                    &*help,
                    $LABELS,
                    $crate::NODE_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
}

/// Register a floating-point gauge with the node metrics registry and store
/// it in a static. An optional third argument lists label names.
#[macro_export]
macro_rules! register_node_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Gauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_gauge_with_registry!(
                    &*name,
                    &*help,
                    $crate::NODE_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::GaugeVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let help = $crate::metric_help!($HELP);
                $crate::prometheus::register_gauge_vec_with_registry!(
                    &*name,
                    &*help,
                    $LABELS,
                    $crate::NODE_METRICS_REGISTRY,
                )
                .expect("Metric initialization failed")
            });
    };
}
