use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use metrics::{
    log_counter,
    log_counter_with_labels,
    register_node_counter,
};
use rand::Rng;

register_node_counter!(
    ERRORS_REPORTED_TOTAL,
    "Count of errors reported to logs and sentry",
    &["status"]
);

/// Log an error to tracing and report it to sentry. Yields first so that an
/// error raised while the node shuts down does not hold up cancellation.
pub async fn report_error(err: &mut anyhow::Error) {
    trace_error(err);
    tokio::task::yield_now().await;
    report_error_to_sentry(err);
}

/// Use the `pub async fn report_error` above if possible. This is a
/// synchronous version for use in sync contexts.
pub fn report_error_sync(err: &mut anyhow::Error) {
    trace_error(err);
    report_error_to_sentry(err);
}

fn trace_error(err: &anyhow::Error) {
    let label = err.metric_status_label();
    log_counter_with_labels(&ERRORS_REPORTED_TOTAL, 1, vec![label.clone()]);
    let err_for_tracing = format!("{err:#}").replace('\n', "\\n");
    let full_msg = format!(
        "Caught {} error (RUST_BACKTRACE=1 RUST_LOG=info,{}=debug for full trace): \
         {err_for_tracing}",
        label.value,
        module_path!()
    );
    if err.is_transient() || err.is_environment_stop() {
        tracing::warn!("{full_msg}");
    } else {
        tracing::error!("{full_msg}");
    }
    tracing::debug!("{err:?}");
}

fn report_error_to_sentry(err: &anyhow::Error) {
    if let Some(e) = err.downcast_ref::<ErrorMetadata>() {
        if let Some(counter) = e.custom_metric() {
            log_counter(counter, 1);
        }
    }
    let Some((level, prob)) = err.should_report_to_sentry() else {
        return;
    };
    if let Some(prob) = prob {
        if rand::rng().random::<f64>() > prob {
            tracing::debug!("Not reporting above error to sentry - due to sampling.");
            return;
        }
    }
    let Some(client) = sentry::Hub::current().client() else {
        tracing::debug!("Not reporting above error: Sentry is not configured");
        return;
    };
    if !client.is_enabled() {
        return;
    }
    sentry::with_scope(
        |scope| scope.set_level(Some(level)),
        || sentry::integrations::anyhow::capture_anyhow(err),
    );
}
