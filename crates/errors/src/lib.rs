use std::borrow::Cow;

use ::metrics::MetricLabel;
use prometheus::IntCounter;

mod metrics;

/// ErrorMetadata object can be attached to an anyhow error chain via
/// `.context(e /*ErrorMetadata*/)`. It tags errors with the information the
/// maintenance loops use to decide between retrying, stopping quietly, and
/// halting the node.
///
/// The short_msg is used as a tag in tests and metrics so that assertions are
/// resilient to changes in the descriptive msg.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    /// The error code associated with this ErrorMetadata
    pub code: ErrorCode,
    /// short ScreamingCamelCase. Usable in tests for string matching.
    /// Eg LockConflict
    pub short_msg: Cow<'static, str>,
    /// human readable. Should be longer and descriptive.
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A storage transaction lost a lock to a concurrent transaction.
    LockConflict,
    /// A majority commit did not reach enough replicas.
    InsufficientReplicas,

    /// The storage environment handle was closed or replaced.
    EnvironmentInvalid,
    /// A write was attempted on a node that is not the leader.
    NotLeader,

    /// A catalog definition cannot be realized (eg an index on a missing table).
    InvalidDefinition,
    /// Persisted or in-memory state contradicts itself.
    InvariantViolation,

    NotFound,
}

impl ErrorMetadata {
    pub fn lock_conflict(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::LockConflict,
            short_msg: LOCK_CONFLICT.into(),
            msg: msg.into(),
        }
    }

    pub fn insufficient_replicas(msg: impl Into<Cow<'static, str>>) -> Self {
        Self {
            code: ErrorCode::InsufficientReplicas,
            short_msg: INSUFFICIENT_REPLICAS.into(),
            msg: msg.into(),
        }
    }

    pub fn environment_invalid() -> Self {
        Self {
            code: ErrorCode::EnvironmentInvalid,
            short_msg: ENVIRONMENT_INVALID.into(),
            msg: ENVIRONMENT_INVALID_MSG.into(),
        }
    }

    pub fn not_leader() -> Self {
        Self {
            code: ErrorCode::NotLeader,
            short_msg: NOT_LEADER.into(),
            msg: NOT_LEADER_MSG.into(),
        }
    }

    /// The short_msg should be a CapitalCamelCased describing the error (eg
    /// IndexTableMissing).
    pub fn invalid_definition(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvalidDefinition,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// An error that must halt the node rather than be retried.
    pub fn invariant_violation(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::InvariantViolation,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn is_lock_conflict(&self) -> bool {
        self.code == ErrorCode::LockConflict
    }

    pub fn is_insufficient_replicas(&self) -> bool {
        self.code == ErrorCode::InsufficientReplicas
    }

    pub fn is_not_leader(&self) -> bool {
        self.code == ErrorCode::NotLeader
    }

    pub fn is_environment_invalid(&self) -> bool {
        self.code == ErrorCode::EnvironmentInvalid
    }

    pub fn is_invalid_definition(&self) -> bool {
        self.code == ErrorCode::InvalidDefinition
    }

    pub fn is_invariant_violation(&self) -> bool {
        self.code == ErrorCode::InvariantViolation
    }

    pub fn is_not_found(&self) -> bool {
        self.code == ErrorCode::NotFound
    }

    /// Errors that may succeed if the same operation is attempted again.
    pub fn is_transient(&self) -> bool {
        match self.code {
            ErrorCode::LockConflict | ErrorCode::InsufficientReplicas => true,
            ErrorCode::EnvironmentInvalid
            | ErrorCode::NotLeader
            | ErrorCode::InvalidDefinition
            | ErrorCode::InvariantViolation
            | ErrorCode::NotFound => false,
        }
    }

    /// Errors meaning the node can no longer write through this environment.
    /// Loops that hit one stop quietly and wait to be restarted.
    pub fn is_environment_stop(&self) -> bool {
        match self.code {
            ErrorCode::EnvironmentInvalid | ErrorCode::NotLeader => true,
            ErrorCode::LockConflict
            | ErrorCode::InsufficientReplicas
            | ErrorCode::InvalidDefinition
            | ErrorCode::InvariantViolation
            | ErrorCode::NotFound => false,
        }
    }

    pub fn should_report_to_sentry(&self) -> Option<(sentry::Level, Option<f64>)> {
        match self.code {
            ErrorCode::EnvironmentInvalid | ErrorCode::NotLeader => None,
            // 1% sampling for lock conflicts, they only matter at high volume.
            ErrorCode::LockConflict => Some((sentry::Level::Warning, Some(0.01))),
            ErrorCode::InsufficientReplicas => Some((sentry::Level::Warning, None)),
            ErrorCode::InvalidDefinition | ErrorCode::NotFound => Some((sentry::Level::Info, None)),
            ErrorCode::InvariantViolation => Some((sentry::Level::Fatal, None)),
        }
    }

    fn metric_status_label_value(&self) -> &'static str {
        match self.code {
            ErrorCode::LockConflict => "lock_conflict",
            ErrorCode::InsufficientReplicas => "insufficient_replicas",
            ErrorCode::EnvironmentInvalid => "environment_invalid",
            ErrorCode::NotLeader => "not_leader",
            ErrorCode::InvalidDefinition => "invalid_definition",
            ErrorCode::InvariantViolation => "invariant_violation",
            ErrorCode::NotFound => "not_found",
        }
    }

    pub fn custom_metric(&self) -> Option<&'static IntCounter> {
        match self.code {
            ErrorCode::LockConflict => Some(&crate::metrics::LOCK_CONFLICT_ERROR_TOTAL),
            ErrorCode::InsufficientReplicas => {
                Some(&crate::metrics::INSUFFICIENT_REPLICAS_ERROR_TOTAL)
            },
            ErrorCode::NotLeader => Some(&crate::metrics::NOT_LEADER_ERROR_TOTAL),
            ErrorCode::EnvironmentInvalid => {
                Some(&crate::metrics::ENVIRONMENT_INVALID_ERROR_TOTAL)
            },
            ErrorCode::InvalidDefinition
            | ErrorCode::InvariantViolation
            | ErrorCode::NotFound => None,
        }
    }
}

pub trait ErrorMetadataAnyhowExt {
    fn is_lock_conflict(&self) -> bool;
    fn is_not_leader(&self) -> bool;
    fn is_environment_invalid(&self) -> bool;
    fn is_invalid_definition(&self) -> bool;
    fn is_invariant_violation(&self) -> bool;
    fn is_not_found(&self) -> bool;
    fn is_transient(&self) -> bool;
    fn is_environment_stop(&self) -> bool;
    fn should_report_to_sentry(&self) -> Option<(sentry::Level, Option<f64>)>;
    fn short_msg(&self) -> &str;
    fn msg(&self) -> &str;
    fn metric_status_label(&self) -> MetricLabel;
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String;
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn is_lock_conflict(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_lock_conflict();
        }
        false
    }

    fn is_not_leader(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_leader();
        }
        false
    }

    fn is_environment_invalid(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_environment_invalid();
        }
        false
    }

    fn is_invalid_definition(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_invalid_definition();
        }
        false
    }

    fn is_invariant_violation(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_invariant_violation();
        }
        false
    }

    fn is_not_found(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_not_found();
        }
        false
    }

    /// Returns true if the error is tagged as retriable. Untagged errors are
    /// never retried.
    fn is_transient(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_transient();
        }
        false
    }

    fn is_environment_stop(&self) -> bool {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.is_environment_stop();
        }
        false
    }

    /// Returns the level at which the given error should report to sentry
    /// INFO -> a bad definition or request from outside the node
    /// WARNING -> an expected storage fault
    /// ERROR -> an untagged error, probably a bug
    /// FATAL -> it halts the node
    fn should_report_to_sentry(&self) -> Option<(sentry::Level, Option<f64>)> {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return e.should_report_to_sentry();
        }
        Some((sentry::Level::Error, None))
    }

    fn short_msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.short_msg;
        }
        INTERNAL_ERROR
    }

    fn msg(&self) -> &str {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return &e.msg;
        }
        INTERNAL_ERROR_MSG
    }

    /// Return the label to use on a status metric
    fn metric_status_label(&self) -> MetricLabel {
        if let Some(e) = self.downcast_ref::<ErrorMetadata>() {
            return MetricLabel::new_const("status", e.metric_status_label_value());
        }
        MetricLabel::STATUS_ERROR
    }

    /// Wrap the underlying error message, maintaining the underlying error
    /// metadata short code if it exists.
    fn wrap_error_message<F>(self, f: F) -> Self
    where
        F: FnOnce(String) -> String,
    {
        if let Some(mut em) = self.downcast_ref::<ErrorMetadata>().cloned() {
            em.msg = f(em.msg.to_string()).into();
            return self.context(em);
        }
        let new_msg = f(self.to_string());
        self.context(new_msg)
    }
}

pub const INTERNAL_ERROR_MSG: &str = "An internal error occurred.";
pub const INTERNAL_ERROR: &str = "InternalError";
pub const LOCK_CONFLICT: &str = "LockConflict";
pub const INSUFFICIENT_REPLICAS: &str = "InsufficientReplicas";
pub const ENVIRONMENT_INVALID: &str = "EnvironmentInvalid";
const ENVIRONMENT_INVALID_MSG: &str = "The storage environment is no longer valid.";
pub const NOT_LEADER: &str = "NotLeader";
const NOT_LEADER_MSG: &str = "This node is not the leader of its replication group.";

#[cfg(any(test, feature = "testing"))]
mod proptest_impls {
    use proptest::prelude::*;

    use super::{
        ErrorCode,
        ErrorMetadata,
    };

    impl Arbitrary for ErrorMetadata {
        type Parameters = ();

        type Strategy = BoxedStrategy<Self>;

        fn arbitrary_with((): Self::Parameters) -> Self::Strategy {
            any::<ErrorCode>()
                .prop_map(|ec| match ec {
                    ErrorCode::LockConflict => ErrorMetadata::lock_conflict("conflict"),
                    ErrorCode::InsufficientReplicas => {
                        ErrorMetadata::insufficient_replicas("replicas")
                    },
                    ErrorCode::EnvironmentInvalid => ErrorMetadata::environment_invalid(),
                    ErrorCode::NotLeader => ErrorMetadata::not_leader(),
                    ErrorCode::InvalidDefinition => {
                        ErrorMetadata::invalid_definition("invalid", "definition")
                    },
                    ErrorCode::InvariantViolation => {
                        ErrorMetadata::invariant_violation("invariant", "violation")
                    },
                    ErrorCode::NotFound => ErrorMetadata::not_found("not", "found"),
                })
                .boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Context;
    use proptest::prelude::*;

    use crate::{
        ErrorCode,
        ErrorMetadata,
        ErrorMetadataAnyhowExt,
        INTERNAL_ERROR,
    };

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_error_classes_are_disjoint(err in any::<ErrorMetadata>()) {
            let classes = [
                err.is_transient(),
                err.is_environment_stop(),
                err.is_invalid_definition(),
                err.is_invariant_violation(),
            ];
            assert!(classes.iter().filter(|c| **c).count() <= 1);
        }

        #[test]
        fn test_error_visibility(err in any::<ErrorMetadata>()) {
            // Every error is visible through sentry or a custom metric.
            assert!(err.should_report_to_sentry().is_some() || err.custom_metric().is_some());
            if err.code == ErrorCode::InvariantViolation {
                assert_eq!(err.should_report_to_sentry().unwrap().0, sentry::Level::Fatal);
            }
        }
    }

    #[test]
    fn test_metadata_survives_context() {
        let err = anyhow::anyhow!(ErrorMetadata::lock_conflict("row 7 held by tx 3"))
            .context("populate batch failed");
        assert!(err.is_lock_conflict());
        assert!(err.is_transient());
        assert!(!err.is_environment_stop());
        assert_eq!(err.short_msg(), "LockConflict");

        let err: anyhow::Result<()> =
            Err(anyhow::anyhow!("commit failed")).context(ErrorMetadata::not_leader());
        let err = err.unwrap_err();
        assert!(err.is_environment_stop());
        assert!(!err.is_transient());
    }

    #[test]
    fn test_untagged_errors() {
        let err = anyhow::anyhow!("disk on fire");
        assert!(!err.is_transient());
        assert!(!err.is_environment_stop());
        assert_eq!(err.short_msg(), INTERNAL_ERROR);
        assert_eq!(
            err.should_report_to_sentry(),
            Some((sentry::Level::Error, None))
        );
    }

    #[test]
    fn test_wrap_error_message_keeps_code() {
        let err = anyhow::anyhow!(ErrorMetadata::invalid_definition(
            "IndexTableMissing",
            "table 9 is not in the catalog"
        ))
        .wrap_error_message(|msg| format!("opening ix_sku: {msg}"));
        assert!(err.is_invalid_definition());
        assert_eq!(err.msg(), "opening ix_sku: table 9 is not in the catalog");
    }
}
