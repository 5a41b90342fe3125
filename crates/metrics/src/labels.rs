use std::borrow::Cow;

pub type Labels = Vec<MetricLabel>;

#[derive(PartialOrd, Ord, PartialEq, Eq, Clone, Debug)]
pub struct MetricLabel {
    pub key: &'static str,
    pub value: Cow<'static, str>,
}

impl MetricLabel {
    pub const STATUS_ERROR: MetricLabel = MetricLabel::new_const("status", "error");
    pub const STATUS_SUCCESS: MetricLabel = MetricLabel::new_const("status", "success");

    pub fn new(key: &'static str, value: impl Into<Cow<'static, str>>) -> Self {
        Self {
            key,
            value: value.into(),
        }
    }

    pub const fn new_const(key: &'static str, value: &'static str) -> Self {
        Self {
            key,
            value: Cow::Borrowed(value),
        }
    }

    pub fn status(is_ok: bool) -> MetricLabel {
        if is_ok {
            Self::STATUS_SUCCESS
        } else {
            Self::STATUS_ERROR
        }
    }

    pub fn split_key_value(&self) -> (&str, &str) {
        (self.key, &self.value)
    }
}

pub const STATUS_LABEL: [&str; 1] = ["status"];

/// Enums that are reported as a label value implement this so the label set
/// stays closed.
pub trait IntoLabel {
    fn as_label(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::MetricLabel;

    #[test]
    fn test_status_label() {
        assert_eq!(MetricLabel::status(true).split_key_value(), ("status", "success"));
        assert_eq!(MetricLabel::status(false).split_key_value(), ("status", "error"));
        assert_eq!(
            MetricLabel::new("task", String::from("populate")).split_key_value(),
            ("task", "populate")
        );
    }
}
