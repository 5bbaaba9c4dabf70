use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EnqueueError;

/// Parameters of a report generation request. Serialized as the entry payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRequestParams {
    pub report_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marketplace_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_options: Option<String>,
}

impl ReportRequestParams {
    pub fn new(report_type: impl Into<String>) -> Self {
        Self {
            report_type: report_type.into(),
            start_date: None,
            end_date: None,
            marketplace_ids: Vec::new(),
            report_options: None,
        }
    }

    pub fn between(mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        self.start_date = Some(start);
        self.end_date = Some(end);
        self
    }

    pub fn marketplace(mut self, id: impl Into<String>) -> Self {
        self.marketplace_ids.push(id.into());
        self
    }

    pub fn validate(&self) -> Result<(), EnqueueError> {
        if self.report_type.trim().is_empty() {
            return Err(EnqueueError::InvalidParams("report_type is empty".into()));
        }
        if let (Some(start), Some(end)) = (self.start_date, self.end_date) {
            if start > end {
                return Err(EnqueueError::InvalidParams(format!(
                    "start_date {start} is after end_date {end}"
                )));
            }
        }
        if self.marketplace_ids.iter().any(|m| m.trim().is_empty()) {
            return Err(EnqueueError::InvalidParams(
                "marketplace_ids contains an empty id".into(),
            ));
        }
        Ok(())
    }
}

/// Parameters of a feed submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSubmissionParams {
    pub feed_type: String,
    pub feed_content: String,
    #[serde(default)]
    pub purge_and_replace: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marketplace_ids: Vec<String>,
}

impl FeedSubmissionParams {
    pub fn new(feed_type: impl Into<String>, feed_content: impl Into<String>) -> Self {
        Self {
            feed_type: feed_type.into(),
            feed_content: feed_content.into(),
            purge_and_replace: false,
            marketplace_ids: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), EnqueueError> {
        if self.feed_type.trim().is_empty() {
            return Err(EnqueueError::InvalidParams("feed_type is empty".into()));
        }
        if self.feed_content.is_empty() {
            return Err(EnqueueError::InvalidParams("feed_content is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn report_params_reject_empty_type_and_reversed_range() {
        assert!(ReportRequestParams::new("  ").validate().is_err());

        let now = Utc::now();
        let reversed = ReportRequestParams::new("_GET_FLAT_FILE_ORDERS_DATA_")
            .between(now, now - Duration::days(1));
        assert!(reversed.validate().is_err());

        let ok = ReportRequestParams::new("_GET_FLAT_FILE_ORDERS_DATA_")
            .between(now - Duration::days(7), now)
            .marketplace("A1F83G8C2ARO7P");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn feed_params_need_content() {
        assert!(FeedSubmissionParams::new("_POST_PRODUCT_DATA_", "")
            .validate()
            .is_err());

        let feed = FeedSubmissionParams::new("_POST_PRODUCT_DATA_", "testStreamContent");
        assert!(feed.validate().is_ok());
    }

    #[test]
    fn optional_fields_are_omitted_from_payload() {
        let v = serde_json::to_value(ReportRequestParams::new("t")).unwrap();
        assert_eq!(v, serde_json::json!({"report_type": "t"}));
    }
}
