use crate::tracker::ActivityState;
use serde::{Deserialize, Serialize};

/// The unit of externalised output, matching the backend's event DTO.
/// `timestamp` and `duration` are milliseconds; `project_id` is reserved and
/// never populated by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    pub device_id: String,
    pub timestamp: i64,
    pub status: ActivityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

/// Wire format of `POST /api/v1/events/batch`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest<'a> {
    pub events: &'a [TrackingEvent],
    pub device_id: &'a str,
    pub batch_timestamp: i64,
}
