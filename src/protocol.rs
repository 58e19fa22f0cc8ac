//! Wire messages
//!
//! Request parsing, reply shapes, and the messages exchanged with workers
//! over the bus. Everything here is plain data; the codec handles framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::PipelineError;
use crate::inference::Label;

/// Literal token sent after each durably written payload chunk
pub const ACK_TOKEN: &[u8; 3] = b"ACK";

/// Action assumed when a request omits `action`
pub const DEFAULT_ACTION: &str = "send_image";

pub const RESULTS_CHANNEL_PREFIX: &str = "results:";

/// Channel the worker pool consumes classification jobs from
pub const TASK_CHANNEL: &str = "tasks:classify";

/// Owner of uploads; numeric and string ids are echoed back as received
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubmitterId {
    Number(i64),
    Text(String),
}

impl fmt::Display for SubmitterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmitterId::Number(n) => write!(f, "{}", n),
            SubmitterId::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for SubmitterId {
    fn from(id: i64) -> Self {
        SubmitterId::Number(id)
    }
}

impl From<&str> for SubmitterId {
    fn from(id: &str) -> Self {
        SubmitterId::Text(id.to_string())
    }
}

/// Routing channel for a submitter's results
pub fn results_channel(submitter: &SubmitterId) -> String {
    format!("{}{}", RESULTS_CHANNEL_PREFIX, submitter)
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadRequest {
    #[serde(alias = "user_id")]
    pub submitter_id: SubmitterId,
    pub image_name: String,
    pub file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HistoryRequest {
    #[serde(alias = "user_id")]
    pub submitter_id: SubmitterId,
}

/// A decoded request frame
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Upload(UploadRequest),
    History(HistoryRequest),
    Unrecognized(String),
}

impl Request {
    pub fn parse(value: Value) -> Result<Self, PipelineError> {
        let action = match value.get("action") {
            None | Some(Value::Null) => DEFAULT_ACTION.to_string(),
            Some(Value::String(action)) => action.clone(),
            Some(other) => {
                return Err(PipelineError::InvalidRequest(format!(
                    "action must be a string, got {}",
                    other
                )))
            }
        };

        let invalid = |e: serde_json::Error| PipelineError::InvalidRequest(e.to_string());
        match action.as_str() {
            "send_image" => {
                let upload: UploadRequest = serde_json::from_value(value).map_err(invalid)?;
                if upload.image_name.trim().is_empty() {
                    return Err(PipelineError::InvalidRequest(
                        "image_name must not be empty".to_string(),
                    ));
                }
                Ok(Request::Upload(upload))
            }
            "get_history" => Ok(Request::History(
                serde_json::from_value(value).map_err(invalid)?,
            )),
            _ => Ok(Request::Unrecognized(action)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub image_id: u64,
    pub result: Label,
    pub confidence: f64,
}

/// Replies sent by a transfer session
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Accepted {
        status: Status,
        task_id: String,
        message: String,
    },
    Failed {
        status: Status,
        error: String,
        details: String,
    },
    Unrecognized {
        status: Status,
        message: String,
    },
    History {
        status: Status,
        historial: Vec<HistoryEntry>,
    },
}

impl Reply {
    pub fn accepted(task_id: impl Into<String>) -> Self {
        Reply::Accepted {
            status: Status::Success,
            task_id: task_id.into(),
            message: "image received, processing started".to_string(),
        }
    }

    pub fn failed(err: &PipelineError) -> Self {
        Reply::Failed {
            status: Status::Error,
            error: err.kind().to_string(),
            details: err.to_string(),
        }
    }

    pub fn unrecognized() -> Self {
        Reply::Unrecognized {
            status: Status::Error,
            message: "unrecognized action".to_string(),
        }
    }

    pub fn history(historial: Vec<HistoryEntry>) -> Self {
        Reply::History {
            status: Status::Success,
            historial,
        }
    }
}

/// Job handed to the worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifyJob {
    pub task_id: String,
    pub image_id: u64,
    pub image_path: String,
    pub submitter_id: SubmitterId,
}

/// Result published by a worker on `results:<submitter_id>` and forwarded,
/// with `task_id` attached, to the waiting connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub image: String,
    pub final_result: Label,
    pub confidence: f64,
    pub details: Vec<Label>,
    pub submitter_id: SubmitterId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<u64>,
}

/// Correlation key created at dispatch time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: String,
    pub image_id: u64,
    pub submitter_id: SubmitterId,
}

/// Outcome of one completed task, as the router hands it to persistence
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionResult {
    pub image_id: u64,
    pub label: Label,
    pub confidence: f64,
    pub raw_samples: Vec<Label>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_defaults_to_upload() {
        let req = Request::parse(json!({
            "user_id": 12,
            "image_name": "leaf.jpg",
            "file_size": 2048
        }))
        .unwrap();

        assert_eq!(
            req,
            Request::Upload(UploadRequest {
                submitter_id: SubmitterId::Number(12),
                image_name: "leaf.jpg".to_string(),
                file_size: 2048,
            })
        );
    }

    #[test]
    fn test_missing_or_negative_file_size_is_invalid() {
        let missing = Request::parse(json!({"action": "send_image", "submitter_id": 1, "image_name": "a.png"}));
        assert!(matches!(missing, Err(PipelineError::InvalidRequest(_))));

        let negative = Request::parse(json!({
            "action": "send_image", "submitter_id": 1, "image_name": "a.png", "file_size": -4
        }));
        assert!(matches!(negative, Err(PipelineError::InvalidRequest(_))));
    }

    #[test]
    fn test_history_and_unknown_actions() {
        let req = Request::parse(json!({"action": "get_history", "submitter_id": "alice"})).unwrap();
        assert_eq!(
            req,
            Request::History(HistoryRequest {
                submitter_id: SubmitterId::Text("alice".into())
            })
        );

        let req = Request::parse(json!({"action": "noop"})).unwrap();
        assert_eq!(req, Request::Unrecognized("noop".into()));
    }

    #[test]
    fn test_reply_shapes() {
        let reply = serde_json::to_value(Reply::unrecognized()).unwrap();
        assert_eq!(reply, json!({"status": "error", "message": "unrecognized action"}));

        let reply = serde_json::to_value(Reply::history(vec![])).unwrap();
        assert_eq!(reply, json!({"status": "success", "historial": []}));

        let err = PipelineError::SubmitterBusy("7".into());
        let reply = serde_json::to_value(Reply::failed(&err)).unwrap();
        assert_eq!(reply["status"], "error");
        assert_eq!(reply["error"], "submitter_busy");
    }

    #[test]
    fn test_results_channel_naming() {
        assert_eq!(results_channel(&SubmitterId::Number(42)), "results:42");
        assert_eq!(results_channel(&"bob".into()), "results:bob");
    }
}
