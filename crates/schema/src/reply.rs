use crate::{InspectionOutcome, InspectionResult, timestamp};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

/// Value of the `result` field in a reply to a capture client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    /// First image of a pair stored, waiting for its partner.
    Pending,
    Normal,
    Defect,
    Anomaly,
    Error,
}

impl From<InspectionResult> for ReplyStatus {
    fn from(result: InspectionResult) -> Self {
        match result {
            InspectionResult::Normal => ReplyStatus::Normal,
            InspectionResult::Defect => ReplyStatus::Defect,
            InspectionResult::Anomaly => ReplyStatus::Anomaly,
            InspectionResult::Error => ReplyStatus::Error,
        }
    }
}

/// JSON body written back to a capture client, unframed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientReply {
    pub result: ReplyStatus,
    pub reason: String,
    pub timestamp: String,
}

impl ClientReply {
    pub fn pending(at: &DateTime<Local>) -> Self {
        Self {
            result: ReplyStatus::Pending,
            reason: "waiting for pair".to_string(),
            timestamp: timestamp::format(at),
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

impl From<&InspectionOutcome> for ClientReply {
    fn from(outcome: &InspectionOutcome) -> Self {
        Self {
            result: outcome.result.into(),
            reason: outcome.reason.clone(),
            timestamp: timestamp::format(&outcome.timestamp),
        }
    }
}
