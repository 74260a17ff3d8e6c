//! Human-in-the-loop approval records.
//!
//! An `ApprovalRequest` is created when a `human_approval` step is first
//! dispatched and is resolved by an external actor. The owning step reads the
//! decision when it is resumed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Decision state of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Denied,
}

impl ApprovalDecision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Denied => "denied",
        }
    }
}

impl fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "denied" => Ok(Self::Denied),
            other => Err(format!("invalid approval decision: '{other}'")),
        }
    }
}

/// An external-facing approval gate owned by one `(execution_id, step_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    /// Prompt shown to the approver, already template-resolved.
    pub prompt: String,
    pub decision: ApprovalDecision,
    /// Optional data submitted alongside the decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
}

impl ApprovalRequest {
    pub fn new(
        execution_id: Uuid,
        step_id: impl Into<String>,
        prompt: impl Into<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            approval_id: Uuid::now_v7(),
            execution_id,
            step_id: step_id.into(),
            prompt: prompt.into(),
            decision: ApprovalDecision::Pending,
            payload: None,
            requested_at: Utc::now(),
            expires_at,
            decided_at: None,
            decided_by: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.decision == ApprovalDecision::Pending
    }

    /// True when still pending and past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.expires_at.is_some_and(|at| at <= now)
    }
}
