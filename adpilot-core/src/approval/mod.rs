mod store;
mod workflow;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ApprovalMatrixRow, ApprovalSection};
use crate::guardrail::PlannedChanges;

pub use store::{SqliteApprovalStore, SqliteApprovalStoreBuilder};
pub use workflow::ApprovalWorkflow;

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("approval store path not configured")]
    MissingStore,
    #[error("failed to open database at {path}: {source}")]
    OpenDatabase {
        path: PathBuf,
        source: rusqlite::Error,
    },
    #[error("approval request {request_id} not found")]
    NotFound { request_id: String },
    #[error("{approver} is not authorized to act on this request")]
    Unauthorized { approver: String },
    #[error("{approver} has already voted on this request")]
    AlreadyVoted { approver: String },
    #[error("request is {status}, which is final")]
    InvalidState { status: String },
    #[error("unknown approval value: {0}")]
    Parse(String),
}

pub type ApprovalResult<T> = std::result::Result<T, ApprovalError>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ApprovalSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalSeverity::Low => "LOW",
            ApprovalSeverity::Medium => "MEDIUM",
            ApprovalSeverity::High => "HIGH",
            ApprovalSeverity::Critical => "CRITICAL",
        }
    }

    pub fn bump(self) -> Self {
        match self {
            ApprovalSeverity::Low => ApprovalSeverity::Medium,
            ApprovalSeverity::Medium => ApprovalSeverity::High,
            _ => ApprovalSeverity::Critical,
        }
    }
}

impl fmt::Display for ApprovalSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalSeverity {
    type Err = ApprovalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "LOW" => Ok(ApprovalSeverity::Low),
            "MEDIUM" => Ok(ApprovalSeverity::Medium),
            "HIGH" => Ok(ApprovalSeverity::High),
            "CRITICAL" => Ok(ApprovalSeverity::Critical),
            other => Err(ApprovalError::Parse(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "PENDING",
            ApprovalStatus::Approved => "APPROVED",
            ApprovalStatus::Rejected => "REJECTED",
            ApprovalStatus::Expired => "EXPIRED",
            ApprovalStatus::Cancelled => "CANCELLED",
        }
    }

    /// Terminal statuses never change again.
    pub fn terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApprovalStatus {
    type Err = ApprovalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(ApprovalStatus::Pending),
            "APPROVED" => Ok(ApprovalStatus::Approved),
            "REJECTED" => Ok(ApprovalStatus::Rejected),
            "EXPIRED" => Ok(ApprovalStatus::Expired),
            "CANCELLED" => Ok(ApprovalStatus::Cancelled),
            other => Err(ApprovalError::Parse(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
}

impl VoteDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteDecision::Approve => "approve",
            VoteDecision::Reject => "reject",
        }
    }
}

impl FromStr for VoteDecision {
    type Err = ApprovalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(VoteDecision::Approve),
            "reject" => Ok(VoteDecision::Reject),
            other => Err(ApprovalError::Parse(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalDecision {
    pub approver: String,
    pub decision: VoteDecision,
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub id: String,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub change_type: String,
    pub severity: ApprovalSeverity,
    pub approvers: Vec<String>,
    pub required_approvals: u32,
    pub current_approvals: Vec<ApprovalDecision>,
    pub status: ApprovalStatus,
    pub expires_at: DateTime<Utc>,
    pub escalation_after_hours: i64,
    pub estimated_impact: String,
    pub changes: PlannedChanges,
}

impl ApprovalRequest {
    pub fn approvals(&self) -> usize {
        self.current_approvals
            .iter()
            .filter(|decision| decision.decision == VoteDecision::Approve)
            .count()
    }

    pub fn has_voted(&self, approver: &str) -> bool {
        self.current_approvals
            .iter()
            .any(|decision| decision.approver == approver)
    }
}

/// Budget-delta tiers plus structural escalation decide the severity
/// grade, which in turn selects the approval-matrix row.
pub fn grade_severity(policy: &ApprovalSection, changes: &PlannedChanges) -> ApprovalSeverity {
    let delta = changes.total_budget_delta().abs();
    let tiers = &policy.tiers;
    let mut severity = if delta <= tiers.low {
        ApprovalSeverity::Low
    } else if delta <= tiers.medium {
        ApprovalSeverity::Medium
    } else if delta <= tiers.high {
        ApprovalSeverity::High
    } else {
        ApprovalSeverity::Critical
    };

    if changes.has_structural_deletions() && severity < ApprovalSeverity::High {
        severity = ApprovalSeverity::High;
    }
    if changes.affected_campaigns() >= 20 {
        severity = severity.bump();
    }
    severity
}

pub fn matrix_row(policy: &ApprovalSection, severity: ApprovalSeverity) -> &ApprovalMatrixRow {
    match severity {
        ApprovalSeverity::Low => &policy.matrix.low,
        ApprovalSeverity::Medium => &policy.matrix.medium,
        ApprovalSeverity::High => &policy.matrix.high,
        ApprovalSeverity::Critical => &policy.matrix.critical,
    }
}
