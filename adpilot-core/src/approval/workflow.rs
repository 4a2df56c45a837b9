use std::sync::Arc;

use chrono::Duration;
use tracing::info;
use uuid::Uuid;

use crate::config::ApprovalSection;
use crate::guardrail::PlannedChanges;
use crate::runtime::Clock;

use super::store::SqliteApprovalStore;
use super::{
    grade_severity, matrix_row, ApprovalDecision, ApprovalError, ApprovalRequest, ApprovalResult,
    ApprovalSeverity, ApprovalStatus, VoteDecision,
};

/// Severity-driven multi-approver workflow over the approval store.
/// Requests move only through `submit -> vote -> {approve|reject}` or the
/// expiry/cancellation sweeps; terminal statuses are final.
pub struct ApprovalWorkflow {
    store: SqliteApprovalStore,
    policy: ApprovalSection,
    clock: Arc<dyn Clock>,
}

impl ApprovalWorkflow {
    pub fn new(store: SqliteApprovalStore, policy: ApprovalSection, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policy,
            clock,
        }
    }

    pub fn submit(
        &self,
        changes: PlannedChanges,
        requested_by: &str,
        change_type: &str,
    ) -> ApprovalResult<ApprovalRequest> {
        let now = self.clock.now();
        let severity = grade_severity(&self.policy, &changes);
        let row = matrix_row(&self.policy, severity);
        let delta = changes.total_budget_delta();

        let mut request = ApprovalRequest {
            id: format!("apr-{}", Uuid::new_v4().simple()),
            requested_by: requested_by.to_string(),
            requested_at: now,
            change_type: change_type.to_string(),
            severity,
            approvers: row.approvers.clone(),
            required_approvals: row.required_approvals,
            current_approvals: Vec::new(),
            status: ApprovalStatus::Pending,
            expires_at: now + Duration::hours(self.policy.expiration_hours),
            escalation_after_hours: row.escalation_after_hours,
            estimated_impact: format!(
                "budget delta {:.2}, {} campaign(s) affected",
                delta,
                changes.affected_campaigns()
            ),
            changes,
        };

        let auto = &self.policy.auto;
        let auto_approved = auto.enabled
            && auto.allowlist.iter().any(|user| user == requested_by)
            && severity == ApprovalSeverity::Low
            && delta.abs() <= auto.max_budget_delta;

        self.store.insert_request(&request)?;
        if auto_approved {
            let decision = ApprovalDecision {
                approver: "system".to_string(),
                decision: VoteDecision::Approve,
                comment: Some("auto-approved by policy".to_string()),
                decided_at: now,
            };
            self.store.append_decision(&request.id, &decision)?;
            self.store
                .update_status(&request.id, ApprovalStatus::Approved, now)?;
            self.store.insert_ready(
                &request.id,
                &serde_json::to_string(&request.changes)?,
                now,
            )?;
            request.current_approvals.push(decision);
            request.status = ApprovalStatus::Approved;
            info!(target: "approval", id = %request.id, "request auto-approved");
        } else {
            info!(
                target: "approval",
                id = %request.id,
                severity = %severity,
                required = request.required_approvals,
                "request submitted"
            );
        }
        Ok(request)
    }

    pub fn vote(
        &self,
        request_id: &str,
        approver: &str,
        decision: VoteDecision,
        comment: Option<String>,
    ) -> ApprovalResult<ApprovalRequest> {
        let now = self.clock.now();
        let request = self.store.require(request_id)?;

        if request.status.terminal() {
            return Err(ApprovalError::InvalidState {
                status: request.status.to_string(),
            });
        }
        if request.expires_at <= now {
            self.store
                .update_status(request_id, ApprovalStatus::Expired, now)?;
            return Err(ApprovalError::InvalidState {
                status: ApprovalStatus::Expired.to_string(),
            });
        }
        if !request.approvers.iter().any(|candidate| candidate == approver) {
            return Err(ApprovalError::Unauthorized {
                approver: approver.to_string(),
            });
        }
        if request.has_voted(approver) {
            return Err(ApprovalError::AlreadyVoted {
                approver: approver.to_string(),
            });
        }

        self.store.append_decision(
            request_id,
            &ApprovalDecision {
                approver: approver.to_string(),
                decision,
                comment,
                decided_at: now,
            },
        )?;

        let request = self.store.require(request_id)?;
        match decision {
            VoteDecision::Reject => {
                self.store
                    .update_status(request_id, ApprovalStatus::Rejected, now)?;
                info!(target: "approval", id = request_id, approver, "request rejected");
            }
            VoteDecision::Approve => {
                if request.approvals() >= request.required_approvals as usize {
                    self.store
                        .update_status(request_id, ApprovalStatus::Approved, now)?;
                    self.store.insert_ready(
                        request_id,
                        &serde_json::to_string(&request.changes)?,
                        now,
                    )?;
                    info!(target: "approval", id = request_id, "request approved");
                }
            }
        }
        self.store.require(request_id)
    }

    /// Cancellation is restricted to the originator or an administrator.
    pub fn cancel(&self, request_id: &str, by: &str) -> ApprovalResult<ApprovalRequest> {
        let now = self.clock.now();
        let request = self.store.require(request_id)?;
        if request.status.terminal() {
            return Err(ApprovalError::InvalidState {
                status: request.status.to_string(),
            });
        }
        let is_admin = self
            .policy
            .administrators
            .iter()
            .any(|admin| admin == by);
        if by != request.requested_by && !is_admin {
            return Err(ApprovalError::Unauthorized {
                approver: by.to_string(),
            });
        }
        self.store
            .update_status(request_id, ApprovalStatus::Cancelled, now)?;
        self.store.require(request_id)
    }

    /// Marks every overdue pending request EXPIRED; returns the ids.
    pub fn expire_due(&self) -> ApprovalResult<Vec<String>> {
        let now = self.clock.now();
        let due = self.store.pending_expired(now)?;
        for request_id in &due {
            self.store
                .update_status(request_id, ApprovalStatus::Expired, now)?;
            info!(target: "approval", id = %request_id, "request expired");
        }
        Ok(due)
    }

    /// Appends one escalation notification per overdue pending request
    /// that has not been escalated yet; returns the ids.
    pub fn escalate_due(&self) -> ApprovalResult<Vec<String>> {
        let now = self.clock.now();
        let due = self.store.pending_escalations(now)?;
        for request_id in &due {
            let request = self.store.require(request_id)?;
            self.store
                .insert_escalation(request_id, &request.approvers, now)?;
            info!(
                target: "approval",
                id = %request_id,
                hours = request.escalation_after_hours,
                "request escalated"
            );
        }
        Ok(due)
    }

    pub fn list(
        &self,
        status: Option<ApprovalStatus>,
        limit: usize,
    ) -> ApprovalResult<Vec<ApprovalRequest>> {
        self.store.list(status, limit)
    }

    pub fn fetch(&self, request_id: &str) -> ApprovalResult<ApprovalRequest> {
        self.store.require(request_id)
    }

    pub fn ready_changes(&self, request_id: &str) -> ApprovalResult<Option<String>> {
        self.store.ready_changes(request_id)
    }
}
