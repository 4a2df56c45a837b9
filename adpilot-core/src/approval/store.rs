use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};

use crate::sqlite::configure_connection;

use super::{
    ApprovalDecision, ApprovalError, ApprovalRequest, ApprovalResult, ApprovalSeverity,
    ApprovalStatus, VoteDecision,
};

const APPROVAL_SCHEMA: &str = include_str!("../../../sql/approvals.sql");

#[derive(Debug, Clone)]
pub struct SqliteApprovalStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteApprovalStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteApprovalStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn build(self) -> ApprovalResult<SqliteApprovalStore> {
        let path = self.path.ok_or(ApprovalError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteApprovalStore { path, flags })
    }
}

#[derive(Debug, Clone)]
pub struct SqliteApprovalStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteApprovalStore {
    pub fn builder() -> SqliteApprovalStoreBuilder {
        SqliteApprovalStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> ApprovalResult<Self> {
        SqliteApprovalStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> ApprovalResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            ApprovalError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| ApprovalError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> ApprovalResult<()> {
        let conn = self.open()?;
        conn.execute_batch(APPROVAL_SCHEMA)?;
        Ok(())
    }

    pub fn insert_request(&self, request: &ApprovalRequest) -> ApprovalResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO approval_requests (
                request_id, requested_by, requested_at, change_type, severity, approvers,
                required_approvals, status, expires_at, escalation_after_hours,
                estimated_impact, changes_json, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?3)",
            params![
                request.id,
                request.requested_by,
                request.requested_at.naive_utc(),
                request.change_type,
                request.severity.as_str(),
                serde_json::to_string(&request.approvers)?,
                request.required_approvals as i64,
                request.status.as_str(),
                request.expires_at.naive_utc(),
                request.escalation_after_hours,
                request.estimated_impact,
                serde_json::to_string(&request.changes)?,
            ],
        )?;
        Ok(())
    }

    pub fn fetch(&self, request_id: &str) -> ApprovalResult<Option<ApprovalRequest>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM approval_requests WHERE request_id = ?1")?;
        let Some(mut request) = stmt
            .query_row([request_id], |row| request_from_row(row))
            .optional()?
        else {
            return Ok(None);
        };
        request.current_approvals = self.decisions_for(&conn, request_id)?;
        Ok(Some(request))
    }

    pub fn require(&self, request_id: &str) -> ApprovalResult<ApprovalRequest> {
        self.fetch(request_id)?
            .ok_or_else(|| ApprovalError::NotFound {
                request_id: request_id.to_string(),
            })
    }

    fn decisions_for(
        &self,
        conn: &Connection,
        request_id: &str,
    ) -> ApprovalResult<Vec<ApprovalDecision>> {
        let mut stmt = conn.prepare(
            "SELECT approver, decision, comment, decided_at
             FROM approval_decisions
             WHERE request_id = ?1
             ORDER BY decision_id ASC",
        )?;
        let decisions = stmt
            .query_map([request_id], |row| {
                let decided_at: NaiveDateTime = row.get("decided_at")?;
                Ok((
                    row.get::<_, String>("approver")?,
                    row.get::<_, String>("decision")?,
                    row.get::<_, Option<String>>("comment")?,
                    decided_at,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut rows = Vec::with_capacity(decisions.len());
        for (approver, decision_raw, comment, decided_at) in decisions {
            rows.push(ApprovalDecision {
                approver,
                decision: decision_raw.parse::<VoteDecision>()?,
                comment,
                decided_at: Utc.from_utc_datetime(&decided_at),
            });
        }
        Ok(rows)
    }

    /// Append-only: one row per (request, approver) vote.
    pub fn append_decision(
        &self,
        request_id: &str,
        decision: &ApprovalDecision,
    ) -> ApprovalResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO approval_decisions (request_id, approver, decision, comment, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                request_id,
                decision.approver,
                decision.decision.as_str(),
                decision.comment,
                decision.decided_at.naive_utc(),
            ],
        )?;
        Ok(())
    }

    pub fn update_status(
        &self,
        request_id: &str,
        status: ApprovalStatus,
        now: DateTime<Utc>,
    ) -> ApprovalResult<()> {
        let conn = self.open()?;
        let affected = conn.execute(
            "UPDATE approval_requests SET status = ?2, updated_at = ?3 WHERE request_id = ?1",
            params![request_id, status.as_str(), now.naive_utc()],
        )?;
        if affected == 0 {
            return Err(ApprovalError::NotFound {
                request_id: request_id.to_string(),
            });
        }
        Ok(())
    }

    /// Ready-for-application record persisted when a request reaches
    /// APPROVED; a separate applier consumes it.
    pub fn insert_ready(
        &self,
        request_id: &str,
        changes_json: &str,
        now: DateTime<Utc>,
    ) -> ApprovalResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO approval_ready (request_id, approved_at, changes_json, applied)
             VALUES (?1, ?2, ?3, 0)",
            params![request_id, now.naive_utc(), changes_json],
        )?;
        Ok(())
    }

    pub fn ready_changes(&self, request_id: &str) -> ApprovalResult<Option<String>> {
        let conn = self.open()?;
        let changes = conn
            .query_row(
                "SELECT changes_json FROM approval_ready WHERE request_id = ?1",
                [request_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(changes)
    }

    pub fn list(
        &self,
        status: Option<ApprovalStatus>,
        limit: usize,
    ) -> ApprovalResult<Vec<ApprovalRequest>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT request_id FROM approval_requests
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY requested_at DESC, request_id ASC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(
                (status.as_ref().map(ApprovalStatus::as_str), limit as i64),
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut requests = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(request) = self.fetch(&id)? {
                requests.push(request);
            }
        }
        Ok(requests)
    }

    pub fn pending_expired(&self, now: DateTime<Utc>) -> ApprovalResult<Vec<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT request_id FROM approval_requests
             WHERE status = 'PENDING' AND expires_at <= ?1
             ORDER BY request_id ASC",
        )?;
        let ids = stmt
            .query_map([now.naive_utc()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn pending_escalations(&self, now: DateTime<Utc>) -> ApprovalResult<Vec<String>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT r.request_id FROM approval_requests r
             WHERE r.status = 'PENDING'
               AND datetime(r.requested_at, '+' || r.escalation_after_hours || ' hours') <= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM approval_escalations e WHERE e.request_id = r.request_id
               )
             ORDER BY r.request_id ASC",
        )?;
        let ids = stmt
            .query_map([now.naive_utc()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn insert_escalation(
        &self,
        request_id: &str,
        notified: &[String],
        now: DateTime<Utc>,
    ) -> ApprovalResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO approval_escalations (request_id, escalated_at, notified)
             VALUES (?1, ?2, ?3)",
            params![request_id, now.naive_utc(), serde_json::to_string(notified)?],
        )?;
        Ok(())
    }

    pub fn escalation_count(&self, request_id: &str) -> ApprovalResult<usize> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM approval_escalations WHERE request_id = ?1",
            [request_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn request_from_row(row: &Row<'_>) -> rusqlite::Result<ApprovalRequest> {
    let requested_at: NaiveDateTime = row.get("requested_at")?;
    let expires_at: NaiveDateTime = row.get("expires_at")?;
    let approvers_raw: String = row.get("approvers")?;
    let changes_raw: String = row.get("changes_json")?;
    Ok(ApprovalRequest {
        id: row.get("request_id")?,
        requested_by: row.get("requested_by")?,
        requested_at: Utc.from_utc_datetime(&requested_at),
        change_type: row.get("change_type")?,
        severity: row
            .get::<_, String>("severity")?
            .parse()
            .unwrap_or(ApprovalSeverity::Critical),
        approvers: serde_json::from_str(&approvers_raw).unwrap_or_default(),
        required_approvals: row.get::<_, i64>("required_approvals")? as u32,
        current_approvals: Vec::new(),
        status: row
            .get::<_, String>("status")?
            .parse()
            .unwrap_or(ApprovalStatus::Pending),
        expires_at: Utc.from_utc_datetime(&expires_at),
        escalation_after_hours: row.get("escalation_after_hours")?,
        estimated_impact: row.get("estimated_impact")?,
        changes: serde_json::from_str(&changes_raw).unwrap_or(
            crate::guardrail::PlannedChanges {
                product: String::new(),
                customer_id: None,
                mutations: Vec::new(),
                metadata: Default::default(),
            },
        ),
    })
}
