use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;

use crate::sqlite::configure_connection;

use super::{GuardrailError, GuardrailResult};

const GUARDRAIL_SCHEMA: &str = include_str!("../../../sql/guardrails.sql");

#[derive(Debug, Clone)]
pub struct SqliteGuardrailStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteGuardrailStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteGuardrailStoreBuilder {
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

    pub fn build(self) -> GuardrailResult<SqliteGuardrailStore> {
        let path = self.path.ok_or(GuardrailError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteGuardrailStore { path, flags })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationRow {
    pub validation_id: i64,
    pub proposal_hash: String,
    pub passed: bool,
    pub violation_count: usize,
    pub can_override: bool,
    pub violations_json: String,
    pub proposal_json: String,
    pub created_at: Option<DateTime<Utc>>,
}

/// Append-only audit of guardrail validations, plus read access to the
/// collaborator tables (`keyword_quality_daily`, `landing_page_health`,
/// `claims_validations`) that reporting jobs outside the core maintain.
#[derive(Debug, Clone)]
pub struct SqliteGuardrailStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteGuardrailStore {
    pub fn builder() -> SqliteGuardrailStoreBuilder {
        SqliteGuardrailStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> GuardrailResult<Self> {
        SqliteGuardrailStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> GuardrailResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            GuardrailError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| GuardrailError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> GuardrailResult<()> {
        let conn = self.open()?;
        conn.execute_batch(GUARDRAIL_SCHEMA)?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append_validation(
        &self,
        proposal_hash: &str,
        passed: bool,
        violation_count: usize,
        can_override: bool,
        violations_json: &str,
        proposal_json: &str,
        now: DateTime<Utc>,
    ) -> GuardrailResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO guardrail_validations (
                proposal_hash, passed, violation_count, can_override, violations_json,
                proposal_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                proposal_hash,
                if passed { 1 } else { 0 },
                violation_count as i64,
                if can_override { 1 } else { 0 },
                violations_json,
                proposal_json,
                now.naive_utc(),
            ],
        )?;
        Ok(())
    }

    pub fn validations(&self, limit: usize) -> GuardrailResult<Vec<ValidationRow>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT validation_id, proposal_hash, passed, violation_count, can_override,
                    violations_json, proposal_json, created_at
             FROM guardrail_validations
             ORDER BY validation_id DESC
             LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                let created_at: Option<NaiveDateTime> = row.get("created_at")?;
                Ok(ValidationRow {
                    validation_id: row.get("validation_id")?,
                    proposal_hash: row.get("proposal_hash")?,
                    passed: row.get::<_, i64>("passed")? != 0,
                    violation_count: row.get::<_, i64>("violation_count")? as usize,
                    can_override: row.get::<_, i64>("can_override")? != 0,
                    violations_json: row.get("violations_json")?,
                    proposal_json: row.get("proposal_json")?,
                    created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn validation_count(&self) -> GuardrailResult<usize> {
        let conn = self.open()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM guardrail_validations", [], |row| {
                row.get(0)
            })?;
        Ok(count as usize)
    }

    /// 30-day impression-weighted quality score for one campaign.
    pub fn quality_score_30d(
        &self,
        campaign: &str,
        now: DateTime<Utc>,
    ) -> GuardrailResult<Option<f64>> {
        let conn = self.open()?;
        let since = (now - Duration::days(30)).format("%Y-%m-%d").to_string();
        let score: Option<f64> = conn
            .query_row(
                "SELECT SUM(quality_score * impressions) / SUM(impressions)
                 FROM keyword_quality_daily
                 WHERE campaign = ?1 AND day >= ?2 AND impressions > 0",
                params![campaign, since],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(score)
    }

    /// Worst landing-page health observed for one campaign.
    pub fn worst_landing_page_health(&self, campaign: &str) -> GuardrailResult<Option<f64>> {
        let conn = self.open()?;
        let health: Option<f64> = conn
            .query_row(
                "SELECT MIN(health_score) FROM landing_page_health WHERE campaign = ?1",
                params![campaign],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(health)
    }

    pub fn claims_validated_at(
        &self,
        campaign: &str,
    ) -> GuardrailResult<Option<DateTime<Utc>>> {
        let conn = self.open()?;
        let validated_at: Option<NaiveDateTime> = conn
            .query_row(
                "SELECT validated_at FROM claims_validations WHERE campaign = ?1",
                params![campaign],
                |row| row.get(0),
            )
            .optional()?;
        Ok(validated_at.map(|dt| Utc.from_utc_datetime(&dt)))
    }
}
