use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::sqlite::configure_connection;

use super::models::{
    Experiment, ExperimentStatus, ExperimentType, GuardConfig, MetricPoint, TargetMetric, Variant,
    VariantPayload,
};
use super::{ExperimentError, ExperimentResult};

const EXPERIMENT_SCHEMA: &str = include_str!("../../../sql/experiments.sql");

#[derive(Debug, Clone)]
pub struct SqliteExperimentStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
}

impl Default for SqliteExperimentStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
        }
    }
}

impl SqliteExperimentStoreBuilder {
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

    pub fn build(self) -> ExperimentResult<SqliteExperimentStore> {
        let path = self.path.ok_or(ExperimentError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteExperimentStore { path, flags })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRow {
    pub experiment_id: String,
    pub event: String,
    pub status_from: Option<String>,
    pub status_to: Option<String>,
    pub note: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConversionSummary {
    pub variant_id: String,
    pub conversions: u64,
    pub total_value: f64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct VariantTotals {
    pub variant_id: String,
    pub impressions: u64,
    pub clicks: u64,
    pub conversions: u64,
    pub cost: f64,
    pub conversion_value: f64,
}

#[derive(Debug, Clone)]
pub struct SqliteExperimentStore {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteExperimentStore {
    pub fn builder() -> SqliteExperimentStoreBuilder {
        SqliteExperimentStoreBuilder::new()
    }

    pub fn new(path: impl AsRef<Path>) -> ExperimentResult<Self> {
        SqliteExperimentStoreBuilder::new().path(path).build()
    }

    fn open(&self) -> ExperimentResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            ExperimentError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| ExperimentError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> ExperimentResult<()> {
        let conn = self.open()?;
        conn.execute_batch(EXPERIMENT_SCHEMA)?;
        Ok(())
    }

    pub fn insert_experiment(&self, experiment: &Experiment) -> ExperimentResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO experiments (
                experiment_id, experiment_type, product, target_id, status, target_metric,
                min_sample_size, confidence_level, start_at, end_at, winner_variant_id,
                created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                experiment.id,
                experiment.experiment_type.as_str(),
                experiment.product,
                experiment.target_id,
                experiment.status.as_str(),
                experiment.target_metric.as_str(),
                experiment.min_sample_size as i64,
                experiment.confidence_level,
                experiment.start_at.map(|dt| dt.naive_utc()),
                experiment.end_at.map(|dt| dt.naive_utc()),
                experiment.winner_variant_id,
                experiment.created_at.naive_utc(),
                experiment.updated_at.naive_utc(),
            ],
        )?;
        for variant in &experiment.variants {
            insert_variant(&tx, &experiment.id, variant)?;
        }
        tx.execute(
            "INSERT INTO experiment_guards (
                experiment_id, min_sample_size, min_duration_days, max_similarity,
                daily_spend_ceiling
            ) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                experiment.id,
                experiment.guards.min_sample_size as i64,
                experiment.guards.min_duration_days,
                experiment.guards.max_similarity,
                experiment.guards.daily_spend_ceiling,
            ],
        )?;
        tx.execute(
            "INSERT INTO experiment_audit (experiment_id, event, status_from, status_to, note, created_at)
             VALUES (?1, 'created', NULL, ?2, NULL, ?3)",
            params![
                experiment.id,
                experiment.status.as_str(),
                experiment.created_at.naive_utc()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn replace_variants(
        &self,
        experiment_id: &str,
        variants: &[Variant],
    ) -> ExperimentResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM experiment_variants WHERE experiment_id = ?1",
            [experiment_id],
        )?;
        for variant in variants {
            insert_variant(&tx, experiment_id, variant)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fetch(&self, experiment_id: &str) -> ExperimentResult<Option<Experiment>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare("SELECT * FROM experiments WHERE experiment_id = ?1")?;
        let Some(mut experiment) = stmt
            .query_row([experiment_id], |row| experiment_from_row(row))
            .optional()?
        else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT variant_id, name, is_control, weight, similarity_to_control, payload
             FROM experiment_variants WHERE experiment_id = ?1
             ORDER BY is_control DESC, variant_id ASC",
        )?;
        let variants = stmt
            .query_map([experiment_id], |row| {
                let payload_raw: String = row.get("payload")?;
                Ok((
                    Variant {
                        id: row.get("variant_id")?,
                        name: row.get("name")?,
                        is_control: row.get::<_, i64>("is_control")? != 0,
                        weight: row.get("weight")?,
                        similarity_to_control: row.get("similarity_to_control")?,
                        payload: VariantPayload::LandingPage {
                            content_path: String::new(),
                            routing_rules: Vec::new(),
                        },
                    },
                    payload_raw,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (mut variant, payload_raw) in variants {
            variant.payload = serde_json::from_str(&payload_raw)?;
            experiment.variants.push(variant);
        }

        let guards = conn
            .query_row(
                "SELECT min_sample_size, min_duration_days, max_similarity, daily_spend_ceiling
                 FROM experiment_guards WHERE experiment_id = ?1",
                [experiment_id],
                |row| {
                    Ok(GuardConfig {
                        min_sample_size: row.get::<_, i64>(0)? as u64,
                        min_duration_days: row.get(1)?,
                        max_similarity: row.get(2)?,
                        daily_spend_ceiling: row.get(3)?,
                    })
                },
            )
            .optional()?;
        if let Some(guards) = guards {
            experiment.guards = guards;
        }
        Ok(Some(experiment))
    }

    pub fn require(&self, experiment_id: &str) -> ExperimentResult<Experiment> {
        self.fetch(experiment_id)?
            .ok_or_else(|| ExperimentError::NotFound {
                experiment_id: experiment_id.to_string(),
            })
    }

    pub fn list(
        &self,
        status: Option<ExperimentStatus>,
        limit: usize,
    ) -> ExperimentResult<Vec<Experiment>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT experiment_id FROM experiments
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC, experiment_id ASC
             LIMIT ?2",
        )?;
        let ids = stmt
            .query_map(
                (status.as_ref().map(ExperimentStatus::as_str), limit as i64),
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);
        drop(conn);

        let mut experiments = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(experiment) = self.fetch(&id)? {
                experiments.push(experiment);
            }
        }
        Ok(experiments)
    }

    pub fn persist_transition(
        &self,
        experiment_id: &str,
        from: ExperimentStatus,
        to: ExperimentStatus,
        event: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> ExperimentResult<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let affected = tx.execute(
            "UPDATE experiments SET status = ?2, updated_at = ?3,
                 start_at = CASE WHEN ?4 = 'started' THEN ?3 ELSE start_at END,
                 end_at = CASE WHEN ?2 IN ('completed', 'aborted') THEN ?3 ELSE end_at END
             WHERE experiment_id = ?1 AND status = ?5",
            params![
                experiment_id,
                to.as_str(),
                now.naive_utc(),
                event,
                from.as_str()
            ],
        )?;
        if affected == 0 {
            return Err(ExperimentError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        tx.execute(
            "INSERT INTO experiment_audit (experiment_id, event, status_from, status_to, note, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                experiment_id,
                event,
                from.as_str(),
                to.as_str(),
                note,
                now.naive_utc()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_winner(
        &self,
        experiment_id: &str,
        winner_variant_id: &str,
    ) -> ExperimentResult<()> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE experiments SET winner_variant_id = ?2 WHERE experiment_id = ?1",
            params![experiment_id, winner_variant_id],
        )?;
        Ok(())
    }

    /// Idempotent per `(date, experiment, variant)`: recording the same
    /// day twice replaces the row rather than accumulating.
    pub fn upsert_metrics(&self, point: &MetricPoint) -> ExperimentResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO experiment_metrics (
                date, experiment_id, variant_id, impressions, clicks, cost, conversions,
                conversion_value, view_through_conversions
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(date, experiment_id, variant_id) DO UPDATE SET
                impressions = excluded.impressions,
                clicks = excluded.clicks,
                cost = excluded.cost,
                conversions = excluded.conversions,
                conversion_value = excluded.conversion_value,
                view_through_conversions = excluded.view_through_conversions",
            params![
                point.date.format("%Y-%m-%d").to_string(),
                point.experiment_id,
                point.variant_id,
                point.impressions as i64,
                point.clicks as i64,
                point.cost,
                point.conversions as i64,
                point.conversion_value,
                point.view_through_conversions as i64,
            ],
        )?;
        Ok(())
    }

    pub fn metrics_for(&self, experiment_id: &str) -> ExperimentResult<Vec<MetricPoint>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT date, experiment_id, variant_id, impressions, clicks, cost, conversions,
                    conversion_value, view_through_conversions
             FROM experiment_metrics
             WHERE experiment_id = ?1
             ORDER BY date ASC, variant_id ASC",
        )?;
        let rows = stmt
            .query_map([experiment_id], |row| {
                let date_raw: String = row.get("date")?;
                Ok((date_raw, metric_point_from_row(row)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut points = Vec::with_capacity(rows.len());
        for (date_raw, mut point) in rows {
            point.date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d").map_err(|err| {
                ExperimentError::Validation(format!("corrupt metric date {date_raw}: {err}"))
            })?;
            points.push(point);
        }
        Ok(points)
    }

    pub fn variant_totals(&self, experiment_id: &str) -> ExperimentResult<Vec<VariantTotals>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT variant_id, COALESCE(SUM(impressions), 0), COALESCE(SUM(clicks), 0),
                    COALESCE(SUM(conversions), 0), COALESCE(SUM(cost), 0),
                    COALESCE(SUM(conversion_value), 0)
             FROM experiment_metrics
             WHERE experiment_id = ?1
             GROUP BY variant_id
             ORDER BY variant_id ASC",
        )?;
        let totals = stmt
            .query_map([experiment_id], |row| {
                Ok(VariantTotals {
                    variant_id: row.get(0)?,
                    impressions: row.get::<_, i64>(1)? as u64,
                    clicks: row.get::<_, i64>(2)? as u64,
                    conversions: row.get::<_, i64>(3)? as u64,
                    cost: row.get(4)?,
                    conversion_value: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(totals)
    }

    /// Sticky unit-to-variant assignment. The first insert wins; later
    /// calls return the stored variant.
    pub fn insert_assignment(
        &self,
        experiment_id: &str,
        unit_id: &str,
        variant_id: &str,
        now: DateTime<Utc>,
    ) -> ExperimentResult<String> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR IGNORE INTO experiment_assignments
                 (experiment_id, unit_id, variant_id, assigned_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![experiment_id, unit_id, variant_id, now.naive_utc()],
        )?;
        let assigned: String = conn.query_row(
            "SELECT variant_id FROM experiment_assignments
             WHERE experiment_id = ?1 AND unit_id = ?2",
            params![experiment_id, unit_id],
            |row| row.get(0),
        )?;
        Ok(assigned)
    }

    pub fn fetch_assignment(
        &self,
        experiment_id: &str,
        unit_id: &str,
    ) -> ExperimentResult<Option<String>> {
        let conn = self.open()?;
        let assigned = conn
            .query_row(
                "SELECT variant_id FROM experiment_assignments
                 WHERE experiment_id = ?1 AND unit_id = ?2",
                params![experiment_id, unit_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(assigned)
    }

    pub fn record_conversion(
        &self,
        experiment_id: &str,
        unit_id: &str,
        variant_id: &str,
        value: f64,
        now: DateTime<Utc>,
    ) -> ExperimentResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO experiment_conversions
                 (experiment_id, unit_id, variant_id, value, converted_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![experiment_id, unit_id, variant_id, value, now.naive_utc()],
        )?;
        Ok(())
    }

    pub fn conversion_counts(
        &self,
        experiment_id: &str,
    ) -> ExperimentResult<Vec<ConversionSummary>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT variant_id, COUNT(*), COALESCE(SUM(value), 0)
             FROM experiment_conversions
             WHERE experiment_id = ?1
             GROUP BY variant_id
             ORDER BY variant_id ASC",
        )?;
        let rows = stmt
            .query_map([experiment_id], |row| {
                Ok(ConversionSummary {
                    variant_id: row.get(0)?,
                    conversions: row.get::<_, i64>(1)? as u64,
                    total_value: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn store_result(
        &self,
        experiment_id: &str,
        target_metric: TargetMetric,
        result_json: &str,
        now: DateTime<Utc>,
    ) -> ExperimentResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO experiment_results (experiment_id, analyzed_at, target_metric, result_json)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                experiment_id,
                now.naive_utc(),
                target_metric.as_str(),
                result_json
            ],
        )?;
        Ok(())
    }

    pub fn result_count(&self, experiment_id: &str) -> ExperimentResult<u32> {
        let conn = self.open()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM experiment_results WHERE experiment_id = ?1",
            [experiment_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Audit entry for a non-transition event (analysis, reallocation).
    pub fn append_event(
        &self,
        experiment_id: &str,
        event: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> ExperimentResult<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO experiment_audit (experiment_id, event, status_from, status_to, note, created_at)
             VALUES (?1, ?2, NULL, NULL, ?3, ?4)",
            params![experiment_id, event, note, now.naive_utc()],
        )?;
        Ok(())
    }

    pub fn latest_result(&self, experiment_id: &str) -> ExperimentResult<Option<String>> {
        let conn = self.open()?;
        let result = conn
            .query_row(
                "SELECT result_json FROM experiment_results
                 WHERE experiment_id = ?1
                 ORDER BY analyzed_at DESC, rowid DESC LIMIT 1",
                [experiment_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(result)
    }

    pub fn audit_log(&self, experiment_id: &str) -> ExperimentResult<Vec<AuditRow>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT experiment_id, event, status_from, status_to, note, created_at
             FROM experiment_audit
             WHERE experiment_id = ?1
             ORDER BY audit_id ASC",
        )?;
        let rows = stmt
            .query_map([experiment_id], |row| {
                let created_at: Option<NaiveDateTime> = row.get("created_at")?;
                Ok(AuditRow {
                    experiment_id: row.get("experiment_id")?,
                    event: row.get("event")?,
                    status_from: row.get("status_from")?,
                    status_to: row.get("status_to")?,
                    note: row.get("note")?,
                    created_at: created_at.map(|dt| Utc.from_utc_datetime(&dt)),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn insert_variant(
    conn: &Connection,
    experiment_id: &str,
    variant: &Variant,
) -> ExperimentResult<()> {
    conn.execute(
        "INSERT INTO experiment_variants (
            experiment_id, variant_id, name, is_control, weight, similarity_to_control, payload
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            experiment_id,
            variant.id,
            variant.name,
            if variant.is_control { 1 } else { 0 },
            variant.weight,
            variant.similarity_to_control,
            serde_json::to_string(&variant.payload)?,
        ],
    )?;
    Ok(())
}

fn experiment_from_row(row: &Row<'_>) -> rusqlite::Result<Experiment> {
    let start_at: Option<NaiveDateTime> = row.get("start_at")?;
    let end_at: Option<NaiveDateTime> = row.get("end_at")?;
    let created_at: NaiveDateTime = row.get("created_at")?;
    let updated_at: NaiveDateTime = row.get("updated_at")?;
    Ok(Experiment {
        id: row.get("experiment_id")?,
        experiment_type: row
            .get::<_, String>("experiment_type")?
            .parse()
            .unwrap_or(ExperimentType::Rsa),
        product: row.get("product")?,
        target_id: row.get("target_id")?,
        status: row
            .get::<_, String>("status")?
            .parse()
            .unwrap_or(ExperimentStatus::Draft),
        target_metric: row
            .get::<_, String>("target_metric")?
            .parse()
            .unwrap_or(TargetMetric::Ctr),
        variants: Vec::new(),
        min_sample_size: row.get::<_, i64>("min_sample_size")? as u64,
        confidence_level: row.get("confidence_level")?,
        guards: GuardConfig::default(),
        start_at: start_at.map(|dt| Utc.from_utc_datetime(&dt)),
        end_at: end_at.map(|dt| Utc.from_utc_datetime(&dt)),
        winner_variant_id: row.get("winner_variant_id")?,
        created_at: Utc.from_utc_datetime(&created_at),
        updated_at: Utc.from_utc_datetime(&updated_at),
    })
}

fn metric_point_from_row(row: &Row<'_>) -> rusqlite::Result<MetricPoint> {
    Ok(MetricPoint {
        experiment_id: row.get("experiment_id")?,
        variant_id: row.get("variant_id")?,
        date: NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default(),
        impressions: row.get::<_, i64>("impressions")? as u64,
        clicks: row.get::<_, i64>("clicks")? as u64,
        cost: row.get("cost")?,
        conversions: row.get::<_, i64>("conversions")? as u64,
        conversion_value: row.get("conversion_value")?,
        view_through_conversions: row.get::<_, i64>("view_through_conversions")? as u64,
    })
}
