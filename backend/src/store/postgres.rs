// Postgres persistence for pipeline records, history, rules and executions

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use funnel_shared::{HistoryEntry, PipelineRecord, Stage, TransitionKind};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{ExecutionFilter, ExecutionStore, PipelineStore, RuleStore, StoreError, StoreResult};
use crate::automation::{AutomationExecution, AutomationRule, RuleStats};

const RECORD_COLUMNS: &str = r#"
    id, lead_id, current_stage, stage_entered_at, closed_at, won, loss_reason,
    probability_percent, expected_close_date, last_activity_at, assigned_owner,
    created_at, updated_at
"#;

const HISTORY_COLUMNS: &str = r#"
    id, pipeline_id, lead_id, from_stage, to_stage, transition_kind,
    duration_in_prior_stage_days, actor, notes, created_at
"#;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn parse_stage(raw: &str) -> StoreResult<Stage> {
    raw.parse().map_err(|e| StoreError::Corrupt(format!("{}", e)))
}

fn record_from_row(row: &PgRow) -> StoreResult<PipelineRecord> {
    let stage: String = row.try_get("current_stage")?;
    let probability: i16 = row.try_get("probability_percent")?;

    Ok(PipelineRecord {
        id: row.try_get("id")?,
        lead_id: row.try_get("lead_id")?,
        current_stage: parse_stage(&stage)?,
        stage_entered_at: row.try_get("stage_entered_at")?,
        closed_at: row.try_get("closed_at")?,
        won: row.try_get("won")?,
        loss_reason: row.try_get("loss_reason")?,
        probability_percent: u8::try_from(probability)
            .map_err(|_| StoreError::Corrupt(format!("probability {} out of range", probability)))?,
        expected_close_date: row.try_get("expected_close_date")?,
        last_activity_at: row.try_get("last_activity_at")?,
        assigned_owner: row.try_get("assigned_owner")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn history_from_row(row: &PgRow) -> StoreResult<HistoryEntry> {
    let from_stage: Option<String> = row.try_get("from_stage")?;
    let to_stage: String = row.try_get("to_stage")?;
    let kind: String = row.try_get("transition_kind")?;

    Ok(HistoryEntry {
        id: row.try_get("id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        lead_id: row.try_get("lead_id")?,
        from_stage: from_stage.as_deref().map(parse_stage).transpose()?,
        to_stage: parse_stage(&to_stage)?,
        transition_kind: kind.parse::<TransitionKind>().map_err(StoreError::Corrupt)?,
        duration_in_prior_stage_days: row.try_get("duration_in_prior_stage_days")?,
        actor: row.try_get("actor")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn rule_from_row(row: &PgRow) -> StoreResult<AutomationRule> {
    let definition: serde_json::Value = row.try_get("definition")?;
    let mut rule: AutomationRule = serde_json::from_value(definition)?;
    let execution_count: i64 = row.try_get("execution_count")?;
    let success_count: i64 = row.try_get("success_count")?;
    let error_count: i64 = row.try_get("error_count")?;

    rule.is_active = row.try_get("is_active")?;
    rule.updated_at = row.try_get("updated_at")?;
    rule.stats = RuleStats {
        execution_count: execution_count.max(0) as u64,
        success_count: success_count.max(0) as u64,
        error_count: error_count.max(0) as u64,
        last_executed_at: row.try_get("last_executed_at")?,
    };
    Ok(rule)
}

fn execution_from_row(row: &PgRow) -> StoreResult<AutomationExecution> {
    let record: serde_json::Value = row.try_get("record")?;
    Ok(serde_json::from_value(record)?)
}

async fn insert_history<'e, E>(executor: E, entry: &HistoryEntry) -> StoreResult<()>
where
    E: sqlx::PgExecutor<'e>,
{
    sqlx::query(
        r#"
        INSERT INTO pipeline_history (
            id, pipeline_id, lead_id, from_stage, to_stage, transition_kind,
            duration_in_prior_stage_days, actor, notes, created_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(entry.id)
    .bind(entry.pipeline_id)
    .bind(entry.lead_id)
    .bind(entry.from_stage.map(|s| s.as_str()))
    .bind(entry.to_stage.as_str())
    .bind(entry.transition_kind.as_str())
    .bind(entry.duration_in_prior_stage_days)
    .bind(&entry.actor)
    .bind(&entry.notes)
    .bind(entry.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn find_record(&self, lead_id: Uuid) -> StoreResult<Option<PipelineRecord>> {
        let row = sqlx::query(&format!("SELECT {} FROM pipeline_records WHERE lead_id = $1", RECORD_COLUMNS))
            .bind(lead_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn create_record(
        &self,
        record: PipelineRecord,
        entry: HistoryEntry,
    ) -> StoreResult<(PipelineRecord, bool)> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO pipeline_records (
                id, lead_id, current_stage, stage_entered_at, closed_at, won, loss_reason,
                probability_percent, expected_close_date, last_activity_at, assigned_owner,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT (lead_id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.lead_id)
        .bind(record.current_stage.as_str())
        .bind(record.stage_entered_at)
        .bind(record.closed_at)
        .bind(record.won)
        .bind(&record.loss_reason)
        .bind(record.probability_percent as i16)
        .bind(record.expected_close_date)
        .bind(record.last_activity_at)
        .bind(&record.assigned_owner)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?
        .rows_affected()
            == 1;

        if !inserted {
            tx.rollback().await?;
            let existing = self
                .find_record(record.lead_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(format!("pipeline record for lead {}", record.lead_id)))?;
            return Ok((existing, false));
        }

        insert_history(&mut *tx, &entry).await?;
        tx.commit().await?;
        Ok((record, true))
    }

    async fn commit_transition(&self, record: &PipelineRecord, entry: &HistoryEntry) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE pipeline_records
            SET current_stage = $2, stage_entered_at = $3, closed_at = $4, won = $5,
                loss_reason = $6, probability_percent = $7, last_activity_at = $8,
                updated_at = $9
            WHERE lead_id = $1
            "#,
        )
        .bind(record.lead_id)
        .bind(record.current_stage.as_str())
        .bind(record.stage_entered_at)
        .bind(record.closed_at)
        .bind(record.won)
        .bind(&record.loss_reason)
        .bind(record.probability_percent as i16)
        .bind(record.last_activity_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() != 1 {
            tx.rollback().await?;
            return Err(StoreError::NotFound(format!("pipeline record for lead {}", record.lead_id)));
        }

        insert_history(&mut *tx, entry).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_record(&self, record: &PipelineRecord) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE pipeline_records
            SET expected_close_date = $2, last_activity_at = $3, assigned_owner = $4, updated_at = $5
            WHERE lead_id = $1
            "#,
        )
        .bind(record.lead_id)
        .bind(record.expected_close_date)
        .bind(record.last_activity_at)
        .bind(&record.assigned_owner)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("pipeline record for lead {}", record.lead_id)));
        }
        Ok(())
    }

    async fn find_in_stage(&self, stage: Stage) -> StoreResult<Vec<PipelineRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_records WHERE current_stage = $1 ORDER BY stage_entered_at",
            RECORD_COLUMNS
        ))
        .bind(stage.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn find_stale(&self, stage: Stage, entered_before: DateTime<Utc>) -> StoreResult<Vec<PipelineRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM pipeline_records
            WHERE current_stage = $1 AND stage_entered_at < $2
            ORDER BY stage_entered_at
            "#,
            RECORD_COLUMNS
        ))
        .bind(stage.as_str())
        .bind(entered_before)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn list_records(&self) -> StoreResult<Vec<PipelineRecord>> {
        let rows = sqlx::query(&format!("SELECT {} FROM pipeline_records ORDER BY created_at", RECORD_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn history(&self, lead_id: Uuid) -> StoreResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pipeline_history WHERE lead_id = $1 ORDER BY seq DESC",
            HISTORY_COLUMNS
        ))
        .bind(lead_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn all_history(&self) -> StoreResult<Vec<HistoryEntry>> {
        let rows = sqlx::query(&format!("SELECT {} FROM pipeline_history ORDER BY seq", HISTORY_COLUMNS))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(history_from_row).collect()
    }
}

#[async_trait]
impl RuleStore for PgStore {
    async fn save_rule(&self, rule: &AutomationRule) -> StoreResult<()> {
        let definition = serde_json::to_value(rule)?;
        sqlx::query(
            r#"
            INSERT INTO automation_rules (id, name, priority, is_active, definition, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, priority = EXCLUDED.priority, is_active = EXCLUDED.is_active,
                definition = EXCLUDED.definition, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(rule.is_active)
        .bind(definition)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_rule(&self, id: Uuid) -> StoreResult<Option<AutomationRule>> {
        let row = sqlx::query(
            r#"
            SELECT definition, is_active, execution_count, success_count, error_count, last_executed_at, updated_at
            FROM automation_rules WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn list_rules(&self) -> StoreResult<Vec<AutomationRule>> {
        let rows = sqlx::query(
            r#"
            SELECT definition, is_active, execution_count, success_count, error_count, last_executed_at, updated_at
            FROM automation_rules
            ORDER BY priority DESC, created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    async fn set_rule_active(
        &self,
        id: Uuid,
        active: bool,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<AutomationRule>> {
        let row = sqlx::query(
            r#"
            UPDATE automation_rules
            SET is_active = $2, updated_at = $3
            WHERE id = $1
            RETURNING definition, is_active, execution_count, success_count, error_count, last_executed_at, updated_at
            "#,
        )
        .bind(id)
        .bind(active)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(rule_from_row).transpose()
    }

    async fn record_outcome(&self, rule_id: Uuid, success: bool, at: DateTime<Utc>) -> StoreResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE automation_rules
            SET execution_count = execution_count + 1,
                success_count = success_count + CASE WHEN $2 THEN 1 ELSE 0 END,
                error_count = error_count + CASE WHEN $2 THEN 0 ELSE 1 END,
                last_executed_at = $3
            WHERE id = $1
            "#,
        )
        .bind(rule_id)
        .bind(success)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("rule {}", rule_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for PgStore {
    async fn save_execution(&self, execution: &AutomationExecution) -> StoreResult<()> {
        let record = serde_json::to_value(execution)?;
        let result = sqlx::query(
            r#"
            INSERT INTO automation_executions (id, rule_id, entity_id, status, triggered_at, completed_at, record)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status, completed_at = EXCLUDED.completed_at, record = EXCLUDED.record
            WHERE automation_executions.status NOT IN ('completed', 'failed', 'cancelled')
            "#,
        )
        .bind(execution.id)
        .bind(execution.rule_id)
        .bind(execution.entity_id)
        .bind(execution.status.as_str())
        .bind(execution.triggered_at)
        .bind(execution.completed_at)
        .bind(record)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WriteFailed(format!("execution {} is already terminal", execution.id)));
        }
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<AutomationExecution>> {
        let row = sqlx::query("SELECT record FROM automation_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(execution_from_row).transpose()
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> StoreResult<Vec<AutomationExecution>> {
        let rows = sqlx::query(
            r#"
            SELECT record FROM automation_executions
            WHERE ($1::uuid IS NULL OR rule_id = $1)
              AND ($2::uuid IS NULL OR entity_id = $2)
            ORDER BY triggered_at DESC
            LIMIT $3
            "#,
        )
        .bind(filter.rule_id)
        .bind(filter.entity_id)
        .bind(filter.limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(execution_from_row).collect()
    }

    async fn count_executions(
        &self,
        rule_id: Uuid,
        entity_id: Option<Uuid>,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM automation_executions
            WHERE rule_id = $1
              AND ($2::uuid IS NULL OR entity_id = $2)
              AND ($3::timestamptz IS NULL OR triggered_at >= $3)
            "#,
        )
        .bind(rule_id)
        .bind(entity_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn purge_executions(&self, completed_before: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM automation_executions
            WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < $1
            "#,
        )
        .bind(completed_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
