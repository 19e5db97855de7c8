use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Result, SagaId, SagaQuery, SagaState, SagaStatus, SagaStoreError, StepState, Version,
    store::{SagaStateStore, validate_state, validate_update},
};

const SAGA_COLUMNS: &str = "saga_id, saga_name, status, current_step_index, data, version, \
     created_at, updated_at, completed_at, correlation_id, tenant_id, last_error, retry_count, \
     next_retry_at";

const STEP_COLUMNS: &str = "saga_id, step_index, step_name, status, result_data, error_message, \
     started_at, completed_at, retry_count";

/// PostgreSQL-backed saga state store.
///
/// Sagas live in `saga_states`, their steps in `saga_steps`. An update is a
/// single transaction whose first statement is
/// `UPDATE saga_states ... WHERE saga_id = $1 AND version = $2`; when that
/// touches no row the transaction is rolled back and the update reported as
/// lost.
#[derive(Clone)]
pub struct PostgresSagaStateStore {
    pool: PgPool,
}

impl PostgresSagaStateStore {
    /// Creates a new PostgreSQL saga state store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to the database at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_saga(row: &PgRow) -> Result<SagaState> {
        let status: String = row.try_get("status")?;
        let current_step_index: i32 = row.try_get("current_step_index")?;
        let retry_count: i32 = row.try_get("retry_count")?;

        Ok(SagaState {
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_name: row.try_get("saga_name")?,
            status: status.parse()?,
            current_step_index: current_step_index as usize,
            data: row.try_get("data")?,
            steps: Vec::new(),
            version: Version::new(row.try_get("version")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            correlation_id: row.try_get("correlation_id")?,
            tenant_id: row.try_get("tenant_id")?,
            last_error: row.try_get("last_error")?,
            retry_count: retry_count as u32,
            next_retry_at: row.try_get("next_retry_at")?,
        })
    }

    fn row_to_step(row: &PgRow) -> Result<StepState> {
        let status: String = row.try_get("status")?;
        let step_index: i32 = row.try_get("step_index")?;
        let retry_count: i32 = row.try_get("retry_count")?;

        Ok(StepState {
            step_index: step_index as usize,
            step_name: row.try_get("step_name")?,
            status: status.parse()?,
            result_data: row.try_get("result_data")?,
            error_message: row.try_get("error_message")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            retry_count: retry_count as u32,
        })
    }

    async fn upsert_steps(tx: &mut Transaction<'_, Postgres>, state: &SagaState) -> Result<()> {
        for step in &state.steps {
            sqlx::query(
                r#"
                INSERT INTO saga_steps (saga_id, step_index, step_name, status, result_data,
                                        error_message, started_at, completed_at, retry_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (saga_id, step_index) DO UPDATE SET
                    step_name = EXCLUDED.step_name,
                    status = EXCLUDED.status,
                    result_data = EXCLUDED.result_data,
                    error_message = EXCLUDED.error_message,
                    started_at = EXCLUDED.started_at,
                    completed_at = EXCLUDED.completed_at,
                    retry_count = EXCLUDED.retry_count
                "#,
            )
            .bind(state.saga_id.as_uuid())
            .bind(step.step_index as i32)
            .bind(&step.step_name)
            .bind(step.status.as_str())
            .bind(&step.result_data)
            .bind(&step.error_message)
            .bind(step.started_at)
            .bind(step.completed_at)
            .bind(step.retry_count as i32)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Opens a read-only transaction whose statements all see one snapshot,
    /// so a saga row and its step rows are never read across a concurrent
    /// update.
    async fn begin_snapshot(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// Loads the steps of the given sagas, keyed by saga ID.
    async fn load_steps(
        tx: &mut Transaction<'_, Postgres>,
        saga_ids: &[Uuid],
    ) -> Result<HashMap<Uuid, Vec<StepState>>> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM saga_steps WHERE saga_id = ANY($1) \
             ORDER BY saga_id, step_index ASC"
        ))
        .bind(saga_ids)
        .fetch_all(&mut **tx)
        .await?;

        let mut steps: HashMap<Uuid, Vec<StepState>> = HashMap::new();
        for row in rows {
            let saga_id: Uuid = row.try_get("saga_id")?;
            steps
                .entry(saga_id)
                .or_default()
                .push(Self::row_to_step(&row)?);
        }
        Ok(steps)
    }
}

#[async_trait]
impl SagaStateStore for PostgresSagaStateStore {
    async fn create(&self, state: &SagaState) -> Result<()> {
        validate_state(state)?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO saga_states ({SAGA_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)"
        ))
        .bind(state.saga_id.as_uuid())
        .bind(&state.saga_name)
        .bind(state.status.as_str())
        .bind(state.current_step_index as i32)
        .bind(&state.data)
        .bind(state.version.as_i64())
        .bind(state.created_at)
        .bind(state.updated_at)
        .bind(state.completed_at)
        .bind(&state.correlation_id)
        .bind(&state.tenant_id)
        .bind(&state.last_error)
        .bind(state.retry_count as i32)
        .bind(state.next_retry_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("saga_states_pkey")
            {
                return SagaStoreError::AlreadyExists(state.saga_id);
            }
            SagaStoreError::Database(e)
        })?;

        Self::upsert_steps(&mut tx, state).await?;

        tx.commit().await?;
        tracing::debug!(saga_id = %state.saga_id, "saga created");
        Ok(())
    }

    async fn get(&self, saga_id: SagaId) -> Result<Option<SagaState>> {
        let mut tx = self.begin_snapshot().await?;

        let row: Option<PgRow> = sqlx::query(&format!(
            "SELECT {SAGA_COLUMNS} FROM saga_states WHERE saga_id = $1"
        ))
        .bind(saga_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.commit().await?;
            return Ok(None);
        };

        let mut state = Self::row_to_saga(&row)?;
        let mut steps = Self::load_steps(&mut tx, &[saga_id.as_uuid()]).await?;
        tx.commit().await?;

        state.steps = steps.remove(&saga_id.as_uuid()).unwrap_or_default();
        Ok(Some(state))
    }

    async fn try_update(&self, state: &SagaState, expected_version: Version) -> Result<bool> {
        validate_update(state, expected_version)?;

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE saga_states SET
                saga_name = $3,
                status = $4,
                current_step_index = $5,
                data = $6,
                version = $7,
                updated_at = $8,
                completed_at = $9,
                correlation_id = $10,
                tenant_id = $11,
                last_error = $12,
                retry_count = $13,
                next_retry_at = $14
            WHERE saga_id = $1 AND version = $2
            "#,
        )
        .bind(state.saga_id.as_uuid())
        .bind(expected_version.as_i64())
        .bind(&state.saga_name)
        .bind(state.status.as_str())
        .bind(state.current_step_index as i32)
        .bind(&state.data)
        .bind(state.version.as_i64())
        .bind(state.updated_at)
        .bind(state.completed_at)
        .bind(&state.correlation_id)
        .bind(&state.tenant_id)
        .bind(&state.last_error)
        .bind(state.retry_count as i32)
        .bind(state.next_retry_at)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            tracing::debug!(
                saga_id = %state.saga_id,
                expected = %expected_version,
                "saga update lost compare-and-swap"
            );
            return Ok(false);
        }

        Self::upsert_steps(&mut tx, state).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>, only_terminal: bool) -> Result<u64> {
        let terminal: Vec<String> = SagaStatus::TERMINAL
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let deleted = sqlx::query(
            r#"
            DELETE FROM saga_states
            WHERE updated_at < $1 AND ($2 = FALSE OR status = ANY($3))
            "#,
        )
        .bind(cutoff)
        .bind(only_terminal)
        .bind(terminal)
        .execute(&self.pool)
        .await?;

        Ok(deleted.rows_affected())
    }

    async fn query(&self, query: SagaQuery) -> Result<Vec<SagaState>> {
        let mut sql = format!("SELECT {SAGA_COLUMNS} FROM saga_states WHERE 1=1");
        let mut param_count = 0;

        // Build dynamic query
        if query.statuses.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND status = ANY(${param_count})"));
        }
        if query.saga_name.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND saga_name = ${param_count}"));
        }
        if query.correlation_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND correlation_id = ${param_count}"));
        }
        if query.tenant_id.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND tenant_id = ${param_count}"));
        }
        if query.due_before.is_some() {
            param_count += 1;
            sql.push_str(&format!(" AND next_retry_at <= ${param_count}"));
        }

        sql.push_str(" ORDER BY created_at ASC, saga_id ASC");

        if query.limit.is_some() {
            param_count += 1;
            sql.push_str(&format!(" LIMIT ${param_count}"));
        }

        let mut sqlx_query = sqlx::query(&sql);

        if let Some(statuses) = query.statuses {
            let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
            sqlx_query = sqlx_query.bind(statuses);
        }
        if let Some(saga_name) = query.saga_name {
            sqlx_query = sqlx_query.bind(saga_name);
        }
        if let Some(correlation_id) = query.correlation_id {
            sqlx_query = sqlx_query.bind(correlation_id);
        }
        if let Some(tenant_id) = query.tenant_id {
            sqlx_query = sqlx_query.bind(tenant_id);
        }
        if let Some(due_before) = query.due_before {
            sqlx_query = sqlx_query.bind(due_before);
        }
        if let Some(limit) = query.limit {
            sqlx_query = sqlx_query.bind(limit as i64);
        }

        let mut tx = self.begin_snapshot().await?;
        let rows = sqlx_query.fetch_all(&mut *tx).await?;
        let mut sagas = rows
            .iter()
            .map(Self::row_to_saga)
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<Uuid> = sagas.iter().map(|s| s.saga_id.as_uuid()).collect();
        let mut steps = Self::load_steps(&mut tx, &ids).await?;
        tx.commit().await?;

        for saga in &mut sagas {
            saga.steps = steps.remove(&saga.saga_id.as_uuid()).unwrap_or_default();
        }

        Ok(sagas)
    }
}
