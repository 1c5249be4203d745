//! PostgreSQL schema backend.
//!
//! Each step runs in one database transaction together with its ledger row.
//! The schema-modification lock is a session-level advisory lock held on a
//! dedicated pooled connection for the duration of the batch.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use serde_json::Value;
use sqlx::{Postgres, Transaction};
use tracing::debug;

use evolve_core::config::DatabaseConfig;
use evolve_core::error::{EvolveError, OperationError, Result};
use evolve_core::migration::{AppliedStep, StepFailure, StepKey};
use evolve_core::schema::{
    quote_ident, sql_literal, FieldSpec, FieldType, ModelRef, NamedField, ReferentialAction,
    SqlType,
};

use super::backend::{OpFailure, OpResult, SchemaBackend, SchemaTransaction};
use super::conversion::ConversionRegistry;

/// Lock ID for migration advisory lock (arbitrary but consistent).
const MIGRATION_LOCK_ID: i64 = 0x65766f6c7665;

/// How often a waiting writer retries the advisory lock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(250);

const LEDGER_TABLE: &str = "evolve_migrations";
const FAILURE_TABLE: &str = "evolve_migration_failures";

/// Schema backend over a PostgreSQL connection pool.
pub struct PgBackend {
    pool: PgPool,
    lock_conn: Mutex<Option<PoolConnection<Postgres>>>,
    statement_timeout_secs: u64,
}

impl PgBackend {
    /// Connect using the `[database]` configuration and make sure the ledger exists.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size)
            .acquire_timeout(Duration::from_secs(config.pool_timeout_secs))
            .connect(&config.url)
            .await
            .map_err(|e| {
                EvolveError::StorageUnavailable(format!("Failed to connect to database: {}", e))
            })?;

        let backend = Self::new(pool).with_statement_timeout(config.statement_timeout_secs);
        backend.ensure_ledger().await?;
        Ok(backend)
    }

    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_conn: Mutex::new(None),
            statement_timeout_secs: 0,
        }
    }

    /// Per-statement timeout inside step transactions; 0 disables it.
    pub fn with_statement_timeout(mut self, secs: u64) -> Self {
        self.statement_timeout_secs = secs;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the ledger tables if they do not exist.
    pub async fn ensure_ledger(&self) -> Result<()> {
        for statement in ledger_ddl() {
            sqlx::query(&statement)
                .execute(&self.pool)
                .await
                .map_err(storage_error)?;
        }
        Ok(())
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<PoolConnection<Postgres>>> {
        self.lock_conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl SchemaBackend for PgBackend {
    async fn acquire_lock(&self) -> Result<()> {
        debug!("Acquiring migration lock...");
        let mut conn = self.pool.acquire().await.map_err(storage_error)?;
        // The session owns the advisory lock: never hand it back to the pool,
        // so a cancelled wait or failed unlock ends the session and the lock.
        conn.close_on_drop();
        loop {
            let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(MIGRATION_LOCK_ID)
                .fetch_one(&mut *conn)
                .await
                .map_err(storage_error)?;
            if acquired {
                break;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }

        *self.lock_slot() = Some(conn);
        debug!("Migration lock acquired");
        Ok(())
    }

    async fn release_lock(&self) -> Result<()> {
        let taken = self.lock_slot().take();
        let mut conn = taken.ok_or_else(|| {
            EvolveError::InvalidState("migration lock is not held".to_string())
        })?;
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(MIGRATION_LOCK_ID)
            .fetch_one(&mut *conn)
            .await;
        let released = match released {
            Ok(released) => released,
            Err(e) => {
                if let Err(close_err) = conn.close().await {
                    debug!("Closing lock connection failed: {}", close_err);
                }
                return Err(storage_error(e));
            }
        };
        if !released {
            return Err(EvolveError::InvalidState(
                "advisory lock was not held by this session".to_string(),
            ));
        }
        debug!("Migration lock released");
        Ok(())
    }

    async fn applied_steps(&self) -> Result<Vec<AppliedStep>> {
        let rows: Vec<(String, String, DateTime<Utc>, Option<String>, Option<i64>)> =
            sqlx::query_as(&format!(
                "SELECT schema_name, step_id, applied_at, checksum, execution_time_ms \
                 FROM {} ORDER BY applied_at, id",
                LEDGER_TABLE
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(
                |(schema, step_id, applied_at, checksum, execution_time_ms)| AppliedStep {
                    key: StepKey::new(schema, step_id),
                    applied_at,
                    checksum,
                    execution_time_ms,
                },
            )
            .collect())
    }

    async fn failures(&self) -> Result<Vec<StepFailure>> {
        let rows: Vec<(String, String, String, DateTime<Utc>)> = sqlx::query_as(&format!(
            "SELECT schema_name, step_id, error, failed_at FROM {} ORDER BY failed_at",
            FAILURE_TABLE
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(rows
            .into_iter()
            .map(|(schema, step_id, error, failed_at)| StepFailure {
                key: StepKey::new(schema, step_id),
                error,
                failed_at,
            })
            .collect())
    }

    async fn record_failure(&self, key: &StepKey, error: &str) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (schema_name, step_id, error, failed_at) VALUES ($1, $2, $3, NOW()) \
             ON CONFLICT (schema_name, step_id) \
             DO UPDATE SET error = EXCLUDED.error, failed_at = EXCLUDED.failed_at",
            FAILURE_TABLE
        ))
        .bind(&key.schema)
        .bind(&key.step_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn begin(&self) -> Result<Box<dyn SchemaTransaction + '_>> {
        let mut tx = self.pool.begin().await.map_err(storage_error)?;
        if self.statement_timeout_secs > 0 {
            sqlx::query(&format!(
                "SET LOCAL statement_timeout = '{}s'",
                self.statement_timeout_secs
            ))
            .execute(&mut *tx)
            .await
            .map_err(storage_error)?;
        }
        Ok(Box::new(PgTransaction { tx }))
    }
}

/// Foreign key currently attached to a column.
#[derive(Debug, Clone, PartialEq)]
struct ForeignKey {
    constraint: String,
    target_table: String,
    update_rule: String,
}

struct PgTransaction {
    tx: Transaction<'static, Postgres>,
}

impl PgTransaction {
    async fn execute(&mut self, sql: &str, model: &ModelRef, field: &str) -> OpResult {
        debug!("{}", sql);
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| op_error(e, model, field))?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &str) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1)",
        )
        .bind(table)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage_error)
    }

    /// `Some(is_nullable)` when the column exists.
    async fn column_nullable(&mut self, table: &str, column: &str) -> Result<Option<bool>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT is_nullable FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2",
        )
        .bind(table)
        .bind(column)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?;
        Ok(row.map(|(nullable,)| nullable == "YES"))
    }

    async fn foreign_key(&mut self, table: &str, column: &str) -> Result<Option<ForeignKey>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT tc.constraint_name, ccu.table_name, rc.update_rule \
             FROM information_schema.table_constraints tc \
             JOIN information_schema.key_column_usage kcu \
               ON kcu.constraint_name = tc.constraint_name AND kcu.table_schema = tc.table_schema \
             JOIN information_schema.constraint_column_usage ccu \
               ON ccu.constraint_name = tc.constraint_name AND ccu.table_schema = tc.table_schema \
             JOIN information_schema.referential_constraints rc \
               ON rc.constraint_name = tc.constraint_name AND rc.constraint_schema = tc.table_schema \
             WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = current_schema() \
               AND tc.table_name = $1 AND kcu.column_name = $2",
        )
        .bind(table)
        .bind(column)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(storage_error)?;
        Ok(row.map(|(constraint, target_table, update_rule)| ForeignKey {
            constraint,
            target_table,
            update_rule,
        }))
    }

    async fn column_data_type(&mut self, table: &str, column: &str) -> Result<String> {
        sqlx::query_scalar(
            "SELECT data_type FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2",
        )
        .bind(table)
        .bind(column)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage_error)
    }

    async fn has_values(&mut self, table: &str, column: &str) -> Result<bool> {
        sqlx::query_scalar(&format!(
            "SELECT EXISTS (SELECT 1 FROM {} WHERE {} IS NOT NULL)",
            quote_ident(table),
            quote_ident(column)
        ))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(storage_error)
    }

    /// Rebuild `column` as the new type, passing every value through the
    /// registered `from -> field` conversion.
    ///
    /// Values go into a fresh column addressed by `ctid`; adding a column
    /// without a default does not rewrite the table, so the ids stay valid.
    async fn convert_rows(
        &mut self,
        model: &ModelRef,
        table: &str,
        column: &str,
        from: FieldType,
        field: &FieldSpec,
        conversions: &ConversionRegistry,
    ) -> OpResult {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(&format!(
            "SELECT ctid::text, to_jsonb({})::text FROM {}",
            quote_ident(column),
            quote_ident(table)
        ))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(storage_error)?;

        let old = FieldSpec::new(from).nullable();
        let mut converted = Vec::with_capacity(rows.len());
        for (i, (rid, raw)) in rows.into_iter().enumerate() {
            let value = match raw {
                Some(raw) => serde_json::from_str(&raw).map_err(EvolveError::from)?,
                None => Value::Null,
            };
            let value = conversions
                .coerce(&old, field, value)
                .map_err(|reason| OperationError::IncompatibleAlteration {
                    model: model.to_string(),
                    field: column.to_string(),
                    reason: format!("row {}: {}", i, reason),
                })?;
            converted.push((rid, bind_text(&value, &field.sql_type())));
        }

        let scratch = format!("{}__evolve", column);
        let cast = field.sql_type().to_cast_sql();
        self.execute(
            &format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                quote_ident(table),
                quote_ident(&scratch),
                cast
            ),
            model,
            column,
        )
        .await?;

        let update = format!(
            "UPDATE {} SET {} = CAST($1 AS {}) WHERE ctid = CAST($2 AS tid)",
            quote_ident(table),
            quote_ident(&scratch),
            cast
        );
        for (rid, text) in converted {
            sqlx::query(&update)
                .bind(text)
                .bind(rid)
                .execute(&mut *self.tx)
                .await
                .map_err(|e| op_error(e, model, column))?;
        }

        for sql in [
            format!(
                "ALTER TABLE {} DROP COLUMN {}",
                quote_ident(table),
                quote_ident(column)
            ),
            format!(
                "ALTER TABLE {} RENAME COLUMN {} TO {}",
                quote_ident(table),
                quote_ident(&scratch),
                quote_ident(column)
            ),
        ] {
            self.execute(&sql, model, column).await?;
        }
        Ok(())
    }

    async fn require_table(&mut self, model: &ModelRef) -> std::result::Result<String, OpFailure> {
        let table = model.table_name();
        if !self.table_exists(&table).await? {
            return Err(OperationError::MissingModel {
                model: model.to_string(),
            }
            .into());
        }
        Ok(table)
    }

    async fn require_column(&mut self, model: &ModelRef, name: &str) -> std::result::Result<(String, bool), OpFailure> {
        let table = self.require_table(model).await?;
        match self.column_nullable(&table, name).await? {
            Some(nullable) => Ok((table, nullable)),
            None => Err(OperationError::MissingField {
                model: model.to_string(),
                field: name.to_string(),
            }
            .into()),
        }
    }

    async fn check_target(&mut self, model: &ModelRef, name: &str, field: &FieldSpec) -> OpResult {
        if let Some(reference) = &field.reference {
            if &reference.to != model && !self.table_exists(&reference.to.table_name()).await? {
                return Err(OperationError::UnknownTarget {
                    model: model.to_string(),
                    field: name.to_string(),
                    target: reference.to.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SchemaTransaction for PgTransaction {
    async fn create_model(&mut self, model: &ModelRef, fields: &[NamedField]) -> OpResult {
        if self.table_exists(&model.table_name()).await? {
            return Err(OperationError::DuplicateModel {
                model: model.to_string(),
            }
            .into());
        }
        for f in fields {
            self.check_target(model, &f.name, &f.field).await?;
        }
        self.execute(&create_table_sql(model, fields), model, "").await
    }

    async fn delete_model(&mut self, model: &ModelRef) -> OpResult {
        let table = self.require_table(model).await?;
        self.execute(&format!("DROP TABLE {}", quote_ident(&table)), model, "")
            .await
    }

    async fn add_column(&mut self, model: &ModelRef, name: &str, field: &FieldSpec) -> OpResult {
        let table = self.require_table(model).await?;
        if self.column_nullable(&table, name).await?.is_some() {
            return Err(OperationError::DuplicateField {
                model: model.to_string(),
                field: name.to_string(),
            }
            .into());
        }
        self.check_target(model, name, field).await?;
        self.execute(&add_column_sql(model, name, field), model, name)
            .await
    }

    async fn drop_column(&mut self, model: &ModelRef, name: &str) -> OpResult {
        let (table, _) = self.require_column(model, name).await?;
        let sql = format!(
            "ALTER TABLE {} DROP COLUMN {}",
            quote_ident(&table),
            quote_ident(name)
        );
        self.execute(&sql, model, name).await
    }

    async fn rename_column(
        &mut self,
        model: &ModelRef,
        old_name: &str,
        new_name: &str,
    ) -> OpResult {
        let (table, _) = self.require_column(model, old_name).await?;
        if self.column_nullable(&table, new_name).await?.is_some() {
            return Err(OperationError::DuplicateField {
                model: model.to_string(),
                field: new_name.to_string(),
            }
            .into());
        }
        let sql = format!(
            "ALTER TABLE {} RENAME COLUMN {} TO {}",
            quote_ident(&table),
            quote_ident(old_name),
            quote_ident(new_name)
        );
        self.execute(&sql, model, old_name).await
    }

    async fn alter_column(
        &mut self,
        model: &ModelRef,
        name: &str,
        field: &FieldSpec,
        conversions: &ConversionRegistry,
    ) -> OpResult {
        let (table, _) = self.require_column(model, name).await?;
        self.check_target(model, name, field).await?;

        let data_type = self.column_data_type(&table, name).await?;
        let target = field.sql_type();
        let mut existing = self.foreign_key(&table, name).await?;

        if let Some(from) = conversions.custom_for_column(&data_type, field.field_type) {
            debug!(
                "Converting {}.{} row by row ({:?} -> {:?})",
                model, name, from, field.field_type
            );
            self.convert_rows(model, &table, name, from, field, conversions)
                .await?;
            // The column was rebuilt, taking its constraints with it.
            existing = None;
        } else if data_type != target.data_type_name() {
            if !conversions.has_column_conversion(&data_type, field.field_type)
                && self.has_values(&table, name).await?
            {
                return Err(OperationError::IncompatibleAlteration {
                    model: model.to_string(),
                    field: name.to_string(),
                    reason: format!("no conversion from {} to {}", data_type, target.to_sql()),
                }
                .into());
            }
        }

        for sql in alter_column_sql(
            model,
            name,
            field,
            conversions.truncates(),
            existing.as_ref().map(|fk| fk.constraint.as_str()),
        ) {
            self.execute(&sql, model, name).await?;
        }
        Ok(())
    }

    async fn alter_reference(
        &mut self,
        model: &ModelRef,
        name: &str,
        on_delete: ReferentialAction,
        on_update: Option<ReferentialAction>,
    ) -> OpResult {
        let (table, nullable) = self.require_column(model, name).await?;
        let fk = self.foreign_key(&table, name).await?.ok_or_else(|| {
            OperationError::IncompatibleAlteration {
                model: model.to_string(),
                field: name.to_string(),
                reason: "field is not a reference".to_string(),
            }
        })?;
        if !self.table_exists(&fk.target_table).await? {
            return Err(OperationError::UnknownTarget {
                model: model.to_string(),
                field: name.to_string(),
                target: fk.target_table,
            }
            .into());
        }
        if on_delete == ReferentialAction::SetNull && !nullable {
            return Err(OperationError::IncompatibleAlteration {
                model: model.to_string(),
                field: name.to_string(),
                reason: "SET NULL requires a nullable field".to_string(),
            }
            .into());
        }

        let on_update_sql = match on_update {
            Some(action) => action.to_sql().to_string(),
            None => fk.update_rule.clone(),
        };
        let sql = replace_reference_sql(&table, name, &fk, on_delete.to_sql(), &on_update_sql);
        self.execute(&sql, model, name).await
    }

    async fn record_applied(&mut self, applied: &AppliedStep) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO {} (schema_name, step_id, applied_at, checksum, execution_time_ms) \
             VALUES ($1, $2, $3, $4, $5)",
            LEDGER_TABLE
        ))
        .bind(&applied.key.schema)
        .bind(&applied.key.step_id)
        .bind(applied.applied_at)
        .bind(&applied.checksum)
        .bind(applied.execution_time_ms)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e.as_database_error().and_then(|db| db.code()) {
            Some(code) if code == "23505" => EvolveError::InvalidState(format!(
                "step {} is already recorded as applied",
                applied.key
            )),
            _ => storage_error(e),
        })?;

        sqlx::query(&format!(
            "DELETE FROM {} WHERE schema_name = $1 AND step_id = $2",
            FAILURE_TABLE
        ))
        .bind(&applied.key.schema)
        .bind(&applied.key.step_id)
        .execute(&mut *self.tx)
        .await
        .map_err(storage_error)?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(storage_error)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(storage_error)
    }
}

fn ledger_ddl() -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
    id SERIAL PRIMARY KEY,
    schema_name VARCHAR(255) NOT NULL,
    step_id VARCHAR(255) NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    checksum VARCHAR(64),
    execution_time_ms BIGINT,
    UNIQUE (schema_name, step_id)
)"#,
            LEDGER_TABLE
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
    schema_name VARCHAR(255) NOT NULL,
    step_id VARCHAR(255) NOT NULL,
    error TEXT NOT NULL,
    failed_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (schema_name, step_id)
)"#,
            FAILURE_TABLE
        ),
    ]
}

fn create_table_sql(model: &ModelRef, fields: &[NamedField]) -> String {
    let columns: Vec<String> = fields
        .iter()
        .map(|f| format!("    {}", f.field.to_sql_column(&f.name)))
        .collect();
    format!(
        "CREATE TABLE {} (\n{}\n)",
        quote_ident(&model.table_name()),
        columns.join(",\n")
    )
}

fn add_column_sql(model: &ModelRef, name: &str, field: &FieldSpec) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(&model.table_name()),
        field.to_sql_column(name)
    )
}

/// Statements that bring an existing column in line with `field`.
///
/// NULLs are filled from the new default before `NOT NULL` is set, and string
/// columns are cut to the new length when `truncate` is set.
fn alter_column_sql(
    model: &ModelRef,
    name: &str,
    field: &FieldSpec,
    truncate: bool,
    existing_fk: Option<&str>,
) -> Vec<String> {
    let table = quote_ident(&model.table_name());
    let column = quote_ident(name);
    let sql_type = field.sql_type();
    let mut statements = Vec::new();

    let check = quote_ident(&format!("{}_{}_check", model.table_name(), name));

    if let Some(constraint) = existing_fk {
        statements.push(format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            table,
            quote_ident(constraint)
        ));
    }
    statements.push(format!(
        "ALTER TABLE {} DROP CONSTRAINT IF EXISTS {}",
        table, check
    ));

    let using = match (&sql_type, truncate) {
        (SqlType::Varchar(Some(len)), true) => format!("LEFT({}::text, {})", column, len),
        (SqlType::Jsonb, _) => format!("to_jsonb({})", column),
        _ => format!("{}::{}", column, sql_type.to_cast_sql()),
    };
    statements.push(format!(
        "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}",
        table,
        column,
        sql_type.to_cast_sql(),
        using
    ));

    match &field.default {
        Some(default) => {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} SET DEFAULT {}",
                table,
                column,
                sql_literal(default)
            ));
            if !field.nullable {
                statements.push(format!(
                    "UPDATE {} SET {} = {} WHERE {} IS NULL",
                    table,
                    column,
                    sql_literal(default),
                    column
                ));
            }
        }
        None if field.field_type != FieldType::Auto => {
            statements.push(format!(
                "ALTER TABLE {} ALTER COLUMN {} DROP DEFAULT",
                table, column
            ));
        }
        None => {}
    }

    if field.nullable {
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL",
            table, column
        ));
    } else {
        statements.push(format!(
            "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL",
            table, column
        ));
    }

    if field.field_type == FieldType::PositiveInteger {
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} CHECK ({} >= 0)",
            table, check, column
        ));
    }

    if let Some(reference) = &field.reference {
        statements.push(format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) {}",
            table,
            quote_ident(&format!("{}_{}_fkey", model.table_name(), name)),
            column,
            reference.to_sql()
        ));
    }

    statements
}

/// Text form of a converted value for `CAST($1 AS <type>)`.
fn bind_text(value: &Value, sql_type: &SqlType) -> Option<String> {
    match (value, sql_type) {
        (Value::Null, _) => None,
        (other, SqlType::Jsonb) => Some(other.to_string()),
        (Value::String(s), _) => Some(s.clone()),
        (other, _) => Some(other.to_string()),
    }
}

fn replace_reference_sql(
    table: &str,
    column: &str,
    fk: &ForeignKey,
    on_delete: &str,
    on_update: &str,
) -> String {
    format!(
        "ALTER TABLE {table} DROP CONSTRAINT {constraint}, \
         ADD CONSTRAINT {constraint} FOREIGN KEY ({column}) \
         REFERENCES {target} (id) ON DELETE {on_delete} ON UPDATE {on_update}",
        table = quote_ident(table),
        constraint = quote_ident(&fk.constraint),
        column = quote_ident(column),
        target = quote_ident(&fk.target_table),
        on_delete = on_delete,
        on_update = on_update,
    )
}

/// Classify a driver error outside of any operation.
fn storage_error(e: sqlx::Error) -> EvolveError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => EvolveError::StorageUnavailable(e.to_string()),
        other => EvolveError::Sql(other),
    }
}

/// SQLSTATE codes that mean the data or schema does not admit the change.
const INCOMPATIBLE_CODES: &[&str] = &[
    "22001", // string_data_right_truncation
    "22003", // numeric_value_out_of_range
    "22P02", // invalid_text_representation
    "23502", // not_null_violation
    "23503", // foreign_key_violation
    "23505", // unique_violation
    "23514", // check_violation
    "22007", // invalid_datetime_format
    "22008", // datetime_field_overflow
    "2BP01", // dependent_objects_still_exist
    "42710", // duplicate_object
    "42804", // datatype_mismatch
    "42846", // cannot_coerce
];

fn op_error(e: sqlx::Error, model: &ModelRef, field: &str) -> OpFailure {
    let reason = e.as_database_error().and_then(|db| {
        let code = db.code()?;
        INCOMPATIBLE_CODES
            .iter()
            .any(|c| *c == code)
            .then(|| db.message().to_string())
    });
    match reason {
        Some(reason) => OperationError::IncompatibleAlteration {
            model: model.to_string(),
            field: field.to_string(),
            reason,
        }
        .into(),
        None => storage_error(e).into(),
    }
}
