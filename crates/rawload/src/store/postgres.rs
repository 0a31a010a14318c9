//! PostgreSQL destination

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder, Transaction};
use tracing::{debug, info, instrument, warn};

use super::{with_timeout, ClearStrategy, Destination, ReplaceTxn, SchemaPlan};
use crate::catalog::{ColumnType, DatasetDescriptor, MANAGED_TABLE_SUFFIX};
use crate::config::DatabaseConfig;
use crate::error::{Endpoint, LoadError, Result};
use crate::records::{Row, Value};

/// PostgreSQL limit on bind parameters per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

/// SQLSTATE 23503: foreign_key_violation
const SQLSTATE_FOREIGN_KEY_VIOLATION: &str = "23503";

/// Largest chunk whose insert stays under the bind parameter limit
pub fn clamp_chunk_size(requested: usize, columns: usize) -> usize {
    let ceiling = MAX_BIND_PARAMS / columns.max(1);
    requested.clamp(1, ceiling.max(1))
}

/// Destination backed by a PostgreSQL connection pool
#[derive(Debug, Clone)]
pub struct PgDestination {
    pool: PgPool,
    schema: String,
    timeout: Duration,
}

impl PgDestination {
    /// Connect using `config`, failing fast when the server is unreachable
    #[instrument(skip(config), fields(schema = %config.schema))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = config.connect_options()?;
        let pool = with_timeout(
            Endpoint::Database,
            "connect",
            config.connect_timeout,
            async {
                PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.connect_timeout)
                    .connect_with(options)
                    .await
                    .map_err(LoadError::from)
            },
        )
        .await?;

        info!(
            max_connections = config.max_connections,
            "Database connection pool created"
        );

        Ok(Self::from_pool(pool, config.schema.clone(), config.statement_timeout))
    }

    /// Wrap an existing pool (used by integration tests)
    pub fn from_pool(pool: PgPool, schema: impl Into<String>, timeout: Duration) -> Self {
        Self {
            pool,
            schema: schema.into(),
            timeout,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", self.schema, table)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM information_schema.tables
                WHERE table_schema = $1 AND table_name = $2
            )
            "#,
        )
        .bind(&self.schema)
        .bind(table)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl Destination for PgDestination {
    #[instrument(skip(self))]
    async fn server_version(&self) -> Result<String> {
        with_timeout(Endpoint::Database, "server version", self.timeout, async {
            let version: String = sqlx::query_scalar("SELECT version()")
                .fetch_one(&self.pool)
                .await?;
            Ok(version)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn managed_tables(&self) -> Result<BTreeSet<String>> {
        with_timeout(Endpoint::Database, "list managed tables", self.timeout, async {
            let pattern = format!("%{}", MANAGED_TABLE_SUFFIX.replace('_', "\\_"));
            let tables: Vec<String> = sqlx::query_scalar(
                r#"
                SELECT table_name::text
                FROM information_schema.tables
                WHERE table_schema = $1
                  AND table_type = 'BASE TABLE'
                  AND table_name LIKE $2
                ORDER BY table_name
                "#,
            )
            .bind(&self.schema)
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
            Ok(tables.into_iter().collect())
        })
        .await
    }

    #[instrument(skip(self))]
    async fn row_count(&self, table: &str) -> Result<Option<u64>> {
        with_timeout(Endpoint::Database, "row count", self.timeout, async {
            if !self.table_exists(table).await? {
                return Ok(None);
            }
            let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", self.qualified(table)))
                .fetch_one(&self.pool)
                .await?;
            Ok(Some(count.max(0) as u64))
        })
        .await
    }

    #[instrument(skip(self, plan), fields(recreate = plan.recreate, tables = plan.tables.len()))]
    async fn apply_schema(&self, plan: &SchemaPlan) -> Result<()> {
        with_timeout(Endpoint::Database, "apply schema", self.timeout, async {
            let mut tx = self.pool.begin().await?;
            for statement in &plan.statements {
                debug!(statement = %statement, "Executing DDL");
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, dataset), fields(table = %dataset.table))]
    async fn begin_replace(
        &self,
        dataset: &DatasetDescriptor,
        strategy: ClearStrategy,
    ) -> Result<Box<dyn ReplaceTxn>> {
        let table = self.qualified(&dataset.table);
        let clear = match strategy {
            ClearStrategy::Truncate => format!("TRUNCATE TABLE ONLY {}", table),
            ClearStrategy::Delete => format!("DELETE FROM {}", table),
        };

        let tx = with_timeout(Endpoint::Database, "clear table", self.timeout, async {
            let mut tx = self.pool.begin().await?;
            let cleared = sqlx::query(&clear).execute(&mut *tx).await?;
            debug!(rows = cleared.rows_affected(), ?strategy, "Cleared table");
            Ok(tx)
        })
        .await?;

        Ok(Box::new(PgReplaceTxn {
            tx,
            table,
            table_name: dataset.table.clone(),
            columns: dataset
                .columns
                .iter()
                .map(|c| (c.name.clone(), c.column_type))
                .collect(),
            timeout: self.timeout,
        }))
    }
}

/// Clear-and-insert transaction on one PostgreSQL table
pub struct PgReplaceTxn {
    tx: Transaction<'static, Postgres>,
    /// Schema-qualified table name
    table: String,
    table_name: String,
    columns: Vec<(String, ColumnType)>,
    timeout: Duration,
}

#[async_trait]
impl ReplaceTxn for PgReplaceTxn {
    async fn insert_chunk(&mut self, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut query_builder = build_insert(&self.table, &self.columns, rows);
        let tx = &mut self.tx;
        with_timeout(Endpoint::Database, "insert chunk", self.timeout, async move {
            let result = query_builder.build().execute(&mut **tx).await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let PgReplaceTxn {
            tx,
            table_name,
            timeout,
            ..
        } = *self;
        with_timeout(Endpoint::Database, "commit", timeout, async move {
            tx.commit().await.map_err(|e| commit_error(&table_name, e))
        })
        .await
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        let PgReplaceTxn { tx, timeout, .. } = *self;
        with_timeout(Endpoint::Database, "rollback", timeout, async move {
            tx.rollback().await?;
            Ok(())
        })
        .await
        .inspect_err(|e| warn!(error = %e, "Rollback failed"))
    }
}

/// Multi-row `INSERT ... ON CONFLICT DO NOTHING` with typed NULLs
fn build_insert(
    table: &str,
    columns: &[(String, ColumnType)],
    rows: &[Row],
) -> QueryBuilder<'static, Postgres> {
    let column_list = columns
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut query_builder: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {} ({}) ", table, column_list));

    query_builder.push_values(rows, |mut b, row| {
        for ((_, column_type), value) in columns.iter().zip(row) {
            match (value, column_type) {
                (Value::Text(v), _) => b.push_bind(v.clone()),
                (Value::Integer(v), _) => b.push_bind(*v),
                (Value::Float(v), _) => b.push_bind(*v),
                (Value::Timestamp(v), _) => b.push_bind(*v),
                (Value::Null, ColumnType::Text) => b.push_bind(None::<String>),
                (Value::Null, ColumnType::Integer) => b.push_bind(None::<i64>),
                (Value::Null, ColumnType::Float) => b.push_bind(None::<f64>),
                (Value::Null, ColumnType::Timestamp) => b.push_bind(None::<chrono::NaiveDateTime>),
            };
        }
    });

    query_builder.push(" ON CONFLICT DO NOTHING");
    query_builder
}

/// Deferred foreign keys fire at commit; surface them as a data error
fn commit_error(table: &str, err: sqlx::Error) -> LoadError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some(SQLSTATE_FOREIGN_KEY_VIOLATION) {
            return LoadError::ForeignKeyViolation {
                table: table.to_string(),
                detail: db_err.message().to_string(),
            };
        }
    }
    LoadError::from(err)
}
