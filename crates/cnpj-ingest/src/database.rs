//! PostgreSQL target store
//!
//! Pool creation, table and index DDL, and [`PgLoader`], the [`TableSink`]
//! that appends batches with multi-row `INSERT` statements.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::loader::TableSink;
use crate::schema::{Row, Schema};

/// PostgreSQL accepts at most this many bind parameters per statement
pub const MAX_BIND_PARAMS: usize = 65_535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/cnpj".to_string(),
            max_connections: 4,
            connect_timeout_secs: 30,
        }
    }
}

/// Connect a pool and check it with a round trip
///
/// Failing here is fatal for the run.
pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    info!(
        max_connections = config.max_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

pub fn drop_table_sql(schema: &Schema) -> String {
    format!("DROP TABLE IF EXISTS {}", schema.table)
}

/// `CREATE TABLE` with every column as nullable `TEXT`
pub fn create_table_sql(schema: &Schema) -> String {
    let columns = schema
        .column_names()
        .map(|name| format!("{} TEXT", name))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CREATE TABLE {} ({})", schema.table, columns)
}

/// Lookup index on `cnpj_basico`, for tables that have the key
pub fn create_index_sql(schema: &Schema) -> Option<String> {
    schema.key_column().map(|key| {
        format!(
            "CREATE INDEX IF NOT EXISTS {table}_cnpj ON {table}({key})",
            table = schema.table,
            key = key
        )
    })
}

/// Rows per `INSERT` statement for a table of `columns` columns
///
/// The configured size is capped so one statement stays within
/// [`MAX_BIND_PARAMS`]; the result is always at least 1.
pub fn rows_per_statement(columns: usize, configured: usize) -> usize {
    let cap = MAX_BIND_PARAMS / columns.max(1);
    configured.min(cap).max(1)
}

/// [`TableSink`] writing to PostgreSQL
#[derive(Clone)]
pub struct PgLoader {
    pool: PgPool,
    insert_batch_size: usize,
}

impl PgLoader {
    pub fn new(pool: PgPool, insert_batch_size: usize) -> Self {
        Self {
            pool,
            insert_batch_size,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TableSink for PgLoader {
    async fn recreate_table(&self, schema: &'static Schema) -> Result<()> {
        let prepare = async {
            let mut tx = self.pool.begin().await?;
            sqlx::query(&drop_table_sql(schema)).execute(&mut *tx).await?;
            sqlx::query(&create_table_sql(schema)).execute(&mut *tx).await?;
            tx.commit().await?;
            Ok::<_, sqlx::Error>(())
        };

        prepare
            .await
            .map_err(|source| IngestError::TablePreparation {
                record_type: schema.record_type,
                source,
            })?;

        info!(table = schema.table, columns = schema.column_count(), "Table recreated");
        Ok(())
    }

    /// All statements of one call share a transaction
    async fn append(&self, schema: &'static Schema, rows: &[Row]) -> Result<u64> {
        let per_statement = rows_per_statement(schema.column_count(), self.insert_batch_size);
        let columns = schema.column_names().collect::<Vec<_>>().join(", ");

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;

        for chunk in rows.chunks(per_statement) {
            let mut query_builder: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", schema.table, columns));

            query_builder.push_values(chunk, |mut b, row| {
                for value in row.values() {
                    b.push_bind(value.as_deref());
                }
            });

            let result = query_builder.build().execute(&mut *tx).await?;
            written += result.rows_affected();
        }

        tx.commit().await?;

        debug!(table = schema.table, rows = written, "Rows appended");
        Ok(written)
    }

    async fn create_key_index(&self, schema: &'static Schema) -> Result<()> {
        let Some(sql) = create_index_sql(schema) else {
            return Ok(());
        };
        sqlx::query(&sql).execute(&self.pool).await?;
        info!(table = schema.table, "Index created");
        Ok(())
    }
}
