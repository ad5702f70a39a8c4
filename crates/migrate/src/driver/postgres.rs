//! PostgreSQL driver
//!
//! Same table layout as the SQLite driver. Statement failures are located
//! using the error position PostgreSQL reports for the failing statement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlparser::dialect::PostgreSqlDialect;
use sqlx::postgres::{
    PgConnectOptions, PgConnection, PgDatabaseError, PgErrorPosition, PgPool, PgPoolOptions,
};
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use super::sql::{describe_failure, runs_in_transaction, split_qualified, split_statements, Statement};
use super::{Driver, LockInfo};
use crate::config::MigrateConfig;
use crate::error::{MigrateError, MigrateResult};
use crate::file::{Direction, MigrationFile};

/// Driver for `postgres:` and `postgresql:` URLs
pub struct PostgresDriver {
    options: PgConnectOptions,
    config: MigrateConfig,
    token: String,
    pool: OnceCell<PgPool>,
}

impl PostgresDriver {
    /// Create a driver for `url`. No connection is opened until first use.
    pub fn new(url: &str, config: MigrateConfig) -> MigrateResult<Self> {
        config.validate()?;
        let options = PgConnectOptions::from_str(url).map_err(|e| {
            MigrateError::Configuration(format!("invalid PostgreSQL URL: {}", e))
        })?;

        Ok(Self {
            options,
            config,
            token: Uuid::new_v4().to_string(),
            pool: OnceCell::new(),
        })
    }

    /// Token written into the lock table while this driver holds the lock
    pub fn holder_token(&self) -> &str {
        &self.token
    }

    async fn pool(&self) -> MigrateResult<&PgPool> {
        self.pool
            .get_or_try_init(|| async {
                let pool = PgPoolOptions::new()
                    .max_connections(*self.config.get_max_connections())
                    .connect_with(self.options.clone())
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect to PostgreSQL: {}", e);
                        MigrateError::DriverInit(format!("Failed to connect to PostgreSQL: {}", e))
                    })?;
                debug!(max_connections = *self.config.get_max_connections(), "PostgreSQL pool created");
                Ok::<_, MigrateError>(pool)
            })
            .await
    }

    async fn run_statements(
        conn: &mut PgConnection,
        file: &MigrationFile,
        content: &str,
        statements: &[Statement],
    ) -> MigrateResult<()> {
        for statement in statements {
            sqlx::query(&statement.sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    let (message, position) = error_details(&e);
                    MigrateError::execution(
                        file.file_name(),
                        describe_failure(content, statement, position, &message),
                    )
                })?;
        }
        Ok(())
    }

    async fn record_version(&self, conn: &mut PgConnection, file: &MigrationFile) -> MigrateResult<()> {
        let version = i64::try_from(file.version()).map_err(|_| {
            MigrateError::execution(
                file.file_name(),
                format!("version {} does not fit the version table", file.version()),
            )
        })?;
        let sql = match file.direction() {
            Direction::Up => format!("INSERT INTO {} (version) VALUES ($1)", self.config.get_version_table()),
            Direction::Down => format!("DELETE FROM {} WHERE version = $1", self.config.get_version_table()),
        };

        sqlx::query(&sql)
            .bind(version)
            .execute(&mut *conn)
            .await
            .map_err(|e| {
                MigrateError::execution(file.file_name(), format!("Failed to record version: {}", e))
            })?;
        Ok(())
    }

    async fn lock_table_exists(&self) -> MigrateResult<bool> {
        let pool = self.pool().await?;
        sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(self.config.get_lock_table())
            .fetch_one(pool)
            .await
            .map_err(|e| MigrateError::Lock(format!("Failed to inspect lock table: {}", e)))
    }

    async fn read_holder(&self) -> MigrateResult<Option<LockInfo>> {
        let pool = self.pool().await?;
        let row = sqlx::query(&format!("SELECT holder, locked_at FROM {} LIMIT 1", self.config.get_lock_table()))
            .fetch_optional(pool)
            .await
            .map_err(|e| MigrateError::Lock(format!("Failed to read lock holder: {}", e)))?;

        Ok(row.map(|row| LockInfo {
            holder: row.try_get("holder").unwrap_or_default(),
            locked_at: row.try_get::<DateTime<Utc>, _>("locked_at").ok(),
        }))
    }
}

/// Server message and 1-based position of a statement error
fn error_details(error: &sqlx::Error) -> (String, Option<usize>) {
    let Some(db) = error.as_database_error() else {
        return (error.to_string(), None);
    };

    let Some(pg) = db.try_downcast_ref::<PgDatabaseError>() else {
        return (db.message().to_string(), None);
    };

    let position = match pg.position() {
        Some(PgErrorPosition::Original(position)) => Some(position),
        _ => None,
    };
    let severity = format!("{:?}", pg.severity()).to_uppercase();
    (format!("{} {}: {}", severity, pg.code(), pg.message()), position)
}

#[async_trait]
impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn initialize(&self) -> MigrateResult<()> {
        let pool = self.pool().await?;

        for table in [self.config.get_version_table(), self.config.get_lock_table()] {
            if let (Some(schema), _) = split_qualified(table) {
                sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema))
                    .execute(pool)
                    .await
                    .map_err(|e| MigrateError::DriverInit(format!("Failed to create schema '{}': {}", schema, e)))?;
            }
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (version BIGINT PRIMARY KEY NOT NULL, applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
            self.config.get_version_table()
        ))
        .execute(pool)
        .await
        .map_err(|e| MigrateError::DriverInit(format!("Failed to create version table: {}", e)))?;
        Ok(())
    }

    async fn close(&self) -> MigrateResult<()> {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
        Ok(())
    }

    async fn version(&self) -> MigrateResult<u64> {
        let pool = self.pool().await?;
        let version: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT MAX(version) FROM {}",
            self.config.get_version_table()
        ))
        .fetch_one(pool)
        .await
        .map_err(|e| MigrateError::Version(e.to_string()))?;

        match version {
            None => Ok(0),
            Some(v) => u64::try_from(v).map_err(|_| MigrateError::Version(format!("negative version {} stored", v))),
        }
    }

    async fn migrate(&self, file: &MigrationFile) -> MigrateResult<()> {
        let content = file.content_str().await?;
        let statements = split_statements(&PostgreSqlDialect {}, content);
        let pool = self.pool().await?;

        if runs_in_transaction(self.capabilities(), content) {
            let mut tx = pool
                .begin()
                .await
                .map_err(|e| MigrateError::execution(file.file_name(), format!("Failed to start transaction: {}", e)))?;
            Self::run_statements(&mut tx, file, content, &statements).await?;
            self.record_version(&mut tx, file).await?;
            tx.commit()
                .await
                .map_err(|e| MigrateError::execution(file.file_name(), format!("Failed to commit: {}", e)))?;
        } else {
            debug!(file = %file.file_name(), "Running migration outside of a transaction");
            let mut conn = pool
                .acquire()
                .await
                .map_err(|e| MigrateError::execution(file.file_name(), format!("Failed to acquire connection: {}", e)))?;
            Self::run_statements(&mut conn, file, content, &statements).await?;
            self.record_version(&mut conn, file).await?;
        }

        Ok(())
    }

    async fn lock(&self) -> MigrateResult<()> {
        let pool = self.pool().await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| MigrateError::Lock(e.to_string()))?;

        let created = sqlx::query(&format!(
            "CREATE TABLE {} (holder TEXT NOT NULL, locked_at TIMESTAMPTZ NOT NULL)",
            self.config.get_lock_table()
        ))
        .execute(&mut *tx)
        .await;

        if let Err(e) = created {
            drop(tx);
            return Err(match self.read_holder().await {
                Ok(Some(info)) => MigrateError::Lock(format!("lock is {}", info)),
                _ => MigrateError::Lock(e.to_string()),
            });
        }

        sqlx::query(&format!(
            "INSERT INTO {} (holder, locked_at) VALUES ($1, $2)",
            self.config.get_lock_table()
        ))
        .bind(&self.token)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| MigrateError::Lock(e.to_string()))?;

        tx.commit().await.map_err(|e| MigrateError::Lock(e.to_string()))?;
        info!(holder = %self.token, "Migration lock acquired");
        Ok(())
    }

    async fn release(&self) -> MigrateResult<()> {
        if !self.lock_table_exists().await.map_err(|e| MigrateError::Release(e.to_string()))? {
            return Err(MigrateError::Release("lock is not held".to_string()));
        }

        match self.read_holder().await.map_err(|e| MigrateError::Release(e.to_string()))? {
            Some(info) if info.holder != self.token => {
                return Err(MigrateError::Release(format!("lock is {}", info)));
            }
            _ => {}
        }

        let pool = self.pool().await?;
        sqlx::query(&format!("DROP TABLE {}", self.config.get_lock_table()))
            .execute(pool)
            .await
            .map_err(|e| MigrateError::Release(e.to_string()))?;
        info!(holder = %self.token, "Migration lock released");
        Ok(())
    }

    async fn force_release(&self) -> MigrateResult<()> {
        let pool = self.pool().await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.config.get_lock_table()))
            .execute(pool)
            .await
            .map_err(|e| MigrateError::Release(e.to_string()))?;
        Ok(())
    }

    async fn lock_info(&self) -> MigrateResult<Option<LockInfo>> {
        if !self.lock_table_exists().await? {
            return Ok(None);
        }
        Ok(Some(self.read_holder().await?.unwrap_or(LockInfo {
            holder: "unknown".to_string(),
            locked_at: None,
        })))
    }
}
