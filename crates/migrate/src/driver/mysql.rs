//! MySQL driver
//!
//! Same table layout as the other SQL drivers. MySQL commits DDL
//! implicitly, so files run statement by statement and the version row is
//! written once every statement has succeeded.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlparser::dialect::MySqlDialect;
use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlDatabaseError, MySqlPool, MySqlPoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use uuid::Uuid;

use super::sql::{describe_failure, split_qualified, split_statements, Statement};
use super::{Driver, DriverCapabilities, LockInfo};
use crate::config::MigrateConfig;
use crate::error::{MigrateError, MigrateResult};
use crate::file::{Direction, MigrationFile};

static AT_LINE: Lazy<Regex> = Lazy::new(|| Regex::new(r"at line ([0-9]+)$").expect("valid line pattern"));

/// Driver for `mysql:` URLs
pub struct MySqlDriver {
    options: MySqlConnectOptions,
    config: MigrateConfig,
    token: String,
    pool: OnceCell<MySqlPool>,
}

impl MySqlDriver {
    /// Create a driver for `url`. No connection is opened until first use.
    pub fn new(url: &str, config: MigrateConfig) -> MigrateResult<Self> {
        config.validate()?;
        let options = MySqlConnectOptions::from_str(url)
            .map_err(|e| MigrateError::Configuration(format!("invalid MySQL URL: {}", e)))?;

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

    async fn pool(&self) -> MigrateResult<&MySqlPool> {
        self.pool
            .get_or_try_init(|| async {
                let pool = MySqlPoolOptions::new()
                    .max_connections(*self.config.get_max_connections())
                    .connect_with(self.options.clone())
                    .await
                    .map_err(|e| {
                        tracing::error!("Failed to connect to MySQL: {}", e);
                        MigrateError::DriverInit(format!("Failed to connect to MySQL: {}", e))
                    })?;
                debug!(max_connections = *self.config.get_max_connections(), "MySQL pool created");
                Ok::<_, MigrateError>(pool)
            })
            .await
    }

    async fn run_statements(
        conn: &mut MySqlConnection,
        file: &MigrationFile,
        content: &str,
        statements: &[Statement],
    ) -> MigrateResult<()> {
        for statement in statements {
            sqlx::query(&statement.sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    let (message, position) = error_details(&e, &statement.sql);
                    MigrateError::execution(
                        file.file_name(),
                        describe_failure(content, statement, position, &message),
                    )
                })?;
        }
        Ok(())
    }

    async fn record_version(&self, conn: &mut MySqlConnection, file: &MigrationFile) -> MigrateResult<()> {
        let version = i64::try_from(file.version()).map_err(|_| {
            MigrateError::execution(
                file.file_name(),
                format!("version {} does not fit the version table", file.version()),
            )
        })?;
        let sql = match file.direction() {
            Direction::Up => format!("INSERT INTO {} (version) VALUES (?)", self.config.get_version_table()),
            Direction::Down => format!("DELETE FROM {} WHERE version = ?", self.config.get_version_table()),
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
        let (schema, table) = split_qualified(self.config.get_lock_table());
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = COALESCE(?, DATABASE()) AND table_name = ?",
        )
        .bind(schema)
        .bind(table)
        .fetch_one(pool)
        .await
        .map_err(|e| MigrateError::Lock(format!("Failed to inspect lock table: {}", e)))?;
        Ok(count > 0)
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

/// Server message and 1-based character position of a statement error.
/// MySQL reports syntax errors by line within the statement.
fn error_details(error: &sqlx::Error, statement: &str) -> (String, Option<usize>) {
    let Some(db) = error.as_database_error() else {
        return (error.to_string(), None);
    };

    let Some(my) = db.try_downcast_ref::<MySqlDatabaseError>() else {
        return (db.message().to_string(), None);
    };

    let position = reported_line(my.message()).and_then(|line| line_position(statement, line));
    let message = format!(
        "ERROR {} ({}): {}",
        my.number(),
        my.code().unwrap_or("HY000"),
        my.message()
    );
    (message, position)
}

/// Line number from a message ending in `at line N`
fn reported_line(message: &str) -> Option<usize> {
    AT_LINE
        .captures(message)
        .and_then(|captures| captures[1].parse().ok())
}

/// 1-based character position where `line` starts inside `sql`
fn line_position(sql: &str, line: usize) -> Option<usize> {
    if line <= 1 {
        return Some(1);
    }
    let (offset, _) = sql.match_indices('\n').nth(line - 2)?;
    Some(sql[..=offset].chars().count() + 1)
}

#[async_trait]
impl Driver for MySqlDriver {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities { transactional: false }
    }

    async fn initialize(&self) -> MigrateResult<()> {
        let pool = self.pool().await?;

        for table in [self.config.get_version_table(), self.config.get_lock_table()] {
            if let (Some(schema), _) = split_qualified(table) {
                sqlx::query(&format!("CREATE DATABASE IF NOT EXISTS {}", schema))
                    .execute(pool)
                    .await
                    .map_err(|e| MigrateError::DriverInit(format!("Failed to create database '{}': {}", schema, e)))?;
            }
        }

        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (version BIGINT PRIMARY KEY NOT NULL, applied_at TIMESTAMP(6) NOT NULL DEFAULT CURRENT_TIMESTAMP(6))",
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
        let statements = split_statements(&MySqlDialect {}, content);
        let pool = self.pool().await?;

        let mut conn = pool
            .acquire()
            .await
            .map_err(|e| MigrateError::execution(file.file_name(), format!("Failed to acquire connection: {}", e)))?;
        Self::run_statements(&mut conn, file, content, &statements).await?;
        self.record_version(&mut conn, file).await
    }

    async fn lock(&self) -> MigrateResult<()> {
        let pool = self.pool().await?;

        let created = sqlx::query(&format!(
            "CREATE TABLE {} (holder VARCHAR(64) NOT NULL, locked_at TIMESTAMP(6) NOT NULL)",
            self.config.get_lock_table()
        ))
        .execute(pool)
        .await;

        if let Err(e) = created {
            return Err(match self.read_holder().await {
                Ok(Some(info)) => MigrateError::Lock(format!("lock is {}", info)),
                _ => MigrateError::Lock(e.to_string()),
            });
        }

        let inserted = sqlx::query(&format!(
            "INSERT INTO {} (holder, locked_at) VALUES (?, ?)",
            self.config.get_lock_table()
        ))
        .bind(&self.token)
        .bind(Utc::now())
        .execute(pool)
        .await;

        if let Err(e) = inserted {
            if let Err(drop_error) = self.force_release().await {
                tracing::error!("Failed to drop half-created lock table: {}", drop_error);
            }
            return Err(MigrateError::Lock(e.to_string()));
        }

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
