//! SQLite driver
//!
//! Applied versions live in one row per version of the version table; the
//! current version is the highest one. The lock is the existence of the lock
//! table, created and populated with our holder token in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlparser::dialect::SQLiteDialect;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePool, SqlitePoolOptions};
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

/// Driver for `sqlite:` URLs
pub struct SqliteDriver {
    options: SqliteConnectOptions,
    in_memory: bool,
    config: MigrateConfig,
    token: String,
    pool: OnceCell<SqlitePool>,
}

impl SqliteDriver {
    /// Create a driver for `url`. No connection is opened until first use.
    pub fn new(url: &str, config: MigrateConfig) -> MigrateResult<Self> {
        config.validate()?;
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MigrateError::Configuration(format!("invalid SQLite URL '{}': {}", url, e)))?
            .create_if_missing(true);

        Ok(Self {
            options,
            in_memory: url.contains(":memory:") || url.contains("mode=memory"),
            config,
            token: Uuid::new_v4().to_string(),
            pool: OnceCell::new(),
        })
    }

    /// Token written into the lock table while this driver holds the lock
    pub fn holder_token(&self) -> &str {
        &self.token
    }

    async fn pool(&self) -> MigrateResult<&SqlitePool> {
        self.pool
            .get_or_try_init(|| async {
                // Every connection to `:memory:` is a separate database
                let max_connections = if self.in_memory { 1 } else { *self.config.get_max_connections() };
                let mut options = SqlitePoolOptions::new().max_connections(max_connections);
                if self.in_memory {
                    options = options.idle_timeout(None).max_lifetime(None);
                }

                let pool = options
                    .connect_with(self.options.clone())
                    .await
                    .map_err(|e| MigrateError::DriverInit(format!("Failed to connect to SQLite: {}", e)))?;
                debug!(max_connections, "SQLite pool created");
                Ok::<_, MigrateError>(pool)
            })
            .await
    }

    async fn run_statements(
        conn: &mut SqliteConnection,
        file: &MigrationFile,
        content: &str,
        statements: &[Statement],
    ) -> MigrateResult<()> {
        for statement in statements {
            sqlx::query(&statement.sql)
                .execute(&mut *conn)
                .await
                .map_err(|e| {
                    let message = e
                        .as_database_error()
                        .map(|db| db.message().to_string())
                        .unwrap_or_else(|| e.to_string());
                    MigrateError::execution(
                        file.file_name(),
                        describe_failure(content, statement, None, &message),
                    )
                })?;
        }
        Ok(())
    }

    async fn record_version(&self, conn: &mut SqliteConnection, file: &MigrationFile) -> MigrateResult<()> {
        let version = to_db_version(file)?;
        let sql = match file.direction() {
            Direction::Up => format!(
                "INSERT INTO {} (version, applied_at) VALUES (?, ?)",
                self.config.get_version_table()
            ),
            Direction::Down => format!("DELETE FROM {} WHERE version = ?", self.config.get_version_table()),
        };

        let mut query = sqlx::query(&sql).bind(version);
        if file.direction() == Direction::Up {
            query = query.bind(Utc::now().to_rfc3339());
        }
        query.execute(&mut *conn).await.map_err(|e| {
            MigrateError::execution(file.file_name(), format!("Failed to record version: {}", e))
        })?;
        Ok(())
    }

    async fn lock_table_exists(&self) -> MigrateResult<bool> {
        let pool = self.pool().await?;
        let (schema, table) = split_qualified(self.config.get_lock_table());
        let master = match schema {
            Some(schema) => format!("{}.sqlite_master", schema),
            None => "sqlite_master".to_string(),
        };

        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE type = 'table' AND name = ?",
            master
        ))
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

        Ok(row.map(|row| {
            let locked_at: Option<String> = row.try_get("locked_at").ok();
            LockInfo {
                holder: row.try_get("holder").unwrap_or_default(),
                locked_at: locked_at
                    .and_then(|at| DateTime::parse_from_rfc3339(&at).ok())
                    .map(|at| at.with_timezone(&Utc)),
            }
        }))
    }
}

fn to_db_version(file: &MigrationFile) -> MigrateResult<i64> {
    i64::try_from(file.version()).map_err(|_| {
        MigrateError::execution(
            file.file_name(),
            format!("version {} does not fit the version table", file.version()),
        )
    })
}

#[async_trait]
impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn initialize(&self) -> MigrateResult<()> {
        let pool = self.pool().await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (version INTEGER PRIMARY KEY NOT NULL, applied_at TEXT NOT NULL)",
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
        let statements = split_statements(&SQLiteDialect {}, content);
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
            "CREATE TABLE {} (holder TEXT NOT NULL, locked_at TEXT NOT NULL)",
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
            "INSERT INTO {} (holder, locked_at) VALUES (?, ?)",
            self.config.get_lock_table()
        ))
        .bind(&self.token)
        .bind(Utc::now().to_rfc3339())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::BytesContent;
    use std::sync::Arc;

    fn driver() -> SqliteDriver {
        SqliteDriver::new("sqlite::memory:", MigrateConfig::default()).unwrap()
    }

    fn file(name: &str, body: &str) -> MigrationFile {
        MigrationFile::parse(name, "sql", Arc::new(BytesContent::new(body))).unwrap()
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let driver = driver();
        driver.initialize().await.unwrap();
        driver.initialize().await.unwrap();
        assert_eq!(driver.version().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_migrate_moves_version() {
        let driver = driver();
        driver.initialize().await.unwrap();

        driver
            .migrate(&file("1_users.up.sql", "CREATE TABLE users (id INTEGER);\nINSERT INTO users VALUES (1);"))
            .await
            .unwrap();
        driver
            .migrate(&file("2_posts.up.sql", "CREATE TABLE posts (id INTEGER);"))
            .await
            .unwrap();
        assert_eq!(driver.version().await.unwrap(), 2);

        driver
            .migrate(&file("2_posts.down.sql", "DROP TABLE posts;"))
            .await
            .unwrap();
        assert_eq!(driver.version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_trigger_body_runs_as_one_statement() {
        let driver = driver();
        driver.initialize().await.unwrap();

        let body = "CREATE TABLE a (id INTEGER);\nCREATE TABLE b (id INTEGER);\nCREATE TRIGGER t AFTER INSERT ON a BEGIN\n  INSERT INTO b VALUES (NEW.id);\nEND;\nINSERT INTO a VALUES (7);";
        driver.migrate(&file("1_trigger.up.sql", body)).await.unwrap();
        assert_eq!(driver.version().await.unwrap(), 1);

        let pool = driver.pool().await.unwrap();
        let copied: i64 = sqlx::query_scalar("SELECT id FROM b").fetch_one(pool).await.unwrap();
        assert_eq!(copied, 7);
    }

    #[tokio::test]
    async fn test_failed_migration_rolls_back() {
        let driver = driver();
        driver.initialize().await.unwrap();

        let err = driver
            .migrate(&file("1_bad.up.sql", "CREATE TABLE a (id INTEGER);\nSELEC 1;"))
            .await
            .unwrap_err();
        match err {
            MigrateError::Execution { file_name, detail } => {
                assert_eq!(file_name, "1_bad.up.sql");
                assert!(detail.contains("in statement 2 at line 2"), "{}", detail);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(driver.version().await.unwrap(), 0);

        // The first statement was rolled back with the rest of the file
        driver
            .migrate(&file("1_good.up.sql", "CREATE TABLE a (id INTEGER);"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_round_trip() {
        let driver = driver();
        driver.initialize().await.unwrap();
        assert!(driver.lock_info().await.unwrap().is_none());

        driver.lock().await.unwrap();
        let info = driver.lock_info().await.unwrap().unwrap();
        assert_eq!(info.holder, driver.holder_token());
        assert!(info.locked_at.is_some());

        assert!(matches!(driver.lock().await, Err(MigrateError::Lock(_))));

        driver.release().await.unwrap();
        assert!(driver.lock_info().await.unwrap().is_none());
        assert!(matches!(driver.release().await, Err(MigrateError::Release(_))));
    }

    #[tokio::test]
    async fn test_force_release_is_unconditional() {
        let driver = driver();
        driver.initialize().await.unwrap();
        driver.force_release().await.unwrap();

        driver.lock().await.unwrap();
        driver.force_release().await.unwrap();
        assert!(driver.lock_info().await.unwrap().is_none());
    }
}
