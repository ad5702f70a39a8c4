//! Migration configuration types and builders

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use service_builder::builder;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{MigrateError, MigrateResult};

static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$").expect("valid table name pattern")
});

/// What to do with files in the migrations source whose names do not parse
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UnparsedFilePolicy {
    /// Leave them out, logging at debug level only
    Ignore,
    /// Leave them out with a warning
    #[default]
    Warn,
    /// Fail the manager build
    Reject,
}

impl FromStr for UnparsedFilePolicy {
    type Err = MigrateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ignore" => Ok(UnparsedFilePolicy::Ignore),
            "warn" => Ok(UnparsedFilePolicy::Warn),
            "reject" | "error" => Ok(UnparsedFilePolicy::Reject),
            other => Err(MigrateError::Configuration(format!(
                "invalid unparsed file policy '{}', expected ignore, warn or reject",
                other
            ))),
        }
    }
}

/// Configuration for the migrator and the bundled drivers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[builder]
pub struct MigrateConfig {
    /// Connection URL of the target database
    #[builder(default = "None", getter, setter)]
    pub database_url: Option<String>,

    /// Directory holding the migration files
    #[builder(default = "PathBuf::from(\"migrations\")", getter, setter)]
    pub migrations_dir: PathBuf,

    /// Table that stores applied versions
    #[builder(default = "\"schema_migrations\".to_string()", getter, setter)]
    pub version_table: String,

    /// Table whose existence marks the migration lock as held
    #[builder(default = "\"schema_migrations_lock\".to_string()", getter, setter)]
    pub lock_table: String,

    /// Handling of files whose names do not parse
    #[builder(default = "UnparsedFilePolicy::Warn", getter, setter)]
    pub unparsed_files: UnparsedFilePolicy,

    /// Results buffered between the apply task and its consumer
    #[builder(default = "1", getter, setter)]
    pub channel_capacity: usize,

    /// Connection pool size for SQL drivers
    #[builder(default = "2", getter, setter)]
    pub max_connections: u32,
}

impl Default for MigrateConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            migrations_dir: PathBuf::from("migrations"),
            version_table: "schema_migrations".to_string(),
            lock_table: "schema_migrations_lock".to_string(),
            unparsed_files: UnparsedFilePolicy::Warn,
            channel_capacity: 1,
            max_connections: 2,
        }
    }
}

impl MigrateConfig {
    /// Load configuration from environment variables.
    ///
    /// `MIGRATE_URL` (or `DATABASE_URL`), `MIGRATE_PATH`,
    /// `MIGRATE_VERSION_TABLE`, `MIGRATE_LOCK_TABLE`,
    /// `MIGRATE_UNPARSED_FILES` and `MIGRATE_MAX_CONNECTIONS` override the
    /// defaults.
    pub fn from_env() -> MigrateResult<Self> {
        let mut config = Self::default();

        config.database_url = env::var("MIGRATE_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok();

        if let Ok(path) = env::var("MIGRATE_PATH") {
            config.migrations_dir = PathBuf::from(path);
        }

        if let Ok(table) = env::var("MIGRATE_VERSION_TABLE") {
            config.version_table = table;
        }

        if let Ok(table) = env::var("MIGRATE_LOCK_TABLE") {
            config.lock_table = table;
        }

        if let Ok(policy) = env::var("MIGRATE_UNPARSED_FILES") {
            config.unparsed_files = policy.parse()?;
        }

        if let Ok(max) = env::var("MIGRATE_MAX_CONNECTIONS") {
            config.max_connections = max.parse().map_err(|_| {
                MigrateError::Configuration(format!(
                    "invalid MIGRATE_MAX_CONNECTIONS '{}', expected a positive integer",
                    max
                ))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that end up interpolated into SQL or sizing resources
    pub fn validate(&self) -> MigrateResult<()> {
        for (field, table) in [("version_table", &self.version_table), ("lock_table", &self.lock_table)] {
            if !TABLE_NAME.is_match(table) {
                return Err(MigrateError::Configuration(format!(
                    "invalid {} '{}', expected an identifier optionally qualified by a schema",
                    field, table
                )));
            }
        }

        if self.version_table == self.lock_table {
            return Err(MigrateError::Configuration(
                "version_table and lock_table must differ".to_string(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(MigrateError::Configuration(
                "channel_capacity must be at least 1".to_string(),
            ));
        }

        if self.max_connections == 0 {
            return Err(MigrateError::Configuration(
                "max_connections must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// The configured database URL, or a configuration error
    pub fn require_database_url(&self) -> MigrateResult<&str> {
        self.database_url.as_deref().ok_or_else(|| {
            MigrateError::Configuration(
                "no database URL configured (set MIGRATE_URL or pass --url)".to_string(),
            )
        })
    }
}

impl MigrateConfigBuilder {
    /// Development defaults: chatty about skipped files
    pub fn development() -> Self {
        MigrateConfigBuilder::new()
            .unparsed_files(UnparsedFilePolicy::Warn)
            .max_connections(2)
    }

    /// Testing defaults: fail loudly on stray files, single connection
    pub fn testing() -> Self {
        MigrateConfigBuilder::new()
            .unparsed_files(UnparsedFilePolicy::Reject)
            .max_connections(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MigrateConfig::default();
        assert_eq!(config.version_table, "schema_migrations");
        assert_eq!(config.lock_table, "schema_migrations_lock");
        assert_eq!(config.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(config.unparsed_files, UnparsedFilePolicy::Warn);
        assert_eq!(config.channel_capacity, 1);
        assert!(config.validate().is_ok());
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = MigrateConfigBuilder::new()
            .database_url(Some("sqlite://test.db".to_string()))
            .version_table("app_versions".to_string())
            .build()
            .expect("Failed to build config");

        assert_eq!(config.get_database_url().as_deref(), Some("sqlite://test.db"));
        assert_eq!(config.get_version_table(), "app_versions");
        assert_eq!(config.get_lock_table(), "schema_migrations_lock"); // Default
    }

    #[test]
    fn test_testing_config() {
        let config = MigrateConfigBuilder::testing()
            .build()
            .expect("Failed to build config");
        assert_eq!(*config.get_unparsed_files(), UnparsedFilePolicy::Reject);
        assert_eq!(*config.get_max_connections(), 1);
    }

    #[test]
    fn test_validate_rejects_bad_tables() {
        let mut config = MigrateConfig::default();
        config.version_table = "versions; DROP TABLE users".to_string();
        assert!(matches!(config.validate(), Err(MigrateError::Configuration(_))));

        let mut config = MigrateConfig::default();
        config.version_table = "public.schema_migrations".to_string();
        assert!(config.validate().is_ok());

        config.lock_table = config.version_table.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("IGNORE".parse::<UnparsedFilePolicy>().unwrap(), UnparsedFilePolicy::Ignore);
        assert_eq!("error".parse::<UnparsedFilePolicy>().unwrap(), UnparsedFilePolicy::Reject);
        assert!("loud".parse::<UnparsedFilePolicy>().is_err());
    }
}
