#![cfg(feature = "sqlite")]

use elif_migrate::{
    Driver, DriverRegistry, MigrateConfig, MigrateConfigBuilder, MigrateError, Migrator, SqliteDriver,
};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("migrations")).unwrap();
        Self { dir }
    }

    fn write(&self, name: &str, body: &str) -> &Self {
        fs::write(self.dir.path().join("migrations").join(name), body).unwrap();
        self
    }

    fn url(&self) -> String {
        format!("sqlite://{}", self.dir.path().join("app.db").display())
    }

    fn config(&self) -> MigrateConfig {
        MigrateConfigBuilder::testing()
            .database_url(Some(self.url()))
            .migrations_dir(self.dir.path().join("migrations"))
            .build()
            .unwrap()
    }

    fn migrator(&self) -> Migrator {
        Migrator::from_config(&DriverRegistry::with_defaults(), self.config()).unwrap()
    }

    fn driver(&self) -> SqliteDriver {
        SqliteDriver::new(&self.url(), self.config()).unwrap()
    }
}

fn standard(fixture: &Fixture) {
    fixture
        .write("1_users.up.sql", "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);")
        .write("1_users.down.sql", "DROP TABLE users;")
        .write(
            "2_seed.up.sql",
            "INSERT INTO users (name) VALUES ('alice');\nINSERT INTO users (name) VALUES ('bob; the builder');",
        )
        .write("2_seed.down.sql", "DELETE FROM users;");
}

async fn user_count(path: &Path) -> i64 {
    let pool = sqlx::SqlitePool::connect(&format!("sqlite://{}", path.display()))
        .await
        .unwrap();
    let count = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&pool)
        .await
        .unwrap();
    pool.close().await;
    count
}

#[tokio::test]
async fn test_up_and_down_against_file_database() {
    let fixture = Fixture::new();
    standard(&fixture);
    let migrator = fixture.migrator();

    assert_eq!(migrator.version().await.unwrap(), 0);

    let applied = migrator.up().await.unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(migrator.version().await.unwrap(), 2);
    assert_eq!(user_count(&fixture.dir.path().join("app.db")).await, 2);

    let rolled_back = migrator.migrate(-1).await.unwrap();
    assert_eq!(rolled_back[0].file_name(), "2_seed.down.sql");
    assert_eq!(migrator.version().await.unwrap(), 1);

    migrator.down().await.unwrap();
    assert_eq!(migrator.version().await.unwrap(), 0);
    assert!(migrator.lock_info().await.unwrap().is_none());
    migrator.close().await.unwrap();
}

#[tokio::test]
async fn test_failing_statement_is_located_and_rolled_back() {
    let fixture = Fixture::new();
    standard(&fixture);
    fixture.write(
        "3_broken.up.sql",
        "CREATE TABLE posts (id INTEGER);\n\nINSERT INTO missing_table VALUES (1);",
    );
    let migrator = fixture.migrator();

    let err = migrator.up().await.unwrap_err();
    assert_eq!(err.applied_count(), 2);
    match err.error() {
        MigrateError::Execution { file_name, detail } => {
            assert_eq!(file_name, "3_broken.up.sql");
            assert!(detail.contains("statement 2 at line 3"), "{}", detail);
            assert!(detail.contains("missing_table"), "{}", detail);
        }
        other => panic!("unexpected error: {:?}", other),
    }

    assert_eq!(migrator.version().await.unwrap(), 2);
    assert!(migrator.lock_info().await.unwrap().is_none());
}

#[tokio::test]
async fn test_lock_excludes_second_migrator() {
    let fixture = Fixture::new();
    standard(&fixture);
    let holder = fixture.driver();
    holder.initialize().await.unwrap();
    holder.lock().await.unwrap();

    let migrator = fixture.migrator();
    let err = migrator.up().await.unwrap_err();
    assert!(matches!(err.error(), MigrateError::Lock(_)));
    assert_eq!(err.applied_count(), 0);

    let info = migrator.lock_info().await.unwrap().unwrap();
    assert_eq!(info.holder, holder.holder_token());

    // Someone else's lock cannot be released normally
    assert!(matches!(fixture.driver().release().await, Err(MigrateError::Release(_))));

    migrator.force_unlock().await.unwrap();
    assert_eq!(migrator.up().await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_no_transaction_marker() {
    let fixture = Fixture::new();
    fixture
        .write("1_users.up.sql", "CREATE TABLE users (id INTEGER);")
        .write(
            "2_vacuum.up.sql",
            "-- elif:no-transaction\nCREATE INDEX users_id ON users (id);\nVACUUM;",
        );
    let migrator = fixture.migrator();

    assert_eq!(migrator.up().await.unwrap().len(), 2);
    assert_eq!(migrator.version().await.unwrap(), 2);
}

#[tokio::test]
async fn test_custom_version_table() {
    let fixture = Fixture::new();
    standard(&fixture);
    let mut config = fixture.config();
    config.set_version_table("app_versions".to_string());
    let migrator = Migrator::from_config(&DriverRegistry::with_defaults(), config).unwrap();

    migrator.up().await.unwrap();

    let pool = sqlx::SqlitePool::connect(&fixture.url()).await.unwrap();
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM app_versions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 2);
    pool.close().await;
}
