use anyhow::Context;
use serde_json::Value;
use sqlx::{migrate::MigrateDatabase, sqlite::SqlitePoolOptions, Row, Sqlite, SqlitePool};
use std::path::Path;

// Keys of the values the client persists between runs
pub const THEME_KEY: &str = "theme";
pub const REMEMBERED_EMAIL_KEY: &str = "rememberedEmail";
pub const STATE_SNAPSHOT_KEY: &str = "zekaiState";

const MIGRATIONS_SQL: &str = "
CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
";

/// Local persistent key/value storage backed by SQLite.
#[derive(Debug, Clone)]
pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    /// Opens (creating if needed) the database file and runs migrations.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, anyhow::Error> {
        let db_path = path.as_ref();

        // Ensure the parent directory exists
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create database directory")?;
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.to_string_lossy());
        log::info!("Connecting to database: {}", db_url);

        if !Sqlite::database_exists(&db_url).await.unwrap_or(false) {
            log::info!("Database file not found, creating...");
            Sqlite::create_database(&db_url).await.context("Failed to create database")?;
        }

        let pool = SqlitePoolOptions::new()
            .connect(&db_url)
            .await
            .context("Failed to connect to SQLite database")?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database. One connection, since every SQLite
    /// memory connection is its own database.
    pub async fn in_memory() -> Result<Self, anyhow::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("Failed to open in-memory SQLite database")?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), anyhow::Error> {
        log::debug!("Running database migrations...");
        sqlx::query(MIGRATIONS_SQL)
            .execute(pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context(format!("Failed to read setting '{}'", key))?;
        row.map(|r| r.try_get::<String, _>("value"))
            .transpose()
            .context(format!("Failed to decode setting '{}'", key))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        log::debug!("Saving setting '{}'", key);
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .context(format!("Failed to save setting '{}'", key))?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .context(format!("Failed to delete setting '{}'", key))?;
        if result.rows_affected() == 0 {
            log::debug!("Setting '{}' was not stored", key);
        }
        Ok(())
    }

    /// `None` when no preference has been saved yet.
    pub async fn load_dark_mode(&self) -> Result<Option<bool>, anyhow::Error> {
        Ok(self.get(THEME_KEY).await?.map(|theme| theme == "dark"))
    }

    pub async fn save_dark_mode(&self, dark: bool) -> Result<(), anyhow::Error> {
        self.set(THEME_KEY, if dark { "dark" } else { "light" }).await
    }

    pub async fn remembered_email(&self) -> Result<Option<String>, anyhow::Error> {
        self.get(REMEMBERED_EMAIL_KEY).await
    }

    /// Stores the login email, or forgets it when `None`.
    pub async fn set_remembered_email(&self, email: Option<&str>) -> Result<(), anyhow::Error> {
        match email {
            Some(email) => self.set(REMEMBERED_EMAIL_KEY, email).await,
            None => self.remove(REMEMBERED_EMAIL_KEY).await,
        }
    }

    pub async fn save_state_snapshot(&self, state: &Value) -> Result<(), anyhow::Error> {
        let json = serde_json::to_string(state).context("Failed to serialize state snapshot")?;
        self.set(STATE_SNAPSHOT_KEY, &json).await
    }

    /// A corrupt snapshot is logged and treated as absent.
    pub async fn load_state_snapshot(&self) -> Result<Option<Value>, anyhow::Error> {
        let Some(json) = self.get(STATE_SNAPSHOT_KEY).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&json) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::warn!("Ignoring unreadable state snapshot: {}", e);
                Ok(None)
            }
        }
    }
}
