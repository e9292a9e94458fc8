use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, Row, SqlitePool, query};
use tokio::sync::broadcast;
use uuid::Uuid;

use super::{ANNOUNCE_CHANNEL_SIZE, CatalogError, CatalogPublisher, CatalogResult};
use crate::model::{Attributes, Record, RecordHandle, RecordType, Status};

#[derive(Clone)]
enum Pool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// Catalog persisting published records in PostgreSQL or SQLite.
#[derive(Clone)]
pub struct SqlCatalog {
    pool: Pool,
    announcements: broadcast::Sender<Record>,
}

impl std::fmt::Debug for SqlCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self.pool {
            Pool::Postgres(_) => "postgres",
            Pool::Sqlite(_) => "sqlite",
        };
        f.debug_struct("SqlCatalog")
            .field("backend", &backend)
            .finish()
    }
}

impl SqlCatalog {
    /// Connect to the catalog database and initialize the schema.
    pub async fn new(dsn: &str) -> Result<Self, sqlx::Error> {
        log::info!("Connecting to catalog database with DSN: {dsn}");

        let pool = if dsn.starts_with("sqlite:") {
            let in_memory = dsn.contains(":memory:");
            // Add mode=rwc to create database file if it doesn't exist
            let dsn_with_create = if in_memory || dsn.contains("mode=") {
                dsn.to_string()
            } else if dsn.contains('?') {
                format!("{dsn}&mode=rwc")
            } else {
                format!("{dsn}?mode=rwc")
            };

            // Every connection to `:memory:` opens a fresh database
            let max_connections = if in_memory { 1 } else { 5 };
            let pool = SqlitePoolOptions::new()
                .max_connections(max_connections)
                .connect(&dsn_with_create)
                .await
                .map_err(|e| {
                    log::error!(
                        "Failed to connect to SQLite database with DSN '{dsn_with_create}': {e}"
                    );
                    e
                })?;
            Pool::Sqlite(pool)
        } else {
            let pool = PgPoolOptions::new().connect(dsn).await.map_err(|e| {
                log::error!("Failed to connect to PostgreSQL database with DSN '{dsn}': {e}");
                e
            })?;
            Pool::Postgres(pool)
        };

        let (announcements, _) = broadcast::channel(ANNOUNCE_CHANNEL_SIZE);
        let catalog = Self {
            pool,
            announcements,
        };
        catalog.init().await.map_err(|e| {
            log::error!("Failed to initialize catalog schema: {e}");
            e
        })?;
        log::info!("Catalog schema initialized successfully");
        Ok(catalog)
    }

    async fn init(&self) -> Result<(), sqlx::Error> {
        match &self.pool {
            Pool::Sqlite(pool) => {
                let create_records = r#"
                CREATE TABLE IF NOT EXISTS records (
                    registration TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    record_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    location TEXT NOT NULL,
                    published_at TEXT NOT NULL
                )"#;
                query(create_records).execute(pool).await?;
            }
            Pool::Postgres(pool) => {
                let create_records = r#"
                CREATE TABLE IF NOT EXISTS records (
                    registration TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    record_type TEXT NOT NULL,
                    status TEXT NOT NULL,
                    metadata TEXT NOT NULL,
                    location TEXT NOT NULL,
                    published_at TIMESTAMPTZ NOT NULL
                )"#;
                query(create_records).execute(pool).await?;
            }
        }
        Ok(())
    }

    /// Receive every record change: `UP` on publish, `DOWN` on unpublish
    pub fn announcements(&self) -> broadcast::Receiver<Record> {
        self.announcements.subscribe()
    }

    /// List all records currently published.
    pub async fn list_records(&self) -> CatalogResult<Vec<Record>> {
        let select = "SELECT registration, name, record_type, status, metadata, location FROM records ORDER BY name, registration";
        let rows = match &self.pool {
            Pool::Sqlite(pool) => query(select)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|row| RecordRow::from_sqlite(&row))
                .collect::<Result<Vec<_>, _>>()?,
            Pool::Postgres(pool) => query(select)
                .fetch_all(pool)
                .await?
                .into_iter()
                .map(|row| RecordRow::from_postgres(&row))
                .collect::<Result<Vec<_>, _>>()?,
        };

        rows.into_iter().map(RecordRow::into_record).collect()
    }

    async fn find(&self, handle: &RecordHandle) -> CatalogResult<Option<Record>> {
        let row = match &self.pool {
            Pool::Sqlite(pool) => query(
                "SELECT registration, name, record_type, status, metadata, location FROM records WHERE registration = ?",
            )
            .bind(handle.as_str())
            .fetch_optional(pool)
            .await?
            .map(|row| RecordRow::from_sqlite(&row))
            .transpose()?,
            Pool::Postgres(pool) => query(
                "SELECT registration, name, record_type, status, metadata, location FROM records WHERE registration = $1",
            )
            .bind(handle.as_str())
            .fetch_optional(pool)
            .await?
            .map(|row| RecordRow::from_postgres(&row))
            .transpose()?,
        };

        row.map(RecordRow::into_record).transpose()
    }

    fn announce(&self, record: Record) {
        let _ = self.announcements.send(record);
    }
}

#[async_trait]
impl CatalogPublisher for SqlCatalog {
    async fn publish(&self, mut record: Record) -> CatalogResult<RecordHandle> {
        let handle = RecordHandle::new(Uuid::new_v4().to_string());
        record.registration = Some(handle.clone());
        if record.status == Status::Unknown {
            record.status = Status::Up;
        }

        let metadata = serde_json::to_string(&record.metadata)?;
        let location = serde_json::to_string(&record.location)?;
        let record_type = record.record_type.to_string();
        let status = record.status.to_string();

        match &self.pool {
            Pool::Sqlite(pool) => {
                let stmt = r#"
                INSERT INTO records (registration, name, record_type, status, metadata, location, published_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#;
                query(stmt)
                    .bind(handle.as_str())
                    .bind(&record.name)
                    .bind(&record_type)
                    .bind(&status)
                    .bind(&metadata)
                    .bind(&location)
                    .bind(Utc::now().to_rfc3339())
                    .execute(pool)
                    .await?;
            }
            Pool::Postgres(pool) => {
                let stmt = r#"
                INSERT INTO records (registration, name, record_type, status, metadata, location, published_at)
                VALUES ($1, $2, $3, $4, $5, $6, NOW())
                "#;
                query(stmt)
                    .bind(handle.as_str())
                    .bind(&record.name)
                    .bind(&record_type)
                    .bind(&status)
                    .bind(&metadata)
                    .bind(&location)
                    .execute(pool)
                    .await?;
            }
        }

        log::debug!("Published record {} as {}", record.name, handle);
        self.announce(record);
        Ok(handle)
    }

    async fn unpublish(&self, handle: &RecordHandle) -> CatalogResult<()> {
        let Some(mut record) = self.find(handle).await? else {
            return Err(CatalogError::NotFound(handle.clone()));
        };

        let rows_affected = match &self.pool {
            Pool::Sqlite(pool) => query("DELETE FROM records WHERE registration = ?")
                .bind(handle.as_str())
                .execute(pool)
                .await?
                .rows_affected(),
            Pool::Postgres(pool) => query("DELETE FROM records WHERE registration = $1")
                .bind(handle.as_str())
                .execute(pool)
                .await?
                .rows_affected(),
        };
        if rows_affected == 0 {
            return Err(CatalogError::NotFound(handle.clone()));
        }

        log::debug!("Unpublished record {} ({})", record.name, handle);
        record.status = Status::Down;
        self.announce(record);
        Ok(())
    }
}

struct RecordRow {
    registration: String,
    name: String,
    record_type: String,
    status: String,
    metadata: String,
    location: String,
}

impl RecordRow {
    fn from_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            registration: row.try_get("registration")?,
            name: row.try_get("name")?,
            record_type: row.try_get("record_type")?,
            status: row.try_get("status")?,
            metadata: row.try_get("metadata")?,
            location: row.try_get("location")?,
        })
    }

    fn from_postgres(row: &sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            registration: row.try_get("registration")?,
            name: row.try_get("name")?,
            record_type: row.try_get("record_type")?,
            status: row.try_get("status")?,
            metadata: row.try_get("metadata")?,
            location: row.try_get("location")?,
        })
    }

    fn into_record(self) -> CatalogResult<Record> {
        let metadata: Attributes = serde_json::from_str(&self.metadata)?;
        let location: Attributes = serde_json::from_str(&self.location)?;
        let status = self
            .status
            .parse::<Status>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(Record {
            name: self.name,
            record_type: RecordType::from(self.record_type.as_str()),
            metadata,
            location,
            status,
            registration: Some(RecordHandle::new(self.registration)),
        })
    }
}
