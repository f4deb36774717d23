pub mod bulk_write;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use tracing::info;

use crate::{
    probe::ServerRecord,
    processing::{BatchSink, SinkWriteError},
};

#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::SqlitePool,
}

impl Database {
    /// Open (or create) the database at `url`, like `sqlite://servers.db` or
    /// `sqlite::memory:`, and make sure the tables exist.
    pub async fn connect(url: &str) -> eyre::Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let mut pool_options = SqlitePoolOptions::new();
        if url.contains(":memory:") {
            // every connection to an in-memory database gets its own database,
            // so there can only be one and it must never be closed
            pool_options = pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }
        let pool = pool_options.connect_with(options).await?;
        sqlx::migrate!().run(&pool).await?;
        info!("connected to {url}");

        Ok(Self { pool })
    }

    pub async fn count_servers(&self) -> sqlx::Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM servers")
            .fetch_one(&self.pool)
            .await
    }
}

impl BatchSink for Database {
    async fn write_batch(&mut self, batch: Vec<ServerRecord>) -> Result<(), SinkWriteError> {
        bulk_write::upsert_servers(&self.pool, &batch)
            .await
            .map_err(|err| SinkWriteError {
                count: batch.len(),
                source: Box::new(err),
            })
    }
}
