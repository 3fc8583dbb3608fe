use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use deadpool::managed::{self, Pool, RecycleError, RecycleResult};
use libsql::{Connection, Database, Error as LibsqlError, params};

use crate::config::DatabaseSettings;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

pub struct LibsqlManager {
    database: Database,
    recycle_count: AtomicUsize,
}

impl LibsqlManager {
    pub fn new(database: Database) -> Self {
        Self { database, recycle_count: AtomicUsize::new(0) }
    }
}

impl managed::Manager for LibsqlManager {
    type Type = Connection;
    type Error = LibsqlError;

    async fn create(&self) -> Result<Self::Type, Self::Error> {
        let conn = self.database.connect()?;
        // Concurrent probe writers share one file; wait for the lock instead of failing.
        conn.busy_timeout(BUSY_TIMEOUT)?;
        Ok(conn)
    }

    async fn recycle(
        &self,
        conn: &mut Self::Type,
        _: &managed::Metrics,
    ) -> RecycleResult<Self::Error> {
        let recycle_count = self.recycle_count.fetch_add(1, Ordering::Relaxed) as u64;
        let row = conn
            .query("SELECT ?1", params![recycle_count])
            .await?
            .next()
            .await?
            .ok_or(LibsqlError::QueryReturnedNoRows)?;
        if row.get::<u64>(0)? != recycle_count {
            return Err(RecycleError::Message("Connection returned a stale value".into()));
        }
        Ok(())
    }
}

pub type LibsqlPool = Pool<LibsqlManager>;

/// Open the local database file and wrap it in a pool
pub async fn create_pool(settings: &DatabaseSettings) -> Result<LibsqlPool> {
    let database = libsql::Builder::new_local(&settings.path).build().await?;
    let pool = Pool::builder(LibsqlManager::new(database))
        .max_size(settings.max_connections.max(1))
        .build()?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_pool_hands_out_usable_connections() {
        let dir = tempdir().unwrap();
        let settings = DatabaseSettings {
            path: dir.path().join("pool.db").to_string_lossy().to_string(),
            max_connections: 2,
        };
        let pool = create_pool(&settings).await.unwrap();

        let conn = pool.get().await.unwrap();
        conn.execute("CREATE TABLE t (v INTEGER)", ()).await.unwrap();
        conn.execute("INSERT INTO t (v) VALUES (?)", params![7]).await.unwrap();
        drop(conn);

        // A recycled connection must pass the liveness check and see the write.
        let conn = pool.get().await.unwrap();
        let row = conn.query("SELECT v FROM t", ()).await.unwrap().next().await.unwrap().unwrap();
        assert_eq!(row.get::<i64>(0).unwrap(), 7);

        let mut rows = conn.query("PRAGMA busy_timeout", ()).await.unwrap();
        let timeout = rows.next().await.unwrap().unwrap().get::<i64>(0).unwrap();
        assert_eq!(timeout, 5000);
    }
}
