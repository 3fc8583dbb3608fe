use anyhow::Result;
use libsql::Connection;

/// Schema version - increment when making schema changes
const SCHEMA_VERSION: i32 = 2;

/// Bring the schema up to [`SCHEMA_VERSION`], applying each missing step once
pub async fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL,
            description TEXT
        )",
        (),
    )
    .await?;

    let current_version = get_current_version(conn).await?;

    if current_version >= SCHEMA_VERSION {
        tracing::debug!("Database schema is up to date (version {})", current_version);
        return Ok(());
    }

    tracing::info!("Running migrations from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        run_migration_v1(conn).await?;
        record_migration(conn, 1, "Initial schema").await?;
    }

    if current_version < 2 {
        run_migration_v2(conn).await?;
        record_migration(conn, 2, "Add scheduler and retention indexes").await?;
    }

    tracing::info!("Database migrations completed successfully (now at version {})", SCHEMA_VERSION);
    Ok(())
}

async fn get_current_version(conn: &Connection) -> Result<i32> {
    let mut rows = conn.query("SELECT MAX(version) FROM schema_migrations", ()).await?;

    if let Some(row) = rows.next().await? {
        let version: Option<i32> = row.get(0)?;
        Ok(version.unwrap_or(0))
    } else {
        Ok(0)
    }
}

async fn record_migration(conn: &Connection, version: i32, description: &str) -> Result<()> {
    let now = chrono::Utc::now().timestamp_millis();

    conn.execute(
        "INSERT INTO schema_migrations (version, applied_at, description) VALUES (?, ?, ?)",
        libsql::params![version, now, description],
    )
    .await?;

    tracing::info!("Applied migration v{}: {}", version, description);
    Ok(())
}

/// Migration v1: domains, checks, probe runs, incidents and the notification outbox
async fn run_migration_v1(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS domains (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            enabled INTEGER NOT NULL DEFAULT 1,
            interval_minutes INTEGER NOT NULL DEFAULT 5,
            group_id TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS checks (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL,
            check_type TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            UNIQUE (domain_id, check_type),
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS probe_runs (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL,
            check_id TEXT NOT NULL,
            check_type TEXT NOT NULL,
            success INTEGER NOT NULL,
            error_code TEXT,
            error_message TEXT,
            dns_ms INTEGER,
            tls_ms INTEGER,
            ttfb_ms INTEGER,
            total_ms INTEGER NOT NULL,
            status_code INTEGER,
            snapshot TEXT,
            started_at INTEGER NOT NULL,
            completed_at INTEGER NOT NULL,
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL,
            check_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            status TEXT NOT NULL,
            reason TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            resolved_at INTEGER,
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS notifications (
            id TEXT PRIMARY KEY,
            domain_id TEXT NOT NULL,
            incident_id TEXT NOT NULL,
            channel TEXT NOT NULL,
            destination TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            created_at INTEGER NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY (domain_id) REFERENCES domains(id) ON DELETE CASCADE
        )",
        (),
    )
    .await?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_checks_domain_id ON checks(domain_id)", ()).await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_probe_runs_domain_started ON probe_runs(domain_id, started_at DESC)",
        (),
    )
    .await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incidents_domain_check_status ON incidents(domain_id, check_type, status)",
        (),
    )
    .await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_notifications_status ON notifications(status, created_at)",
        (),
    )
    .await?;

    Ok(())
}

/// Migration v2: indexes for the scheduler's enabled-domain scan and retention pruning
async fn run_migration_v2(conn: &Connection) -> Result<()> {
    conn.execute("CREATE INDEX IF NOT EXISTS idx_domains_enabled ON domains(enabled)", ()).await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_probe_runs_started_at ON probe_runs(started_at)",
        (),
    )
    .await?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_incidents_resolved_at ON incidents(status, resolved_at)",
        (),
    )
    .await?;

    Ok(())
}
