use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use uuid::Uuid;

use super::models::{
    Check, Domain, Incident, Notification, ProbeRun, from_millis, to_millis,
};
use crate::monitoring::checker::CheckType;
use crate::monitoring::validation::{DomainError, normalize_domain_name, validate_domain_name, validate_interval};
use crate::pool::{LibsqlManager, LibsqlPool};

/// Read side used by the scheduler
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Every enabled domain paired with its enabled checks; domains without an
    /// enabled check are included with an empty list
    async fn list_enabled_domains_with_enabled_checks(&self) -> Result<Vec<(Domain, Vec<Check>)>>;
}

/// Write side used by the executor, the incident evaluator and retention
#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save_probe_run(&self, run: &ProbeRun) -> Result<()>;

    async fn find_open_incidents(&self, domain_id: Uuid, check_type: CheckType) -> Result<Vec<Incident>>;

    /// Insert or update by id
    async fn save_incident(&self, incident: &Incident) -> Result<()>;

    /// Write a PENDING outbox row and return its id
    async fn enqueue_notification(
        &self,
        domain_id: Uuid,
        incident_id: Uuid,
        channel: &str,
        destination: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid>;

    /// Delete probe runs started before `cutoff`
    async fn prune_probe_runs(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete resolved incidents resolved before `cutoff`
    async fn prune_resolved_incidents(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// LibSQL database implementation
pub struct DatabaseImpl {
    pool: LibsqlPool,
}

impl DatabaseImpl {
    pub fn new_from_pool(pool: LibsqlPool) -> Self {
        Self { pool }
    }

    async fn get_conn(&self) -> Result<deadpool::managed::Object<LibsqlManager>> {
        Ok(self.pool.get().await?)
    }

    /// Register a domain with one enabled check of every type
    pub async fn create_domain(&self, input: &str, interval_minutes: u32) -> Result<(Domain, Vec<Check>)> {
        let name = validate_domain_name(input)?;
        let interval_minutes = validate_interval(interval_minutes)?;

        if self.find_domain_by_name(&name).await?.is_some() {
            return Err(DomainError::AlreadyExists(name).into());
        }

        let mut domain = Domain::new(name);
        domain.interval_minutes = interval_minutes;
        let checks: Vec<Check> = CheckType::ALL.iter().map(|ct| Check::new(domain.id, *ct)).collect();

        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            "INSERT INTO domains (id, name, enabled, interval_minutes, group_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                domain.id.to_string(),
                domain.name.clone(),
                domain.enabled as i64,
                domain.interval_minutes as i64,
                domain.group_id.map(|id| id.to_string()),
                to_millis(domain.created_at),
                to_millis(domain.updated_at)
            ],
        )
        .await?;
        for check in &checks {
            tx.execute(
                "INSERT INTO checks (id, domain_id, check_type, enabled) VALUES (?, ?, ?, ?)",
                params![check.id.to_string(), check.domain_id.to_string(), check.check_type.clone(), check.enabled as i64],
            )
            .await?;
        }
        tx.commit().await?;

        tracing::info!(domain = %domain.name, id = %domain.id, "Domain registered");
        Ok((domain, checks))
    }

    pub async fn list_domains(&self) -> Result<Vec<(Domain, Vec<Check>)>> {
        let conn = self.get_conn().await?;
        let domains = query_domains(&conn, "SELECT id, name, enabled, interval_minutes, group_id, created_at, updated_at FROM domains ORDER BY name").await?;
        let checks = query_checks(&conn, "SELECT id, domain_id, check_type, enabled FROM checks ORDER BY check_type").await?;
        Ok(group_checks(domains, checks))
    }

    pub async fn find_domain_by_name(&self, input: &str) -> Result<Option<Domain>> {
        let name = normalize_domain_name(input);
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, name, enabled, interval_minutes, group_id, created_at, updated_at FROM domains WHERE name = ?",
                params![name],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(domain_from_row(&row)?)),
            None => Ok(None),
        }
    }

    async fn require_domain(&self, input: &str) -> Result<Domain> {
        self.find_domain_by_name(input)
            .await?
            .ok_or_else(|| DomainError::NotFound(normalize_domain_name(input)).into())
    }

    pub async fn set_domain_enabled(&self, input: &str, enabled: bool) -> Result<Domain> {
        let mut domain = self.require_domain(input).await?;
        domain.enabled = enabled;
        domain.updated_at = Utc::now();

        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE domains SET enabled = ?, updated_at = ? WHERE id = ?",
            params![enabled as i64, to_millis(domain.updated_at), domain.id.to_string()],
        )
        .await?;
        Ok(domain)
    }

    pub async fn set_domain_interval(&self, input: &str, interval_minutes: u32) -> Result<Domain> {
        let interval_minutes = validate_interval(interval_minutes)?;
        let mut domain = self.require_domain(input).await?;
        domain.interval_minutes = interval_minutes;
        domain.updated_at = Utc::now();

        let conn = self.get_conn().await?;
        conn.execute(
            "UPDATE domains SET interval_minutes = ?, updated_at = ? WHERE id = ?",
            params![interval_minutes as i64, to_millis(domain.updated_at), domain.id.to_string()],
        )
        .await?;
        Ok(domain)
    }

    pub async fn set_check_enabled(&self, input: &str, check_type: CheckType, enabled: bool) -> Result<()> {
        let domain = self.require_domain(input).await?;
        let conn = self.get_conn().await?;
        let changed = conn
            .execute(
                "UPDATE checks SET enabled = ? WHERE domain_id = ? AND check_type = ?",
                params![enabled as i64, domain.id.to_string(), check_type.as_str()],
            )
            .await?;

        if changed == 0 {
            anyhow::bail!("Domain {} has no {} check", domain.name, check_type);
        }
        Ok(())
    }

    /// Remove a domain and everything recorded for it
    pub async fn delete_domain(&self, input: &str) -> Result<Domain> {
        let domain = self.require_domain(input).await?;
        let id = domain.id.to_string();

        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        for table in ["notifications", "incidents", "probe_runs", "checks"] {
            tx.execute(&format!("DELETE FROM {table} WHERE domain_id = ?"), params![id.clone()]).await?;
        }
        tx.execute("DELETE FROM domains WHERE id = ?", params![id]).await?;
        tx.commit().await?;

        tracing::info!(domain = %domain.name, "Domain deleted");
        Ok(domain)
    }

    pub async fn recent_probe_runs(&self, domain_id: Option<Uuid>, limit: usize) -> Result<Vec<ProbeRun>> {
        const COLUMNS: &str = "id, domain_id, check_id, check_type, success, error_code, error_message, dns_ms, tls_ms, ttfb_ms, total_ms, status_code, snapshot, started_at, completed_at";

        let conn = self.get_conn().await?;
        let mut rows = match domain_id {
            Some(id) => {
                conn.query(
                    &format!("SELECT {COLUMNS} FROM probe_runs WHERE domain_id = ? ORDER BY started_at DESC LIMIT ?"),
                    params![id.to_string(), limit as i64],
                )
                .await?
            }
            None => {
                conn.query(
                    &format!("SELECT {COLUMNS} FROM probe_runs ORDER BY started_at DESC LIMIT ?"),
                    params![limit as i64],
                )
                .await?
            }
        };

        let mut runs = Vec::new();
        while let Some(row) = rows.next().await? {
            runs.push(probe_run_from_row(&row)?);
        }
        Ok(runs)
    }

    pub async fn list_incidents(&self, open_only: bool, limit: usize) -> Result<Vec<Incident>> {
        let sql = if open_only {
            "SELECT id, domain_id, check_type, severity, status, reason, started_at, resolved_at FROM incidents WHERE status = 'OPEN' ORDER BY started_at DESC LIMIT ?"
        } else {
            "SELECT id, domain_id, check_type, severity, status, reason, started_at, resolved_at FROM incidents ORDER BY started_at DESC LIMIT ?"
        };

        let conn = self.get_conn().await?;
        let mut rows = conn.query(sql, params![limit as i64]).await?;
        let mut incidents = Vec::new();
        while let Some(row) = rows.next().await? {
            incidents.push(incident_from_row(&row)?);
        }
        Ok(incidents)
    }

    pub async fn pending_notifications(&self, limit: usize) -> Result<Vec<Notification>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, domain_id, incident_id, channel, destination, payload, status, created_at, retry_count FROM notifications WHERE status = 'PENDING' ORDER BY created_at LIMIT ?",
                params![limit as i64],
            )
            .await?;

        let mut notifications = Vec::new();
        while let Some(row) = rows.next().await? {
            notifications.push(notification_from_row(&row)?);
        }
        Ok(notifications)
    }
}

#[async_trait]
impl ConfigStore for DatabaseImpl {
    async fn list_enabled_domains_with_enabled_checks(&self) -> Result<Vec<(Domain, Vec<Check>)>> {
        let conn = self.get_conn().await?;
        let domains = query_domains(
            &conn,
            "SELECT id, name, enabled, interval_minutes, group_id, created_at, updated_at FROM domains WHERE enabled = 1 ORDER BY name",
        )
        .await?;
        let checks = query_checks(
            &conn,
            "SELECT c.id, c.domain_id, c.check_type, c.enabled FROM checks c JOIN domains d ON d.id = c.domain_id WHERE d.enabled = 1 AND c.enabled = 1 ORDER BY c.check_type",
        )
        .await?;
        Ok(group_checks(domains, checks))
    }
}

#[async_trait]
impl ResultStore for DatabaseImpl {
    async fn save_probe_run(&self, run: &ProbeRun) -> Result<()> {
        let snapshot = run.snapshot.as_ref().map(serde_json::to_string).transpose()?;

        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO probe_runs (id, domain_id, check_id, check_type, success, error_code, error_message, dns_ms, tls_ms, ttfb_ms, total_ms, status_code, snapshot, started_at, completed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                run.id.to_string(),
                run.domain_id.to_string(),
                run.check_id.to_string(),
                run.check_type.as_str(),
                run.success as i64,
                run.error_code.clone(),
                run.error_message.clone(),
                run.dns_ms,
                run.tls_ms,
                run.ttfb_ms,
                run.total_ms,
                run.status_code.map(|v| v as i64),
                snapshot,
                to_millis(run.started_at),
                to_millis(run.completed_at)
            ],
        )
        .await?;
        Ok(())
    }

    async fn find_open_incidents(&self, domain_id: Uuid, check_type: CheckType) -> Result<Vec<Incident>> {
        let conn = self.get_conn().await?;
        let mut rows = conn
            .query(
                "SELECT id, domain_id, check_type, severity, status, reason, started_at, resolved_at FROM incidents WHERE domain_id = ? AND check_type = ? AND status = 'OPEN' ORDER BY started_at",
                params![domain_id.to_string(), check_type.as_str()],
            )
            .await?;

        let mut incidents = Vec::new();
        while let Some(row) = rows.next().await? {
            incidents.push(incident_from_row(&row)?);
        }
        Ok(incidents)
    }

    async fn save_incident(&self, incident: &Incident) -> Result<()> {
        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO incidents (id, domain_id, check_type, severity, status, reason, started_at, resolved_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET severity = excluded.severity, status = excluded.status, reason = excluded.reason, resolved_at = excluded.resolved_at",
            params![
                incident.id.to_string(),
                incident.domain_id.to_string(),
                incident.check_type.as_str(),
                incident.severity.as_str(),
                incident.status.as_str(),
                incident.reason.clone(),
                to_millis(incident.started_at),
                incident.resolved_at.map(to_millis)
            ],
        )
        .await?;
        Ok(())
    }

    async fn enqueue_notification(
        &self,
        domain_id: Uuid,
        incident_id: Uuid,
        channel: &str,
        destination: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let notification = Notification::pending(domain_id, incident_id, channel, destination, payload);

        let conn = self.get_conn().await?;
        conn.execute(
            "INSERT INTO notifications (id, domain_id, incident_id, channel, destination, payload, status, created_at, retry_count) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                notification.id.to_string(),
                notification.domain_id.to_string(),
                notification.incident_id.to_string(),
                notification.channel.clone(),
                notification.destination.clone(),
                notification.payload.to_string(),
                notification.status.as_str(),
                to_millis(notification.created_at),
                notification.retry_count as i64
            ],
        )
        .await?;
        Ok(notification.id)
    }

    async fn prune_probe_runs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.get_conn().await?;
        let deleted =
            conn.execute("DELETE FROM probe_runs WHERE started_at < ?", params![to_millis(cutoff)]).await?;
        Ok(deleted)
    }

    async fn prune_resolved_incidents(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let conn = self.get_conn().await?;
        let tx = conn.transaction().await?;
        tx.execute(
            "DELETE FROM notifications WHERE incident_id IN (SELECT id FROM incidents WHERE status = 'RESOLVED' AND resolved_at < ?)",
            params![to_millis(cutoff)],
        )
        .await?;
        let deleted = tx
            .execute(
                "DELETE FROM incidents WHERE status = 'RESOLVED' AND resolved_at < ?",
                params![to_millis(cutoff)],
            )
            .await?;
        tx.commit().await?;
        Ok(deleted)
    }
}

async fn query_domains(conn: &Connection, sql: &str) -> Result<Vec<Domain>> {
    let mut rows = conn.query(sql, ()).await?;
    let mut domains = Vec::new();
    while let Some(row) = rows.next().await? {
        domains.push(domain_from_row(&row)?);
    }
    Ok(domains)
}

async fn query_checks(conn: &Connection, sql: &str) -> Result<Vec<Check>> {
    let mut rows = conn.query(sql, ()).await?;
    let mut checks = Vec::new();
    while let Some(row) = rows.next().await? {
        checks.push(Check {
            id: parse_uuid(&row, 0)?,
            domain_id: parse_uuid(&row, 1)?,
            check_type: row.get(2)?,
            enabled: row.get::<i64>(3)? != 0,
        });
    }
    Ok(checks)
}

/// Attach checks to their domains, preserving domain order
fn group_checks(domains: Vec<Domain>, checks: Vec<Check>) -> Vec<(Domain, Vec<Check>)> {
    let mut grouped: Vec<(Domain, Vec<Check>)> = domains.into_iter().map(|d| (d, Vec::new())).collect();
    for check in checks {
        if let Some((_, list)) = grouped.iter_mut().find(|(d, _)| d.id == check.domain_id) {
            list.push(check);
        }
    }
    grouped
}

fn parse_uuid(row: &Row, index: i32) -> Result<Uuid> {
    let raw: String = row.get(index)?;
    Uuid::parse_str(&raw).with_context(|| format!("Invalid UUID in column {index}: {raw}"))
}

fn domain_from_row(row: &Row) -> Result<Domain> {
    let group_id = row
        .get::<Option<String>>(4)?
        .map(|raw| Uuid::parse_str(&raw))
        .transpose()?;

    Ok(Domain {
        id: parse_uuid(row, 0)?,
        name: row.get(1)?,
        enabled: row.get::<i64>(2)? != 0,
        interval_minutes: row.get::<i64>(3)? as u32,
        group_id,
        created_at: from_millis(row.get(5)?),
        updated_at: from_millis(row.get(6)?),
    })
}

fn probe_run_from_row(row: &Row) -> Result<ProbeRun> {
    let snapshot = row
        .get::<Option<String>>(12)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;

    Ok(ProbeRun {
        id: parse_uuid(row, 0)?,
        domain_id: parse_uuid(row, 1)?,
        check_id: parse_uuid(row, 2)?,
        check_type: row.get::<String>(3)?.parse()?,
        success: row.get::<i64>(4)? != 0,
        error_code: row.get(5)?,
        error_message: row.get(6)?,
        dns_ms: row.get(7)?,
        tls_ms: row.get(8)?,
        ttfb_ms: row.get(9)?,
        total_ms: row.get(10)?,
        status_code: row.get::<Option<i64>>(11)?.map(|v| v as u16),
        snapshot,
        started_at: from_millis(row.get(13)?),
        completed_at: from_millis(row.get(14)?),
    })
}

fn incident_from_row(row: &Row) -> Result<Incident> {
    Ok(Incident {
        id: parse_uuid(row, 0)?,
        domain_id: parse_uuid(row, 1)?,
        check_type: row.get::<String>(2)?.parse()?,
        severity: row.get::<String>(3)?.parse()?,
        status: row.get::<String>(4)?.parse()?,
        reason: row.get(5)?,
        started_at: from_millis(row.get(6)?),
        resolved_at: row.get::<Option<i64>>(7)?.map(from_millis),
    })
}

fn notification_from_row(row: &Row) -> Result<Notification> {
    Ok(Notification {
        id: parse_uuid(row, 0)?,
        domain_id: parse_uuid(row, 1)?,
        incident_id: parse_uuid(row, 2)?,
        channel: row.get(3)?,
        destination: row.get(4)?,
        payload: serde_json::from_str(&row.get::<String>(5)?)?,
        status: row.get::<String>(6)?.parse()?,
        created_at: from_millis(row.get(7)?),
        retry_count: row.get::<i64>(8)? as u32,
    })
}
