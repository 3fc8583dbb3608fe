/// Orchestrator module - coordinates all components
///
/// The orchestrator owns the worker lifecycle:
/// - Initializes the schema and wires storage, runners and the executor
/// - Runs the probe scheduler and the retention cleanup side by side
/// - Stops both from a single shutdown signal
pub mod retention;


pub use retention::{CleanupReport, RetentionCleanup};

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::Config;
use crate::database::{DatabaseImpl, initialize_database};
use crate::monitoring::validation::{DomainError, normalize_domain_name};
use crate::monitoring::{ProbeExecutor, ProbeJob, ProbeOutcome, ProbeRunners, ProbeScheduler};
use crate::pool::LibsqlPool;

/// Main orchestrator for the probe worker
pub struct Orchestrator {
    config: Arc<Config>,
    database: Arc<DatabaseImpl>,
    executor: Arc<ProbeExecutor>,
}

impl Orchestrator {
    /// Create the orchestrator and run it until Ctrl-C
    pub async fn start(config: Config, pool: LibsqlPool) -> Result<()> {
        let orchestrator = Self::new(config, pool).await?;
        orchestrator
            .run_until(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
            })
            .await
    }

    /// Initialize the schema and build the network runners from config
    pub async fn new(config: Config, pool: LibsqlPool) -> Result<Self> {
        let conn = pool.get().await?;
        info!("Initializing database schema...");
        initialize_database(&conn).await?;
        drop(conn);

        let database = Arc::new(DatabaseImpl::new_from_pool(pool));
        let runners = ProbeRunners::from_settings(&config.probes)?;
        Ok(Self::with_runners(config, database, runners))
    }

    /// Wire an orchestrator around an already initialized database
    pub fn with_runners(config: Config, database: Arc<DatabaseImpl>, runners: ProbeRunners) -> Self {
        let executor = Arc::new(ProbeExecutor::new(
            runners,
            database.clone(),
            config.notifications.channels.clone(),
        ));
        Self { config: Arc::new(config), database, executor }
    }

    #[cfg(test)]
    pub fn database(&self) -> &Arc<DatabaseImpl> {
        &self.database
    }

    /// Run the scheduler and retention loops until `signal` completes
    pub async fn run_until<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Starting probe worker...");
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler =
            ProbeScheduler::new(self.database.clone(), self.executor.clone(), self.config.scheduler.clone());
        let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx.clone()));

        let retention = RetentionCleanup::new(self.database.clone(), self.config.retention.clone());
        let retention_handle = tokio::spawn(retention.run(shutdown_rx));

        signal.await;
        info!("Shutdown requested, stopping background tasks");
        shutdown_tx.send_replace(true);

        if let Err(e) = scheduler_handle.await {
            error!("Scheduler task ended abnormally: {}", e);
        }
        if let Err(e) = retention_handle.await {
            error!("Retention task ended abnormally: {}", e);
        }

        info!("Probe worker stopped");
        Ok(())
    }

    /// Run every enabled check of one domain right now, outside the schedule
    pub async fn probe_now(&self, domain: &str) -> Result<Vec<ProbeOutcome>> {
        let name = normalize_domain_name(domain);
        let (domain, checks) = self
            .database
            .list_domains()
            .await?
            .into_iter()
            .find(|(d, _)| d.name == name)
            .ok_or(DomainError::NotFound(name))?;

        let mut outcomes = Vec::new();
        for check in checks.into_iter().filter(|c| c.enabled) {
            let job = ProbeJob {
                domain_id: domain.id,
                domain_name: domain.name.clone(),
                check_id: check.id,
                check_type: check.check_type,
            };
            if let Some(outcome) = self.executor.execute(&job).await? {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }
}
