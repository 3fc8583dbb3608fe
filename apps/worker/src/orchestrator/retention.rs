//! Periodic pruning of old probe runs and resolved incidents.
//!
//! - Probe runs: deleted `probe_run_days` after they started
//! - Resolved incidents: deleted `resolved_incident_days` after resolution
//!
//! Both default to zero, which disables that pruning, so history is only
//! deleted when configured. Open incidents are never touched.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::RetentionSettings;
use crate::database::ResultStore;

/// What one cleanup pass removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub probe_runs: u64,
    pub incidents: u64,
}

/// Cleanup manager for expired results
pub struct RetentionCleanup {
    store: Arc<dyn ResultStore>,
    settings: RetentionSettings,
}

impl RetentionCleanup {
    pub fn new(store: Arc<dyn ResultStore>, settings: RetentionSettings) -> Self {
        Self { store, settings }
    }

    /// Cutoff `days` before `now`, or `None` when pruning is disabled
    fn cutoff(now: DateTime<Utc>, days: u32) -> Option<DateTime<Utc>> {
        (days > 0).then(|| now - chrono::Duration::days(i64::from(days)))
    }

    /// Run one cleanup pass relative to `now`
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();

        if let Some(cutoff) = Self::cutoff(now, self.settings.probe_run_days) {
            debug!("Pruning probe runs started before {}", cutoff);
            report.probe_runs = self.store.prune_probe_runs(cutoff).await?;
        }

        if let Some(cutoff) = Self::cutoff(now, self.settings.resolved_incident_days) {
            debug!("Pruning incidents resolved before {}", cutoff);
            report.incidents = self.store.prune_resolved_incidents(cutoff).await?;
        }

        Ok(report)
    }

    /// Clean up every `cleanup_interval_secs` until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            probe_run_days = self.settings.probe_run_days,
            resolved_incident_days = self.settings.resolved_incident_days,
            "Retention cleanup started"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.settings.cleanup_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.cleanup_expired(Utc::now()).await {
                        Ok(report) if report.probe_runs + report.incidents > 0 => {
                            info!(
                                "Retention cleanup deleted {} probe runs and {} incidents",
                                report.probe_runs, report.incidents
                            );
                        }
                        Ok(_) => debug!("Retention cleanup found nothing to delete"),
                        Err(e) => warn!("Retention cleanup failed: {:#}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Retention cleanup stopped");
                        break;
                    }
                }
            }
        }
    }
}
