use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::executor::{ProbeExecutor, ProbeJob};
use crate::config::SchedulerSettings;
use crate::database::ConfigStore;

/// Identity of a recurring job: one domain, one check type
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobKey {
    pub domain_id: Uuid,
    pub check_type: String,
}

#[derive(Debug)]
struct ScheduledJob {
    job: ProbeJob,
    interval: Duration,
    next_fire: Instant,
}

/// What one reconciliation pass changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub total: usize,
}

type InFlight = Arc<Mutex<HashSet<JobKey>>>;

/// Clears a key from the in-flight set when the job finishes, panics or is aborted
struct InFlightGuard {
    in_flight: InFlight,
    key: JobKey,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut set = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        set.remove(&self.key);
    }
}

/// Keeps one timer per (domain, enabled check) pair in sync with the
/// configuration store and dispatches due jobs onto a bounded pool.
pub struct ProbeScheduler {
    config_store: Arc<dyn ConfigStore>,
    executor: Arc<ProbeExecutor>,
    settings: SchedulerSettings,
    jobs: HashMap<JobKey, ScheduledJob>,
    in_flight: InFlight,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
    /// Flipped on shutdown; running jobs drop their probe but finish bookkeeping
    cancel: watch::Sender<bool>,
}

impl ProbeScheduler {
    pub fn new(config_store: Arc<dyn ConfigStore>, executor: Arc<ProbeExecutor>, settings: SchedulerSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_concurrent_probes.max(1)));
        Self {
            config_store,
            executor,
            settings,
            jobs: HashMap::new(),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            permits,
            tasks: JoinSet::new(),
            cancel: watch::Sender::new(false),
        }
    }

    /// Drive reconciliation and dispatch until `shutdown` flips to `true`.
    ///
    /// On shutdown, probes still waiting on the network are abandoned. Jobs whose
    /// probe already returned are awaited so their run and incident state land
    /// together.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            max_concurrent = self.settings.max_concurrent_probes,
            reconcile_secs = self.settings.reconcile_interval_secs,
            "Probe scheduler started"
        );

        let mut reconcile_timer = interval(self.settings.reconcile_interval());
        reconcile_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut dispatch_timer = interval(self.settings.tick_interval());
        dispatch_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Probe scheduler shutting down");
                        break;
                    }
                }
                _ = reconcile_timer.tick() => {
                    match self.reconcile().await {
                        Ok(summary) if summary.added + summary.removed + summary.updated > 0 => {
                            info!(
                                added = summary.added,
                                updated = summary.updated,
                                removed = summary.removed,
                                total = summary.total,
                                "Schedule reconciled"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Schedule reconciliation failed, keeping current jobs: {:#}", e),
                    }
                    self.dispatch_due(Instant::now());
                }
                _ = dispatch_timer.tick() => {
                    self.dispatch_due(Instant::now());
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!("Probe task panicked: {}", e);
                        }
                    }
                }
            }
        }

        self.cancel.send_replace(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    error!("Probe task panicked: {}", e);
                }
            }
        }
        info!("Probe scheduler stopped");
    }

    /// Bring the job map in line with the enabled domains and checks
    pub async fn reconcile(&mut self) -> Result<ReconcileSummary> {
        let domains = self.config_store.list_enabled_domains_with_enabled_checks().await?;
        let now = Instant::now();

        let mut desired: HashMap<JobKey, (ProbeJob, Duration)> = HashMap::new();
        for (domain, checks) in domains {
            if !domain.enabled {
                continue;
            }
            let interval = Duration::from_secs(u64::from(domain.interval_minutes.max(1)) * 60);
            for check in checks.into_iter().filter(|c| c.enabled) {
                let key = JobKey { domain_id: domain.id, check_type: check.check_type.clone() };
                let job = ProbeJob {
                    domain_id: domain.id,
                    domain_name: domain.name.clone(),
                    check_id: check.id,
                    check_type: check.check_type,
                };
                desired.insert(key, (job, interval));
            }
        }

        let mut summary = ReconcileSummary::default();

        self.jobs.retain(|key, scheduled| {
            let keep = desired.contains_key(key);
            if !keep {
                debug!(domain = %scheduled.job.domain_name, check_type = %key.check_type, "Job cancelled");
                summary.removed += 1;
            }
            keep
        });

        for (key, (job, interval)) in desired {
            match self.jobs.get_mut(&key) {
                Some(scheduled) => {
                    if scheduled.interval != interval {
                        // Keep the phase: the next run is the last run plus the new interval.
                        let last_fire = scheduled.next_fire.checked_sub(scheduled.interval).unwrap_or(now);
                        scheduled.next_fire = last_fire + interval;
                        scheduled.interval = interval;
                        summary.updated += 1;
                    } else if scheduled.job != job {
                        summary.updated += 1;
                    }
                    scheduled.job = job;
                }
                None => {
                    debug!(domain = %job.domain_name, check_type = %key.check_type, "Job scheduled");
                    self.jobs.insert(key, ScheduledJob { job, interval, next_fire: now });
                    summary.added += 1;
                }
            }
        }

        summary.total = self.jobs.len();
        Ok(summary)
    }

    /// Start every job whose fire time has arrived; returns how many were started
    pub fn dispatch_due(&mut self, now: Instant) -> usize {
        let mut started = 0;

        for (key, scheduled) in self.jobs.iter_mut() {
            if scheduled.next_fire > now {
                continue;
            }

            scheduled.next_fire += scheduled.interval;
            if scheduled.next_fire <= now {
                scheduled.next_fire = now + scheduled.interval;
            }

            {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                if !in_flight.insert(key.clone()) {
                    warn!(
                        domain = %scheduled.job.domain_name,
                        check_type = %key.check_type,
                        "Previous run still in flight, skipping this firing"
                    );
                    continue;
                }
            }

            let guard = InFlightGuard { in_flight: self.in_flight.clone(), key: key.clone() };
            let permits = self.permits.clone();
            let executor = self.executor.clone();
            let job = scheduled.job.clone();
            let cancel = self.cancel.subscribe();

            self.tasks.spawn(async move {
                let _guard = guard;
                let permit = tokio::select! {
                    biased;

                    _ = cancelled(cancel.clone()) => return,
                    permit = permits.acquire_owned() => permit,
                };
                let Ok(_permit) = permit else {
                    return;
                };
                if let Err(e) = executor.execute_until(&job, cancelled(cancel)).await {
                    error!(
                        domain = %job.domain_name,
                        check_type = %job.check_type,
                        "Probe job failed: {:#}",
                        e
                    );
                }
            });
            started += 1;
        }

        started
    }

    #[cfg(test)]
    pub fn scheduled_keys(&self) -> Vec<JobKey> {
        let mut keys: Vec<JobKey> = self.jobs.keys().cloned().collect();
        keys.sort();
        keys
    }

    #[cfg(test)]
    pub fn interval_of(&self, key: &JobKey) -> Option<Duration> {
        self.jobs.get(key).map(|scheduled| scheduled.interval)
    }
}

/// Resolves once the cancel flag is set or its sender is gone
async fn cancelled(mut cancel: watch::Receiver<bool>) {
    while !*cancel.borrow_and_update() {
        if cancel.changed().await.is_err() {
            return;
        }
    }
}
