use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::checker::{CheckType, ProbeRunners};
use super::incident::{IncidentEvaluator, IncidentTransition};
use super::types::ProbeResult;
use crate::config::NotificationChannel;
use crate::database::ResultStore;
use crate::database::models::ProbeRun;

/// One unit of scheduled work: a single check of a single domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeJob {
    pub domain_id: Uuid,
    pub domain_name: String,
    pub check_id: Uuid,
    /// Check type as stored; parsed at execution time
    pub check_type: String,
}

/// The persisted run and the incident change it caused
#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub run: ProbeRun,
    pub transition: IncidentTransition,
}

/// Runs probes, persists their results and drives incident evaluation
pub struct ProbeExecutor {
    runners: ProbeRunners,
    store: Arc<dyn ResultStore>,
    incidents: IncidentEvaluator,
}

impl ProbeExecutor {
    pub fn new(runners: ProbeRunners, store: Arc<dyn ResultStore>, channels: Vec<NotificationChannel>) -> Self {
        let incidents = IncidentEvaluator::new(store.clone(), channels);
        Self { runners, store, incidents }
    }

    /// Execute a job end to end.
    ///
    /// Returns `Ok(None)` when the check type is unknown; nothing is persisted in
    /// that case. Storage errors are returned to the caller.
    pub async fn execute(&self, job: &ProbeJob) -> Result<Option<ProbeOutcome>> {
        self.execute_until(job, std::future::pending()).await
    }

    /// Like [`execute`](Self::execute), but abandons the probe when `cancel`
    /// completes first. Cancellation only covers the network call: once the
    /// runner has returned, the run is persisted and incidents are evaluated.
    pub async fn execute_until<F>(&self, job: &ProbeJob, cancel: F) -> Result<Option<ProbeOutcome>>
    where
        F: Future<Output = ()>,
    {
        let check_type = match job.check_type.parse::<CheckType>() {
            Ok(check_type) => check_type,
            Err(e) => {
                warn!(domain = %job.domain_name, check_id = %job.check_id, "Skipping probe: {}", e);
                return Ok(None);
            }
        };

        debug!("Executing {} probe for {}", check_type, job.domain_name);

        let started_at = Utc::now();
        let start = Instant::now();
        let result = tokio::select! {
            biased;

            result = self.runners.for_type(check_type).run(&job.domain_name) => result,
            _ = cancel => {
                debug!(domain = %job.domain_name, check_type = %check_type, "Probe abandoned on shutdown");
                return Ok(None);
            }
        };
        let elapsed = start.elapsed();
        let completed_at = Utc::now();

        let run = build_probe_run(job, check_type, &result, started_at, completed_at, elapsed);
        self.store.save_probe_run(&run).await?;

        info!(
            domain = %job.domain_name,
            check_type = %check_type,
            success = run.success,
            total_ms = run.total_ms,
            error_code = run.error_code.as_deref().unwrap_or(""),
            "Probe completed"
        );

        let transition = self.incidents.evaluate(job.domain_id, &job.domain_name, check_type, &result).await?;
        Ok(Some(ProbeOutcome { run, transition }))
    }
}

/// Map a runner result onto the stored row
pub fn build_probe_run(
    job: &ProbeJob,
    check_type: CheckType,
    result: &ProbeResult,
    started_at: DateTime<Utc>,
    completed_at: DateTime<Utc>,
    elapsed: Duration,
) -> ProbeRun {
    let total_ms = elapsed.as_millis() as i64;

    ProbeRun {
        id: Uuid::new_v4(),
        domain_id: job.domain_id,
        check_id: job.check_id,
        check_type,
        success: result.success,
        error_code: result.error_code.clone(),
        error_message: result.error_message.clone(),
        dns_ms: (check_type == CheckType::Dns).then_some(total_ms),
        tls_ms: (check_type == CheckType::Tls).then_some(total_ms),
        ttfb_ms: result.ttfb_ms().map(|ms| ms as i64),
        total_ms,
        status_code: result.status_code(),
        snapshot: result.snapshot(),
        started_at,
        completed_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitoring::types::{HttpDetail, ProbeDetail, codes};
    use crate::testing::{MemoryStore, ScriptedRunner, scripted_runners};

    fn job(check_type: &str) -> ProbeJob {
        ProbeJob {
            domain_id: Uuid::new_v4(),
            domain_name: "example.com".into(),
            check_id: Uuid::new_v4(),
            check_type: check_type.into(),
        }
    }

    #[test]
    fn test_build_probe_run_per_type_timings() {
        let now = Utc::now();
        let elapsed = Duration::from_millis(120);

        let dns = ProbeResult::success(ProbeDetail::empty(CheckType::Dns));
        let run = build_probe_run(&job("DNS"), CheckType::Dns, &dns, now, now, elapsed);
        assert_eq!((run.dns_ms, run.tls_ms, run.ttfb_ms, run.total_ms), (Some(120), None, None, 120));

        let tls = ProbeResult::success(ProbeDetail::empty(CheckType::Tls));
        let run = build_probe_run(&job("TLS"), CheckType::Tls, &tls, now, now, elapsed);
        assert_eq!((run.dns_ms, run.tls_ms), (None, Some(120)));

        let http = ProbeResult::success(ProbeDetail::Http(HttpDetail {
            status_code: Some(204),
            ttfb_ms: Some(45),
            ..Default::default()
        }));
        let run = build_probe_run(&job("HTTP"), CheckType::Http, &http, now, now, elapsed);
        assert_eq!((run.dns_ms, run.tls_ms, run.ttfb_ms), (None, None, Some(45)));
        assert_eq!(run.status_code, Some(204));
    }

    #[tokio::test]
    async fn test_execute_persists_run_and_opens_incident() {
        let store = Arc::new(MemoryStore::default());
        let dns = ScriptedRunner::failing(CheckType::Dns, codes::NXDOMAIN, "No DNS records found");
        let executor = ProbeExecutor::new(scripted_runners(dns.clone()), store.clone(), Vec::new());

        let job = job("dns");
        let outcome = executor.execute(&job).await.unwrap().unwrap();

        assert_eq!(dns.calls(), 1);
        assert!(!outcome.run.success);
        assert_eq!(outcome.run.check_type, CheckType::Dns);
        assert_eq!(outcome.run.domain_id, job.domain_id);
        assert!(outcome.run.completed_at >= outcome.run.started_at);
        assert!(matches!(outcome.transition, IncidentTransition::Opened(_)));
        assert_eq!(store.probe_runs().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_check_type_persists_nothing() {
        let store = Arc::new(MemoryStore::default());
        let dns = ScriptedRunner::succeeding(CheckType::Dns);
        let executor = ProbeExecutor::new(scripted_runners(dns.clone()), store.clone(), Vec::new());

        let outcome = executor.execute(&job("SMTP")).await.unwrap();

        assert!(outcome.is_none());
        assert_eq!(dns.calls(), 0);
        assert!(store.probe_runs().is_empty());
        assert!(store.incidents().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_is_returned() {
        let store = Arc::new(MemoryStore::default());
        store.fail_writes(true);
        let executor =
            ProbeExecutor::new(scripted_runners(ScriptedRunner::succeeding(CheckType::Dns)), store.clone(), Vec::new());

        assert!(executor.execute(&job("DNS")).await.is_err());
        assert!(store.incidents().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_abandons_running_probe() {
        let store = Arc::new(MemoryStore::default());
        let slow = ScriptedRunner::slow(CheckType::Tls, Duration::from_secs(30));
        let executor = ProbeExecutor::new(scripted_runners(slow.clone()), store.clone(), Vec::new());

        let outcome = executor.execute_until(&job("TLS"), tokio::time::sleep(Duration::from_secs(1))).await.unwrap();

        assert!(outcome.is_none());
        assert_eq!(slow.calls(), 1);
        assert!(store.probe_runs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_probe_returned_still_evaluates() {
        let store = Arc::new(MemoryStore::default());
        store.set_lookup_delay(Duration::from_millis(500));
        let dns = ScriptedRunner::failing(CheckType::Dns, codes::NXDOMAIN, "No DNS records found");
        let executor = ProbeExecutor::new(scripted_runners(dns), store.clone(), Vec::new());

        let outcome = executor
            .execute_until(&job("DNS"), tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(outcome.transition, IncidentTransition::Opened(_)));
        assert_eq!(store.probe_runs().len(), 1);
        assert_eq!(store.incidents().len(), 1);
    }
}
