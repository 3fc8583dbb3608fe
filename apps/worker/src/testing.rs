//! In-memory collaborators for scheduler, executor and incident tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::database::models::{Check, Domain, Incident, IncidentStatus, Notification, ProbeRun};
use crate::database::{ConfigStore, ResultStore};
use crate::monitoring::checker::{CheckType, ProbeRunner, ProbeRunners};
use crate::monitoring::types::{ProbeDetail, ProbeResult};

#[derive(Default)]
struct State {
    domains: Vec<(Domain, Vec<Check>)>,
    probe_runs: Vec<ProbeRun>,
    incidents: Vec<Incident>,
    notifications: Vec<Notification>,
}

/// Config and result store backed by vectors
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_config: AtomicBool,
    fail_writes: AtomicBool,
    fail_notifications: AtomicBool,
    lookup_delay: Mutex<Duration>,
}

impl MemoryStore {
    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_domain(&self, name: &str, interval_minutes: u32) -> (Domain, Vec<Check>) {
        self.add_domain_with_checks(name, interval_minutes, &CheckType::ALL)
    }

    pub fn add_domain_with_checks(
        &self,
        name: &str,
        interval_minutes: u32,
        check_types: &[CheckType],
    ) -> (Domain, Vec<Check>) {
        let mut domain = Domain::new(name.to_string());
        domain.interval_minutes = interval_minutes;
        let checks: Vec<Check> = check_types.iter().map(|ct| Check::new(domain.id, *ct)).collect();
        self.state().domains.push((domain.clone(), checks.clone()));
        (domain, checks)
    }

    /// Add a check row with a type no runner knows about
    pub fn add_raw_check(&self, domain_id: Uuid, check_type: &str) {
        let mut state = self.state();
        if let Some((_, checks)) = state.domains.iter_mut().find(|(d, _)| d.id == domain_id) {
            checks.push(Check { id: Uuid::new_v4(), domain_id, check_type: check_type.into(), enabled: true });
        }
    }

    pub fn set_domain_enabled(&self, domain_id: Uuid, enabled: bool) {
        let mut state = self.state();
        if let Some((domain, _)) = state.domains.iter_mut().find(|(d, _)| d.id == domain_id) {
            domain.enabled = enabled;
        }
    }

    pub fn set_interval(&self, domain_id: Uuid, interval_minutes: u32) {
        let mut state = self.state();
        if let Some((domain, _)) = state.domains.iter_mut().find(|(d, _)| d.id == domain_id) {
            domain.interval_minutes = interval_minutes;
        }
    }

    pub fn set_check_enabled(&self, domain_id: Uuid, check_type: CheckType, enabled: bool) {
        let mut state = self.state();
        if let Some((_, checks)) = state.domains.iter_mut().find(|(d, _)| d.id == domain_id) {
            for check in checks.iter_mut().filter(|c| c.check_type == check_type.as_str()) {
                check.enabled = enabled;
            }
        }
    }

    pub fn remove_domain(&self, domain_id: Uuid) {
        self.state().domains.retain(|(d, _)| d.id != domain_id);
    }

    pub fn fail_config(&self, fail: bool) {
        self.fail_config.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_notifications(&self, fail: bool) {
        self.fail_notifications.store(fail, Ordering::SeqCst);
    }

    /// Make `find_open_incidents` yield for `delay` before answering
    pub fn set_lookup_delay(&self, delay: Duration) {
        *self.lookup_delay.lock().unwrap() = delay;
    }

    pub fn probe_runs(&self) -> Vec<ProbeRun> {
        self.state().probe_runs.clone()
    }

    pub fn incidents(&self) -> Vec<Incident> {
        self.state().incidents.clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state().notifications.clone()
    }

    pub fn open_incident_count(&self, domain_id: Uuid, check_type: CheckType) -> usize {
        self.state()
            .incidents
            .iter()
            .filter(|i| i.domain_id == domain_id && i.check_type == check_type && i.status == IncidentStatus::Open)
            .count()
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn list_enabled_domains_with_enabled_checks(&self) -> Result<Vec<(Domain, Vec<Check>)>> {
        if self.fail_config.load(Ordering::SeqCst) {
            bail!("config store unavailable");
        }
        Ok(self
            .state()
            .domains
            .iter()
            .filter(|(d, _)| d.enabled)
            .map(|(d, checks)| (d.clone(), checks.iter().filter(|c| c.enabled).cloned().collect()))
            .collect())
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn save_probe_run(&self, run: &ProbeRun) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("result store unavailable");
        }
        self.state().probe_runs.push(run.clone());
        Ok(())
    }

    async fn find_open_incidents(&self, domain_id: Uuid, check_type: CheckType) -> Result<Vec<Incident>> {
        let delay = *self.lookup_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .state()
            .incidents
            .iter()
            .filter(|i| i.domain_id == domain_id && i.check_type == check_type && i.is_open())
            .cloned()
            .collect())
    }

    async fn save_incident(&self, incident: &Incident) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("result store unavailable");
        }
        let mut state = self.state();
        match state.incidents.iter_mut().find(|i| i.id == incident.id) {
            Some(existing) => *existing = incident.clone(),
            None => state.incidents.push(incident.clone()),
        }
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
        if self.fail_notifications.load(Ordering::SeqCst) {
            bail!("outbox unavailable");
        }
        let notification = Notification::pending(domain_id, incident_id, channel, destination, payload);
        let id = notification.id;
        self.state().notifications.push(notification);
        Ok(id)
    }

    async fn prune_probe_runs(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let before = state.probe_runs.len();
        state.probe_runs.retain(|r| r.started_at >= cutoff);
        Ok((before - state.probe_runs.len()) as u64)
    }

    async fn prune_resolved_incidents(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state();
        let before = state.incidents.len();
        state
            .incidents
            .retain(|i| !(i.status == IncidentStatus::Resolved && i.resolved_at.is_some_and(|at| at < cutoff)));
        Ok((before - state.incidents.len()) as u64)
    }
}

enum Behavior {
    Succeed,
    Fail { code: String, message: String },
    Panic,
}

/// Probe runner that records every call and replays a fixed outcome
pub struct ScriptedRunner {
    check_type: CheckType,
    behavior: Behavior,
    /// Outcomes served before falling back to `behavior`
    script: Mutex<VecDeque<ProbeResult>>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fire_times: Mutex<Vec<Instant>>,
}

impl ScriptedRunner {
    fn build(check_type: CheckType, behavior: Behavior, delay: Duration) -> Self {
        Self {
            check_type,
            behavior,
            script: Mutex::new(VecDeque::new()),
            delay,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            fire_times: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(check_type: CheckType) -> Arc<Self> {
        Arc::new(Self::build(check_type, Behavior::Succeed, Duration::ZERO))
    }

    pub fn failing(check_type: CheckType, code: &str, message: &str) -> Arc<Self> {
        let behavior = Behavior::Fail { code: code.into(), message: message.into() };
        Arc::new(Self::build(check_type, behavior, Duration::ZERO))
    }

    pub fn slow(check_type: CheckType, delay: Duration) -> Arc<Self> {
        Arc::new(Self::build(check_type, Behavior::Succeed, delay))
    }

    pub fn panicking(check_type: CheckType) -> Arc<Self> {
        Arc::new(Self::build(check_type, Behavior::Panic, Duration::ZERO))
    }

    /// Serve `results` in order, then succeed
    pub fn scripted(check_type: CheckType, results: Vec<ProbeResult>) -> Arc<Self> {
        let runner = Self::build(check_type, Behavior::Succeed, Duration::ZERO);
        *runner.script.lock().unwrap() = results.into();
        Arc::new(runner)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fire_times(&self) -> Vec<Instant> {
        self.fire_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProbeRunner for ScriptedRunner {
    async fn run(&self, _target: &str) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.fire_times.lock().unwrap().push(Instant::now());
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(result) = self.script.lock().unwrap().pop_front() {
            return result.with_duration(self.delay);
        }

        let result = match &self.behavior {
            Behavior::Succeed => ProbeResult::success(ProbeDetail::empty(self.check_type)),
            Behavior::Fail { code, message } => {
                ProbeResult::failure(ProbeDetail::empty(self.check_type), code.clone(), message.clone())
            }
            Behavior::Panic => panic!("scripted {} runner panicked", self.check_type),
        };
        result.with_duration(self.delay)
    }
}

/// The same runner for every check type
pub fn scripted_runners(runner: Arc<ScriptedRunner>) -> ProbeRunners {
    ProbeRunners { dns: runner.clone(), tls: runner.clone(), http: runner }
}
