//! OPEN/RESOLVED incident tracking per (domain, check type).
//!
//! A failed probe opens an incident unless one is already open for the key; a
//! successful probe resolves every open incident for the key. Opening an
//! incident also queues one outbox row per configured notification channel.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::checker::CheckType;
use super::types::{ProbeResult, codes};
use crate::config::NotificationChannel;
use crate::database::ResultStore;
use crate::database::models::{Incident, Severity};

/// What an evaluation changed
#[derive(Debug, Clone, PartialEq)]
pub enum IncidentTransition {
    /// No incident state changed
    Unchanged,
    Opened(Incident),
    Resolved(Vec<Incident>),
}

pub struct IncidentEvaluator {
    store: Arc<dyn ResultStore>,
    channels: Vec<NotificationChannel>,
}

impl IncidentEvaluator {
    pub fn new(store: Arc<dyn ResultStore>, channels: Vec<NotificationChannel>) -> Self {
        Self { store, channels }
    }

    /// Apply one probe outcome to the incident state of its key
    pub async fn evaluate(
        &self,
        domain_id: Uuid,
        domain_name: &str,
        check_type: CheckType,
        result: &ProbeResult,
    ) -> Result<IncidentTransition> {
        let open = self.store.find_open_incidents(domain_id, check_type).await?;

        if result.success {
            if open.is_empty() {
                return Ok(IncidentTransition::Unchanged);
            }

            let now = Utc::now();
            let mut resolved = Vec::with_capacity(open.len());
            for mut incident in open {
                incident.resolve(now);
                self.store.save_incident(&incident).await?;
                info!(domain = domain_name, check_type = %check_type, incident = %incident.id, "Incident resolved");
                resolved.push(incident);
            }
            return Ok(IncidentTransition::Resolved(resolved));
        }

        if !open.is_empty() {
            return Ok(IncidentTransition::Unchanged);
        }

        let severity = severity_for(check_type, result.error_code.as_deref(), result.status_code());
        let reason = incident_reason(result);
        let incident = Incident::open(domain_id, check_type, severity, reason, Utc::now());
        self.store.save_incident(&incident).await?;
        warn!(
            domain = domain_name,
            check_type = %check_type,
            severity = %severity,
            reason = %incident.reason,
            "Incident opened"
        );

        self.enqueue_notifications(&incident, domain_name, result).await;
        Ok(IncidentTransition::Opened(incident))
    }

    /// Outbox writes never fail the evaluation
    async fn enqueue_notifications(&self, incident: &Incident, domain_name: &str, result: &ProbeResult) {
        let payload = json!({
            "message": format!("{} check failing for {}", incident.check_type, domain_name),
            "domainName": domain_name,
            "checkType": incident.check_type.as_str(),
            "error": result.error_message.as_deref().or(result.error_code.as_deref()).unwrap_or("Probe failed"),
            "severity": incident.severity.as_str(),
            "incidentId": incident.id.to_string(),
        });

        for channel in &self.channels {
            if let Err(e) = self
                .store
                .enqueue_notification(
                    incident.domain_id,
                    incident.id,
                    &channel.channel,
                    &channel.destination,
                    payload.clone(),
                )
                .await
            {
                warn!("Failed to enqueue {} notification for incident {}: {}", channel.channel, incident.id, e);
            }
        }
    }
}

/// Severity of a newly opened incident
pub fn severity_for(check_type: CheckType, error_code: Option<&str>, status_code: Option<u16>) -> Severity {
    match (check_type, error_code) {
        (CheckType::Tls, Some(codes::INVALID_CERTIFICATE)) => Severity::High,
        (CheckType::Http, _) if status_code.is_some_and(|status| status >= 500) => Severity::High,
        (_, Some(codes::TIMEOUT | codes::CONNECTION_FAILED)) => Severity::Medium,
        _ => Severity::Low,
    }
}

/// Error message, else error code, else a fixed fallback
pub fn incident_reason(result: &ProbeResult) -> String {
    result
        .error_message
        .as_deref()
        .filter(|m| !m.is_empty())
        .or(result.error_code.as_deref().filter(|c| !c.is_empty()))
        .unwrap_or("Probe failed")
        .to_string()
}
