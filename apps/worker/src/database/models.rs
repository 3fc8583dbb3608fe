use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::monitoring::checker::CheckType;
use crate::monitoring::validation::DEFAULT_INTERVAL_MINUTES;

/// Convert a timestamp to the millisecond column representation
pub fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

/// Convert a millisecond column back to a timestamp
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

/// A monitored host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub id: Uuid,
    /// Normalized host name, unique
    pub name: String,
    pub enabled: bool,
    pub interval_minutes: u32,
    pub group_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Domain {
    pub fn new(name: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            enabled: true,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
            group_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One probe kind enabled or disabled for a domain.
///
/// The type is kept as stored so rows written by other tools with an unknown
/// type can still be scheduled and reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub check_type: String,
    pub enabled: bool,
}

impl Check {
    pub fn new(domain_id: Uuid, check_type: CheckType) -> Self {
        Self { id: Uuid::new_v4(), domain_id, check_type: check_type.to_string(), enabled: true }
    }
}

/// The persisted outcome of one probe execution; never updated
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRun {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub check_id: Uuid,
    pub check_type: CheckType,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub dns_ms: Option<i64>,
    pub tls_ms: Option<i64>,
    pub ttfb_ms: Option<i64>,
    pub total_ms: i64,
    pub status_code: Option<u16>,
    pub snapshot: Option<serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IncidentStatus {
    Open,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub check_type: CheckType,
    pub severity: Severity,
    pub status: IncidentStatus,
    pub reason: String,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn open(domain_id: Uuid, check_type: CheckType, severity: Severity, reason: String, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain_id,
            check_type,
            severity,
            status: IncidentStatus::Open,
            reason,
            started_at: now,
            resolved_at: None,
        }
    }

    /// Mark resolved; `resolved_at` never precedes `started_at`
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.status = IncidentStatus::Resolved;
        self.resolved_at = Some(now.max(self.started_at));
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.status == IncidentStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

/// Outbox row; delivery happens elsewhere
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub domain_id: Uuid,
    pub incident_id: Uuid,
    pub channel: String,
    pub destination: String,
    pub payload: serde_json::Value,
    pub status: NotificationStatus,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl Notification {
    pub fn pending(
        domain_id: Uuid,
        incident_id: Uuid,
        channel: &str,
        destination: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain_id,
            incident_id,
            channel: channel.to_string(),
            destination: destination.to_string(),
            payload,
            status: NotificationStatus::Pending,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(anyhow!("Unknown {} value: {}", stringify!($ty), other)),
                }
            }
        }
    };
}

text_enum!(Severity { Low => "LOW", Medium => "MEDIUM", High => "HIGH", Critical => "CRITICAL" });
text_enum!(IncidentStatus { Open => "OPEN", Acknowledged => "ACKNOWLEDGED", Resolved => "RESOLVED" });
text_enum!(NotificationStatus { Pending => "PENDING", Sent => "SENT", Failed => "FAILED" });
