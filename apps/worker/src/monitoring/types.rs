use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::checker::CheckType;

/// Error codes shared by the runners and the incident severity rules
pub mod codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
    pub const INVALID_CERTIFICATE: &str = "INVALID_CERTIFICATE";
    pub const NO_CERTIFICATE: &str = "NO_CERTIFICATE";
    pub const NXDOMAIN: &str = "NXDOMAIN";
    pub const HTTP_ERROR: &str = "HTTP_ERROR";
    pub const INVALID_URL: &str = "INVALID_URL";
    pub const UNKNOWN: &str = "UNKNOWN";
}

/// One DNS record returned by the resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub value: String,
    pub ttl: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsDetail {
    pub ip_addresses: Vec<String>,
    pub records: Vec<DnsRecord>,
}

/// Certificate facts extracted from a TLS handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    pub issuer: String,
    pub subject: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub days_until_expiry: Option<i64>,
    pub subject_alternative_names: Vec<String>,
    pub is_valid: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsDetail {
    pub certificate: Option<CertificateInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpDetail {
    pub status_code: Option<u16>,
    pub ttfb_ms: Option<u64>,
    pub headers: BTreeMap<String, String>,
}

/// Variant-specific payload of a probe result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "UPPERCASE")]
pub enum ProbeDetail {
    Dns(DnsDetail),
    Tls(TlsDetail),
    Http(HttpDetail),
}

impl ProbeDetail {
    pub fn check_type(&self) -> CheckType {
        match self {
            ProbeDetail::Dns(_) => CheckType::Dns,
            ProbeDetail::Tls(_) => CheckType::Tls,
            ProbeDetail::Http(_) => CheckType::Http,
        }
    }

    /// Empty detail for a check type, used when a probe fails before producing data
    pub fn empty(check_type: CheckType) -> Self {
        match check_type {
            CheckType::Dns => ProbeDetail::Dns(DnsDetail::default()),
            CheckType::Tls => ProbeDetail::Tls(TlsDetail::default()),
            CheckType::Http => ProbeDetail::Http(HttpDetail::default()),
        }
    }
}

/// Result of a single probe run
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    /// Time spent inside the runner
    pub duration: Duration,
    pub detail: ProbeDetail,
}

impl ProbeResult {
    /// Create a successful result carrying `detail`
    pub fn success(detail: ProbeDetail) -> Self {
        Self {
            success: true,
            error_code: None,
            error_message: None,
            duration: Duration::ZERO,
            detail,
        }
    }

    /// Create a failed result with an error code and message
    pub fn failure(detail: ProbeDetail, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            duration: Duration::ZERO,
            detail,
        }
    }

    /// Failure produced when the runner's deadline elapsed
    pub fn timeout(check_type: CheckType, after: Duration) -> Self {
        Self::failure(
            ProbeDetail::empty(check_type),
            codes::TIMEOUT,
            format!("{} probe timed out after {}ms", check_type, after.as_millis()),
        )
        .with_duration(after)
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn check_type(&self) -> CheckType {
        self.detail.check_type()
    }

    pub fn status_code(&self) -> Option<u16> {
        match &self.detail {
            ProbeDetail::Http(http) => http.status_code,
            _ => None,
        }
    }

    pub fn ttfb_ms(&self) -> Option<u64> {
        match &self.detail {
            ProbeDetail::Http(http) => http.ttfb_ms,
            _ => None,
        }
    }

    /// Raw JSON snapshot stored alongside the probe run
    pub fn snapshot(&self) -> Option<serde_json::Value> {
        let value = match &self.detail {
            ProbeDetail::Dns(dns) if dns.records.is_empty() => return None,
            ProbeDetail::Dns(dns) => serde_json::to_value(dns),
            ProbeDetail::Tls(TlsDetail { certificate: None }) => return None,
            ProbeDetail::Tls(TlsDetail { certificate: Some(cert) }) => serde_json::to_value(cert),
            ProbeDetail::Http(http) if http.headers.is_empty() => return None,
            ProbeDetail::Http(http) => serde_json::to_value(&http.headers),
        };
        value.ok()
    }
}
