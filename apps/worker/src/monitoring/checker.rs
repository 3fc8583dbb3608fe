use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use super::dns::DnsRunner;
use super::http::HttpRunner;
use super::tls::TlsRunner;
use super::types::ProbeResult;
use crate::config::ProbeSettings;

/// Type of probe to perform against a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckType {
    Dns,
    Tls,
    Http,
}

impl CheckType {
    pub const ALL: [CheckType; 3] = [CheckType::Dns, CheckType::Tls, CheckType::Http];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Dns => "DNS",
            CheckType::Tls => "TLS",
            CheckType::Http => "HTTP",
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DNS" => Ok(CheckType::Dns),
            "TLS" => Ok(CheckType::Tls),
            "HTTP" => Ok(CheckType::Http),
            other => Err(anyhow!("Unknown check type: {}", other)),
        }
    }
}

/// A single network probe.
///
/// Implementations own their timeout and classify every failure into the
/// returned [`ProbeResult`]; `run` never fails and never outlives its timeout.
#[async_trait::async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn run(&self, target: &str) -> ProbeResult;
}

/// The runner used for each check type, handed to the executor at construction
#[derive(Clone)]
pub struct ProbeRunners {
    pub dns: Arc<dyn ProbeRunner>,
    pub tls: Arc<dyn ProbeRunner>,
    pub http: Arc<dyn ProbeRunner>,
}

impl ProbeRunners {
    /// Build the real network runners from probe settings
    pub fn from_settings(settings: &ProbeSettings) -> Result<Self> {
        Ok(Self {
            dns: Arc::new(DnsRunner::new(settings.dns_timeout())),
            tls: Arc::new(TlsRunner::new(settings.tls_timeout(), settings.tls_port)?),
            http: Arc::new(HttpRunner::new(settings.http_timeout(), &settings.user_agent)?),
        })
    }

    pub fn for_type(&self, check_type: CheckType) -> &dyn ProbeRunner {
        match check_type {
            CheckType::Dns => self.dns.as_ref(),
            CheckType::Tls => self.tls.as_ref(),
            CheckType::Http => self.http.as_ref(),
        }
    }
}
