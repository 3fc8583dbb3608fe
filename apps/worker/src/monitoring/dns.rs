use std::time::{Duration, Instant};

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::lookup::Lookup;
use hickory_resolver::proto::op::ResponseCode;
use hickory_resolver::proto::rr::{RData, RecordType};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::checker::{CheckType, ProbeRunner};
use super::types::{DnsDetail, DnsRecord, ProbeDetail, ProbeResult, codes};
use super::validation::normalize_domain_name;

/// Resolves A, AAAA and CNAME records for a host
pub struct DnsRunner {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

/// A resolver failure worth reporting: error code and message
type LookupFailure = (String, String);

impl DnsRunner {
    pub fn new(timeout_duration: Duration) -> Self {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(system) => system,
            Err(e) => {
                warn!("Could not read system resolver config, using defaults: {}", e);
                (ResolverConfig::default(), ResolverOpts::default())
            }
        };

        // Every probe must hit the network.
        opts.cache_size = 0;
        opts.timeout = timeout_duration;
        opts.attempts = 1;

        Self { resolver: TokioAsyncResolver::tokio(config, opts), timeout: timeout_duration }
    }

    async fn query(&self, host: &str, record_type: RecordType) -> Result<Vec<DnsRecord>, LookupFailure> {
        match self.resolver.lookup(host, record_type).await {
            Ok(lookup) => Ok(records_from_lookup(&lookup, record_type)),
            Err(e) => match classify_error(&e) {
                Some(failure) => Err(failure),
                None => Ok(Vec::new()),
            },
        }
    }

    async fn resolve(&self, host: &str) -> ProbeResult {
        let (a, aaaa, cname) = tokio::join!(
            self.query(host, RecordType::A),
            self.query(host, RecordType::AAAA),
            self.query(host, RecordType::CNAME),
        );

        // Only the A lookup is authoritative for errors; AAAA and CNAME are best effort.
        if let Err((code, message)) = &aaaa {
            debug!(host, code = %code, message = %message, "AAAA lookup failed");
        }
        if let Err((code, message)) = &cname {
            debug!(host, code = %code, message = %message, "CNAME lookup failed");
        }

        assemble_result(a, aaaa.unwrap_or_default(), cname.unwrap_or_default())
    }
}

#[async_trait::async_trait]
impl ProbeRunner for DnsRunner {
    async fn run(&self, target: &str) -> ProbeResult {
        let host = normalize_domain_name(target);
        let start = Instant::now();

        let result = match timeout(self.timeout, self.resolve(&host)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("DNS resolution timed out for {}", host);
                return ProbeResult::timeout(CheckType::Dns, self.timeout);
            }
        };

        result.with_duration(start.elapsed())
    }
}

/// Keep only the records of the queried type; CNAME chains show up in A answers too
fn records_from_lookup(lookup: &Lookup, record_type: RecordType) -> Vec<DnsRecord> {
    lookup
        .record_iter()
        .filter(|record| record.record_type() == record_type)
        .filter_map(|record| {
            let value = match record.data()? {
                RData::A(a) => a.0.to_string(),
                RData::AAAA(aaaa) => aaaa.0.to_string(),
                RData::CNAME(cname) => cname.0.to_utf8(),
                _ => return None,
            };
            Some(DnsRecord { record_type: record_type.to_string(), value, ttl: record.ttl() })
        })
        .collect()
}

/// Map a resolver error to an error code.
///
/// `None` means the name exists but has no records of the queried type, which is
/// not an error on its own.
fn classify_error(error: &ResolveError) -> Option<LookupFailure> {
    match error.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => {
            let code = match *response_code {
                ResponseCode::NoError => return None,
                ResponseCode::NXDomain => codes::NXDOMAIN,
                ResponseCode::ServFail => "SERVFAIL",
                ResponseCode::Refused => "REFUSED",
                ResponseCode::FormErr => "FORMERR",
                ResponseCode::NotImp => "NOTIMP",
                _ => codes::UNKNOWN,
            };
            Some((code.to_string(), format!("DNS query failed: {}", response_code)))
        }
        ResolveErrorKind::Timeout => {
            Some((codes::TIMEOUT.to_string(), "DNS query timed out".to_string()))
        }
        _ => Some((codes::UNKNOWN.to_string(), error.to_string())),
    }
}

fn assemble_result(
    a: Result<Vec<DnsRecord>, LookupFailure>,
    aaaa: Vec<DnsRecord>,
    cname: Vec<DnsRecord>,
) -> ProbeResult {
    let a = match a {
        Ok(records) => records,
        Err((code, message)) => {
            return ProbeResult::failure(ProbeDetail::empty(CheckType::Dns), code, message);
        }
    };

    let mut detail = DnsDetail::default();
    for record in a.into_iter().chain(aaaa) {
        detail.ip_addresses.push(record.value.clone());
        detail.records.push(record);
    }
    detail.records.extend(cname);

    if detail.records.is_empty() {
        ProbeResult::failure(ProbeDetail::Dns(detail), codes::NXDOMAIN, "No DNS records found")
    } else {
        ProbeResult::success(ProbeDetail::Dns(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(record_type: &str, value: &str) -> DnsRecord {
        DnsRecord { record_type: record_type.into(), value: value.into(), ttl: 60 }
    }

    #[test]
    fn test_any_record_type_is_success() {
        let result = assemble_result(Ok(vec![]), vec![], vec![record("CNAME", "edge.example.net.")]);

        assert!(result.success);
        let ProbeDetail::Dns(detail) = result.detail else { panic!("expected DNS detail") };
        assert!(detail.ip_addresses.is_empty());
        assert_eq!(detail.records.len(), 1);
    }

    #[test]
    fn test_ip_list_contains_a_and_aaaa() {
        let result = assemble_result(
            Ok(vec![record("A", "93.184.216.34")]),
            vec![record("AAAA", "2606:2800:220:1:248:1893:25c8:1946")],
            vec![],
        );

        assert!(result.success);
        let ProbeDetail::Dns(detail) = result.detail else { panic!("expected DNS detail") };
        assert_eq!(detail.ip_addresses, vec!["93.184.216.34", "2606:2800:220:1:248:1893:25c8:1946"]);
    }

    #[test]
    fn test_no_records_is_nxdomain() {
        let result = assemble_result(Ok(vec![]), vec![], vec![]);

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some(codes::NXDOMAIN));
        assert_eq!(result.error_message.as_deref(), Some("No DNS records found"));
    }

    #[test]
    fn test_a_lookup_error_fails_even_with_other_records() {
        let result = assemble_result(
            Err(("SERVFAIL".into(), "DNS query failed: Server Failure".into())),
            vec![record("AAAA", "::1")],
            vec![],
        );

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("SERVFAIL"));
    }

    #[test]
    fn test_classify_timeout_and_unknown() {
        let timeout_error = ResolveError::from(ResolveErrorKind::Timeout);
        assert_eq!(classify_error(&timeout_error).unwrap().0, codes::TIMEOUT);

        let other = ResolveError::from("resolver exploded");
        assert_eq!(classify_error(&other).unwrap().0, codes::UNKNOWN);
    }
}
