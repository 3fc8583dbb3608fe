use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, ring};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::warn;
use x509_parser::extensions::GeneralName;

use super::checker::{CheckType, ProbeRunner};
use super::types::{CertificateInfo, ProbeDetail, ProbeResult, TlsDetail, codes};
use super::validation::normalize_domain_name;

/// Fetches and inspects the certificate served on a host's TLS port
pub struct TlsRunner {
    provider: Arc<CryptoProvider>,
    webpki: Arc<WebPkiServerVerifier>,
    timeout: Duration,
    port: u16,
}

/// Runs the normal WebPKI checks but lets the handshake continue, keeping the
/// verification error so the certificate can still be inspected.
#[derive(Debug)]
struct RecordingVerifier {
    inner: Arc<WebPkiServerVerifier>,
    error: Mutex<Option<String>>,
}

impl RecordingVerifier {
    fn new(inner: Arc<WebPkiServerVerifier>) -> Self {
        Self { inner, error: Mutex::new(None) }
    }

    fn take_error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }
}

impl ServerCertVerifier for RecordingVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Err(e) =
            self.inner.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            if let Ok(mut slot) = self.error.lock() {
                *slot = Some(e.to_string());
            }
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

impl TlsRunner {
    pub fn new(timeout_duration: Duration, port: u16) -> Result<Self> {
        let provider = Arc::new(ring::default_provider());
        let roots = RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.to_vec() };
        let webpki = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| anyhow!("Failed to build certificate verifier: {}", e))?;

        Ok(Self { provider, webpki, timeout: timeout_duration, port })
    }

    async fn check_certificate(&self, host: &str) -> ProbeResult {
        let verifier = Arc::new(RecordingVerifier::new(self.webpki.clone()));
        let config = match ClientConfig::builder_with_provider(self.provider.clone())
            .with_safe_default_protocol_versions()
        {
            Ok(builder) => builder
                .dangerous()
                .with_custom_certificate_verifier(verifier.clone())
                .with_no_client_auth(),
            Err(e) => return tls_failure(codes::UNKNOWN, format!("TLS configuration error: {}", e)),
        };

        let server_name = match ServerName::try_from(host.to_string()) {
            Ok(name) => name,
            Err(e) => return tls_failure(codes::UNKNOWN, format!("Invalid server name {}: {}", host, e)),
        };

        let tcp = match TcpStream::connect((host, self.port)).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("TLS connection failed for {}:{}: {}", host, self.port, e);
                return tls_failure(codes::CONNECTION_FAILED, e.to_string());
            }
        };

        let stream = match TlsConnector::from(Arc::new(config)).connect(server_name, tcp).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("TLS handshake failed for {}:{}: {}", host, self.port, e);
                return tls_failure(codes::UNKNOWN, format!("TLS handshake failed: {}", e));
            }
        };

        let (_, connection) = stream.get_ref();
        let Some(leaf) = connection.peer_certificates().and_then(|chain| chain.first()) else {
            return tls_failure(codes::NO_CERTIFICATE, "No certificate found");
        };

        let verify_error = verifier.take_error();
        match inspect_certificate(leaf.as_ref(), verify_error.as_deref(), Utc::now()) {
            Ok(certificate) => {
                if let Some(reason) = &verify_error {
                    warn!("Certificate for {} failed validation: {}", host, reason);
                }
                certificate_result(certificate, verify_error)
            }
            Err(e) => tls_failure(codes::UNKNOWN, format!("Could not parse certificate: {}", e)),
        }
    }
}

#[async_trait::async_trait]
impl ProbeRunner for TlsRunner {
    async fn run(&self, target: &str) -> ProbeResult {
        let host = normalize_domain_name(target);
        let start = Instant::now();

        match timeout(self.timeout, self.check_certificate(&host)).await {
            Ok(result) => result.with_duration(start.elapsed()),
            Err(_) => {
                warn!("TLS check timed out for {}:{}", host, self.port);
                ProbeResult::timeout(CheckType::Tls, self.timeout)
            }
        }
    }
}

fn tls_failure(code: &str, message: impl Into<String>) -> ProbeResult {
    ProbeResult::failure(ProbeDetail::empty(CheckType::Tls), code, message)
}

/// A certificate was obtained, so the probe succeeded; an invalid certificate
/// is reported through `is_valid` and the `INVALID_CERTIFICATE` code.
fn certificate_result(certificate: CertificateInfo, verify_error: Option<String>) -> ProbeResult {
    let problem = match (certificate.is_valid, verify_error) {
        (true, _) => None,
        (false, Some(reason)) => Some(reason),
        (false, None) => Some("Certificate expired".to_string()),
    };

    let mut result = ProbeResult::success(ProbeDetail::Tls(TlsDetail { certificate: Some(certificate) }));
    if let Some(message) = problem {
        result.error_code = Some(codes::INVALID_CERTIFICATE.to_string());
        result.error_message = Some(message);
    }
    result
}

/// Whole days left before `not_after`, rounded down; `None` once expired
pub fn days_until_expiry(not_after: DateTime<Utc>, now: DateTime<Utc>) -> Option<i64> {
    (not_after > now).then(|| (not_after - now).num_days())
}

fn inspect_certificate(
    der: &[u8],
    verify_error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<CertificateInfo> {
    let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|e| anyhow!("{}", e))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0).unwrap_or_default();
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0).unwrap_or_default();
    let days = days_until_expiry(not_after, now);

    let subject_alternative_names = match cert.subject_alternative_name() {
        Ok(Some(extension)) => extension
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!("Could not extract SAN names from certificate: {}", e);
            Vec::new()
        }
    };

    Ok(CertificateInfo {
        issuer: cert.issuer().to_string(),
        subject: cert.subject().to_string(),
        not_before,
        not_after,
        days_until_expiry: days,
        subject_alternative_names,
        is_valid: verify_error.is_none() && days.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn certificate(is_valid: bool, days: Option<i64>) -> CertificateInfo {
        CertificateInfo {
            issuer: "CN=Test CA".into(),
            subject: "CN=example.com".into(),
            not_before: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap(),
            days_until_expiry: days,
            subject_alternative_names: vec!["example.com".into(), "www.example.com".into()],
            is_valid,
        }
    }

    #[test]
    fn test_days_until_expiry_floors() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();

        let almost_two_days = now + chrono::Duration::hours(47);
        assert_eq!(days_until_expiry(almost_two_days, now), Some(1));

        let in_an_hour = now + chrono::Duration::hours(1);
        assert_eq!(days_until_expiry(in_an_hour, now), Some(0));
    }

    #[test]
    fn test_days_until_expiry_expired_is_none() {
        let now = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
        assert_eq!(days_until_expiry(now - chrono::Duration::days(3), now), None);
        assert_eq!(days_until_expiry(now, now), None);
    }

    #[test]
    fn test_valid_certificate_has_no_error() {
        let result = certificate_result(certificate(true, Some(75)), None);

        assert!(result.success);
        assert!(result.error_code.is_none());
        let snapshot = result.snapshot().unwrap();
        assert_eq!(snapshot["isValid"], true);
        assert_eq!(snapshot["daysUntilExpiry"], 75);
        assert_eq!(snapshot["subjectAlternativeNames"][1], "www.example.com");
    }

    #[test]
    fn test_expired_certificate_is_obtained_but_flagged() {
        let result = certificate_result(certificate(false, None), None);

        assert!(result.success);
        assert_eq!(result.error_code.as_deref(), Some(codes::INVALID_CERTIFICATE));
        assert_eq!(result.error_message.as_deref(), Some("Certificate expired"));
    }

    #[test]
    fn test_verification_error_becomes_message() {
        let reason = "invalid peer certificate: NotValidForName".to_string();
        let result = certificate_result(certificate(false, Some(40)), Some(reason.clone()));

        assert!(result.success);
        assert_eq!(result.error_code.as_deref(), Some(codes::INVALID_CERTIFICATE));
        assert_eq!(result.error_message, Some(reason));
    }

    #[test]
    fn test_garbage_der_is_rejected() {
        assert!(inspect_certificate(b"not a certificate", None, Utc::now()).is_err());
    }
}
