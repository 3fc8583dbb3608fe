use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::Result;
use reqwest::StatusCode;
use tracing::warn;
use url::Url;

use super::checker::{CheckType, ProbeRunner};
use super::types::{HttpDetail, ProbeDetail, ProbeResult, codes};

/// HTTP reachability probe
pub struct HttpRunner {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpRunner {
    pub fn new(timeout_duration: Duration, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout_duration)
            .user_agent(user_agent)
            .build()?;

        Ok(Self { client, timeout: timeout_duration })
    }

    async fn check_url(&self, url: Url) -> ProbeResult {
        let sent_at = Instant::now();

        let response = match self.client.get(url.clone()).send().await {
            Ok(response) => response,
            Err(e) => {
                let (code, message) = classify_error(&e, self.timeout);
                warn!("HTTP request failed for {}: {}", url, e);
                return ProbeResult::failure(ProbeDetail::empty(CheckType::Http), code, message);
            }
        };
        let ttfb_ms = sent_at.elapsed().as_millis() as u64;

        let headers = response
            .headers()
            .iter()
            .fold(BTreeMap::<String, String>::new(), |mut acc, (name, value)| {
                let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
                acc.entry(name.as_str().to_string())
                    .and_modify(|existing| {
                        existing.push_str(", ");
                        existing.push_str(&value);
                    })
                    .or_insert(value);
                acc
            });

        status_result(response.status(), HttpDetail { status_code: None, ttfb_ms: Some(ttfb_ms), headers })
    }
}

#[async_trait::async_trait]
impl ProbeRunner for HttpRunner {
    async fn run(&self, target: &str) -> ProbeResult {
        let start = Instant::now();

        let url = match probe_url(target) {
            Ok(url) => url,
            Err(e) => {
                return ProbeResult::failure(
                    ProbeDetail::empty(CheckType::Http),
                    codes::INVALID_URL,
                    format!("Invalid URL {}: {}", target, e),
                );
            }
        };

        // The client timeout covers the request; this is a backstop for DNS stalls
        // inside connection setup.
        match tokio::time::timeout(self.timeout + Duration::from_secs(1), self.check_url(url)).await {
            Ok(result) => result.with_duration(start.elapsed()),
            Err(_) => ProbeResult::timeout(CheckType::Http, self.timeout),
        }
    }
}

/// `https://` + host, unless the target is already an absolute http(s) URL
pub fn probe_url(target: &str) -> Result<Url, url::ParseError> {
    let target = target.trim();
    if target.starts_with("http://") || target.starts_with("https://") {
        Url::parse(target)
    } else {
        Url::parse(&format!("https://{}", target))
    }
}

/// Statuses 200 through 399 are healthy
fn status_result(status: StatusCode, mut detail: HttpDetail) -> ProbeResult {
    let code = status.as_u16();
    detail.status_code = Some(code);

    if (200..400).contains(&code) {
        ProbeResult::success(ProbeDetail::Http(detail))
    } else {
        let reason = status.canonical_reason().unwrap_or("");
        ProbeResult::failure(
            ProbeDetail::Http(detail),
            format!("HTTP_{}", code),
            format!("HTTP {} {}", code, reason).trim_end().to_string(),
        )
    }
}

fn classify_error(error: &reqwest::Error, timeout_duration: Duration) -> (&'static str, String) {
    if error.is_timeout() {
        (codes::TIMEOUT, format!("Request timed out after {}ms", timeout_duration.as_millis()))
    } else if error.is_connect() {
        (codes::CONNECTION_FAILED, error.to_string())
    } else {
        (codes::HTTP_ERROR, error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_url_defaults_to_https() {
        assert_eq!(probe_url("example.com").unwrap().as_str(), "https://example.com/");
        assert_eq!(probe_url("http://example.com/health").unwrap().as_str(), "http://example.com/health");
        assert!(probe_url("exa mple.com").is_err());
    }

    #[test]
    fn test_success_range() {
        for code in [200u16, 204, 301, 399] {
            let result = status_result(StatusCode::from_u16(code).unwrap(), HttpDetail::default());
            assert!(result.success, "status {code}");
            assert_eq!(result.status_code(), Some(code));
        }
    }

    #[test]
    fn test_failure_statuses_get_http_codes() {
        let result = status_result(StatusCode::SERVICE_UNAVAILABLE, HttpDetail::default());
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("HTTP_503"));
        assert_eq!(result.error_message.as_deref(), Some("HTTP 503 Service Unavailable"));

        let result = status_result(StatusCode::NOT_FOUND, HttpDetail::default());
        assert_eq!(result.error_code.as_deref(), Some("HTTP_404"));

        let result = status_result(StatusCode::CONTINUE, HttpDetail::default());
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("HTTP_100"));
    }

    #[tokio::test]
    async fn test_invalid_target_fails_without_network() {
        let runner = HttpRunner::new(Duration::from_secs(1), "obsdns-test").unwrap();
        let result = runner.run("bad host name").await;

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some(codes::INVALID_URL));
    }

    #[tokio::test]
    async fn test_refused_connection_is_classified() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let runner = HttpRunner::new(Duration::from_secs(2), "obsdns-test").unwrap();
        let result = runner.run(&format!("http://127.0.0.1:{port}/")).await;

        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some(codes::CONNECTION_FAILED));
    }
}
