//! Connection manager
//!
//! Finds the debuggable page through the HTTP introspection endpoint, opens
//! the transport, and retries with exponential backoff. Failures that look
//! proxy-related switch the remaining attempts to the proxy-tuned policy.

use std::future::Future;
use std::net::IpAddr;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::protocol::TargetInfo;
use super::session::Session;
use super::CdpError;

/// Upper bound for a single backoff step
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const PROXY_ENV_VARS: &[&str] = &[
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
    "http_proxy",
    "https_proxy",
    "all_proxy",
];

const PROXY_MARKERS: &[&str] = &["proxy", "tunnel", "socks"];

/// A three-digit code standing on its own, the way HTTP statuses appear in error text
static STATUS_CODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|[\s(])([1-5][0-9]{2})(?:[\s),;]|$)").unwrap());

fn mentions_status(text: &str, codes: &[&str]) -> bool {
    STATUS_CODE
        .captures_iter(text)
        .any(|caps| codes.contains(&&caps[1]))
}

/// Host and port of a browser's remote-debugging endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerAddress {
    pub host: String,
    pub port: u16,
}

impl DebuggerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn http_base(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_loopback(&self) -> bool {
        self.host == "localhost"
            || self
                .host
                .parse::<IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }
}

impl Default for DebuggerAddress {
    fn default() -> Self {
        Self::new("127.0.0.1", 9222)
    }
}

/// A discovered page target; replaced wholesale on reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub target_id: String,
    pub websocket_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryKind {
    Default,
    Proxy,
}

/// Retry schedule for establishing a session
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub kind: RetryKind,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    pub classifier: fn(&CdpError) -> bool,
}

impl RetryPolicy {
    /// Few attempts, long delays
    pub fn standard() -> Self {
        Self {
            kind: RetryKind::Default,
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: Duration::from_millis(500),
            classifier: is_proxy_error,
        }
    }

    /// More attempts, shorter delays; used once a failure looks proxy-related
    pub fn proxy() -> Self {
        Self {
            kind: RetryKind::Proxy,
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            multiplier: 1.5,
            jitter: Duration::from_millis(250),
            classifier: is_proxy_error,
        }
    }

    pub fn is_proxy_related(&self, err: &CdpError) -> bool {
        (self.classifier)(err)
    }

    /// Deterministic part of the delay after failed attempt `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        Duration::from_secs_f64(secs.min(MAX_BACKOFF.as_secs_f64()))
    }

    /// Backoff plus a random share of the jitter bound
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            (uuid::Uuid::new_v4().as_u128() % (jitter_ms as u128 + 1)) as u64
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::standard()
    }
}

/// Default classifier for "is this failure caused by a proxy"
pub fn is_proxy_error(err: &CdpError) -> bool {
    let text = err.to_string().to_ascii_lowercase();
    if PROXY_MARKERS.iter().any(|marker| text.contains(marker))
        || mentions_status(&text, &["407"])
    {
        return true;
    }

    let transport_failure = matches!(err, CdpError::Discovery(_) | CdpError::WebSocket(_));
    transport_failure
        && proxy_env_configured()
        && (["connection refused", "connection reset"]
            .iter()
            .any(|marker| text.contains(marker))
            || mentions_status(&text, &["502", "503"]))
}

fn proxy_env_configured() -> bool {
    PROXY_ENV_VARS
        .iter()
        .any(|var| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false))
}

/// Tunables shared by every session a manager creates
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub command_timeout: Duration,
    pub handshake_timeout: Duration,
    pub discovery_timeout: Duration,
    pub sweep_interval: Duration,
    pub auto_reconnect: bool,
    pub bypass_proxy_for_loopback: bool,
    pub proxy_policy: RetryPolicy,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(50),
            auto_reconnect: true,
            bypass_proxy_for_loopback: true,
            proxy_policy: RetryPolicy::proxy(),
        }
    }
}

#[derive(Clone)]
pub struct ConnectionManager {
    http: reqwest::Client,
    direct: reqwest::Client,
    options: ConnectionOptions,
}

impl ConnectionManager {
    pub fn new(options: ConnectionOptions) -> Result<Self, CdpError> {
        let http = reqwest::Client::builder()
            .timeout(options.discovery_timeout)
            .build()
            .map_err(|e| CdpError::Discovery(e.to_string()))?;
        let direct = reqwest::Client::builder()
            .timeout(options.discovery_timeout)
            .no_proxy()
            .build()
            .map_err(|e| CdpError::Discovery(e.to_string()))?;

        Ok(Self {
            http,
            direct,
            options,
        })
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Discover a page target, open it and return a ready session
    pub async fn connect(
        &self,
        address: &DebuggerAddress,
        policy: RetryPolicy,
    ) -> Result<Session, CdpError> {
        info!(host = %address.host, port = address.port, "Connecting to browser");
        let session = Session::new(self.clone(), address.clone(), policy);
        session.establish().await?;
        Ok(session)
    }

    fn client_for(&self, address: &DebuggerAddress) -> &reqwest::Client {
        if self.options.bypass_proxy_for_loopback && address.is_loopback() {
            &self.direct
        } else {
            &self.http
        }
    }

    /// Ask the introspection endpoint for a page target, creating one if needed
    pub async fn discover(&self, address: &DebuggerAddress) -> Result<Endpoint, CdpError> {
        let client = self.client_for(address);
        let list_url = format!("{}/json/list", address.http_base());
        debug!(url = %list_url, "Discovering debuggable targets");

        let response = client
            .get(&list_url)
            .send()
            .await
            .map_err(|e| CdpError::Discovery(describe_http_error(&list_url, &e)))?;
        if !response.status().is_success() {
            return Err(CdpError::Discovery(format!(
                "{} returned HTTP {}",
                list_url,
                response.status().as_u16()
            )));
        }
        let targets: Vec<TargetInfo> = response
            .json()
            .await
            .map_err(|e| CdpError::Discovery(describe_http_error(&list_url, &e)))?;

        let target = match targets.into_iter().find(TargetInfo::is_inspectable_page) {
            Some(target) => target,
            None => self.create_page(client, address).await?,
        };

        let websocket_url = target.web_socket_debugger_url.clone().ok_or_else(|| {
            CdpError::Discovery(format!("target {} has no webSocketDebuggerUrl", target.id))
        })?;

        debug!(target = %target.id, url = %target.url, "Selected page target");

        Ok(Endpoint {
            host: address.host.clone(),
            port: address.port,
            target_id: target.id,
            websocket_url: rewrite_websocket_host(&websocket_url, address),
        })
    }

    async fn create_page(
        &self,
        client: &reqwest::Client,
        address: &DebuggerAddress,
    ) -> Result<TargetInfo, CdpError> {
        let new_url = format!("{}/json/new", address.http_base());
        info!(url = %new_url, "No inspectable page found, creating one");

        let response = client
            .put(&new_url)
            .send()
            .await
            .map_err(|e| CdpError::Discovery(describe_http_error(&new_url, &e)))?;
        if !response.status().is_success() {
            return Err(CdpError::Discovery(format!(
                "{} returned HTTP {}",
                new_url,
                response.status().as_u16()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| CdpError::Discovery(describe_http_error(&new_url, &e)))
    }

    /// Run `attempt` until it succeeds or the attempts run out
    pub async fn with_retry<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        mut attempt: F,
    ) -> Result<T, CdpError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CdpError>>,
    {
        let mut active = policy.clone();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match attempt(attempts).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let proxy_related = active.is_proxy_related(&err);
                    if proxy_related && active.kind != RetryKind::Proxy {
                        warn!(error = %err, "Failure looks proxy-related, switching retry policy");
                        active = self.options.proxy_policy.clone();
                    }

                    if attempts >= active.max_attempts {
                        warn!(attempts, error = %err, "Giving up on browser connection");
                        return Err(CdpError::Connection {
                            attempts,
                            proxy_related,
                            cause: err.to_string(),
                        });
                    }

                    let delay = active.delay_for(attempts);
                    warn!(
                        attempt = attempts,
                        max_attempts = active.max_attempts,
                        ?delay,
                        error = %err,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn describe_http_error(url: &str, err: &reqwest::Error) -> String {
    let mut message = format!("{}: {}", url, err);
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Browsers advertise `localhost` URLs; point them at the host we actually reached
fn rewrite_websocket_host(websocket_url: &str, address: &DebuggerAddress) -> String {
    if address.is_loopback() {
        return websocket_url.to_string();
    }
    match url::Url::parse(websocket_url) {
        Ok(mut parsed) => {
            let advertised_loopback = parsed
                .host_str()
                .map(|h| DebuggerAddress::new(h, 0).is_loopback())
                .unwrap_or(false);
            if advertised_loopback && parsed.set_host(Some(&address.host)).is_ok() {
                let _ = parsed.set_port(Some(address.port));
                return parsed.to_string();
            }
            websocket_url.to_string()
        }
        Err(_) => websocket_url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            kind: RetryKind::Default,
            max_attempts,
            base_delay: Duration::from_millis(1),
            multiplier: 1.0,
            jitter: Duration::ZERO,
            classifier: is_proxy_error,
        }
    }

    fn manager_with_proxy_attempts(max_attempts: u32) -> ConnectionManager {
        let mut proxy_policy = fast_policy(max_attempts);
        proxy_policy.kind = RetryKind::Proxy;
        ConnectionManager::new(ConnectionOptions {
            proxy_policy,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::standard();
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(10), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_stays_within_bound() {
        let policy = RetryPolicy::proxy();
        for attempt in 1..5 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= policy.backoff(attempt));
            assert!(delay <= policy.backoff(attempt) + policy.jitter);
        }
    }

    #[test]
    fn test_proxy_policy_is_more_patient() {
        let standard = RetryPolicy::standard();
        let proxy = RetryPolicy::proxy();
        assert!(proxy.max_attempts > standard.max_attempts);
        assert!(proxy.base_delay < standard.base_delay);
    }

    #[test]
    fn test_proxy_classifier() {
        assert!(is_proxy_error(&CdpError::WebSocket(
            "HTTP error: 407 Proxy Authentication Required".into()
        )));
        assert!(is_proxy_error(&CdpError::Discovery(
            "http://10.0.0.2:9222/json/list: unsuccessful tunnel".into()
        )));
        assert!(!is_proxy_error(&CdpError::Protocol {
            code: -32000,
            message: "Cannot navigate".into()
        }));
        assert!(is_proxy_error(&CdpError::Discovery(
            "http://10.0.0.2:9222/json/list: status 407".into()
        )));
    }

    #[test]
    fn test_port_numbers_are_not_status_codes() {
        assert!(!is_proxy_error(&CdpError::WebSocket(
            "IO error: connection timed out (127.0.0.1:14070)".into()
        )));
        assert!(!is_proxy_error(&CdpError::Discovery(
            "http://127.0.0.1:4070/json/list: request timed out".into()
        )));
        assert!(!mentions_status("target 14073 gone", &["407"]));
        assert!(mentions_status("HTTP error: 407 Proxy Authentication Required", &["407"]));
        assert!(mentions_status("unexpected status (503)", &["502", "503"]));
    }

    #[test]
    fn test_loopback_detection() {
        assert!(DebuggerAddress::new("localhost", 9222).is_loopback());
        assert!(DebuggerAddress::new("127.0.0.1", 9222).is_loopback());
        assert!(DebuggerAddress::new("::1", 9222).is_loopback());
        assert!(!DebuggerAddress::new("10.1.2.3", 9222).is_loopback());
    }

    #[test]
    fn test_websocket_host_rewrite() {
        let remote = DebuggerAddress::new("10.1.2.3", 9333);
        assert_eq!(
            rewrite_websocket_host("ws://localhost:9222/devtools/page/ABC", &remote),
            "ws://10.1.2.3:9333/devtools/page/ABC"
        );

        let local = DebuggerAddress::default();
        assert_eq!(
            rewrite_websocket_host("ws://127.0.0.1:9222/devtools/page/ABC", &local),
            "ws://127.0.0.1:9222/devtools/page/ABC"
        );
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let manager = manager_with_proxy_attempts(10);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), CdpError> = manager
            .with_retry(&fast_policy(3), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CdpError::Discovery("connection refused".into()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(CdpError::Connection { attempts, cause, .. }) => {
                assert_eq!(attempts, 3);
                assert!(cause.contains("connection refused"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_proxy_failure_switches_policy() {
        let manager = manager_with_proxy_attempts(5);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), CdpError> = manager
            .with_retry(&fast_policy(2), |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(CdpError::WebSocket("407 Proxy Authentication Required".into()))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(matches!(
            result,
            Err(CdpError::Connection {
                proxy_related: true,
                attempts: 5,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_retry_returns_first_success() {
        let manager = manager_with_proxy_attempts(3);
        let result = manager
            .with_retry(&fast_policy(4), |attempt| async move {
                if attempt < 3 {
                    Err(CdpError::Discovery("not yet".into()))
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }
}
