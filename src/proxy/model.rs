//! Proxy and host-binding row types.
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{BindingId, HostId, ProxyId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

/// Outbound identity endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyEndpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: ProxyProtocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            username: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Credential-free URL suitable for an HTTP client's proxy setting.
    pub fn url(&self) -> String {
        format!("{}://{}:{}", self.protocol.scheme(), self.host, self.port)
    }
}

/// Global proxy record with rolling health counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proxy {
    pub id: ProxyId,
    pub endpoint: ProxyEndpoint,
    /// Admin flag; automatic health is derived from the failure counter.
    pub active: bool,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub avg_latency_ms: Option<f64>,
    pub geo: Option<String>,
    pub per_hour_cap: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proxy {
    /// A proxy is usable when admin-enabled and either under the failure
    /// threshold or past the grace period since its last failure (probe).
    pub fn healthy(&self, failure_threshold: u32, grace_secs: u64, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        if self.consecutive_failures < failure_threshold {
            return true;
        }
        self.last_failure_at
            .map(|at| at + Duration::seconds(grace_secs as i64) <= now)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct NewProxy {
    pub endpoint: ProxyEndpoint,
    pub geo: Option<String>,
    pub per_hour_cap: Option<u32>,
}

impl NewProxy {
    pub fn new(endpoint: ProxyEndpoint) -> Self {
        Self {
            endpoint,
            geo: None,
            per_hour_cap: None,
        }
    }
}

/// (host, proxy) junction row; health counters are independent from the
/// proxy's global record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProxyBinding {
    pub id: BindingId,
    pub host_id: HostId,
    pub proxy_id: ProxyId,
    pub active: bool,
    pub priority: i32,
    pub last_used_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lease on one proxy for one request, returned by `acquire`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyHandle {
    pub binding_id: BindingId,
    pub host_id: HostId,
    pub proxy_id: ProxyId,
    pub endpoint: ProxyEndpoint,
    pub acquired_at: DateTime<Utc>,
}

/// Result of the request the handle was acquired for.
#[derive(Debug, Clone)]
pub enum ReleaseOutcome {
    Success { latency_ms: u64 },
    Failure { reason: String },
}

/// Post-release binding health, returned so callers can log it.
#[derive(Debug, Clone, Copy)]
pub struct ReleaseSummary {
    pub binding_active: bool,
    pub consecutive_failures: u32,
}

/// Per-binding health summary for the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingStats {
    pub binding_id: BindingId,
    pub proxy_id: ProxyId,
    pub endpoint_url: String,
    pub active: bool,
    pub proxy_healthy: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: Option<f64>,
}

/// Fold a new latency sample into the rolling average (EWMA, α = 0.5).
pub fn fold_latency(old: Option<f64>, sample_ms: u64) -> f64 {
    match old {
        Some(prev) => (prev + sample_ms as f64) / 2.0,
        None => sample_ms as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_url_omits_credentials() {
        let ep = ProxyEndpoint::new("10.0.0.1", 8080, ProxyProtocol::Socks5)
            .with_credentials("user", "secret");
        assert_eq!(ep.url(), "socks5://10.0.0.1:8080");
    }

    #[test]
    fn latency_folding_halves_toward_sample() {
        assert_eq!(fold_latency(None, 100), 100.0);
        assert_eq!(fold_latency(Some(100.0), 200), 150.0);
        assert_eq!(fold_latency(Some(150.0), 50), 100.0);
    }

    #[test]
    fn grace_period_readmits_failed_proxy() {
        let now = Utc::now();
        let mut proxy = Proxy {
            id: ProxyId::generate(),
            endpoint: ProxyEndpoint::new("p", 80, ProxyProtocol::Http),
            active: true,
            success_count: 0,
            consecutive_failures: 10,
            last_used_at: None,
            last_success_at: None,
            last_failure_at: Some(now),
            avg_latency_ms: None,
            geo: None,
            per_hour_cap: None,
            created_at: now,
            updated_at: now,
        };
        assert!(!proxy.healthy(10, 1800, now));
        assert!(proxy.healthy(10, 1800, now + Duration::seconds(1800)));
        proxy.active = false;
        assert!(!proxy.healthy(10, 1800, now + Duration::seconds(3600)));
    }
}
