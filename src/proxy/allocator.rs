//! Per-host proxy allocation with LRU selection and health accounting.
//!
//! `acquire` is a select-and-touch: the winning binding's `last_used_at`
//! advances inside the same write-lock critical section that chose it,
//! so two concurrent calls for one host can never return the same
//! identity.
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::ProxyConfig;
use crate::core::error::{OrchestratorError, Result};
use crate::core::types::{BindingId, HostId, ProxyId};
use crate::proxy::model::{
    fold_latency, BindingStats, HostProxyBinding, NewProxy, Proxy, ProxyHandle, ReleaseOutcome,
    ReleaseSummary,
};

struct AllocatorInner {
    proxies: HashMap<ProxyId, Proxy>,
    bindings: HashMap<BindingId, HostProxyBinding>,
    by_host: HashMap<HostId, Vec<BindingId>>,
}

pub struct ProxyAllocator {
    inner: RwLock<AllocatorInner>,
    cfg: ProxyConfig,
}

impl ProxyAllocator {
    pub fn new(cfg: ProxyConfig) -> Self {
        Self {
            inner: RwLock::new(AllocatorInner {
                proxies: HashMap::new(),
                bindings: HashMap::new(),
                by_host: HashMap::new(),
            }),
            cfg,
        }
    }

    pub async fn add_proxy(&self, proxy: NewProxy) -> Result<ProxyId> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let row = Proxy {
            id: ProxyId::generate(),
            endpoint: proxy.endpoint,
            active: true,
            success_count: 0,
            consecutive_failures: 0,
            last_used_at: None,
            last_success_at: None,
            last_failure_at: None,
            avg_latency_ms: None,
            geo: proxy.geo,
            per_hour_cap: proxy.per_hour_cap,
            created_at: now,
            updated_at: now,
        };
        let id = row.id.clone();
        inner.proxies.insert(id.clone(), row);
        Ok(id)
    }

    pub async fn get_proxy(&self, id: &ProxyId) -> Result<Proxy> {
        let inner = self.inner.read().await;
        inner
            .proxies
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "proxy",
                id: id.to_string(),
            })
    }

    /// Admin enable/disable; enabling clears the failure streak.
    pub async fn set_proxy_active(&self, id: &ProxyId, active: bool) -> Result<()> {
        let mut inner = self.inner.write().await;
        let proxy = inner
            .proxies
            .get_mut(id)
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "proxy",
                id: id.to_string(),
            })?;
        proxy.active = active;
        if active {
            proxy.consecutive_failures = 0;
        }
        proxy.updated_at = Utc::now();
        Ok(())
    }

    /// Remove a proxy and cascade its bindings.
    pub async fn remove_proxy(&self, id: &ProxyId) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.proxies.remove(id).is_none() {
            return Err(OrchestratorError::NotFound {
                entity: "proxy",
                id: id.to_string(),
            });
        }
        let removed: Vec<BindingId> = inner
            .bindings
            .values()
            .filter(|b| &b.proxy_id == id)
            .map(|b| b.id.clone())
            .collect();
        for binding_id in &removed {
            inner.bindings.remove(binding_id);
        }
        for ids in inner.by_host.values_mut() {
            ids.retain(|b| !removed.contains(b));
        }
        info!(proxy_id = %id, cascaded = removed.len(), "proxy removed");
        Ok(())
    }

    /// Remove every binding of a host (host deletion cascade).
    pub async fn remove_host_bindings(&self, host_id: &HostId) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let removed = match inner.by_host.remove(host_id) {
            Some(ids) => {
                for binding_id in &ids {
                    inner.bindings.remove(binding_id);
                }
                ids.len()
            }
            None => 0,
        };
        Ok(removed)
    }

    pub async fn bind(&self, host_id: &HostId, proxy_id: &ProxyId, priority: i32) -> Result<BindingId> {
        let mut inner = self.inner.write().await;
        if !inner.proxies.contains_key(proxy_id) {
            return Err(OrchestratorError::NotFound {
                entity: "proxy",
                id: proxy_id.to_string(),
            });
        }
        let exists = inner
            .bindings
            .values()
            .any(|b| &b.host_id == host_id && &b.proxy_id == proxy_id);
        if exists {
            return Err(OrchestratorError::Validation(format!(
                "proxy {} already bound to host {}",
                proxy_id, host_id
            )));
        }
        let now = Utc::now();
        let binding = HostProxyBinding {
            id: BindingId::generate(),
            host_id: host_id.clone(),
            proxy_id: proxy_id.clone(),
            active: true,
            priority,
            last_used_at: None,
            success_count: 0,
            consecutive_failures: 0,
            avg_latency_ms: None,
            created_at: now,
            updated_at: now,
        };
        let id = binding.id.clone();
        inner.bindings.insert(id.clone(), binding);
        inner
            .by_host
            .entry(host_id.clone())
            .or_default()
            .push(id.clone());
        Ok(id)
    }

    pub async fn unbind(&self, host_id: &HostId, proxy_id: &ProxyId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let binding_id = inner
            .bindings
            .values()
            .find(|b| &b.host_id == host_id && &b.proxy_id == proxy_id)
            .map(|b| b.id.clone())
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "binding",
                id: format!("{}/{}", host_id, proxy_id),
            })?;
        inner.bindings.remove(&binding_id);
        if let Some(ids) = inner.by_host.get_mut(host_id) {
            ids.retain(|b| b != &binding_id);
        }
        Ok(())
    }

    /// Reactivate a tripped binding and clear its failure streak.
    pub async fn revive_binding(&self, host_id: &HostId, proxy_id: &ProxyId) -> Result<()> {
        let mut inner = self.inner.write().await;
        let binding = inner
            .bindings
            .values_mut()
            .find(|b| &b.host_id == host_id && &b.proxy_id == proxy_id)
            .ok_or_else(|| OrchestratorError::NotFound {
                entity: "binding",
                id: format!("{}/{}", host_id, proxy_id),
            })?;
        binding.active = true;
        binding.consecutive_failures = 0;
        binding.updated_at = Utc::now();
        Ok(())
    }

    /// Select the least-recently-used healthy proxy for the host and
    /// touch its `last_used_at` atomically.
    pub async fn acquire(&self, host_id: &HostId, now: DateTime<Utc>) -> Result<ProxyHandle> {
        let mut inner = self.inner.write().await;
        let candidate_ids = inner.by_host.get(host_id).cloned().unwrap_or_default();

        let mut best: Option<(BindingId, Option<DateTime<Utc>>, f64)> = None;
        for binding_id in &candidate_ids {
            let binding = match inner.bindings.get(binding_id) {
                Some(b) => b,
                None => continue,
            };
            if !binding.active || binding.consecutive_failures >= self.cfg.binding_failure_threshold
            {
                continue;
            }
            let proxy = match inner.proxies.get(&binding.proxy_id) {
                Some(p) => p,
                None => continue,
            };
            if !proxy.healthy(
                self.cfg.global_failure_threshold,
                self.cfg.grace_period_secs,
                now,
            ) {
                continue;
            }

            let latency = binding.avg_latency_ms.unwrap_or(f64::INFINITY);
            let candidate = (binding.id.clone(), binding.last_used_at, latency);
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    if lru_before(candidate.1, candidate.2, current.1, current.2) {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        let (binding_id, _, _) = best.ok_or_else(|| OrchestratorError::NoProxyAvailable {
            host: host_id.clone(),
        })?;

        let proxy_id = {
            let binding = inner
                .bindings
                .get_mut(&binding_id)
                .ok_or_else(|| OrchestratorError::NoProxyAvailable {
                    host: host_id.clone(),
                })?;
            binding.last_used_at = Some(now);
            binding.updated_at = now;
            binding.proxy_id.clone()
        };

        let endpoint = {
            let proxy = inner
                .proxies
                .get_mut(&proxy_id)
                .ok_or_else(|| OrchestratorError::NoProxyAvailable {
                    host: host_id.clone(),
                })?;
            proxy.last_used_at = Some(now);
            proxy.updated_at = now;
            proxy.endpoint.clone()
        };

        debug!(host_id = %host_id, proxy_id = %proxy_id, "proxy acquired");
        Ok(ProxyHandle {
            binding_id,
            host_id: host_id.clone(),
            proxy_id,
            endpoint,
            acquired_at: now,
        })
    }

    /// Record the request outcome against both the binding and the
    /// proxy's global counters; returns the binding's resulting health.
    pub async fn release(
        &self,
        handle: &ProxyHandle,
        outcome: ReleaseOutcome,
    ) -> Result<ReleaseSummary> {
        let mut inner = self.inner.write().await;
        let now = Utc::now();
        let mut summary = ReleaseSummary {
            binding_active: false,
            consecutive_failures: 0,
        };

        if let Some(binding) = inner.bindings.get_mut(&handle.binding_id) {
            match &outcome {
                ReleaseOutcome::Success { latency_ms } => {
                    binding.consecutive_failures = 0;
                    binding.success_count += 1;
                    binding.avg_latency_ms = Some(fold_latency(binding.avg_latency_ms, *latency_ms));
                }
                ReleaseOutcome::Failure { .. } => {
                    binding.consecutive_failures += 1;
                    if binding.consecutive_failures >= self.cfg.binding_failure_threshold {
                        binding.active = false;
                        warn!(
                            binding_id = %binding.id,
                            host_id = %binding.host_id,
                            proxy_id = %binding.proxy_id,
                            failures = binding.consecutive_failures,
                            "binding deactivated after consecutive failures"
                        );
                    }
                }
            }
            binding.updated_at = now;
            summary = ReleaseSummary {
                binding_active: binding.active,
                consecutive_failures: binding.consecutive_failures,
            };
        }

        if let Some(proxy) = inner.proxies.get_mut(&handle.proxy_id) {
            match &outcome {
                ReleaseOutcome::Success { latency_ms } => {
                    proxy.consecutive_failures = 0;
                    proxy.success_count += 1;
                    proxy.last_success_at = Some(now);
                    proxy.avg_latency_ms = Some(fold_latency(proxy.avg_latency_ms, *latency_ms));
                }
                ReleaseOutcome::Failure { reason } => {
                    proxy.consecutive_failures += 1;
                    proxy.last_failure_at = Some(now);
                    if proxy.consecutive_failures == self.cfg.global_failure_threshold {
                        warn!(
                            proxy_id = %proxy.id,
                            reason = %reason,
                            "proxy reached global failure threshold"
                        );
                    }
                }
            }
            proxy.updated_at = now;
        }
        Ok(summary)
    }

    /// Per-binding health summary for one host.
    pub async fn stats(&self, host_id: &HostId) -> Result<Vec<BindingStats>> {
        let inner = self.inner.read().await;
        let now = Utc::now();
        let mut out = Vec::new();
        for binding_id in inner.by_host.get(host_id).into_iter().flatten() {
            let binding = match inner.bindings.get(binding_id) {
                Some(b) => b,
                None => continue,
            };
            let proxy = match inner.proxies.get(&binding.proxy_id) {
                Some(p) => p,
                None => continue,
            };
            out.push(BindingStats {
                binding_id: binding.id.clone(),
                proxy_id: proxy.id.clone(),
                endpoint_url: proxy.endpoint.url(),
                active: binding.active,
                proxy_healthy: proxy.healthy(
                    self.cfg.global_failure_threshold,
                    self.cfg.grace_period_secs,
                    now,
                ),
                last_used_at: binding.last_used_at,
                success_count: binding.success_count,
                consecutive_failures: binding.consecutive_failures,
                avg_latency_ms: binding.avg_latency_ms,
            });
        }
        out.sort_by(|a, b| a.endpoint_url.cmp(&b.endpoint_url));
        Ok(out)
    }

    /// Global view over every proxy.
    pub async fn proxy_overview(&self) -> Vec<Proxy> {
        let inner = self.inner.read().await;
        let mut proxies: Vec<Proxy> = inner.proxies.values().cloned().collect();
        proxies.sort_by(|a, b| a.endpoint.url().cmp(&b.endpoint.url()));
        proxies
    }
}

/// LRU ordering: unused first, then oldest `last_used_at`, then lowest
/// average latency.
fn lru_before(
    a_used: Option<DateTime<Utc>>,
    a_latency: f64,
    b_used: Option<DateTime<Utc>>,
    b_latency: f64,
) -> bool {
    match (a_used, b_used) {
        (None, Some(_)) => true,
        (Some(_), None) => false,
        (a, b) if a != b => a < b,
        _ => a_latency < b_latency,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lru_ordering_treats_null_as_oldest() {
        let now = Utc::now();
        assert!(lru_before(None, 100.0, Some(now), 1.0));
        assert!(!lru_before(Some(now), 1.0, None, 100.0));
        let earlier = now - chrono::Duration::hours(1);
        assert!(lru_before(Some(earlier), 100.0, Some(now), 1.0));
    }

    #[test]
    fn lru_tie_breaks_on_latency() {
        let now = Utc::now();
        assert!(lru_before(Some(now), 50.0, Some(now), 80.0));
        assert!(!lru_before(Some(now), 80.0, Some(now), 50.0));
        assert!(lru_before(None, 50.0, None, 80.0));
    }
}
