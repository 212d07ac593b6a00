//! Proxy allocator integration tests: LRU selection, health gates,
//! independent binding counters, grace-period probing.
use chrono::{Duration, Utc};
use crawl_orchestrator::config::ProxyConfig;
use crawl_orchestrator::core::{ErrorKind, HostId};
use crawl_orchestrator::proxy::{
    NewProxy, ProxyAllocator, ProxyEndpoint, ProxyProtocol, ReleaseOutcome,
};

fn endpoint(n: u16) -> ProxyEndpoint {
    ProxyEndpoint::new(format!("10.0.0.{}", n), 8000 + n, ProxyProtocol::Http)
}

async fn allocator_with_proxies(
    host: &HostId,
    count: u16,
) -> (ProxyAllocator, Vec<crawl_orchestrator::core::ProxyId>) {
    let allocator = ProxyAllocator::new(ProxyConfig::default());
    let mut ids = Vec::new();
    for n in 1..=count {
        let id = allocator.add_proxy(NewProxy::new(endpoint(n))).await.unwrap();
        allocator.bind(host, &id, 0).await.unwrap();
        ids.push(id);
    }
    (allocator, ids)
}

#[tokio::test]
async fn lru_selection_prefers_never_used_then_oldest() {
    let host = HostId::generate();
    let (allocator, ids) = allocator_with_proxies(&host, 3).await;

    let t10 = Utc::now();
    let t11 = t10 + Duration::hours(1);
    let t12 = t10 + Duration::hours(2);

    // Warm up: P1 used at 10:00, P2 at 11:00, P3 never.
    let h1 = allocator.acquire(&host, t10).await.unwrap();
    assert_eq!(h1.proxy_id, ids[0]);
    let h2 = allocator.acquire(&host, t11).await.unwrap();
    assert_eq!(h2.proxy_id, ids[1]);

    // Null last_used_at sorts oldest.
    let h3 = allocator.acquire(&host, t12).await.unwrap();
    assert_eq!(h3.proxy_id, ids[2]);
    allocator
        .release(&h3, ReleaseOutcome::Success { latency_ms: 30 })
        .await
        .unwrap();

    // Then the 10:00 binding, then the 11:00 one.
    let h4 = allocator.acquire(&host, t12 + Duration::minutes(1)).await.unwrap();
    assert_eq!(h4.proxy_id, ids[0]);
    let h5 = allocator.acquire(&host, t12 + Duration::minutes(2)).await.unwrap();
    assert_eq!(h5.proxy_id, ids[1]);
}

#[tokio::test]
async fn concurrent_acquires_never_share_an_identity() {
    let host = HostId::generate();
    let (allocator, _ids) = allocator_with_proxies(&host, 3).await;

    let now = Utc::now();
    let a = allocator.acquire(&host, now).await.unwrap();
    let b = allocator.acquire(&host, now).await.unwrap();
    let c = allocator.acquire(&host, now).await.unwrap();
    assert_ne!(a.proxy_id, b.proxy_id);
    assert_ne!(b.proxy_id, c.proxy_id);
    assert_ne!(a.proxy_id, c.proxy_id);
}

#[tokio::test]
async fn binding_failure_threshold_gates_selection() {
    let host = HostId::generate();
    let (allocator, ids) = allocator_with_proxies(&host, 2).await;

    // Fail the first proxy's binding to the threshold.
    let mut last_summary = None;
    for _ in 0..5 {
        let mut handle = allocator.acquire(&host, Utc::now()).await.unwrap();
        // Make sure we are failing the same binding every time.
        while handle.proxy_id != ids[0] {
            allocator
                .release(&handle, ReleaseOutcome::Success { latency_ms: 5 })
                .await
                .unwrap();
            handle = allocator.acquire(&host, Utc::now()).await.unwrap();
        }
        last_summary = Some(
            allocator
                .release(
                    &handle,
                    ReleaseOutcome::Failure {
                        reason: "connect timeout".to_string(),
                    },
                )
                .await
                .unwrap(),
        );
    }
    // The fifth failure reports the binding as tripped.
    let summary = last_summary.unwrap();
    assert!(!summary.binding_active);
    assert_eq!(summary.consecutive_failures, 5);

    let stats = allocator.stats(&host).await.unwrap();
    let tripped = stats.iter().find(|s| s.proxy_id == ids[0]).unwrap();
    assert!(!tripped.active);
    assert_eq!(tripped.consecutive_failures, 5);

    // The tripped binding is never selected again.
    for _ in 0..4 {
        let handle = allocator.acquire(&host, Utc::now()).await.unwrap();
        assert_eq!(handle.proxy_id, ids[1]);
        allocator
            .release(&handle, ReleaseOutcome::Success { latency_ms: 5 })
            .await
            .unwrap();
    }

    // Until an admin revives it.
    allocator.revive_binding(&host, &ids[0]).await.unwrap();
    let stats = allocator.stats(&host).await.unwrap();
    let revived = stats.iter().find(|s| s.proxy_id == ids[0]).unwrap();
    assert!(revived.active);
    assert_eq!(revived.consecutive_failures, 0);
}

#[tokio::test]
async fn binding_counters_are_independent_per_host() {
    let host_a = HostId::generate();
    let host_b = HostId::generate();
    let allocator = ProxyAllocator::new(ProxyConfig::default());
    let proxy = allocator
        .add_proxy(NewProxy::new(endpoint(1)))
        .await
        .unwrap();
    allocator.bind(&host_a, &proxy, 0).await.unwrap();
    allocator.bind(&host_b, &proxy, 0).await.unwrap();

    // Trip the binding against host A only.
    for _ in 0..5 {
        let handle = allocator.acquire(&host_a, Utc::now()).await.unwrap();
        allocator
            .release(
                &handle,
                ReleaseOutcome::Failure {
                    reason: "blocked".to_string(),
                },
            )
            .await
            .unwrap();
    }
    let err = allocator.acquire(&host_a, Utc::now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoProxyAvailable);

    // Host B's binding still works: the proxy's global streak (5) is
    // under the global threshold (10).
    let handle = allocator.acquire(&host_b, Utc::now()).await.unwrap();
    assert_eq!(handle.proxy_id, proxy);
}

#[tokio::test]
async fn global_threshold_disables_proxy_until_grace_probe() {
    let host_a = HostId::generate();
    let host_b = HostId::generate();
    let host_c = HostId::generate();
    let allocator = ProxyAllocator::new(ProxyConfig::default());
    let proxy = allocator
        .add_proxy(NewProxy::new(endpoint(1)))
        .await
        .unwrap();
    for host in [&host_a, &host_b, &host_c] {
        allocator.bind(host, &proxy, 0).await.unwrap();
    }

    // Ten consecutive failures spread over two hosts reach the global
    // threshold without tripping host C's binding.
    for host in [&host_a, &host_b] {
        for _ in 0..5 {
            let handle = allocator.acquire(host, Utc::now()).await.unwrap();
            allocator
                .release(
                    &handle,
                    ReleaseOutcome::Failure {
                        reason: "refused".to_string(),
                    },
                )
                .await
                .unwrap();
        }
    }

    // Host C's binding is clean but the proxy itself is unhealthy.
    let err = allocator.acquire(&host_c, Utc::now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoProxyAvailable);

    // After the grace period the proxy may be probed again, and a
    // success restores it.
    let after_grace = Utc::now() + Duration::seconds(1801);
    let handle = allocator.acquire(&host_c, after_grace).await.unwrap();
    allocator
        .release(&handle, ReleaseOutcome::Success { latency_ms: 20 })
        .await
        .unwrap();
    let proxy_row = allocator.get_proxy(&proxy).await.unwrap();
    assert_eq!(proxy_row.consecutive_failures, 0);
    assert!(allocator.acquire(&host_c, Utc::now()).await.is_ok());
}

#[tokio::test]
async fn latency_folds_as_half_weighted_average() {
    let host = HostId::generate();
    let (allocator, ids) = allocator_with_proxies(&host, 1).await;

    for latency in [100, 200] {
        let handle = allocator.acquire(&host, Utc::now()).await.unwrap();
        allocator
            .release(&handle, ReleaseOutcome::Success { latency_ms: latency })
            .await
            .unwrap();
    }
    let stats = allocator.stats(&host).await.unwrap();
    let s = stats.iter().find(|s| s.proxy_id == ids[0]).unwrap();
    assert_eq!(s.avg_latency_ms, Some(150.0));
    assert_eq!(s.success_count, 2);
    assert_eq!(s.consecutive_failures, 0);
}

#[tokio::test]
async fn bind_is_unique_and_removal_cascades() {
    let host = HostId::generate();
    let allocator = ProxyAllocator::new(ProxyConfig::default());
    let proxy = allocator
        .add_proxy(NewProxy::new(endpoint(1)))
        .await
        .unwrap();
    allocator.bind(&host, &proxy, 0).await.unwrap();

    let err = allocator.bind(&host, &proxy, 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    allocator.remove_proxy(&proxy).await.unwrap();
    assert!(allocator.stats(&host).await.unwrap().is_empty());
    let err = allocator.acquire(&host, Utc::now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoProxyAvailable);
}

#[tokio::test]
async fn admin_disable_overrides_health() {
    let host = HostId::generate();
    let (allocator, ids) = allocator_with_proxies(&host, 1).await;

    allocator.set_proxy_active(&ids[0], false).await.unwrap();
    let err = allocator.acquire(&host, Utc::now()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoProxyAvailable);

    allocator.set_proxy_active(&ids[0], true).await.unwrap();
    assert!(allocator.acquire(&host, Utc::now()).await.is_ok());
}
