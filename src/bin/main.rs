//! Demo binary: wires the full pipeline in-process with one dispatcher,
//! one crawler worker, and one parser worker.
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crawl_orchestrator::broker::BrokerAdapter;
use crawl_orchestrator::config::load_config;
use crawl_orchestrator::control::ControlPlane;
use crawl_orchestrator::core::{ParserTag, TaskStore};
use crawl_orchestrator::dispatcher::Dispatcher;
use crawl_orchestrator::proxy::{NewProxy, ProxyAllocator, ProxyEndpoint, ProxyProtocol};
use crawl_orchestrator::storage::{FileBlobStore, JsonlProductSink};
use crawl_orchestrator::store::{MemoryTaskStore, NewHost, NewTaskOptions};
use crawl_orchestrator::utils::{init_logging, log_startup_info};
use crawl_orchestrator::worker::{CrawlerWorker, NoopParser, ParserRegistry, ParserWorker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    log_startup_info("crawl-orchestrator", crawl_orchestrator::VERSION);

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path.as_deref())?;

    let store = Arc::new(MemoryTaskStore::new(
        cfg.backoff.clone(),
        cfg.url_normalize.clone(),
        cfg.state_deadlines.clone(),
    ));
    let allocator = Arc::new(ProxyAllocator::new(cfg.proxy.clone()));
    let broker = Arc::new(BrokerAdapter::new(&cfg.broker));
    broker.load_state().await.ok();

    let blobs = Arc::new(FileBlobStore::new("data/blobs")?);
    let sink = Arc::new(JsonlProductSink::new("data/products.jsonl")?);

    let mut registry = ParserRegistry::new();
    registry.register(ParserTag::new("generic"), Arc::new(NoopParser));
    let registry = Arc::new(registry);

    let control = ControlPlane::new(store.clone(), allocator.clone(), blobs.clone());

    // Seed a demo host with one bound proxy and a couple of URLs.
    let host_id = control
        .create_host(NewHost::new(
            "example",
            "https://example.com",
            ParserTag::new("generic"),
        ))
        .await?;
    let proxy_id = control
        .add_proxy(NewProxy::new(ProxyEndpoint::new(
            "127.0.0.1",
            8888,
            ProxyProtocol::Http,
        )))
        .await?;
    control.bind_proxy(&host_id, &proxy_id, 0).await?;
    control
        .submit(&host_id, "https://example.com/", NewTaskOptions::default())
        .await?;
    control
        .submit(
            &host_id,
            "https://example.com/about",
            NewTaskOptions {
                priority: crawl_orchestrator::core::Priority::new(1),
                ..NewTaskOptions::default()
            },
        )
        .await?;

    let cancel = CancellationToken::new();

    let dispatcher = Arc::new(Dispatcher::new(
        "dispatcher-1",
        store.clone() as Arc<dyn TaskStore>,
        broker.clone(),
        cfg.dispatcher.clone(),
    ));
    let crawler = Arc::new(CrawlerWorker::new(
        "crawler-1",
        store.clone() as Arc<dyn TaskStore>,
        broker.clone(),
        allocator.clone(),
        blobs.clone(),
        cfg.worker.clone(),
        cfg.dispatcher.clone(),
        cfg.broker.prefetch,
    ));
    let parser = Arc::new(ParserWorker::new(
        "parser-1",
        store.clone() as Arc<dyn TaskStore>,
        broker.clone(),
        blobs.clone(),
        registry,
        sink,
        cfg.worker.clone(),
        cfg.broker.prefetch,
    ));

    let maintenance = BrokerAdapter::start_maintenance(
        broker.clone(),
        Duration::from_secs(30),
        cancel.clone(),
    );
    let checkpoint = MemoryTaskStore::start_checkpointing(
        store.clone(),
        "data/store-checkpoint.json",
        Duration::from_secs(60),
    );

    let dispatcher_task = {
        let cancel = cancel.clone();
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };
    let crawler_task = {
        let cancel = cancel.clone();
        let crawler = crawler.clone();
        tokio::spawn(async move { crawler.run(cancel).await })
    };
    let parser_task = {
        let cancel = cancel.clone();
        let parser = parser.clone();
        tokio::spawn(async move { parser.run(cancel).await })
    };

    info!("orchestrator running; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    cancel.cancel();

    let _ = tokio::join!(dispatcher_task, crawler_task, parser_task);
    maintenance.abort();
    checkpoint.abort();
    store.save_state("data/store-checkpoint.json").await.ok();
    broker.save_state().await.ok();
    Ok(())
}
