use anyhow::Result;
use dex_arb_scanner::{
    aggregator::Scanner,
    arbitrage::OpportunityDetector,
    cache::MultiTierCache,
    config::{AppConfig, load_endpoints},
    dex::{MarketDataSource, PoolRegistry},
    execution::{DryRunExecutor, ExecutionGate, Executor},
    pricing::{PriceBook, StaticPriceSource},
    rpc::{self, EndpointPool, FailoverExecutor, PatternClassifier},
    utils::{self, Clock, SystemClock},
};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    utils::init_logging();

    let config = AppConfig::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let specs = load_endpoints(&config.rpc_endpoints_path)?;
    if specs.is_empty() {
        anyhow::bail!(
            "no RPC endpoints configured in {}",
            config.rpc_endpoints_path.display()
        );
    }
    let pool = EndpointPool::new(
        rpc::connect(&specs)?,
        clock.clone(),
        Arc::new(PatternClassifier::default()),
    );
    let failover = Arc::new(FailoverExecutor::new(pool, config.failover.clone()));

    let cache = Arc::new(match &config.cache_dir {
        Some(dir) => MultiTierCache::persistent(dir.clone(), clock.clone()),
        None => MultiTierCache::in_memory(clock.clone()),
    });
    let registry = Arc::new(PoolRegistry::load(&config.pool_registry_path)?);
    let prices = Arc::new(PriceBook::new(Arc::new(StaticPriceSource::new(
        config.usd_prices.clone(),
    ))));

    tracing::info!(
        endpoints = specs.len(),
        pools = registry.len(),
        scan_interval_s = config.scan_interval.as_secs(),
        auto_execute = config.auto_execute,
        "[INIT] dex-arb-scanner starting"
    );

    let source = Arc::new(MarketDataSource::new(
        failover,
        cache.clone(),
        registry,
        prices,
        config.market.clone(),
    ));
    let health = source.health_check().await;
    tracing::info!(
        working = health.working.len(),
        failed = health.failed.len(),
        "[INIT] endpoint health check"
    );
    if health.working.is_empty() {
        tracing::warn!("[INIT] no endpoint answered, running from cache until one recovers");
    }

    let gate = Arc::new(ExecutionGate::new(config.limits.clone(), clock.clone()));
    // Never broadcasts: approved candidates are only logged.
    let executor: Option<Arc<dyn Executor>> = if config.auto_execute {
        Some(Arc::new(DryRunExecutor))
    } else {
        None
    };
    let scanner = Scanner::new(
        source,
        OpportunityDetector::new(config.detector.clone()),
        gate.clone(),
        executor,
        config.gas,
        config.native_token.clone(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("[INIT] shutdown requested, finishing current cycle");
            let _ = shutdown_tx.send(true);
        }
    });

    scanner.run(config.scan_interval, shutdown_rx).await;

    cache.flush_all();
    let stats = gate.stats();
    tracing::info!(
        approved = stats.approved,
        rejected = stats.rejected,
        succeeded = stats.succeeded,
        failed = stats.failed,
        total_profit_usd = stats.total_profit_usd,
        "[INIT] final gate stats"
    );
    Ok(())
}
