//! Market data: pool snapshots built cache-first over the failover RPC layer.

use crate::cache::{CacheCategory, MultiTierCache};
use crate::errors::{AppError, Result};
use crate::models::{Pool, PoolKind, PoolLiquidity, Token};
use crate::pricing::PriceBook;
use crate::rpc::{FailoverExecutor, HealthReport, RpcClient};
use async_trait::async_trait;
use ethers::types::Address;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

pub mod calc;
pub mod client;
pub mod registry;
pub mod state;

pub use calc::{ClQuoter, LinearApprox, PreferExact, QuoteTable, cp_output};
pub use registry::{PoolRegistry, RegistryPool};
pub use state::{PoolMeta, TvlRecord};

const GAS_PRICE_KEY: &str = "gas_price_gwei";

/// Immutable view of the market for one scan cycle.
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub pools: Vec<Arc<Pool>>,
    /// Exact concentrated-liquidity quotes fetched ahead of detection.
    pub quotes: QuoteTable,
    pub stats: FetchStats,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FetchStats {
    pub checked: usize,
    pub valid: usize,
    pub from_cache: usize,
    pub failed: usize,
    pub incomplete: usize,
    pub low_tvl: usize,
}

/// Producer of pool snapshots and gas prices for the scan loop.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> MarketSnapshot;

    async fn gas_price_gwei(&self) -> Option<f64>;

    /// Share of successful RPC calls, for the cycle summary.
    fn endpoint_success_rate(&self) -> f64 {
        1.0
    }
}

/// On-chain exact quoting, enabled when a quoter address is configured.
#[derive(Debug, Clone)]
pub struct ExactQuoteConfig {
    pub quoter: Address,
    pub notionals_usd: Vec<f64>,
    pub base_tokens: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MarketDataConfig {
    pub min_tvl_usd: f64,
    pub concurrency: usize,
    pub exact_quotes: Option<ExactQuoteConfig>,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            min_tvl_usd: 3_000.0,
            concurrency: 8,
            exact_quotes: None,
        }
    }
}

/// Pool state as read from chain or cache, before USD pricing.
#[derive(Debug, Clone)]
struct RawPool {
    entry: RegistryPool,
    token0: Token,
    token1: Token,
    fee_bps: u32,
    liquidity: PoolLiquidity,
    from_cache: bool,
}

#[derive(Serialize, Deserialize)]
struct HealthFlag {
    healthy: bool,
    error: Option<String>,
}

pub struct MarketDataSource {
    failover: Arc<FailoverExecutor<RpcClient>>,
    cache: Arc<MultiTierCache>,
    registry: Arc<PoolRegistry>,
    prices: Arc<PriceBook>,
    config: MarketDataConfig,
}

impl MarketDataSource {
    pub fn new(
        failover: Arc<FailoverExecutor<RpcClient>>,
        cache: Arc<MultiTierCache>,
        registry: Arc<PoolRegistry>,
        prices: Arc<PriceBook>,
        config: MarketDataConfig,
    ) -> Self {
        Self {
            failover,
            cache,
            registry,
            prices,
            config,
        }
    }

    fn pool_key(entry: &RegistryPool) -> String {
        MultiTierCache::key(&[&entry.dex, &format!("{:#x}", entry.address)])
    }

    async fn fetch_raw(&self, entry: &RegistryPool) -> Result<RawPool> {
        let key = Self::pool_key(entry);

        let cached_meta = self
            .cache
            .get_as::<PoolMeta>(CacheCategory::PoolRegistry, &key);
        let meta_hit = cached_meta.is_some();
        let meta = match cached_meta {
            Some(meta) => meta,
            None => {
                let meta = self
                    .failover
                    .execute("pool_meta", |c| client::read_meta(c, entry))
                    .await?;
                self.cache.set_as(CacheCategory::PoolRegistry, &key, &meta);
                meta
            }
        };

        let token0 = self.registry.token(meta.token0).cloned().ok_or_else(|| {
            AppError::DataIncomplete(format!("unknown token0 {:#x} in {}", meta.token0, entry.pair))
        })?;
        let token1 = self.registry.token(meta.token1).cloned().ok_or_else(|| {
            AppError::DataIncomplete(format!("unknown token1 {:#x} in {}", meta.token1, entry.pair))
        })?;

        let cached_state = self
            .cache
            .get_as::<PoolLiquidity>(CacheCategory::PairPrices, &key);
        let state_hit = cached_state.is_some();
        let liquidity = match cached_state {
            Some(liquidity) => liquidity,
            None => {
                let liquidity = self
                    .failover
                    .execute("pool_state", |c| client::read_liquidity(c, entry))
                    .await?;
                self.cache.set_as(CacheCategory::PairPrices, &key, &liquidity);
                liquidity
            }
        };

        if !state::is_funded(&liquidity) {
            return Err(AppError::DataIncomplete(format!(
                "{} {} has no liquidity",
                entry.dex, entry.pair
            )));
        }

        Ok(RawPool {
            entry: entry.clone(),
            token0,
            token1,
            fee_bps: meta.fee_bps,
            liquidity,
            from_cache: meta_hit && state_hit,
        })
    }

    /// Attaches USD prices and TVL. Fails with `DataIncomplete` when a leg
    /// cannot be priced yet.
    fn price_pool(&self, raw: &RawPool) -> Result<Pool> {
        let key = Self::pool_key(&raw.entry);
        let record = match self.cache.get_as::<TvlRecord>(CacheCategory::TvlData, &key) {
            Some(record) => {
                // later pools may need these legs to derive their own prices
                self.prices.remember(&raw.token0, record.price0_usd);
                self.prices.remember(&raw.token1, record.price1_usd);
                record
            }
            None => {
                let (p0, p1) = state::resolve_prices(
                    &self.prices,
                    &raw.liquidity,
                    &raw.token0,
                    &raw.token1,
                    raw.fee_bps,
                );
                let (Some(price0_usd), Some(price1_usd)) = (p0, p1) else {
                    return Err(AppError::DataIncomplete(format!(
                        "no USD price for {}/{}",
                        raw.token0.symbol, raw.token1.symbol
                    )));
                };
                let tvl_usd = state::tvl_usd(
                    &raw.liquidity,
                    &raw.token0,
                    &raw.token1,
                    price0_usd,
                    price1_usd,
                );
                let record = TvlRecord {
                    tvl_usd,
                    price0_usd,
                    price1_usd,
                };
                self.cache.set_as(CacheCategory::TvlData, &key, &record);
                record
            }
        };
        Ok(state::assemble_pool(
            &raw.entry.dex,
            raw.entry.address,
            raw.token0.clone(),
            raw.token1.clone(),
            raw.fee_bps,
            raw.liquidity.clone(),
            record,
        ))
    }

    /// Exact quoter outputs for the first hop of every ladder notional out of
    /// a base token, on every concentrated pool.
    async fn prefetch_exact_quotes(
        &self,
        pools: &[Arc<Pool>],
        exact: &ExactQuoteConfig,
    ) -> QuoteTable {
        let mut requests = Vec::new();
        for pool in pools.iter().filter(|p| p.kind() == PoolKind::V3) {
            for token_in in [&pool.token0, &pool.token1] {
                if !exact
                    .base_tokens
                    .iter()
                    .any(|b| b.eq_ignore_ascii_case(&token_in.symbol))
                {
                    continue;
                }
                let (Some(token_out), Some(price)) =
                    (pool.counterpart(token_in.address), pool.price_usd(token_in.address))
                else {
                    continue;
                };
                for notional in &exact.notionals_usd {
                    let amount_in = token_in.to_raw(notional / price);
                    requests.push((pool.clone(), token_in.address, token_out.address, amount_in));
                }
            }
        }

        let results: Vec<_> = futures::stream::iter(requests)
            .map(|(pool, token_in, token_out, amount_in)| async move {
                let out = self
                    .failover
                    .execute("quote_exact_input_single", |c| {
                        client::quote_exact_input_single(
                            c,
                            exact.quoter,
                            token_in,
                            token_out,
                            pool.fee_bps,
                            amount_in,
                        )
                    })
                    .await;
                (pool.address, token_in, amount_in, out)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        let mut table = QuoteTable::default();
        for (pool, token_in, amount_in, out) in results {
            match out {
                Ok(amount_out) => table.insert(pool, token_in, amount_in, amount_out),
                Err(e) => {
                    tracing::debug!(pool = ?pool, error = %e, "[DEX] exact quote unavailable")
                }
            }
        }
        table
    }

    /// Probes every endpoint and records the outcome as a long-lived health flag.
    pub async fn health_check(&self) -> HealthReport {
        let report = self.failover.health_check(client::block_number).await;
        for name in &report.working {
            let flag = HealthFlag {
                healthy: true,
                error: None,
            };
            self.cache
                .set_as(CacheCategory::HealthFlags, &MultiTierCache::key(&[name]), &flag);
        }
        for (name, error) in &report.failed {
            tracing::warn!(endpoint = %name, %error, "[RPC] endpoint failed health check");
            let flag = HealthFlag {
                healthy: false,
                error: Some(error.clone()),
            };
            self.cache
                .set_as(CacheCategory::HealthFlags, &MultiTierCache::key(&[name]), &flag);
        }
        report
    }

    pub fn cache(&self) -> &MultiTierCache {
        &self.cache
    }
}

#[async_trait]
impl SnapshotSource for MarketDataSource {
    async fn snapshot(&self) -> MarketSnapshot {
        let started = Instant::now();
        self.prices.clear_derived();
        if let Some(warning) = self.cache.expiration_warning() {
            tracing::info!(%warning, "[CACHE] stale categories will be refetched");
        }

        let entries = self.registry.pools();
        let mut fetched: Vec<(usize, Result<RawPool>)> =
            futures::stream::iter(
                entries
                    .iter()
                    .enumerate()
                    .map(|(i, entry)| async move { (i, self.fetch_raw(entry).await) })
                    .collect::<Vec<_>>(),
            )
                .buffer_unordered(self.config.concurrency.max(1))
                .collect()
                .await;
        fetched.sort_by_key(|(i, _)| *i);

        let mut stats = FetchStats {
            checked: entries.len(),
            ..FetchStats::default()
        };
        let mut pending = Vec::new();
        for (_, result) in fetched {
            match result {
                Ok(raw) => pending.push(raw),
                Err(AppError::DataIncomplete(reason)) => {
                    stats.incomplete += 1;
                    tracing::debug!(%reason, "[DEX] pool skipped");
                }
                Err(e) => {
                    stats.failed += 1;
                    tracing::debug!(error = %e, "[DEX] pool fetch failed");
                }
            }
        }

        // Second pass picks up pools whose price is derived from a pool
        // priced later in the first pass.
        let mut pools = Vec::new();
        for _pass in 0..2 {
            let mut unpriced = Vec::new();
            for raw in pending {
                match self.price_pool(&raw) {
                    Ok(pool) => {
                        if pool.tvl_usd < self.config.min_tvl_usd {
                            stats.low_tvl += 1;
                            continue;
                        }
                        if raw.from_cache {
                            stats.from_cache += 1;
                        }
                        pools.push(Arc::new(pool));
                    }
                    Err(_) => unpriced.push(raw),
                }
            }
            pending = unpriced;
            if pending.is_empty() {
                break;
            }
        }
        stats.incomplete += pending.len();
        stats.valid = pools.len();

        let quotes = match &self.config.exact_quotes {
            Some(exact) => self.prefetch_exact_quotes(&pools, exact).await,
            None => QuoteTable::default(),
        };

        tracing::info!(
            checked = stats.checked,
            valid = stats.valid,
            from_cache = stats.from_cache,
            failed = stats.failed,
            incomplete = stats.incomplete,
            low_tvl = stats.low_tvl,
            exact_quotes = quotes.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[DEX] snapshot ready"
        );

        MarketSnapshot {
            pools,
            quotes,
            stats,
        }
    }

    async fn gas_price_gwei(&self) -> Option<f64> {
        if let Some(gwei) = self
            .cache
            .get_as::<f64>(CacheCategory::GasEstimates, GAS_PRICE_KEY)
        {
            return Some(gwei);
        }
        match self
            .failover
            .execute("gas_price", client::gas_price_gwei)
            .await
        {
            Ok(gwei) => {
                self.cache.set_as(CacheCategory::GasEstimates, GAS_PRICE_KEY, &gwei);
                Some(gwei)
            }
            Err(e) => {
                tracing::warn!(error = %e, "[DEX] gas price unavailable");
                None
            }
        }
    }

    fn endpoint_success_rate(&self) -> f64 {
        self.failover.success_rate()
    }
}
