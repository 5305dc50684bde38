//! Configuration loader and application settings.

use crate::arbitrage::{DetectorConfig, calculate_gas_cost_usd};
use crate::dex::{ExactQuoteConfig, MarketDataConfig};
use crate::errors::{AppError, Result};
use crate::execution::{ExecutionLimits, FlashLoanProvider};
use crate::rpc::{FailoverConfig, Tier};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Providers whose paid plans allow the higher request budget.
const PREMIUM_PROVIDERS: [&str; 3] = ["alchemy", "infura", "quicknode"];
const PREMIUM_RATE_LIMIT: u32 = 100;
const DEFAULT_RATE_LIMIT: u32 = 30;

/// One RPC endpoint as configured.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointSpec {
    pub name: String,
    pub url: String,
    pub tier: Tier,
    pub rate_limit_per_minute: u32,
}

#[derive(Debug, Default, Deserialize)]
struct EndpointsFile {
    #[serde(default)]
    primary: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    secondary: Vec<String>,
}

/// Reads `{"primary": {"alchemy": [urls]}, "secondary": [urls]}`.
pub fn load_endpoints(path: impl AsRef<Path>) -> Result<Vec<EndpointSpec>> {
    let raw = std::fs::read_to_string(path.as_ref())?;
    parse_endpoints(&raw)
}

pub fn parse_endpoints(raw: &str) -> Result<Vec<EndpointSpec>> {
    let file: EndpointsFile = serde_json::from_str(raw)?;
    let mut specs = Vec::new();
    for (provider, urls) in &file.primary {
        let premium = PREMIUM_PROVIDERS.contains(&provider.to_lowercase().as_str());
        let rate_limit_per_minute = if premium {
            PREMIUM_RATE_LIMIT
        } else {
            DEFAULT_RATE_LIMIT
        };
        for (i, url) in urls.iter().filter(|u| !u.trim().is_empty()).enumerate() {
            specs.push(EndpointSpec {
                name: format!("{provider}-{}", i + 1),
                url: url.trim().to_string(),
                tier: Tier::Primary,
                rate_limit_per_minute,
            });
        }
    }
    for (i, url) in file.secondary.iter().filter(|u| !u.trim().is_empty()).enumerate() {
        specs.push(EndpointSpec {
            name: format!("secondary-{}", i + 1),
            url: url.trim().to_string(),
            tier: Tier::Secondary,
            rate_limit_per_minute: DEFAULT_RATE_LIMIT,
        });
    }
    Ok(specs)
}

/// Gas configuration loaded from environment variables
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GasConfig {
    pub gas_units: f64,
    pub gas_multiplier: f64,
}

impl Default for GasConfig {
    fn default() -> Self {
        Self {
            gas_units: 350_000.0,
            gas_multiplier: 1.2,
        }
    }
}

impl GasConfig {
    pub fn cost_usd(&self, gas_gwei: f64, native_price_usd: f64) -> f64 {
        calculate_gas_cost_usd(gas_gwei, self.gas_units, self.gas_multiplier, native_price_usd)
    }
}

/// Consolidated application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rpc_endpoints_path: PathBuf,
    pub pool_registry_path: PathBuf,
    /// `None` keeps the cache in memory only.
    pub cache_dir: Option<PathBuf>,
    pub scan_interval: Duration,
    /// Dispatch approved candidates to the dry-run executor.
    pub auto_execute: bool,
    /// Gas is paid in this token.
    pub native_token: String,
    /// Static USD prices for non-stable tokens, `SYM=price` pairs.
    pub usd_prices: Vec<(String, f64)>,
    pub failover: FailoverConfig,
    pub market: MarketDataConfig,
    pub detector: DetectorConfig,
    pub limits: ExecutionLimits,
    pub gas: GasConfig,
}

impl AppConfig {
    /// Loads `.env` if present, then reads the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; unset keys take defaults,
    /// malformed values are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env(&lookup);

        let market_defaults = MarketDataConfig::default();
        let detector_defaults = DetectorConfig::default();
        let failover_defaults = FailoverConfig::default();
        let limit_defaults = ExecutionLimits::default();
        let gas_defaults = GasConfig::default();

        let detector = DetectorConfig {
            base_tokens: env
                .list("BASE_TOKENS")
                .unwrap_or(detector_defaults.base_tokens),
            notionals_usd: match env.list("TEST_AMOUNTS") {
                Some(items) => items
                    .iter()
                    .map(|s| parse_value::<f64>("TEST_AMOUNTS", s))
                    .collect::<Result<Vec<_>>>()?,
                None => detector_defaults.notionals_usd,
            },
            min_profit_usd: env.parse_or("MIN_PROFIT_USD", detector_defaults.min_profit_usd)?,
            pairwise: env.flag_or("ENABLE_PAIRWISE", detector_defaults.pairwise)?,
            triangular: env.flag_or("ENABLE_TRIANGULAR", detector_defaults.triangular)?,
            graph: env.flag_or("ENABLE_GRAPH", detector_defaults.graph)?,
            max_triangle_paths: env
                .parse_or("MAX_TRIANGLE_PATHS", detector_defaults.max_triangle_paths)?,
            max_hops: env.parse_or("MAX_HOPS", detector_defaults.max_hops)?,
            min_edge_liquidity_usd: env.parse_or(
                "MIN_EDGE_LIQUIDITY_USD",
                detector_defaults.min_edge_liquidity_usd,
            )?,
            max_graph_cycles: env.parse_or("MAX_GRAPH_CYCLES", detector_defaults.max_graph_cycles)?,
            max_graph_expansions: env.parse_or(
                "MAX_GRAPH_EXPANSIONS",
                detector_defaults.max_graph_expansions,
            )?,
        };
        if detector.notionals_usd.is_empty() || detector.notionals_usd.iter().any(|n| *n <= 0.0) {
            return Err(AppError::Config("TEST_AMOUNTS must be positive USD amounts".into()));
        }
        if detector.max_hops < 3 {
            return Err(AppError::Config("MAX_HOPS must be at least 3".into()));
        }

        let exact_quotes = match env.get("QUOTER_ADDRESS") {
            Some(raw) => Some(ExactQuoteConfig {
                quoter: Address::from_str(&raw)
                    .map_err(|e| AppError::Config(format!("QUOTER_ADDRESS: {e}")))?,
                notionals_usd: detector.notionals_usd.clone(),
                base_tokens: detector.base_tokens.clone(),
            }),
            None => None,
        };
        let market = MarketDataConfig {
            min_tvl_usd: env.parse_or("MIN_TVL_USD", market_defaults.min_tvl_usd)?,
            concurrency: env.parse_or("FETCH_CONCURRENCY", market_defaults.concurrency)?,
            exact_quotes,
        };

        let failover = FailoverConfig {
            max_retries_per_tier: env
                .parse_or("RPC_MAX_RETRIES", failover_defaults.max_retries_per_tier)?,
            call_timeout: env.secs_or("RPC_TIMEOUT_SECONDS", failover_defaults.call_timeout)?,
            ..failover_defaults
        };

        let flash_loan = if env.flag_or("PREFER_BALANCER", true)? {
            FlashLoanProvider::ZeroFee
        } else {
            FlashLoanProvider::Proportional {
                fee_rate: env.parse_or("FLASH_LOAN_FEE_RATE", FlashLoanProvider::AAVE_FEE_RATE)?,
            }
        };
        let limits = ExecutionLimits {
            enabled: env.flag_or("EXECUTION_ENABLED", limit_defaults.enabled)?,
            min_profit_usd: env.parse_or("MIN_PROFIT_AFTER_FEES", limit_defaults.min_profit_usd)?,
            max_slippage_pct: env.parse_or("MAX_SLIPPAGE_PCT", limit_defaults.max_slippage_pct)?,
            min_pool_tvl_usd: env.parse_or("MIN_POOL_TVL", limit_defaults.min_pool_tvl_usd)?,
            max_trades_per_minute: env
                .parse_or("MAX_TRADES_PER_MINUTE", limit_defaults.max_trades_per_minute)?,
            max_gas_per_hour_usd: env
                .parse_or("MAX_GAS_SPENT_PER_HOUR", limit_defaults.max_gas_per_hour_usd)?,
            cooldown: env.secs_or("COOLDOWN_SECONDS", limit_defaults.cooldown)?,
            kill_on_consecutive_failures: env.parse_or(
                "KILL_ON_CONSECUTIVE_FAILURES",
                limit_defaults.kill_on_consecutive_failures,
            )?,
            flash_loan,
        };

        let gas = GasConfig {
            gas_units: env.parse_or("GAS_UNITS", gas_defaults.gas_units)?,
            gas_multiplier: env.parse_or("GAS_MULTIPLIER", gas_defaults.gas_multiplier)?,
        };

        let usd_prices = match env.list("USD_PRICES") {
            Some(items) => items
                .iter()
                .map(|item| {
                    let (symbol, price) = item.split_once('=').ok_or_else(|| {
                        AppError::Config(format!("USD_PRICES entry {item:?} is not SYM=price"))
                    })?;
                    Ok((symbol.trim().to_uppercase(), parse_value::<f64>("USD_PRICES", price)?))
                })
                .collect::<Result<Vec<_>>>()?,
            None => Vec::new(),
        };

        let cache_dir = match env.get("CACHE_DIR") {
            Some(dir) if dir.eq_ignore_ascii_case("none") => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => Some(PathBuf::from("cache")),
        };

        Ok(Self {
            rpc_endpoints_path: env
                .get("RPC_ENDPOINTS_PATH")
                .unwrap_or_else(|| "rpc_endpoints.json".into())
                .into(),
            pool_registry_path: env
                .get("POOL_REGISTRY_PATH")
                .unwrap_or_else(|| "pool_registry.json".into())
                .into(),
            cache_dir,
            scan_interval: Duration::from_secs(env.parse_or("SCAN_INTERVAL_SECONDS", 60u64)?),
            auto_execute: env.flag_or("AUTO_EXECUTE", false)?,
            native_token: env
                .get("NATIVE_TOKEN")
                .unwrap_or_else(|| "WPOL".into())
                .to_uppercase(),
            usd_prices,
            failover,
            market,
            detector,
            limits,
            gas,
        })
    }
}

struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => parse_value(key, &raw),
            None => Ok(default),
        }
    }

    /// Fractional seconds; negative, NaN and infinite values are rejected.
    fn secs_or(&self, key: &str, default: Duration) -> Result<Duration> {
        match self.get(key) {
            Some(raw) => {
                let secs: f64 = parse_value(key, &raw)?;
                Duration::try_from_secs_f64(secs)
                    .map_err(|e| AppError::Config(format!("{key}={raw:?}: {e}")))
            }
            None => Ok(default),
        }
    }

    fn flag_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.get(key).map(|v| v.to_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(AppError::Config(format!("{key} must be a boolean, got {v:?}"))),
        }
    }

    /// Comma-separated, blanks dropped.
    fn list(&self, key: &str) -> Option<Vec<String>> {
        self.get(key).map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| AppError::Config(format!("{key}={raw:?}: {e}")))
}
