//! Two-venue round trips on the same token pair.

use super::{DetectorConfig, Leg, cp_reserves, evaluate_route, keep_better};
use crate::dex::calc::optimal_cp_round_trip_input;
use crate::models::{Opportunity, OpportunityKind, Pool, PoolKind, Token};
use crate::pricing::PricingEngine;
use ethers::types::Address;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Best round trip per token pair: buy the non-base token on one venue, sell
/// it back on another. At most one opportunity per pair.
pub fn scan_pairwise(
    pools: &[Arc<Pool>],
    engine: &PricingEngine,
    config: &DetectorConfig,
) -> Vec<Opportunity> {
    let mut markets: BTreeMap<(Address, Address), Vec<Arc<Pool>>> = BTreeMap::new();
    for pool in pools.iter().filter(|p| p.is_priceable()) {
        let venues = markets.entry(pool.pair_key()).or_default();
        if venues.iter().all(|v| v.address != pool.address) {
            venues.push(pool.clone());
        }
    }

    let mut found = Vec::new();
    for venues in markets.values().filter(|v| v.len() >= 2) {
        let base = pick_base(&venues[0], config);
        let mut best: Option<Opportunity> = None;
        for &notional in &config.notionals_usd {
            for buy in venues {
                for sell in venues {
                    if buy.address == sell.address {
                        continue;
                    }
                    let Some(opp) = round_trip(engine, buy, sell, &base, notional) else {
                        continue;
                    };
                    if opp.profit_usd >= config.min_profit_usd {
                        keep_better(&mut best, opp);
                    }
                }
            }
        }
        if let Some(opp) = best {
            tracing::debug!(
                route = %opp.route(),
                venues = %opp.venues(),
                profit_usd = opp.profit_usd,
                "[SCAN] pairwise candidate"
            );
            found.push(opp);
        }
    }
    found
}

/// Base side of a pair: the higher-priority configured base token, else token0.
fn pick_base(pool: &Pool, config: &DetectorConfig) -> Token {
    let r0 = config.base_rank(&pool.token0.symbol);
    let r1 = config.base_rank(&pool.token1.symbol);
    match (r0, r1) {
        (Some(a), Some(b)) if b < a => pool.token1.clone(),
        (None, Some(_)) => pool.token1.clone(),
        _ => pool.token0.clone(),
    }
}

/// base -> quote on `buy`, quote -> base on `sell`. Two constant-product
/// venues trade the closed-form optimal size, capped at `notional_usd`.
fn round_trip(
    engine: &PricingEngine,
    buy: &Arc<Pool>,
    sell: &Arc<Pool>,
    base: &Token,
    notional_usd: f64,
) -> Option<Opportunity> {
    let quote_token = buy.counterpart(base.address)?.address;
    let mut size_usd = notional_usd;

    if buy.kind() == PoolKind::V2 && sell.kind() == PoolKind::V2 {
        let (a_in, a_out) = cp_reserves(buy, base.address)?;
        let (b_in, b_out) = cp_reserves(sell, quote_token)?;
        let optimal_raw =
            optimal_cp_round_trip_input(a_in, a_out, buy.fee_bps, b_in, b_out, sell.fee_bps)?;
        let price = buy.price_usd(base.address)?;
        let optimal_usd = optimal_raw / 10f64.powi(base.decimals as i32) * price;
        size_usd = size_usd.min(optimal_usd);
    }

    let legs = [
        Leg {
            pool: buy.clone(),
            token_in: base.address,
        },
        Leg {
            pool: sell.clone(),
            token_in: quote_token,
        },
    ];
    evaluate_route(engine, OpportunityKind::Pairwise, &legs, size_usd, notional_usd)
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    fn config(notional: f64, min_profit: f64) -> DetectorConfig {
        DetectorConfig {
            notionals_usd: vec![notional],
            min_profit_usd: min_profit,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn two_pool_usdc_weth_round_trip_is_profitable_but_below_naive() {
        let cheap = cp_pool(10, "quickswap", usdc(), 1_000_000.0, weth(), 500.0);
        let rich = cp_pool(11, "sushiswap", usdc(), 2_000_000.0, weth(), 990.0);
        let pools = vec![cheap.clone(), rich.clone()];

        let found = scan_pairwise(&pools, &PricingEngine::default(), &config(10_000.0, 0.0));
        assert_eq!(found.len(), 1);
        let opp = &found[0];
        assert!(opp.profit_usd > 0.0);
        assert_eq!(opp.hops[0].pool.address, cheap.address, "buys WETH where it is cheaper");
        assert_eq!(opp.hops[1].pool.address, rich.address);
        assert_eq!(opp.route(), "USDC -> WETH -> USDC");
        assert_eq!(opp.hops[0].quote.amount_out, opp.hops[1].quote.amount_in);

        // no fee, no slippage: buy at 2000, sell at 2020.2
        let naive = 10_000.0 * (2_000_000.0 / 990.0 / 2_000.0 - 1.0);
        assert!(opp.profit_usd < naive);
        assert_eq!(opp.notional_usd, 10_000.0);
        assert!(opp.amount_in_usd <= 10_000.0);
    }

    #[test]
    fn equal_prices_yield_nothing() {
        let a = cp_pool(10, "quickswap", usdc(), 1_000_000.0, weth(), 500.0);
        let b = cp_pool(11, "sushiswap", usdc(), 2_000_000.0, weth(), 1_000.0);
        let found = scan_pairwise(&[a, b], &PricingEngine::default(), &config(10_000.0, 0.0));
        assert!(found.is_empty());
    }

    #[test]
    fn single_venue_pairs_are_ignored() {
        let a = cp_pool(10, "quickswap", usdc(), 1_000_000.0, weth(), 500.0);
        let same = a.clone();
        let found = scan_pairwise(&[a, same], &PricingEngine::default(), &config(10_000.0, 0.0));
        assert!(found.is_empty());
    }

    #[test]
    fn min_profit_threshold_filters() {
        let cheap = cp_pool(10, "quickswap", usdc(), 1_000_000.0, weth(), 500.0);
        let rich = cp_pool(11, "sushiswap", usdc(), 2_000_000.0, weth(), 990.0);
        let found = scan_pairwise(
            &[cheap, rich],
            &PricingEngine::default(),
            &config(10_000.0, 1_000.0),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn base_token_follows_priority_list() {
        let pool = cp_pool(10, "quickswap", weth(), 500.0, usdc(), 1_000_000.0);
        assert_eq!(pick_base(&pool, &DetectorConfig::default()).symbol, "USDC");
        let odd = cp_pool(11, "quickswap", wpol(), 1.0, weth(), 1.0);
        assert_eq!(pick_base(&odd, &DetectorConfig::default()).symbol, "WETH");
    }
}
