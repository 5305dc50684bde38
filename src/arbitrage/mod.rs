//! Opportunity detection over an immutable pool snapshot.

use crate::models::{Hop, Opportunity, OpportunityKind, Pool, PoolLiquidity, u256_to_f64};
use crate::pricing::PricingEngine;
use ethers::types::Address;
use std::sync::Arc;

pub mod evaluator;
pub mod graph;
pub mod pairwise;
pub mod triangular;
pub mod types;

pub use evaluator::{OpportunityDetector, calculate_gas_cost_usd};
pub use types::DetectorConfig;

/// One swap of a route: trade `token_in` for its counterpart on `pool`.
#[derive(Debug, Clone)]
pub struct Leg {
    pub pool: Arc<Pool>,
    pub token_in: Address,
}

/// Prices a route by chaining real quotes: the first leg spends
/// `amount_usd`, every later leg spends exactly what the previous one
/// returned. `None` when any leg cannot be priced.
pub fn evaluate_route(
    engine: &PricingEngine,
    kind: OpportunityKind,
    legs: &[Leg],
    amount_usd: f64,
    notional_usd: f64,
) -> Option<Opportunity> {
    let (first, rest) = legs.split_first()?;
    let first_out = first.pool.counterpart(first.token_in)?.address;
    let quote = engine.simulate_swap(&first.pool, first.token_in, first_out, amount_usd)?;

    let mut hops = Vec::with_capacity(legs.len());
    let mut carried = quote.amount_out;
    hops.push(Hop {
        pool: first.pool.clone(),
        quote,
    });
    for leg in rest {
        let quote = engine.quote_exact_in(&leg.pool, leg.token_in, carried)?;
        carried = quote.amount_out;
        hops.push(Hop {
            pool: leg.pool.clone(),
            quote,
        });
    }
    Opportunity::from_hops(kind, notional_usd, hops)
}

/// Raw reserves of a constant-product pool as (in, out) for `token_in`.
pub fn cp_reserves(pool: &Pool, token_in: Address) -> Option<(f64, f64)> {
    let PoolLiquidity::ConstantProduct { reserve0, reserve1 } = &pool.liquidity else {
        return None;
    };
    if pool.token0.address == token_in {
        Some((u256_to_f64(*reserve0), u256_to_f64(*reserve1)))
    } else if pool.token1.address == token_in {
        Some((u256_to_f64(*reserve1), u256_to_f64(*reserve0)))
    } else {
        None
    }
}

/// Keeps `candidate` if it beats `best` (strictly, so ties keep the earlier one).
fn keep_better(best: &mut Option<Opportunity>, candidate: Opportunity) {
    if best
        .as_ref()
        .is_none_or(|b| candidate.profit_usd > b.profit_usd)
    {
        *best = Some(candidate);
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use crate::models::{Pool, PoolLiquidity, Token};
    use ethers::types::Address;
    use std::sync::Arc;

    pub fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    pub fn usdc() -> Token {
        Token::new("USDC", addr(1), 6)
    }

    pub fn weth() -> Token {
        Token::new("WETH", addr(2), 18)
    }

    pub fn wpol() -> Token {
        Token::new("WPOL", addr(3), 18)
    }

    pub fn price_of(token: &Token) -> f64 {
        match token.symbol.as_str() {
            "WETH" => 2_000.0,
            "WPOL" => 0.5,
            _ => 1.0,
        }
    }

    /// Constant-product pool with reserves in human units, priced at the
    /// fixture USD prices.
    pub fn cp_pool(id: u64, dex: &str, t0: Token, r0: f64, t1: Token, r1: f64) -> Arc<Pool> {
        let p0 = price_of(&t0);
        let p1 = price_of(&t1);
        Arc::new(Pool {
            dex: dex.to_string(),
            address: addr(id),
            liquidity: PoolLiquidity::ConstantProduct {
                reserve0: t0.to_raw(r0),
                reserve1: t1.to_raw(r1),
            },
            tvl_usd: r0 * p0 + r1 * p1,
            token0: t0,
            token1: t1,
            fee_bps: 30,
            price0_usd: Some(p0),
            price1_usd: Some(p1),
        })
    }

    /// USDC -> WETH -> WPOL -> USDC gains roughly 10% before fees.
    pub fn mispriced_triangle() -> Vec<Arc<Pool>> {
        vec![
            cp_pool(100, "quickswap", usdc(), 2_000_000.0, weth(), 1_000.0),
            cp_pool(101, "sushiswap", weth(), 1_000.0, wpol(), 4_400_000.0),
            cp_pool(102, "quickswap", wpol(), 4_000_000.0, usdc(), 2_000_000.0),
        ]
    }
}
