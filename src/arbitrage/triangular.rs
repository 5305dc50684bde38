//! Three-token cycles over the undirected pool graph.

use super::{DetectorConfig, Leg, evaluate_route, keep_better};
use crate::models::{Opportunity, OpportunityKind, Pool, Token};
use crate::pricing::PricingEngine;
use ethers::types::Address;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Every triangle `a < b < c` (by address) once, so rotations and
/// reflections of the same cycle never show up twice.
fn enumerate_triangles(
    neighbors: &BTreeMap<Address, BTreeSet<Address>>,
    cap: usize,
) -> Vec<[Address; 3]> {
    let mut triangles = Vec::new();
    for (&a, around_a) in neighbors {
        for &b in around_a.range((std::ops::Bound::Excluded(a), std::ops::Bound::Unbounded)) {
            let Some(around_b) = neighbors.get(&b) else {
                continue;
            };
            for &c in around_b.range((std::ops::Bound::Excluded(b), std::ops::Bound::Unbounded)) {
                if around_a.contains(&c) {
                    triangles.push([a, b, c]);
                    if triangles.len() >= cap {
                        tracing::debug!(cap, "[SCAN] triangle cap reached");
                        return triangles;
                    }
                }
            }
        }
    }
    triangles
}

fn edge_key(a: Address, b: Address) -> (Address, Address) {
    if a <= b { (a, b) } else { (b, a) }
}

pub fn scan_triangular(
    pools: &[Arc<Pool>],
    engine: &PricingEngine,
    config: &DetectorConfig,
) -> Vec<Opportunity> {
    // Deepest venue per token pair; first seen wins ties.
    let mut venues: BTreeMap<(Address, Address), Arc<Pool>> = BTreeMap::new();
    let mut tokens: HashMap<Address, Token> = HashMap::new();
    for pool in pools.iter().filter(|p| p.is_priceable()) {
        let key = pool.pair_key();
        let deeper = venues
            .get(&key)
            .is_none_or(|current| pool.tvl_usd > current.tvl_usd);
        if deeper {
            venues.insert(key, pool.clone());
        }
        tokens.insert(pool.token0.address, pool.token0.clone());
        tokens.insert(pool.token1.address, pool.token1.clone());
    }

    let mut neighbors: BTreeMap<Address, BTreeSet<Address>> = BTreeMap::new();
    for &(a, b) in venues.keys() {
        neighbors.entry(a).or_default().insert(b);
        neighbors.entry(b).or_default().insert(a);
    }

    let triangles = enumerate_triangles(&neighbors, config.max_triangle_paths);
    let mut found = Vec::new();
    for triangle in triangles {
        let [origin, p, q] = orient(triangle, &tokens, config);
        let (Some(op), Some(pq), Some(qo)) = (
            venues.get(&edge_key(origin, p)),
            venues.get(&edge_key(p, q)),
            venues.get(&edge_key(q, origin)),
        ) else {
            continue;
        };

        let forward = [
            Leg {
                pool: op.clone(),
                token_in: origin,
            },
            Leg {
                pool: pq.clone(),
                token_in: p,
            },
            Leg {
                pool: qo.clone(),
                token_in: q,
            },
        ];
        let backward = [
            Leg {
                pool: qo.clone(),
                token_in: origin,
            },
            Leg {
                pool: pq.clone(),
                token_in: q,
            },
            Leg {
                pool: op.clone(),
                token_in: p,
            },
        ];

        let mut best: Option<Opportunity> = None;
        for &notional in &config.notionals_usd {
            for legs in [&forward, &backward] {
                if let Some(opp) =
                    evaluate_route(engine, OpportunityKind::Triangular, legs, notional, notional)
                {
                    keep_better(&mut best, opp);
                }
            }
        }
        let best = best.filter(|o| o.profit_usd > 0.0 && o.profit_usd >= config.min_profit_usd);
        if let Some(opp) = best {
            tracing::debug!(
                route = %opp.route(),
                profit_usd = opp.profit_usd,
                "[SCAN] triangular candidate"
            );
            found.push(opp);
        }
    }
    found
}

/// Rotates the triangle so it starts at its highest-priority base token
/// (lowest address when none is a base token).
fn orient(
    triangle: [Address; 3],
    tokens: &HashMap<Address, Token>,
    config: &DetectorConfig,
) -> [Address; 3] {
    let rank = |a: &Address| {
        tokens
            .get(a)
            .and_then(|t| config.base_rank(&t.symbol))
            .unwrap_or(usize::MAX)
    };
    let start = (0..3).min_by_key(|&i| (rank(&triangle[i]), i)).unwrap_or(0);
    [
        triangle[start],
        triangle[(start + 1) % 3],
        triangle[(start + 2) % 3],
    ]
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;

    fn config() -> DetectorConfig {
        DetectorConfig {
            notionals_usd: vec![1_000.0],
            min_profit_usd: 1.0,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn one_canonical_triangle_regardless_of_pool_order() {
        let base = mispriced_triangle();
        let engine = PricingEngine::default();
        let orders = [[0, 1, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
        let mut routes = Vec::new();
        for order in orders {
            let pools: Vec<_> = order.iter().map(|&i| base[i].clone()).collect();
            let found = scan_triangular(&pools, &engine, &config());
            assert_eq!(found.len(), 1);
            routes.push(found[0].route());
        }
        assert!(routes.iter().all(|r| r == "USDC -> WETH -> WPOL -> USDC"));
    }

    #[test]
    fn deepest_venue_is_used_per_leg() {
        let mut pools = mispriced_triangle();
        // shallower duplicate of the USDC/WETH leg at a worse price
        pools.push(cp_pool(200, "dfyn", usdc(), 20_000.0, weth(), 9.0));
        let found = scan_triangular(&pools, &PricingEngine::default(), &config());
        assert_eq!(found.len(), 1);
        assert!(found[0].hops.iter().all(|h| h.pool.address != addr(200)));
    }

    #[test]
    fn fair_triangle_is_not_reported() {
        let pools = vec![
            cp_pool(100, "quickswap", usdc(), 2_000_000.0, weth(), 1_000.0),
            cp_pool(101, "sushiswap", weth(), 1_000.0, wpol(), 4_000_000.0),
            cp_pool(102, "quickswap", wpol(), 4_000_000.0, usdc(), 2_000_000.0),
        ];
        assert!(scan_triangular(&pools, &PricingEngine::default(), &config()).is_empty());
    }

    #[test]
    fn triangle_cap_limits_enumeration() {
        let mut neighbors: BTreeMap<Address, BTreeSet<Address>> = BTreeMap::new();
        // complete graph on 5 tokens has 10 triangles
        for i in 1..=5u64 {
            for j in 1..=5u64 {
                if i != j {
                    neighbors.entry(addr(i)).or_default().insert(addr(j));
                }
            }
        }
        assert_eq!(enumerate_triangles(&neighbors, usize::MAX).len(), 10);
        assert_eq!(enumerate_triangles(&neighbors, 4).len(), 4);
    }
}
