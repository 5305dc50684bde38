//! Multi-hop cycle search over the directed exchange-rate graph.

use super::{DetectorConfig, Leg, evaluate_route, keep_better};
use crate::dex::calc::spot_rate;
use crate::models::{Opportunity, OpportunityKind, Pool};
use crate::pricing::PricingEngine;
use ethers::types::Address;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Directed edge: trade into `to` on `pool` at a fee-adjusted marginal rate.
#[derive(Debug, Clone)]
struct Edge {
    to: Address,
    pool: Arc<Pool>,
    rate: f64,
}

/// A simple cycle whose compounded marginal rate exceeds 1.
#[derive(Debug, Clone)]
pub struct RateCycle {
    pub start: Address,
    pub legs: Vec<Leg>,
    pub compounded_rate: f64,
}

/// Best-rate edge per ordered token pair, skipping pools below the liquidity
/// floor.
fn build_edges(pools: &[Arc<Pool>], min_liquidity_usd: f64) -> BTreeMap<Address, Vec<Edge>> {
    let mut best: BTreeMap<(Address, Address), Edge> = BTreeMap::new();
    for pool in pools
        .iter()
        .filter(|p| p.is_priceable() && p.tvl_usd >= min_liquidity_usd)
    {
        let fee = 1.0 - pool.fee_bps as f64 / 10_000.0;
        for (from, to) in [
            (pool.token0.address, pool.token1.address),
            (pool.token1.address, pool.token0.address),
        ] {
            let Some(rate) = spot_rate(pool, from).map(|r| r * fee) else {
                continue;
            };
            let better = best.get(&(from, to)).is_none_or(|e| rate > e.rate);
            if better {
                best.insert(
                    (from, to),
                    Edge {
                        to,
                        pool: pool.clone(),
                        rate,
                    },
                );
            }
        }
    }
    let mut adjacency: BTreeMap<Address, Vec<Edge>> = BTreeMap::new();
    for ((from, _), edge) in best {
        adjacency.entry(from).or_default().push(edge);
    }
    adjacency
}

struct Search<'a> {
    adjacency: &'a BTreeMap<Address, Vec<Edge>>,
    max_hops: usize,
    cap: usize,
    /// Edges left to follow; the search stops when this reaches zero.
    budget: usize,
    seen: HashSet<Vec<Address>>,
    cycles: Vec<RateCycle>,
}

impl Search<'_> {
    fn exhausted(&self) -> bool {
        self.cycles.len() >= self.cap || self.budget == 0
    }

    fn dfs(&mut self, start: Address, path: &mut Vec<Address>, legs: &mut Vec<Leg>, rate: f64) {
        if self.exhausted() || legs.len() >= self.max_hops {
            return;
        }
        let Some(current) = path.last().copied() else {
            return;
        };
        let Some(edges) = self.adjacency.get(&current) else {
            return;
        };
        for edge in edges {
            if self.exhausted() {
                return;
            }
            self.budget -= 1;
            let compounded = rate * edge.rate;
            if edge.to == start {
                // a cycle needs at least three distinct tokens
                if path.len() >= 3 && compounded > 1.0 {
                    let mut closed = legs.clone();
                    closed.push(Leg {
                        pool: edge.pool.clone(),
                        token_in: current,
                    });
                    self.record(start, path, closed, compounded);
                }
                continue;
            }
            if path.contains(&edge.to) {
                continue;
            }
            path.push(edge.to);
            legs.push(Leg {
                pool: edge.pool.clone(),
                token_in: current,
            });
            self.dfs(start, path, legs, compounded);
            legs.pop();
            path.pop();
        }
    }

    fn record(&mut self, start: Address, path: &[Address], legs: Vec<Leg>, rate: f64) {
        // Same directed cycle entered at a different token.
        let min = path
            .iter()
            .enumerate()
            .min_by_key(|(_, a)| **a)
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut canonical = path[min..].to_vec();
        canonical.extend_from_slice(&path[..min]);
        if self.seen.insert(canonical) && self.cycles.len() < self.cap {
            self.cycles.push(RateCycle {
                start,
                legs,
                compounded_rate: rate,
            });
        }
    }
}

/// All simple cycles up to `max_hops` from the configured base tokens whose
/// fee-adjusted compounded rate is above 1. Dense graphs may end the search
/// early once `max_graph_expansions` edges have been followed.
pub fn find_rate_cycles(pools: &[Arc<Pool>], config: &DetectorConfig) -> Vec<RateCycle> {
    search_cycles(pools, config).0
}

/// Cycles found plus the number of edges followed.
fn search_cycles(pools: &[Arc<Pool>], config: &DetectorConfig) -> (Vec<RateCycle>, usize) {
    let adjacency = build_edges(pools, config.min_edge_liquidity_usd);

    let mut starts: Vec<(usize, Address)> = Vec::new();
    for pool in pools {
        for token in [&pool.token0, &pool.token1] {
            if let Some(rank) = config.base_rank(&token.symbol) {
                if !starts.iter().any(|(_, a)| *a == token.address) {
                    starts.push((rank, token.address));
                }
            }
        }
    }
    starts.sort();

    let mut search = Search {
        adjacency: &adjacency,
        max_hops: config.max_hops,
        cap: config.max_graph_cycles,
        budget: config.max_graph_expansions,
        seen: HashSet::new(),
        cycles: Vec::new(),
    };
    for (_, start) in starts {
        if search.exhausted() {
            break;
        }
        let mut path = vec![start];
        let mut legs = Vec::new();
        search.dfs(start, &mut path, &mut legs, 1.0);
    }
    let expansions = config.max_graph_expansions - search.budget;
    if search.budget == 0 {
        tracing::warn!(
            expansions,
            cycles = search.cycles.len(),
            "[SCAN] graph search budget exhausted, results are partial"
        );
    }
    (search.cycles, expansions)
}

pub fn scan_graph(
    pools: &[Arc<Pool>],
    engine: &PricingEngine,
    config: &DetectorConfig,
) -> Vec<Opportunity> {
    let cycles = find_rate_cycles(pools, config);
    tracing::debug!(cycles = cycles.len(), "[SCAN] rate-positive cycles");

    let mut found = Vec::new();
    for cycle in cycles {
        let mut best: Option<Opportunity> = None;
        for &notional in &config.notionals_usd {
            if let Some(opp) =
                evaluate_route(engine, OpportunityKind::Graph, &cycle.legs, notional, notional)
            {
                keep_better(&mut best, opp);
            }
        }
        let best = best.filter(|o| o.profit_usd > 0.0 && o.profit_usd >= config.min_profit_usd);
        if let Some(opp) = best {
            tracing::debug!(
                route = %opp.route(),
                rate = cycle.compounded_rate,
                profit_usd = opp.profit_usd,
                "[SCAN] graph candidate"
            );
            found.push(opp);
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::models::Token;

    fn config(max_hops: usize) -> DetectorConfig {
        DetectorConfig {
            notionals_usd: vec![1_000.0],
            min_profit_usd: 1.0,
            graph: true,
            max_hops,
            min_edge_liquidity_usd: 10_000.0,
            ..DetectorConfig::default()
        }
    }

    #[test]
    fn finds_the_mispriced_triangle_once() {
        let pools = mispriced_triangle();
        let cycles = find_rate_cycles(&pools, &config(4));
        assert_eq!(cycles.len(), 1, "rotations from WETH/WPOL starts deduplicated");
        assert!(cycles[0].compounded_rate > 1.0);
        assert_eq!(cycles[0].start, usdc().address);

        let found = scan_graph(&pools, &PricingEngine::default(), &config(4));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, OpportunityKind::Graph);
        assert_eq!(found[0].route(), "USDC -> WETH -> WPOL -> USDC");
    }

    #[test]
    fn hop_limit_cuts_long_cycles() {
        let dai = Token::new("DAI", addr(4), 18);
        // USDC -> WETH -> WPOL -> DAI -> USDC, mispriced on the WPOL/DAI leg
        let pools = vec![
            cp_pool(100, "quickswap", usdc(), 2_000_000.0, weth(), 1_000.0),
            cp_pool(101, "sushiswap", weth(), 1_000.0, wpol(), 4_000_000.0),
            cp_pool(102, "quickswap", wpol(), 4_000_000.0, dai.clone(), 2_200_000.0),
            cp_pool(103, "sushiswap", dai, 2_000_000.0, usdc(), 2_000_000.0),
        ];
        assert_eq!(find_rate_cycles(&pools, &config(4)).len(), 1);
        assert!(find_rate_cycles(&pools, &config(3)).is_empty());
    }

    #[test]
    fn thin_pools_are_not_edges() {
        let pools = vec![
            cp_pool(100, "quickswap", usdc(), 2_000.0, weth(), 1.0),
            cp_pool(101, "sushiswap", weth(), 1.0, wpol(), 4_400.0),
            cp_pool(102, "quickswap", wpol(), 4_000.0, usdc(), 2_000.0),
        ];
        assert!(find_rate_cycles(&pools, &config(4)).is_empty());
    }

    /// Every token paired with every other at fair prices: no profitable
    /// cycle exists, so an unbounded search walks every simple path.
    fn dense_market(tokens: u64) -> Vec<Arc<Pool>> {
        let mut all = vec![usdc()];
        all.extend((10..10 + tokens - 1).map(|n| Token::new(format!("T{n}"), addr(n), 18)));
        let mut pools = Vec::new();
        let mut id = 1_000;
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                let (ra, rb) = (1_000_000.0, 1_000_000.0);
                pools.push(cp_pool(id, "quickswap", a.clone(), ra, b.clone(), rb));
                id += 1;
            }
        }
        pools
    }

    #[test]
    fn expansion_budget_bounds_dense_graphs() {
        let pools = dense_market(12);
        let tight = DetectorConfig {
            max_graph_expansions: 500,
            ..config(6)
        };
        let (cycles, expansions) = search_cycles(&pools, &tight);
        assert!(cycles.is_empty());
        assert_eq!(expansions, 500);

        let roomy = DetectorConfig {
            max_graph_expansions: 5_000,
            ..config(6)
        };
        assert_eq!(search_cycles(&pools, &roomy).1, 5_000);
    }

    #[test]
    fn small_graphs_finish_well_inside_the_budget() {
        let (cycles, expansions) = search_cycles(&mispriced_triangle(), &config(4));
        assert_eq!(cycles.len(), 1);
        assert!(expansions < DetectorConfig::default().max_graph_expansions);
    }
}
