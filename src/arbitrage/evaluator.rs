use super::types::DetectorConfig;
use super::{graph, pairwise, triangular};
use crate::dex::calc::{LinearApprox, PreferExact};
use crate::dex::MarketSnapshot;
use crate::models::{Opportunity, Pool};
use crate::pricing::PricingEngine;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// Runs the enabled scans over a snapshot and merges their results.
#[derive(Debug, Clone)]
pub struct OpportunityDetector {
    config: DetectorConfig,
}

impl OpportunityDetector {
    pub fn new(config: DetectorConfig) -> Self {
        tracing::info!(
            pairwise = config.pairwise,
            triangular = config.triangular,
            graph = config.graph,
            notionals = ?config.notionals_usd,
            min_profit_usd = config.min_profit_usd,
            "[INIT] opportunity detector configured"
        );
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Exact concentrated-liquidity quotes from the snapshot take precedence
    /// over the linear approximation.
    pub fn scan(&self, snapshot: &MarketSnapshot) -> Vec<Opportunity> {
        let engine = PricingEngine::new(Arc::new(PreferExact {
            exact: snapshot.quotes.clone(),
            fallback: LinearApprox,
        }));
        self.scan_with(&snapshot.pools, &engine)
    }

    /// Every opportunity found, one per distinct set of pools, most
    /// profitable first.
    pub fn scan_with(&self, pools: &[Arc<Pool>], engine: &PricingEngine) -> Vec<Opportunity> {
        let mut all = Vec::new();
        if self.config.pairwise {
            all.extend(pairwise::scan_pairwise(pools, engine, &self.config));
        }
        if self.config.triangular {
            all.extend(triangular::scan_triangular(pools, engine, &self.config));
        }
        if self.config.graph {
            all.extend(graph::scan_graph(pools, engine, &self.config));
        }

        sort_by_profit(&mut all);
        let mut seen = HashSet::new();
        all.retain(|opp| seen.insert(opp.pool_set()));
        all
    }
}

/// Stable, descending by profit.
pub fn sort_by_profit(opportunities: &mut [Opportunity]) {
    opportunities.sort_by(|a, b| {
        b.profit_usd
            .partial_cmp(&a.profit_usd)
            .unwrap_or(Ordering::Equal)
    });
}

/// Calculate gas cost in USD
pub fn calculate_gas_cost_usd(
    gas_gwei: f64,
    gas_units: f64,
    gas_multiplier: f64,
    native_price_usd: f64,
) -> f64 {
    gas_gwei * 1e-9 * gas_units * gas_multiplier * native_price_usd
}
