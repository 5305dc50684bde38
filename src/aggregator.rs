//! Scan loop: snapshot, detect, gate, dispatch, summarize.

use crate::arbitrage::OpportunityDetector;
use crate::config::GasConfig;
use crate::dex::{MarketSnapshot, SnapshotSource};
use crate::execution::{ExecutionGate, Executor};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// How many candidates get an info line per cycle.
const LOGGED_CANDIDATES: usize = 5;

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub pools_checked: usize,
    pub valid_pools: usize,
    pub opportunities: usize,
    pub approved: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub best_profit_usd: Option<f64>,
    pub gas_cost_usd: f64,
    pub endpoint_success_rate: f64,
    pub elapsed_ms: u64,
}

pub struct Scanner {
    source: Arc<dyn SnapshotSource>,
    detector: OpportunityDetector,
    gate: Arc<ExecutionGate>,
    /// `None` scans and reports without consulting the gate.
    executor: Option<Arc<dyn Executor>>,
    gas: GasConfig,
    native_token: String,
}

impl Scanner {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        detector: OpportunityDetector,
        gate: Arc<ExecutionGate>,
        executor: Option<Arc<dyn Executor>>,
        gas: GasConfig,
        native_token: impl Into<String>,
    ) -> Self {
        Self {
            source,
            detector,
            gate,
            executor,
            gas,
            native_token: native_token.into(),
        }
    }

    pub fn gate(&self) -> &ExecutionGate {
        &self.gate
    }

    /// Runs cycles back to back, `interval` apart, until `shutdown` flips to
    /// true. Returns the number of completed cycles.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> u64 {
        let mut cycles = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }
            cycles += 1;
            self.run_cycle(cycles).await;
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        tracing::info!(cycles, "[INIT] scanner stopped");
        cycles
    }

    pub async fn run_cycle(&self, cycle: u64) -> CycleSummary {
        let started = Instant::now();
        let snapshot = self.source.snapshot().await;
        let gas_gwei = self.source.gas_price_gwei().await;
        let gas_cost_usd = match (gas_gwei, native_price_usd(&snapshot, &self.native_token)) {
            (Some(gwei), Some(native)) => self.gas.cost_usd(gwei, native),
            _ => {
                tracing::debug!(
                    ?gas_gwei,
                    native = %self.native_token,
                    "[SCAN] gas cost unknown, assuming zero"
                );
                0.0
            }
        };

        let opportunities = self.detector.scan(&snapshot);
        let mut summary = CycleSummary {
            cycle,
            pools_checked: snapshot.stats.checked,
            valid_pools: snapshot.pools.len(),
            opportunities: opportunities.len(),
            best_profit_usd: opportunities.first().map(|o| o.profit_usd),
            gas_cost_usd,
            ..CycleSummary::default()
        };

        for opp in opportunities.iter().take(LOGGED_CANDIDATES) {
            tracing::info!(
                kind = %opp.kind,
                route = %opp.route(),
                venues = %opp.venues(),
                amount_in_usd = opp.amount_in_usd,
                profit_usd = opp.profit_usd,
                roi_pct = opp.roi_pct,
                slippage_pct = opp.total_slippage_pct,
                "[SCAN] opportunity"
            );
        }

        if let Some(executor) = &self.executor {
            for opp in &opportunities {
                let outcome = self.gate.submit(opp, gas_cost_usd, executor.as_ref()).await;
                if !outcome.decision.approved {
                    continue;
                }
                summary.approved += 1;
                if let Some(result) = outcome.result {
                    summary.dispatched += 1;
                    if matches!(result, Ok(ref report) if report.success) {
                        summary.succeeded += 1;
                    }
                }
            }
        }

        summary.endpoint_success_rate = self.source.endpoint_success_rate();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;

        if summary.opportunities == 0 {
            tracing::info!(
                cycle,
                pools_checked = summary.pools_checked,
                valid_pools = summary.valid_pools,
                ?gas_gwei,
                gas_cost_usd,
                endpoint_success_rate = summary.endpoint_success_rate,
                "[HEARTBEAT] no opps above threshold"
            );
        } else {
            tracing::info!(
                cycle,
                pools_checked = summary.pools_checked,
                valid_pools = summary.valid_pools,
                opportunities = summary.opportunities,
                approved = summary.approved,
                dispatched = summary.dispatched,
                best_profit_usd = ?summary.best_profit_usd,
                endpoint_success_rate = summary.endpoint_success_rate,
                elapsed_ms = summary.elapsed_ms,
                "[SCAN] cycle complete"
            );
        }
        summary
    }
}

/// USD price of the gas token as priced in this snapshot.
fn native_price_usd(snapshot: &MarketSnapshot, symbol: &str) -> Option<f64> {
    snapshot.pools.iter().find_map(|pool| {
        [&pool.token0, &pool.token1]
            .into_iter()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
            .and_then(|t| pool.price_usd(t.address))
    })
}
