//! Hand-off of approved opportunities to an executor.

use crate::errors::Result;
use crate::models::Opportunity;
use async_trait::async_trait;

pub mod gate;

pub use gate::{
    ExecutionDecision, ExecutionGate, ExecutionLimits, FlashLoanProvider, GateStats, SubmitOutcome,
};

/// What the executor reports back after attempting a trade.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub success: bool,
    pub tx_ref: Option<String>,
    pub gross_profit_usd: f64,
    pub gas_cost_usd: f64,
}

/// Builds, signs and broadcasts the trade. Lives outside this crate.
///
/// `gas_estimate_usd` is the cost the gate approved the trade at.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        opportunity: &Opportunity,
        gas_estimate_usd: f64,
    ) -> Result<ExecutionReport>;
}

/// Logs the trade it would have sent and reports the quoted numbers,
/// gas included, so dry runs drain the hourly gas budget like real ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunExecutor;

#[async_trait]
impl Executor for DryRunExecutor {
    async fn execute(
        &self,
        opportunity: &Opportunity,
        gas_estimate_usd: f64,
    ) -> Result<ExecutionReport> {
        tracing::info!(
            kind = %opportunity.kind,
            route = %opportunity.route(),
            venues = %opportunity.venues(),
            amount_in_usd = opportunity.amount_in_usd,
            profit_usd = opportunity.profit_usd,
            gas_usd = gas_estimate_usd,
            "[GATE] dry run, not broadcasting"
        );
        Ok(ExecutionReport {
            success: true,
            tx_ref: None,
            gross_profit_usd: opportunity.profit_usd,
            gas_cost_usd: gas_estimate_usd,
        })
    }
}
