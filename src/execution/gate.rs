//! Safety gate in front of the executor.
//!
//! Checks run in a fixed order and the first failure is the rejection reason:
//! kill switch, consecutive failures, cooldown, trades per minute, gas per
//! hour, net profit, slippage, pool liquidity. Approval reserves the dispatch
//! slot under the same lock, so concurrent submissions never double-count.

use super::{ExecutionReport, Executor};
use crate::errors::Result;
use crate::models::Opportunity;
use crate::utils::{Clock, SystemClock, elapsed_between};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const TRADE_WINDOW: Duration = Duration::from_secs(60);
const GAS_WINDOW: Duration = Duration::from_secs(3600);

/// Who funds the trade and what they charge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FlashLoanProvider {
    /// Balancer-style vault, no fee.
    ZeroFee,
    /// Fee as a fraction of the borrowed notional (Aave: 0.0009).
    Proportional { fee_rate: f64 },
}

impl FlashLoanProvider {
    pub const AAVE_FEE_RATE: f64 = 0.0009;

    pub fn fee_usd(&self, notional_usd: f64) -> f64 {
        match self {
            FlashLoanProvider::ZeroFee => 0.0,
            FlashLoanProvider::Proportional { fee_rate } => notional_usd * fee_rate,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionLimits {
    pub enabled: bool,
    pub min_profit_usd: f64,
    pub max_slippage_pct: f64,
    pub min_pool_tvl_usd: f64,
    pub max_trades_per_minute: usize,
    pub max_gas_per_hour_usd: f64,
    pub cooldown: Duration,
    pub kill_on_consecutive_failures: u32,
    pub flash_loan: FlashLoanProvider,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            enabled: true,
            min_profit_usd: 1.0,
            max_slippage_pct: 3.0,
            min_pool_tvl_usd: 5_000.0,
            max_trades_per_minute: 10,
            max_gas_per_hour_usd: 5.0,
            cooldown: Duration::from_millis(100),
            kill_on_consecutive_failures: 10,
            flash_loan: FlashLoanProvider::ZeroFee,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub approved: bool,
    pub reason: String,
    pub opportunity: Opportunity,
    pub net_profit_usd: f64,
    pub timestamp: SystemTime,
}

/// Decision plus, when dispatched, what the executor said.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub decision: ExecutionDecision,
    pub result: Option<Result<ExecutionReport>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GateStats {
    pub enabled: bool,
    pub kill_reason: Option<String>,
    pub consecutive_failures: u32,
    pub approved: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub success_rate: f64,
    pub total_gas_usd: f64,
    pub total_profit_usd: f64,
    pub trades_last_minute: usize,
    pub gas_last_hour_usd: f64,
}

#[derive(Debug)]
struct GateState {
    enabled: bool,
    kill_reason: Option<String>,
    consecutive_failures: u32,
    last_dispatch: Option<SystemTime>,
    trades: VecDeque<SystemTime>,
    gas: VecDeque<(SystemTime, f64)>,
    approved: u64,
    rejected: u64,
    succeeded: u64,
    failed: u64,
    total_gas_usd: f64,
    total_profit_usd: f64,
}

impl GateState {
    fn prune(&mut self, now: SystemTime) {
        while let Some(t) = self.trades.front() {
            if elapsed_between(*t, now) >= TRADE_WINDOW {
                self.trades.pop_front();
            } else {
                break;
            }
        }
        while let Some((t, _)) = self.gas.front() {
            if elapsed_between(*t, now) >= GAS_WINDOW {
                self.gas.pop_front();
            } else {
                break;
            }
        }
    }

    fn gas_last_hour(&self) -> f64 {
        self.gas.iter().map(|(_, g)| g).sum()
    }
}

pub struct ExecutionGate {
    limits: ExecutionLimits,
    clock: Arc<dyn Clock>,
    state: Mutex<GateState>,
}

impl ExecutionGate {
    pub fn new(limits: ExecutionLimits, clock: Arc<dyn Clock>) -> Self {
        tracing::info!(
            enabled = limits.enabled,
            min_profit_usd = limits.min_profit_usd,
            max_slippage_pct = limits.max_slippage_pct,
            max_trades_per_minute = limits.max_trades_per_minute,
            max_gas_per_hour_usd = limits.max_gas_per_hour_usd,
            "[GATE] execution limits loaded"
        );
        let state = GateState {
            enabled: limits.enabled,
            kill_reason: (!limits.enabled).then(|| "disabled by configuration".to_string()),
            consecutive_failures: 0,
            last_dispatch: None,
            trades: VecDeque::new(),
            gas: VecDeque::new(),
            approved: 0,
            rejected: 0,
            succeeded: 0,
            failed: 0,
            total_gas_usd: 0.0,
            total_profit_usd: 0.0,
        };
        Self {
            limits,
            clock,
            state: Mutex::new(state),
        }
    }

    pub fn with_system_clock(limits: ExecutionLimits) -> Self {
        Self::new(limits, Arc::new(SystemClock))
    }

    pub fn limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Runs every check; on approval the dispatch slot is taken immediately.
    pub fn check(&self, opportunity: &Opportunity, gas_cost_usd: f64) -> ExecutionDecision {
        let now = self.clock.now();
        let flash_fee = self.limits.flash_loan.fee_usd(opportunity.amount_in_usd);
        let net_profit_usd = opportunity.profit_usd - gas_cost_usd - flash_fee;

        let mut state = self.state.lock();
        state.prune(now);
        let verdict = self.evaluate(
            &mut state,
            now,
            opportunity,
            gas_cost_usd,
            flash_fee,
            net_profit_usd,
        );

        let (approved, reason) = match verdict {
            Ok(()) => {
                state.last_dispatch = Some(now);
                state.trades.push_back(now);
                state.approved += 1;
                (true, format!("approved: net profit ${net_profit_usd:.2}"))
            }
            Err(reason) => {
                state.rejected += 1;
                (false, reason)
            }
        };
        drop(state);

        if approved {
            tracing::info!(route = %opportunity.route(), net_profit_usd, "[GATE] approved");
        } else {
            tracing::debug!(route = %opportunity.route(), %reason, "[GATE] rejected");
        }
        ExecutionDecision {
            approved,
            reason,
            opportunity: opportunity.clone(),
            net_profit_usd,
            timestamp: now,
        }
    }

    fn evaluate(
        &self,
        state: &mut GateState,
        now: SystemTime,
        opp: &Opportunity,
        gas_cost_usd: f64,
        flash_fee: f64,
        net_profit_usd: f64,
    ) -> std::result::Result<(), String> {
        let limits = &self.limits;
        if !state.enabled {
            let why = state.kill_reason.as_deref().unwrap_or("manual");
            return Err(format!("kill switch engaged: {why}"));
        }
        if state.consecutive_failures >= limits.kill_on_consecutive_failures {
            let why = format!("{} consecutive failures", state.consecutive_failures);
            trip(state, &why);
            return Err(format!("kill switch engaged: {why}"));
        }
        if let Some(last) = state.last_dispatch {
            let since = elapsed_between(last, now);
            if since < limits.cooldown {
                let remaining = limits.cooldown - since;
                return Err(format!("cooldown: {:.3}s remaining", remaining.as_secs_f64()));
            }
        }
        if state.trades.len() >= limits.max_trades_per_minute {
            return Err(format!(
                "rate limit: {} trades in last 60s (max {})",
                state.trades.len(),
                limits.max_trades_per_minute
            ));
        }
        let gas_spent = state.gas_last_hour();
        if gas_spent >= limits.max_gas_per_hour_usd {
            return Err(format!(
                "gas limit: ${gas_spent:.2} spent in last hour (max ${:.2})",
                limits.max_gas_per_hour_usd
            ));
        }
        if net_profit_usd < limits.min_profit_usd {
            return Err(format!(
                "net profit ${net_profit_usd:.2} below min profit ${:.2} (gross ${:.2}, gas ${gas_cost_usd:.2}, flash loan fee ${flash_fee:.2})",
                limits.min_profit_usd, opp.profit_usd
            ));
        }
        if opp.total_slippage_pct > limits.max_slippage_pct {
            return Err(format!(
                "slippage {:.2}% exceeds max {:.2}%",
                opp.total_slippage_pct, limits.max_slippage_pct
            ));
        }
        if opp.min_tvl_usd < limits.min_pool_tvl_usd {
            return Err(format!(
                "pool liquidity ${:.0} below min ${:.0}",
                opp.min_tvl_usd, limits.min_pool_tvl_usd
            ));
        }
        Ok(())
    }

    /// Feeds an executor result back into the counters. Errors count as
    /// failures and are charged the estimated gas.
    pub fn record_outcome(&self, result: &Result<ExecutionReport>, gas_estimate_usd: f64) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let (success, gas, profit) = match result {
            Ok(report) => (report.success, report.gas_cost_usd, report.gross_profit_usd),
            Err(_) => (false, gas_estimate_usd, 0.0),
        };
        state.gas.push_back((now, gas));
        state.total_gas_usd += gas;
        state.total_profit_usd += profit;
        if success {
            state.succeeded += 1;
            state.consecutive_failures = 0;
        } else {
            state.failed += 1;
            state.consecutive_failures += 1;
            let limit = self.limits.kill_on_consecutive_failures;
            if state.enabled && state.consecutive_failures >= limit {
                let why = format!("{} consecutive failures", state.consecutive_failures);
                trip(&mut state, &why);
            }
        }
    }

    /// Check, dispatch when approved, record the result.
    pub async fn submit(
        &self,
        opportunity: &Opportunity,
        gas_cost_usd: f64,
        executor: &dyn Executor,
    ) -> SubmitOutcome {
        let decision = self.check(opportunity, gas_cost_usd);
        if !decision.approved {
            return SubmitOutcome {
                decision,
                result: None,
            };
        }
        let result = executor.execute(opportunity, gas_cost_usd).await;
        match &result {
            Ok(report) if report.success => {
                tracing::info!(
                    tx = ?report.tx_ref,
                    gross_profit_usd = report.gross_profit_usd,
                    "[GATE] execution succeeded"
                )
            }
            Ok(report) => tracing::warn!(tx = ?report.tx_ref, "[GATE] execution reverted"),
            Err(e) => tracing::warn!(error = %e, "[GATE] execution failed"),
        }
        self.record_outcome(&result, gas_cost_usd);
        SubmitOutcome {
            decision,
            result: Some(result),
        }
    }

    pub fn engage_kill_switch(&self, reason: &str) {
        let mut state = self.state.lock();
        trip(&mut state, reason);
    }

    /// Re-enables dispatch and clears the failure streak.
    pub fn reset_kill_switch(&self) {
        let mut state = self.state.lock();
        state.enabled = true;
        state.kill_reason = None;
        state.consecutive_failures = 0;
        tracing::info!("[GATE] kill switch reset");
    }

    pub fn is_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    pub fn stats(&self) -> GateStats {
        let now = self.clock.now();
        let mut state = self.state.lock();
        state.prune(now);
        let finished = state.succeeded + state.failed;
        GateStats {
            enabled: state.enabled,
            kill_reason: state.kill_reason.clone(),
            consecutive_failures: state.consecutive_failures,
            approved: state.approved,
            rejected: state.rejected,
            succeeded: state.succeeded,
            failed: state.failed,
            success_rate: if finished == 0 {
                0.0
            } else {
                state.succeeded as f64 / finished as f64
            },
            total_gas_usd: state.total_gas_usd,
            total_profit_usd: state.total_profit_usd,
            trades_last_minute: state.trades.len(),
            gas_last_hour_usd: state.gas_last_hour(),
        }
    }
}

fn trip(state: &mut GateState, reason: &str) {
    if state.enabled {
        tracing::error!(%reason, "[GATE] kill switch engaged");
    }
    state.enabled = false;
    state.kill_reason = Some(reason.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::execution::DryRunExecutor;
    use crate::models::OpportunityKind;
    use crate::utils::ManualClock;
    use async_trait::async_trait;

    fn opportunity(profit_usd: f64) -> Opportunity {
        Opportunity {
            kind: OpportunityKind::Pairwise,
            hops: Vec::new(),
            notional_usd: 10_000.0,
            amount_in_usd: 10_000.0,
            amount_out_usd: 10_000.0 + profit_usd,
            profit_usd,
            roi_pct: profit_usd / 100.0,
            total_slippage_pct: 0.5,
            min_tvl_usd: 1_000_000.0,
        }
    }

    fn gate(limits: ExecutionLimits) -> (ExecutionGate, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch_secs(1_700_000_000));
        (ExecutionGate::new(limits, clock.clone()), clock)
    }

    struct ScriptedExecutor {
        succeed: bool,
        error: bool,
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            opp: &Opportunity,
            _gas_estimate_usd: f64,
        ) -> Result<ExecutionReport> {
            if self.error {
                return Err(AppError::ExecutionFailure("nonce too low".into()));
            }
            Ok(ExecutionReport {
                success: self.succeed,
                tx_ref: Some("0xabc".into()),
                gross_profit_usd: if self.succeed { opp.profit_usd } else { 0.0 },
                gas_cost_usd: 0.3,
            })
        }
    }

    #[test]
    fn second_call_inside_cooldown_is_rejected() {
        let (gate, clock) = gate(ExecutionLimits::default());
        let opp = opportunity(20.0);
        assert!(gate.check(&opp, 0.3).approved);
        let second = gate.check(&opp, 0.3);
        assert!(!second.approved);
        assert!(second.reason.contains("cooldown"));

        clock.advance(Duration::from_millis(100));
        assert!(gate.check(&opp, 0.3).approved);
    }

    #[test]
    fn thin_net_profit_is_rejected() {
        let (gate, _clock) = gate(ExecutionLimits::default());
        let decision = gate.check(&opportunity(0.5), 0.3);
        assert!(!decision.approved);
        assert!(decision.reason.contains("profit"));
        assert!((decision.net_profit_usd - 0.2).abs() < 1e-9);
    }

    #[test]
    fn proportional_flash_loan_fee_counts_against_profit() {
        let (gate, _clock) = gate(ExecutionLimits {
            flash_loan: FlashLoanProvider::Proportional {
                fee_rate: FlashLoanProvider::AAVE_FEE_RATE,
            },
            ..ExecutionLimits::default()
        });
        // $9 fee on $10k
        let decision = gate.check(&opportunity(10.0), 0.3);
        assert!(!decision.approved);
        assert!((decision.net_profit_usd - 0.7).abs() < 1e-9);
    }

    #[test]
    fn trade_window_caps_dispatches() {
        let (gate, clock) = gate(ExecutionLimits {
            max_trades_per_minute: 2,
            cooldown: Duration::ZERO,
            ..ExecutionLimits::default()
        });
        let opp = opportunity(20.0);
        assert!(gate.check(&opp, 0.0).approved);
        assert!(gate.check(&opp, 0.0).approved);
        let third = gate.check(&opp, 0.0);
        assert!(third.reason.starts_with("rate limit"));

        clock.advance(Duration::from_secs(60));
        assert!(gate.check(&opp, 0.0).approved);
    }

    #[test]
    fn hourly_gas_budget_blocks_until_it_rolls_off() {
        let (gate, clock) = gate(ExecutionLimits {
            max_gas_per_hour_usd: 1.0,
            cooldown: Duration::ZERO,
            ..ExecutionLimits::default()
        });
        let spent: Result<ExecutionReport> = Ok(ExecutionReport {
            success: true,
            tx_ref: None,
            gross_profit_usd: 5.0,
            gas_cost_usd: 0.6,
        });
        gate.record_outcome(&spent, 0.6);
        gate.record_outcome(&spent, 0.6);
        let blocked = gate.check(&opportunity(20.0), 0.3);
        assert!(blocked.reason.starts_with("gas limit"));

        clock.advance(Duration::from_secs(3600));
        assert!(gate.check(&opportunity(20.0), 0.3).approved);
    }

    #[test]
    fn slippage_then_liquidity_checks() {
        let (gate, clock) = gate(ExecutionLimits::default());
        let mut slippy = opportunity(20.0);
        slippy.total_slippage_pct = 3.5;
        slippy.min_tvl_usd = 10.0;
        assert!(gate.check(&slippy, 0.1).reason.starts_with("slippage"));

        clock.advance(Duration::from_secs(1));
        let mut shallow = opportunity(20.0);
        shallow.min_tvl_usd = 4_000.0;
        assert!(gate.check(&shallow, 0.1).reason.starts_with("pool liquidity"));
    }

    #[test]
    fn consecutive_failures_engage_sticky_kill_switch() {
        let (gate, clock) = gate(ExecutionLimits {
            kill_on_consecutive_failures: 2,
            ..ExecutionLimits::default()
        });
        let failed: Result<ExecutionReport> = Err(AppError::ExecutionFailure("reverted".into()));
        gate.record_outcome(&failed, 0.3);
        assert!(gate.is_enabled());
        gate.record_outcome(&failed, 0.3);
        assert!(!gate.is_enabled());

        clock.advance(Duration::from_secs(600));
        let decision = gate.check(&opportunity(50.0), 0.1);
        assert!(decision.reason.starts_with("kill switch"));

        gate.reset_kill_switch();
        assert!(gate.check(&opportunity(50.0), 0.1).approved);
        let stats = gate.stats();
        assert_eq!(stats.failed, 2);
        assert!((stats.total_gas_usd - 0.6).abs() < 1e-9);
    }

    #[test]
    fn manual_kill_switch_blocks_everything() {
        let (gate, _clock) = gate(ExecutionLimits::default());
        gate.engage_kill_switch("operator stop");
        let decision = gate.check(&opportunity(500.0), 0.0);
        assert!(!decision.approved);
        assert!(decision.reason.contains("operator stop"));
    }

    #[tokio::test]
    async fn submit_dispatches_and_records() {
        let (gate, clock) = gate(ExecutionLimits::default());
        let ok = ScriptedExecutor {
            succeed: true,
            error: false,
        };
        let outcome = gate.submit(&opportunity(20.0), 0.3, &ok).await;
        assert!(outcome.decision.approved);
        assert!(matches!(outcome.result, Some(Ok(ref r)) if r.success));

        clock.advance(Duration::from_secs(1));
        let broken = ScriptedExecutor {
            succeed: false,
            error: true,
        };
        let outcome = gate.submit(&opportunity(20.0), 0.4, &broken).await;
        assert!(matches!(outcome.result, Some(Err(_))));

        let stats = gate.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.consecutive_failures, 1);
        assert!((stats.total_gas_usd - 0.7).abs() < 1e-9);
        assert!((stats.total_profit_usd - 20.0).abs() < 1e-9);
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejected_submission_never_reaches_executor() {
        let (gate, _clock) = gate(ExecutionLimits::default());
        let broken = ScriptedExecutor {
            succeed: false,
            error: true,
        };
        let outcome = gate.submit(&opportunity(0.1), 0.0, &broken).await;
        assert!(!outcome.decision.approved);
        assert!(outcome.result.is_none());
        assert_eq!(gate.stats().failed, 0);
    }

    #[tokio::test]
    async fn dry_runs_are_charged_the_estimated_gas() {
        let (gate, clock) = gate(ExecutionLimits {
            max_gas_per_hour_usd: 1.0,
            cooldown: Duration::ZERO,
            ..ExecutionLimits::default()
        });
        let dry = DryRunExecutor;
        for _ in 0..2 {
            let outcome = gate.submit(&opportunity(20.0), 0.6, &dry).await;
            assert!(outcome.decision.approved);
            let charged = outcome.result.map(|r| r.map(|r| r.gas_cost_usd).ok());
            assert_eq!(charged, Some(Some(0.6)));
        }
        assert!((gate.stats().gas_last_hour_usd - 1.2).abs() < 1e-9);
        let blocked = gate.submit(&opportunity(20.0), 0.6, &dry).await;
        assert!(blocked.decision.reason.starts_with("gas limit"));
        assert!(blocked.result.is_none());

        clock.advance(Duration::from_secs(3600));
        assert!(gate.submit(&opportunity(20.0), 0.6, &dry).await.decision.approved);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_checks_never_overshoot_the_trade_window() {
        let (gate, _clock) = gate(ExecutionLimits {
            max_trades_per_minute: 3,
            cooldown: Duration::ZERO,
            ..ExecutionLimits::default()
        });
        let gate = Arc::new(gate);
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    gate.check(&opportunity(20.0), 0.1).approved
                })
            })
            .collect();
        let mut approved = 0;
        for task in tasks {
            if task.await.unwrap() {
                approved += 1;
            }
        }
        assert_eq!(approved, 3);
        let stats = gate.stats();
        assert_eq!(stats.approved, 3);
        assert_eq!(stats.rejected, 13);
        assert_eq!(stats.trades_last_minute, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_submits_respect_the_cooldown() {
        let (gate, _clock) = gate(ExecutionLimits::default());
        let gate = Arc::new(gate);
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    let ok = ScriptedExecutor {
                        succeed: true,
                        error: false,
                    };
                    barrier.wait().await;
                    gate.submit(&opportunity(20.0), 0.3, &ok).await.result.is_some()
                })
            })
            .collect();
        let mut dispatched = 0;
        for task in tasks {
            if task.await.unwrap() {
                dispatched += 1;
            }
        }
        assert_eq!(dispatched, 1);
        assert_eq!(gate.stats().succeeded, 1);
    }
}
