//! AMM output math for constant-product and concentrated-liquidity pools.

use crate::models::{Pool, PoolLiquidity, Token, u256_to_f64};
use alloy_primitives::U256;
use ethers::types::Address;
use std::collections::HashMap;

const BPS_DENOMINATOR: u32 = 10_000;

/// Constant-product output, Uniswap V2 `getAmountOut` semantics.
///
/// Exact integer arithmetic with floor division. Returns 0 when any operand is
/// zero or the fee is 100% or more.
pub fn cp_output(amount_in: U256, reserve_in: U256, reserve_out: U256, fee_bps: u32) -> U256 {
    if amount_in.is_zero() || reserve_in.is_zero() || reserve_out.is_zero() {
        return U256::ZERO;
    }
    if fee_bps >= BPS_DENOMINATOR {
        return U256::ZERO;
    }
    let fee_factor = U256::from(BPS_DENOMINATOR - fee_bps);
    let amount_in_with_fee = match amount_in.checked_mul(fee_factor) {
        Some(v) => v,
        None => return U256::ZERO,
    };
    let numerator = amount_in_with_fee.checked_mul(reserve_out);
    let denominator = reserve_in
        .checked_mul(U256::from(BPS_DENOMINATOR))
        .and_then(|r| r.checked_add(amount_in_with_fee));
    match (numerator, denominator) {
        (Some(n), Some(d)) if !d.is_zero() => n / d,
        _ => U256::ZERO,
    }
}

/// Q64.96 fixed point → f64.
pub fn q96_to_f64(q96: U256) -> f64 {
    u256_to_f64(q96) / 2f64.powi(96)
}

/// Price of token0 in token1, human units, from `sqrtPriceX96`.
pub fn price_from_sqrt_x96(sqrt_price_x96: U256, decimals0: u8, decimals1: u8) -> f64 {
    let sqrt = q96_to_f64(sqrt_price_x96);
    sqrt * sqrt * 10f64.powi(decimals0 as i32 - decimals1 as i32)
}

/// Marginal exchange rate (token_out per token_in, human units) before fees.
/// `None` when `token_in` is not in the pool or the pool is empty.
pub fn spot_rate(pool: &Pool, token_in: Address) -> Option<f64> {
    let zero_for_one = if pool.token0.address == token_in {
        true
    } else if pool.token1.address == token_in {
        false
    } else {
        return None;
    };
    let price0_in_1 = match &pool.liquidity {
        PoolLiquidity::ConstantProduct { reserve0, reserve1 } => {
            let r0 = pool.token0.to_human(*reserve0);
            let r1 = pool.token1.to_human(*reserve1);
            if r0 <= 0.0 || r1 <= 0.0 {
                return None;
            }
            r1 / r0
        }
        PoolLiquidity::Concentrated { sqrt_price_x96, .. } => {
            price_from_sqrt_x96(*sqrt_price_x96, pool.token0.decimals, pool.token1.decimals)
        }
    };
    if !(price0_in_1.is_finite() && price0_in_1 > 0.0) {
        return None;
    }
    Some(if zero_for_one {
        price0_in_1
    } else {
        1.0 / price0_in_1
    })
}

/// Concentrated-liquidity output by linear extrapolation of the current price.
///
/// Inexact: ignores depth and tick crossings, so large trades are overstated.
pub fn cl_output_approx(pool: &Pool, token_in: &Token, amount_in: U256) -> Option<U256> {
    if !matches!(pool.liquidity, PoolLiquidity::Concentrated { .. }) {
        return None;
    }
    let token_out = pool.counterpart(token_in.address)?;
    let rate = spot_rate(pool, token_in.address)?;
    let fee = pool.fee_bps as f64 / BPS_DENOMINATOR as f64;
    let out_human = token_in.to_human(amount_in) * rate * (1.0 - fee);
    Some(token_out.to_raw(out_human))
}

/// Swap-output source for concentrated-liquidity pools.
pub trait ClQuoter: Send + Sync {
    fn quote(&self, pool: &Pool, token_in: &Token, amount_in: U256) -> Option<U256>;
}

/// The linear approximation above.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinearApprox;

impl ClQuoter for LinearApprox {
    fn quote(&self, pool: &Pool, token_in: &Token, amount_in: U256) -> Option<U256> {
        cl_output_approx(pool, token_in, amount_in)
    }
}

/// Exact outputs read from the on-chain quoter ahead of detection, keyed by
/// pool, input token and input amount.
#[derive(Debug, Default, Clone)]
pub struct QuoteTable {
    quotes: HashMap<(Address, Address, U256), U256>,
}

impl QuoteTable {
    pub fn insert(&mut self, pool: Address, token_in: Address, amount_in: U256, amount_out: U256) {
        self.quotes.insert((pool, token_in, amount_in), amount_out);
    }

    pub fn len(&self) -> usize {
        self.quotes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty()
    }
}

impl ClQuoter for QuoteTable {
    fn quote(&self, pool: &Pool, token_in: &Token, amount_in: U256) -> Option<U256> {
        self.quotes
            .get(&(pool.address, token_in.address, amount_in))
            .copied()
    }
}

/// Uses `exact` when it has an answer, otherwise `fallback`. Results are
/// never mixed.
pub struct PreferExact<E, F> {
    pub exact: E,
    pub fallback: F,
}

impl<E: ClQuoter, F: ClQuoter> ClQuoter for PreferExact<E, F> {
    fn quote(&self, pool: &Pool, token_in: &Token, amount_in: U256) -> Option<U256> {
        self.exact
            .quote(pool, token_in, amount_in)
            .or_else(|| self.fallback.quote(pool, token_in, amount_in))
    }
}

/// Input (in units of the first pool's input token) that maximises the
/// round-trip output of two chained constant-product pools.
///
/// `a_in`/`a_out` are the first pool's reserves on the input/output side,
/// `b_in`/`b_out` the second pool's. `None` when no positive input is
/// profitable.
pub fn optimal_cp_round_trip_input(
    a_in: f64,
    a_out: f64,
    a_fee_bps: u32,
    b_in: f64,
    b_out: f64,
    b_fee_bps: u32,
) -> Option<f64> {
    let ga = 1.0 - a_fee_bps as f64 / BPS_DENOMINATOR as f64;
    let gb = 1.0 - b_fee_bps as f64 / BPS_DENOMINATOR as f64;
    if [a_in, a_out, b_in, b_out].iter().any(|r| *r <= 0.0) || ga <= 0.0 || gb <= 0.0 {
        return None;
    }
    // Composite curve: out(x) = K x / (C + D x); optimum where C + D x = sqrt(K C).
    let k = ga * gb * a_out * b_out;
    let c = a_in * b_in;
    let d = ga * b_in + ga * gb * a_out;
    let x = ((k * c).sqrt() - c) / d;
    (x.is_finite() && x > 0.0).then_some(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn u(v: u128) -> U256 {
        U256::from(v)
    }

    fn cl_pool(sqrt_price: f64, fee_bps: u32) -> Pool {
        Pool {
            dex: "uniswap_v3".into(),
            address: addr(99),
            token0: Token::new("WPOL", addr(1), 18),
            token1: Token::new("USDC", addr(2), 6),
            fee_bps,
            liquidity: PoolLiquidity::Concentrated {
                sqrt_price_x96: U256::from((sqrt_price * 2f64.powi(96)) as u128),
                liquidity: 1_000_000_000_000,
            },
            tvl_usd: 0.0,
            price0_usd: Some(0.5),
            price1_usd: Some(1.0),
        }
    }

    #[test]
    fn cp_output_matches_uniswap_v2_reference() {
        // 1 WETH into 1000 WETH / 2,000,000 USDC at 30 bps (raw integers)
        let out = cp_output(u(1_000), u(1_000_000), u(2_000_000_000), 30);
        // 1000*9970*2e9 / (1e6*1e4 + 9.97e6) = 1992013.9...
        assert_eq!(out, u(1_992_013));
    }

    #[test]
    fn cp_output_zero_inputs_give_zero() {
        assert_eq!(cp_output(U256::ZERO, u(10), u(10), 30), U256::ZERO);
        assert_eq!(cp_output(u(10), U256::ZERO, u(10), 30), U256::ZERO);
        assert_eq!(cp_output(u(10), u(10), U256::ZERO, 30), U256::ZERO);
        assert_eq!(cp_output(u(10), u(10), u(10), 10_000), U256::ZERO);
    }

    #[test]
    fn cp_output_is_bounded_and_monotonic() {
        let reserve_in = u(5_000_000_000);
        let reserve_out = u(777_000_000_000);
        let mut previous = U256::ZERO;
        for amount in [1u128, 10, 1_000, 1_000_000, 10_000_000_000, 10u128.pow(20)] {
            let out = cp_output(u(amount), reserve_in, reserve_out, 30);
            assert!(out < reserve_out, "never drains the pool");
            assert!(out >= previous, "non-decreasing in amount_in");
            previous = out;
        }
    }

    #[test]
    fn cp_output_decreases_with_fee() {
        let lo = cp_output(u(1_000_000), u(10u128.pow(12)), u(10u128.pow(12)), 5);
        let hi = cp_output(u(1_000_000), u(10u128.pow(12)), u(10u128.pow(12)), 100);
        assert!(hi < lo);
    }

    #[test]
    fn sqrt_price_converts_with_decimals() {
        // token0 18 dec, token1 6 dec, raw price 1e-12 => 1.0 human
        let sqrt = (1e-12f64).sqrt();
        let p = price_from_sqrt_x96(U256::from((sqrt * 2f64.powi(96)) as u128), 18, 6);
        assert!((p - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cl_approx_applies_rate_and_fee_linearly() {
        // 0.5 USDC per WPOL
        let pool = cl_pool((0.5e-12f64).sqrt(), 30);
        let wpol = pool.token0.clone();
        let out = cl_output_approx(&pool, &wpol, wpol.to_raw(1_000.0)).expect("quote");
        let human = pool.token1.to_human(out);
        assert!((human - 1_000.0 * 0.5 * 0.997).abs() < 1e-3);

        let usdc = pool.token1.clone();
        let back = cl_output_approx(&pool, &usdc, usdc.to_raw(500.0)).expect("quote");
        assert!((wpol.to_human(back) - 1_000.0 * 0.997).abs() < 1e-3);
    }

    #[test]
    fn prefer_exact_never_blends() {
        let pool = cl_pool((0.5e-12f64).sqrt(), 30);
        let wpol = pool.token0.clone();
        let amount = wpol.to_raw(10.0);
        let mut table = QuoteTable::default();
        table.insert(pool.address, wpol.address, amount, u(4_900_000));
        let quoter = PreferExact {
            exact: table,
            fallback: LinearApprox,
        };
        assert_eq!(quoter.quote(&pool, &wpol, amount), Some(u(4_900_000)));
        let other = wpol.to_raw(11.0);
        assert_eq!(
            quoter.quote(&pool, &wpol, other),
            cl_output_approx(&pool, &wpol, other)
        );
    }

    #[test]
    fn optimal_input_maximises_round_trip() {
        // USDC -> WETH on (1,000,000 / 500), WETH -> USDC on (990 / 2,000,000)
        let x = optimal_cp_round_trip_input(1_000_000.0, 500.0, 30, 990.0, 2_000_000.0, 30)
            .expect("profitable");
        let round_trip = |x: f64| {
            let y = 0.997 * x * 500.0 / (1_000_000.0 + 0.997 * x);
            0.997 * y * 2_000_000.0 / (990.0 + 0.997 * y) - x
        };
        assert!(round_trip(x) > 0.0);
        assert!(round_trip(x) >= round_trip(x * 0.9));
        assert!(round_trip(x) >= round_trip(x * 1.1));
        assert!(x > 1_000.0 && x < 2_000.0);
    }

    #[test]
    fn optimal_input_none_when_prices_agree() {
        assert!(
            optimal_cp_round_trip_input(1_000_000.0, 500.0, 30, 500.0, 1_000_000.0, 30).is_none()
        );
    }
}
