//! USD pricing: price resolution for tokens and swap simulation on pools.

use crate::dex::calc::{ClQuoter, LinearApprox, cp_output, price_from_sqrt_x96};
use crate::models::{Pool, PoolLiquidity, Quote, Token, u256_to_f64};
use alloy_primitives::U256;
use ethers::types::Address;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Stablecoins priced at exactly $1.
pub const STABLE_ANCHORS: [&str; 3] = ["USDC", "USDT", "DAI"];

/// External USD price collaborator.
pub trait UsdPriceSource: Send + Sync {
    fn get_price(&self, symbol: &str) -> Option<f64>;
}

/// Fixed symbol → USD map.
#[derive(Debug, Default, Clone)]
pub struct StaticPriceSource {
    prices: HashMap<String, f64>,
}

impl StaticPriceSource {
    pub fn new<S: Into<String>>(prices: impl IntoIterator<Item = (S, f64)>) -> Self {
        Self {
            prices: prices
                .into_iter()
                .map(|(s, p)| (s.into().to_uppercase(), p))
                .collect(),
        }
    }
}

impl UsdPriceSource for StaticPriceSource {
    fn get_price(&self, symbol: &str) -> Option<f64> {
        self.prices
            .get(&symbol.to_uppercase())
            .copied()
            .filter(|p| p.is_finite() && *p > 0.0)
    }
}

/// USD price of one unit of a token that is worth `quote_amount` raw units of
/// a token priced at `quote_price_usd`.
pub fn derive_price(quote_amount: U256, quote_decimals: u8, quote_price_usd: f64) -> Option<f64> {
    if quote_amount.is_zero() || !(quote_price_usd.is_finite() && quote_price_usd > 0.0) {
        return None;
    }
    let price = u256_to_f64(quote_amount) / 10f64.powi(quote_decimals as i32) * quote_price_usd;
    (price.is_finite() && price > 0.0).then_some(price)
}

/// Price lookup chain: stable anchors, then the collaborator, then prices
/// derived from pools earlier in the same scan.
pub struct PriceBook {
    source: Arc<dyn UsdPriceSource>,
    derived: RwLock<HashMap<String, f64>>,
}

impl PriceBook {
    pub fn new(source: Arc<dyn UsdPriceSource>) -> Self {
        Self {
            source,
            derived: RwLock::new(HashMap::new()),
        }
    }

    pub fn price_of(&self, symbol: &str) -> Option<f64> {
        let symbol = symbol.to_uppercase();
        if STABLE_ANCHORS.contains(&symbol.as_str()) {
            return Some(1.0);
        }
        self.source
            .get_price(&symbol)
            .or_else(|| self.derived.read().get(&symbol).copied())
    }

    /// Derives and remembers a USD price for `token` from a quote of one
    /// `token` into `quote_amount` raw units of `quote_token`.
    pub fn derive(&self, token: &Token, quote_amount: U256, quote_token: &Token) -> Option<f64> {
        let quote_price = self.price_of(&quote_token.symbol)?;
        let price = derive_price(quote_amount, quote_token.decimals, quote_price)?;
        tracing::debug!(token = %token.symbol, via = %quote_token.symbol, price, "[PRICE] derived");
        self.derived
            .write()
            .insert(token.symbol.to_uppercase(), price);
        Some(price)
    }

    /// Records a price learned elsewhere (e.g. a cached TVL record) for a
    /// token that has no anchor or collaborator price.
    pub fn remember(&self, token: &Token, price_usd: f64) {
        if !(price_usd.is_finite() && price_usd > 0.0) {
            return;
        }
        let symbol = token.symbol.to_uppercase();
        if STABLE_ANCHORS.contains(&symbol.as_str()) || self.source.get_price(&symbol).is_some() {
            return;
        }
        self.derived.write().entry(symbol).or_insert(price_usd);
    }

    /// Derived prices only live for one scan.
    pub fn clear_derived(&self) {
        self.derived.write().clear();
    }
}

/// Raw amount of `token_out` one whole unit of `token_in` buys at the pool's
/// current state, used for price derivation.
pub fn unit_quote(
    liquidity: &PoolLiquidity,
    token_in: &Token,
    token_out: &Token,
    in_is_token0: bool,
    fee_bps: u32,
) -> Option<U256> {
    let one = U256::from(10u64).checked_pow(U256::from(token_in.decimals))?;
    match liquidity {
        PoolLiquidity::ConstantProduct { reserve0, reserve1 } => {
            let (r_in, r_out) = if in_is_token0 {
                (*reserve0, *reserve1)
            } else {
                (*reserve1, *reserve0)
            };
            let out = cp_output(one, r_in, r_out, fee_bps);
            (!out.is_zero()).then_some(out)
        }
        PoolLiquidity::Concentrated { sqrt_price_x96, .. } => {
            let (d0, d1) = if in_is_token0 {
                (token_in.decimals, token_out.decimals)
            } else {
                (token_out.decimals, token_in.decimals)
            };
            let p = price_from_sqrt_x96(*sqrt_price_x96, d0, d1);
            let rate = if in_is_token0 { p } else { 1.0 / p };
            let out = token_out.to_raw(rate);
            (!out.is_zero()).then_some(out)
        }
    }
}

/// Swap simulation over priced pools.
#[derive(Clone)]
pub struct PricingEngine {
    cl_quoter: Arc<dyn ClQuoter>,
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new(Arc::new(LinearApprox))
    }
}

impl PricingEngine {
    pub fn new(cl_quoter: Arc<dyn ClQuoter>) -> Self {
        Self { cl_quoter }
    }

    /// Raw output for `amount_in` of `token_in`. Zero output is `None`.
    pub fn output_amount(&self, pool: &Pool, token_in: &Token, amount_in: U256) -> Option<U256> {
        let out = match &pool.liquidity {
            PoolLiquidity::ConstantProduct { reserve0, reserve1 } => {
                let (r_in, r_out) = if pool.token0.address == token_in.address {
                    (*reserve0, *reserve1)
                } else if pool.token1.address == token_in.address {
                    (*reserve1, *reserve0)
                } else {
                    return None;
                };
                cp_output(amount_in, r_in, r_out, pool.fee_bps)
            }
            PoolLiquidity::Concentrated { .. } => {
                self.cl_quoter.quote(pool, token_in, amount_in)?
            }
        };
        (!out.is_zero()).then_some(out)
    }

    /// Prices a swap of `amount_in` raw units of `token_in`.
    pub fn quote_exact_in(&self, pool: &Pool, token_in: Address, amount_in: U256) -> Option<Quote> {
        let tin = pool.token(token_in)?;
        let tout = pool.counterpart(token_in)?;
        let price_in = pool.price_usd(tin.address)?;
        let price_out = pool.price_usd(tout.address)?;
        if amount_in.is_zero() {
            return None;
        }
        let amount_out = self.output_amount(pool, tin, amount_in)?;

        let human_in = tin.to_human(amount_in);
        let human_out = tout.to_human(amount_out);
        let effective_price = human_out / human_in;
        let amount_in_usd = human_in * price_in;
        let amount_out_usd = human_out * price_out;
        // USD lost to fee and price impact at the snapshot's prices
        let slippage_pct = if amount_in_usd > 0.0 {
            (amount_in_usd - amount_out_usd) / amount_in_usd * 100.0
        } else {
            0.0
        };

        Some(Quote {
            pool: pool.address,
            token_in: tin.clone(),
            token_out: tout.clone(),
            amount_in,
            amount_out,
            amount_in_usd,
            amount_out_usd,
            effective_price,
            slippage_pct,
        })
    }

    /// USD notional → token units → AMM output → USD. `None` when the pool
    /// lacks data or does not trade this pair.
    pub fn simulate_swap(
        &self,
        pool: &Pool,
        token_in: Address,
        token_out: Address,
        notional_usd: f64,
    ) -> Option<Quote> {
        if pool.counterpart(token_in)?.address != token_out {
            return None;
        }
        if !(notional_usd.is_finite() && notional_usd > 0.0) {
            return None;
        }
        let tin = pool.token(token_in)?;
        let price_in = pool.price_usd(token_in)?;
        let amount_in = tin.to_raw(notional_usd / price_in);
        self.quote_exact_in(pool, token_in, amount_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    fn usdc() -> Token {
        Token::new("USDC", addr(1), 6)
    }

    fn weth() -> Token {
        Token::new("WETH", addr(2), 18)
    }

    fn v2_pool(usdc_reserve: f64, weth_reserve: f64) -> Pool {
        Pool {
            dex: "quickswap".into(),
            address: addr(10),
            token0: usdc(),
            token1: weth(),
            fee_bps: 30,
            liquidity: PoolLiquidity::ConstantProduct {
                reserve0: usdc().to_raw(usdc_reserve),
                reserve1: weth().to_raw(weth_reserve),
            },
            tvl_usd: usdc_reserve * 2.0,
            price0_usd: Some(1.0),
            price1_usd: Some(2_000.0),
        }
    }

    #[test]
    fn stablecoins_are_anchored() {
        let book = PriceBook::new(Arc::new(StaticPriceSource::new([("USDC", 0.97)])));
        assert_eq!(book.price_of("usdc"), Some(1.0));
        assert_eq!(book.price_of("DAI"), Some(1.0));
        assert_eq!(book.price_of("WETH"), None);
    }

    #[test]
    fn derived_prices_are_remembered_until_cleared() {
        let book = PriceBook::new(Arc::new(StaticPriceSource::default()));
        let wpol = Token::new("WPOL", addr(3), 18);
        // 1 WPOL buys 0.45 USDC
        let price = book.derive(&wpol, U256::from(450_000u64), &usdc());
        assert!((price.expect("derived") - 0.45).abs() < 1e-12);
        assert!((book.price_of("WPOL").expect("remembered") - 0.45).abs() < 1e-12);
        book.clear_derived();
        assert_eq!(book.price_of("WPOL"), None);
    }

    #[test]
    fn remembered_prices_never_shadow_real_ones() {
        let book = PriceBook::new(Arc::new(StaticPriceSource::new([("WETH", 2_000.0)])));
        let wpol = Token::new("WPOL", addr(3), 18);
        book.remember(&wpol, 0.5);
        book.remember(&weth(), 1.0);
        book.remember(&usdc(), 3.0);
        assert_eq!(book.price_of("WPOL"), Some(0.5));
        assert_eq!(book.price_of("WETH"), Some(2_000.0));
        assert_eq!(book.price_of("USDC"), Some(1.0));
        book.remember(&Token::new("XYZ", addr(4), 18), f64::NAN);
        assert_eq!(book.price_of("XYZ"), None);
    }

    #[test]
    fn derive_price_rejects_bad_inputs() {
        assert!(derive_price(U256::ZERO, 6, 1.0).is_none());
        assert!(derive_price(U256::from(1u64), 6, 0.0).is_none());
        assert!(derive_price(U256::from(1u64), 6, f64::NAN).is_none());
    }

    #[test]
    fn unit_quote_on_v2_includes_fee() {
        let pool = v2_pool(1_000_000.0, 500.0);
        let out = unit_quote(&pool.liquidity, &weth(), &usdc(), false, 30).expect("quote");
        let human = usdc().to_human(out);
        assert!(human < 2_000.0 && human > 1_990.0);
    }

    #[test]
    fn simulate_swap_reports_slippage_and_usd() {
        let pool = v2_pool(1_000_000.0, 500.0);
        let engine = PricingEngine::default();
        let small = engine
            .simulate_swap(&pool, addr(1), addr(2), 100.0)
            .expect("quote");
        let large = engine
            .simulate_swap(&pool, addr(1), addr(2), 100_000.0)
            .expect("quote");
        assert!((small.amount_in_usd - 100.0).abs() < 1e-9);
        assert!(small.amount_out_usd < 100.0);
        // a $100 trade on a $2M pool loses the 30 bps fee plus ~0.01% impact
        let expected = (small.amount_in_usd - small.amount_out_usd) / small.amount_in_usd * 100.0;
        assert!((small.slippage_pct - expected).abs() < 1e-12);
        assert!(small.slippage_pct > 0.30 && small.slippage_pct < 0.32);
        assert!(large.slippage_pct > small.slippage_pct);
        assert!(large.slippage_pct > 5.0);
    }

    #[test]
    fn slippage_is_negative_when_the_pool_pays_above_snapshot_prices() {
        // pool quotes WETH at 1800 USDC while the book says 2000
        let mut pool = v2_pool(900_000.0, 500.0);
        pool.tvl_usd = 1_900_000.0;
        let quote = PricingEngine::default()
            .simulate_swap(&pool, addr(1), addr(2), 1_000.0)
            .expect("quote");
        assert!(quote.amount_out_usd > quote.amount_in_usd);
        assert!(quote.slippage_pct < 0.0);
    }

    #[test]
    fn simulate_swap_rejects_foreign_tokens_and_missing_prices() {
        let engine = PricingEngine::default();
        let pool = v2_pool(1_000_000.0, 500.0);
        assert!(engine.simulate_swap(&pool, addr(1), addr(3), 100.0).is_none());
        assert!(engine.simulate_swap(&pool, addr(1), addr(2), 0.0).is_none());
        let mut unpriced = pool.clone();
        unpriced.price1_usd = None;
        assert!(engine.simulate_swap(&unpriced, addr(1), addr(2), 100.0).is_none());
    }
}
