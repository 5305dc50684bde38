//! Shared data structures used throughout the application.

use alloy_primitives::U256;
use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// ERC-20 token as known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token {
    pub symbol: String,
    pub address: Address,
    pub decimals: u8,
}

impl Token {
    pub fn new(symbol: impl Into<String>, address: Address, decimals: u8) -> Self {
        Self {
            symbol: symbol.into(),
            address,
            decimals,
        }
    }

    /// Raw integer amount → human units.
    pub fn to_human(&self, raw: U256) -> f64 {
        u256_to_f64(raw) / 10f64.powi(self.decimals as i32)
    }

    /// Human units → raw integer amount (floored). Non-finite or negative input gives 0.
    pub fn to_raw(&self, human: f64) -> U256 {
        f64_to_u256(human * 10f64.powi(self.decimals as i32))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolKind {
    /// Constant-product (Uniswap V2 style).
    V2,
    /// Concentrated liquidity (Uniswap V3 style).
    V3,
}

/// Pool liquidity state, one shape per AMM family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolLiquidity {
    ConstantProduct { reserve0: U256, reserve1: U256 },
    Concentrated { sqrt_price_x96: U256, liquidity: u128 },
}

/// A priced pool ready for detection. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub dex: String,
    pub address: Address,
    pub token0: Token,
    pub token1: Token,
    pub fee_bps: u32,
    pub liquidity: PoolLiquidity,
    pub tvl_usd: f64,
    pub price0_usd: Option<f64>,
    pub price1_usd: Option<f64>,
}

impl Pool {
    pub fn kind(&self) -> PoolKind {
        match self.liquidity {
            PoolLiquidity::ConstantProduct { .. } => PoolKind::V2,
            PoolLiquidity::Concentrated { .. } => PoolKind::V3,
        }
    }

    pub fn contains(&self, token: Address) -> bool {
        self.token0.address == token || self.token1.address == token
    }

    /// The other side of the pair, `None` if `token` is not in this pool.
    pub fn counterpart(&self, token: Address) -> Option<&Token> {
        if self.token0.address == token {
            Some(&self.token1)
        } else if self.token1.address == token {
            Some(&self.token0)
        } else {
            None
        }
    }

    pub fn token(&self, token: Address) -> Option<&Token> {
        if self.token0.address == token {
            Some(&self.token0)
        } else if self.token1.address == token {
            Some(&self.token1)
        } else {
            None
        }
    }

    pub fn price_usd(&self, token: Address) -> Option<f64> {
        if self.token0.address == token {
            self.price0_usd
        } else if self.token1.address == token {
            self.price1_usd
        } else {
            None
        }
    }

    /// True when the pool has everything pricing needs: USD prices for both
    /// legs and non-zero reserves or liquidity.
    pub fn is_priceable(&self) -> bool {
        let priced = matches!(self.price0_usd, Some(p) if p > 0.0)
            && matches!(self.price1_usd, Some(p) if p > 0.0);
        let funded = match &self.liquidity {
            PoolLiquidity::ConstantProduct { reserve0, reserve1 } => {
                !reserve0.is_zero() && !reserve1.is_zero()
            }
            PoolLiquidity::Concentrated {
                sqrt_price_x96,
                liquidity,
            } => !sqrt_price_x96.is_zero() && *liquidity > 0,
        };
        priced && funded
    }

    /// Sorted token address pair, used to group venues of the same market.
    pub fn pair_key(&self) -> (Address, Address) {
        if self.token0.address <= self.token1.address {
            (self.token0.address, self.token1.address)
        } else {
            (self.token1.address, self.token0.address)
        }
    }

    pub fn label(&self) -> String {
        format!("{}:{}/{}", self.dex, self.token0.symbol, self.token1.symbol)
    }
}

/// Result of pricing one swap on one pool.
#[derive(Debug, Clone)]
pub struct Quote {
    pub pool: Address,
    pub token_in: Token,
    pub token_out: Token,
    pub amount_in: U256,
    pub amount_out: U256,
    pub amount_in_usd: f64,
    pub amount_out_usd: f64,
    /// Output per unit of input, human units.
    pub effective_price: f64,
    /// `(amount_in_usd - amount_out_usd) / amount_in_usd`, in percent.
    pub slippage_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpportunityKind {
    Pairwise,
    Triangular,
    Graph,
}

impl fmt::Display for OpportunityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpportunityKind::Pairwise => "pairwise",
            OpportunityKind::Triangular => "triangular",
            OpportunityKind::Graph => "graph",
        };
        f.write_str(s)
    }
}

/// One leg of a route.
#[derive(Debug, Clone)]
pub struct Hop {
    pub pool: Arc<Pool>,
    pub quote: Quote,
}

/// Calculated arbitrage opportunity including cost and profit numbers.
#[derive(Debug, Clone)]
pub struct Opportunity {
    pub kind: OpportunityKind,
    pub hops: Vec<Hop>,
    /// Ladder notional the candidate was evaluated at.
    pub notional_usd: f64,
    pub amount_in_usd: f64,
    pub amount_out_usd: f64,
    pub profit_usd: f64,
    pub roi_pct: f64,
    pub total_slippage_pct: f64,
    /// Smallest pool TVL along the route.
    pub min_tvl_usd: f64,
}

impl Opportunity {
    /// Builds the USD figures from an executed hop chain. `None` for an empty chain.
    pub fn from_hops(kind: OpportunityKind, notional_usd: f64, hops: Vec<Hop>) -> Option<Self> {
        let first = hops.first()?;
        let last = hops.last()?;
        let amount_in_usd = first.quote.amount_in_usd;
        let amount_out_usd = last.quote.amount_out_usd;
        let profit_usd = amount_out_usd - amount_in_usd;
        let roi_pct = if amount_in_usd > 0.0 {
            profit_usd / amount_in_usd * 100.0
        } else {
            0.0
        };
        let total_slippage_pct = hops.iter().map(|h| h.quote.slippage_pct).sum();
        let min_tvl_usd = hops
            .iter()
            .map(|h| h.pool.tvl_usd)
            .fold(f64::INFINITY, f64::min);
        Some(Self {
            kind,
            hops,
            notional_usd,
            amount_in_usd,
            amount_out_usd,
            profit_usd,
            roi_pct,
            total_slippage_pct,
            min_tvl_usd,
        })
    }

    /// Token path, e.g. `USDC -> WETH -> USDC`.
    pub fn route(&self) -> String {
        let mut parts: Vec<&str> = self
            .hops
            .iter()
            .map(|h| h.quote.token_in.symbol.as_str())
            .collect();
        if let Some(last) = self.hops.last() {
            parts.push(last.quote.token_out.symbol.as_str());
        }
        parts.join(" -> ")
    }

    /// Venue path, e.g. `quickswap -> sushiswap`.
    pub fn venues(&self) -> String {
        self.hops
            .iter()
            .map(|h| h.pool.dex.as_str())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    /// Sorted pool addresses. Two candidates over the same pools are the same trade.
    pub fn pool_set(&self) -> Vec<Address> {
        let mut pools: Vec<Address> = self.hops.iter().map(|h| h.pool.address).collect();
        pools.sort();
        pools.dedup();
        pools
    }
}

/// U256 → f64, lossy above 2^53 but never panics.
pub fn u256_to_f64(v: U256) -> f64 {
    let limbs = v.as_limbs();
    let mut out = 0.0f64;
    for (i, limb) in limbs.iter().enumerate() {
        out += (*limb as f64) * 2f64.powi(64 * i as i32);
    }
    out
}

/// f64 → U256, floored. Negative, NaN and infinite values map to zero.
pub fn f64_to_u256(v: f64) -> U256 {
    if !v.is_finite() || v < 1.0 {
        return U256::ZERO;
    }
    if v < u128::MAX as f64 {
        return U256::from(v as u128);
    }
    // Split into 2^64 chunks for values past u128.
    let mut rest = v.floor();
    let mut limbs = [0u64; 4];
    for i in (0..4).rev() {
        let unit = 2f64.powi(64 * i as i32);
        let chunk = (rest / unit).floor();
        if chunk >= 1.0 {
            limbs[i] = chunk.min(u64::MAX as f64) as u64;
            rest -= limbs[i] as f64 * unit;
        }
    }
    U256::from_limbs(limbs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(n: u64) -> Address {
        Address::from_low_u64_be(n)
    }

    #[test]
    fn token_unit_conversion() {
        let usdc = Token::new("USDC", addr(1), 6);
        assert_eq!(usdc.to_raw(1_000.0), U256::from(1_000_000_000u64));
        assert!((usdc.to_human(U256::from(2_500_000u64)) - 2.5).abs() < 1e-12);
        assert_eq!(usdc.to_raw(-3.0), U256::ZERO);
        assert_eq!(usdc.to_raw(f64::NAN), U256::ZERO);
    }

    #[test]
    fn u256_f64_conversion_handles_large_values() {
        let big = U256::from(1u64) << 200usize;
        let f = u256_to_f64(big);
        assert!((f / 2f64.powi(200) - 1.0).abs() < 1e-12);
        let back = f64_to_u256(f);
        assert_eq!(back, big);
    }

    #[test]
    fn unpriced_pool_is_not_priceable() {
        let pool = Pool {
            dex: "quickswap".into(),
            address: addr(10),
            token0: Token::new("USDC", addr(1), 6),
            token1: Token::new("WETH", addr(2), 18),
            fee_bps: 30,
            liquidity: PoolLiquidity::ConstantProduct {
                reserve0: U256::from(1u64),
                reserve1: U256::from(1u64),
            },
            tvl_usd: 0.0,
            price0_usd: Some(1.0),
            price1_usd: None,
        };
        assert!(!pool.is_priceable());
        assert_eq!(pool.counterpart(addr(1)).map(|t| t.symbol.as_str()), Some("WETH"));
        assert!(pool.counterpart(addr(3)).is_none());
        assert_eq!(pool.pair_key(), (addr(1), addr(2)));
    }
}
