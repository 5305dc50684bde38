//! Pool snapshots: on-chain state plus the USD figures derived from it.

use crate::dex::calc::q96_to_f64;
use crate::models::{Pool, PoolLiquidity, Token};
use crate::pricing::{PriceBook, unit_quote};
use ethers::types::Address;
use serde::{Deserialize, Serialize};

/// Pool metadata that only changes on redeploy: token order and fee tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolMeta {
    pub token0: Address,
    pub token1: Address,
    pub fee_bps: u32,
}

/// USD figures attached to a pool; cached separately from the live state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TvlRecord {
    pub tvl_usd: f64,
    pub price0_usd: f64,
    pub price1_usd: f64,
}

/// USD value held by the pool. Concentrated pools count the in-range
/// virtual reserves `x = L / sqrt(P)`, `y = L * sqrt(P)`.
pub fn tvl_usd(
    liquidity: &PoolLiquidity,
    token0: &Token,
    token1: &Token,
    price0_usd: f64,
    price1_usd: f64,
) -> f64 {
    match liquidity {
        PoolLiquidity::ConstantProduct { reserve0, reserve1 } => {
            token0.to_human(*reserve0) * price0_usd + token1.to_human(*reserve1) * price1_usd
        }
        PoolLiquidity::Concentrated {
            sqrt_price_x96,
            liquidity,
        } => {
            let sqrt = q96_to_f64(*sqrt_price_x96);
            if sqrt <= 0.0 {
                return 0.0;
            }
            let l = *liquidity as f64;
            let x = l / sqrt / 10f64.powi(token0.decimals as i32);
            let y = l * sqrt / 10f64.powi(token1.decimals as i32);
            x * price0_usd + y * price1_usd
        }
    }
}

/// Resolves USD prices for both legs. A leg with no known price is derived
/// from the other leg through the pool's own exchange rate.
pub fn resolve_prices(
    book: &PriceBook,
    liquidity: &PoolLiquidity,
    token0: &Token,
    token1: &Token,
    fee_bps: u32,
) -> (Option<f64>, Option<f64>) {
    let mut p0 = book.price_of(&token0.symbol);
    let mut p1 = book.price_of(&token1.symbol);
    match (p0, p1) {
        (None, Some(_)) => {
            p0 = unit_quote(liquidity, token0, token1, true, fee_bps)
                .and_then(|q| book.derive(token0, q, token1));
        }
        (Some(_), None) => {
            p1 = unit_quote(liquidity, token1, token0, false, fee_bps)
                .and_then(|q| book.derive(token1, q, token0));
        }
        _ => {}
    }
    (p0, p1)
}

/// True when the liquidity state carries enough to price swaps.
pub fn is_funded(liquidity: &PoolLiquidity) -> bool {
    match liquidity {
        PoolLiquidity::ConstantProduct { reserve0, reserve1 } => {
            !reserve0.is_zero() && !reserve1.is_zero()
        }
        PoolLiquidity::Concentrated {
            sqrt_price_x96,
            liquidity,
        } => !sqrt_price_x96.is_zero() && *liquidity > 0,
    }
}

pub fn assemble_pool(
    dex: &str,
    address: Address,
    token0: Token,
    token1: Token,
    fee_bps: u32,
    liquidity: PoolLiquidity,
    tvl: TvlRecord,
) -> Pool {
    Pool {
        dex: dex.to_string(),
        address,
        token0,
        token1,
        fee_bps,
        liquidity,
        tvl_usd: tvl.tvl_usd,
        price0_usd: Some(tvl.price0_usd),
        price1_usd: Some(tvl.price1_usd),
    }
}
