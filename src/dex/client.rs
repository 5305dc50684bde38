//! On-chain reads for Uniswap V2/V3 style pools.

use super::registry::{DEFAULT_V2_FEE_BPS, RegistryPool};
use super::state::PoolMeta;
use crate::errors::{AppError, Result};
use crate::models::{PoolKind, PoolLiquidity};
use crate::rpc::RpcClient;
use alloy_primitives::U256;
use ethers::providers::Middleware;
use ethers::types::Address;

pub mod v2 {
    ethers::contract::abigen!(
        UniswapV2Pair,
        r#"[
            function getReserves() view returns (uint112 reserve0, uint112 reserve1, uint32 blockTimestampLast)
            function token0() view returns (address)
            function token1() view returns (address)
        ]"#,
    );
}

pub mod v3 {
    ethers::contract::abigen!(
        UniswapV3Pool,
        r#"[
            function slot0() view returns (uint160 sqrtPriceX96, int24 tick, uint16 observationIndex, uint16 observationCardinality, uint16 observationCardinalityNext, uint8 feeProtocol, bool unlocked)
            function liquidity() view returns (uint128)
            function fee() view returns (uint24)
            function token0() view returns (address)
            function token1() view returns (address)
        ]"#,
    );
}

pub mod quoter {
    ethers::contract::abigen!(
        Quoter,
        r#"[
            function quoteExactInputSingle(address tokenIn, address tokenOut, uint24 fee, uint256 amountIn, uint160 sqrtPriceLimitX96) returns (uint256 amountOut)
        ]"#,
    );
}

/// V3 fee tiers are in hundredths of a basis point (3000 = 0.30%).
const V3_FEE_UNITS_PER_BPS: u32 = 100;

pub fn to_alloy(v: ethers::types::U256) -> U256 {
    U256::from_limbs(v.0)
}

pub fn to_ethers(v: U256) -> ethers::types::U256 {
    ethers::types::U256(v.into_limbs())
}

/// Token order and fee tier.
pub async fn read_meta(client: RpcClient, entry: &RegistryPool) -> Result<PoolMeta> {
    match entry.kind {
        PoolKind::V2 => {
            let pair = v2::UniswapV2Pair::new(entry.address, client);
            let token0 = pair.token_0().call().await?;
            let token1 = pair.token_1().call().await?;
            Ok(PoolMeta {
                token0,
                token1,
                fee_bps: entry.fee_bps.unwrap_or(DEFAULT_V2_FEE_BPS),
            })
        }
        PoolKind::V3 => {
            let pool = v3::UniswapV3Pool::new(entry.address, client);
            let token0 = pool.token_0().call().await?;
            let token1 = pool.token_1().call().await?;
            let fee_tier: u32 = pool.fee().call().await?;
            Ok(PoolMeta {
                token0,
                token1,
                fee_bps: entry.fee_bps.unwrap_or(fee_tier / V3_FEE_UNITS_PER_BPS),
            })
        }
    }
}

/// Live reserves (V2) or price and in-range liquidity (V3).
pub async fn read_liquidity(client: RpcClient, entry: &RegistryPool) -> Result<PoolLiquidity> {
    match entry.kind {
        PoolKind::V2 => {
            let pair = v2::UniswapV2Pair::new(entry.address, client);
            let (reserve0, reserve1, _ts) = pair.get_reserves().call().await?;
            Ok(PoolLiquidity::ConstantProduct {
                reserve0: U256::from(reserve0),
                reserve1: U256::from(reserve1),
            })
        }
        PoolKind::V3 => {
            let pool = v3::UniswapV3Pool::new(entry.address, client);
            let (sqrt_price_x96, _tick, _, _, _, _fee_protocol, _unlocked) =
                pool.slot_0().call().await?;
            let liquidity: u128 = pool.liquidity().call().await?;
            Ok(PoolLiquidity::Concentrated {
                sqrt_price_x96: to_alloy(sqrt_price_x96),
                liquidity,
            })
        }
    }
}

/// Exact V3 output from the on-chain quoter (simulated via `eth_call`).
pub async fn quote_exact_input_single(
    client: RpcClient,
    quoter_address: Address,
    token_in: Address,
    token_out: Address,
    fee_bps: u32,
    amount_in: U256,
) -> Result<U256> {
    let quoter = quoter::Quoter::new(quoter_address, client);
    let out = quoter
        .quote_exact_input_single(
            token_in,
            token_out,
            fee_bps * V3_FEE_UNITS_PER_BPS,
            to_ethers(amount_in),
            ethers::types::U256::zero(),
        )
        .call()
        .await?;
    if out.is_zero() {
        return Err(AppError::DataIncomplete(format!(
            "quoter returned zero for {token_in:#x} -> {token_out:#x}"
        )));
    }
    Ok(to_alloy(out))
}

pub async fn block_number(client: RpcClient) -> Result<u64> {
    Ok(client.get_block_number().await?.as_u64())
}

pub async fn gas_price_gwei(client: RpcClient) -> Result<f64> {
    let wei = client.get_gas_price().await?;
    Ok(wei.as_u128() as f64 / 1_000_000_000.0)
}
