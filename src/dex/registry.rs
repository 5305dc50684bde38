//! Pool and token registry, loaded from JSON at startup and read-only after.

use crate::errors::{AppError, Result};
use crate::models::{PoolKind, Token};
use ethers::types::Address;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

/// Fee used for constant-product pools whose entry does not set one.
pub const DEFAULT_V2_FEE_BPS: u32 = 30;

#[derive(Debug, Deserialize)]
struct TokenSpec {
    address: Address,
    decimals: u8,
}

#[derive(Debug, Deserialize)]
struct PoolSpec {
    address: Address,
    kind: PoolKind,
    #[serde(default)]
    fee_bps: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    tokens: BTreeMap<String, TokenSpec>,
    pools: BTreeMap<String, BTreeMap<String, PoolSpec>>,
}

/// One pool the scanner should price.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryPool {
    pub dex: String,
    /// Human label from the registry, e.g. `USDC/WETH`.
    pub pair: String,
    pub address: Address,
    pub kind: PoolKind,
    /// Constant-product fee. Concentrated pools read their tier on chain.
    pub fee_bps: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct PoolRegistry {
    tokens: HashMap<Address, Token>,
    pools: Vec<RegistryPool>,
}

impl PoolRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::Config(format!("cannot read pool registry {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(raw)?;
        let tokens: HashMap<Address, Token> = file
            .tokens
            .into_iter()
            .map(|(symbol, spec)| (spec.address, Token::new(symbol, spec.address, spec.decimals)))
            .collect();

        let mut seen = HashSet::new();
        let mut pools = Vec::new();
        for (dex, entries) in file.pools {
            for (pair, spec) in entries {
                if !seen.insert(spec.address) {
                    tracing::warn!(
                        %dex,
                        %pair,
                        address = ?spec.address,
                        "[DEX] duplicate pool address skipped"
                    );
                    continue;
                }
                pools.push(RegistryPool {
                    dex: dex.clone(),
                    pair,
                    address: spec.address,
                    kind: spec.kind,
                    fee_bps: spec.fee_bps,
                });
            }
        }
        tracing::info!(tokens = tokens.len(), pools = pools.len(), "[DEX] pool registry loaded");
        Ok(Self { tokens, pools })
    }

    pub fn from_parts(tokens: Vec<Token>, pools: Vec<RegistryPool>) -> Self {
        Self {
            tokens: tokens.into_iter().map(|t| (t.address, t)).collect(),
            pools,
        }
    }

    pub fn token(&self, address: Address) -> Option<&Token> {
        self.tokens.get(&address)
    }

    pub fn token_by_symbol(&self, symbol: &str) -> Option<&Token> {
        self.tokens
            .values()
            .find(|t| t.symbol.eq_ignore_ascii_case(symbol))
    }

    pub fn pools(&self) -> &[RegistryPool] {
        &self.pools
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}
