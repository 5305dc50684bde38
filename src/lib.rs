//! Core library for the DEX arbitrage scanner.
//!
//! Pools are read through a failover RPC layer and a TTL cache, priced in
//! USD, scanned for pairwise, triangular and multi-hop cycles, and the
//! candidates pass a safety gate before reaching an executor.

pub mod aggregator;
pub mod arbitrage;
pub mod cache;
pub mod config;
pub mod dex;
pub mod errors;
pub mod execution;
pub mod models;
pub mod pricing;
pub mod rpc;
pub mod utils;
