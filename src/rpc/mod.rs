//! Multi-endpoint RPC access: health tracking and tiered failover.

use crate::config::EndpointSpec;
use crate::errors::{AppError, Result};
use ethers::providers::{Http, Provider};
use std::sync::Arc;
use url::Url;

pub mod endpoint;
pub mod failover;

pub use endpoint::{
    Endpoint, EndpointPool, EndpointStats, ErrorClass, ErrorClassifier, PatternClassifier, Tier,
};
pub use failover::{FailoverConfig, FailoverExecutor, HealthReport};

/// Connection handle shared by every call routed to one endpoint.
pub type RpcClient = Arc<Provider<Http>>;

/// Builds one HTTP provider per configured endpoint. Malformed URLs are a
/// configuration error, not something to skip.
pub fn connect(specs: &[EndpointSpec]) -> Result<Vec<Endpoint<RpcClient>>> {
    specs
        .iter()
        .map(|spec| {
            let url = Url::parse(&spec.url)?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AppError::Config(format!(
                    "endpoint {} must use http(s), got {}",
                    spec.name,
                    url.scheme()
                )));
            }
            let provider = Provider::new(Http::new(url));
            Ok(Endpoint::new(
                spec.name.clone(),
                spec.url.clone(),
                spec.tier,
                spec.rate_limit_per_minute,
                Arc::new(provider),
            ))
        })
        .collect()
}
