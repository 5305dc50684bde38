use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Provider error: {0}")]
    Provider(#[from] ethers::providers::ProviderError),

    #[error("Contract error: {0}")]
    Contract(
        #[from]
        ethers::contract::ContractError<ethers::providers::Provider<ethers::providers::Http>>,
    ),

    #[error("Serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// A single endpoint call failed or timed out; the failover layer retries these.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("All RPC retries failed for {operation}. Alive: {alive}/{total}, Last error: {last_error}")]
    ExhaustedEndpoints {
        operation: String,
        alive: usize,
        total: usize,
        last_error: String,
    },

    /// Missing decimals, price, reserves or liquidity. Callers skip the pool.
    #[error("Incomplete data: {0}")]
    DataIncomplete(String),

    #[error("Execution failed: {0}")]
    ExecutionFailure(String),
}
