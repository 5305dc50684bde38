/// Configuration for opportunity detection
#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Preferred trade origins, highest priority first.
    pub base_tokens: Vec<String>,
    /// USD notionals every candidate is evaluated at.
    pub notionals_usd: Vec<f64>,
    pub min_profit_usd: f64,
    pub pairwise: bool,
    pub triangular: bool,
    pub graph: bool,
    /// Cap on enumerated triangles.
    pub max_triangle_paths: usize,
    /// Longest cycle the graph search follows.
    pub max_hops: usize,
    /// Pools below this TVL are not graph edges.
    pub min_edge_liquidity_usd: f64,
    /// Cap on rate-positive cycles collected by the graph search.
    pub max_graph_cycles: usize,
    /// Edges the graph search may follow per scan before giving up.
    pub max_graph_expansions: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            base_tokens: ["USDC", "WETH", "WPOL", "DAI"]
                .into_iter()
                .map(String::from)
                .collect(),
            notionals_usd: vec![1_000.0, 10_000.0, 100_000.0],
            min_profit_usd: 1.0,
            pairwise: true,
            triangular: true,
            graph: false,
            max_triangle_paths: 5_000,
            max_hops: 4,
            min_edge_liquidity_usd: 10_000.0,
            max_graph_cycles: 1_000,
            max_graph_expansions: 200_000,
        }
    }
}

impl DetectorConfig {
    /// Position of `symbol` in the base-token priority list.
    pub fn base_rank(&self, symbol: &str) -> Option<usize> {
        self.base_tokens
            .iter()
            .position(|b| b.eq_ignore_ascii_case(symbol))
    }
}
