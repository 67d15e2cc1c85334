pub mod analytics;
pub mod knowledge;
pub mod market_data;
pub mod portfolio;

pub use analytics::PortfolioAnalyticsTool;
pub use knowledge::{KnowledgeBase, KnowledgeSearchTool};
pub use market_data::MarketDataTool;
pub use portfolio::{initialize_store, PortfolioDb, PortfolioQueryTool};
