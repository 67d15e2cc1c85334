use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::Tool;
use finflow_core::types::ToolResult;

use super::portfolio::{Holding, PortfolioDb};

#[derive(Debug, Clone, Serialize)]
pub struct PositionStats {
    pub ticker: String,
    pub market_value: f64,
    pub weight: f64,
    pub unrealized_pnl: f64,
    pub unrealized_pnl_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioAnalytics {
    pub total_value: f64,
    pub total_cost: f64,
    pub unrealized_pnl: f64,
    pub positions: Vec<PositionStats>,
    /// Sector name -> weight of total value.
    pub sector_weights: BTreeMap<String, f64>,
    /// Herfindahl index over sector weights (1.0 = single sector).
    pub sector_hhi: f64,
    pub largest_position: Option<String>,
}

/// Compute allocation and P&L figures. Positions without a current price
/// are valued at their average purchase price.
pub fn analyze(holdings: &[Holding]) -> PortfolioAnalytics {
    let valued: Vec<(&Holding, f64, f64)> = holdings
        .iter()
        .map(|h| {
            let price = h.current_price.unwrap_or(h.avg_purchase_price);
            (h, h.shares * price, h.shares * h.avg_purchase_price)
        })
        .collect();

    let total_value: f64 = valued.iter().map(|(_, v, _)| v).sum();
    let total_cost: f64 = valued.iter().map(|(_, _, c)| c).sum();
    let weight = |v: f64| if total_value > 0.0 { v / total_value } else { 0.0 };

    let positions: Vec<PositionStats> = valued
        .iter()
        .map(|(h, value, cost)| PositionStats {
            ticker: h.ticker.clone(),
            market_value: round2(*value),
            weight: round4(weight(*value)),
            unrealized_pnl: round2(value - cost),
            unrealized_pnl_pct: if *cost > 0.0 {
                round2((value - cost) / cost * 100.0)
            } else {
                0.0
            },
        })
        .collect();

    let mut sectors: BTreeMap<String, f64> = BTreeMap::new();
    for (h, value, _) in &valued {
        let sector = h.sector.clone().unwrap_or_else(|| "Unknown".to_string());
        *sectors.entry(sector).or_insert(0.0) += weight(*value);
    }
    let sector_hhi = round4(sectors.values().map(|w| w * w).sum());
    let sector_weights = sectors.into_iter().map(|(k, w)| (k, round4(w))).collect();

    let largest_position = valued
        .iter()
        .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.ticker.cmp(&a.0.ticker)))
        .map(|(h, _, _)| h.ticker.clone());

    PortfolioAnalytics {
        total_value: round2(total_value),
        total_cost: round2(total_cost),
        unrealized_pnl: round2(total_value - total_cost),
        positions,
        sector_weights,
        sector_hhi,
        largest_position,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn round4(v: f64) -> f64 {
    (v * 10_000.0).round() / 10_000.0
}

pub struct PortfolioAnalyticsTool {
    db: Option<Arc<PortfolioDb>>,
}

impl PortfolioAnalyticsTool {
    pub fn new(db: Option<Arc<PortfolioDb>>) -> Self {
        Self { db }
    }
}

#[derive(Deserialize)]
struct AnalyticsInput {
    #[serde(default)]
    portfolio_id: Option<i64>,
    #[serde(default)]
    holdings: Option<Vec<Holding>>,
}

impl Tool for PortfolioAnalyticsTool {
    fn name(&self) -> &str {
        "portfolio_analytics"
    }

    fn timeout_secs(&self) -> u64 {
        15
    }

    fn description(&self) -> &str {
        "Compute allocation weights, sector concentration (HHI) and unrealized P&L \
         for a stored portfolio or an explicit list of holdings."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "portfolio_id": { "type": "integer" },
                "holdings": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "ticker": { "type": "string" },
                            "name": { "type": "string" },
                            "sector": { "type": "string" },
                            "shares": { "type": "number" },
                            "avg_purchase_price": { "type": "number" },
                            "current_price": { "type": "number" }
                        },
                        "required": ["ticker", "name", "shares", "avg_purchase_price"]
                    }
                }
            }
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: AnalyticsInput = serde_json::from_value(input)
                .map_err(|e| FinflowError::ToolValidation(e.to_string()))?;

            let holdings = match (p.holdings, p.portfolio_id) {
                (Some(h), _) => h,
                (None, Some(id)) => match &self.db {
                    Some(db) => db.holdings(id).await?,
                    None => {
                        return Ok(ToolResult::error(
                            "No portfolio database configured; pass holdings explicitly",
                        ))
                    }
                },
                (None, None) => {
                    return Err(FinflowError::ToolValidation(
                        "either portfolio_id or holdings is required".into(),
                    ))
                }
            };

            if holdings.is_empty() {
                return Ok(ToolResult::error("Portfolio has no holdings"));
            }
            let stats = analyze(&holdings);
            Ok(ToolResult::success(serde_json::to_string_pretty(&stats)?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(ticker: &str, sector: &str, shares: f64, avg: f64, cur: f64) -> Holding {
        Holding {
            ticker: ticker.into(),
            name: ticker.into(),
            sector: Some(sector.into()),
            shares,
            avg_purchase_price: avg,
            current_price: Some(cur),
        }
    }

    #[test]
    fn test_weights_and_pnl() {
        let stats = analyze(&[
            holding("AAPL", "Technology", 10.0, 150.0, 200.0),
            holding("MSFT", "Technology", 5.0, 300.0, 400.0),
            holding("JNJ", "Healthcare", 10.0, 160.0, 150.0),
        ]);
        // 2000 + 2000 + 1500
        assert_eq!(stats.total_value, 5500.0);
        assert_eq!(stats.total_cost, 4600.0);
        assert_eq!(stats.unrealized_pnl, 900.0);
        let tech = stats.sector_weights["Technology"];
        assert!((tech - 0.7273).abs() < 1e-4);
        assert!(stats.sector_hhi > 0.5 && stats.sector_hhi < 1.0);
        // ties on value resolve to the alphabetically first ticker
        assert_eq!(stats.largest_position.as_deref(), Some("AAPL"));
        let jnj = stats.positions.iter().find(|p| p.ticker == "JNJ").unwrap();
        assert_eq!(jnj.unrealized_pnl, -100.0);
    }

    #[test]
    fn test_single_sector_is_fully_concentrated() {
        let stats = analyze(&[holding("NVDA", "Technology", 1.0, 100.0, 100.0)]);
        assert_eq!(stats.sector_hhi, 1.0);
    }

    #[tokio::test]
    async fn test_tool_requires_some_input() {
        let tool = PortfolioAnalyticsTool::new(None);
        let err = tool.execute(serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, FinflowError::ToolValidation(_)));

        let result = tool
            .execute(serde_json::json!({"portfolio_id": 1}))
            .await
            .unwrap();
        assert!(result.is_error);
    }

    #[tokio::test]
    async fn test_tool_reads_holdings_from_db() {
        let db = Arc::new(crate::builtin::portfolio::tests::seeded_db());
        let tool = PortfolioAnalyticsTool::new(Some(db));
        let result = tool
            .execute(serde_json::json!({"portfolio_id": 10}))
            .await
            .unwrap();
        assert!(!result.is_error);
        let v: serde_json::Value = serde_json::from_str(&result.content).unwrap();
        // 10 * 200 + 5 * 150
        assert_eq!(v["total_value"], 2750.0);
    }
}
