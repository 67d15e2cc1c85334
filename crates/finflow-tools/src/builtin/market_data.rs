use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use finflow_core::config::MarketDataConfig;
use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::Tool;
use finflow_core::types::ToolResult;

/// Quote lookup against an HTTP JSON endpoint.
pub struct MarketDataTool {
    client: reqwest::Client,
    config: MarketDataConfig,
}

impl MarketDataTool {
    pub fn new(config: MarketDataConfig) -> Result<Self> {
        if !config.url_template.contains("{ticker}") {
            return Err(FinflowError::Config(
                "tools.market_data.url_template must contain {ticker}".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(20))
            .user_agent("finflow/0.3")
            .build()
            .map_err(|e| FinflowError::Config(format!("HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url_for(&self, ticker: &str) -> String {
        self.config.url_template.replace("{ticker}", ticker)
    }
}

#[derive(Deserialize)]
struct MarketDataInput {
    ticker: String,
}

fn validate_ticker(ticker: &str) -> Result<String> {
    let t = ticker.trim().to_uppercase();
    let ok = !t.is_empty()
        && t.len() <= 12
        && t.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | '='));
    if ok {
        Ok(t)
    } else {
        Err(FinflowError::ToolValidation(format!(
            "invalid ticker symbol: {:?}",
            ticker
        )))
    }
}

impl Tool for MarketDataTool {
    fn name(&self) -> &str {
        "market_data"
    }

    fn timeout_secs(&self) -> u64 {
        30
    }

    fn description(&self) -> &str {
        "Fetch the latest quote data for a ticker symbol."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "ticker": { "type": "string", "description": "Ticker symbol, e.g. AAPL" }
            },
            "required": ["ticker"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: MarketDataInput = serde_json::from_value(input)
                .map_err(|e| FinflowError::ToolValidation(e.to_string()))?;
            let ticker = validate_ticker(&p.ticker)?;
            let url = self.url_for(&ticker);

            debug!(ticker = %ticker, "Fetching quote");

            let mut req = self.client.get(&url);
            if let Some(key) = &self.config.api_key {
                req = req.header(self.config.api_key_header.as_str(), key);
            }
            let resp = req.send().await.map_err(|e| FinflowError::ToolExecution {
                tool: "market_data".to_string(),
                message: format!("Request failed: {}", e),
            })?;

            let status = resp.status();
            if !status.is_success() {
                return Ok(ToolResult::error(format!(
                    "Quote request for {} failed with HTTP {}",
                    ticker, status
                )));
            }

            let body: serde_json::Value =
                resp.json().await.map_err(|e| FinflowError::ToolExecution {
                    tool: "market_data".to_string(),
                    message: format!("Invalid JSON: {}", e),
                })?;
            Ok(ToolResult::success(serde_json::to_string_pretty(&body)?))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MarketDataConfig {
        MarketDataConfig {
            url_template: "https://quotes.example.com/v1/{ticker}".into(),
            api_key: None,
            api_key_header: "X-API-Key".into(),
        }
    }

    #[test]
    fn test_template_requires_placeholder() {
        let mut c = config();
        c.url_template = "https://quotes.example.com/v1".into();
        assert!(MarketDataTool::new(c).is_err());
    }

    #[test]
    fn test_url_substitution() {
        let tool = MarketDataTool::new(config()).unwrap();
        assert_eq!(tool.url_for("MSFT"), "https://quotes.example.com/v1/MSFT");
    }

    #[test]
    fn test_ticker_validation() {
        assert_eq!(validate_ticker(" brk.b ").unwrap(), "BRK.B");
        assert_eq!(validate_ticker("^GSPC").unwrap(), "^GSPC");
        assert!(validate_ticker("").is_err());
        assert!(validate_ticker("AAPL/../../etc").is_err());
    }

    #[tokio::test]
    async fn test_bad_ticker_never_hits_network() {
        let tool = MarketDataTool::new(config()).unwrap();
        let err = tool
            .execute(serde_json::json!({"ticker": "a b"}))
            .await
            .unwrap_err();
        assert!(matches!(err, FinflowError::ToolValidation(_)));
    }
}
