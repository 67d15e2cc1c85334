use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use tracing::debug;

use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::Tool;
use finflow_core::types::ToolResult;

/// Tables the portfolio store is expected to hold.
const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id INTEGER PRIMARY KEY,
    email TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    role TEXT NOT NULL DEFAULT 'user',
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS portfolios (
    portfolio_id INTEGER PRIMARY KEY,
    user_id INTEGER NOT NULL REFERENCES users(user_id),
    name TEXT NOT NULL,
    description TEXT,
    cash_balance REAL NOT NULL DEFAULT 10000.0,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);
CREATE TABLE IF NOT EXISTS stocks (
    stock_id INTEGER PRIMARY KEY,
    ticker TEXT UNIQUE NOT NULL,
    name TEXT NOT NULL,
    sector TEXT,
    industry TEXT,
    current_price REAL,
    previous_close_price REAL
);
CREATE TABLE IF NOT EXISTS portfolio_holdings (
    holding_id INTEGER PRIMARY KEY,
    portfolio_id INTEGER NOT NULL REFERENCES portfolios(portfolio_id),
    stock_id INTEGER NOT NULL REFERENCES stocks(stock_id),
    shares REAL NOT NULL,
    avg_purchase_price REAL NOT NULL,
    UNIQUE(portfolio_id, stock_id)
);
CREATE TABLE IF NOT EXISTS transactions (
    transaction_id INTEGER PRIMARY KEY,
    portfolio_id INTEGER NOT NULL REFERENCES portfolios(portfolio_id),
    stock_id INTEGER NOT NULL REFERENCES stocks(stock_id),
    transaction_type TEXT NOT NULL,
    shares REAL,
    price_per_share REAL,
    total_amount REAL NOT NULL,
    fees REAL DEFAULT 0.0,
    timestamp TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    notes TEXT
);
";

/// Demo rows for a fresh store: one user with a small two-sector portfolio.
const SAMPLE_DATA: &str = "
INSERT OR IGNORE INTO users (user_id, email, name) VALUES (1, 'demo@example.com', 'Demo Investor');
INSERT OR IGNORE INTO portfolios (portfolio_id, user_id, name, description)
    VALUES (1, 1, 'Core', 'Balanced long-term holdings');
INSERT OR IGNORE INTO stocks (stock_id, ticker, name, sector, industry, current_price, previous_close_price)
    VALUES (1, 'AAPL', 'Apple Inc.', 'Technology', 'Consumer Electronics', 190.0, 188.5),
           (2, 'MSFT', 'Microsoft Corporation', 'Technology', 'Software', 410.0, 405.0),
           (3, 'JNJ', 'Johnson & Johnson', 'Healthcare', 'Pharmaceuticals', 155.0, 156.2),
           (4, 'JPM', 'JPMorgan Chase & Co.', 'Financials', 'Banks', 195.0, 193.4);
INSERT OR IGNORE INTO portfolio_holdings (portfolio_id, stock_id, shares, avg_purchase_price)
    VALUES (1, 1, 20, 150.0), (1, 2, 8, 320.0), (1, 3, 15, 160.0), (1, 4, 10, 140.0);
";

/// Create the portfolio tables at `path` (creating the file if needed) and
/// optionally seed demo rows. Existing rows are left alone. Returns the number
/// of portfolios in the store afterwards.
pub fn initialize_store(path: &Path, sample: bool) -> Result<i64> {
    let db_err = |e: rusqlite::Error| FinflowError::Database(format!("{}: {}", path.display(), e));
    let conn = Connection::open(path).map_err(db_err)?;
    conn.execute_batch(SCHEMA).map_err(db_err)?;
    if sample {
        conn.execute_batch(SAMPLE_DATA).map_err(db_err)?;
    }
    let portfolios = conn
        .query_row("SELECT COUNT(*) FROM portfolios", [], |row| row.get(0))
        .map_err(db_err)?;
    debug!(path = %path.display(), portfolios, sample, "Portfolio store initialized");
    Ok(portfolios)
}

/// One position joined with its stock row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    pub ticker: String,
    pub name: String,
    #[serde(default)]
    pub sector: Option<String>,
    pub shares: f64,
    pub avg_purchase_price: f64,
    #[serde(default)]
    pub current_price: Option<f64>,
}

/// Read-only handle on the portfolio SQLite store.
pub struct PortfolioDb {
    conn: Arc<Mutex<Connection>>,
}

impl PortfolioDb {
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| FinflowError::Database(format!("{}: {}", path.display(), e)))?;
        debug!(path = %path.display(), "Portfolio database opened read-only");
        Ok(Self::from_connection(conn))
    }

    /// Wrap an existing connection (tests use an in-memory database).
    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| FinflowError::Database("connection lock poisoned".into()))?;
            f(&guard).map_err(|e| FinflowError::Database(e.to_string()))
        })
        .await
        .map_err(|e| FinflowError::Database(format!("query task failed: {}", e)))?
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<serde_json::Value>> {
        let email = email.to_string();
        let rows = self
            .with_conn(move |c| {
                rows_to_json(c, "SELECT * FROM users WHERE email = ?1", params![email])
            })
            .await?;
        Ok(rows.into_iter().next())
    }

    pub async fn portfolios_for_email(&self, email: &str) -> Result<Vec<serde_json::Value>> {
        let email = email.to_string();
        self.with_conn(move |c| {
            rows_to_json(
                c,
                "SELECT p.* FROM portfolios p JOIN users u ON p.user_id = u.user_id \
                 WHERE u.email = ?1 ORDER BY p.portfolio_id",
                params![email],
            )
        })
        .await
    }

    pub async fn holdings(&self, portfolio_id: i64) -> Result<Vec<Holding>> {
        self.with_conn(move |c| {
            let mut stmt = c.prepare(
                "SELECT s.ticker, s.name, s.sector, h.shares, h.avg_purchase_price, s.current_price \
                 FROM portfolio_holdings h JOIN stocks s ON h.stock_id = s.stock_id \
                 WHERE h.portfolio_id = ?1 ORDER BY s.ticker",
            )?;
            let rows = stmt.query_map(params![portfolio_id], |r| {
                Ok(Holding {
                    ticker: r.get(0)?,
                    name: r.get(1)?,
                    sector: r.get(2)?,
                    shares: r.get(3)?,
                    avg_purchase_price: r.get(4)?,
                    current_price: r.get(5)?,
                })
            })?;
            let holdings = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(holdings)
        })
        .await
    }

    pub async fn transactions(&self, portfolio_id: i64, limit: usize) -> Result<Vec<serde_json::Value>> {
        let limit = limit as i64;
        self.with_conn(move |c| {
            rows_to_json(
                c,
                "SELECT t.transaction_type, s.ticker, t.shares, t.price_per_share, \
                 t.total_amount, t.fees, t.timestamp, t.notes \
                 FROM transactions t JOIN stocks s ON t.stock_id = s.stock_id \
                 WHERE t.portfolio_id = ?1 ORDER BY t.timestamp DESC, t.transaction_id DESC LIMIT ?2",
                params![portfolio_id, limit],
            )
        })
        .await
    }

    /// Run a single read-only SELECT statement.
    pub async fn select(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        let sql = validate_select(sql)?;
        self.with_conn(move |c| rows_to_json(c, &sql, [])).await
    }
}

fn validate_select(sql: &str) -> Result<String> {
    let trimmed = sql.trim().trim_end_matches(';').trim();
    let lower = trimmed.to_lowercase();
    if !(lower.starts_with("select") || lower.starts_with("with")) {
        return Err(FinflowError::ToolValidation(
            "only SELECT statements are allowed".into(),
        ));
    }
    if trimmed.contains(';') {
        return Err(FinflowError::ToolValidation(
            "multiple statements are not allowed".into(),
        ));
    }
    Ok(trimmed.to_string())
}

fn rows_to_json<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut obj = serde_json::Map::new();
        for (i, name) in columns.iter().enumerate() {
            let value = match row.get_ref(i)? {
                ValueRef::Null => serde_json::Value::Null,
                ValueRef::Integer(n) => serde_json::json!(n),
                ValueRef::Real(f) => serde_json::json!(f),
                ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
                ValueRef::Blob(b) => serde_json::Value::String(format!("<{} bytes>", b.len())),
            };
            obj.insert(name.clone(), value);
        }
        out.push(serde_json::Value::Object(obj));
    }
    Ok(out)
}

pub struct PortfolioQueryTool {
    db: Arc<PortfolioDb>,
}

impl PortfolioQueryTool {
    pub fn new(db: Arc<PortfolioDb>) -> Self {
        Self { db }
    }
}

#[derive(Deserialize)]
#[serde(tag = "query", rename_all = "snake_case")]
enum PortfolioQuery {
    User {
        email: String,
    },
    UserPortfolios {
        email: String,
    },
    Holdings {
        portfolio_id: i64,
    },
    Transactions {
        portfolio_id: i64,
        #[serde(default = "default_tx_limit")]
        limit: usize,
    },
    Sql {
        sql: String,
    },
}

fn default_tx_limit() -> usize {
    20
}

impl Tool for PortfolioQueryTool {
    fn name(&self) -> &str {
        "portfolio_query"
    }

    fn timeout_secs(&self) -> u64 {
        15
    }

    fn max_concurrency(&self) -> usize {
        2
    }

    fn description(&self) -> &str {
        "Read user, portfolio, holding and transaction records. \
         query is one of user, user_portfolios, holdings, transactions, sql."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "enum": ["user", "user_portfolios", "holdings", "transactions", "sql"]
                },
                "email": { "type": "string" },
                "portfolio_id": { "type": "integer" },
                "limit": { "type": "integer" },
                "sql": { "type": "string", "description": "A single SELECT statement" }
            },
            "required": ["query"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let q: PortfolioQuery = serde_json::from_value(input)
                .map_err(|e| FinflowError::ToolValidation(e.to_string()))?;

            let value = match q {
                PortfolioQuery::User { email } => match self.db.user_by_email(&email).await? {
                    Some(user) => user,
                    None => return Ok(ToolResult::error(format!("No user with email {}", email))),
                },
                PortfolioQuery::UserPortfolios { email } => {
                    serde_json::json!(self.db.portfolios_for_email(&email).await?)
                }
                PortfolioQuery::Holdings { portfolio_id } => {
                    serde_json::to_value(self.db.holdings(portfolio_id).await?)?
                }
                PortfolioQuery::Transactions {
                    portfolio_id,
                    limit,
                } => serde_json::json!(self.db.transactions(portfolio_id, limit).await?),
                PortfolioQuery::Sql { sql } => serde_json::json!(self.db.select(&sql).await?),
            };
            Ok(ToolResult::success(serde_json::to_string_pretty(&value)?))
        })
    }
}
