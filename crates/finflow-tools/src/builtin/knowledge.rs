use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Deserialize;
use tracing::debug;

use finflow_core::error::{FinflowError, Result};
use finflow_core::traits::Tool;
use finflow_core::types::ToolResult;

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "what", "how", "with", "that", "this", "from", "should", "into",
    "about", "you", "your", "can", "does", "why", "when", "which", "have", "has", "will",
];

const SECTOR_DOMAINS: &[&str] = &["tech_sector", "finance_sector", "healthcare_sector"];

/// One passage of a knowledge collection.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub domain: String,
    pub text: String,
    terms: HashSet<String>,
}

/// Keyword-retrieval store over a directory of `.txt` collections.
///
/// Each file is one domain (its stem, e.g. `general_finance`,
/// `tech_sector`, `investment_strategies`, `risk_management`); passages are
/// separated by blank lines.
#[derive(Debug, Default)]
pub struct KnowledgeBase {
    chunks: Vec<Chunk>,
}

impl KnowledgeBase {
    pub fn load(dir: &Path) -> Result<Self> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("txt"))
            .collect();
        entries.sort();

        let mut kb = Self::default();
        for path in entries {
            let domain = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default()
                .to_string();
            let content = std::fs::read_to_string(&path)?;
            kb.add_document(&domain, &content);
        }
        Ok(kb)
    }

    pub fn add_document(&mut self, domain: &str, content: &str) {
        for passage in content.split("\n\n") {
            let text = passage.trim();
            if text.is_empty() {
                continue;
            }
            self.chunks.push(Chunk {
                domain: domain.to_string(),
                text: text.to_string(),
                terms: tokenize(text).collect(),
            });
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn domains(&self) -> Vec<&str> {
        let mut d: Vec<&str> = self.chunks.iter().map(|c| c.domain.as_str()).collect();
        d.sort_unstable();
        d.dedup();
        d
    }

    /// Best-matching passages, highest term overlap first; ties keep file
    /// order. Passages sharing no term with the query are never returned.
    pub fn search(&self, query: &str, domains: &[&str], limit: usize) -> Vec<&Chunk> {
        let terms: HashSet<String> = tokenize(query).collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(usize, usize)> = self
            .chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| domains.is_empty() || domains.contains(&c.domain.as_str()))
            .map(|(i, c)| (i, terms.intersection(&c.terms).count()))
            .filter(|(_, score)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

        scored
            .into_iter()
            .take(limit)
            .map(|(i, _)| &self.chunks[i])
            .collect()
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(|w| w.to_lowercase())
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
}

/// Map a sector name to its collection.
pub fn sector_domain(sector: &str) -> Option<&'static str> {
    match sector.to_lowercase().as_str() {
        "tech" | "technology" => Some("tech_sector"),
        "finance" | "financial" => Some("finance_sector"),
        "healthcare" | "health" => Some("healthcare_sector"),
        _ => None,
    }
}

fn format_results(chunks: &[&Chunk]) -> String {
    if chunks.is_empty() {
        return "No relevant information found.".to_string();
    }
    chunks
        .iter()
        .enumerate()
        .map(|(i, c)| format!("{}. {}\n", i + 1, c.text))
        .collect::<Vec<_>>()
        .join("\n")
}

pub struct KnowledgeSearchTool {
    kb: Arc<KnowledgeBase>,
}

impl KnowledgeSearchTool {
    pub fn new(kb: Arc<KnowledgeBase>) -> Self {
        Self { kb }
    }
}

#[derive(Deserialize)]
struct KnowledgeSearchInput {
    query: String,
    #[serde(default)]
    collection: Option<String>,
    #[serde(default)]
    sector: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    3
}

impl Tool for KnowledgeSearchTool {
    fn name(&self) -> &str {
        "knowledge_search"
    }

    fn timeout_secs(&self) -> u64 {
        10
    }

    fn max_concurrency(&self) -> usize {
        8
    }

    fn description(&self) -> &str {
        "Search the financial knowledge base. Optionally restrict to a collection \
         (general_finance, investment_strategies, market_analysis, risk_management) \
         or a sector (tech, finance, healthcare)."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "collection": { "type": "string", "description": "Collection to search" },
                "sector": { "type": "string", "description": "Sector name (tech, finance, healthcare)" },
                "limit": { "type": "integer", "description": "Maximum passages (default: 3)" }
            },
            "required": ["query"]
        })
    }

    fn execute(&self, input: serde_json::Value) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            let p: KnowledgeSearchInput = serde_json::from_value(input)
                .map_err(|e| FinflowError::ToolValidation(e.to_string()))?;

            let domains: Vec<&str> = match (&p.collection, &p.sector) {
                (Some(c), _) => vec![c.as_str()],
                (None, Some(s)) => match sector_domain(s) {
                    Some(d) => vec![d],
                    None => return Ok(ToolResult::error(format!("Unknown sector: {}", s))),
                },
                (None, None) => Vec::new(),
            };
            // "sectors" searches every sector collection at once
            let domains = if domains == ["sectors"] {
                SECTOR_DOMAINS.to_vec()
            } else {
                domains
            };

            let hits = self.kb.search(&p.query, &domains, p.limit.max(1));
            debug!(query = %p.query, hits = hits.len(), "Knowledge search");
            Ok(ToolResult::success(format_results(&hits)))
        })
    }
}
