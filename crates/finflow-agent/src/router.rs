//! Intent routing: maps a free-form request to one of a closed set of
//! intents and from there to the graph's entry node for that intent.
//!
//! Classification sits behind [`IntentClassifier`]; the default
//! [`KeywordClassifier`] scores configurable keyword rules. The router never
//! touches the execution context.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use serde::Serialize;
use tracing::debug;

use finflow_core::config::RuleConfig;
use finflow_core::error::{FinflowError, Result};
use finflow_core::types::NodeId;

/// The closed set of request intents, in tie-breaking priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Crisis,
    Optimization,
    EducationAnalysis,
    Education,
    Research,
    General,
}

impl Intent {
    pub const ALL: [Intent; 6] = [
        Intent::Crisis,
        Intent::Optimization,
        Intent::EducationAnalysis,
        Intent::Education,
        Intent::Research,
        Intent::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Crisis => "crisis",
            Self::Optimization => "optimization",
            Self::EducationAnalysis => "education_analysis",
            Self::Education => "education",
            Self::Research => "research",
            Self::General => "general",
        }
    }

    /// Lower ranks win ties.
    pub fn rank(&self) -> usize {
        Self::ALL.iter().position(|i| i == self).unwrap_or(Self::ALL.len())
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Intent {
    type Err = FinflowError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s.trim())
            .ok_or_else(|| FinflowError::Config(format!("unknown intent: {}", s)))
    }
}

/// Extra information the engine uses when building the plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RouteHint {
    /// No intent was confident; the broad fan-out joins stage 0.
    pub broad: bool,
    /// Score of every intent that matched at all.
    pub scores: BTreeMap<String, f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub intent: Intent,
    pub entry: NodeId,
    pub hint: RouteHint,
}

/// Scores a request against each intent. Zero scores may be omitted.
pub trait IntentClassifier: Send + Sync + 'static {
    fn classify(&self, query: &str) -> Result<Vec<(Intent, f32)>>;
}

/// One keyword rule. Every `require` group must have a hit for the groups
/// to count; each matching phrase adds one more point.
#[derive(Debug, Clone)]
struct Rule {
    intent: Intent,
    require: Vec<Vec<String>>,
    phrases: Vec<String>,
    weight: f32,
}

impl Rule {
    fn new(intent: Intent, require: &[&[&str]], phrases: &[&str], weight: f32) -> Self {
        Self {
            intent,
            require: require
                .iter()
                .map(|g| g.iter().map(|k| k.to_string()).collect())
                .collect(),
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
            weight,
        }
    }

    fn score(&self, normalized: &str, tokens: &[&str]) -> f32 {
        let groups = if !self.require.is_empty()
            && self
                .require
                .iter()
                .all(|group| group.iter().any(|k| keyword_hit(k, normalized, tokens)))
        {
            self.require.len() as f32
        } else {
            0.0
        };
        let phrases = self
            .phrases
            .iter()
            .filter(|p| normalized.contains(p.as_str()))
            .count() as f32;
        (groups + phrases) * self.weight
    }
}

/// Single words match any token starting with them ("crash" hits
/// "crashes"); multi-word or hyphenated keywords match as substrings.
fn keyword_hit(keyword: &str, normalized: &str, tokens: &[&str]) -> bool {
    if keyword.contains(' ') || keyword.contains('-') {
        normalized.contains(keyword)
    } else {
        tokens.iter().any(|t| t.starts_with(keyword))
    }
}

fn normalize(query: &str) -> String {
    query
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '\'' {
                c
            } else {
                ' '
            }
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Rule-based classifier over lowercase keywords.
#[derive(Debug, Clone)]
pub struct KeywordClassifier {
    rules: Vec<Rule>,
}

impl KeywordClassifier {
    /// Build from configured rules; an empty list yields the default rules.
    pub fn from_rules(rules: &[RuleConfig]) -> Result<Self> {
        if rules.is_empty() {
            return Ok(Self::default());
        }
        let rules = rules
            .iter()
            .map(|r| {
                Ok(Rule {
                    intent: r.intent.parse()?,
                    require: r
                        .require
                        .iter()
                        .map(|g| g.iter().map(|k| k.to_lowercase()).collect())
                        .collect(),
                    phrases: r.phrases.iter().map(|p| normalize(p)).collect(),
                    weight: r.weight,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        let rules = vec![
            Rule::new(
                Intent::Crisis,
                &[
                    &["crisis", "volatility", "crash", "real-time", "urgent", "selloff", "sell-off"],
                    &["portfolio", "rebalance", "optimize", "allocation", "protect", "holdings", "risk"],
                ],
                &[],
                2.0,
            ),
            Rule::new(
                Intent::EducationAnalysis,
                &[
                    &["educate", "learn", "explain", "teach", "beginner", "know"],
                    &["invest", "portfolio", "rebalance", "allocation", "returns"],
                ],
                &["should i invest"],
                1.0,
            ),
            Rule::new(
                Intent::Optimization,
                &[&["optimize", "optimise", "rebalance", "portfolio", "allocation", "returns", "risk"]],
                &[],
                1.0,
            ),
            Rule::new(
                Intent::Education,
                &[&["educate", "learn", "explain", "teach", "education", "beginner", "what is", "what are"]],
                &[],
                1.0,
            ),
            Rule::new(
                Intent::Research,
                &[&["research", "news", "trends", "latest", "volatility", "crisis"]],
                &[],
                1.0,
            ),
        ];
        Self { rules }
    }
}

impl IntentClassifier for KeywordClassifier {
    fn classify(&self, query: &str) -> Result<Vec<(Intent, f32)>> {
        let normalized = normalize(query);
        let tokens: Vec<&str> = normalized.split(' ').collect();
        let mut best: HashMap<Intent, f32> = HashMap::new();
        for rule in &self.rules {
            let score = rule.score(&normalized, &tokens);
            if score > 0.0 {
                let slot = best.entry(rule.intent).or_insert(0.0);
                *slot = slot.max(score);
            }
        }
        let mut scores: Vec<(Intent, f32)> = best.into_iter().collect();
        scores.sort_by_key(|(intent, _)| *intent);
        Ok(scores)
    }
}

/// Maps requests to entry nodes.
pub struct IntentRouter {
    classifier: Box<dyn IntentClassifier>,
    entries: HashMap<Intent, NodeId>,
    default_entry: NodeId,
    min_confidence: f32,
}

impl IntentRouter {
    pub fn new(
        classifier: Box<dyn IntentClassifier>,
        entries: HashMap<Intent, NodeId>,
        default_entry: NodeId,
        min_confidence: f32,
    ) -> Self {
        Self {
            classifier,
            entries,
            default_entry,
            min_confidence,
        }
    }

    pub fn default_entry(&self) -> &NodeId {
        &self.default_entry
    }

    /// Entry node for an intent, falling back to the default entry.
    pub fn entry_for(&self, intent: Intent) -> &NodeId {
        self.entries.get(&intent).unwrap_or(&self.default_entry)
    }

    /// Classify the request and pick its entry node.
    ///
    /// Fails with [`FinflowError::Routing`] on empty input or when the
    /// classifier errors. When nothing scores at or above `min_confidence`
    /// the decision is `general` with `hint.broad` set.
    pub fn route(&self, query: &str) -> Result<RouteDecision> {
        if query.trim().is_empty() {
            return Err(FinflowError::Routing("empty request".into()));
        }
        let scores = self
            .classifier
            .classify(query)
            .map_err(|e| FinflowError::Routing(e.to_string()))?;

        let winner = scores
            .iter()
            .filter(|(_, s)| *s >= self.min_confidence && *s > 0.0)
            .max_by(|(ia, sa), (ib, sb)| {
                sa.total_cmp(sb)
                    // lower rank wins a tie, so it must compare greater
                    .then_with(|| ib.rank().cmp(&ia.rank()))
            })
            .map(|(i, _)| *i);

        let hint = RouteHint {
            broad: winner.is_none(),
            scores: scores
                .iter()
                .map(|(i, s)| (i.as_str().to_string(), *s))
                .collect(),
        };
        let intent = winner.unwrap_or(Intent::General);
        let entry = self.entry_for(intent).clone();
        debug!(intent = %intent, entry = %entry, broad = hint.broad, "Routed request");
        Ok(RouteDecision {
            intent,
            entry,
            hint,
        })
    }
}

/// Sector named in a request, used to seed the `sector` scratch hint.
/// The earliest mention wins.
pub fn detect_sector(query: &str) -> Option<&'static str> {
    const SECTORS: [(&str, &[&str]); 4] = [
        ("tech", &["tech", "technology", "software", "semiconductor", "ai"]),
        ("healthcare", &["healthcare", "health", "biotech", "pharma", "medical"]),
        ("finance", &["finance", "financial", "bank", "banks", "banking", "fintech"]),
        ("energy", &["energy", "oil", "gas", "renewable", "renewables"]),
    ];
    normalize(query).split(' ').find_map(|token| {
        SECTORS
            .iter()
            .find(|(_, words)| words.contains(&token))
            .map(|(sector, _)| *sector)
    })
}
