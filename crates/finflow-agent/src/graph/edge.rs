use serde::Serialize;

use finflow_core::context::ExecutionContext;
use finflow_core::error::{FinflowError, Result};
use finflow_core::types::{NodeId, TeamMode};

/// An edge connecting two nodes in the workflow graph.
#[derive(Debug, Clone, Serialize)]
pub struct Edge {
    /// Source node id.
    pub from: NodeId,
    /// Target node id.
    pub to: NodeId,
    pub kind: EdgeKind,
    /// Predicate that must hold for the edge to be taken.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guard: Option<Guard>,
    /// Higher wins when several selector candidates are eligible.
    pub priority: i32,
}

/// What an edge means to the engine.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Membership of a sequential team.
    SequentialNext,
    /// Membership of a parallel team.
    ParallelBranch,
    /// Membership of a selector team.
    SelectorCandidate,
    /// The single member of a delegate team.
    Delegate,
    /// Continuation between top-level plan steps.
    Conditional,
}

impl EdgeKind {
    /// Membership edge kind required by a team mode.
    pub fn for_mode(mode: TeamMode) -> Self {
        match mode {
            TeamMode::Sequential => Self::SequentialNext,
            TeamMode::Parallel => Self::ParallelBranch,
            TeamMode::Selector => Self::SelectorCandidate,
            TeamMode::Delegate => Self::Delegate,
        }
    }

    pub fn is_membership(&self) -> bool {
        !matches!(self, Self::Conditional)
    }
}

impl std::fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::SequentialNext => "sequential_next",
            Self::ParallelBranch => "parallel_branch",
            Self::SelectorCandidate => "selector_candidate",
            Self::Delegate => "delegate",
            Self::Conditional => "conditional",
        };
        write!(f, "{}", s)
    }
}

impl Edge {
    /// Membership edge from a team to one of its members.
    pub fn member(team: impl Into<NodeId>, node: impl Into<NodeId>, mode: TeamMode) -> Self {
        Self {
            from: team.into(),
            to: node.into(),
            kind: EdgeKind::for_mode(mode),
            guard: None,
            priority: 0,
        }
    }

    /// Unguarded continuation edge.
    pub fn conditional(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind: EdgeKind::Conditional,
            guard: None,
            priority: 0,
        }
    }

    /// Attach a guard expression, rejecting anything that does not parse.
    pub fn with_guard(mut self, expr: &str) -> Result<Self> {
        self.guard = Some(Guard::parse(expr)?);
        Ok(self)
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// An unguarded edge always holds.
    pub fn holds(&self, ctx: &ExecutionContext) -> bool {
        self.guard.as_ref().map_or(true, |g| g.evaluate(ctx))
    }
}

/// Comparison used by a [`Guard`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GuardOp {
    Eq,
    Ne,
    Contains,
    NotContains,
    Exists,
    Missing,
}

/// A parsed guard of the form `key OP "value"` or `key exists|missing`.
///
/// Keys resolve through [`ExecutionContext::lookup`], so a guard can test a
/// scratch fact (`intent == "crisis"`, `analyst_status == "failed"`) or the
/// last output of a node (`educator contains "DONE"`).
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Guard {
    pub key: String,
    pub op: GuardOp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Guard {
    /// Parse a guard expression.
    ///
    /// Supported forms:
    /// - `key == "value"` / `key != "value"`
    /// - `key contains "substr"` / `key not_contains "substr"`
    /// - `key exists` / `key missing`
    ///
    /// Values may be quoted or bare.
    pub fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();

        for (word, op) in [("exists", GuardOp::Exists), ("missing", GuardOp::Missing)] {
            if let Some(key) = expr.strip_suffix(word) {
                let key = key.trim();
                if is_valid_key(key) {
                    return Ok(Self {
                        key: key.to_string(),
                        op,
                        value: None,
                    });
                }
            }
        }

        // not_contains must be tried before contains
        let binary = [
            (" not_contains ", GuardOp::NotContains),
            (" contains ", GuardOp::Contains),
            ("!=", GuardOp::Ne),
            ("==", GuardOp::Eq),
        ];
        for (token, op) in binary {
            if let Some((key, value)) = parse_operator(expr, token) {
                if !is_valid_key(key) {
                    continue;
                }
                return Ok(Self {
                    key: key.to_string(),
                    op,
                    value: Some(value.to_string()),
                });
            }
        }

        Err(FinflowError::GraphConfig(format!(
            "unparseable guard expression: {}",
            expr
        )))
    }

    /// Evaluate against the context.
    ///
    /// A missing key makes `==` and `contains` false and makes `!=` and
    /// `not_contains` true.
    pub fn evaluate(&self, ctx: &ExecutionContext) -> bool {
        let actual = ctx.lookup(&self.key);
        let expected = self.value.as_deref().unwrap_or_default();
        match self.op {
            GuardOp::Exists => actual.is_some(),
            GuardOp::Missing => actual.is_none(),
            GuardOp::Eq => actual.is_some_and(|s| s == expected),
            GuardOp::Ne => actual.map_or(true, |s| s != expected),
            GuardOp::Contains => actual.is_some_and(|s| s.contains(expected)),
            GuardOp::NotContains => actual.map_or(true, |s| !s.contains(expected)),
        }
    }
}

impl std::fmt::Display for Guard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self.op {
            GuardOp::Eq => "==",
            GuardOp::Ne => "!=",
            GuardOp::Contains => "contains",
            GuardOp::NotContains => "not_contains",
            GuardOp::Exists => return write!(f, "{} exists", self.key),
            GuardOp::Missing => return write!(f, "{} missing", self.key),
        };
        write!(
            f,
            "{} {} \"{}\"",
            self.key,
            op,
            self.value.as_deref().unwrap_or_default()
        )
    }
}

/// Evaluate a guard expression in one step. Unparseable expressions are false.
pub fn evaluate_guard(expr: &str, ctx: &ExecutionContext) -> bool {
    Guard::parse(expr).is_ok_and(|g| g.evaluate(ctx))
}

/// Split `key OP value` on the first occurrence of `op`, unquoting the value.
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, value) = expr.split_once(op)?;
    let key = key.trim();
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key, value))
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

#[cfg(test)]
mod tests {
    use super::*;
    use finflow_core::types::{RequestId, WorkerResponse};

    fn ctx() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(RequestId::new(), "q");
        ctx.set_fact("intent", serde_json::json!("crisis"));
        ctx.set_fact("risk_tolerance", serde_json::json!("moderate"));
        ctx.record_output(
            &NodeId::from("educator"),
            &WorkerResponse::text("Bonds explained. EDUCATOR_DONE"),
            &[],
        );
        ctx
    }

    #[test]
    fn test_eq_and_ne() {
        let ctx = ctx();
        assert!(evaluate_guard(r#"intent == "crisis""#, &ctx));
        assert!(evaluate_guard("intent == crisis", &ctx));
        assert!(!evaluate_guard(r#"intent == "general""#, &ctx));
        assert!(evaluate_guard(r#"intent != "general""#, &ctx));
        assert!(!evaluate_guard(r#"intent != "crisis""#, &ctx));
    }

    #[test]
    fn test_contains_reads_node_outputs() {
        let ctx = ctx();
        assert!(evaluate_guard(r#"educator contains "EDUCATOR_DONE""#, &ctx));
        assert!(!evaluate_guard(r#"educator not_contains "EDUCATOR_DONE""#, &ctx));
        assert!(evaluate_guard(r#"risk_tolerance contains "mod""#, &ctx));
    }

    #[test]
    fn test_missing_key_semantics() {
        let ctx = ctx();
        assert!(!evaluate_guard(r#"analyst == "x""#, &ctx));
        assert!(!evaluate_guard(r#"analyst contains "x""#, &ctx));
        assert!(evaluate_guard(r#"analyst != "x""#, &ctx));
        assert!(evaluate_guard(r#"analyst not_contains "x""#, &ctx));
        assert!(evaluate_guard("analyst missing", &ctx));
        assert!(!evaluate_guard("analyst exists", &ctx));
        assert!(evaluate_guard("educator_status exists", &ctx));
    }

    #[test]
    fn test_unparseable_guards() {
        assert!(Guard::parse("just words here").is_err());
        assert!(Guard::parse("").is_err());
        assert!(Guard::parse(r#"== "x""#).is_err());
        assert!(!evaluate_guard("nonsense", &ctx()));
    }

    #[test]
    fn test_display_round_trips() {
        for expr in [
            r#"intent == "crisis""#,
            r#"educator not_contains "DONE""#,
            "analyst_status exists",
        ] {
            let g = Guard::parse(expr).unwrap();
            assert_eq!(Guard::parse(&g.to_string()).unwrap(), g);
        }
    }

    #[test]
    fn test_edge_holds() {
        let ctx = ctx();
        let open = Edge::conditional("a", "b");
        assert!(open.holds(&ctx));
        let guarded = Edge::conditional("a", "b")
            .with_guard(r#"intent == "general""#)
            .unwrap();
        assert!(!guarded.holds(&ctx));
        assert!(Edge::conditional("a", "b").with_guard("???").is_err());
    }

    #[test]
    fn test_member_kind_follows_mode() {
        assert_eq!(
            Edge::member("t", "w", TeamMode::Parallel).kind,
            EdgeKind::ParallelBranch
        );
        assert_eq!(
            Edge::member("t", "w", TeamMode::Delegate).kind,
            EdgeKind::Delegate
        );
        assert!(!EdgeKind::Conditional.is_membership());
    }
}
