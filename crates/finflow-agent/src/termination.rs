use finflow_core::config::TerminationConfig;
use finflow_core::context::ExecutionContext;
use finflow_core::types::{NodeId, NodeOutput};

/// Predicate deciding when a team stops, evaluated after each member
/// completes.
///
/// Conditions compose with `|` (any) and `&` (all):
///
/// ```rust,ignore
/// let stop = TerminationCondition::TextMention("DONE".into())
///     | TerminationCondition::MaxMessages(6);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationCondition {
    /// Only list exhaustion or the iteration bound stops the team.
    Never,
    /// The latest output contains the text.
    TextMention(String),
    /// Every member has produced at least one output.
    AllReported,
    /// The team has produced at least this many outputs.
    MaxMessages(usize),
    /// Every topic appears (case-insensitively) somewhere in the outputs.
    TopicsCovered(Vec<String>),
    /// The key resolves in the context.
    ContextKey(String),
    Any(Vec<TerminationCondition>),
    All(Vec<TerminationCondition>),
}

/// What a team has done so far.
#[derive(Debug, Clone, Copy)]
pub struct TeamProgress<'a> {
    pub members: &'a [NodeId],
    pub outputs: &'a [NodeOutput],
}

impl TerminationCondition {
    pub fn evaluate(&self, ctx: &ExecutionContext, progress: TeamProgress<'_>) -> bool {
        match self {
            Self::Never => false,
            Self::TextMention(text) => progress
                .outputs
                .last()
                .is_some_and(|o| o.content.contains(text.as_str())),
            Self::AllReported => {
                !progress.members.is_empty()
                    && progress
                        .members
                        .iter()
                        .all(|m| progress.outputs.iter().any(|o| &o.node_id == m))
            }
            Self::MaxMessages(count) => progress.outputs.len() >= *count,
            Self::TopicsCovered(topics) => {
                let haystack = progress
                    .outputs
                    .iter()
                    .map(|o| o.content.to_lowercase())
                    .collect::<Vec<_>>()
                    .join("\n");
                topics
                    .iter()
                    .all(|t| haystack.contains(&t.to_lowercase()))
            }
            Self::ContextKey(key) => ctx.lookup(key).is_some(),
            Self::Any(conds) => conds.iter().any(|c| c.evaluate(ctx, progress)),
            Self::All(conds) => {
                !conds.is_empty() && conds.iter().all(|c| c.evaluate(ctx, progress))
            }
        }
    }
}

impl From<TerminationConfig> for TerminationCondition {
    fn from(config: TerminationConfig) -> Self {
        match config {
            TerminationConfig::Never => Self::Never,
            TerminationConfig::TextMention { text } => Self::TextMention(text),
            TerminationConfig::AllReported => Self::AllReported,
            TerminationConfig::MaxMessages { count } => Self::MaxMessages(count),
            TerminationConfig::TopicsCovered { topics } => Self::TopicsCovered(topics),
            TerminationConfig::ContextKey { key } => Self::ContextKey(key),
            TerminationConfig::Any { conditions } => {
                Self::Any(conditions.into_iter().map(Self::from).collect())
            }
            TerminationConfig::All { conditions } => {
                Self::All(conditions.into_iter().map(Self::from).collect())
            }
        }
    }
}

impl std::ops::BitOr for TerminationCondition {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        match self {
            Self::Any(mut conds) => {
                conds.push(rhs);
                Self::Any(conds)
            }
            lhs => Self::Any(vec![lhs, rhs]),
        }
    }
}

impl std::ops::BitAnd for TerminationCondition {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        match self {
            Self::All(mut conds) => {
                conds.push(rhs);
                Self::All(conds)
            }
            lhs => Self::All(vec![lhs, rhs]),
        }
    }
}
