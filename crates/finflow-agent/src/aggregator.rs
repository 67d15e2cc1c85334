use serde::Serialize;

use finflow_core::types::{NodeFailure, NodeId, NodeOutput};

/// The merged result of a request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregationResult {
    /// Canonical merged text, one `## label` section per output.
    pub content: String,
    /// Distinct contributing nodes, in canonical order.
    pub contributors: Vec<NodeId>,
    pub outputs: Vec<NodeOutput>,
    pub failures: Vec<NodeFailure>,
    /// No usable output at all.
    pub insufficient: bool,
    /// Synthesizer rewrite of `content`, when one is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis: Option<String>,
}

impl AggregationResult {
    /// What to show the user: the synthesis when present, else the merge.
    pub fn final_text(&self) -> &str {
        self.synthesis.as_deref().unwrap_or(&self.content)
    }
}

/// Merges node outputs into one [`AggregationResult`].
///
/// Outputs are sorted by `(node id, content)` and exact duplicates dropped,
/// so the result does not depend on the order parallel branches finished
/// in, and merging partial results with [`combine`](Self::combine) gives the
/// same answer as merging everything at once.
#[derive(Debug, Clone, Default)]
pub struct Aggregator;

impl Aggregator {
    pub fn new() -> Self {
        Self
    }

    pub fn merge(&self, outputs: Vec<NodeOutput>, failures: Vec<NodeFailure>) -> AggregationResult {
        let mut outputs: Vec<NodeOutput> = outputs
            .into_iter()
            .filter(|o| !o.content.trim().is_empty())
            .collect();
        outputs.sort_by(|a, b| {
            a.node_id
                .cmp(&b.node_id)
                .then_with(|| a.content.cmp(&b.content))
                .then_with(|| a.elapsed_ms.cmp(&b.elapsed_ms))
        });
        outputs.dedup_by(|b, a| a.node_id == b.node_id && a.content == b.content);

        let mut failures = failures;
        failures.sort_by(|a, b| {
            a.node_id
                .cmp(&b.node_id)
                .then_with(|| a.kind.to_string().cmp(&b.kind.to_string()))
                .then_with(|| a.message.cmp(&b.message))
        });
        failures.dedup();

        let mut contributors: Vec<NodeId> = outputs.iter().map(|o| o.node_id.clone()).collect();
        contributors.dedup();

        let content = outputs
            .iter()
            .map(|o| format!("## {}\n\n{}", o.label, o.content.trim()))
            .collect::<Vec<_>>()
            .join("\n\n");

        AggregationResult {
            content,
            insufficient: outputs.is_empty(),
            contributors,
            outputs,
            failures,
            synthesis: None,
        }
    }

    /// Merge two partial results.
    pub fn combine(&self, a: AggregationResult, b: AggregationResult) -> AggregationResult {
        let mut outputs = a.outputs;
        outputs.extend(b.outputs);
        let mut failures = a.failures;
        failures.extend(b.failures);
        self.merge(outputs, failures)
    }
}
