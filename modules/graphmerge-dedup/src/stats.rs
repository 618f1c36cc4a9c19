use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use graphmerge_graph::{EventStats, RewriteStats};

/// Counters for one dedup stage. Embedded in that stage's artifact.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSummary {
    pub scopes: usize,
    pub candidates: usize,
    pub clusters: usize,
    pub batches: usize,
    pub llm_calls: usize,
    pub llm_failures: usize,
    pub retries: usize,
    pub fallbacks: usize,
    pub clustering_fallbacks: usize,
    pub validation_corrections: usize,
    pub truncated_candidates: usize,
    pub signal_failures: usize,
    pub merges: usize,
    pub integrity_warnings: Vec<String>,
    pub rewrite: RewriteStats,
    pub cancelled: bool,
}

impl StageSummary {
    pub fn absorb(&mut self, other: &StageSummary) {
        self.scopes += other.scopes;
        self.candidates += other.candidates;
        self.clusters += other.clusters;
        self.batches += other.batches;
        self.llm_calls += other.llm_calls;
        self.llm_failures += other.llm_failures;
        self.retries += other.retries;
        self.fallbacks += other.fallbacks;
        self.clustering_fallbacks += other.clustering_fallbacks;
        self.validation_corrections += other.validation_corrections;
        self.truncated_candidates += other.truncated_candidates;
        self.signal_failures += other.signal_failures;
        self.merges += other.merges;
        self.integrity_warnings.extend(other.integrity_warnings.iter().cloned());
        self.rewrite.absorb(&other.rewrite);
        self.cancelled |= other.cancelled;
    }
}

/// Stats from a dedup run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupSummary {
    pub run_id: String,
    pub initial_nodes: usize,
    pub initial_edges: usize,
    pub final_nodes: usize,
    pub final_edges: usize,
    pub stages: BTreeMap<String, StageSummary>,
    pub events: Option<EventStats>,
    pub cancelled: bool,
}

impl DedupSummary {
    pub fn totals(&self) -> StageSummary {
        let mut total = StageSummary::default();
        for stage in self.stages.values() {
            total.absorb(stage);
        }
        total
    }
}

impl std::fmt::Display for DedupSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total = self.totals();
        writeln!(f, "\n=== Dedup Run Complete ===")?;
        writeln!(f, "Run:                {}", self.run_id)?;
        writeln!(f, "Nodes:              {} -> {}", self.initial_nodes, self.final_nodes)?;
        writeln!(f, "Edges:              {} -> {}", self.initial_edges, self.final_edges)?;
        writeln!(f, "LLM calls:          {}", total.llm_calls)?;
        writeln!(f, "LLM failures:       {}", total.llm_failures)?;
        writeln!(f, "Retries:            {}", total.retries)?;
        writeln!(f, "Fallback splits:    {}", total.fallbacks)?;
        writeln!(f, "Corrections:        {}", total.validation_corrections)?;
        writeln!(f, "Truncated:          {}", total.truncated_candidates)?;
        writeln!(f, "\nMerges by stage:")?;
        for (stage, summary) in &self.stages {
            writeln!(
                f,
                "  {:<8} {} merges over {} scopes ({} clusters, {} batches)",
                format!("{stage}:"),
                summary.merges,
                summary.scopes,
                summary.clusters,
                summary.batches
            )?;
        }
        writeln!(f, "\nRewrite:")?;
        writeln!(f, "  {}", total.rewrite)?;
        if let Some(events) = &self.events {
            writeln!(f, "\nEvents:")?;
            writeln!(f, "  Triggers seen: {}", events.triggers_seen)?;
            writeln!(f, "  Events:        {}", events.events)?;
            writeln!(f, "  Nodes created: {}", events.nodes_created)?;
            writeln!(f, "  Propagated:    {}", events.propagated)?;
        }
        if total.signal_failures > 0 {
            writeln!(f, "\nSignal failures:    {}", total.signal_failures)?;
        }
        if !total.integrity_warnings.is_empty() {
            writeln!(f, "\nIntegrity warnings:")?;
            for warning in &total.integrity_warnings {
                writeln!(f, "  - {warning}")?;
            }
        }
        if self.cancelled {
            writeln!(f, "\nRun was cancelled before completion.")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_stages_and_warnings() {
        let mut summary = DedupSummary {
            run_id: "run-1".into(),
            initial_nodes: 5,
            final_nodes: 5,
            ..Default::default()
        };
        summary.stages.insert(
            "edge".into(),
            StageSummary {
                merges: 2,
                scopes: 1,
                llm_calls: 3,
                integrity_warnings: vec!["batch edge:00000:0000:000 dropped index 2".into()],
                ..Default::default()
            },
        );
        let text = summary.to_string();
        assert!(text.contains("=== Dedup Run Complete ==="));
        assert!(text.contains("edge:    2 merges over 1 scopes"));
        assert!(text.contains("LLM calls:          3"));
        assert!(text.contains("dropped index 2"));
    }
}
