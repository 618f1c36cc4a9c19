//! Group validation and deterministic correction.
//!
//! Detection only reports problems; [`apply_corrections`] is the single
//! place where groups change. Corrections that would break the partition of
//! the batch are discarded wholesale.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use ai_client::parse_lenient_json;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use graphmerge_core::{DedupError, DedupResult, LlmErrorKind};

use crate::engine::Group;

static INDEX_REF_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[(\d+)\]").expect("valid regex"));

const MERGE_INTENT: [&str; 14] = [
    "merge",
    "same",
    "identical",
    "coreferent",
    "equivalent",
    "duplicate",
    "alias",
    "合并",
    "一致",
    "等价",
    "相同",
    "同一",
    "重复",
    "别名",
];

const NEGATIONS: [&str; 7] = ["not ", "n't", "different", "distinct", "不同", "不是", "区别"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorrectionAction {
    Merge,
    Split,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionSource {
    Rule,
    Llm,
}

/// A reported problem with one group. Group ids are 0-based positions in
/// the batch's group list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inconsistency {
    pub group_id: usize,
    pub issue: String,
    pub action: CorrectionAction,
    pub target_groups: Vec<usize>,
    pub source: DetectionSource,
}

/// 1-based candidate indices a rationale asks to merge with. Clauses that
/// negate (e.g. "different from [3]") are ignored.
pub fn merge_intent_references(rationale: &str) -> Vec<usize> {
    let mut refs = Vec::new();
    for clause in rationale.split(['.', ';', '。', '；', '!', '！', '?', '？', '\n']) {
        let lowered = clause.to_lowercase();
        if !MERGE_INTENT.iter().any(|k| lowered.contains(k)) {
            continue;
        }
        if NEGATIONS.iter().any(|n| lowered.contains(n)) {
            continue;
        }
        for capture in INDEX_REF_RE.captures_iter(clause) {
            if let Ok(index) = capture[1].parse::<usize>() {
                if index > 0 && !refs.contains(&index) {
                    refs.push(index);
                }
            }
        }
    }
    refs
}

/// Flag groups whose rationale wants to merge with candidates grouped elsewhere.
pub fn detect_rule_based(groups: &[Group]) -> Vec<Inconsistency> {
    let owner = |index: usize| groups.iter().position(|g| g.members.contains(&index));

    groups
        .iter()
        .enumerate()
        .filter_map(|(group_id, group)| {
            let outside: Vec<usize> = merge_intent_references(&group.rationale)
                .into_iter()
                .map(|k| k - 1)
                .filter(|k| !group.members.contains(k))
                .collect();
            let targets: BTreeSet<usize> = outside
                .iter()
                .filter_map(|k| owner(*k))
                .filter(|t| *t != group_id)
                .collect();
            if targets.is_empty() {
                return None;
            }
            let refs: Vec<String> = outside.iter().map(|k| format!("[{}]", k + 1)).collect();
            Some(Inconsistency {
                group_id,
                issue: format!("rationale asks to merge with {} outside the group", refs.join(", ")),
                action: CorrectionAction::Merge,
                target_groups: targets.into_iter().collect(),
                source: DetectionSource::Rule,
            })
        })
        .collect()
}

/// Render groups for the validation prompt (1-based group and candidate ids).
pub fn describe_groups(groups: &[Group]) -> String {
    groups
        .iter()
        .enumerate()
        .map(|(i, g)| {
            let members: Vec<String> = g.members.iter().map(|m| (m + 1).to_string()).collect();
            format!(
                "Group {}: members [{}], representative {}, rationale: {}",
                i + 1,
                members.join(", "),
                g.representative + 1,
                if g.rationale.is_empty() { "(none)" } else { g.rationale.as_str() }
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn index_list(value: Option<&Value>) -> Vec<usize> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_u64).map(|v| v as usize).collect())
        .unwrap_or_default()
}

/// Parse a validation response. Entries with unknown groups or actions are
/// dropped with a warning.
pub fn parse_validation(raw: &str, group_count: usize) -> DedupResult<Vec<Inconsistency>> {
    let value = parse_lenient_json(raw).map_err(|e| DedupError::llm(LlmErrorKind::MalformedJson, e.to_string()))?;
    let Some(flag) = value.get("has_inconsistencies").and_then(Value::as_bool) else {
        return Err(DedupError::llm(
            LlmErrorKind::MalformedJson,
            "missing has_inconsistencies flag",
        ));
    };
    if !flag {
        return Ok(Vec::new());
    }

    let entries = value
        .get("inconsistencies")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    let in_range = |id: usize| id >= 1 && id <= group_count;

    let mut found = Vec::new();
    for entry in entries {
        let Some(group_id) = entry.get("group_id").and_then(Value::as_u64).map(|v| v as usize) else {
            warn!(?entry, "Validation entry without group_id, ignoring");
            continue;
        };
        if !in_range(group_id) {
            warn!(group_id, group_count, "Validation entry references unknown group, ignoring");
            continue;
        }
        let action = match entry.get("action").and_then(Value::as_str) {
            Some("merge") => CorrectionAction::Merge,
            Some("split") => CorrectionAction::Split,
            other => {
                warn!(?other, "Unknown validation action, ignoring");
                continue;
            }
        };
        let target_groups = index_list(entry.get("target_groups"))
            .into_iter()
            .filter(|t| in_range(*t))
            .map(|t| t - 1)
            .collect();
        found.push(Inconsistency {
            group_id: group_id - 1,
            issue: entry.get("issue").and_then(Value::as_str).unwrap_or_default().to_string(),
            action,
            target_groups,
            source: DetectionSource::Llm,
        });
    }
    Ok(found)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Correction {
    pub groups: Vec<Group>,
    pub applied: usize,
    pub integrity_ok: bool,
    pub warning: Option<String>,
}

/// Every index in `0..batch_len` must appear in exactly one group.
pub fn check_integrity(groups: &[Group], batch_len: usize) -> Result<(), String> {
    let mut seen = vec![0usize; batch_len];
    for group in groups {
        for &m in &group.members {
            match seen.get_mut(m) {
                Some(count) => *count += 1,
                None => return Err(format!("index {} out of range", m + 1)),
            }
        }
    }
    let missing: Vec<String> = seen
        .iter()
        .enumerate()
        .filter(|(_, c)| **c == 0)
        .map(|(i, _)| (i + 1).to_string())
        .collect();
    let repeated: Vec<String> = seen
        .iter()
        .enumerate()
        .filter(|(_, c)| **c > 1)
        .map(|(i, _)| (i + 1).to_string())
        .collect();
    if missing.is_empty() && repeated.is_empty() {
        Ok(())
    } else {
        Err(format!(
            "missing indices [{}], repeated indices [{}]",
            missing.join(", "),
            repeated.join(", ")
        ))
    }
}

/// Apply merge actions: each target group is folded into the flagged group,
/// which keeps its representative and rationale. Split is not supported and
/// is only logged.
pub fn apply_corrections(groups: &[Group], batch_len: usize, inconsistencies: &[Inconsistency]) -> Correction {
    let mut parent: Vec<usize> = (0..groups.len()).collect();
    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    let mut applied = 0;
    for inconsistency in inconsistencies {
        if inconsistency.group_id >= groups.len() {
            continue;
        }
        match inconsistency.action {
            CorrectionAction::Split => {
                warn!(
                    group = inconsistency.group_id + 1,
                    issue = inconsistency.issue.as_str(),
                    "Split corrections are not supported, keeping group"
                );
            }
            CorrectionAction::Merge => {
                let keeper = find(&mut parent, inconsistency.group_id);
                for &target in &inconsistency.target_groups {
                    if target >= groups.len() {
                        continue;
                    }
                    let absorbed = find(&mut parent, target);
                    if absorbed != keeper {
                        parent[absorbed] = keeper;
                        applied += 1;
                    }
                }
            }
        }
    }

    if applied == 0 {
        return Correction {
            groups: groups.to_vec(),
            applied: 0,
            integrity_ok: true,
            warning: None,
        };
    }

    let mut order: Vec<usize> = Vec::new();
    let mut merged: Vec<Option<Group>> = vec![None; groups.len()];
    for (i, group) in groups.iter().enumerate() {
        let root = find(&mut parent, i);
        let slot = &mut merged[root];
        match slot {
            Some(existing) => {
                existing.members.extend(group.members.iter().copied());
                existing.validated = true;
            }
            None => {
                order.push(root);
                let mut keeper = groups[root].clone();
                keeper.members = group.members.clone();
                keeper.validated = root != i;
                *slot = Some(keeper);
            }
        }
    }
    let corrected: Vec<Group> = order
        .into_iter()
        .filter_map(|root| merged[root].take())
        .map(|mut g| {
            g.members.sort_unstable();
            g
        })
        .collect();

    match check_integrity(&corrected, batch_len) {
        Ok(()) => {
            debug!(applied, groups = corrected.len(), "Applied group corrections");
            Correction {
                groups: corrected,
                applied,
                integrity_ok: true,
                warning: None,
            }
        }
        Err(problem) => {
            warn!(problem = problem.as_str(), "Corrections broke batch integrity, keeping original groups");
            Correction {
                groups: groups.to_vec(),
                applied: 0,
                integrity_ok: false,
                warning: Some(problem),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(members: &[usize], representative: usize, rationale: &str) -> Group {
        Group {
            members: members.to_vec(),
            representative,
            rationale: rationale.to_string(),
            confidence: 1.0,
            validated: false,
        }
    }

    #[test]
    fn finds_merge_references_and_skips_negations() {
        assert_eq!(merge_intent_references("与[1]合并"), vec![1]);
        assert_eq!(merge_intent_references("Same person as [2]; different from [3]"), vec![2]);
        assert!(merge_intent_references("[4] is a different drug").is_empty());
        assert!(merge_intent_references("Unrelated to [2]").is_empty());
    }

    #[test]
    fn singleton_with_merge_rationale_is_merged() {
        let groups = vec![group(&[0], 0, "distinct value"), group(&[1], 1, "与[1]合并")];
        let found = detect_rule_based(&groups);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].group_id, 1);
        assert_eq!(found[0].target_groups, vec![0]);

        let corrected = apply_corrections(&groups, 2, &found);
        assert!(corrected.integrity_ok);
        assert_eq!(corrected.applied, 1);
        assert_eq!(corrected.groups.len(), 1);
        assert_eq!(corrected.groups[0].members, vec![0, 1]);
        assert_eq!(corrected.groups[0].representative, 1);
        assert_eq!(corrected.groups[0].rationale, "与[1]合并");
        assert!(corrected.groups[0].validated);
    }

    #[test]
    fn consistent_groups_are_untouched() {
        let groups = vec![group(&[0, 1], 0, "same referent as [2]"), group(&[2], 2, "")];
        assert!(detect_rule_based(&groups).is_empty());
        let corrected = apply_corrections(&groups, 3, &[]);
        assert_eq!(corrected.groups, groups);
    }

    #[test]
    fn broken_partition_discards_corrections() {
        // Index 2 is never covered, so any correction fails integrity.
        let groups = vec![group(&[0], 0, ""), group(&[1], 1, "merge with [1]")];
        let found = detect_rule_based(&groups);
        let corrected = apply_corrections(&groups, 3, &found);
        assert!(!corrected.integrity_ok);
        assert_eq!(corrected.groups, groups);
        assert!(corrected.warning.unwrap().contains("missing indices [3]"));
    }

    #[test]
    fn split_is_logged_only() {
        let groups = vec![group(&[0, 1], 0, "")];
        let split = Inconsistency {
            group_id: 0,
            issue: "two different drugs".into(),
            action: CorrectionAction::Split,
            target_groups: vec![],
            source: DetectionSource::Llm,
        };
        let corrected = apply_corrections(&groups, 2, &[split]);
        assert_eq!(corrected.groups, groups);
        assert_eq!(corrected.applied, 0);
    }

    #[test]
    fn parses_validation_response() {
        let raw = r#"```json
        {"has_inconsistencies": true, "inconsistencies": [
            {"group_id": 2, "issue": "says merge with [1]", "action": "merge", "target_groups": [1, 9]},
            {"group_id": 7, "issue": "bogus", "action": "merge", "target_groups": [1]},
            {"group_id": 1, "issue": "?", "action": "rename", "target_groups": []}
        ]}
        ```"#;
        let found = parse_validation(raw, 2).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].group_id, 1);
        assert_eq!(found[0].target_groups, vec![0]);

        assert!(parse_validation(r#"{"has_inconsistencies": false}"#, 2).unwrap().is_empty());
        assert!(parse_validation("no json here", 2).is_err());
    }
}
