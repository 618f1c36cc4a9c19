//! LLM coreference pass over clustered scopes.
//!
//! Work is organised in waves so that every request of a stage goes through
//! one bounded pool: all first attempts, then strict-preamble retries for the
//! failures, then (optionally) validation. Responses are consumed in request
//! id order, so the outcome never depends on completion order.

use std::collections::{BTreeMap, HashMap};

use ai_client::{parse_lenient_json, truncate_to_char_boundary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use graphmerge_core::{DedupError, DedupResult, LlmErrorKind, PromptKind, PromptRegistry, SemanticDedupConfig};
use graphmerge_graph::{MergeDecision, MergeMethod};

use crate::candidates::{DedupScope, Stage};
use crate::clusterer::Clustering;
use crate::llm::{prompt_hash, request_id, LlmDispatcher, LlmRequest, LlmResponse};
use crate::stats::StageSummary;
use crate::store::{
    CallError, CallPurpose, ErrorRecord, IntermediateStore, LlmCallRecord, ScopeRecord,
    ValidationRecord,
};
use crate::validator::{apply_corrections, describe_groups, detect_rule_based, parse_validation, Inconsistency};

fn full_confidence() -> f32 {
    1.0
}

/// A set of candidates the model considers one referent. Indices are
/// 0-based, relative to whatever list the group was parsed against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub members: Vec<usize>,
    pub representative: usize,
    #[serde(default)]
    pub rationale: String,
    #[serde(default = "full_confidence")]
    pub confidence: f32,
    /// Changed by a validation correction.
    #[serde(default)]
    pub validated: bool,
}

impl Group {
    pub fn singleton(index: usize) -> Self {
        Self {
            members: vec![index],
            representative: index,
            rationale: String::new(),
            confidence: 1.0,
            validated: false,
        }
    }

    fn remap(&self, positions: &[usize]) -> Self {
        Self {
            members: self.members.iter().map(|m| positions[*m]).collect(),
            representative: positions[self.representative],
            ..self.clone()
        }
    }
}

fn schema(detail: impl Into<String>) -> DedupError {
    DedupError::llm(LlmErrorKind::SchemaViolation, detail)
}

fn as_index(value: &Value) -> Option<usize> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .map(|v| v as usize)
}

/// Parse and validate a `{"groups": [...]}` response for a batch of
/// `batch_len` candidates. Indices in the response are 1-based.
///
/// Out-of-range or repeated indices, empty groups and representatives
/// outside their group are schema violations. Candidates the response
/// forgot are added back as singletons.
pub fn parse_groups(raw: &str, batch_len: usize) -> DedupResult<Vec<Group>> {
    let value = parse_lenient_json(raw).map_err(|e| DedupError::llm(LlmErrorKind::MalformedJson, e.to_string()))?;
    let Some(entries) = value.get("groups").and_then(Value::as_array) else {
        return Err(DedupError::llm(LlmErrorKind::MalformedJson, "missing groups array"));
    };

    let mut seen = vec![false; batch_len];
    let mut groups = Vec::with_capacity(entries.len());
    for (position, entry) in entries.iter().enumerate() {
        let raw_members = entry
            .get("members")
            .and_then(Value::as_array)
            .ok_or_else(|| schema(format!("group {} has no members list", position + 1)))?;
        let mut members = Vec::with_capacity(raw_members.len());
        for item in raw_members {
            let index = as_index(item).ok_or_else(|| schema(format!("non-integer member {item}")))?;
            if index == 0 || index > batch_len {
                return Err(schema(format!("member {index} outside 1..={batch_len}")));
            }
            if std::mem::replace(&mut seen[index - 1], true) {
                return Err(schema(format!("member {index} appears in more than one group")));
            }
            members.push(index - 1);
        }
        if members.is_empty() {
            return Err(schema(format!("group {} is empty", position + 1)));
        }

        let representative = match entry.get("representative").filter(|v| !v.is_null()) {
            Some(value) => {
                let index = as_index(value).ok_or_else(|| schema(format!("non-integer representative {value}")))?;
                if index == 0 || !members.contains(&(index - 1)) {
                    return Err(schema(format!("representative {index} is not a member of its group")));
                }
                index - 1
            }
            None => members[0],
        };

        groups.push(Group {
            members,
            representative,
            rationale: entry
                .get("rationale")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            confidence: entry
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c.clamp(0.0, 1.0) as f32)
                .unwrap_or(1.0),
            validated: false,
        });
    }

    let missing: Vec<usize> = (0..batch_len).filter(|i| !seen[*i]).collect();
    if !missing.is_empty() {
        warn!(missing = ?missing.iter().map(|m| m + 1).collect::<Vec<_>>(), "Response omitted candidates, keeping them separate");
        groups.extend(missing.into_iter().map(Group::singleton));
    }
    Ok(groups)
}

/// Split a cluster into batches of at most `max` candidates. With a pivot,
/// the cluster's first candidate leads every batch so decisions across
/// batches can be reconciled through it.
pub fn plan_batches(members: &[usize], max: usize, pivot: bool) -> Vec<Vec<usize>> {
    let max = max.max(1);
    if members.len() <= max {
        return vec![members.to_vec()];
    }
    if pivot && max >= 2 {
        let (head, rest) = members.split_at(1);
        rest.chunks(max - 1)
            .map(|chunk| head.iter().chain(chunk).copied().collect())
            .collect()
    } else {
        members.chunks(max).map(<[usize]>::to_vec).collect()
    }
}

/// Merge batch groups of one cluster: groups that elect the same
/// representative are unioned. Remaining overlaps (a pivot grouped under
/// different representatives) are left for union-find closure.
pub fn reconcile(batches: Vec<Vec<Group>>) -> Vec<Group> {
    let mut by_representative: BTreeMap<usize, Group> = BTreeMap::new();
    for group in batches.into_iter().flatten() {
        match by_representative.get_mut(&group.representative) {
            Some(existing) => {
                for m in group.members {
                    if !existing.members.contains(&m) {
                        existing.members.push(m);
                    }
                }
                existing.validated |= group.validated;
                existing.confidence = existing.confidence.min(group.confidence);
            }
            None => {
                by_representative.insert(group.representative, group);
            }
        }
    }
    let mut groups: Vec<Group> = by_representative
        .into_values()
        .map(|mut g| {
            g.members.sort_unstable();
            g
        })
        .collect();
    groups.sort_by_key(|g| g.members.first().copied().unwrap_or(usize::MAX));
    groups
}

struct Batch {
    id: String,
    scope: usize,
    cluster: usize,
    indices: Vec<usize>,
    user_prompt: String,
    groups: Option<Vec<Group>>,
    last_error: Option<DedupError>,
    calls: Vec<LlmCallRecord>,
    validation: Option<ValidationRecord>,
}

/// Everything the engine concluded for one scope.
#[derive(Debug, Clone)]
pub struct ScopeOutcome {
    pub record: ScopeRecord,
    /// Unclosed `member -> representative` decisions.
    pub decisions: Vec<MergeDecision>,
    pub errors: Vec<ErrorRecord>,
}

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub max_batch_size: usize,
    pub batch_pivot: bool,
    pub enable_validation: bool,
}

impl EngineSettings {
    pub fn from_config(config: &SemanticDedupConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            batch_pivot: config.batch_pivot,
            enable_validation: config.enable_clustering_validation,
        }
    }
}

pub struct DedupEngine<'a> {
    registry: &'a PromptRegistry,
    dispatcher: &'a LlmDispatcher,
    settings: EngineSettings,
}

impl<'a> DedupEngine<'a> {
    pub fn new(registry: &'a PromptRegistry, dispatcher: &'a LlmDispatcher, settings: EngineSettings) -> Self {
        Self {
            registry,
            dispatcher,
            settings,
        }
    }

    pub async fn run(
        &self,
        stage: Stage,
        scopes: &[DedupScope],
        clusterings: Vec<Clustering>,
        store: &mut IntermediateStore,
        summary: &mut StageSummary,
    ) -> Vec<ScopeOutcome> {
        let mut outcomes: Vec<ScopeOutcome> = scopes
            .iter()
            .zip(clusterings)
            .map(|(scope, clustering)| ScopeOutcome {
                record: ScopeRecord {
                    scope: scope.clone(),
                    clusters: clustering.clusters,
                    llm_calls: clustering.llm_calls,
                    llm_groups: Vec::new(),
                    validations: Vec::new(),
                    final_merges: Vec::new(),
                },
                decisions: Vec::new(),
                errors: clustering.errors,
            })
            .collect();

        let mut batches = self.plan(stage, scopes, &mut outcomes, summary);
        summary.batches += batches.len();

        // Wave 1, then one strict retry for every batch that failed.
        let first: Vec<usize> = (0..batches.len()).collect();
        self.attempt(&mut batches, &first, scopes, 1, store, summary).await;
        let retry: Vec<usize> = (0..batches.len())
            .filter(|i| batches[*i].groups.is_none())
            .filter(|i| !matches!(batches[*i].last_error, Some(DedupError::Cancelled)))
            .collect();
        if !retry.is_empty() {
            summary.retries += retry.len();
            info!(stage = %stage, count = retry.len(), "Retrying failed batches with strict preamble");
            self.attempt(&mut batches, &retry, scopes, 2, store, summary).await;
        }

        for batch in batches.iter_mut().filter(|b| b.groups.is_none()) {
            let error = batch
                .last_error
                .take()
                .unwrap_or_else(|| DedupError::llm(LlmErrorKind::Network, "no response"));
            if matches!(error, DedupError::Cancelled) {
                summary.cancelled = true;
            } else {
                summary.fallbacks += 1;
            }
            warn!(request = %batch.id, error = %error, "Batch failed twice, keeping every candidate separate");
            let call = CallError::from_error(&error);
            outcomes[batch.scope]
                .errors
                .push(ErrorRecord::new(Some(batch.id.clone()), call.kind.to_string(), call.detail));
            batch.groups = Some((0..batch.indices.len()).map(Group::singleton).collect());
        }

        self.validate(&mut batches, scopes, store, summary).await;
        self.assemble(stage, scopes, batches, &mut outcomes);
        outcomes
    }

    /// Build batches for every multi-candidate cluster. Size-1 batches never
    /// reach the model.
    fn plan(
        &self,
        stage: Stage,
        scopes: &[DedupScope],
        outcomes: &mut [ScopeOutcome],
        summary: &mut StageSummary,
    ) -> Vec<Batch> {
        let mut batches = Vec::new();
        for (position, scope) in scopes.iter().enumerate() {
            summary.scopes += 1;
            summary.candidates += scope.candidates.len();
            summary.truncated_candidates += scope.truncated;
            summary.clusters += outcomes[position].record.clusters.len();

            for (cluster_id, cluster) in outcomes[position].record.clusters.iter().enumerate() {
                if cluster.members.len() < 2 {
                    continue;
                }
                let planned = plan_batches(&cluster.members, self.settings.max_batch_size, self.settings.batch_pivot);
                for (batch_index, indices) in planned.into_iter().enumerate() {
                    let id = request_id(stage.as_str(), scope.index, cluster_id, batch_index);
                    let mut batch = Batch {
                        id,
                        scope: position,
                        cluster: cluster_id,
                        user_prompt: String::new(),
                        groups: None,
                        last_error: None,
                        calls: Vec::new(),
                        validation: None,
                        indices,
                    };
                    if batch.indices.len() < 2 {
                        batch.groups = Some(vec![Group::singleton(0)]);
                    } else {
                        match self.render_dedup_prompt(scope, &batch.indices) {
                            Ok(prompt) => batch.user_prompt = prompt,
                            Err(e) => {
                                warn!(scope = %scope, error = %e, "Failed to render dedup prompt");
                                batch.groups = Some((0..batch.indices.len()).map(Group::singleton).collect());
                                outcomes[position].errors.push(ErrorRecord::new(
                                    Some(batch.id.clone()),
                                    "template",
                                    e.to_string(),
                                ));
                            }
                        }
                    }
                    batches.push(batch);
                }
            }
        }
        batches
    }

    fn render_dedup_prompt(&self, scope: &DedupScope, indices: &[usize]) -> DedupResult<String> {
        let lines = scope.candidate_lines(indices);
        let vars = HashMap::from([
            ("head", scope.head.as_str()),
            ("relation", scope.relation.as_str()),
            ("candidates", lines.as_str()),
            ("head_context", scope.head_context.as_str()),
        ]);
        self.registry.render(scope.prompt_kind(), &vars)
    }

    async fn attempt(
        &self,
        batches: &mut [Batch],
        selected: &[usize],
        scopes: &[DedupScope],
        attempt: u8,
        store: &mut IntermediateStore,
        summary: &mut StageSummary,
    ) {
        let system = if attempt == 1 {
            self.registry.template(PromptKind::System)
        } else {
            self.registry.template(PromptKind::StrictSystem)
        }
        .to_string();

        let by_id: HashMap<String, usize> = selected
            .iter()
            .filter(|i| batches[**i].groups.is_none())
            .map(|i| (batches[*i].id.clone(), *i))
            .collect();
        let requests: Vec<LlmRequest> = by_id
            .iter()
            .map(|(id, i)| LlmRequest::new(id.clone(), system.clone(), batches[*i].user_prompt.clone()))
            .collect();
        summary.llm_calls += requests.len();

        for LlmResponse { id, outcome } in self.dispatcher.dispatch(requests).await {
            let Some(&position) = by_id.get(&id) else {
                continue;
            };
            let batch = &mut batches[position];
            let scope = &scopes[batch.scope];
            let mut call = LlmCallRecord {
                request_id: id.clone(),
                purpose: CallPurpose::Dedup,
                cluster_id: batch.cluster,
                batch_indices: batch.indices.clone(),
                candidates: batch.indices.iter().map(|i| scope.candidates[*i].id.clone()).collect(),
                system_prompt: system.clone(),
                user_prompt: batch.user_prompt.clone(),
                raw_response: None,
                parsed_groups: Vec::new(),
                error: None,
                attempt,
            };

            let parsed = outcome.and_then(|raw| {
                store.record_response(prompt_hash(&system, &batch.user_prompt), &id, &raw);
                let parsed = parse_groups(&raw, batch.indices.len());
                call.raw_response = Some(raw);
                parsed
            });
            match parsed {
                Ok(groups) => {
                    call.parsed_groups = groups.clone();
                    batch.groups = Some(groups);
                    batch.last_error = None;
                }
                Err(e) => {
                    if !matches!(e, DedupError::Cancelled) {
                        summary.llm_failures += 1;
                        let excerpt = truncate_to_char_boundary(call.raw_response.as_deref().unwrap_or_default(), 200);
                        warn!(request = %id, attempt, error = %e, response = excerpt, "Dedup batch failed");
                    }
                    call.error = Some(CallError::from_error(&e));
                    batch.last_error = Some(e);
                }
            }
            batch.calls.push(call);
        }
    }

    /// Rule-based detection always runs; model detection only when enabled
    /// and the batch has more than one group.
    async fn validate(
        &self,
        batches: &mut [Batch],
        scopes: &[DedupScope],
        store: &mut IntermediateStore,
        summary: &mut StageSummary,
    ) {
        let mut detected: Vec<Vec<Inconsistency>> = batches
            .iter()
            .map(|b| b.groups.as_deref().map(detect_rule_based).unwrap_or_default())
            .collect();
        let mut validation_ids: Vec<Option<String>> = vec![None; batches.len()];

        if self.settings.enable_validation {
            let system = self.registry.template(PromptKind::System).to_string();
            let mut by_id: HashMap<String, usize> = HashMap::new();
            let mut requests = Vec::new();
            for (i, batch) in batches.iter().enumerate() {
                let Some(groups) = batch.groups.as_ref().filter(|g| g.len() >= 2) else {
                    continue;
                };
                if batch.calls.iter().all(|c| c.raw_response.is_none()) {
                    continue;
                }
                let lines = scopes[batch.scope].candidate_lines(&batch.indices);
                let described = describe_groups(groups);
                let vars = HashMap::from([("groups", described.as_str()), ("candidates", lines.as_str())]);
                match self.registry.render(PromptKind::Validation, &vars) {
                    Ok(user) => {
                        let id = format!("{}:validate", batch.id);
                        by_id.insert(id.clone(), i);
                        requests.push(LlmRequest::new(id, system.clone(), user));
                    }
                    Err(e) => warn!(request = %batch.id, error = %e, "Failed to render validation prompt"),
                }
            }
            let prompts: HashMap<String, String> = requests.iter().map(|r| (r.id.clone(), r.user.clone())).collect();
            summary.llm_calls += requests.len();

            for LlmResponse { id, outcome } in self.dispatcher.dispatch(requests).await {
                let Some(&i) = by_id.get(&id) else {
                    continue;
                };
                let user_prompt = prompts.get(&id).cloned().unwrap_or_default();
                let group_count = batches[i].groups.as_ref().map_or(0, Vec::len);
                let mut call = LlmCallRecord {
                    request_id: id.clone(),
                    purpose: CallPurpose::Validation,
                    cluster_id: batches[i].cluster,
                    batch_indices: batches[i].indices.clone(),
                    candidates: batches[i]
                        .indices
                        .iter()
                        .map(|c| scopes[batches[i].scope].candidates[*c].id.clone())
                        .collect(),
                    system_prompt: system.clone(),
                    user_prompt,
                    raw_response: None,
                    parsed_groups: Vec::new(),
                    error: None,
                    attempt: 1,
                };
                let parsed = outcome.and_then(|raw| {
                    store.record_response(prompt_hash(&system, &call.user_prompt), &id, &raw);
                    let parsed = parse_validation(&raw, group_count);
                    call.raw_response = Some(raw);
                    parsed
                });
                match parsed {
                    Ok(found) => {
                        for inconsistency in found {
                            let duplicate = detected[i].iter().any(|d| {
                                d.group_id == inconsistency.group_id
                                    && d.action == inconsistency.action
                                    && d.target_groups == inconsistency.target_groups
                            });
                            if !duplicate {
                                detected[i].push(inconsistency);
                            }
                        }
                    }
                    Err(e) => {
                        if !matches!(e, DedupError::Cancelled) {
                            summary.llm_failures += 1;
                            warn!(request = %id, error = %e, "Validation call failed, keeping rule-based findings only");
                        }
                        call.error = Some(CallError::from_error(&e));
                    }
                }
                validation_ids[i] = Some(id);
                batches[i].calls.push(call);
            }
        }

        for (i, found) in detected.into_iter().enumerate() {
            if found.is_empty() {
                continue;
            }
            let batch = &mut batches[i];
            let Some(groups) = batch.groups.as_ref() else {
                continue;
            };
            let correction = apply_corrections(groups, batch.indices.len(), &found);
            summary.validation_corrections += correction.applied;
            if let Some(warning) = &correction.warning {
                summary
                    .integrity_warnings
                    .push(format!("{}: corrections discarded ({warning})", batch.id));
            }
            batch.validation = Some(ValidationRecord {
                request_id: validation_ids[i].take().unwrap_or_else(|| batch.id.clone()),
                inconsistencies: found,
                corrections_applied: correction.applied,
                integrity_ok: correction.integrity_ok,
            });
            batch.groups = Some(correction.groups);
        }
    }

    fn assemble(&self, stage: Stage, scopes: &[DedupScope], batches: Vec<Batch>, outcomes: &mut [ScopeOutcome]) {
        let mut per_cluster: BTreeMap<(usize, usize), Vec<Vec<Group>>> = BTreeMap::new();
        for batch in batches {
            let outcome = &mut outcomes[batch.scope];
            outcome.record.llm_calls.extend(batch.calls);
            if let Some(validation) = batch.validation {
                outcome.record.validations.push(validation);
            }
            if let Some(groups) = batch.groups {
                let global = groups.iter().map(|g| g.remap(&batch.indices)).collect();
                per_cluster.entry((batch.scope, batch.cluster)).or_default().push(global);
            }
        }

        for (position, scope) in scopes.iter().enumerate() {
            let outcome = &mut outcomes[position];
            let mut groups = Vec::new();
            for (cluster_id, cluster) in outcome.record.clusters.iter().enumerate() {
                match per_cluster.remove(&(position, cluster_id)) {
                    Some(batches) => groups.extend(reconcile(batches)),
                    None => groups.extend(cluster.members.iter().map(|m| Group::singleton(*m))),
                }
            }
            groups.sort_by_key(|g| g.members.first().copied().unwrap_or(usize::MAX));

            for group in groups.iter().filter(|g| g.members.len() >= 2) {
                let canonical = &scope.candidates[group.representative];
                let method = if group.validated {
                    MergeMethod::Validated
                } else {
                    MergeMethod::Llm
                };
                for member in group.members.iter().filter(|m| **m != group.representative) {
                    outcome.decisions.push(
                        MergeDecision::new(
                            scope.candidates[*member].id.clone(),
                            canonical.id.clone(),
                            method,
                            group.confidence,
                        )
                        .with_rationale(group.rationale.clone()),
                    );
                }
            }
            debug!(
                stage = %stage,
                scope = %scope,
                groups = groups.len(),
                decisions = outcome.decisions.len(),
                "Scope deduplicated"
            );
            outcome.record.llm_groups = groups;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_groups_and_fills_missing_indices() {
        let raw = r#"Here you go:
        ```json
        {"groups": [{"members": [1, 2, 3], "representative": 2, "rationale": "same director"}]}
        ```"#;
        let groups = parse_groups(raw, 4).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].members, vec![0, 1, 2]);
        assert_eq!(groups[0].representative, 1);
        assert_eq!(groups[1], Group::singleton(3));
    }

    #[test]
    fn schema_violations_are_rejected() {
        let cases = [
            r#"{"groups": [{"members": [1, 5], "representative": 1}]}"#,
            r#"{"groups": [{"members": [1], "representative": 1}, {"members": [1, 2], "representative": 2}]}"#,
            r#"{"groups": [{"members": [1, 2], "representative": 3}]}"#,
            r#"{"groups": [{"members": [], "representative": 1}]}"#,
        ];
        for raw in cases {
            let err = parse_groups(raw, 3).unwrap_err();
            assert!(
                matches!(err, DedupError::Llm { kind: LlmErrorKind::SchemaViolation, .. }),
                "{raw} -> {err}"
            );
        }
    }

    #[test]
    fn missing_groups_key_is_malformed() {
        let err = parse_groups(r#"{"clusters": []}"#, 2).unwrap_err();
        assert!(matches!(err, DedupError::Llm { kind: LlmErrorKind::MalformedJson, .. }));
        let err = parse_groups("I think they are all the same.", 2).unwrap_err();
        assert!(matches!(err, DedupError::Llm { kind: LlmErrorKind::MalformedJson, .. }));
    }

    #[test]
    fn representative_defaults_to_first_member() {
        let groups = parse_groups(r#"{"groups": [{"members": ["2", 1]}]}"#, 2).unwrap();
        assert_eq!(groups[0].representative, 1);
        assert_eq!(groups[0].confidence, 1.0);
    }

    #[test]
    fn pivot_batches_share_the_first_candidate() {
        let members: Vec<usize> = (0..10).collect();
        let batches = plan_batches(&members, 4, true);
        assert_eq!(batches, vec![vec![0, 1, 2, 3], vec![0, 4, 5, 6], vec![0, 7, 8, 9]]);

        let plain = plan_batches(&members, 4, false);
        assert_eq!(plain, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);
        assert_eq!(plan_batches(&members[..3], 8, true), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn reconcile_unions_groups_with_shared_representative() {
        let batch_a = vec![
            Group {
                members: vec![0, 1],
                representative: 0,
                rationale: "a".into(),
                confidence: 0.9,
                validated: false,
            },
            Group::singleton(2),
        ];
        let batch_b = vec![
            Group {
                members: vec![0, 4],
                representative: 0,
                rationale: "b".into(),
                confidence: 0.8,
                validated: false,
            },
            Group::singleton(5),
        ];
        let groups = reconcile(vec![batch_a, batch_b]);
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].members, vec![0, 1, 4]);
        assert_eq!(groups[0].rationale, "a");
        assert!((groups[0].confidence - 0.8).abs() < 1e-6);
    }
}
