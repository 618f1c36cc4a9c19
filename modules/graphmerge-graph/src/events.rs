//! Lifts `(entity, solution-like relation, phrase)` triples into event
//! structures: the phrase is parsed as `<action><state modifier?><object>`
//! and linked to reusable action, object and state nodes.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use graphmerge_core::{normalize_name, EventsConfig};

use crate::model::{EdgeAttrs, EdgeKey, KnowledgeGraph, NodeId, NodeLabel};

const CREATOR: &str = "event_discovery";
const HAS_ACTION: &str = "has_action";
const ACTS_ON: &str = "acts_on";
const ACHIEVES_STATE: &str = "achieves_state";
const STATE_OF_EVENT: &str = "state_of_event";
const VIA_STATE_PREFIX: &str = "event_via_state:";

/// Labels tried, in order, when reusing an existing node by name.
const REUSE_PRIORITY: [NodeLabel; 3] = [NodeLabel::Entity, NodeLabel::Keyword, NodeLabel::Attribute];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionVerb {
    /// Surface form matched at the start of a phrase.
    pub prefix: String,
    /// Canonical action name.
    pub action: String,
    /// Word appended to the object to name the resulting state.
    pub state: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModifierRule {
    pub modifier: String,
    /// Canonical action implied by the modifier ("low X" is fixed by raising X).
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lexicon {
    pub actions: Vec<ActionVerb>,
    pub modifiers: Vec<ModifierRule>,
}

fn verb(prefix: &str, action: &str, state: &str) -> ActionVerb {
    ActionVerb {
        prefix: prefix.to_string(),
        action: action.to_string(),
        state: state.to_string(),
    }
}

fn rule(modifier: &str, action: &str) -> ModifierRule {
    ModifierRule {
        modifier: modifier.to_string(),
        action: action.to_string(),
    }
}

impl Default for Lexicon {
    fn default() -> Self {
        Self {
            actions: vec![
                verb("increase", "increase", "increased"),
                verb("raise", "increase", "increased"),
                verb("elevate", "increase", "increased"),
                verb("boost", "increase", "increased"),
                verb("reduce", "reduce", "reduced"),
                verb("decrease", "reduce", "reduced"),
                verb("lower", "reduce", "reduced"),
                verb("improve", "improve", "improved"),
                verb("correct", "correct", "corrected"),
                verb("restore", "restore", "restored"),
                verb("maintain", "maintain", "maintained"),
                verb("prevent", "prevent", "prevented"),
                verb("提高", "提高", "升高"),
                verb("增加", "提高", "升高"),
                verb("升高", "提高", "升高"),
                verb("增强", "提高", "升高"),
                verb("降低", "降低", "降低"),
                verb("减少", "降低", "降低"),
                verb("减轻", "降低", "降低"),
                verb("改善", "改善", "改善"),
                verb("纠正", "纠正", "纠正"),
                verb("恢复", "恢复", "恢复"),
                verb("维持", "维持", "稳定"),
                verb("预防", "预防", "预防"),
            ],
            modifiers: vec![
                rule("low", "increase"),
                rule("insufficient", "increase"),
                rule("poor", "improve"),
                rule("high", "reduce"),
                rule("excessive", "reduce"),
                rule("过低", "提高"),
                rule("不足", "提高"),
                rule("低", "提高"),
                rule("过高", "降低"),
                rule("过多", "降低"),
                rule("高", "降低"),
            ],
        }
    }
}

/// A parsed `<action><modifier?><object>` phrase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPhrase {
    pub action: String,
    pub modifier: Option<String>,
    pub object: String,
    pub state: String,
}

impl Lexicon {
    pub fn parse(&self, phrase: &str) -> Option<ParsedPhrase> {
        let phrase = phrase.trim();
        let (verb, rest) = longest_prefix(phrase, self.actions.iter().map(|v| (v.prefix.as_str(), v)))?;
        let rest = trim_separators(rest);

        let (modifier, object) =
            match longest_prefix(rest, self.modifiers.iter().map(|m| (m.modifier.as_str(), m))) {
                Some((rule, object)) if !trim_separators(object).is_empty() => (Some(rule), trim_separators(object)),
                _ => (None, rest),
            };
        if object.is_empty() {
            return None;
        }

        let action = match modifier {
            Some(rule) => rule.action.clone(),
            None => verb.action.clone(),
        };
        let state_word = self
            .actions
            .iter()
            .find(|v| v.action == action && v.prefix == action)
            .map_or(verb.state.as_str(), |v| v.state.as_str());

        let state = if object.is_ascii() {
            format!("{object} {state_word}")
        } else {
            format!("{object}{state_word}")
        };

        Some(ParsedPhrase {
            action,
            modifier: modifier.map(|m| m.modifier.clone()),
            object: object.to_string(),
            state,
        })
    }
}

/// Longest entry that prefixes `text`. ASCII entries match case-insensitively
/// and must end on a word boundary.
fn longest_prefix<'t, 'e, T>(text: &'t str, entries: impl Iterator<Item = (&'e str, T)>) -> Option<(T, &'t str)> {
    let mut best: Option<(usize, T)> = None;
    for (prefix, value) in entries {
        let len = prefix.len();
        if len == 0 || text.len() < len || !text.is_char_boundary(len) {
            continue;
        }
        let head = &text[..len];
        let matches = if prefix.is_ascii() {
            head.eq_ignore_ascii_case(prefix)
                && text[len..].chars().next().map_or(true, |c| !c.is_alphanumeric())
        } else {
            head == prefix
        };
        if matches && best.as_ref().map_or(true, |(l, _)| len > *l) {
            best = Some((len, value));
        }
    }
    best.map(|(len, value)| (value, &text[len..]))
}

fn trim_separators(s: &str) -> &str {
    s.trim_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '_' | ',' | '，' | '、' | ':' | '：'))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPattern {
    pub source_node: NodeId,
    pub trigger_relation: String,
    pub action_node: NodeId,
    pub object_node: NodeId,
    pub state_node: NodeId,
    pub event_node: NodeId,
    pub propagated_targets: Vec<NodeId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub triggers_seen: usize,
    pub unparsed: usize,
    pub events: usize,
    pub nodes_created: usize,
    pub nodes_reused: usize,
    pub edges_added: usize,
    pub propagated: usize,
}

pub struct EventDiscovery {
    lexicon: Lexicon,
    trigger_relations: BTreeSet<String>,
    event_relation: String,
}

impl EventDiscovery {
    pub fn new(lexicon: Lexicon, trigger_relations: impl IntoIterator<Item = String>, event_relation: impl Into<String>) -> Self {
        Self {
            lexicon,
            trigger_relations: trigger_relations.into_iter().map(|r| r.to_lowercase()).collect(),
            event_relation: event_relation.into(),
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        Self::new(Lexicon::default(), config.trigger_relations.iter().cloned(), config.event_relation.clone())
    }

    fn is_trigger(&self, relation: &str) -> bool {
        self.trigger_relations.contains(&relation.to_lowercase())
    }

    pub fn discover(&self, graph: &mut KnowledgeGraph) -> (Vec<EventPattern>, EventStats) {
        let mut stats = EventStats::default();
        let mut patterns = Vec::new();

        let triggers: Vec<EdgeKey> = graph
            .edge_keys()
            .into_iter()
            .filter(|k| self.is_trigger(&k.relation))
            .collect();

        for key in triggers {
            stats.triggers_seen += 1;
            let Some(phrase) = graph.node(&key.target).map(|n| n.name().to_string()) else {
                continue;
            };
            let Some(parsed) = self.lexicon.parse(&phrase) else {
                debug!(phrase, "No action prefix, not an event");
                stats.unparsed += 1;
                continue;
            };

            match self.materialise(graph, &key, &parsed, &mut stats) {
                Some(pattern) => {
                    stats.events += 1;
                    patterns.push(pattern);
                }
                None => warn!(edge = %key, "Failed to materialise event"),
            }
        }

        info!(
            triggers = stats.triggers_seen,
            events = stats.events,
            created = stats.nodes_created,
            reused = stats.nodes_reused,
            propagated = stats.propagated,
            "Event discovery complete"
        );
        (patterns, stats)
    }

    fn materialise(&self, graph: &mut KnowledgeGraph, trigger: &EdgeKey, parsed: &ParsedPhrase, stats: &mut EventStats) -> Option<EventPattern> {
        let event = trigger.target.clone();
        let source = trigger.source.clone();

        let action = self.reuse_or_create(graph, &parsed.action, "action", &event, stats)?;
        let object = self.reuse_or_create(graph, &parsed.object, "object", &event, stats)?;
        let state = self.reuse_or_create(graph, &parsed.state, "state", &event, stats)?;

        if let Some(node) = graph.node_mut(&event) {
            node.set("is_event", true);
            node.set("event_action", parsed.action.as_str());
            node.set("event_object", parsed.object.as_str());
            node.set("event_state", parsed.state.as_str());
            if let Some(modifier) = &parsed.modifier {
                node.set("event_modifier", modifier.as_str());
            }
        }

        let structural = [
            (source.clone(), self.event_relation.as_str(), event.clone()),
            (event.clone(), HAS_ACTION, action.clone()),
            (action.clone(), ACTS_ON, object.clone()),
            (event.clone(), ACHIEVES_STATE, state.clone()),
            (state.clone(), STATE_OF_EVENT, event.clone()),
        ];
        for (s, r, t) in structural {
            if s == t {
                continue;
            }
            self.link(graph, EdgeKey::new(s, r, t), EdgeAttrs::created_by(CREATOR), stats);
        }

        let mut propagated_targets = Vec::new();
        for out in graph.out_edges(&state) {
            if out.relation == STATE_OF_EVENT || out.relation.starts_with(VIA_STATE_PREFIX) || out.target == event {
                continue;
            }
            let via = EdgeKey::new(event.clone(), format!("{VIA_STATE_PREFIX}{}", out.relation), out.target.clone());
            if self.link(graph, via, EdgeAttrs::inferred_by(CREATOR), stats) {
                stats.propagated += 1;
            }
            propagated_targets.push(out.target);
        }

        Some(EventPattern {
            source_node: source,
            trigger_relation: trigger.relation.clone(),
            action_node: action,
            object_node: object,
            state_node: state,
            event_node: event,
            propagated_targets,
        })
    }

    fn link(&self, graph: &mut KnowledgeGraph, key: EdgeKey, attrs: EdgeAttrs, stats: &mut EventStats) -> bool {
        match graph.add_edge(key, attrs) {
            Ok(created) => {
                if created {
                    stats.edges_added += 1;
                }
                created
            }
            Err(e) => {
                warn!(error = %e, "Failed to add event edge");
                false
            }
        }
    }

    fn reuse_or_create(&self, graph: &mut KnowledgeGraph, name: &str, role: &str, event: &NodeId, stats: &mut EventStats) -> Option<NodeId> {
        if let Some(existing) = graph.find_by_normalized_name(name, &REUSE_PRIORITY) {
            if existing != *event {
                stats.nodes_reused += 1;
                return Some(existing);
            }
        }
        if normalize_name(name).is_empty() {
            return None;
        }
        let mut props = Map::new();
        props.insert("name".into(), Value::String(name.to_string()));
        props.insert("schema_type".into(), Value::String(role.to_string()));
        props.insert("created_by".into(), Value::String(CREATOR.to_string()));
        match graph.upsert_node(NodeLabel::Entity, props) {
            Ok(id) => {
                stats.nodes_created += 1;
                Some(id)
            }
            Err(e) => {
                warn!(name, error = %e, "Failed to create event node");
                None
            }
        }
    }
}
