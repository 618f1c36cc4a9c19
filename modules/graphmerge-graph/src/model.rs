//! In-memory knowledge graph: labelled nodes with free-form properties and
//! directed edges keyed by `(source, target, relation)`.
//!
//! Every collection is an ordered map so iteration order, and with it every
//! downstream decision order, is deterministic for a given input.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use graphmerge_core::{normalize_name, DedupError, DedupResult};

// =============================================================================
// Nodes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeLabel {
    Entity,
    Attribute,
    Keyword,
    Community,
}

impl NodeLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeLabel::Entity => "entity",
            NodeLabel::Attribute => "attribute",
            NodeLabel::Keyword => "keyword",
            NodeLabel::Community => "community",
        }
    }
}

impl fmt::Display for NodeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub label: NodeLabel,
    pub properties: Map<String, Value>,
}

impl Node {
    pub fn new(id: NodeId, label: NodeLabel, properties: Map<String, Value>) -> Self {
        Self { id, label, properties }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }

    pub fn name(&self) -> &str {
        self.get_str("name").unwrap_or("")
    }

    pub fn description(&self) -> &str {
        self.get_str("description").unwrap_or("")
    }

    pub fn schema_type(&self) -> Option<&str> {
        self.get_str("schema_type")
    }

    pub fn node_role(&self) -> Option<&str> {
        self.get_str("node_role")
    }

    pub fn is_alias(&self) -> bool {
        self.node_role() == Some("alias")
    }

    pub fn alias_of(&self) -> Option<&str> {
        self.get_str("alias_of")
    }

    /// Chunk identifiers, accepting either a list or a single string.
    pub fn chunk_ids(&self) -> Vec<String> {
        match self.properties.get("chunk_ids").or_else(|| self.properties.get("chunk_id")) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// Community member names, in order.
    pub fn members(&self) -> Vec<String> {
        self.properties
            .get("members")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.properties.insert(key.to_string(), value.into());
    }

    /// Push `entry` onto the array property `key` unless an equal entry is
    /// already present. Returns whether the node changed.
    pub fn append_unique(&mut self, key: &str, entry: Value) -> bool {
        let slot = self
            .properties
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        match slot {
            Value::Array(items) if !items.contains(&entry) => {
                items.push(entry);
                true
            }
            _ => false,
        }
    }

    /// Text used for embedding: name, plus description when present.
    pub fn embedding_text(&self) -> String {
        let description = self.description();
        if description.is_empty() {
            self.name().to_string()
        } else {
            format!("{}: {}", self.name(), description)
        }
    }
}

// =============================================================================
// Edges
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EdgeKey {
    pub source: NodeId,
    pub target: NodeId,
    pub relation: String,
}

impl EdgeKey {
    pub fn new(source: NodeId, relation: impl Into<String>, target: NodeId) -> Self {
        Self {
            source,
            target,
            relation: relation.into(),
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }
}

impl fmt::Display for EdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} --{}--> {})", self.source, self.relation, self.target)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeAttrs {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub source_chunks: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inferred: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl EdgeAttrs {
    pub fn created_by(creator: &str) -> Self {
        Self {
            created_by: Some(creator.to_string()),
            ..Self::default()
        }
    }

    pub fn inferred_by(creator: &str) -> Self {
        Self {
            inferred: true,
            created_by: Some(creator.to_string()),
            ..Self::default()
        }
    }

    /// Fold another edge's attributes into this one. Returns whether anything changed.
    pub fn absorb(&mut self, other: &EdgeAttrs) -> bool {
        let before = self.source_chunks.len();
        self.source_chunks.extend(other.source_chunks.iter().cloned());
        let mut changed = self.source_chunks.len() != before;
        for (k, v) in &other.extra {
            if !self.extra.contains_key(k) {
                self.extra.insert(k.clone(), v.clone());
                changed = true;
            }
        }
        changed
    }
}

// =============================================================================
// Graph
// =============================================================================

/// Labelled multi-relational directed graph. One edge per `(source, target, relation)`.
#[derive(Debug, Clone, Default)]
pub struct KnowledgeGraph {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeKey, EdgeAttrs>,
    outgoing: BTreeMap<NodeId, BTreeSet<EdgeKey>>,
    incoming: BTreeMap<NodeId, BTreeSet<EdgeKey>>,
    by_name: HashMap<(NodeLabel, String), NodeId>,
    next_index: BTreeMap<NodeLabel, usize>,
}

impl PartialEq for KnowledgeGraph {
    fn eq(&self, other: &Self) -> bool {
        self.nodes == other.nodes && self.edges == other.edges
    }
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_with_label(&self, label: NodeLabel) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(move |n| n.label == label)
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().cloned().collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = (&EdgeKey, &EdgeAttrs)> {
        self.edges.iter()
    }

    pub fn edge(&self, key: &EdgeKey) -> Option<&EdgeAttrs> {
        self.edges.get(key)
    }

    pub fn contains_edge(&self, key: &EdgeKey) -> bool {
        self.edges.contains_key(key)
    }

    pub fn edge_keys(&self) -> Vec<EdgeKey> {
        self.edges.keys().cloned().collect()
    }

    pub fn out_edges(&self, id: &NodeId) -> Vec<EdgeKey> {
        self.outgoing
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn in_edges(&self, id: &NodeId) -> Vec<EdgeKey> {
        self.incoming
            .get(id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn out_degree(&self, id: &NodeId) -> usize {
        self.outgoing.get(id).map_or(0, BTreeSet::len)
    }

    pub fn in_degree(&self, id: &NodeId) -> usize {
        self.incoming.get(id).map_or(0, BTreeSet::len)
    }

    pub fn is_isolated(&self, id: &NodeId) -> bool {
        self.out_degree(id) == 0 && self.in_degree(id) == 0
    }

    /// Exact lookup by label and name.
    pub fn find_by_name(&self, label: NodeLabel, name: &str) -> Option<&NodeId> {
        self.by_name.get(&(label, name.to_string()))
    }

    /// First node (in id order) of any of `labels`, tried in priority order,
    /// whose normalised name equals `name`'s.
    pub fn find_by_normalized_name(&self, name: &str, labels: &[NodeLabel]) -> Option<NodeId> {
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }
        labels.iter().find_map(|label| {
            self.nodes
                .values()
                .find(|n| n.label == *label && normalize_name(n.name()) == wanted)
                .map(|n| n.id.clone())
        })
    }

    /// Return the id of the node with this label and name, creating it with
    /// `properties` if absent. Communities and nameless nodes are never reused.
    pub fn upsert_node(&mut self, label: NodeLabel, mut properties: Map<String, Value>) -> DedupResult<NodeId> {
        let name = properties.get("name").and_then(Value::as_str).unwrap_or("").to_string();
        if let Some(id) = self.lookup_identity(label, &name) {
            return Ok(id);
        }
        validate_properties(label, &properties)?;
        let id = self.allocate_id(label);
        properties.entry("name".to_string()).or_insert_with(|| Value::String(name));
        self.insert_node(Node::new(id.clone(), label, properties))?;
        Ok(id)
    }

    /// Insert a node with a caller-chosen id (used when reloading a graph
    /// written by this crate).
    pub fn insert_node(&mut self, node: Node) -> DedupResult<()> {
        validate_properties(node.label, &node.properties)?;
        if self.nodes.contains_key(&node.id) {
            return Err(DedupError::Graph(format!("duplicate node id {}", node.id)));
        }
        self.note_id(&node.id, node.label);
        let name = node.name().to_string();
        if !name.is_empty() && node.label != NodeLabel::Community {
            self.by_name.entry((node.label, name)).or_insert_with(|| node.id.clone());
        }
        self.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    /// Remove a node and every incident edge.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        for key in self.out_edges(id).into_iter().chain(self.in_edges(id)) {
            self.remove_edge(&key);
        }
        self.outgoing.remove(id);
        self.incoming.remove(id);
        let node = self.nodes.remove(id)?;
        let key = (node.label, node.name().to_string());
        if self.by_name.get(&key) == Some(id) {
            self.by_name.remove(&key);
        }
        Some(node)
    }

    /// Add an edge, or fold `attrs` into the existing edge with the same key.
    /// Returns `true` when a new edge was created.
    pub fn add_edge(&mut self, key: EdgeKey, attrs: EdgeAttrs) -> DedupResult<bool> {
        for endpoint in [&key.source, &key.target] {
            if !self.nodes.contains_key(endpoint) {
                return Err(DedupError::MissingReference(format!("edge {key} references unknown node {endpoint}")));
            }
        }
        if let Some(existing) = self.edges.get_mut(&key) {
            existing.absorb(&attrs);
            return Ok(false);
        }
        self.outgoing.entry(key.source.clone()).or_default().insert(key.clone());
        self.incoming.entry(key.target.clone()).or_default().insert(key.clone());
        self.edges.insert(key, attrs);
        Ok(true)
    }

    pub fn remove_edge(&mut self, key: &EdgeKey) -> Option<EdgeAttrs> {
        let attrs = self.edges.remove(key)?;
        if let Some(set) = self.outgoing.get_mut(&key.source) {
            set.remove(key);
        }
        if let Some(set) = self.incoming.get_mut(&key.target) {
            set.remove(key);
        }
        Some(attrs)
    }

    /// Edges in canonical order as `(source, relation, target, attrs)`.
    /// Two graphs are equal iff their nodes and canonical edge lists match.
    pub fn canonical_edges(&self) -> Vec<(String, String, String, EdgeAttrs)> {
        let mut out: Vec<_> = self
            .edges
            .iter()
            .map(|(k, a)| (k.source.0.clone(), k.relation.clone(), k.target.0.clone(), a.clone()))
            .collect();
        out.sort_by(|a, b| (&a.0, &a.1, &a.2).cmp(&(&b.0, &b.1, &b.2)));
        out
    }

    fn lookup_identity(&self, label: NodeLabel, name: &str) -> Option<NodeId> {
        if label == NodeLabel::Community || name.is_empty() {
            return None;
        }
        self.by_name.get(&(label, name.to_string())).cloned()
    }

    fn allocate_id(&mut self, label: NodeLabel) -> NodeId {
        loop {
            let counter = self.next_index.entry(label).or_insert(0);
            let candidate = NodeId(format!("{}_{}", label.as_str(), *counter));
            *counter += 1;
            if !self.nodes.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Keep the id allocator ahead of explicitly supplied `label_n` ids.
    fn note_id(&mut self, id: &NodeId, label: NodeLabel) {
        let prefix = format!("{}_", label.as_str());
        if let Some(n) = id.0.strip_prefix(&prefix).and_then(|s| s.parse::<usize>().ok()) {
            let counter = self.next_index.entry(label).or_insert(0);
            if *counter <= n {
                *counter = n + 1;
            }
        }
    }
}

fn validate_properties(label: NodeLabel, properties: &Map<String, Value>) -> DedupResult<()> {
    if label != NodeLabel::Community {
        let name = properties.get("name").and_then(Value::as_str).unwrap_or("");
        if name.trim().is_empty() {
            return Err(DedupError::Graph(format!("{label} node without a name")));
        }
    }
    if let Some(members) = properties.get("members") {
        let valid = members
            .as_array()
            .is_some_and(|items| items.iter().all(Value::is_string));
        if !valid {
            return Err(DedupError::Graph("community members must be a list of strings".into()));
        }
    }
    Ok(())
}

/// Build a property map from a name (and optional description). Test and
/// enrichment helper.
pub fn named(name: &str) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("name".to_string(), Value::String(name.to_string()));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn edge(g: &KnowledgeGraph, s: &str, r: &str, t: &str) -> EdgeKey {
        EdgeKey::new(
            g.find_by_name(NodeLabel::Entity, s).unwrap().clone(),
            r,
            g.find_by_name(NodeLabel::Entity, t).unwrap().clone(),
        )
    }

    #[test]
    fn upsert_reuses_label_and_name_identity() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeLabel::Entity, named("Star Wars")).unwrap();
        let b = g.upsert_node(NodeLabel::Entity, named("Star Wars")).unwrap();
        let c = g.upsert_node(NodeLabel::Keyword, named("Star Wars")).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "entity_0");
        assert_eq!(c.as_str(), "keyword_0");
    }

    #[test]
    fn rejects_nameless_entity() {
        let mut g = KnowledgeGraph::new();
        let err = g.upsert_node(NodeLabel::Entity, Map::new()).unwrap_err();
        assert!(matches!(err, DedupError::Graph(_)));
    }

    #[test]
    fn rejects_non_string_members() {
        let mut g = KnowledgeGraph::new();
        let mut props = named("c1");
        props.insert("members".into(), json!([1, 2]));
        assert!(g.upsert_node(NodeLabel::Community, props).is_err());
    }

    #[test]
    fn duplicate_edge_merges_source_chunks() {
        let mut g = KnowledgeGraph::new();
        g.upsert_node(NodeLabel::Entity, named("A")).unwrap();
        g.upsert_node(NodeLabel::Entity, named("B")).unwrap();
        let key = edge(&g, "A", "rel", "B");
        let mut first = EdgeAttrs::default();
        first.source_chunks.insert("c1".into());
        let mut second = EdgeAttrs::default();
        second.source_chunks.insert("c2".into());

        assert!(g.add_edge(key.clone(), first).unwrap());
        assert!(!g.add_edge(key.clone(), second).unwrap());
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.edge(&key).unwrap().source_chunks.len(), 2);
    }

    #[test]
    fn distinct_relations_between_same_pair_are_distinct_edges() {
        let mut g = KnowledgeGraph::new();
        g.upsert_node(NodeLabel::Entity, named("A")).unwrap();
        g.upsert_node(NodeLabel::Entity, named("B")).unwrap();
        g.add_edge(edge(&g, "A", "r1", "B"), EdgeAttrs::default()).unwrap();
        g.add_edge(edge(&g, "A", "r2", "B"), EdgeAttrs::default()).unwrap();
        let a = g.find_by_name(NodeLabel::Entity, "A").unwrap().clone();
        assert_eq!(g.out_degree(&a), 2);
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let mut g = KnowledgeGraph::new();
        g.upsert_node(NodeLabel::Entity, named("A")).unwrap();
        g.upsert_node(NodeLabel::Entity, named("B")).unwrap();
        g.add_edge(edge(&g, "A", "rel", "B"), EdgeAttrs::default()).unwrap();
        let b = g.find_by_name(NodeLabel::Entity, "B").unwrap().clone();
        g.remove_node(&b).unwrap();
        assert_eq!(g.edge_count(), 0);
        assert!(g.find_by_name(NodeLabel::Entity, "B").is_none());
    }

    #[test]
    fn edge_to_unknown_node_is_a_missing_reference() {
        let mut g = KnowledgeGraph::new();
        let a = g.upsert_node(NodeLabel::Entity, named("A")).unwrap();
        let err = g
            .add_edge(EdgeKey::new(a, "rel", NodeId::from("entity_99")), EdgeAttrs::default())
            .unwrap_err();
        assert!(matches!(err, DedupError::MissingReference(_)));
    }

    #[test]
    fn explicit_ids_advance_the_allocator() {
        let mut g = KnowledgeGraph::new();
        g.insert_node(Node::new(NodeId::from("entity_7"), NodeLabel::Entity, named("X")))
            .unwrap();
        let next = g.upsert_node(NodeLabel::Entity, named("Y")).unwrap();
        assert_eq!(next.as_str(), "entity_8");
    }

    #[test]
    fn normalized_lookup_honours_label_priority() {
        let mut g = KnowledgeGraph::new();
        g.upsert_node(NodeLabel::Attribute, named("Oxygenation")).unwrap();
        let entity = g.upsert_node(NodeLabel::Entity, named("oxygenation ")).unwrap();
        let found = g
            .find_by_normalized_name("OXYGENATION", &[NodeLabel::Entity, NodeLabel::Keyword, NodeLabel::Attribute])
            .unwrap();
        assert_eq!(found, entity);
    }

    #[test]
    fn append_unique_skips_equal_entries() {
        let mut node = Node::new(NodeId::from("entity_0"), NodeLabel::Entity, named("A"));
        assert!(node.append_unique("aliases", json!({"alias_id": "entity_1"})));
        assert!(!node.append_unique("aliases", json!({"alias_id": "entity_1"})));
        assert_eq!(node.properties["aliases"].as_array().unwrap().len(), 1);
    }
}
