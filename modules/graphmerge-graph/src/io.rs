//! Graph JSON: an array of `{start_node, relation, end_node}` records.
//!
//! Nodes are `{id?, label, properties}`; `id` is optional on input and always
//! written on output so a saved graph reloads with the same identifiers.
//! Edge attributes are sibling keys of the record. A record whose `relation`
//! is null (and has no `end_node`) carries an isolated node.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use graphmerge_core::{DedupError, DedupResult};

use crate::model::{EdgeAttrs, EdgeKey, KnowledgeGraph, Node, NodeId, NodeLabel};

#[derive(Debug, Deserialize, Serialize)]
struct RawNode {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    label: NodeLabel,
    #[serde(default)]
    properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    start_node: RawNode,
    #[serde(default)]
    relation: Option<String>,
    #[serde(default)]
    end_node: Option<RawNode>,
    #[serde(flatten)]
    attrs: Map<String, Value>,
}

pub fn load_graph(path: &Path) -> DedupResult<KnowledgeGraph> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| DedupError::Io(format!("failed to read graph {}: {e}", path.display())))?;
    let graph = parse_graph(&content)?;
    info!(
        path = %path.display(),
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "Loaded graph"
    );
    Ok(graph)
}

pub fn parse_graph(content: &str) -> DedupResult<KnowledgeGraph> {
    let records: Vec<RawRecord> =
        serde_json::from_str(content).map_err(|e| DedupError::Graph(format!("invalid graph JSON: {e}")))?;

    let mut graph = KnowledgeGraph::new();
    for (index, record) in records.into_iter().enumerate() {
        let source = ingest_node(&mut graph, record.start_node)
            .map_err(|e| DedupError::Graph(format!("record {index}: {e}")))?;

        let (relation, end_node) = match (record.relation, record.end_node) {
            (Some(relation), Some(end)) => (relation, end),
            (None, None) => continue,
            _ => {
                return Err(DedupError::Graph(format!(
                    "record {index}: relation and end_node must both be present or both absent"
                )))
            }
        };
        let target = ingest_node(&mut graph, end_node)
            .map_err(|e| DedupError::Graph(format!("record {index}: {e}")))?;

        graph.add_edge(EdgeKey::new(source, relation, target), edge_attrs(record.attrs))?;
    }
    Ok(graph)
}

fn ingest_node(graph: &mut KnowledgeGraph, raw: RawNode) -> DedupResult<NodeId> {
    match raw.id {
        Some(id) => {
            let id = NodeId::new(id);
            if !graph.contains_node(&id) {
                graph.insert_node(Node::new(id.clone(), raw.label, raw.properties))?;
            }
            Ok(id)
        }
        None => graph.upsert_node(raw.label, raw.properties),
    }
}

fn edge_attrs(mut raw: Map<String, Value>) -> EdgeAttrs {
    let mut attrs = EdgeAttrs::default();
    match raw.remove("source_chunks") {
        Some(Value::Array(items)) => {
            attrs.source_chunks = items.iter().filter_map(|v| v.as_str().map(String::from)).collect();
        }
        Some(Value::String(s)) if !s.is_empty() => {
            attrs.source_chunks.insert(s);
        }
        _ => {}
    }
    attrs.inferred = raw.remove("inferred").and_then(|v| v.as_bool()).unwrap_or(false);
    attrs.created_by = raw.remove("created_by").and_then(|v| v.as_str().map(String::from));
    attrs.extra = raw;
    attrs
}

fn raw_node(node: &Node) -> Value {
    serde_json::json!({
        "id": node.id,
        "label": node.label,
        "properties": node.properties,
    })
}

/// Serialise to the record format: one record per edge in canonical order,
/// then one record per isolated node.
pub fn to_json_records(graph: &KnowledgeGraph) -> Vec<Value> {
    let mut records = Vec::with_capacity(graph.edge_count());

    for (key, attrs) in graph.edges() {
        let (Some(source), Some(target)) = (graph.node(&key.source), graph.node(&key.target)) else {
            continue;
        };
        let mut record = Map::new();
        record.insert("start_node".into(), raw_node(source));
        record.insert("relation".into(), Value::String(key.relation.clone()));
        record.insert("end_node".into(), raw_node(target));
        if !attrs.source_chunks.is_empty() {
            record.insert(
                "source_chunks".into(),
                Value::Array(attrs.source_chunks.iter().cloned().map(Value::String).collect()),
            );
        }
        if attrs.inferred {
            record.insert("inferred".into(), Value::Bool(true));
        }
        if let Some(creator) = &attrs.created_by {
            record.insert("created_by".into(), Value::String(creator.clone()));
        }
        for (k, v) in &attrs.extra {
            record.entry(k.clone()).or_insert_with(|| v.clone());
        }
        records.push(Value::Object(record));
    }

    for node in graph.nodes().filter(|n| graph.is_isolated(&n.id)) {
        let mut record = Map::new();
        record.insert("start_node".into(), raw_node(node));
        record.insert("relation".into(), Value::Null);
        records.push(Value::Object(record));
    }

    records
}

pub fn save_graph(graph: &KnowledgeGraph, path: &Path) -> DedupResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&to_json_records(graph))
        .map_err(|e| DedupError::Io(format!("failed to serialise graph: {e}")))?;
    std::fs::write(path, json)
        .map_err(|e| DedupError::Io(format!("failed to write graph {}: {e}", path.display())))?;
    info!(
        path = %path.display(),
        nodes = graph.node_count(),
        edges = graph.edge_count(),
        "Saved graph"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {"start_node": {"label": "entity", "properties": {"name": "Star Wars", "description": "1977 film"}},
         "relation": "director",
         "end_node": {"label": "entity", "properties": {"name": "George Lucas"}},
         "source_chunks": ["c1"]},
        {"start_node": {"label": "entity", "properties": {"name": "Star Wars"}},
         "relation": "director",
         "end_node": {"label": "entity", "properties": {"name": "G. Lucas"}},
         "weight": 3},
        {"start_node": {"label": "community", "properties": {"name": "films", "members": ["Star Wars"]}},
         "relation": null}
    ]"#;

    #[test]
    fn parses_records_and_reuses_nodes() {
        let g = parse_graph(SAMPLE).unwrap();
        assert_eq!(g.node_count(), 4);
        assert_eq!(g.edge_count(), 2);
        let star_wars = g.find_by_name(NodeLabel::Entity, "Star Wars").unwrap();
        assert_eq!(g.node(star_wars).unwrap().description(), "1977 film");
        assert_eq!(g.out_degree(star_wars), 2);
    }

    #[test]
    fn sibling_keys_become_edge_attributes() {
        let g = parse_graph(SAMPLE).unwrap();
        let (_, first) = g.edges().next().unwrap();
        assert!(first.source_chunks.contains("c1"));
        let weighted = g.edges().find(|(_, a)| a.extra.contains_key("weight")).unwrap();
        assert_eq!(weighted.1.extra["weight"], 3);
    }

    #[test]
    fn save_then_load_preserves_graph() {
        let g = parse_graph(SAMPLE).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/graph.json");
        save_graph(&g, &path).unwrap();
        let reloaded = load_graph(&path).unwrap();
        assert_eq!(g, reloaded);
        assert_eq!(g.canonical_edges(), reloaded.canonical_edges());
    }

    #[test]
    fn missing_name_is_a_graph_error() {
        let err = parse_graph(r#"[{"start_node": {"label": "entity", "properties": {}}, "relation": null}]"#)
            .unwrap_err();
        assert!(matches!(err, DedupError::Graph(msg) if msg.contains("record 0")));
    }

    #[test]
    fn relation_without_end_node_is_rejected() {
        let err = parse_graph(
            r#"[{"start_node": {"label": "entity", "properties": {"name": "A"}}, "relation": "r"}]"#,
        )
        .unwrap_err();
        assert!(matches!(err, DedupError::Graph(_)));
    }

    #[test]
    fn unreadable_file_is_an_io_error() {
        let err = load_graph(Path::new("/nonexistent/graph.json")).unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, DedupError::Io(_)));
    }
}
