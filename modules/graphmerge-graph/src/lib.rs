pub mod events;
pub mod io;
pub mod model;
pub mod rewriter;
pub mod union_find;

pub use events::{EventDiscovery, EventPattern, EventStats, Lexicon};
pub use io::{load_graph, parse_graph, save_graph, to_json_records};
pub use model::{EdgeAttrs, EdgeKey, KnowledgeGraph, Node, NodeId, NodeLabel};
pub use rewriter::{EdgeMapping, EdgeMerge, GraphRewriter, RewriteStats};
pub use union_find::{explicit_canonical, tie_break, MergeDecision, MergeMapping, MergeMethod, MergeResolver};
