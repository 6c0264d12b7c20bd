//! Fact graphs built from text and image sources.
//!
//! A fact graph is a list of [`KnowledgeEdge`]s indexed by head entity. The
//! [`FactGraphStore`] builds edge sets through an extraction oracle and caches
//! them by content hash; [`FactGraph`] is the read-only index the path
//! sampler and hop synthesis work on.

mod cache;
mod store;

pub use cache::{CacheEntry, EdgeCache, InMemoryEdgeCache, JsonFileEdgeCache, CACHE_VERSION};
pub use store::{chunk_text, summarize_description, FactGraphStore, VisualKnowledge};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};

/// Where an edge was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    #[default]
    Text,
    Image,
}

/// One atomic fact: `head --relation--> tail`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KnowledgeEdge {
    pub head: String,
    pub relation: String,
    pub tail: String,
    #[serde(default)]
    pub evidence: Option<String>,
    /// Which extraction call produced the edge.
    #[serde(default)]
    pub source_id: Option<u32>,
    #[serde(default)]
    pub source_type: SourceType,
}

impl KnowledgeEdge {
    pub fn new(
        head: impl Into<String>,
        relation: impl Into<String>,
        tail: impl Into<String>,
    ) -> Self {
        Self {
            head: head.into(),
            relation: relation.into(),
            tail: tail.into(),
            evidence: None,
            source_id: None,
            source_type: SourceType::Text,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }

    pub fn with_source(mut self, source_id: u32) -> Self {
        self.source_id = Some(source_id);
        self
    }

    pub fn with_source_type(mut self, source_type: SourceType) -> Self {
        self.source_type = source_type;
        self
    }

    pub fn triple(&self) -> (&str, &str, &str) {
        (&self.head, &self.relation, &self.tail)
    }

    /// Two edges from the same extraction call. Edges without an id never are.
    pub fn shares_source_with(&self, other: &KnowledgeEdge) -> bool {
        matches!((self.source_id, other.source_id), (Some(a), Some(b)) if a == b)
    }
}

/// Keep the first edge of each `(head, relation, tail)` triple.
pub fn dedupe_edges(edges: Vec<KnowledgeEdge>) -> Vec<KnowledgeEdge> {
    let mut seen = HashSet::new();
    edges
        .into_iter()
        .filter(|e| seen.insert((e.head.clone(), e.relation.clone(), e.tail.clone())))
        .collect()
}

/// Gap between the largest text source id and the first visual one.
const VISUAL_ID_GAP: u32 = 1000;

/// Merge visual edges into a text edge set.
///
/// Visual source ids move past the text range (`max text id + 1000`), so an
/// image edge never looks like it shares an extraction call with a text
/// edge. Visual edges without an id get one from their 1-based position.
pub fn merge_visual_edges(
    text: Vec<KnowledgeEdge>,
    visual: Vec<KnowledgeEdge>,
) -> Vec<KnowledgeEdge> {
    let offset = text
        .iter()
        .filter_map(|e| e.source_id)
        .max()
        .unwrap_or(0)
        .saturating_add(VISUAL_ID_GAP);

    let remapped = visual.into_iter().enumerate().map(|(idx, mut edge)| {
        let local = edge.source_id.unwrap_or(idx as u32 + 1);
        edge.source_id = Some(offset.saturating_add(local));
        edge.source_type = SourceType::Image;
        edge
    });

    text.into_iter().chain(remapped).collect()
}

/// Read-only adjacency index over an edge set.
#[derive(Debug, Clone, Default)]
pub struct FactGraph {
    edges: Vec<KnowledgeEdge>,
    /// Heads in first-seen order.
    heads: Vec<String>,
    by_head: HashMap<String, Vec<usize>>,
}

impl FactGraph {
    pub fn from_edges(edges: Vec<KnowledgeEdge>) -> Self {
        let mut heads = Vec::new();
        let mut by_head: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, edge) in edges.iter().enumerate() {
            let slot = by_head.entry(edge.head.clone()).or_default();
            if slot.is_empty() {
                heads.push(edge.head.clone());
            }
            slot.push(i);
        }
        Self {
            edges,
            heads,
            by_head,
        }
    }

    pub fn edges(&self) -> &[KnowledgeEdge] {
        &self.edges
    }

    pub fn heads(&self) -> &[String] {
        &self.heads
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Edges leaving `head`, in insertion order.
    pub fn outgoing<'a>(&'a self, head: &str) -> impl Iterator<Item = &'a KnowledgeEdge> + 'a {
        self.by_head
            .get(head)
            .into_iter()
            .flatten()
            .map(move |&i| &self.edges[i])
    }

    /// All heads and tails, sorted.
    pub fn entity_pool(&self) -> BTreeSet<&str> {
        self.edges
            .iter()
            .flat_map(|e| [e.head.as_str(), e.tail.as_str()])
            .collect()
    }

    /// Edges sharing `edge`'s head but ending somewhere else.
    pub fn branch_candidates<'a>(
        &'a self,
        edge: &'a KnowledgeEdge,
    ) -> impl Iterator<Item = &'a KnowledgeEdge> + 'a {
        self.outgoing(&edge.head).filter(move |e| e.tail != edge.tail)
    }

    pub fn has_source_type(&self, source_type: SourceType) -> bool {
        self.edges.iter().any(|e| e.source_type == source_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(h: &str, r: &str, t: &str, src: u32) -> KnowledgeEdge {
        KnowledgeEdge::new(h, r, t).with_source(src)
    }

    #[test]
    fn test_dedupe_keeps_first() {
        let edges = vec![
            edge("A", "causes", "B", 1),
            edge("A", "causes", "B", 2),
            edge("A", "implies", "B", 2),
        ];
        let deduped = dedupe_edges(edges);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].source_id, Some(1));
    }

    #[test]
    fn test_merge_remaps_visual_ids() {
        let text = vec![edge("A", "r", "B", 1), edge("B", "r", "C", 7)];
        let visual = vec![
            edge("panel", "shows", "peak", 2),
            KnowledgeEdge::new("peak", "at", "650 nm"),
        ];
        let merged = merge_visual_edges(text, visual);

        assert_eq!(merged.len(), 4);
        assert_eq!(merged[2].source_id, Some(1009));
        assert_eq!(merged[3].source_id, Some(1009));
        assert!(merged[2..].iter().all(|e| e.source_type == SourceType::Image));
        assert_eq!(merged[0].source_type, SourceType::Text);
    }

    #[test]
    fn test_merge_without_text_ids() {
        let merged = merge_visual_edges(Vec::new(), vec![KnowledgeEdge::new("x", "y", "z")]);
        assert_eq!(merged[0].source_id, Some(1001));
    }

    #[test]
    fn test_graph_index() {
        let graph = FactGraph::from_edges(vec![
            edge("B", "r", "C", 1),
            edge("A", "r", "B", 2),
            edge("B", "s", "D", 3),
        ]);
        assert_eq!(graph.heads(), &["B".to_string(), "A".to_string()]);
        assert_eq!(graph.outgoing("B").count(), 2);
        assert_eq!(graph.outgoing("Z").count(), 0);
        assert_eq!(
            graph.entity_pool().into_iter().collect::<Vec<_>>(),
            vec!["A", "B", "C", "D"]
        );

        let first = &graph.edges()[0];
        let branches: Vec<_> = graph.branch_candidates(first).collect();
        assert_eq!(branches.len(), 1);
        assert_eq!(branches[0].tail, "D");
    }

    #[test]
    fn test_shares_source() {
        let a = edge("A", "r", "B", 1);
        let b = edge("B", "r", "C", 1);
        let c = KnowledgeEdge::new("C", "r", "D");
        assert!(a.shares_source_with(&b));
        assert!(!b.shares_source_with(&c));
        assert!(!c.shares_source_with(&c.clone()));
    }
}
