//! Multi-hop path sampling over a fact graph.
//!
//! A path is grown from a start head by following edges whose head equals
//! the current cursor; the cursor then moves to the edge's tail:
//!
//! ```text
//!   start ──r1──► t1 ──r2──► t2 ──r3──► t3        (length 3)
//! ```
//!
//! Starts are tried in shuffled order. Each start is explored depth-first
//! with candidates in shuffled order, so the first candidate tried at every
//! level is a uniform random choice, and dead ends backtrack instead of
//! abandoning the start. Paths never revisit a node.
//!
//! When no start yields a path of the requested length the sampler falls
//! back to a random subset of edges with no constraints applied, and says
//! so through [`SampleStatus::Fallback`].

use crate::config::SamplerConfig;
use crate::graph::{FactGraph, KnowledgeEdge, SourceType};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use tracing::debug;

/// How a sample was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    /// A cursor-chained path of the requested length satisfying all constraints.
    Matched,
    /// Unconstrained random edges; chaining, distinct-source and shortcut
    /// guarantees do not hold.
    Fallback,
    /// Nothing to sample (no edges or zero length).
    Empty,
}

/// Constraints for one sampling call.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleConstraints {
    pub distinct_sources: bool,
    pub max_shortcut_edges: usize,
    /// Require at least one edge of this type, best effort.
    pub prefer_source_type: Option<SourceType>,
}

impl SampleConstraints {
    pub fn from_config(config: &SamplerConfig) -> Self {
        Self {
            distinct_sources: config.distinct_sources,
            max_shortcut_edges: config.max_shortcut_edges,
            prefer_source_type: None,
        }
    }

    pub fn preferring(mut self, source_type: SourceType) -> Self {
        self.prefer_source_type = Some(source_type);
        self
    }
}

/// A sampled sequence of edges.
#[derive(Debug, Clone, PartialEq)]
pub struct PathSample {
    pub edges: Vec<KnowledgeEdge>,
    pub status: SampleStatus,
    /// Whether `prefer_source_type` (if any) is represented.
    pub preference_met: bool,
}

impl PathSample {
    fn empty() -> Self {
        Self {
            edges: Vec::new(),
            status: SampleStatus::Empty,
            preference_met: false,
        }
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn is_degraded(&self) -> bool {
        self.status != SampleStatus::Matched
    }

    /// Adjacent pairs sharing a source id.
    pub fn shortcut_count(&self) -> usize {
        count_shortcuts(&self.edges)
    }

    pub fn contains_source_type(&self, source_type: SourceType) -> bool {
        self.edges.iter().any(|e| e.source_type == source_type)
    }
}

/// Ordering of best-effort samples: matched first, then preference met.
fn rank(sample: &PathSample) -> (bool, bool) {
    (sample.status == SampleStatus::Matched, sample.preference_met)
}

pub fn count_shortcuts(edges: &[KnowledgeEdge]) -> usize {
    edges
        .windows(2)
        .filter(|pair| pair[0].shares_source_with(&pair[1]))
        .count()
}

/// Path sampler with an injected random source.
pub struct PathSampler<R = StdRng> {
    rng: R,
    prefer_attempts: usize,
    expansion_budget: usize,
}

impl PathSampler<StdRng> {
    /// Deterministic sampler for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn from_entropy() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

/// Mutable state of one depth-first search.
struct Search<'g> {
    path: Vec<&'g KnowledgeEdge>,
    visited: HashSet<&'g str>,
    used_sources: HashSet<u32>,
    budget: usize,
}

impl<R: Rng> PathSampler<R> {
    pub fn new(rng: R) -> Self {
        let defaults = SamplerConfig::default();
        Self {
            rng,
            prefer_attempts: defaults.prefer_attempts,
            expansion_budget: defaults.expansion_budget,
        }
    }

    pub fn with_config(mut self, config: &SamplerConfig) -> Self {
        self.prefer_attempts = config.prefer_attempts.max(1);
        self.expansion_budget = config.expansion_budget.max(1);
        self
    }

    pub fn rng_mut(&mut self) -> &mut R {
        &mut self.rng
    }

    /// Sample from a plain edge list.
    pub fn sample_edges(
        &mut self,
        edges: &[KnowledgeEdge],
        length: usize,
        constraints: &SampleConstraints,
    ) -> PathSample {
        let graph = FactGraph::from_edges(edges.to_vec());
        self.sample(&graph, length, constraints)
    }

    /// Sample a path of `length` edges.
    ///
    /// With a preferred source type the whole procedure is retried up to
    /// `prefer_attempts` times until a matched path contains that type.
    /// Otherwise the best attempt is kept: a matched path beats a fallback
    /// even when only the fallback reaches the preferred type.
    pub fn sample(
        &mut self,
        graph: &FactGraph,
        length: usize,
        constraints: &SampleConstraints,
    ) -> PathSample {
        if length == 0 || graph.is_empty() {
            return PathSample::empty();
        }

        let Some(preferred) = constraints.prefer_source_type else {
            let mut sample = self.sample_once(graph, length, constraints);
            sample.preference_met = true;
            return sample;
        };

        let mut best: Option<PathSample> = None;
        for attempt in 1..=self.prefer_attempts {
            let mut sample = self.sample_once(graph, length, constraints);
            sample.preference_met = sample.contains_source_type(preferred);
            if sample.status == SampleStatus::Matched && sample.preference_met {
                debug!(attempt, "sampled matched path with preferred source");
                return sample;
            }
            if best.as_ref().map_or(true, |b| rank(&sample) > rank(b)) {
                best = Some(sample);
            }
        }

        debug!(?preferred, "no matched path with preferred source, keeping best effort");
        best.unwrap_or_else(PathSample::empty)
    }

    fn sample_once(
        &mut self,
        graph: &FactGraph,
        length: usize,
        constraints: &SampleConstraints,
    ) -> PathSample {
        let mut starts: Vec<&str> = graph.heads().iter().map(String::as_str).collect();
        starts.shuffle(&mut self.rng);

        let mut search = Search {
            path: Vec::with_capacity(length),
            visited: HashSet::new(),
            used_sources: HashSet::new(),
            budget: self.expansion_budget,
        };

        for start in starts {
            search.path.clear();
            search.visited.clear();
            search.used_sources.clear();
            search.visited.insert(start);

            if self.extend(graph, start, 0, length, constraints, &mut search) {
                return PathSample {
                    edges: search.path.iter().map(|e| (*e).clone()).collect(),
                    status: SampleStatus::Matched,
                    preference_met: false,
                };
            }
            if search.budget == 0 {
                debug!("expansion budget exhausted");
                break;
            }
        }

        self.fallback(graph, length)
    }

    fn extend<'g>(
        &mut self,
        graph: &'g FactGraph,
        cursor: &'g str,
        shortcuts: usize,
        length: usize,
        constraints: &SampleConstraints,
        search: &mut Search<'g>,
    ) -> bool {
        if search.path.len() == length {
            return true;
        }
        if search.budget == 0 {
            return false;
        }
        search.budget -= 1;

        let mut candidates: Vec<&'g KnowledgeEdge> = graph
            .outgoing(cursor)
            .filter(|e| !search.visited.contains(e.tail.as_str()))
            .filter(|e| {
                !constraints.distinct_sources
                    || e.source_id.map_or(true, |id| !search.used_sources.contains(&id))
            })
            .collect();
        candidates.shuffle(&mut self.rng);

        for edge in candidates {
            let shortcut = search
                .path
                .last()
                .is_some_and(|prev| prev.shares_source_with(edge));
            let next_shortcuts = shortcuts + usize::from(shortcut);
            if next_shortcuts > constraints.max_shortcut_edges {
                continue;
            }

            search.path.push(edge);
            search.visited.insert(edge.tail.as_str());
            let fresh_source = edge.source_id.map(|id| search.used_sources.insert(id));

            if self.extend(graph, &edge.tail, next_shortcuts, length, constraints, search) {
                return true;
            }

            search.path.pop();
            search.visited.remove(edge.tail.as_str());
            if let (Some(id), Some(true)) = (edge.source_id, fresh_source) {
                search.used_sources.remove(&id);
            }
            if search.budget == 0 {
                return false;
            }
        }
        false
    }

    fn fallback(&mut self, graph: &FactGraph, length: usize) -> PathSample {
        let mut edges: Vec<KnowledgeEdge> = graph
            .edges()
            .choose_multiple(&mut self.rng, length.min(graph.len()))
            .cloned()
            .collect();
        edges.shuffle(&mut self.rng);
        debug!(requested = length, returned = edges.len(), "path sampling fell back");
        PathSample {
            edges,
            status: SampleStatus::Fallback,
            preference_met: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edge(h: &str, r: &str, t: &str, src: u32) -> KnowledgeEdge {
        KnowledgeEdge::new(h, r, t).with_source(src)
    }

    fn constraints(distinct: bool, max_shortcuts: usize) -> SampleConstraints {
        SampleConstraints {
            distinct_sources: distinct,
            max_shortcut_edges: max_shortcuts,
            prefer_source_type: None,
        }
    }

    fn is_chained(edges: &[KnowledgeEdge]) -> bool {
        edges.windows(2).all(|p| p[0].tail == p[1].head)
    }

    #[test]
    fn test_example_chain() {
        let edges = vec![
            edge("A", "causes", "B", 1),
            edge("B", "implies", "C", 2),
            edge("C", "causes", "D", 1),
        ];
        for seed in 0..50 {
            let mut sampler = PathSampler::seeded(seed);
            let sample = sampler.sample_edges(&edges, 2, &constraints(true, 10));
            assert_eq!(sample.status, SampleStatus::Matched);
            let heads: Vec<&str> = sample.edges.iter().map(|e| e.head.as_str()).collect();
            assert!(heads == ["A", "B"] || heads == ["B", "C"], "seed {seed}: {heads:?}");
        }
    }

    #[test]
    fn test_backtracks_past_dead_end() {
        // From A the dead end A->X is as likely as A->B; only A->B->C works.
        let edges = vec![
            edge("A", "r", "X", 1),
            edge("A", "r", "B", 2),
            edge("B", "r", "C", 3),
        ];
        for seed in 0..30 {
            let mut sampler = PathSampler::seeded(seed);
            let sample = sampler.sample_edges(&edges, 2, &constraints(false, 10));
            assert_eq!(sample.status, SampleStatus::Matched);
            assert_eq!(sample.edges[0].tail, "B");
        }
    }

    #[test]
    fn test_shortcut_bound() {
        let edges = vec![edge("A", "r", "B", 1), edge("B", "r", "C", 1)];
        let mut sampler = PathSampler::seeded(7);
        let strict = sampler.sample_edges(&edges, 2, &constraints(false, 0));
        assert_eq!(strict.status, SampleStatus::Fallback);

        let loose = sampler.sample_edges(&edges, 2, &constraints(false, 1));
        assert_eq!(loose.status, SampleStatus::Matched);
        assert_eq!(loose.shortcut_count(), 1);
    }

    #[test]
    fn test_edges_without_source_are_never_excluded() {
        let edges = vec![KnowledgeEdge::new("A", "r", "B"), KnowledgeEdge::new("B", "r", "C")];
        let mut sampler = PathSampler::seeded(1);
        let sample = sampler.sample_edges(&edges, 2, &constraints(true, 0));
        assert_eq!(sample.status, SampleStatus::Matched);
        assert!(is_chained(&sample.edges));
    }

    #[test]
    fn test_no_cycles() {
        let edges = vec![edge("A", "r", "B", 1), edge("B", "r", "A", 2)];
        let mut sampler = PathSampler::seeded(3);
        let sample = sampler.sample_edges(&edges, 3, &constraints(false, 10));
        assert_eq!(sample.status, SampleStatus::Fallback);
        assert!(sample.len() <= 2);
    }

    #[test]
    fn test_empty_inputs() {
        let mut sampler = PathSampler::seeded(0);
        assert_eq!(
            sampler.sample_edges(&[], 3, &constraints(false, 10)).status,
            SampleStatus::Empty
        );
        let edges = vec![edge("A", "r", "B", 1)];
        assert_eq!(
            sampler.sample_edges(&edges, 0, &constraints(false, 10)).status,
            SampleStatus::Empty
        );
    }

    #[test]
    fn test_seeded_is_reproducible() {
        let edges: Vec<KnowledgeEdge> = (0..20)
            .map(|i| edge(&format!("n{}", i % 7), "r", &format!("n{}", (i * 3 + 1) % 7), i))
            .collect();
        let c = constraints(true, 1);
        let a = PathSampler::seeded(42).sample_edges(&edges, 3, &c);
        let b = PathSampler::seeded(42).sample_edges(&edges, 3, &c);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefers_image_edges() {
        let mut edges = vec![
            edge("A", "r", "B", 1),
            edge("B", "r", "C", 2),
            edge("X", "r", "Y", 3),
        ];
        edges.push(edge("Y", "shows", "Z", 1004).with_source_type(SourceType::Image));
        let c = constraints(true, 0).preferring(SourceType::Image);

        let mut hits = 0;
        for seed in 0..20 {
            let sample = PathSampler::seeded(seed).sample_edges(&edges, 2, &c);
            assert_eq!(sample.status, SampleStatus::Matched);
            if sample.preference_met {
                assert!(sample.contains_source_type(SourceType::Image));
                hits += 1;
            }
        }
        assert!(hits >= 15, "preferred source found in only {hits}/20 runs");
    }

    #[test]
    fn test_matched_path_beats_fallback_with_preferred_source() {
        // The image edge is isolated, so it only shows up in fallback samples.
        // A budget of two expansions matches from A and falls back from B or P.
        let edges = vec![
            edge("A", "r", "B", 1),
            edge("B", "r", "C", 2),
            edge("P", "shows", "Q", 1003).with_source_type(SourceType::Image),
        ];
        let config = SamplerConfig {
            prefer_attempts: 12,
            expansion_budget: 2,
            ..SamplerConfig::default()
        };
        let c = constraints(false, 10).preferring(SourceType::Image);

        let mut matched = 0;
        for seed in 0..30 {
            let sample = PathSampler::seeded(seed)
                .with_config(&config)
                .sample_edges(&edges, 2, &c);
            assert_eq!(sample.preference_met, sample.contains_source_type(SourceType::Image));
            if sample.status == SampleStatus::Matched {
                assert!(!sample.preference_met);
                assert!(is_chained(&sample.edges));
                matched += 1;
            }
        }
        assert!(matched >= 25, "matched path kept in only {matched}/30 runs");
    }
}
