//! Hop synthesis.
//!
//! One hop is one sub-question tied to one sampled edge (or, for the anchor
//! hop `k = 0`, to the image alone). Each hop runs a small state machine:
//!
//! ```text
//!   Generate ──► Validate ──pass──────────────► Done(Accepted)
//!                  │  ▲
//!          fail    │  │ revised
//!                  ▼  │
//!                 Revise ──bound reached──────► Done(AcceptedAfterExhaustion)
//!                        ──visual bound reached► Done(Dropped)
//! ```

mod machine;
mod synthesizer;
mod validate;

pub use machine::{transition, HopExit, RevisionKind, StepBounds, StepEvent, StepState};
pub use synthesizer::{HopOutcome, StepSynthesizer};
pub use validate::{check_rules, ValidationFailure};

use crate::graph::{FactGraph, KnowledgeEdge, SourceType};
use crate::mcq;
use crate::parse::{self, Parsed};
use rand::seq::{IteratorRandom, SliceRandom};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which inputs a hop's answer relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Image,
    Text,
    Both,
}

impl Modality {
    /// Image only or text only.
    pub fn is_pure(self) -> bool {
        !matches!(self, Modality::Both)
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Image => write!(f, "image"),
            Modality::Text => write!(f, "text"),
            Modality::Both => write!(f, "both"),
        }
    }
}

impl FromStr for Modality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "image" | "visual" | "图像" | "图片" => Ok(Modality::Image),
            "text" | "文本" => Ok(Modality::Text),
            "both" | "mixed" | "image+text" | "text+image" | "两者" => Ok(Modality::Both),
            other => Err(format!("unknown modality: {other}")),
        }
    }
}

/// An accepted (or best-effort) hop.
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub k: usize,
    /// Stem plus option block; empty when the generator gave none.
    pub question: String,
    pub answer: Parsed<char>,
    pub answer_text: Option<String>,
    pub evidence: Option<String>,
    pub modal_use: Parsed<Modality>,
    pub cross_modal_bridge: bool,
    pub reasoning: Option<String>,
    /// Generator output the fields were read from.
    pub raw: String,
    /// The sampled edge this hop is tied to; `None` for the anchor hop.
    pub edge: Option<KnowledgeEdge>,
}

impl StepResult {
    /// Read a hop from generator output.
    pub fn from_raw(k: usize, raw: String, edge: Option<KnowledgeEdge>) -> Self {
        let candidate = parse::parse_step_candidate(&raw);
        Self {
            k,
            question: candidate.question.unwrap_or_default(),
            answer: candidate.answer,
            answer_text: candidate.answer_text,
            evidence: candidate.evidence,
            modal_use: candidate.modal_use,
            cross_modal_bridge: candidate.cross_modal_bridge,
            reasoning: candidate.reasoning,
            raw,
            edge,
        }
    }

    pub fn answer_letter(&self) -> Option<char> {
        self.answer.valid().copied()
    }

    pub fn modality(&self) -> Option<Modality> {
        self.modal_use.valid().copied()
    }

    pub fn stem(&self) -> String {
        mcq::stem_of(&self.question)
    }
}

/// Everything the generator needs to write hop `k`.
#[derive(Debug, Clone)]
pub struct HopBrief<'a> {
    pub k: usize,
    pub edge: Option<&'a KnowledgeEdge>,
    /// Another edge from the same head, offered as a contrast.
    pub branch: Option<&'a KnowledgeEdge>,
    pub previous: Option<&'a StepResult>,
    pub distractors: Vec<String>,
    pub source_label: &'static str,
    pub visual_summary: &'a str,
    pub require_cross_modal: bool,
    pub feedback: &'a str,
    /// Final question of the previous episode, extended by the anchor hop.
    pub previous_final_question: Option<&'a str>,
}

impl<'a> HopBrief<'a> {
    pub fn new(k: usize, edge: Option<&'a KnowledgeEdge>) -> Self {
        Self {
            k,
            edge,
            branch: None,
            previous: None,
            distractors: Vec::new(),
            source_label: source_label(edge.map(|e| e.source_type)),
            visual_summary: "",
            require_cross_modal: false,
            feedback: "",
            previous_final_question: None,
        }
    }

    pub fn with_branch(mut self, branch: Option<&'a KnowledgeEdge>) -> Self {
        self.branch = branch;
        self
    }

    pub fn with_previous(mut self, previous: Option<&'a StepResult>) -> Self {
        self.previous = previous;
        self
    }

    pub fn with_distractors(mut self, distractors: Vec<String>) -> Self {
        self.distractors = distractors;
        self
    }

    pub fn with_visual_summary(mut self, summary: &'a str) -> Self {
        self.visual_summary = summary;
        self
    }

    pub fn with_cross_modal(mut self, required: bool) -> Self {
        self.require_cross_modal = required;
        self
    }

    pub fn with_feedback(mut self, feedback: &'a str) -> Self {
        self.feedback = feedback;
        self
    }

    pub fn with_previous_final_question(mut self, question: Option<&'a str>) -> Self {
        self.previous_final_question = question;
        self
    }
}

fn source_label(source_type: Option<SourceType>) -> &'static str {
    match source_type {
        Some(SourceType::Image) => "image visual analysis",
        Some(SourceType::Text) => "reference text",
        None => "image",
    }
}

/// Up to `count` entities from the graph's pool, never the edge's tail.
pub fn pick_distractors<R: Rng>(
    graph: &FactGraph,
    edge: &KnowledgeEdge,
    count: usize,
    rng: &mut R,
) -> Vec<String> {
    let pool: Vec<&str> = graph
        .entity_pool()
        .into_iter()
        .filter(|entity| *entity != edge.tail)
        .collect();
    pool.choose_multiple(rng, count)
        .map(|entity| entity.to_string())
        .collect()
}

/// A random contrast edge sharing `edge`'s head.
pub fn pick_branch<'g, R: Rng>(
    graph: &'g FactGraph,
    edge: &'g KnowledgeEdge,
    rng: &mut R,
) -> Option<&'g KnowledgeEdge> {
    graph.branch_candidates(edge).choose(rng)
}
