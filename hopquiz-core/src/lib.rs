//! Adversarial cross-modal multi-hop question synthesis.
//!
//! This crate provides:
//! - A cached fact graph extracted from a text and an image
//! - Constrained multi-hop path sampling over that graph
//! - Per-hop question synthesis with validation and bounded revision
//! - A difficulty judge built on a panel of solver probes
//! - Final composition with a refine loop and independent review
//! - Episode and batch orchestration writing accepted questions to a sink
//!
//! # Quick Start
//!
//! ```ignore
//! use hopquiz_core::{Engine, ImageRef, JsonArraySink};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::from_env()?;
//!     let text = tokio::fs::read_to_string("paper.md").await?;
//!     let image = ImageRef::from_path("figure2.png").await?;
//!
//!     let sink = JsonArraySink::new("dataset.json");
//!     let report = engine.run_batch(&text, &image, &sink).await?;
//!     println!("{} of {} episodes accepted", report.accepted, report.attempts);
//!     Ok(())
//! }
//! ```

pub mod compose;
pub mod config;
pub mod episode;
pub mod error;
pub mod graph;
pub mod judge;
pub mod mcq;
pub mod oracle;
pub mod parse;
pub mod prompts;
pub mod quality;
pub mod review;
pub mod sampler;
pub mod sink;
pub mod step;
pub mod testing;

// Primary public API
pub use compose::{Composition, FinalComposer, RefineExit, StageResult};
pub use config::{EngineConfig, RetryPolicy};
pub use episode::{BatchReport, Engine, EpisodeInput, EpisodeResult, TerminationReason};
pub use error::{EngineError, OracleError, Result};
pub use graph::{FactGraph, FactGraphStore, InMemoryEdgeCache, JsonFileEdgeCache, KnowledgeEdge, SourceType};
pub use judge::{DifficultyJudge, DifficultyMetrics, DifficultyTier};
pub use oracle::{ClaudeOracle, ImageRef, Oracle, OracleRequest, Purpose};
pub use sampler::{PathSample, PathSampler, SampleConstraints, SampleStatus};
pub use sink::{DatasetRecord, DatasetSink, JsonArraySink, MemorySink};
pub use step::{HopBrief, StepResult, StepSynthesizer};
pub use testing::{ScriptedOracle, ScriptedReply};
