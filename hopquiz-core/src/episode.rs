//! Episode orchestration.
//!
//! One episode turns a (text, image) pair into at most one question:
//!
//! ```text
//!   image ──► visual knowledge ─┐
//!                               ├─► merged FactGraph ──► PathSampler
//!   text ───► text edges ───────┘                           │
//!                                                           ▼
//!   anchor hop (k = 0) ──► hop 1 ──► ... ──► hop n ──► FinalComposer
//!                                                           │
//!                                        reflection ◄───────┘
//! ```
//!
//! Oracle exhaustion anywhere ends the episode early with
//! [`TerminationReason::OracleFailure`]; whatever was built is reported.

use crate::compose::{Composition, FinalComposer, RefineExit, StageResult};
use crate::config::EngineConfig;
use crate::error::{OracleError, Result};
use crate::graph::{
    merge_visual_edges, EdgeCache, FactGraph, FactGraphStore, InMemoryEdgeCache, JsonFileEdgeCache,
    SourceType,
};
use crate::judge::{DifficultyJudge, DifficultyMetrics};
use crate::oracle::{ClaudeOracle, ImageRef, Oracle, OracleRequest, Purpose, RetryingOracle, SamplingParams};
use crate::parse::ReviewVerdict;
use crate::prompts;
use crate::review::Reviewer;
use crate::sampler::{PathSample, PathSampler, SampleConstraints, SampleStatus};
use crate::sink::{DatasetRecord, DatasetSink};
use crate::step::{pick_branch, pick_distractors, HopBrief, HopOutcome, StepResult, StepSynthesizer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Source material and carry-over from the previous episode.
#[derive(Debug, Clone)]
pub struct EpisodeInput {
    pub text: String,
    pub image: ImageRef,
    /// Reflection feedback from the previous episode.
    pub feedback: String,
    pub previous_final_question: Option<String>,
}

impl EpisodeInput {
    pub fn new(text: impl Into<String>, image: ImageRef) -> Self {
        Self {
            text: text.into(),
            image,
            feedback: String::new(),
            previous_final_question: None,
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = feedback.into();
        self
    }

    pub fn with_previous_final_question(mut self, question: Option<String>) -> Self {
        self.previous_final_question = question;
        self
    }
}

/// Why an episode stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// The refine loop ran to one of its exits.
    Completed,
    /// Every hop was dropped; nothing to compose.
    EmptyChain,
    /// An oracle call failed after all retries.
    OracleFailure(String),
}

/// Everything an episode produced.
#[derive(Debug, Clone)]
pub struct EpisodeResult {
    pub id: Uuid,
    pub hops: Vec<StepResult>,
    pub path: Option<PathSample>,
    pub final_stage: Option<StageResult>,
    pub metrics: Option<DifficultyMetrics>,
    pub metrics_stale: bool,
    pub review: Option<ReviewVerdict>,
    pub exit: Option<RefineExit>,
    pub termination: TerminationReason,
    /// Advice for the next episode; empty when reflection failed or did
    /// not run.
    pub feedback: String,
    pub failed_checks: Vec<String>,
}

impl EpisodeResult {
    /// Medium solver wrong, no image-free shortcut, review approved, and
    /// metrics describing the final candidate.
    pub fn is_accepted(&self) -> bool {
        let calibrated = self
            .metrics
            .as_ref()
            .map(|m| !m.medium_correct && !m.has_shortcut())
            .unwrap_or(false);
        self.termination == TerminationReason::Completed
            && self.exit == Some(RefineExit::Approved)
            && !self.metrics_stale
            && calibrated
            && self.review.as_ref().map(ReviewVerdict::approved).unwrap_or(false)
    }

    /// The dataset record for an accepted episode.
    pub fn to_record(&self) -> Option<DatasetRecord> {
        if !self.is_accepted() {
            return None;
        }
        let stage = self.final_stage.as_ref()?;
        let metrics = self.metrics.clone()?;
        let review = self.review.as_ref()?;
        Some(DatasetRecord {
            question: stage.question.clone(),
            answer: stage.answer_key()?.clone(),
            reasoning: stage.reasoning.clone(),
            tier: metrics.tier(),
            num_hops: metrics.num_hops,
            difficulty_metrics: metrics,
            review_decision: review.decision,
            review_raw: review.raw.clone(),
        })
    }
}

/// Counters for a batch run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub attempts: usize,
    pub accepted: usize,
    pub oracle_failures: usize,
}

/// What an episode has built so far.
#[derive(Default)]
struct Progress {
    hops: Vec<StepResult>,
    path: Option<PathSample>,
    composition: Option<Composition>,
    failed_checks: Vec<String>,
}

impl Progress {
    fn record_hop(&mut self, outcome: HopOutcome) {
        let k = outcome.step.k;
        self.failed_checks
            .extend(outcome.failed_checks.iter().map(|f| format!("hop {k}: {f}")));
        if outcome.is_kept() {
            self.hops.push(outcome.step);
        } else {
            self.failed_checks.push(format!("hop {k}: dropped"));
        }
    }
}

/// The synthesis engine: all components wired to one oracle.
pub struct Engine {
    config: EngineConfig,
    oracle: Arc<dyn Oracle>,
    store: FactGraphStore,
    steps: StepSynthesizer,
    composer: FinalComposer,
    sampler: PathSampler,
}

impl Engine {
    /// Wire the engine. Every call to `oracle` goes through the configured
    /// retry policy.
    pub fn new(config: EngineConfig, oracle: Arc<dyn Oracle>, cache: Arc<dyn EdgeCache>) -> Self {
        let oracle: Arc<dyn Oracle> = Arc::new(RetryingOracle::new(oracle, config.retry.clone()));

        let store = FactGraphStore::new(oracle.clone(), cache, config.extraction.clone())
            .with_vision_model(&config.models.vision_knowledge)
            .with_temperature(config.temperature);
        let judge = Arc::new(DifficultyJudge::from_config(oracle.clone(), &config));
        let reviewer = Arc::new(Reviewer::from_config(oracle.clone(), &config));
        let steps = StepSynthesizer::new(oracle.clone(), judge.clone(), reviewer.clone(), &config);
        let composer = FinalComposer::new(oracle.clone(), judge, reviewer, &config);
        let sampler = PathSampler::from_entropy().with_config(&config.sampler);

        Self {
            config,
            oracle,
            store,
            steps,
            composer,
            sampler,
        }
    }

    /// Engine on the Claude API, configured from the environment.
    pub fn from_env() -> Result<Self> {
        let config = EngineConfig::from_env()?;
        let oracle = Arc::new(ClaudeOracle::from_env()?);
        let cache: Arc<dyn EdgeCache> = match &config.cache_path {
            Some(path) => Arc::new(JsonFileEdgeCache::new(path)),
            None => Arc::new(InMemoryEdgeCache::new()),
        };
        Ok(Self::new(config, oracle, cache))
    }

    /// Replace the sampler, e.g. with a seeded one.
    pub fn with_sampler(mut self, sampler: PathSampler) -> Self {
        self.sampler = sampler.with_config(&self.config.sampler);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &FactGraphStore {
        &self.store
    }

    /// Run one episode. Never fails; failures are reported in the result.
    pub async fn run_episode(&mut self, input: &EpisodeInput) -> EpisodeResult {
        let id = Uuid::new_v4();
        let mut progress = Progress::default();

        let termination = match self.drive(input, &mut progress).await {
            Ok(termination) => termination,
            Err(e) => {
                warn!(%id, error = %e, hops = progress.hops.len(), "episode aborted by oracle failure");
                TerminationReason::OracleFailure(e.to_string())
            }
        };

        let feedback = match &progress.composition {
            Some(composition) if termination == TerminationReason::Completed => {
                self.reflect(&progress.hops, composition).await
            }
            _ => String::new(),
        };

        let Progress {
            hops,
            path,
            composition,
            failed_checks,
        } = progress;

        let (final_stage, metrics, metrics_stale, review, exit) = match composition {
            Some(c) => (Some(c.stage), c.metrics, c.metrics_stale, c.review, Some(c.exit)),
            None => (None, None, false, None, None),
        };
        let result = EpisodeResult {
            id,
            hops,
            path,
            final_stage,
            metrics,
            metrics_stale,
            review,
            exit,
            termination,
            feedback,
            failed_checks,
        };

        info!(
            %id,
            hops = result.hops.len(),
            termination = ?result.termination,
            exit = ?result.exit,
            accepted = result.is_accepted(),
            failed_checks = result.failed_checks.len(),
            "episode finished"
        );
        result
    }

    async fn drive(
        &mut self,
        input: &EpisodeInput,
        progress: &mut Progress,
    ) -> std::result::Result<TerminationReason, OracleError> {
        let visual = self.store.visual_knowledge(&input.image).await;
        let text_edges = self.store.edges_for(&input.text).await;
        let graph = FactGraph::from_edges(merge_visual_edges(
            text_edges.to_vec(),
            visual.edges.clone(),
        ));
        info!(
            edges = graph.len(),
            heads = graph.heads().len(),
            visual_edges = visual.edges.len(),
            "fact graph ready"
        );

        let anchor = HopBrief::new(0, None)
            .with_visual_summary(&visual.summary)
            .with_feedback(&input.feedback)
            .with_previous_final_question(input.previous_final_question.as_deref());
        let outcome = self.steps.synthesize(&anchor, &input.image).await?;
        progress.record_hop(outcome);

        let mut constraints = SampleConstraints::from_config(&self.config.sampler);
        if graph.has_source_type(SourceType::Image) {
            constraints = constraints.preferring(SourceType::Image);
        }
        let path = self
            .sampler
            .sample(&graph, self.config.episode.target_hops(), &constraints);
        match path.status {
            SampleStatus::Matched => {}
            SampleStatus::Fallback => progress
                .failed_checks
                .push("path sampling fell back to unconstrained edges".to_string()),
            SampleStatus::Empty => progress
                .failed_checks
                .push("no edges to sample a path from".to_string()),
        }
        if !path.preference_met {
            debug!("sampled path has no image edge");
        }
        progress.path = Some(path.clone());

        for (i, edge) in path.edges.iter().enumerate() {
            let k = i + 1;
            let branch = pick_branch(&graph, edge, self.sampler.rng_mut());
            let distractors = pick_distractors(
                &graph,
                edge,
                self.config.step.distractor_count,
                self.sampler.rng_mut(),
            );
            let brief = HopBrief::new(k, Some(edge))
                .with_branch(branch)
                .with_previous(progress.hops.last())
                .with_distractors(distractors)
                .with_visual_summary(&visual.summary)
                .with_cross_modal(self.config.step.require_cross_modal)
                .with_feedback(&input.feedback);
            let outcome = self.steps.synthesize(&brief, &input.image).await?;
            progress.record_hop(outcome);
        }

        if progress.hops.is_empty() {
            return Ok(TerminationReason::EmptyChain);
        }

        let composition = self
            .composer
            .compose(&progress.hops, &input.feedback, &input.image)
            .await?;
        if composition.exit == RefineExit::Exhausted {
            let last = composition
                .triggers
                .last()
                .map(|t| format!("{t:?}"))
                .unwrap_or_default();
            progress
                .failed_checks
                .push(format!("final: refinements exhausted ({last})"));
        }
        if composition.metrics_stale {
            progress
                .failed_checks
                .push("final: metrics describe an earlier candidate".to_string());
        }
        progress.composition = Some(composition);
        Ok(TerminationReason::Completed)
    }

    /// Advice for the next episode. Empty when the call fails.
    async fn reflect(&self, hops: &[StepResult], composition: &Composition) -> String {
        let prompt = prompts::reflection(
            hops,
            &composition.stage.question,
            composition.metrics.as_ref(),
            composition.review.as_ref(),
        );
        let request = OracleRequest::new(Purpose::Reflection, &self.config.models.judge, prompt)
            .with_params(SamplingParams::new(self.config.temperature, self.config.max_tokens));
        match self.oracle.generate(request).await {
            Ok(raw) => raw.trim().to_string(),
            Err(e) => {
                warn!(error = %e, "reflection failed");
                String::new()
            }
        }
    }

    /// Run episodes until `target_questions` are accepted or
    /// `max_attempts` episodes have run. Accepted records go to `sink`.
    pub async fn run_batch(
        &mut self,
        text: &str,
        image: &ImageRef,
        sink: &dyn DatasetSink,
    ) -> Result<BatchReport> {
        let settings = self.config.episode.clone();
        let mut report = BatchReport::default();
        let mut feedback = String::new();
        let mut previous_final: Option<String> = None;

        while report.accepted < settings.target_questions && report.attempts < settings.max_attempts {
            report.attempts += 1;
            let input = EpisodeInput::new(text, image.clone())
                .with_feedback(feedback.clone())
                .with_previous_final_question(previous_final.clone());
            let result = self.run_episode(&input).await;

            if let Some(record) = result.to_record() {
                sink.append(&record).await?;
                report.accepted += 1;
            }
            if matches!(result.termination, TerminationReason::OracleFailure(_)) {
                report.oracle_failures += 1;
            }
            if !result.feedback.is_empty() {
                feedback = result.feedback;
            }
            if let Some(stage) = result.final_stage.filter(|s| !s.question.is_empty()) {
                previous_final = Some(stage.question);
            }

            info!(
                attempt = report.attempts,
                accepted = report.accepted,
                target = settings.target_questions,
                "batch progress"
            );
        }
        Ok(report)
    }
}
