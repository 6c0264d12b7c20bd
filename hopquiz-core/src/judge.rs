//! Difficulty grading against a tiered solver panel.
//!
//! ```text
//!   medium solver (with image)
//!        │ correct ──────────────► too easy, no strong calls
//!        ▼ wrong
//!   ┌─────────────┬──────────────┬─────────────┐   concurrent,
//!   │ strong      │ strong       │ strong      │   each under its
//!   │ with image  │ text-only    │ no image    │   own timeout
//!   └─────────────┴──────────────┴─────────────┘
//! ```
//!
//! A question is well calibrated when the strong solver needs the image to
//! get it right and the medium solver does not get it right at all.

use crate::config::{EngineConfig, ModelRoster};
use crate::error::OracleError;
use crate::oracle::{ImageRef, Oracle, OracleRequest, ProbeVariant, Purpose, SamplingParams, SolverTier};
use crate::parse::{self, AnswerKey};
use crate::prompts;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// One solver's attempt at a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeRecord {
    pub raw: String,
    pub pred: Option<AnswerKey>,
    pub correct: bool,
    /// Set when the call failed or timed out; such probes count as wrong.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProbeRecord {
    fn from_raw(raw: String, answer: &AnswerKey) -> Self {
        let pred = parse::parse_solver_answer(&raw);
        let correct = pred.as_ref() == Some(answer);
        Self {
            raw,
            pred,
            correct,
            error: None,
        }
    }

    fn failed(error: String) -> Self {
        Self {
            raw: String::new(),
            pred: None,
            correct: false,
            error: Some(error),
        }
    }
}

/// Coarse reading of a set of metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifficultyTier {
    /// The medium solver got it.
    TooEasy,
    /// Only the strong solver with the image got it.
    Calibrated,
    /// Solvable without the image.
    Leaky,
    /// Nobody got it.
    Unsolved,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DifficultyMetrics {
    pub medium_correct: bool,
    pub medium_partial_correct: bool,
    pub strong_correct: bool,
    pub strong_text_only_correct: bool,
    pub strong_no_image_correct: bool,
    pub text_only_veto: bool,
    pub difficulty_score: f32,
    pub num_hops: usize,
    pub cross_modal_used: bool,
    pub medium: Option<ProbeRecord>,
    pub strong: Option<ProbeRecord>,
    pub strong_text_only: Option<ProbeRecord>,
    pub strong_no_image: Option<ProbeRecord>,
}

impl DifficultyMetrics {
    /// Solvable by a strong solver without seeing the image.
    pub fn has_shortcut(&self) -> bool {
        self.strong_text_only_correct || self.strong_no_image_correct
    }

    pub fn tier(&self) -> DifficultyTier {
        if self.medium_correct {
            DifficultyTier::TooEasy
        } else if self.has_shortcut() {
            DifficultyTier::Leaky
        } else if self.strong_correct {
            DifficultyTier::Calibrated
        } else {
            DifficultyTier::Unsolved
        }
    }
}

/// 1.0 for a calibrated question, 0.5 when the strong solver is right but
/// the question is easy or leaky, 0.0 when the strong solver is wrong.
pub fn difficulty_score(
    strong_correct: bool,
    medium_correct: bool,
    text_only_correct: bool,
    no_image_correct: bool,
) -> f32 {
    if !strong_correct {
        0.0
    } else if !medium_correct && !text_only_correct && !no_image_correct {
        1.0
    } else {
        0.5
    }
}

/// A question to grade.
#[derive(Debug, Clone, Copy)]
pub struct GradeRequest<'a> {
    pub question: &'a str,
    pub answer: &'a AnswerKey,
    pub image: &'a ImageRef,
    pub num_hops: usize,
    pub cross_modal_used: bool,
}

pub struct DifficultyJudge {
    oracle: Arc<dyn Oracle>,
    medium_model: String,
    strong_model: String,
    params: SamplingParams,
    probe_timeout: Duration,
}

impl DifficultyJudge {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        medium_model: impl Into<String>,
        strong_model: impl Into<String>,
    ) -> Self {
        Self {
            oracle,
            medium_model: medium_model.into(),
            strong_model: strong_model.into(),
            params: SamplingParams::default(),
            probe_timeout: Duration::from_secs(180),
        }
    }

    pub fn from_config(oracle: Arc<dyn Oracle>, config: &EngineConfig) -> Self {
        let ModelRoster {
            solve_medium,
            solve_strong,
            ..
        } = &config.models;
        Self::new(oracle, solve_medium, solve_strong)
            .with_params(SamplingParams::new(config.temperature, config.max_tokens))
            .with_probe_timeout(config.probe_timeout)
    }

    pub fn with_params(mut self, params: SamplingParams) -> Self {
        self.params = params;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn solve_request(
        &self,
        tier: SolverTier,
        variant: ProbeVariant,
        question: &str,
        image: Option<&ImageRef>,
    ) -> OracleRequest {
        let model = match tier {
            SolverTier::Medium => &self.medium_model,
            SolverTier::Strong => &self.strong_model,
        };
        let image = match variant {
            ProbeVariant::WithImage => image,
            ProbeVariant::TextOnly | ProbeVariant::NoImage => None,
        };
        OracleRequest::new(Purpose::Solve { tier, variant }, model, prompts::solver(question, variant))
            .with_optional_image(image)
            .with_params(self.params)
    }

    /// Strong probe whose failure or timeout counts as a wrong answer.
    async fn soft_probe(&self, request: OracleRequest, answer: &AnswerKey) -> ProbeRecord {
        let purpose = request.purpose;
        match tokio::time::timeout(self.probe_timeout, self.oracle.generate(request)).await {
            Ok(Ok(raw)) => ProbeRecord::from_raw(raw, answer),
            Ok(Err(e)) => {
                warn!(%purpose, error = %e, "solver probe failed, counting as incorrect");
                ProbeRecord::failed(e.to_string())
            }
            Err(_) => {
                warn!(%purpose, timeout = ?self.probe_timeout, "solver probe timed out, counting as incorrect");
                ProbeRecord::failed(format!("timed out after {:?}", self.probe_timeout))
            }
        }
    }

    /// Grade a question against the solver panel.
    ///
    /// A failing medium solver fails the whole call; strong probe failures
    /// are recorded on the probe and count as wrong answers.
    pub async fn grade(&self, request: &GradeRequest<'_>) -> Result<DifficultyMetrics, OracleError> {
        let answer = request.answer;
        let medium_raw = self
            .oracle
            .generate(self.solve_request(
                SolverTier::Medium,
                ProbeVariant::WithImage,
                request.question,
                Some(request.image),
            ))
            .await?;
        let medium = ProbeRecord::from_raw(medium_raw, answer);

        let mut metrics = DifficultyMetrics {
            medium_correct: medium.correct,
            medium_partial_correct: medium
                .pred
                .as_ref()
                .map(|p| p.is_partial_of(answer))
                .unwrap_or(false),
            num_hops: request.num_hops,
            cross_modal_used: request.cross_modal_used,
            ..DifficultyMetrics::default()
        };

        if medium.correct {
            debug!(answer = %answer, "medium solver correct, skipping strong probes");
            metrics.medium = Some(medium);
            return Ok(metrics);
        }
        metrics.medium = Some(medium);

        let (strong, text_only, no_image) = futures::future::join3(
            self.soft_probe(
                self.solve_request(
                    SolverTier::Strong,
                    ProbeVariant::WithImage,
                    request.question,
                    Some(request.image),
                ),
                answer,
            ),
            self.soft_probe(
                self.solve_request(SolverTier::Strong, ProbeVariant::TextOnly, request.question, None),
                answer,
            ),
            self.soft_probe(
                self.solve_request(SolverTier::Strong, ProbeVariant::NoImage, request.question, None),
                answer,
            ),
        )
        .await;

        metrics.strong_correct = strong.correct;
        metrics.strong_text_only_correct = text_only.correct;
        metrics.strong_no_image_correct = no_image.correct;
        metrics.text_only_veto = text_only.correct;
        metrics.difficulty_score =
            difficulty_score(strong.correct, false, text_only.correct, no_image.correct);
        metrics.strong = Some(strong);
        metrics.strong_text_only = Some(text_only);
        metrics.strong_no_image = Some(no_image);

        info!(
            strong = metrics.strong_correct,
            text_only = metrics.strong_text_only_correct,
            no_image = metrics.strong_no_image_correct,
            score = metrics.difficulty_score,
            "graded question"
        );
        Ok(metrics)
    }

    /// Ask the strong solver without the image, told to use text alone.
    pub async fn text_only_probe(
        &self,
        question: &str,
        answer: &AnswerKey,
    ) -> Result<ProbeRecord, OracleError> {
        let request =
            self.solve_request(SolverTier::Strong, ProbeVariant::TextOnly, question, None);
        let raw = self.oracle.generate(request).await?;
        Ok(ProbeRecord::from_raw(raw, answer))
    }

    /// How the medium solver reached the right answer.
    pub async fn medium_rationale(
        &self,
        question: &str,
        answer: &AnswerKey,
        image: &ImageRef,
    ) -> Result<String, OracleError> {
        let request = OracleRequest::new(
            Purpose::MediumRationale,
            &self.medium_model,
            prompts::medium_rationale(question, answer),
        )
        .with_image(image)
        .with_params(self.params);
        let raw = self.oracle.generate(request).await?;
        Ok(raw.trim().to_string())
    }
}
