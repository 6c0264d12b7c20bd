use super::machine::{transition, HopExit, RevisionKind, StepBounds, StepEvent, StepState};
use super::validate::{check_rules, ValidationFailure};
use super::{HopBrief, StepResult};
use crate::config::{EngineConfig, ModelRoster, StepPolicy};
use crate::error::OracleError;
use crate::judge::DifficultyJudge;
use crate::oracle::{ImageRef, Oracle, OracleRequest, Purpose, SamplingParams};
use crate::parse::AnswerKey;
use crate::prompts;
use crate::review::Reviewer;
use std::sync::Arc;
use tracing::{debug, info};

/// The hop a synthesizer settled on.
#[derive(Debug, Clone)]
pub struct HopOutcome {
    pub step: StepResult,
    pub exit: HopExit,
    /// Failures of the last validation round; empty when accepted.
    pub failed_checks: Vec<ValidationFailure>,
}

impl HopOutcome {
    /// The hop joins the chain.
    pub fn is_kept(&self) -> bool {
        self.exit != HopExit::Dropped
    }
}

/// Writes, checks and revises one hop at a time.
pub struct StepSynthesizer {
    oracle: Arc<dyn Oracle>,
    judge: Arc<DifficultyJudge>,
    reviewer: Arc<Reviewer>,
    policy: StepPolicy,
    models: ModelRoster,
    params: SamplingParams,
}

impl StepSynthesizer {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        judge: Arc<DifficultyJudge>,
        reviewer: Arc<Reviewer>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            oracle,
            judge,
            reviewer,
            policy: config.step.clone(),
            models: config.models.clone(),
            params: SamplingParams::new(config.temperature, config.max_tokens),
        }
    }

    pub fn policy(&self) -> &StepPolicy {
        &self.policy
    }

    /// Run the hop state machine to completion.
    ///
    /// Oracle failures in generation, revision or the text-only probe end
    /// the hop with an error. A failed visual verification call passes.
    pub async fn synthesize(
        &self,
        brief: &HopBrief<'_>,
        image: &ImageRef,
    ) -> Result<HopOutcome, OracleError> {
        let bounds = StepBounds::from(&self.policy);
        let mut step = StepResult::from_raw(brief.k, String::new(), brief.edge.cloned());
        let mut state = StepState::Generate;
        let mut failures: Vec<ValidationFailure> = Vec::new();

        let exit = loop {
            let event = match state {
                StepState::Done(exit) => break exit,
                StepState::Generate => {
                    step = self.generate(brief, image).await?;
                    StepEvent::Generated
                }
                StepState::Validate { .. } => {
                    failures = self.validate(&step, brief, image).await?;
                    match failures.first() {
                        None => StepEvent::Passed,
                        Some(ValidationFailure::UnverifiedVisualClaim) => StepEvent::VisualRejected,
                        Some(_) => StepEvent::Failed,
                    }
                }
                StepState::Revise { kind, .. } => {
                    step = self.revise(brief, image, &step, &failures, kind).await?;
                    StepEvent::Revised
                }
            };

            let next = transition(state, event, &bounds);
            debug!(k = brief.k, from = ?state, ?event, to = ?next, "hop transition");
            state = next;
        };

        if exit == HopExit::Accepted {
            failures.clear();
        }
        info!(
            k = brief.k,
            ?exit,
            failed = failures.len(),
            "hop finished"
        );
        Ok(HopOutcome {
            step,
            exit,
            failed_checks: failures,
        })
    }

    fn request(&self, purpose: Purpose, k: usize, prompt: String, image: &ImageRef) -> OracleRequest {
        OracleRequest::new(purpose, self.models.generator_for_hop(k), prompt)
            .with_image(image)
            .with_params(self.params)
    }

    async fn generate(&self, brief: &HopBrief<'_>, image: &ImageRef) -> Result<StepResult, OracleError> {
        let request = self.request(
            Purpose::StepGeneration,
            brief.k,
            prompts::step_generation(brief),
            image,
        );
        let raw = self.oracle.generate(request).await?;
        Ok(StepResult::from_raw(brief.k, raw, brief.edge.cloned()))
    }

    async fn revise(
        &self,
        brief: &HopBrief<'_>,
        image: &ImageRef,
        rejected: &StepResult,
        failures: &[ValidationFailure],
        kind: RevisionKind,
    ) -> Result<StepResult, OracleError> {
        let problems: Vec<String> = match kind {
            RevisionKind::VisualClaims => {
                vec![ValidationFailure::UnverifiedVisualClaim.instruction()]
            }
            RevisionKind::Rules => failures
                .iter()
                .map(|f| format!("{f}: {}", f.instruction()))
                .collect(),
        };
        let request = self.request(
            Purpose::StepRevision,
            brief.k,
            prompts::step_revision(brief, &rejected.raw, &problems),
            image,
        );
        let raw = self.oracle.generate(request).await?;
        Ok(StepResult::from_raw(brief.k, raw, brief.edge.cloned()))
    }

    /// Cheap rules, then the visual check, then the text-only probe. Each
    /// stage runs only when everything before it passed.
    async fn validate(
        &self,
        step: &StepResult,
        brief: &HopBrief<'_>,
        image: &ImageRef,
    ) -> Result<Vec<ValidationFailure>, OracleError> {
        let failures = check_rules(step, brief.previous, &self.policy, brief.require_cross_modal);
        if !failures.is_empty() {
            debug!(k = brief.k, ?failures, "cheap rules failed");
            return Ok(failures);
        }

        if self.policy.verify_visual_claims
            && !self.reviewer.verify_visual_claims(&step.stem(), image).await
        {
            return Ok(vec![ValidationFailure::UnverifiedVisualClaim]);
        }

        let Some(answer) = step.answer_letter().and_then(AnswerKey::single) else {
            return Ok(vec![ValidationFailure::MissingAnswer]);
        };
        let probe = self.judge.text_only_probe(&step.question, &answer).await?;
        if probe.correct {
            debug!(k = brief.k, "text-only probe solved the hop");
            return Ok(vec![ValidationFailure::TextOnlyShortcut]);
        }
        Ok(Vec::new())
    }
}
