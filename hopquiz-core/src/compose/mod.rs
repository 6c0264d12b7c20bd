//! Final question composition.
//!
//! The hop chain is compressed into one question, which then runs a bounded
//! refine loop:
//!
//! ```text
//!   Compose ──► Check ─┬─ structure broken ──┐
//!                 ▲    ├─ text-only veto ────┤
//!                 │    ├─ too easy ──────────┼──► Refine (bounded)
//!                 │    ├─ review rejected ───┘        │
//!                 │    ├─ review approved ──► Done    │
//!                 │    └─ no decision ──────► Done    │
//!                 └───────────────────────────────────┘
//! ```
//!
//! Every draft and refinement has its stem rewritten to hide surface cues
//! before it is checked. The options are kept verbatim, and a rewrite that
//! fails or drops the image anchor is discarded.
//!
//! The result carries the metrics of the last grading performed. If the
//! candidate changed after that grading, they are flagged stale, not
//! recomputed.

mod machine;

pub use machine::{transition, RefineEvent, RefineExit, RefineState, RefineTrigger};

use crate::config::{ComposerPolicy, EngineConfig};
use crate::error::OracleError;
use crate::judge::{DifficultyJudge, DifficultyMetrics, GradeRequest};
use crate::mcq::{OptionBlock, QuestionMode};
use crate::oracle::{ImageRef, Oracle, OracleRequest, Purpose, SamplingParams};
use crate::parse::{self, AnswerKey, Parsed, ReviewVerdict};
use crate::prompts;
use crate::quality::has_visual_anchor;
use crate::review::Reviewer;
use crate::step::StepResult;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A composed final candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct StageResult {
    pub question: String,
    pub answer: Parsed<AnswerKey>,
    pub reasoning: Option<String>,
    pub raw: String,
}

impl StageResult {
    pub fn from_raw(raw: String) -> Self {
        let draft = parse::parse_stage_draft(&raw);
        Self {
            question: draft.question.unwrap_or_default(),
            answer: draft.answer,
            reasoning: draft.reasoning,
            raw,
        }
    }

    pub fn answer_key(&self) -> Option<&AnswerKey> {
        self.answer.valid()
    }
}

/// Outcome of the refine loop.
#[derive(Debug, Clone)]
pub struct Composition {
    pub stage: StageResult,
    pub metrics: Option<DifficultyMetrics>,
    /// The candidate changed after `metrics` were taken.
    pub metrics_stale: bool,
    pub review: Option<ReviewVerdict>,
    pub exit: RefineExit,
    /// Triggers in the order they fired.
    pub triggers: Vec<RefineTrigger>,
}

enum CheckOutcome {
    Trigger(RefineTrigger, String),
    Approved,
    Inconclusive,
}

/// Metrics tagged with the candidate version they describe.
struct Graded {
    version: u32,
    metrics: DifficultyMetrics,
}

pub struct FinalComposer {
    oracle: Arc<dyn Oracle>,
    judge: Arc<DifficultyJudge>,
    reviewer: Arc<Reviewer>,
    policy: ComposerPolicy,
    model: String,
    obfuscation_model: String,
    params: SamplingParams,
}

impl FinalComposer {
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
            policy: config.composer.clone(),
            model: config.models.judge.clone(),
            obfuscation_model: config.models.obfuscation.clone(),
            params: SamplingParams::new(config.temperature, config.max_tokens),
        }
    }

    pub fn mode(&self) -> QuestionMode {
        self.policy.mode
    }

    /// Compose a final question from `chain` and refine it.
    pub async fn compose(
        &self,
        chain: &[StepResult],
        feedback: &str,
        image: &ImageRef,
    ) -> Result<Composition, OracleError> {
        let max = self.policy.max_refinements;
        let mut stage = StageResult::from_raw(String::new());
        let mut version = 0u32;
        let mut state = RefineState::Compose;

        let mut graded: Option<Graded> = None;
        let mut review: Option<ReviewVerdict> = None;
        let mut triggers = Vec::new();
        let mut details = String::new();

        let exit = loop {
            let event = match state {
                RefineState::Done(exit) => break exit,
                RefineState::Compose => {
                    let drafted = self.draft(chain, feedback, image).await?;
                    stage = self.obfuscate(drafted).await;
                    version += 1;
                    RefineEvent::Composed
                }
                RefineState::Check { .. } => {
                    match self
                        .check(&stage, version, chain, image, &mut graded, &mut review)
                        .await?
                    {
                        CheckOutcome::Trigger(trigger, found) => {
                            info!(?trigger, "final candidate needs refinement");
                            triggers.push(trigger);
                            details = found;
                            RefineEvent::Triggered(trigger)
                        }
                        CheckOutcome::Approved => RefineEvent::Approved,
                        CheckOutcome::Inconclusive => RefineEvent::Inconclusive,
                    }
                }
                RefineState::Refine { trigger, .. } => {
                    let refined = self.refine(&stage, trigger, &details, image).await?;
                    stage = self.obfuscate(refined).await;
                    version += 1;
                    RefineEvent::Refined
                }
            };

            let next = transition(state, event, max);
            debug!(from = ?state, ?event, to = ?next, "refine transition");
            state = next;
        };

        let metrics_stale = graded.as_ref().map(|g| g.version != version).unwrap_or(false);
        if metrics_stale {
            warn!("final candidate changed after its last grading; metrics are stale");
        }
        self.log_option_bias(&stage);
        info!(?exit, refinements = triggers.len(), "composition finished");

        Ok(Composition {
            stage,
            metrics: graded.map(|g| g.metrics),
            metrics_stale,
            review,
            exit,
            triggers,
        })
    }

    fn request(&self, purpose: Purpose, prompt: String, image: &ImageRef) -> OracleRequest {
        OracleRequest::new(purpose, &self.model, prompt)
            .with_image(image)
            .with_params(self.params)
    }

    async fn draft(
        &self,
        chain: &[StepResult],
        feedback: &str,
        image: &ImageRef,
    ) -> Result<StageResult, OracleError> {
        let prompt = prompts::final_compose(chain, feedback, self.policy.mode);
        let raw = self
            .oracle
            .generate(self.request(Purpose::FinalCompose, prompt, image))
            .await?;
        Ok(StageResult::from_raw(raw))
    }

    async fn refine(
        &self,
        stage: &StageResult,
        trigger: RefineTrigger,
        details: &str,
        image: &ImageRef,
    ) -> Result<StageResult, OracleError> {
        let prompt = prompts::final_revise(&stage.raw, instruction(trigger), details, self.policy.mode);
        let raw = self
            .oracle
            .generate(self.request(Purpose::FinalRevise, prompt, image))
            .await?;
        Ok(StageResult::from_raw(raw))
    }

    /// Rewrite the stem of `stage`, keeping its options and answer.
    ///
    /// The candidate comes back untouched when it has no option block, the
    /// call fails, the reply has no usable `<stem>`, or the rewrite loses
    /// the image anchor the original stem had.
    async fn obfuscate(&self, stage: StageResult) -> StageResult {
        let Some(block) = OptionBlock::parse(&stage.question) else {
            debug!("no option block, skipping obfuscation");
            return stage;
        };
        let request = OracleRequest::new(
            Purpose::Obfuscate,
            &self.obfuscation_model,
            prompts::obfuscation(&block.stem),
        )
        .with_params(self.params);

        let raw = match self.oracle.generate(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "obfuscation failed, keeping original stem");
                return stage;
            }
        };
        let Some(stem) = parse::extract_tag(&raw, "stem") else {
            warn!("obfuscation reply has no stem, keeping original");
            return stage;
        };
        if OptionBlock::parse(&stem).is_some() {
            warn!("obfuscated stem carries options, keeping original");
            return stage;
        }
        if has_visual_anchor(&block.stem) && !has_visual_anchor(&stem) {
            warn!("obfuscated stem lost its image anchor, keeping original");
            return stage;
        }

        let question = block.with_stem(stem).render();
        debug!(before = %block.stem, after = %question, "stem obfuscated");
        StageResult {
            raw: stage.raw.replacen(&stage.question, &question, 1),
            question,
            ..stage
        }
    }

    async fn check(
        &self,
        stage: &StageResult,
        version: u32,
        chain: &[StepResult],
        image: &ImageRef,
        graded: &mut Option<Graded>,
        review: &mut Option<ReviewVerdict>,
    ) -> Result<CheckOutcome, OracleError> {
        let problems = structure_problems(stage, self.policy.mode);
        let Some(answer) = stage.answer_key().filter(|_| problems.is_empty()) else {
            return Ok(CheckOutcome::Trigger(RefineTrigger::Structure, problems.join("\n")));
        };

        let current = match graded.take() {
            Some(g) if g.version == version => g,
            _ => {
                let request = GradeRequest {
                    question: &stage.question,
                    answer,
                    image,
                    num_hops: chain.len(),
                    cross_modal_used: chain.iter().any(|s| s.cross_modal_bridge),
                };
                Graded {
                    version,
                    metrics: self.judge.grade(&request).await?,
                }
            }
        };
        let metrics = &graded.insert(current).metrics;

        if metrics.text_only_veto {
            let reasoning = metrics
                .strong_text_only
                .as_ref()
                .map(|p| p.raw.clone())
                .unwrap_or_default();
            return Ok(CheckOutcome::Trigger(
                RefineTrigger::TextOnlyVeto,
                format!("A solver without the image reasoned:\n{reasoning}"),
            ));
        }

        if metrics.medium_correct {
            let rationale = match self.judge.medium_rationale(&stage.question, answer, image).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "medium rationale failed");
                    String::new()
                }
            };
            return Ok(CheckOutcome::Trigger(RefineTrigger::TooEasy, rationale));
        }

        let verdict = self.reviewer.review(&stage.question, answer, image).await?;
        let outcome = match verdict.decision {
            Some(true) => CheckOutcome::Approved,
            None => CheckOutcome::Inconclusive,
            Some(false) => {
                let bullets = self.reviewer.feedback(&stage.question, answer, &verdict, image).await;
                let mut found = verdict.reason.clone().unwrap_or_default();
                for bullet in bullets {
                    found.push_str("\n- ");
                    found.push_str(&bullet);
                }
                CheckOutcome::Trigger(RefineTrigger::ReviewRejected, found)
            }
        };
        *review = Some(verdict);
        Ok(outcome)
    }

    fn log_option_bias(&self, stage: &StageResult) {
        let Some(letter) = stage.answer_key().and_then(AnswerKey::as_single) else {
            return;
        };
        if let Some(block) = OptionBlock::parse(&stage.question) {
            if block.answer_is_longest(letter) {
                warn!(%letter, "keyed option is the single longest option");
            }
        }
    }
}

fn instruction(trigger: RefineTrigger) -> &'static str {
    match trigger {
        RefineTrigger::Structure => "The option block or answer key is malformed. Fix the format.",
        RefineTrigger::TextOnlyVeto => {
            "A solver answered correctly without the image. Harden the question against this text-only shortcut: the deciding detail must only be readable from the image."
        }
        RefineTrigger::TooEasy => {
            "A weaker solver answered correctly without real visual reasoning. Make the visual step indispensable and the distractors closer."
        }
        RefineTrigger::ReviewRejected => "An independent reviewer rejected the question. Address the objection.",
    }
}

/// Format problems of a final candidate; empty when it is well formed.
fn structure_problems(stage: &StageResult, mode: QuestionMode) -> Vec<String> {
    let mut problems = Vec::new();
    let (min, max) = mode.option_range();

    match OptionBlock::parse(&stage.question) {
        None => problems.push("no option block found".to_string()),
        Some(block) => {
            if !block.is_well_formed(mode) {
                problems.push(format!(
                    "options must run A, B, C ... without gaps, {min}-{max} of them, none empty (found {})",
                    block.letters().iter().collect::<String>()
                ));
            }
            if let Some(answer) = stage.answer_key() {
                let letters = block.letters();
                if answer.letters().any(|l| !letters.contains(&l)) {
                    problems.push(format!("answer {answer} names a missing option"));
                }
            }
        }
    }

    match &stage.answer {
        Parsed::Valid(answer) => {
            if mode == QuestionMode::SingleSelect && answer.len() != 1 {
                problems.push(format!("single select needs exactly one answer letter, got {answer}"));
            }
        }
        Parsed::Missing => problems.push("missing <answer>".to_string()),
        Parsed::Malformed(raw) => problems.push(format!("unreadable answer: {raw}")),
    }
    problems
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{ProbeVariant, SolverTier};
    use crate::testing::{final_question, hop_question, stage_response, step_response, ScriptedOracle};

    fn solve(tier: SolverTier, variant: ProbeVariant) -> Purpose {
        Purpose::Solve { tier, variant }
    }

    /// Solver panel that makes answer B a calibrated question.
    fn calibrated(oracle: ScriptedOracle) -> ScriptedOracle {
        oracle
            .on(solve(SolverTier::Medium, ProbeVariant::WithImage), "<answer>A</answer>")
            .on(solve(SolverTier::Strong, ProbeVariant::WithImage), "<answer>B</answer>")
            .on(solve(SolverTier::Strong, ProbeVariant::TextOnly), "<answer>C</answer>")
            .on(solve(SolverTier::Strong, ProbeVariant::NoImage), "<answer>D</answer>")
    }

    fn composer(oracle: Arc<ScriptedOracle>, config: &EngineConfig) -> FinalComposer {
        let judge = Arc::new(DifficultyJudge::from_config(oracle.clone(), config));
        let reviewer = Arc::new(Reviewer::from_config(oracle.clone(), config));
        FinalComposer::new(oracle, judge, reviewer, config)
    }

    fn chain() -> Vec<StepResult> {
        (0..3)
            .map(|k| StepResult::from_raw(k, step_response(&hop_question(k), 'B', "both"), None))
            .collect()
    }

    fn three_options() -> String {
        "In the figure, at 30 nm, which layer compared with the 10 nm sample shifts furthest?\nA. oxide\nB. nitride\nC. metal"
            .to_string()
    }

    #[test]
    fn test_structure_problems() {
        let good = StageResult::from_raw(stage_response(&final_question(), "B"));
        assert!(structure_problems(&good, QuestionMode::SingleSelect).is_empty());

        let short = StageResult::from_raw(stage_response(&three_options(), "B"));
        assert_eq!(structure_problems(&short, QuestionMode::SingleSelect).len(), 1);

        let multi = StageResult::from_raw(stage_response(&final_question(), "A,C"));
        assert_eq!(structure_problems(&multi, QuestionMode::SingleSelect).len(), 1);
        assert!(structure_problems(&multi, QuestionMode::MultiSelect).is_empty());

        let off_block = StageResult::from_raw(stage_response(&final_question(), "F"));
        assert_eq!(structure_problems(&off_block, QuestionMode::MultiSelect).len(), 1);

        let empty = StageResult::from_raw("nothing useful".to_string());
        assert_eq!(structure_problems(&empty, QuestionMode::SingleSelect).len(), 2);
    }

    #[tokio::test]
    async fn test_approved_first_time() {
        let oracle = Arc::new(
            calibrated(ScriptedOracle::new())
                .on(Purpose::FinalCompose, stage_response(&final_question(), "B"))
                .on(Purpose::Review, "<answer>correct</answer>"),
        );
        let config = EngineConfig::default();
        let result = composer(oracle.clone(), &config)
            .compose(&chain(), "", &crate::testing::sample_image())
            .await
            .unwrap();

        assert_eq!(result.exit, RefineExit::Approved);
        assert!(result.triggers.is_empty());
        assert!(!result.metrics_stale);
        let metrics = result.metrics.unwrap();
        assert_eq!(metrics.difficulty_score, 1.0);
        assert_eq!(metrics.num_hops, 3);
        assert!(metrics.cross_modal_used);
        assert!(result.review.unwrap().approved());
        assert_eq!(oracle.calls_for(Purpose::FinalRevise), 0);
    }

    #[tokio::test]
    async fn test_structure_fix_then_approved() {
        let oracle = Arc::new(
            calibrated(ScriptedOracle::new())
                .on(Purpose::FinalCompose, stage_response(&three_options(), "B"))
                .on(Purpose::FinalRevise, stage_response(&final_question(), "B"))
                .on(Purpose::Review, "<answer>correct</answer>"),
        );
        let config = EngineConfig::default();
        let result = composer(oracle.clone(), &config)
            .compose(&chain(), "", &crate::testing::sample_image())
            .await
            .unwrap();

        assert_eq!(result.exit, RefineExit::Approved);
        assert_eq!(result.triggers, vec![RefineTrigger::Structure]);
        // The malformed draft was never graded.
        assert_eq!(oracle.calls_for(solve(SolverTier::Medium, ProbeVariant::WithImage)), 1);
    }

    #[tokio::test]
    async fn test_too_easy_carries_rationale() {
        let oracle = Arc::new(
            ScriptedOracle::new()
                .on_sequence(
                    solve(SolverTier::Medium, ProbeVariant::WithImage),
                    ["<answer>B</answer>", "<answer>A</answer>"],
                )
                .on(solve(SolverTier::Strong, ProbeVariant::WithImage), "<answer>B</answer>")
                .on(solve(SolverTier::Strong, ProbeVariant::TextOnly), "<answer>C</answer>")
                .on(solve(SolverTier::Strong, ProbeVariant::NoImage), "<answer>D</answer>")
                .on(Purpose::MediumRationale, "Option B is the only layer named in the stem.")
                .on(Purpose::FinalCompose, stage_response(&final_question(), "B"))
                .on(Purpose::FinalRevise, stage_response(&final_question(), "B"))
                .on(Purpose::Review, "<answer>correct</answer>"),
        );
        let config = EngineConfig::default();
        let result = composer(oracle.clone(), &config)
            .compose(&chain(), "", &crate::testing::sample_image())
            .await
            .unwrap();

        assert_eq!(result.exit, RefineExit::Approved);
        assert_eq!(result.triggers, vec![RefineTrigger::TooEasy]);
        let revise = oracle
            .calls()
            .into_iter()
            .find(|c| c.purpose == Purpose::FinalRevise)
            .unwrap();
        assert!(revise.prompt.contains("only layer named in the stem"));
        assert!(!result.metrics.unwrap().medium_correct);
    }

    #[tokio::test]
    async fn test_exhaustion_flags_stale_metrics() {
        let oracle = Arc::new(
            calibrated(ScriptedOracle::new())
                .on(Purpose::FinalCompose, stage_response(&final_question(), "B"))
                .on(Purpose::FinalRevise, stage_response(&three_options(), "B"))
                .on(Purpose::Review, "<answer>incorrect</answer><reason>C also fits</reason>")
                .on(Purpose::ReviewFeedback, "<feedback>- tighten option C</feedback>"),
        );
        let config = EngineConfig::default().with_composer_policy(ComposerPolicy {
            max_refinements: 1,
            mode: QuestionMode::SingleSelect,
        });
        let result = composer(oracle.clone(), &config)
            .compose(&chain(), "", &crate::testing::sample_image())
            .await
            .unwrap();

        assert_eq!(result.exit, RefineExit::Exhausted);
        assert_eq!(
            result.triggers,
            vec![RefineTrigger::ReviewRejected, RefineTrigger::Structure]
        );
        assert!(result.metrics_stale);
        assert!(result.metrics.is_some());
        assert_eq!(result.review.unwrap().decision, Some(false));

        let revise = oracle
            .calls()
            .into_iter()
            .find(|c| c.purpose == Purpose::FinalRevise)
            .unwrap();
        assert!(revise.prompt.contains("C also fits"));
        assert!(revise.prompt.contains("tighten option C"));
    }

    #[tokio::test]
    async fn test_inconclusive_review_stops() {
        let oracle = Arc::new(
            calibrated(ScriptedOracle::new())
                .on(Purpose::FinalCompose, stage_response(&final_question(), "B"))
                .on(Purpose::Review, "Hard to say."),
        );
        let config = EngineConfig::default();
        let result = composer(oracle.clone(), &config)
            .compose(&chain(), "", &crate::testing::sample_image())
            .await
            .unwrap();
        assert_eq!(result.exit, RefineExit::Inconclusive);
        assert_eq!(result.review.unwrap().decision, None);
        assert_eq!(oracle.calls_for(Purpose::FinalRevise), 0);
    }

    const HIDDEN_STEM: &str =
        "In the figure, for the film three times thicker than the reference, which coating moves its peak furthest?";

    #[tokio::test]
    async fn test_obfuscation_rewrites_stem_only() {
        let oracle = Arc::new(
            calibrated(ScriptedOracle::new())
                .on(Purpose::FinalCompose, stage_response(&final_question(), "B"))
                .on(Purpose::Obfuscate, format!("Sure.\n<stem>{HIDDEN_STEM}</stem>"))
                .on(Purpose::Review, "<answer>correct</answer>"),
        );
        let config = EngineConfig::default();
        let result = composer(oracle.clone(), &config)
            .compose(&chain(), "", &crate::testing::sample_image())
            .await
            .unwrap();

        assert_eq!(result.exit, RefineExit::Approved);
        let block = OptionBlock::parse(&result.stage.question).unwrap();
        let original = OptionBlock::parse(&final_question()).unwrap();
        assert_eq!(block.stem, HIDDEN_STEM);
        assert_eq!(block.options, original.options);
        assert_eq!(result.stage.answer_key().map(|a| a.to_string()), Some("B".to_string()));
        assert!(result.stage.raw.contains(HIDDEN_STEM));

        // The obfuscator sees the stem alone, and solvers see the rewrite.
        let calls = oracle.calls();
        let rewrite = calls.iter().find(|c| c.purpose == Purpose::Obfuscate).unwrap();
        assert!(rewrite.prompt.contains(&original.stem));
        assert!(!rewrite.prompt.contains("nitride"));
        let strong = calls
            .iter()
            .find(|c| c.purpose == solve(SolverTier::Strong, ProbeVariant::WithImage))
            .unwrap();
        assert!(strong.prompt.contains(HIDDEN_STEM));
    }

    #[tokio::test]
    async fn test_obfuscation_falls_back_to_original() {
        let bad_replies = [
            "",
            "I would rather not.",
            "<stem></stem>",
            "<stem>Which coating moves its peak furthest?</stem>",
            "<stem>In the figure, which coating?\nA. oxide\nB. nitride</stem>",
        ];
        for reply in bad_replies {
            let oracle = Arc::new(
                calibrated(ScriptedOracle::new())
                    .on(Purpose::FinalCompose, stage_response(&final_question(), "B"))
                    .on(Purpose::Obfuscate, reply)
                    .on(Purpose::Review, "<answer>correct</answer>"),
            );
            let result = composer(oracle, &EngineConfig::default())
                .compose(&chain(), "", &crate::testing::sample_image())
                .await
                .unwrap();
            assert_eq!(result.stage.question, final_question(), "reply {reply:?}");
        }

        let failing = Arc::new(
            calibrated(ScriptedOracle::new())
                .on(Purpose::FinalCompose, stage_response(&final_question(), "B"))
                .fail_on(Purpose::Obfuscate, "overloaded")
                .on(Purpose::Review, "<answer>correct</answer>"),
        );
        let result = composer(failing.clone(), &EngineConfig::default())
            .compose(&chain(), "", &crate::testing::sample_image())
            .await
            .unwrap();
        assert_eq!(result.exit, RefineExit::Approved);
        assert_eq!(result.stage.question, final_question());
        assert_eq!(failing.calls_for(Purpose::Obfuscate), 1);
    }

    #[tokio::test]
    async fn test_refinements_are_obfuscated_too() {
        let oracle = Arc::new(
            calibrated(ScriptedOracle::new())
                .on(Purpose::FinalCompose, stage_response(&three_options(), "B"))
                .on(Purpose::FinalRevise, stage_response(&final_question(), "B"))
                .on(Purpose::Obfuscate, format!("<stem>{HIDDEN_STEM}</stem>"))
                .on(Purpose::Review, "<answer>correct</answer>"),
        );
        let result = composer(oracle.clone(), &EngineConfig::default())
            .compose(&chain(), "", &crate::testing::sample_image())
            .await
            .unwrap();

        assert_eq!(result.exit, RefineExit::Approved);
        assert_eq!(oracle.calls_for(Purpose::Obfuscate), 2);
        assert!(result.stage.question.starts_with(HIDDEN_STEM));
        assert_eq!(OptionBlock::parse(&result.stage.question).unwrap().letters(), vec!['A', 'B', 'C', 'D']);
    }
}
