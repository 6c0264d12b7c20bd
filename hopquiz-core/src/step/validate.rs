//! Cheap hop checks.
//!
//! Everything here is lexical and runs before any solver is asked. The
//! visual-claim check and the text-only probe need oracle calls and live in
//! the synthesizer.

use super::{Modality, StepResult};
use crate::config::StepPolicy;
use crate::mcq::OptionBlock;
use crate::parse::Parsed;
use crate::quality;

/// Minimum answer-text length for the leak check; shorter texts ("A", "2")
/// appear in stems by accident.
const LEAK_MIN_CHARS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationFailure {
    #[error("missing options")]
    MissingOptions,

    #[error("missing visual anchor")]
    MissingVisualAnchor,

    #[error("missing neutral clue")]
    MissingNeutralClue,

    #[error("missing answer")]
    MissingAnswer,

    #[error("malformed answer: {0}")]
    MalformedAnswer(String),

    #[error("invalid modal_use: {0}")]
    InvalidModality(String),

    #[error("cross-modal bridge required")]
    CrossModalRequired,

    #[error("answer text appears in the stem")]
    AnswerLeak,

    #[error("solved by the text-only probe")]
    TextOnlyShortcut,

    #[error("consecutive {0}-only hops")]
    ConsecutivePureModality(Modality),

    #[error("trivial lookup without a comparison, calculation or anomaly")]
    LowQualityLookup,

    #[error("visual claim not found in the image")]
    UnverifiedVisualClaim,
}

impl ValidationFailure {
    /// What the revision request asks the generator to do.
    pub fn instruction(&self) -> String {
        match self {
            ValidationFailure::MissingOptions => {
                "Add an option block: options A-D, one per line, after the stem.".to_string()
            }
            ValidationFailure::MissingVisualAnchor => {
                "Refer the solver to a specific region or element of the image.".to_string()
            }
            ValidationFailure::MissingNeutralClue => {
                "Add a neutral numeric value or stated condition to the stem.".to_string()
            }
            ValidationFailure::MissingAnswer | ValidationFailure::MalformedAnswer(_) => {
                "Give the answer as a single letter inside <answer></answer>.".to_string()
            }
            ValidationFailure::InvalidModality(_) => {
                "Set <modal_use> to exactly one of: image, text, both.".to_string()
            }
            ValidationFailure::CrossModalRequired => {
                "Make the answer depend on both the image and the text, and set <cross_modal_bridge>true</cross_modal_bridge>.".to_string()
            }
            ValidationFailure::AnswerLeak => {
                "Remove the answer text from the stem.".to_string()
            }
            ValidationFailure::TextOnlyShortcut => {
                "The question can be answered without the image. Make the deciding detail visual.".to_string()
            }
            ValidationFailure::ConsecutivePureModality(m) => {
                format!("The previous hop already relied on {m} only; change the modality.")
            }
            ValidationFailure::LowQualityLookup => {
                "Replace the lookup with a comparison, a calculation or an anomaly check.".to_string()
            }
            ValidationFailure::UnverifiedVisualClaim => {
                "Remove any visual claim that cannot be verified in the image.".to_string()
            }
        }
    }
}

/// Run the cheap rules in order and collect every failure.
pub fn check_rules(
    step: &StepResult,
    previous: Option<&StepResult>,
    policy: &StepPolicy,
    require_cross_modal: bool,
) -> Vec<ValidationFailure> {
    let mut failures = Vec::new();
    let stem = step.stem();

    if OptionBlock::parse(&step.question).is_none() {
        failures.push(ValidationFailure::MissingOptions);
    }
    if !quality::has_visual_anchor(&stem) {
        failures.push(ValidationFailure::MissingVisualAnchor);
    }
    if !quality::has_neutral_clue(&stem) {
        failures.push(ValidationFailure::MissingNeutralClue);
    }

    match &step.answer {
        Parsed::Valid(_) => {}
        Parsed::Missing => failures.push(ValidationFailure::MissingAnswer),
        Parsed::Malformed(raw) => failures.push(ValidationFailure::MalformedAnswer(raw.clone())),
    }

    if let Parsed::Malformed(raw) = &step.modal_use {
        failures.push(ValidationFailure::InvalidModality(raw.clone()));
    }

    if require_cross_modal && !step.cross_modal_bridge {
        failures.push(ValidationFailure::CrossModalRequired);
    }

    if policy.check_answer_leak && leaks_answer(&stem, step.answer_text.as_deref()) {
        failures.push(ValidationFailure::AnswerLeak);
    }

    if let (Some(current), Some(prev)) = (step.modality(), previous.and_then(StepResult::modality)) {
        if current.is_pure() && current == prev {
            failures.push(ValidationFailure::ConsecutivePureModality(current));
        }
    }

    if quality::is_trivial_lookup(&step.question) {
        failures.push(ValidationFailure::LowQualityLookup);
    }

    failures
}

fn leaks_answer(stem: &str, answer_text: Option<&str>) -> bool {
    let Some(answer) = answer_text.map(str::trim) else {
        return false;
    };
    if answer.chars().count() < LEAK_MIN_CHARS {
        return false;
    }
    stem.to_lowercase().contains(&answer.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "<question>In the figure, when the film is 20 nm thick, which layer compared with the substrate shows the higher peak?\n\
        A. oxide\nB. nitride\nC. metal\nD. glass</question>\n\
        <answer>B</answer><modal_use>both</modal_use><cross_modal_bridge>true</cross_modal_bridge>";

    fn step(raw: &str) -> StepResult {
        StepResult::from_raw(1, raw.to_string(), None)
    }

    #[test]
    fn test_good_step_passes() {
        assert!(check_rules(&step(GOOD), None, &StepPolicy::default(), true).is_empty());
    }

    #[test]
    fn test_missing_options_reported_first() {
        let raw = "<question>In the figure, at 20 nm which layer compared with B is thicker?</question><answer>B</answer>";
        let failures = check_rules(&step(raw), None, &StepPolicy::default(), false);
        assert_eq!(failures.first(), Some(&ValidationFailure::MissingOptions));
        assert_eq!(failures[0].to_string(), "missing options");
    }

    #[test]
    fn test_answer_problems() {
        let missing = GOOD.replace("<answer>B</answer>", "");
        let failures = check_rules(&step(&missing), None, &StepPolicy::default(), true);
        assert!(failures.contains(&ValidationFailure::MissingAnswer));

        let malformed = GOOD.replace("<answer>B</answer>", "<answer>the second</answer>");
        let failures = check_rules(&step(&malformed), None, &StepPolicy::default(), true);
        assert!(matches!(failures.as_slice(), [ValidationFailure::MalformedAnswer(_)]));
    }

    #[test]
    fn test_cross_modal_and_modality() {
        let raw = GOOD
            .replace("<cross_modal_bridge>true</cross_modal_bridge>", "")
            .replace("<modal_use>both</modal_use>", "<modal_use>smell</modal_use>");
        let failures = check_rules(&step(&raw), None, &StepPolicy::default(), true);
        assert!(failures.contains(&ValidationFailure::CrossModalRequired));
        assert!(failures.contains(&ValidationFailure::InvalidModality("smell".into())));

        assert!(!check_rules(&step(&raw), None, &StepPolicy::default(), false)
            .contains(&ValidationFailure::CrossModalRequired));
    }

    #[test]
    fn test_answer_leak() {
        let raw = GOOD.replace("which layer compared", "which layer (nitride) compared");
        let failures = check_rules(&step(&raw), None, &StepPolicy::default(), true);
        assert_eq!(failures, vec![ValidationFailure::AnswerLeak]);

        let lenient = StepPolicy {
            check_answer_leak: false,
            ..StepPolicy::default()
        };
        assert!(check_rules(&step(&raw), None, &lenient, true).is_empty());
    }

    #[test]
    fn test_consecutive_pure_modality() {
        let image_hop = GOOD.replace("<modal_use>both</modal_use>", "<modal_use>image</modal_use>");
        let previous = step(&image_hop);
        let failures = check_rules(&step(&image_hop), Some(&previous), &StepPolicy::default(), true);
        assert_eq!(failures, vec![ValidationFailure::ConsecutivePureModality(Modality::Image)]);

        let both = step(GOOD);
        assert!(check_rules(&both, Some(&previous), &StepPolicy::default(), true).is_empty());
    }

    #[test]
    fn test_trivial_lookup() {
        let raw = "<question>What is the material shown in the figure at 20 nm?\nA. oxide\nB. nitride\nC. metal\nD. glass</question><answer>A</answer>";
        let failures = check_rules(&step(raw), None, &StepPolicy::default(), false);
        assert_eq!(failures, vec![ValidationFailure::LowQualityLookup]);
    }
}
