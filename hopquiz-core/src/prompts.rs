//! Prompt assembly.
//!
//! Static instruction blocks live in `prompts/*.txt`; the functions here
//! append the dynamic sections (facts, previous steps, failure reasons).

use crate::graph::{KnowledgeEdge, SourceType};
use crate::judge::DifficultyMetrics;
use crate::mcq::QuestionMode;
use crate::oracle::ProbeVariant;
use crate::parse::{AnswerKey, ReviewVerdict};
use crate::step::{HopBrief, StepResult};
use std::fmt::Write as _;

fn options_rule(mode: QuestionMode) -> &'static str {
    match mode {
        QuestionMode::SingleSelect => {
            "Give exactly 4 options labeled A-D, exactly one of them correct."
        }
        QuestionMode::MultiSelect => {
            "Give 4 to 8 options labeled consecutively from A (at most H); one or more may be correct."
        }
    }
}

fn push_section(prompt: &mut String, title: &str, body: &str) {
    prompt.push_str("\n\n## ");
    prompt.push_str(title);
    prompt.push('\n');
    prompt.push_str(body.trim());
}

fn describe_edge(edge: &KnowledgeEdge) -> String {
    let mut text = format!("{} --[{}]--> {}", edge.head, edge.relation, edge.tail);
    if let Some(evidence) = &edge.evidence {
        let _ = write!(text, "\nEvidence: {evidence}");
    }
    text
}

pub fn extraction(chunk: &str, source_type: SourceType) -> String {
    let mut prompt = String::from(include_str!("prompts/extraction.txt"));
    let title = match source_type {
        SourceType::Text => "Passage",
        SourceType::Image => "Image description (treat as the passage)",
    };
    push_section(&mut prompt, title, chunk);
    prompt
}

pub fn visual_description() -> &'static str {
    include_str!("prompts/visual_description.txt")
}

pub fn step_generation(brief: &HopBrief<'_>) -> String {
    let mut prompt = String::from(include_str!("prompts/step_generation.txt"));
    prompt.push_str("- ");
    prompt.push_str(options_rule(QuestionMode::SingleSelect));
    if brief.require_cross_modal {
        prompt.push_str("\n- The answer must need both the image and the text (cross-modal bridge).");
    }

    if !brief.visual_summary.is_empty() {
        push_section(&mut prompt, "What the image shows", brief.visual_summary);
    }

    match brief.edge {
        Some(edge) => {
            let title = format!("Fact for this step (source: {})", brief.source_label);
            push_section(&mut prompt, &title, &describe_edge(edge));
        }
        None => push_section(
            &mut prompt,
            "Anchor step",
            "This is the first step. Anchor it on a concrete, checkable detail of the image.",
        ),
    }

    if let Some(branch) = brief.branch {
        push_section(
            &mut prompt,
            "Contrast fact (same subject, different outcome; use it for a distractor)",
            &describe_edge(branch),
        );
    }

    if !brief.distractors.is_empty() {
        push_section(&mut prompt, "Distractor entities", &brief.distractors.join(", "));
    }

    if let Some(previous) = brief.previous {
        let mut body = previous.question.clone();
        if let Some(text) = &previous.answer_text {
            let _ = write!(body, "\nIts answer: {text}");
        }
        push_section(
            &mut prompt,
            "Previous step (build on its answer without restating it)",
            &body,
        );
        if let Some(modality) = previous.modality() {
            if modality.is_pure() {
                let _ = write!(
                    prompt,
                    "\nThe previous step relied on {modality} only; this step must not rely on {modality} only."
                );
            }
        }
    }

    if let Some(question) = brief.previous_final_question {
        push_section(
            &mut prompt,
            "Previous final question (extend it to a harder one)",
            question,
        );
    }

    if !brief.feedback.trim().is_empty() {
        push_section(&mut prompt, "Feedback from earlier attempts", brief.feedback);
    }

    prompt.push_str("\n\n");
    prompt.push_str(include_str!("prompts/step_format.txt"));
    prompt
}

pub fn step_revision(brief: &HopBrief<'_>, previous_raw: &str, problems: &[String]) -> String {
    let mut prompt = String::from(include_str!("prompts/step_revision.txt"));
    let listed = problems
        .iter()
        .map(|p| format!("- {p}"))
        .collect::<Vec<_>>()
        .join("\n");
    push_section(&mut prompt, "Problems", &listed);
    push_section(&mut prompt, "Rejected step", previous_raw);
    push_section(&mut prompt, "Original task", &step_generation(brief));
    prompt
}

pub fn solver(question: &str, variant: ProbeVariant) -> String {
    let mut prompt = String::from(match variant {
        ProbeVariant::TextOnly => include_str!("prompts/solver_text_only.txt"),
        ProbeVariant::WithImage | ProbeVariant::NoImage => include_str!("prompts/solver.txt"),
    });
    push_section(&mut prompt, "Question", question);
    prompt
}

pub fn review(question: &str, answer: &AnswerKey) -> String {
    let mut prompt = String::from(include_str!("prompts/review.txt"));
    push_section(&mut prompt, "Question", question);
    push_section(&mut prompt, "Keyed answer", &answer.to_string());
    prompt
}

pub fn visual_verification(stem: &str) -> String {
    let mut prompt = String::from(include_str!("prompts/visual_verification.txt"));
    push_section(&mut prompt, "Stem", stem);
    prompt
}

pub fn review_feedback(question: &str, answer: &AnswerKey, verdict: &ReviewVerdict) -> String {
    let mut prompt = String::from(include_str!("prompts/review_feedback.txt"));
    push_section(&mut prompt, "Question", question);
    push_section(&mut prompt, "Keyed answer", &answer.to_string());
    let reason = verdict.reason.as_deref().unwrap_or(&verdict.raw);
    push_section(&mut prompt, "Reviewer said", reason);
    prompt
}

fn chain_section(chain: &[StepResult]) -> String {
    let mut body = String::new();
    for step in chain {
        let _ = writeln!(body, "### Step {}\n{}", step.k, step.question);
        if let Some(letter) = step.answer_letter() {
            let text = step.answer_text.as_deref().unwrap_or("");
            let _ = writeln!(body, "Answer: {letter} {text}");
        }
        if let Some(evidence) = &step.evidence {
            let _ = writeln!(body, "Evidence: {evidence}");
        }
        body.push('\n');
    }
    body
}

pub fn final_compose(chain: &[StepResult], feedback: &str, mode: QuestionMode) -> String {
    let mut prompt = String::from(include_str!("prompts/final_compose.txt"));
    prompt.push_str("- ");
    prompt.push_str(options_rule(mode));
    push_section(&mut prompt, "Steps", &chain_section(chain));
    if !feedback.trim().is_empty() {
        push_section(&mut prompt, "Feedback from earlier attempts", feedback);
    }
    prompt.push_str("\n\n");
    prompt.push_str(include_str!("prompts/final_format.txt"));
    prompt
}

pub fn final_revise(
    current_raw: &str,
    instruction: &str,
    details: &str,
    mode: QuestionMode,
) -> String {
    let mut prompt = String::from(include_str!("prompts/final_revise.txt"));
    push_section(&mut prompt, "Problem", instruction);
    if !details.trim().is_empty() {
        push_section(&mut prompt, "Details", details);
    }
    push_section(&mut prompt, "Option rule", options_rule(mode));
    push_section(&mut prompt, "Current question", current_raw);
    prompt.push_str("\n\n");
    prompt.push_str(include_str!("prompts/final_format.txt"));
    prompt
}

pub fn obfuscation(stem: &str) -> String {
    let mut prompt = String::from(include_str!("prompts/obfuscation.txt"));
    push_section(&mut prompt, "Stem", stem);
    prompt
}

pub fn medium_rationale(question: &str, answer: &AnswerKey) -> String {
    let mut prompt = String::from(include_str!("prompts/medium_rationale.txt"));
    push_section(&mut prompt, "Question", question);
    push_section(&mut prompt, "Correct answer", &answer.to_string());
    prompt
}

pub fn reflection(
    chain: &[StepResult],
    final_question: &str,
    metrics: Option<&DifficultyMetrics>,
    review: Option<&ReviewVerdict>,
) -> String {
    let mut prompt = String::from(include_str!("prompts/reflection.txt"));
    push_section(&mut prompt, "Steps", &chain_section(chain));
    push_section(&mut prompt, "Final question", final_question);
    if let Some(m) = metrics {
        let summary = format!(
            "medium_correct={} strong_correct={} text_only_correct={} no_image_correct={} score={}",
            m.medium_correct,
            m.strong_correct,
            m.strong_text_only_correct,
            m.strong_no_image_correct,
            m.difficulty_score
        );
        push_section(&mut prompt, "Solver results", &summary);
    }
    if let Some(verdict) = review {
        let decision = match verdict.decision {
            Some(true) => "approved",
            Some(false) => "rejected",
            None => "inconclusive",
        };
        let reason = verdict.reason.as_deref().unwrap_or("");
        push_section(&mut prompt, "Review", &format!("{decision}. {reason}"));
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_solver_variants_differ() {
        let with_image = solver("Q?", ProbeVariant::WithImage);
        let no_image = solver("Q?", ProbeVariant::NoImage);
        let text_only = solver("Q?", ProbeVariant::TextOnly);
        assert_eq!(with_image, no_image);
        assert_ne!(with_image, text_only);
        assert!(text_only.contains("cannot see"));
        assert!(text_only.ends_with("Q?"));
    }

    #[test]
    fn test_extraction_includes_chunk() {
        let prompt = extraction("Rb doping lowers the barrier.", SourceType::Text);
        assert!(prompt.contains("## Passage\nRb doping lowers the barrier."));
        assert!(prompt.contains("JSON array"));
    }

    #[test]
    fn test_final_revise_sections() {
        let prompt = final_revise("<question>old</question>", "fix options", "", QuestionMode::MultiSelect);
        assert!(prompt.contains("## Problem\nfix options"));
        assert!(!prompt.contains("## Details"));
        assert!(prompt.contains("4 to 8 options"));
    }

    #[test]
    fn test_obfuscation_asks_for_stem_tag() {
        let prompt = obfuscation("图中哪一层最厚？");
        assert!(prompt.contains("<stem></stem>"));
        assert!(prompt.ends_with("## Stem\n图中哪一层最厚？"));
    }
}
