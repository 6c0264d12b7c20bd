//! Response adapter: raw oracle text in, structured values out.
//!
//! All leniency lives here. Models wrap fields in `<tag>` markers, fence
//! JSON in code blocks, answer "B." or "Answer: A, C". Everything past this
//! module sees [`Parsed`] values, [`AnswerKey`]s and typed records, and can
//! tell an absent field from a malformed one.

use crate::graph::{KnowledgeEdge, SourceType};
use crate::mcq::{self, normalize_letter};
use crate::step::Modality;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

/// A field read from oracle output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed<T> {
    Valid(T),
    /// The field was not present.
    Missing,
    /// The field was present but unreadable; holds the raw content.
    Malformed(String),
}

impl<T> Parsed<T> {
    pub fn valid(&self) -> Option<&T> {
        match self {
            Parsed::Valid(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Parsed::Valid(_))
    }
}

// ============================================================================
// Tags and fences
// ============================================================================

/// Content of the first `<tag>...</tag>` pair, trimmed. Case-insensitive.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let pattern = format!(r"(?is)<{0}>(.*?)</{0}>", regex::escape(tag));
    let re = Regex::new(&pattern).ok()?;
    let content = re.captures(text)?.get(1)?.as_str().trim();
    (!content.is_empty()).then(|| content.to_string())
}

/// Extract JSON from a response that may be wrapped in a code fence.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            return text[json_start..json_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let json_start = start + 3;
        if let Some(end) = text[json_start..].find("```") {
            return text[json_start..json_start + end].trim();
        }
    }

    // Fall back to the outermost brackets.
    let open = text.find(['[', '{']);
    let close = text.rfind([']', '}']);
    match (open, close) {
        (Some(open), Some(close)) if close > open => &text[open..=close],
        _ => text,
    }
}

// ============================================================================
// Answers
// ============================================================================

/// A set of option letters (one for single select).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AnswerKey(BTreeSet<char>);

lazy_static::lazy_static! {
    static ref LEADING_LETTER: Option<Regex> =
        Regex::new(r"^\s*[(（【\[]?\s*([A-HＡ-Ｈ])\s*(?:[.．、:：)）】\]]|$)").ok();
    static ref ANSWER_PHRASE: Option<Regex> = Regex::new(
        r"(?:(?i:final\s+answer)|(?i:answer)|答案)\s*(?:(?i:is)|为|是)?\s*[:：]?\s*\**\s*[(（]?([A-HＡ-Ｈ](?:\s*[,，、/&]?\s*[A-HＡ-Ｈ])*)\b"
    )
    .ok();
}

impl AnswerKey {
    pub fn single(letter: char) -> Option<Self> {
        let letter = normalize_letter(letter).filter(|c| ('A'..='H').contains(c))?;
        Some(Self(BTreeSet::from([letter])))
    }

    /// Read a letter set such as `B`, `A,C`, `AC`, `(B)` or `B. 18 nm`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        // Whole text is letters: "B", "a, c", "AC". Lowercase only as
        // single-letter tokens so words like "bad" are not read as A,B,D.
        let is_separator = |c: char| c.is_whitespace() || ",，、/&;".contains(c);
        let all_letters = text
            .split(is_separator)
            .filter(|t| !t.is_empty())
            .all(|token| {
                token.chars().all(|c| letter_of(c).is_some())
                    && (token.chars().count() == 1 || !token.chars().any(|c| c.is_ascii_lowercase()))
            });
        if all_letters {
            let letters: BTreeSet<char> = text.chars().filter_map(letter_of).collect();
            return (!letters.is_empty()).then_some(Self(letters));
        }

        let caps = LEADING_LETTER.as_ref()?.captures(text)?;
        let c = caps.get(1)?.as_str().chars().next()?;
        Self::single(c)
    }

    pub fn letters(&self) -> impl Iterator<Item = char> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The letter when exactly one is chosen.
    pub fn as_single(&self) -> Option<char> {
        (self.0.len() == 1).then(|| self.0.iter().next().copied()).flatten()
    }

    /// Non-empty strict subset of `other`.
    pub fn is_partial_of(&self, other: &AnswerKey) -> bool {
        !self.0.is_empty() && self.0.len() < other.0.len() && self.0.is_subset(&other.0)
    }
}

fn letter_of(c: char) -> Option<char> {
    normalize_letter(c).filter(|c| ('A'..='H').contains(c))
}

impl fmt::Display for AnswerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let letters: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        write!(f, "{}", letters.join(","))
    }
}

impl From<AnswerKey> for String {
    fn from(key: AnswerKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for AnswerKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AnswerKey::parse(&value).ok_or_else(|| format!("not an answer key: {value:?}"))
    }
}

/// The letters a solver committed to.
///
/// Looks for an `<answer>` tag, then an "Answer: X" phrase, then a bare
/// leading letter.
pub fn parse_solver_answer(raw: &str) -> Option<AnswerKey> {
    if let Some(tagged) = extract_tag(raw, "answer") {
        return AnswerKey::parse(&tagged);
    }
    if let Some(caps) = ANSWER_PHRASE.as_ref().and_then(|re| re.captures(raw)) {
        if let Some(m) = caps.get(1) {
            return AnswerKey::parse(m.as_str());
        }
    }
    AnswerKey::parse(raw)
}

// ============================================================================
// Step and stage candidates
// ============================================================================

/// One hop candidate as read from generator output.
#[derive(Debug, Clone, PartialEq)]
pub struct StepCandidate {
    pub question: Option<String>,
    pub answer: Parsed<char>,
    pub answer_text: Option<String>,
    pub evidence: Option<String>,
    pub modal_use: Parsed<Modality>,
    pub cross_modal_bridge: bool,
    pub reasoning: Option<String>,
}

/// Read a hop candidate.
///
/// A missing `<modal_use>` tag means `both`. A missing `<answer_text>` is
/// recovered from the option the answer letter points at.
pub fn parse_step_candidate(raw: &str) -> StepCandidate {
    let question = extract_tag(raw, "question");

    let answer = match extract_tag(raw, "answer") {
        None => Parsed::Missing,
        Some(content) => match AnswerKey::parse(&content).and_then(|k| k.as_single()) {
            Some(letter) => Parsed::Valid(letter),
            None => Parsed::Malformed(content),
        },
    };

    let answer_text = extract_tag(raw, "answer_text").or_else(|| {
        let letter = *answer.valid()?;
        mcq::option_text(question.as_deref()?, letter)
    });

    let modal_use = match extract_tag(raw, "modal_use") {
        None => Parsed::Valid(Modality::Both),
        Some(content) => match content.parse::<Modality>() {
            Ok(m) => Parsed::Valid(m),
            Err(_) => Parsed::Malformed(content),
        },
    };

    StepCandidate {
        question,
        answer,
        answer_text,
        evidence: extract_tag(raw, "evidence"),
        modal_use,
        cross_modal_bridge: extract_tag(raw, "cross_modal_bridge")
            .map(|v| parse_flag(&v))
            .unwrap_or(false),
        reasoning: extract_tag(raw, "reasoning"),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "yes" | "1" | "y" | "是" | "有"
    )
}

/// A final-question candidate as read from composer output.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDraft {
    pub question: Option<String>,
    pub answer: Parsed<AnswerKey>,
    pub reasoning: Option<String>,
}

pub fn parse_stage_draft(raw: &str) -> StageDraft {
    let answer = match extract_tag(raw, "answer") {
        None => Parsed::Missing,
        Some(content) => match AnswerKey::parse(&content) {
            Some(key) => Parsed::Valid(key),
            None => Parsed::Malformed(content),
        },
    };
    StageDraft {
        question: extract_tag(raw, "question"),
        answer,
        reasoning: extract_tag(raw, "reasoning"),
    }
}

// ============================================================================
// Review and verification
// ============================================================================

/// An independent reviewer's judgement.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReviewVerdict {
    /// `None` when the reviewer gave no recognizable decision.
    pub decision: Option<bool>,
    pub reason: Option<String>,
    pub raw: String,
}

impl ReviewVerdict {
    pub fn approved(&self) -> bool {
        self.decision == Some(true)
    }
}

fn decision_of(text: &str) -> Option<bool> {
    let lower = text.trim().to_lowercase();
    const NEGATIVE: &[&str] = &["incorrect", "false", "no", "n", "wrong", "错误", "否", "不正确"];
    const POSITIVE: &[&str] = &["correct", "true", "yes", "y", "right", "正确", "是"];
    if NEGATIVE.contains(&lower.as_str()) {
        return Some(false);
    }
    if POSITIVE.contains(&lower.as_str()) {
        return Some(true);
    }
    // Negatives first: "不正确" contains "正确" and "incorrect" contains "correct".
    if lower.contains("incorrect") || lower.contains("不正确") || lower.contains("错误") {
        Some(false)
    } else if lower.contains("correct") || lower.contains("正确") {
        Some(true)
    } else {
        None
    }
}

/// Read a review response.
pub fn parse_review(raw: &str) -> ReviewVerdict {
    let tagged = extract_tag(raw, "answer").or_else(|| extract_tag(raw, "review"));
    let decision = match tagged {
        Some(t) => decision_of(&t),
        None => decision_of(raw),
    };
    ReviewVerdict {
        decision,
        reason: extract_tag(raw, "reason"),
        raw: raw.to_string(),
    }
}

/// A visual-claim check fails only on an explicit `<verified>no</verified>`.
pub fn parse_verification(raw: &str) -> bool {
    match extract_tag(raw, "verified") {
        Some(v) => !matches!(
            v.to_lowercase().as_str(),
            "no" | "false" | "否" | "不是"
        ),
        None => true,
    }
}

/// Bullet points from a feedback response (`<feedback>` tag if present).
pub fn parse_bullets(raw: &str) -> Vec<String> {
    let body = extract_tag(raw, "feedback").unwrap_or_else(|| raw.trim().to_string());
    let bullets: Vec<String> = body
        .lines()
        .map(str::trim)
        .filter_map(|line| {
            let stripped = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| line.strip_prefix("• "))
                .or_else(|| strip_numbering(line))?;
            let stripped = stripped.trim();
            (!stripped.is_empty()).then(|| stripped.to_string())
        })
        .collect();

    if bullets.is_empty() && !body.is_empty() {
        vec![body]
    } else {
        bullets
    }
}

fn strip_numbering(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    line[digits..]
        .strip_prefix('.')
        .or_else(|| line[digits..].strip_prefix(')'))
}

// ============================================================================
// Knowledge extraction
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawTriple {
    #[serde(default)]
    head: Option<Value>,
    #[serde(default)]
    relation: Option<Value>,
    #[serde(default)]
    tail: Option<Value>,
    #[serde(default)]
    evidence: Option<Value>,
}

fn value_text(value: Option<Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Relation triples from an extraction response.
///
/// Accepts a JSON array, or an object holding one under `triples`/`edges`.
/// Entries without head, relation and tail are dropped. Returns `Err` with
/// a description when no JSON array can be found at all.
pub fn parse_edges(
    raw: &str,
    source_id: Option<u32>,
    source_type: SourceType,
) -> Result<Vec<KnowledgeEdge>, String> {
    let json = extract_json(raw);
    let value: Value = serde_json::from_str(json).map_err(|e| e.to_string())?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("triples").or_else(|| map.remove("edges")) {
            Some(Value::Array(items)) => items,
            _ => return Err("object without a triples array".to_string()),
        },
        _ => return Err("expected a JSON array".to_string()),
    };

    Ok(items
        .into_iter()
        .filter_map(|item| serde_json::from_value::<RawTriple>(item).ok())
        .filter_map(|t| {
            Some(KnowledgeEdge {
                head: value_text(t.head)?,
                relation: value_text(t.relation)?,
                tail: value_text(t.tail)?,
                evidence: value_text(t.evidence),
                source_id,
                source_type,
            })
        })
        .collect())
}

/// Image description and optional summary from a vision response.
pub fn parse_visual_description(raw: &str) -> (String, Option<String>) {
    let description = extract_tag(raw, "description").unwrap_or_else(|| raw.trim().to_string());
    (description, extract_tag(raw, "summary"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> AnswerKey {
        AnswerKey::parse(s).unwrap()
    }

    #[test]
    fn test_extract_tag() {
        let raw = "noise <Question>\n  Which one?\n</Question> <answer>B</answer>";
        assert_eq!(extract_tag(raw, "question").as_deref(), Some("Which one?"));
        assert_eq!(extract_tag(raw, "answer").as_deref(), Some("B"));
        assert_eq!(extract_tag(raw, "reasoning"), None);
        assert_eq!(extract_tag("<answer>  </answer>", "answer"), None);
    }

    #[test]
    fn test_extract_json_variants() {
        assert_eq!(extract_json("```json\n[1]\n```"), "[1]");
        assert_eq!(extract_json("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("Here you go: [1, 2] done"), "[1, 2]");
        assert_eq!(extract_json("  [3]  "), "[3]");
    }

    #[test]
    fn test_answer_key_forms() {
        assert_eq!(key("B").as_single(), Some('B'));
        assert_eq!(key("(C)").as_single(), Some('C'));
        assert_eq!(key("B. 18 nm").as_single(), Some('B'));
        assert_eq!(key("a, c").to_string(), "A,C");
        assert_eq!(key("CA"), key("A C"));
        assert_eq!(key("Ｄ").as_single(), Some('D'));
        assert!(AnswerKey::parse("A ball rolls").is_none());
        assert!(AnswerKey::parse("none").is_none());
        assert!(AnswerKey::parse("Z").is_none());
    }

    #[test]
    fn test_partial_subset() {
        assert!(key("A").is_partial_of(&key("A,C")));
        assert!(!key("A,C").is_partial_of(&key("A,C")));
        assert!(!key("B").is_partial_of(&key("A,C")));
    }

    #[test]
    fn test_solver_answer() {
        assert_eq!(parse_solver_answer("thinking...\n<answer>C</answer>"), Some(key("C")));
        assert_eq!(parse_solver_answer("So the final answer is: B"), Some(key("B")));
        assert_eq!(parse_solver_answer("Answer: A, D"), Some(key("A,D")));
        assert_eq!(parse_solver_answer("D"), Some(key("D")));
        assert_eq!(parse_solver_answer("I cannot tell from the text."), None);
    }

    #[test]
    fn test_step_candidate_full() {
        let raw = "<question>In the figure, at 20 nm which layer?\nA. oxide\nB. nitride\nC. metal\nD. glass</question>\n\
                   <answer>B</answer>\n<evidence>Table 2</evidence>\n<modal_use>image</modal_use>\n\
                   <cross_modal_bridge>yes</cross_modal_bridge>";
        let step = parse_step_candidate(raw);
        assert_eq!(step.answer, Parsed::Valid('B'));
        assert_eq!(step.answer_text.as_deref(), Some("nitride"));
        assert_eq!(step.modal_use, Parsed::Valid(Modality::Image));
        assert!(step.cross_modal_bridge);
        assert_eq!(step.evidence.as_deref(), Some("Table 2"));
        assert!(step.reasoning.is_none());
    }

    #[test]
    fn test_step_candidate_absent_vs_malformed() {
        let step = parse_step_candidate("<question>Q?</question><modal_use>audio</modal_use>");
        assert_eq!(step.answer, Parsed::Missing);
        assert_eq!(step.modal_use, Parsed::Malformed("audio".into()));
        assert!(!step.cross_modal_bridge);

        let step = parse_step_candidate("<answer>B and C</answer>");
        assert_eq!(step.answer, Parsed::Malformed("B and C".into()));
        assert_eq!(step.modal_use, Parsed::Valid(Modality::Both));
    }

    #[test]
    fn test_stage_draft() {
        let draft = parse_stage_draft("<question>Q</question><answer>A,C</answer><reasoning>r</reasoning>");
        assert_eq!(draft.answer, Parsed::Valid(key("A,C")));
        assert_eq!(draft.reasoning.as_deref(), Some("r"));
    }

    #[test]
    fn test_review_parsing() {
        let v = parse_review("<answer>incorrect</answer><reason>two options fit</reason>");
        assert_eq!(v.decision, Some(false));
        assert_eq!(v.reason.as_deref(), Some("two options fit"));

        assert_eq!(parse_review("<review>Correct</review>").decision, Some(true));
        assert_eq!(parse_review("The answer looks correct to me").decision, Some(true));
        assert_eq!(parse_review("This is incorrect.").decision, Some(false));
        assert_eq!(parse_review("Unsure.").decision, None);
    }

    #[test]
    fn test_review_free_text_rejections() {
        assert_eq!(parse_review("答案错误，选项C也成立。").decision, Some(false));
        assert_eq!(parse_review("<answer>错误</answer>").decision, Some(false));
        assert_eq!(parse_review("结论不正确").decision, Some(false));
        assert_eq!(parse_review("答案正确").decision, Some(true));
        assert_eq!(parse_review("<answer>N</answer>").decision, Some(false));
        assert_eq!(parse_review("<answer>y</answer>").decision, Some(true));
    }

    #[test]
    fn test_verification() {
        assert!(!parse_verification("<verified>no</verified>"));
        assert!(parse_verification("<verified>yes</verified>"));
        assert!(parse_verification("garbled output"));
    }

    #[test]
    fn test_bullets() {
        let raw = "<feedback>\n- add a threshold\n2. avoid naming the material\n</feedback>";
        assert_eq!(
            parse_bullets(raw),
            vec!["add a threshold".to_string(), "avoid naming the material".to_string()]
        );
        assert_eq!(parse_bullets("Tighten the stem."), vec!["Tighten the stem.".to_string()]);
        assert!(parse_bullets("   ").is_empty());
    }

    #[test]
    fn test_parse_edges() {
        let raw = r#"```json
[
  {"head": "TiO2", "relation": "doped with", "tail": "Rb", "evidence": "Rb doping"},
  {"head": "TiO2", "relation": "", "tail": "x"},
  {"head": "strain", "relation": "reduces", "tail": "formation energy"},
  "garbage"
]
```"#;
        let edges = parse_edges(raw, Some(3), SourceType::Text).unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].evidence.as_deref(), Some("Rb doping"));
        assert_eq!(edges[1].source_id, Some(3));
        assert!(edges[1].evidence.is_none());

        let wrapped = r#"{"triples": [{"head": "a", "relation": "b", "tail": "c"}]}"#;
        assert_eq!(parse_edges(wrapped, None, SourceType::Image).unwrap().len(), 1);

        assert!(parse_edges("no json here", None, SourceType::Text).is_err());
    }

    #[test]
    fn test_visual_description() {
        let (desc, summary) = parse_visual_description("<description>bars</description>");
        assert_eq!(desc, "bars");
        assert!(summary.is_none());

        let (desc, _) = parse_visual_description("plain text");
        assert_eq!(desc, "plain text");
    }
}
