//! Cheap lexical heuristics over question stems.
//!
//! Cue lists are bilingual (English and Chinese) because source material
//! comes in both.

use crate::mcq::OptionBlock;
use regex::Regex;

/// The reasoning operator a question asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Calculation,
    Distinction,
    Anomaly,
    Other,
}

impl Operator {
    /// Operators that make a question more than a lookup.
    pub fn is_reasoning(self) -> bool {
        !matches!(self, Operator::Other)
    }
}

const ANOMALY_CUES: &[&str] = &[
    "missing", "inconsistent", "contradict", "anomal", "violat", "unreasonable",
    "does not match", "conflict", "缺失", "遗漏", "多余", "冲突", "不一致", "错误",
    "不符合", "异常", "违规", "不合理",
];

const DISTINCTION_CUES: &[&str] = &[
    "differ", "distinguish", "compared", "compare", "contrast", "more likely",
    "most consistent", "区别", "不同", "相较", "相比", "对比", "更符合", "更可能",
    "哪项更", "主要差异",
];

const CALCULATION_CUES: &[&str] = &[
    "calculate", "compute", "estimate", "threshold", "greater than", "less than",
    "at least", "at most", "no more than", "exceed", "ratio", "计算", "求", "估算",
    "阈值", "满足条件", "大于", "小于", "不超过", "至少", "最多",
];

const LOOKUP_CUES: &[&str] = &[
    "what is", "which of the following is", "refers to", "belongs to",
    "is defined as", "definition of", "which statement is correct", "是什么",
    "指的是", "下列哪项描述正确", "下列哪项正确", "下列哪个是", "属于", "定义",
    "说法正确",
];

const VISUAL_ANCHORS: &[&str] = &[
    "figure", "image", "picture", "diagram", "chart", "graph", "plot", "panel",
    "photo", "shown", "illustrat", "图中", "图示", "图像", "图片", "如图",
];

const CONDITIONAL_CUES: &[&str] = &[
    "if ", "when ", "given", "assuming", "assume", "suppose", "provided that",
    "under the condition", "若", "如果", "假设", "当", "已知", "满足",
];

lazy_static::lazy_static! {
    static ref NUMERIC_WITH_UNIT: Option<Regex> = Regex::new(
        r"(?i)[+\-]?\d+(\.\d+)?\s*(%|℃|°c|kpa|mpa|nm|mm|cm|m|kg|g|mg|s|min|h)\b"
    )
    .ok();
    static ref NUMERIC_RANGE: Option<Regex> =
        Regex::new(r"\b\d+(\.\d+)?\s*[-~～]\s*\d+(\.\d+)?\b").ok();
    /// Grade or level labels. Bare roman numerals and 高/中/低 count only as
    /// the whole option, so the pronoun "I" and words like 图中 stay out.
    static ref GRADE_LABEL: Option<Regex> = Regex::new(concat!(
        r"[一二三四]级",
        r"|^\s*[高中低][等级]?\s*$",
        r"|^\s*(?:I{1,3}|IV)\s*$",
        r"|(?i:level|grade|tier|class|stage)\s*(?:I{1,3}|IV)\b",
        r"|(?:等级|级别)\s*(?:I{1,3}|IV)",
    ))
    .ok();
}

fn contains_any(haystack: &str, cues: &[&str]) -> bool {
    let lower = haystack.to_lowercase();
    cues.iter().any(|cue| lower.contains(cue))
}

fn matches(re: &Option<Regex>, text: &str) -> bool {
    re.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
}

fn is_numeric_option(text: &str) -> bool {
    text.chars().any(|c| c.is_ascii_digit())
        || matches(&NUMERIC_WITH_UNIT, text)
        || matches(&NUMERIC_RANGE, text)
        || matches(&GRADE_LABEL, text)
}

/// Infer which operator a question exercises.
///
/// Anomaly cues win over distinction cues, which win over calculation.
/// Two or more numeric-looking options also count as calculation.
pub fn infer_operator(question: &str) -> Operator {
    if contains_any(question, ANOMALY_CUES) {
        return Operator::Anomaly;
    }
    if contains_any(question, DISTINCTION_CUES) {
        return Operator::Distinction;
    }
    if let Some(block) = OptionBlock::parse(question) {
        let numeric = block
            .options
            .iter()
            .filter(|o| is_numeric_option(&o.text))
            .count();
        if numeric >= 2 {
            return Operator::Calculation;
        }
    }
    if contains_any(question, CALCULATION_CUES) {
        return Operator::Calculation;
    }
    Operator::Other
}

/// A question that only asks to recall or match an entity.
pub fn is_trivial_lookup(question: &str) -> bool {
    if question.trim().is_empty() {
        return true;
    }
    if infer_operator(question).is_reasoning() {
        return false;
    }
    contains_any(question, LOOKUP_CUES)
}

/// The stem points the solver at the image.
pub fn has_visual_anchor(stem: &str) -> bool {
    contains_any(stem, VISUAL_ANCHORS)
}

/// The stem carries a number or a stated condition.
pub fn has_neutral_clue(stem: &str) -> bool {
    stem.chars().any(|c| c.is_ascii_digit()) || contains_any(stem, CONDITIONAL_CUES)
}
