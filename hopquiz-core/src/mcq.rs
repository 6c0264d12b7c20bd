//! Multiple-choice option handling.
//!
//! Questions are plain text with the option block at the end:
//!
//! ```text
//! In the figure, which stage ...?
//! A. 12 nm
//! B. 18 nm
//! C. 25 nm
//! D. 40 nm
//! ```
//!
//! Markers may be `A.`, `A)`, `(A)`, `A、` or full-width variants, one per
//! line or inline.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Single or multiple correct options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuestionMode {
    /// Exactly four options A-D, one correct.
    #[default]
    SingleSelect,
    /// Four to eight options A-H, one or more correct.
    MultiSelect,
}

impl QuestionMode {
    /// Allowed option count range (inclusive).
    pub fn option_range(self) -> (usize, usize) {
        match self {
            QuestionMode::SingleSelect => (4, 4),
            QuestionMode::MultiSelect => (4, 8),
        }
    }

    pub fn last_letter(self) -> char {
        match self {
            QuestionMode::SingleSelect => 'D',
            QuestionMode::MultiSelect => 'H',
        }
    }
}

impl fmt::Display for QuestionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestionMode::SingleSelect => write!(f, "single"),
            QuestionMode::MultiSelect => write!(f, "multi"),
        }
    }
}

impl FromStr for QuestionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "single_select" | "single-select" => Ok(QuestionMode::SingleSelect),
            "multi" | "multiple" | "multi_select" | "multi-select" => Ok(QuestionMode::MultiSelect),
            other => Err(format!("unknown question mode '{other}'")),
        }
    }
}

lazy_static::lazy_static! {
    /// An option letter opening a line.
    static ref LINE_MARKER: Option<Regex> =
        Regex::new(r"(?m)^[ \t]*[(（【]?([A-HＡ-Ｈ])[ \t]*[.．、:：)）】][ \t]*").ok();
    /// An option letter at line start or after whitespace/an opening bracket.
    static ref OPTION_MARKER: Option<Regex> =
        Regex::new(r"(?m)(?:^|[\s(（【])[(（【]?([A-HＡ-Ｈ])\s*[.．、:：)）】]\s*").ok();
}

/// Map full-width capital letters to ASCII.
pub fn normalize_letter(c: char) -> Option<char> {
    let c = match c {
        'Ａ'..='Ｚ' => char::from_u32(c as u32 - 'Ａ' as u32 + 'A' as u32)?,
        _ => c.to_ascii_uppercase(),
    };
    c.is_ascii_uppercase().then_some(c)
}

/// One option of a question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McqOption {
    pub letter: char,
    pub text: String,
}

/// A question split into stem and options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionBlock {
    pub stem: String,
    pub options: Vec<McqOption>,
}

impl OptionBlock {
    /// Split a question into stem and options.
    ///
    /// Returns `None` when fewer than two option markers are found.
    ///
    /// Options written one per line win over inline markers, so "Sample A:"
    /// inside an option's text does not open a new option. Inline markers are
    /// used when no line opens with A followed by a line opening with B.
    pub fn parse(question: &str) -> Option<Self> {
        let mut markers = find_markers(LINE_MARKER.as_ref()?, question);
        if paired_start(&markers).is_none() {
            markers = find_markers(OPTION_MARKER.as_ref()?, question);
        }

        let start = first_option_run(&markers)?;
        let markers = &markers[start..];

        let stem_end = marker_start(question, markers[0].0);
        let stem = question[..stem_end].trim().to_string();
        let options = markers
            .iter()
            .enumerate()
            .map(|(i, &(_, text_start, letter))| {
                let text_end = markers
                    .get(i + 1)
                    .map(|&(next, _, _)| marker_start(question, next))
                    .unwrap_or(question.len());
                McqOption {
                    letter,
                    text: question[text_start..text_end.max(text_start)].trim().to_string(),
                }
            })
            .collect();

        Some(Self { stem, options })
    }

    /// The same options under a new stem.
    pub fn with_stem(&self, stem: impl Into<String>) -> Self {
        Self {
            stem: stem.into(),
            options: self.options.clone(),
        }
    }

    /// Stem followed by one option per line.
    pub fn render(&self) -> String {
        let mut text = self.stem.trim().to_string();
        for option in &self.options {
            text.push_str(&format!("\n{}. {}", option.letter, option.text));
        }
        text
    }

    pub fn letters(&self) -> Vec<char> {
        self.options.iter().map(|o| o.letter).collect()
    }

    /// Letters run A, B, C, ... without gaps or repeats.
    pub fn is_contiguous(&self) -> bool {
        self.options
            .iter()
            .enumerate()
            .all(|(i, o)| o.letter as u32 == 'A' as u32 + i as u32)
    }

    /// Contiguous, with an option count allowed by `mode`, no empty options.
    pub fn is_well_formed(&self, mode: QuestionMode) -> bool {
        let (min, max) = mode.option_range();
        let count = self.options.len();
        self.is_contiguous()
            && (min..=max).contains(&count)
            && self.options.iter().all(|o| !o.text.is_empty())
    }

    pub fn option_text(&self, letter: char) -> Option<&str> {
        let letter = normalize_letter(letter)?;
        self.options
            .iter()
            .find(|o| o.letter == letter)
            .map(|o| o.text.as_str())
    }

    /// True when the correct option is the single longest one.
    ///
    /// Solvers learn to pick the longest option; a key that always sits
    /// there is a shortcut.
    pub fn answer_is_longest(&self, answer: char) -> bool {
        let Some(answer_len) = self.option_text(answer).map(|t| t.chars().count()) else {
            return false;
        };
        let longer_or_equal = self
            .options
            .iter()
            .filter(|o| o.text.chars().count() >= answer_len)
            .count();
        longer_or_equal == 1 && self.options.len() > 1
    }
}

/// `(letter offset, text offset, letter)` for every match of `marker`.
fn find_markers(marker: &Regex, question: &str) -> Vec<(usize, usize, char)> {
    marker
        .captures_iter(question)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let letter = caps.get(1)?;
            let c = normalize_letter(letter.as_str().chars().next()?)?;
            Some((letter.start(), whole.end(), c))
        })
        .collect()
}

/// Index of the first A marker directly followed by a B marker.
fn paired_start(markers: &[(usize, usize, char)]) -> Option<usize> {
    markers
        .windows(2)
        .position(|pair| pair[0].2 == 'A' && pair[1].2 == 'B')
}

/// Index of the first marker of a run starting at 'A'.
///
/// Stray letters in the stem (e.g. "Plan B.") are skipped by requiring the
/// block to start with an A directly followed by B. Without such a pair the
/// last A with at least one marker after it is taken, so broken blocks still
/// parse and fail validation.
fn first_option_run(markers: &[(usize, usize, char)]) -> Option<usize> {
    let start = match paired_start(markers) {
        Some(start) => start,
        None => markers.iter().rposition(|m| m.2 == 'A')?,
    };
    (markers.len() - start >= 2).then_some(start)
}

/// Walk back over an opening bracket so it is not left in the stem.
fn marker_start(text: &str, letter_start: usize) -> usize {
    let prefix = &text[..letter_start];
    match prefix.chars().last() {
        Some(c @ ('(' | '（' | '【')) => letter_start - c.len_utf8(),
        _ => letter_start,
    }
}

/// Whether the question carries a well-formed option block.
pub fn has_valid_options(question: &str, mode: QuestionMode) -> bool {
    OptionBlock::parse(question)
        .map(|block| block.is_well_formed(mode))
        .unwrap_or(false)
}

/// The stem of a question, or the whole text when no options are found.
pub fn stem_of(question: &str) -> String {
    OptionBlock::parse(question)
        .map(|block| block.stem)
        .unwrap_or_else(|| question.trim().to_string())
}

/// Text of the option with the given letter.
pub fn option_text(question: &str, letter: char) -> Option<String> {
    OptionBlock::parse(question)?
        .option_text(letter)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUESTION: &str = "In the figure, which layer thickness matches the peak?\n\
        A. 12 nm\n\
        B. 18 nm\n\
        C. 25 nm\n\
        D. 40 nm";

    #[test]
    fn test_parse_line_options() {
        let block = OptionBlock::parse(QUESTION).unwrap();
        assert_eq!(
            block.stem,
            "In the figure, which layer thickness matches the peak?"
        );
        assert_eq!(block.letters(), vec!['A', 'B', 'C', 'D']);
        assert_eq!(block.option_text('c'), Some("25 nm"));
        assert!(block.is_well_formed(QuestionMode::SingleSelect));
        assert!(block.is_well_formed(QuestionMode::MultiSelect));
    }

    #[test]
    fn test_parse_inline_and_fullwidth() {
        let block = OptionBlock::parse("图中哪一项正确？ (A) 甲 (B) 乙 Ｃ、丙 D) 丁").unwrap();
        assert_eq!(block.stem, "图中哪一项正确？");
        assert_eq!(block.letters(), vec!['A', 'B', 'C', 'D']);
        assert_eq!(block.option_text('B'), Some("乙"));
    }

    #[test]
    fn test_missing_or_broken_blocks() {
        assert!(OptionBlock::parse("What is shown in the image?").is_none());
        assert!(!has_valid_options("Which one? A. x", QuestionMode::SingleSelect));
        assert!(!has_valid_options(
            "Which one?\nA. x\nB. y\nD. z\nE. w",
            QuestionMode::MultiSelect
        ));
        assert!(!has_valid_options(
            "Which one?\nA. x\nB. y\nC. z",
            QuestionMode::SingleSelect
        ));
    }

    #[test]
    fn test_multi_select_range() {
        let six = "Pick all.\nA. a\nB. b\nC. c\nD. d\nE. e\nF. f";
        assert!(has_valid_options(six, QuestionMode::MultiSelect));
        assert!(!has_valid_options(six, QuestionMode::SingleSelect));
    }

    #[test]
    fn test_stray_letter_in_stem_is_ignored() {
        let q = "Under Plan B. the line rises. Which value?\nA. 1\nB. 2\nC. 3\nD. 4";
        let block = OptionBlock::parse(q).unwrap();
        assert_eq!(block.letters(), vec!['A', 'B', 'C', 'D']);
        assert!(block.stem.ends_with("Which value?"));
    }

    #[test]
    fn test_letters_inside_option_text() {
        let q = "Which sample is thinnest?\n\
            A. the left film\n\
            B. rich in vitamin B. and iron\n\
            C. sample A: 12 nm\n\
            D. none of these";
        let block = OptionBlock::parse(q).unwrap();
        assert_eq!(block.stem, "Which sample is thinnest?");
        assert_eq!(block.letters(), vec!['A', 'B', 'C', 'D']);
        assert_eq!(block.option_text('B'), Some("rich in vitamin B. and iron"));
        assert_eq!(block.option_text('C'), Some("sample A: 12 nm"));
        assert!(has_valid_options(q, QuestionMode::SingleSelect));
        assert_eq!(option_text(q, 'D').as_deref(), Some("none of these"));

        let two_per_line = "Which one?\nA. x B. y\nC. z D. w";
        assert_eq!(OptionBlock::parse(two_per_line).unwrap().letters(), vec!['A', 'B', 'C', 'D']);
    }

    #[test]
    fn test_render_with_new_stem() {
        let block = OptionBlock::parse("图中哪一项正确？ (A) 甲 (B) 乙 Ｃ、丙 D) 丁").unwrap();
        let rendered = block.with_stem("图中哪一项成立？").render();
        assert_eq!(rendered, "图中哪一项成立？\nA. 甲\nB. 乙\nC. 丙\nD. 丁");
        assert_eq!(OptionBlock::parse(&rendered).unwrap().options, block.options);
    }

    #[test]
    fn test_answer_is_longest() {
        let q = "Q?\nA. short\nB. a much longer option text\nC. mid text\nD. tiny";
        let block = OptionBlock::parse(q).unwrap();
        assert!(block.answer_is_longest('B'));
        assert!(!block.answer_is_longest('A'));
    }

    #[test]
    fn test_question_mode_from_str() {
        assert_eq!("multi".parse::<QuestionMode>(), Ok(QuestionMode::MultiSelect));
        assert_eq!(" Single ".parse::<QuestionMode>(), Ok(QuestionMode::SingleSelect));
        assert!("both".parse::<QuestionMode>().is_err());
    }
}
