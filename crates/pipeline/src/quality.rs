//! Output quality checks and summary extraction
//!
//! A completion is rejected when it is empty, or when a degenerate
//! repetition loop leaves too little text once cut away. A loop is a word
//! sequence of length `p` (1 ≤ p ≤ 4·n) repeated back to back at least
//! `threshold` times, with the repeated span covering at least
//! `n · threshold` words. The text is cut after the first copy.

use filingforge_common::config::PipelineConfig;
use filingforge_common::llm::Completion;

/// Maximum length of a derived summary, in characters
pub const SUMMARY_MAX_CHARS: usize = 280;

/// `error_state` recorded for empty output
pub const EMPTY_OUTPUT: &str = "empty_output";

/// `error_state` recorded when a loop leaves too little text
pub const REPETITION_LOOP: &str = "repetition_loop";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityPolicy {
    pub min_output_chars: usize,
    pub repetition_ngram: usize,
    pub repetition_threshold: usize,
}

impl QualityPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            min_output_chars: config.min_output_chars,
            repetition_ngram: config.repetition_ngram.max(1),
            repetition_threshold: config.repetition_threshold.max(2),
        }
    }

    /// Inspect a completion and produce the text to store
    pub fn check(&self, completion: &Completion) -> QualityReport {
        let mut warnings = Vec::new();

        if completion.text.trim().is_empty() {
            return QualityReport {
                text: String::new(),
                warnings,
                rejected: Some(EMPTY_OUTPUT.to_string()),
            };
        }

        let mut text = completion.text.trim().to_string();

        if let Some(cut) = self.find_loop(&text) {
            let kept = text[..cut].trim_end().to_string();
            warnings.push(format!(
                "repetition loop truncated ({} of {} chars kept)",
                kept.chars().count(),
                text.chars().count()
            ));
            text = kept;

            if text.chars().count() < self.min_output_chars {
                return QualityReport {
                    text,
                    warnings,
                    rejected: Some(REPETITION_LOOP.to_string()),
                };
            }
        }

        if completion.truncated_by_length() {
            warnings.push("output stopped at the max_output_tokens limit".to_string());
        }

        QualityReport {
            text,
            warnings,
            rejected: None,
        }
    }

    /// Byte offset at which the first detected loop starts repeating
    fn find_loop(&self, text: &str) -> Option<usize> {
        let words = word_spans(text);
        let n = self.repetition_ngram;
        let threshold = self.repetition_threshold;
        let max_period = n * 4;
        let min_span = n * threshold;

        let same = |a: usize, b: usize, len: usize| {
            (0..len).all(|k| words[a + k].1.eq_ignore_ascii_case(words[b + k].1))
        };

        for start in 0..words.len() {
            for period in 1..=max_period {
                if start + period * threshold > words.len() {
                    break;
                }
                let mut copies = 1;
                while start + (copies + 1) * period <= words.len()
                    && same(start, start + copies * period, period)
                {
                    copies += 1;
                }
                if copies >= threshold && copies * period >= min_span {
                    return Some(words[start + period].0);
                }
            }
        }
        None
    }
}

/// Result of the quality check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityReport {
    /// Cleaned output text
    pub text: String,
    pub warnings: Vec<String>,
    /// `error_state` to persist when the output is unusable
    pub rejected: Option<String>,
}

fn word_spans(text: &str) -> Vec<(usize, &str)> {
    let mut spans = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                spans.push((s, &text[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        spans.push((s, &text[s..]));
    }
    spans
}

/// Short summary of an output: the model's leading `Summary:` line when
/// present, otherwise the first sentences up to `SUMMARY_MAX_CHARS`
pub fn derive_summary(text: &str) -> String {
    let first_line = text.lines().map(str::trim).find(|l| !l.is_empty());
    if let Some(line) = first_line {
        if line.get(..8).is_some_and(|p| p.eq_ignore_ascii_case("summary:")) {
            let rest = line[8..].trim();
            if !rest.is_empty() {
                return clip_chars(rest, SUMMARY_MAX_CHARS);
            }
        }
    }

    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut summary = String::new();
    for sentence in sentences(&flat) {
        if summary.chars().count() + sentence.chars().count() + 1 > SUMMARY_MAX_CHARS {
            break;
        }
        if !summary.is_empty() {
            summary.push(' ');
        }
        summary.push_str(sentence);
    }

    if summary.is_empty() {
        clip_chars(&flat, SUMMARY_MAX_CHARS)
    } else {
        summary
    }
}

fn sentences(text: &str) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = rest
            .char_indices()
            .find(|&(i, c)| {
                matches!(c, '.' | '!' | '?')
                    && rest[i + c.len_utf8()..].starts_with(' ')
            })
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(rest.len());
        let sentence = rest[..end].trim();
        rest = rest[end..].trim_start();
        Some(sentence)
    })
}

/// Clip at a word boundary, marking the cut with an ellipsis
fn clip_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max.saturating_sub(3)).collect();
    let cut = match cut.rfind(' ') {
        Some(i) if i > 0 => &cut[..i],
        _ => cut.as_str(),
    };
    format!("{}...", cut.trim_end())
}
