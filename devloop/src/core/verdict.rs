//! Tolerant parsing of the reviewer's quality verdict.
//!
//! Reviewers wrap JSON in prose or code fences more often than not, so parsing
//! cascades through increasingly loose extraction strategies. Each candidate
//! must match the verdict schema before it is accepted. Parsing never fails:
//! when nothing usable is found the result is a synthetic "invalid, score 0"
//! assessment.

use std::sync::LazyLock;

use jsonschema::{Draft, Validator};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::core::budget::tail_chars;

const VERDICT_SCHEMA: &str = include_str!("../../schemas/quality_verdict.schema.json");

static VERDICT_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(VERDICT_SCHEMA).expect("verdict schema should be valid json");
    jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .expect("verdict schema should compile")
});

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```[A-Za-z]*[ \t]*\n?(.*?)```").expect("fence regex compiles")
});

/// How a verdict was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Direct,
    BraceSpan,
    Fenced,
    /// Nothing parseable; synthetic result.
    ParseFailure,
    /// The reviewer could not be reached.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub valid: bool,
    /// Normalized to `[0, 1]`.
    pub score: f64,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub source: VerdictSource,
}

impl QualityAssessment {
    pub fn parse_failure(raw: &str) -> Self {
        Self {
            valid: false,
            score: 0.0,
            issues: vec![format!(
                "parse failure: reviewer response was not a verdict ({})",
                excerpt(raw)
            )],
            suggestions: Vec::new(),
            source: VerdictSource::ParseFailure,
        }
    }

    pub fn unavailable(reason: impl AsRef<str>) -> Self {
        Self {
            valid: false,
            score: 0.0,
            issues: vec![format!("scoring unavailable: {}", reason.as_ref())],
            suggestions: Vec::new(),
            source: VerdictSource::Unavailable,
        }
    }

    /// Assessment used when a hard validation failure skips the reviewer.
    pub fn skipped(reason: impl AsRef<str>) -> Self {
        Self {
            valid: false,
            score: 0.0,
            issues: vec![format!("not reviewed: {}", reason.as_ref())],
            suggestions: Vec::new(),
            source: VerdictSource::Unavailable,
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(
            self.source,
            VerdictSource::ParseFailure | VerdictSource::Unavailable
        )
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    valid: bool,
    score: f64,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
}

/// Parse a reviewer response: direct JSON, then the outermost brace span, then fenced blocks.
pub fn parse_quality_verdict(raw: &str) -> QualityAssessment {
    let trimmed = raw.trim();

    if let Some(verdict) = try_candidate(trimmed) {
        return verdict.into_assessment(VerdictSource::Direct);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
        && let Some(verdict) = try_candidate(&trimmed[start..=end])
    {
        return verdict.into_assessment(VerdictSource::BraceSpan);
    }

    for caps in FENCE_RE.captures_iter(trimmed) {
        let Some(body) = caps.get(1) else {
            continue;
        };
        if let Some(verdict) = try_candidate(body.as_str().trim()) {
            return verdict.into_assessment(VerdictSource::Fenced);
        }
    }

    debug!(len = raw.len(), "reviewer response had no usable verdict");
    QualityAssessment::parse_failure(raw)
}

fn try_candidate(text: &str) -> Option<RawVerdict> {
    let value: Value = serde_json::from_str(text).ok()?;
    if !VERDICT_VALIDATOR.is_valid(&value) {
        return None;
    }
    serde_json::from_value(value).ok()
}

impl RawVerdict {
    fn into_assessment(self, source: VerdictSource) -> QualityAssessment {
        QualityAssessment {
            valid: self.valid,
            score: normalize_score(self.score),
            issues: clean(self.issues),
            suggestions: clean(self.suggestions),
            source,
        }
    }
}

/// Map 0-10 and 0-100 scales onto `[0, 1]`.
pub fn normalize_score(score: f64) -> f64 {
    if !score.is_finite() {
        return 0.0;
    }
    let scaled = if score <= 1.0 {
        score
    } else if score <= 10.0 {
        score / 10.0
    } else {
        score / 100.0
    };
    scaled.clamp(0.0, 1.0)
}

fn clean(items: Vec<String>) -> Vec<String> {
    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn excerpt(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "empty response".to_string();
    }
    format!("...{}", tail_chars(trimmed, 120))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_json() {
        let verdict = parse_quality_verdict(
            r#"{"valid": true, "score": 0.85, "issues": [], "suggestions": ["add docs"]}"#,
        );
        assert_eq!(verdict.source, VerdictSource::Direct);
        assert!(verdict.valid);
        assert!((verdict.score - 0.85).abs() < 1e-9);
        assert_eq!(verdict.suggestions, vec!["add docs"]);
    }

    #[test]
    fn extracts_json_from_surrounding_prose() {
        let raw = "Here is my review:\n{\"valid\": false, \"score\": 4, \"issues\": [\"no tests\"]}\nThanks!";
        let verdict = parse_quality_verdict(raw);
        assert_eq!(verdict.source, VerdictSource::BraceSpan);
        assert!(!verdict.valid);
        assert!((verdict.score - 0.4).abs() < 1e-9);
        assert_eq!(verdict.issues, vec!["no tests"]);
    }

    /// Verifies fenced extraction when prose around the fence contains stray braces.
    #[test]
    fn falls_back_to_fenced_block() {
        let raw = "Use {braces} carefully.\n```json\n{\"valid\": true, \"score\": 90}\n```\nDone }";
        let verdict = parse_quality_verdict(raw);
        assert_eq!(verdict.source, VerdictSource::Fenced);
        assert!((verdict.score - 0.9).abs() < 1e-9);
    }

    #[test]
    fn schema_rejects_wrong_types() {
        let verdict = parse_quality_verdict(r#"{"valid": "yes", "score": 0.9}"#);
        assert_eq!(verdict.source, VerdictSource::ParseFailure);
        assert!(!verdict.valid);
        assert_eq!(verdict.score, 0.0);
        assert!(verdict.issues[0].starts_with("parse failure"));
    }

    #[test]
    fn garbage_yields_synthetic_failure() {
        let verdict = parse_quality_verdict("I think it looks fine overall.");
        assert!(verdict.is_synthetic());
        assert_eq!(verdict.score, 0.0);

        let empty = parse_quality_verdict("");
        assert!(empty.issues[0].contains("empty response"));
    }

    #[test]
    fn scores_normalize_into_unit_range() {
        assert_eq!(normalize_score(0.5), 0.5);
        assert_eq!(normalize_score(7.0), 0.7);
        assert_eq!(normalize_score(85.0), 0.85);
        assert_eq!(normalize_score(-1.0), 0.0);
        assert_eq!(normalize_score(f64::NAN), 0.0);
    }
}
