//! Response quality checks applied before a gateway answer is returned.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

const MIN_SENTENCE_CHARS: usize = 10;
const MIN_DISTINCT_SENTENCES: usize = 2;
const MIN_DISTINCT_SENTENCE_RATIO: f64 = 0.5;

const BUSINESS_TERMS: &[&str] = &[
    "revenue",
    "customer",
    "sales",
    "pipeline",
    "deal",
    "growth",
    "market",
    "cost",
    "margin",
    "quarter",
    "forecast",
    "account",
    "churn",
    "retention",
    "strategy",
    "product",
    "performance",
    "metric",
    "data",
    "team",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityThresholds {
    pub min_length: usize,
    pub max_length: usize,
    pub min_business_terms: usize,
}

impl Default for QualityThresholds {
    fn default() -> Self {
        Self {
            min_length: 50,
            max_length: 8000,
            min_business_terms: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum QualityIssue {
    TooShort { length: usize, min: usize },
    TooLong { length: usize, max: usize },
    Incoherent { distinct_sentences: usize },
    Repetitive,
    MissingBusinessTerms { found: usize, required: usize },
}

impl fmt::Display for QualityIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QualityIssue::TooShort { length, min } => {
                write!(f, "response too short ({length} < {min} chars)")
            }
            QualityIssue::TooLong { length, max } => {
                write!(f, "response too long ({length} > {max} chars)")
            }
            QualityIssue::Incoherent { distinct_sentences } => write!(
                f,
                "only {distinct_sentences} substantial sentence(s), need {MIN_DISTINCT_SENTENCES}"
            ),
            QualityIssue::Repetitive => f.write_str("response repeats itself"),
            QualityIssue::MissingBusinessTerms { found, required } => {
                write!(f, "{found} business term(s) found, need {required}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QualityReport {
    pub passed: bool,
    /// Fraction of checks passed, in `[0, 1]`.
    pub score: f64,
    pub issues: Vec<QualityIssue>,
}

#[derive(Debug, Clone, Default)]
pub struct QualityValidator {
    thresholds: QualityThresholds,
}

const CHECKS: usize = 5;

impl QualityValidator {
    pub fn new(thresholds: QualityThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    pub fn validate(&self, response: &str) -> QualityReport {
        let t = &self.thresholds;
        let text = response.trim();
        let length = text.chars().count();
        let mut issues = Vec::new();

        if length < t.min_length {
            issues.push(QualityIssue::TooShort {
                length,
                min: t.min_length,
            });
        }
        if length > t.max_length {
            issues.push(QualityIssue::TooLong {
                length,
                max: t.max_length,
            });
        }

        let sentences = substantial_sentences(text);
        let distinct: HashSet<&str> = sentences.iter().map(String::as_str).collect();
        if distinct.len() < MIN_DISTINCT_SENTENCES {
            issues.push(QualityIssue::Incoherent {
                distinct_sentences: distinct.len(),
            });
        }
        if !sentences.is_empty()
            && (distinct.len() as f64 / sentences.len() as f64) < MIN_DISTINCT_SENTENCE_RATIO
        {
            issues.push(QualityIssue::Repetitive);
        }

        let found = count_business_terms(text);
        if found < t.min_business_terms {
            issues.push(QualityIssue::MissingBusinessTerms {
                found,
                required: t.min_business_terms,
            });
        }

        QualityReport {
            passed: issues.is_empty(),
            score: (CHECKS - issues.len().min(CHECKS)) as f64 / CHECKS as f64,
            issues,
        }
    }
}

fn substantial_sentences(text: &str) -> Vec<String> {
    text.split(['.', '!', '?', '\n'])
        .map(|s| s.trim().to_lowercase())
        .filter(|s| s.chars().count() >= MIN_SENTENCE_CHARS)
        .collect()
}

fn count_business_terms(text: &str) -> usize {
    let lowered = text.to_lowercase();
    BUSINESS_TERMS.iter().filter(|t| lowered.contains(*t)).count()
}
