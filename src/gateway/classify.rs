use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    DataQuery,
    Creative,
    Reasoning,
    General,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::DataQuery => "data_query",
            RequestType::Creative => "creative",
            RequestType::Reasoning => "reasoning",
            RequestType::General => "general",
        }
    }

    /// Capabilities a gateway should offer to serve this kind of request.
    pub fn required_capabilities(self) -> &'static [&'static str] {
        match self {
            RequestType::DataQuery => &["analysis", "structured_output"],
            RequestType::Creative => &["creative", "long_form"],
            RequestType::Reasoning => &["reasoning", "analysis"],
            RequestType::General => &["chat"],
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct ClassificationRule {
    pub request_type: RequestType,
    pub keywords: &'static [&'static str],
}

/// Evaluated top to bottom; the first rule with a matching keyword wins.
pub const CLASSIFICATION_RULES: &[ClassificationRule] = &[
    ClassificationRule {
        request_type: RequestType::DataQuery,
        keywords: &[
            "revenue",
            "report",
            "data",
            "analytics",
            "metrics",
            "sql",
            "query",
            "dashboard",
            "quarterly",
            "sales",
            "pipeline",
            "kpi",
        ],
    },
    ClassificationRule {
        request_type: RequestType::Creative,
        keywords: &[
            "write",
            "draft",
            "story",
            "creative",
            "email",
            "blog",
            "slogan",
            "poem",
        ],
    },
    ClassificationRule {
        request_type: RequestType::Reasoning,
        keywords: &[
            "why",
            "explain",
            "reason",
            "compare",
            "evaluate",
            "strategy",
            "decide",
            "plan",
        ],
    },
];

const DATA_TERMS: &[&str] = &["data", "analytics", "metrics", "revenue", "report", "sql"];

pub fn classify(query: &str) -> RequestType {
    classify_with(CLASSIFICATION_RULES, query)
}

pub fn classify_with(rules: &[ClassificationRule], query: &str) -> RequestType {
    let lowered = query.to_lowercase();
    rules
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| lowered.contains(k)))
        .map(|rule| rule.request_type)
        .unwrap_or(RequestType::General)
}

pub fn mentions_data(query: &str) -> bool {
    let lowered = query.to_lowercase();
    DATA_TERMS.iter().any(|t| lowered.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quarterly_revenue_report_is_a_data_query() {
        assert_eq!(
            classify("Please generate quarterly revenue report for EMEA"),
            RequestType::DataQuery
        );
        assert!(mentions_data("generate quarterly revenue report"));
    }

    #[test]
    fn earlier_rules_take_precedence() {
        // Matches both the data and the creative rule.
        assert_eq!(classify("Write a sales email"), RequestType::DataQuery);
        assert_eq!(classify("Write a short poem"), RequestType::Creative);
        assert_eq!(classify("Explain why churn rose"), RequestType::Reasoning);
    }

    #[test]
    fn unmatched_queries_are_general() {
        assert_eq!(classify("hello there"), RequestType::General);
        assert_eq!(classify(""), RequestType::General);
    }

    #[test]
    fn custom_rule_tables_are_honoured() {
        let rules = [ClassificationRule {
            request_type: RequestType::Creative,
            keywords: &["tagline"],
        }];
        assert_eq!(classify_with(&rules, "A tagline please"), RequestType::Creative);
        assert_eq!(classify_with(&rules, "revenue"), RequestType::General);
    }
}
