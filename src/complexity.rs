use crate::models::{ChatMessage, Complexity, Role};

pub trait ComplexityAnalyzer: Send + Sync {
    fn assess(&self, messages: &[ChatMessage]) -> Complexity;
}

const DEMANDING_MARKERS: &[&str] = &[
    "analyze",
    "analyse",
    "compare",
    "strategy",
    "architecture",
    "step by step",
    "comprehensive",
    "in depth",
    "trade-off",
    "tradeoff",
    "root cause",
    "forecast",
    "prove",
];

const GREETINGS: &[&str] = &["hello", "hi", "hey", "thanks", "thank you"];

fn opens_with_greeting(text: &str) -> bool {
    let text = text.trim_start();
    GREETINGS.iter().any(|g| {
        text.strip_prefix(g)
            .is_some_and(|rest| !rest.starts_with(char::is_alphanumeric))
    })
}

/// Length and keyword heuristic over the user turns.
#[derive(Debug, Clone)]
pub struct HeuristicAnalyzer {
    pub low_max_chars: usize,
    pub high_min_chars: usize,
}

impl Default for HeuristicAnalyzer {
    fn default() -> Self {
        Self {
            low_max_chars: 160,
            high_min_chars: 2000,
        }
    }
}

impl ComplexityAnalyzer for HeuristicAnalyzer {
    fn assess(&self, messages: &[ChatMessage]) -> Complexity {
        let text = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.content.to_lowercase())
            .collect::<Vec<_>>()
            .join("\n");
        let chars = text.chars().count();

        if chars >= self.high_min_chars || DEMANDING_MARKERS.iter().any(|m| text.contains(m)) {
            return Complexity::High;
        }
        if chars <= self.low_max_chars || opens_with_greeting(&text) {
            return Complexity::Low;
        }
        Complexity::Medium
    }
}
