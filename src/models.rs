use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Execution surface a call ran on. Gateways carry their catalog name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Serverless,
    Gpu,
    Gateway(String),
}

impl BackendKind {
    pub fn label(&self) -> &str {
        match self {
            BackendKind::Serverless => "serverless",
            BackendKind::Gpu => "gpu",
            BackendKind::Gateway(name) => name,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One completed inference call. Written once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub backend: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_total: u64,
    pub cost_usd: f64,
    pub latency_ms: Option<u64>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CostPriority {
    LowCost,
    #[default]
    Balanced,
    Performance,
    LatencyCritical,
}

impl FromStr for CostPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "low_cost" => Ok(CostPriority::LowCost),
            "balanced" => Ok(CostPriority::Balanced),
            "performance" => Ok(CostPriority::Performance),
            "latency_critical" => Ok(CostPriority::LatencyCritical),
            other => Err(format!(
                "unknown cost priority '{other}'. Use low_cost, balanced, performance or latency_critical."
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingDecision {
    pub selected_backend: BackendKind,
    pub selected_model: String,
    pub cost_priority: CostPriority,
    pub complexity: Complexity,
    pub used_fallback: bool,
}

/// Caller-facing options bag for a routed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub model: Option<String>,
    pub cost_priority: CostPriority,
    pub force_backend: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub user_id: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            model: None,
            cost_priority: CostPriority::Balanced,
            force_backend: None,
            max_tokens: 1024,
            temperature: 0.7,
            user_id: None,
        }
    }
}

/// Sampling parameters sent to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub frequency_penalty: Option<f32>,
    pub presence_penalty: Option<f32>,
    /// Skip response-cache lookups in front of the provider.
    pub bypass_cache: bool,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.7,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            bypass_cache: false,
        }
    }
}

impl From<&GenerateOptions> for GenerationParams {
    fn from(opts: &GenerateOptions) -> Self {
        Self {
            max_tokens: opts.max_tokens,
            temperature: opts.temperature,
            ..Self::default()
        }
    }
}

/// Result of a single successful backend call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Generation {
    pub content: String,
    pub model: String,
    pub backend: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub tokens_total: u64,
    pub latency_ms: u64,
    #[serde(default)]
    pub cached: bool,
}

/// What the Hybrid Router hands back to its caller, success or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteResponse {
    pub content: String,
    pub model: String,
    pub backend: String,
    pub tokens_total: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub used_fallback: bool,
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<RoutingDecision>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RouteResponse {
    pub fn degraded(error: impl Into<String>, decision: Option<RoutingDecision>) -> Self {
        Self {
            content: DEGRADED_REPLY.to_string(),
            model: String::new(),
            backend: String::new(),
            tokens_total: 0,
            cost_usd: 0.0,
            latency_ms: 0,
            used_fallback: decision.as_ref().is_some_and(|d| d.used_fallback),
            degraded: true,
            decision,
            error: Some(error.into()),
        }
    }
}

pub const DEGRADED_REPLY: &str =
    "Sorry, no inference backend could answer this request right now. Please try again shortly.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeWindow {
    OneDay,
    SevenDays,
    ThirtyDays,
}

impl TimeWindow {
    pub fn as_label(self) -> &'static str {
        match self {
            TimeWindow::OneDay => "1d",
            TimeWindow::SevenDays => "7d",
            TimeWindow::ThirtyDays => "30d",
        }
    }

    pub fn as_hours(self) -> i64 {
        match self {
            TimeWindow::OneDay => 24,
            TimeWindow::SevenDays => 24 * 7,
            TimeWindow::ThirtyDays => 24 * 30,
        }
    }
}
