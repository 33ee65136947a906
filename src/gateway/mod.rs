//! Quality Gateway: scores gateway providers for a query, executes on the
//! best one, validates the answer and retries once on the runner-up with
//! stricter instructions.

pub mod cache;
pub mod catalog;
pub mod classify;
pub mod history;
pub mod validate;

use crate::backends::BackendClient;
use crate::config::PricingOverride;
use crate::error::BackendError;
use crate::ledger::UsageLedger;
use crate::models::{ChatMessage, Generation, GenerationParams, UsageRecord};
use crate::pricing::cost_for;
use catalog::{score_gateways, GatewayProfile, GatewayScore};
use chrono::Utc;
use classify::{classify, RequestType};
use history::{GatewayStats, HistoryEntry, Outcome, PerformanceHistory};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use validate::{QualityReport, QualityValidator};

pub const APOLOGY_REPLY: &str =
    "Sorry, I could not produce a reliable answer right now. Please try again in a moment.";

const BASE_INSTRUCTION: &str = "You are a business intelligence assistant. Answer precisely \
                                and ground every claim in the supplied context.";

const ELEVATED_MAX_TOKENS_FACTOR: f64 = 1.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityPriority {
    Maximum,
    High,
    #[default]
    Balanced,
}

impl QualityPriority {
    fn params(self, max_tokens: u32) -> GenerationParams {
        let (temperature, top_p) = match self {
            QualityPriority::Maximum => (0.3, 0.95),
            QualityPriority::High | QualityPriority::Balanced => (0.7, 0.9),
        };
        GenerationParams {
            max_tokens,
            temperature,
            top_p: Some(top_p),
            ..GenerationParams::default()
        }
    }
}

impl FromStr for QualityPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "maximum" => Ok(QualityPriority::Maximum),
            "high" => Ok(QualityPriority::High),
            "balanced" => Ok(QualityPriority::Balanced),
            other => Err(format!(
                "unknown quality priority '{other}'. Use maximum, high or balanced."
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityRequest {
    pub query: String,
    pub context: Option<String>,
    pub priority: QualityPriority,
    pub max_tokens: u32,
    pub user_id: Option<String>,
}

impl QualityRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            context: None,
            priority: QualityPriority::default(),
            max_tokens: 1024,
            user_id: None,
        }
    }
}

/// Always returned by [`QualityGateway::process_request`]. Costs and tokens
/// cover every billed call made for the request, not only the returned one.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayResponse {
    pub content: String,
    pub gateway: String,
    pub model: String,
    pub request_type: RequestType,
    pub tokens_total: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub used_secondary: bool,
    pub degraded: bool,
    pub cached: bool,
    pub quality: Option<QualityReport>,
    pub scores: Vec<GatewayScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct GatewayCandidate {
    pub profile: GatewayProfile,
    pub client: Arc<dyn BackendClient>,
}

struct Attempt {
    generation: Generation,
    report: QualityReport,
}

pub struct QualityGateway {
    candidates: Vec<GatewayCandidate>,
    validator: QualityValidator,
    ledger: Option<Arc<dyn UsageLedger>>,
    pricing: Vec<PricingOverride>,
    request_timeout: Duration,
    history: Mutex<PerformanceHistory>,
}

impl QualityGateway {
    pub fn new(candidates: Vec<GatewayCandidate>, validator: QualityValidator) -> Self {
        Self {
            candidates,
            validator,
            ledger: None,
            pricing: Vec::new(),
            request_timeout: Duration::from_secs(45),
            history: Mutex::new(PerformanceHistory::default()),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_pricing(mut self, overrides: Vec<PricingOverride>) -> Self {
        self.pricing = overrides;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn candidate_names(&self) -> Vec<&str> {
        self.candidates.iter().map(|c| c.profile.name.as_str()).collect()
    }

    pub fn rank(&self, query: &str) -> (RequestType, Vec<GatewayScore>) {
        let request_type = classify(query);
        let profiles: Vec<GatewayProfile> =
            self.candidates.iter().map(|c| c.profile.clone()).collect();
        (request_type, score_gateways(&profiles, request_type, query))
    }

    fn candidate(&self, name: &str) -> Option<&GatewayCandidate> {
        self.candidates.iter().find(|c| c.profile.name == name)
    }

    fn messages(request: &QualityRequest, extra: Option<String>) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::system(BASE_INSTRUCTION)];
        if let Some(extra) = extra {
            messages.push(ChatMessage::system(extra));
        }
        if let Some(context) = request.context.as_deref().filter(|c| !c.trim().is_empty()) {
            messages.push(ChatMessage::system(format!("Context:\n{context}")));
        }
        messages.push(ChatMessage::user(request.query.clone()));
        messages
    }

    fn elevated_params(&self, request: &QualityRequest) -> GenerationParams {
        GenerationParams {
            max_tokens: (request.max_tokens as f64 * ELEVATED_MAX_TOKENS_FACTOR).ceil() as u32,
            temperature: 0.2,
            top_p: Some(0.95),
            bypass_cache: true,
            ..GenerationParams::default()
        }
    }

    fn elevated_instruction(&self) -> String {
        let t = self.validator.thresholds();
        format!(
            "The previous answer did not meet quality requirements. Give a complete answer of \
             at least {} characters in several distinct sentences and use concrete business \
             terminology (at least {} domain term(s)).",
            t.min_length, t.min_business_terms
        )
    }

    async fn call(
        &self,
        candidate: &GatewayCandidate,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<Generation, BackendError> {
        let timeout = self.request_timeout;
        match tokio::time::timeout(timeout, candidate.client.generate(messages, None, params)).await
        {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(candidate.client.name(), timeout)),
        }
    }

    async fn attempt(
        &self,
        candidate: &GatewayCandidate,
        messages: &[ChatMessage],
        params: &GenerationParams,
        request: &QualityRequest,
        spent: &mut (u64, f64),
    ) -> Result<Attempt, BackendError> {
        let generation = self.call(candidate, messages, params).await?;
        if !generation.cached {
            let cost = cost_for(
                &generation.model,
                generation.input_tokens,
                generation.output_tokens,
                &self.pricing,
            );
            spent.0 += generation.tokens_total;
            spent.1 += cost;
            if let Some(ledger) = &self.ledger {
                ledger
                    .record(UsageRecord {
                        timestamp: Utc::now(),
                        model: generation.model.clone(),
                        backend: candidate.profile.name.clone(),
                        input_tokens: generation.input_tokens,
                        output_tokens: generation.output_tokens,
                        tokens_total: generation.tokens_total,
                        cost_usd: cost,
                        latency_ms: Some(generation.latency_ms),
                        user_id: request.user_id.clone(),
                    })
                    .await;
            }
        }
        let report = self.validator.validate(&generation.content);
        Ok(Attempt { generation, report })
    }

    fn log_history(
        &self,
        gateway: &str,
        request_type: RequestType,
        outcome: Outcome,
        attempt: Option<&Attempt>,
    ) {
        let entry = HistoryEntry {
            timestamp: Utc::now(),
            gateway: gateway.to_string(),
            request_type: request_type.to_string(),
            outcome,
            quality_score: attempt.map(|a| a.report.score).unwrap_or(0.0),
            latency_ms: attempt.map(|a| a.generation.latency_ms).unwrap_or(0),
            cached: attempt.is_some_and(|a| a.generation.cached),
        };
        match self.history.lock() {
            Ok(mut history) => history.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn performance_summary(&self) -> BTreeMap<String, GatewayStats> {
        self.history.lock().map(|h| h.summary()).unwrap_or_default()
    }

    /// Never fails: provider errors and failed validation end in a degraded
    /// response rather than an error.
    pub async fn process_request(&self, request: &QualityRequest) -> GatewayResponse {
        let (request_type, scores) = self.rank(&request.query);
        let ranked: Vec<&GatewayCandidate> = scores
            .iter()
            .filter_map(|s| self.candidate(&s.gateway_name))
            .collect();
        let Some(&primary) = ranked.first() else {
            self.log_history("none", request_type, Outcome::Failed, None);
            return apology(request_type, scores, "no gateway configured".into());
        };
        let secondary = ranked.get(1).copied().unwrap_or(primary);

        tracing::debug!(
            event_name = "gateway.ranked",
            request_type = %request_type,
            primary = %primary.profile.name,
            secondary = %secondary.profile.name,
            "gateway candidates ranked"
        );

        let mut spent = (0u64, 0.0f64);
        let plain = Self::messages(request, None);
        let primary_params = request.priority.params(request.max_tokens);
        let primary_result = self
            .attempt(primary, &plain, &primary_params, request, &mut spent)
            .await;

        let first = match primary_result {
            Ok(attempt) if attempt.report.passed => {
                primary.client.remember(&plain, &attempt.generation);
                let name = &primary.profile.name;
                self.log_history(name, request_type, Outcome::Primary, Some(&attempt));
                return respond(attempt, name, request_type, scores, spent, false, false);
            }
            Ok(attempt) => {
                tracing::info!(
                    event_name = "gateway.validation_failed",
                    gateway = %primary.profile.name,
                    score = attempt.report.score,
                    "primary answer failed validation; retrying on secondary"
                );
                Some(attempt)
            }
            Err(err) => {
                tracing::warn!(
                    event_name = "gateway.primary_failed",
                    gateway = %primary.profile.name,
                    error = %err,
                    "primary gateway failed; retrying on secondary"
                );
                None
            }
        };

        let elevated = Self::messages(request, Some(self.elevated_instruction()));
        let secondary_result = self
            .attempt(
                secondary,
                &elevated,
                &self.elevated_params(request),
                request,
                &mut spent,
            )
            .await;

        let name = &secondary.profile.name;
        match (secondary_result, first) {
            (Ok(attempt), _) if attempt.report.passed => {
                secondary.client.remember(&plain, &attempt.generation);
                self.log_history(name, request_type, Outcome::Secondary, Some(&attempt));
                respond(attempt, name, request_type, scores, spent, true, false)
            }
            (Ok(attempt), _) => {
                tracing::warn!(
                    event_name = "gateway.degraded",
                    gateway = %name,
                    issues = attempt.report.issues.len(),
                    "secondary answer also failed validation"
                );
                self.log_history(name, request_type, Outcome::Degraded, Some(&attempt));
                respond(attempt, name, request_type, scores, spent, true, true)
            }
            (Err(err), Some(attempt)) => {
                tracing::warn!(
                    event_name = "gateway.secondary_failed",
                    gateway = %name,
                    error = %err,
                    "secondary gateway failed; returning unvalidated primary answer"
                );
                let name = &primary.profile.name;
                self.log_history(name, request_type, Outcome::Degraded, Some(&attempt));
                let mut response =
                    respond(attempt, name, request_type, scores, spent, false, true);
                response.error = Some(err.to_string());
                response
            }
            (Err(err), None) => {
                tracing::error!(
                    event_name = "gateway.exhausted",
                    error = %err,
                    "all gateways failed"
                );
                self.log_history(name, request_type, Outcome::Failed, None);
                apology(request_type, scores, err.to_string())
            }
        }
    }
}

fn respond(
    attempt: Attempt,
    gateway: &str,
    request_type: RequestType,
    scores: Vec<GatewayScore>,
    spent: (u64, f64),
    used_secondary: bool,
    degraded: bool,
) -> GatewayResponse {
    let error = degraded.then(|| {
        attempt
            .report
            .issues
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    });
    GatewayResponse {
        content: attempt.generation.content,
        gateway: gateway.to_string(),
        model: attempt.generation.model,
        request_type,
        tokens_total: spent.0,
        cost_usd: spent.1,
        latency_ms: attempt.generation.latency_ms,
        used_secondary,
        degraded,
        cached: attempt.generation.cached,
        quality: Some(attempt.report),
        scores,
        error,
    }
}

pub fn apology(
    request_type: RequestType,
    scores: Vec<GatewayScore>,
    error: String,
) -> GatewayResponse {
    GatewayResponse {
        content: APOLOGY_REPLY.to_string(),
        gateway: String::new(),
        model: String::new(),
        request_type,
        tokens_total: 0,
        cost_usd: 0.0,
        latency_ms: 0,
        used_secondary: false,
        degraded: true,
        cached: false,
        quality: None,
        scores,
        error: Some(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendErrorKind;
    use crate::ledger::SqliteLedger;
    use async_trait::async_trait;
    use catalog::default_catalog;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SOLID: &str = "Revenue for the quarter reached $4.2M, up 12% on the prior period. \
                         Enterprise deals drove most of the growth in the pipeline.";

    enum Reply {
        Text(&'static str),
        Fail,
    }

    struct Scripted {
        name: &'static str,
        reply: Reply,
        calls: AtomicUsize,
        remembered: AtomicUsize,
        last_params: Mutex<Option<GenerationParams>>,
    }

    impl Scripted {
        fn new(name: &'static str, reply: Reply) -> Arc<Self> {
            Arc::new(Self {
                name,
                reply,
                calls: AtomicUsize::new(0),
                remembered: AtomicUsize::new(0),
                last_params: Mutex::new(None),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BackendClient for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        fn default_model(&self) -> &str {
            "scripted"
        }

        async fn generate(
            &self,
            _messages: &[ChatMessage],
            _model: Option<&str>,
            params: &GenerationParams,
        ) -> Result<Generation, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_params.lock().expect("params lock") = Some(params.clone());
            match self.reply {
                Reply::Text(text) => Ok(Generation {
                    content: text.to_string(),
                    model: "scripted".into(),
                    backend: self.name.into(),
                    input_tokens: 10,
                    output_tokens: 20,
                    tokens_total: 30,
                    latency_ms: 3,
                    cached: false,
                }),
                Reply::Fail => Err(BackendError::new(
                    self.name,
                    BackendErrorKind::Http(503),
                    "unavailable",
                )),
            }
        }

        fn remember(&self, _messages: &[ChatMessage], _generation: &Generation) {
            self.remembered.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn gateway(portkey: Arc<Scripted>, openrouter: Arc<Scripted>) -> QualityGateway {
        let mut catalog = default_catalog().into_iter();
        let candidates = vec![
            GatewayCandidate {
                profile: catalog.next().expect("portkey profile"),
                client: portkey,
            },
            GatewayCandidate {
                profile: catalog.next().expect("openrouter profile"),
                client: openrouter,
            },
        ];
        QualityGateway::new(candidates, QualityValidator::default())
    }

    #[tokio::test]
    async fn revenue_report_goes_to_data_gateway() {
        let portkey = Scripted::new("portkey", Reply::Text(SOLID));
        let openrouter = Scripted::new("openrouter", Reply::Text(SOLID));
        let gw = gateway(portkey.clone(), openrouter.clone());

        let response = gw
            .process_request(&QualityRequest::new("generate quarterly revenue report"))
            .await;
        assert_eq!(response.request_type, RequestType::DataQuery);
        assert_eq!(response.gateway, "portkey");
        assert!(!response.degraded);
        assert!(!response.used_secondary);
        assert_eq!(portkey.calls(), 1);
        assert_eq!(openrouter.calls(), 0);
    }

    #[tokio::test]
    async fn short_answer_triggers_secondary_with_elevated_settings() {
        let portkey = Scripted::new("portkey", Reply::Text("Hello"));
        let openrouter = Scripted::new("openrouter", Reply::Text(SOLID));
        let gw = gateway(portkey.clone(), openrouter.clone());

        let mut request = QualityRequest::new("quarterly revenue by region");
        request.max_tokens = 1000;
        let response = gw.process_request(&request).await;

        assert_eq!(response.gateway, "openrouter");
        assert!(response.used_secondary);
        assert!(!response.degraded);
        assert_eq!(response.content, SOLID);
        assert_eq!(response.tokens_total, 60);

        let params = openrouter
            .last_params
            .lock()
            .expect("params lock")
            .clone()
            .expect("secondary called");
        assert_eq!(params.max_tokens, 1500);
        assert_eq!(params.temperature, 0.2);
        assert_eq!(params.top_p, Some(0.95));
        assert!(params.bypass_cache);

        assert_eq!(portkey.remembered.load(Ordering::SeqCst), 0);
        assert_eq!(openrouter.remembered.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn primary_error_recovers_on_secondary() {
        let portkey = Scripted::new("portkey", Reply::Fail);
        let openrouter = Scripted::new("openrouter", Reply::Text(SOLID));
        let gw = gateway(portkey.clone(), openrouter.clone());

        let response = gw
            .process_request(&QualityRequest::new("revenue by quarter"))
            .await;

        assert_eq!(portkey.calls(), 1);
        assert_eq!(openrouter.calls(), 1);
        assert_eq!(response.gateway, "openrouter");
        assert!(response.used_secondary);
        assert!(!response.degraded);
        assert!(response.error.is_none());
        assert_eq!(response.content, SOLID);
        assert_eq!(response.tokens_total, 30);

        let summary = gw.performance_summary();
        assert_eq!(gw.history_len(), 1);
        assert_eq!(summary["openrouter"].calls, 1);
        assert_eq!(summary["openrouter"].degraded, 0);
    }

    #[tokio::test]
    async fn secondary_error_returns_unvalidated_primary_as_degraded() {
        let portkey = Scripted::new("portkey", Reply::Text("Hello"));
        let openrouter = Scripted::new("openrouter", Reply::Fail);
        let gw = gateway(portkey.clone(), openrouter.clone());

        let response = gw
            .process_request(&QualityRequest::new("revenue by quarter"))
            .await;

        assert_eq!(openrouter.calls(), 1);
        assert_eq!(response.gateway, "portkey");
        assert_eq!(response.content, "Hello");
        assert!(response.degraded);
        assert!(!response.used_secondary);
        assert!(response.error.expect("error").contains("unavailable"));
        assert_eq!(response.tokens_total, 30);
        assert_eq!(portkey.remembered.load(Ordering::SeqCst), 0);

        let summary = gw.performance_summary();
        assert_eq!(gw.history_len(), 1);
        assert_eq!(summary["portkey"].calls, 1);
        assert_eq!(summary["portkey"].degraded, 1);
        assert!(!summary.contains_key("openrouter"));
    }

    #[tokio::test]
    async fn maximum_priority_lowers_temperature() {
        let portkey = Scripted::new("portkey", Reply::Text(SOLID));
        let gw = gateway(portkey.clone(), Scripted::new("openrouter", Reply::Fail));

        let mut request = QualityRequest::new("sales metrics for EMEA");
        request.priority = QualityPriority::Maximum;
        gw.process_request(&request).await;

        let params = portkey
            .last_params
            .lock()
            .expect("params lock")
            .clone()
            .expect("primary called");
        assert_eq!(params.temperature, 0.3);
        assert_eq!(params.top_p, Some(0.95));
    }

    #[tokio::test]
    async fn double_validation_failure_is_marked_degraded() {
        let gw = gateway(
            Scripted::new("portkey", Reply::Text("Hello")),
            Scripted::new("openrouter", Reply::Text("Hi")),
        );
        let response = gw.process_request(&QualityRequest::new("revenue data")).await;
        assert!(response.degraded);
        assert_eq!(response.content, "Hi");
        assert!(response.error.expect("issues").contains("too short"));
    }

    #[tokio::test]
    async fn total_failure_returns_apology() {
        let gw = gateway(
            Scripted::new("portkey", Reply::Fail),
            Scripted::new("openrouter", Reply::Fail),
        );
        let response = gw.process_request(&QualityRequest::new("revenue data")).await;
        assert!(response.degraded);
        assert_eq!(response.content, APOLOGY_REPLY);
        assert!(response.error.expect("error").contains("unavailable"));
        assert_eq!(gw.history_len(), 1);
    }

    #[tokio::test]
    async fn single_candidate_retries_on_itself() {
        let only = Scripted::new("portkey", Reply::Text("Hello"));
        let candidates = vec![GatewayCandidate {
            profile: default_catalog().remove(0),
            client: only.clone(),
        }];
        let gw = QualityGateway::new(candidates, QualityValidator::default());
        let response = gw.process_request(&QualityRequest::new("hello")).await;
        assert_eq!(only.calls(), 2);
        assert!(response.degraded);
    }

    #[tokio::test]
    async fn empty_catalog_degrades_without_panicking() {
        let gw = QualityGateway::new(Vec::new(), QualityValidator::default());
        let response = gw.process_request(&QualityRequest::new("anything")).await;
        assert!(response.degraded);
        assert_eq!(response.error.as_deref(), Some("no gateway configured"));
    }

    #[tokio::test]
    async fn every_billed_call_is_recorded_once() {
        let ledger = Arc::new(SqliteLedger::open_in_memory().expect("ledger"));
        let gw = gateway(
            Scripted::new("portkey", Reply::Text("Hello")),
            Scripted::new("openrouter", Reply::Text(SOLID)),
        )
        .with_ledger(ledger.clone());

        gw.process_request(&QualityRequest::new("pipeline report")).await;
        let rows = ledger.export_records().await.expect("rows");
        let mut backends: Vec<_> = rows.iter().map(|r| r.backend.as_str()).collect();
        backends.sort_unstable();
        assert_eq!(backends, ["openrouter", "portkey"]);
        assert_eq!(gw.performance_summary()["openrouter"].calls, 1);
    }
}
