use crate::backends::lambda::{ModelTiers, GPU, SERVERLESS};
use crate::backends::BackendClient;
use crate::complexity::ComplexityAnalyzer;
use crate::config::PricingOverride;
use crate::error::{BackendError, RouteError};
use crate::ledger::UsageLedger;
use crate::models::{
    BackendKind, ChatMessage, Complexity, CostPriority, GenerateOptions, Generation,
    GenerationParams, RouteResponse, RoutingDecision, UsageRecord,
};
use crate::pricing::cost_for;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DEFAULT_SERVERLESS_RATIO: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub serverless_ratio: f64,
    pub models: ModelTiers,
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            serverless_ratio: DEFAULT_SERVERLESS_RATIO,
            models: ModelTiers::default(),
            request_timeout: Duration::from_secs(45),
        }
    }
}

/// Chooses between serverless and dedicated GPU execution per request.
///
/// Routing order: forced backend, then complexity and cost priority
/// shortcuts, then a weighted coin flip on `serverless_ratio`. A failed
/// primary call is retried once on the other backend unless the caller
/// forced a backend.
pub struct HybridRouter {
    config: RouterConfig,
    serverless: Option<Arc<dyn BackendClient>>,
    gpu: Option<Arc<dyn BackendClient>>,
    analyzer: Option<Arc<dyn ComplexityAnalyzer>>,
    ledger: Option<Arc<dyn UsageLedger>>,
    pricing: Vec<PricingOverride>,
    rng: Mutex<StdRng>,
}

impl HybridRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            config,
            serverless: None,
            gpu: None,
            analyzer: None,
            ledger: None,
            pricing: Vec::new(),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_serverless(mut self, client: Arc<dyn BackendClient>) -> Self {
        self.serverless = Some(client);
        self
    }

    pub fn with_gpu(mut self, client: Arc<dyn BackendClient>) -> Self {
        self.gpu = Some(client);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ComplexityAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn UsageLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_pricing(mut self, overrides: Vec<PricingOverride>) -> Self {
        self.pricing = overrides;
        self
    }

    pub fn with_seed(self, seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            ..self
        }
    }

    fn client(&self, backend: &BackendKind) -> Option<&Arc<dyn BackendClient>> {
        match backend {
            BackendKind::Serverless => self.serverless.as_ref(),
            BackendKind::Gpu => self.gpu.as_ref(),
            BackendKind::Gateway(_) => None,
        }
    }

    pub fn select_model(&self, complexity: Complexity, priority: CostPriority) -> String {
        let tiers = &self.config.models;
        if priority == CostPriority::LowCost || complexity == Complexity::Low {
            return tiers.small.clone();
        }
        if complexity == Complexity::High {
            return tiers.large.clone();
        }
        tiers.default.clone()
    }

    fn split(&self) -> BackendKind {
        match (self.serverless.is_some(), self.gpu.is_some()) {
            (true, false) => return BackendKind::Serverless,
            (false, true) => return BackendKind::Gpu,
            _ => {}
        }
        let ratio = match self.config.serverless_ratio {
            r if r.is_nan() => DEFAULT_SERVERLESS_RATIO,
            r => r.clamp(0.0, 1.0),
        };
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if rng.gen_bool(ratio) {
            BackendKind::Serverless
        } else {
            BackendKind::Gpu
        }
    }

    pub fn select_backend(&self, complexity: Complexity, priority: CostPriority) -> BackendKind {
        // Latency-critical beats the low-complexity shortcut: reserved
        // capacity is the only latency guarantee available.
        if priority == CostPriority::LatencyCritical {
            return BackendKind::Gpu;
        }
        if complexity == Complexity::Low || priority == CostPriority::LowCost {
            return BackendKind::Serverless;
        }
        self.split()
    }

    pub fn plan(
        &self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> Result<RoutingDecision, RouteError> {
        let complexity = self
            .analyzer
            .as_ref()
            .map(|a| a.assess(messages))
            .unwrap_or_default();
        let selected_model = opts
            .model
            .clone()
            .unwrap_or_else(|| self.select_model(complexity, opts.cost_priority));
        let selected_backend = match opts.force_backend.as_deref() {
            Some(forced) => parse_forced_backend(forced)?,
            None => self.select_backend(complexity, opts.cost_priority),
        };

        Ok(RoutingDecision {
            selected_backend,
            selected_model,
            cost_priority: opts.cost_priority,
            complexity,
            used_fallback: false,
        })
    }

    fn alternate(&self, primary: &BackendKind) -> Option<(BackendKind, &Arc<dyn BackendClient>)> {
        let other = match primary {
            BackendKind::Serverless => BackendKind::Gpu,
            BackendKind::Gpu => BackendKind::Serverless,
            BackendKind::Gateway(_) => return None,
        };
        let client = self.client(&other)?;
        Some((other, client))
    }

    async fn call(
        &self,
        client: &Arc<dyn BackendClient>,
        messages: &[ChatMessage],
        model: &str,
        params: &GenerationParams,
    ) -> Result<Generation, BackendError> {
        let timeout = self.config.request_timeout;
        match tokio::time::timeout(timeout, client.generate(messages, Some(model), params)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::timeout(client.name(), timeout)),
        }
    }

    /// Routes and executes, propagating errors. See [`HybridRouter::generate`]
    /// for the variant that always produces a response.
    pub async fn try_generate(
        &self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> Result<RouteResponse, RouteError> {
        let mut decision = self.plan(messages, opts)?;
        let primary = self.client(&decision.selected_backend).ok_or_else(|| {
            RouteError::Configuration(format!(
                "no {} backend configured",
                decision.selected_backend
            ))
        })?;
        let params = GenerationParams::from(opts);

        tracing::debug!(
            event_name = "router.decision",
            backend = %decision.selected_backend,
            model = %decision.selected_model,
            complexity = ?decision.complexity,
            cost_priority = ?decision.cost_priority,
            "routing request"
        );

        let primary_err = match self
            .call(primary, messages, &decision.selected_model, &params)
            .await
        {
            Ok(generation) => return Ok(self.finish(generation, decision, opts).await),
            Err(err) => err,
        };

        let fallback = if opts.force_backend.is_some() {
            None
        } else {
            self.alternate(&decision.selected_backend)
        };
        let Some((alt_kind, alt_client)) = fallback else {
            tracing::warn!(
                event_name = "router.primary_failed",
                backend = %decision.selected_backend,
                error = %primary_err,
                "primary backend failed and no fallback is available"
            );
            return Err(primary_err.into());
        };

        tracing::warn!(
            event_name = "router.fallback",
            from = %decision.selected_backend,
            to = %alt_kind,
            error = %primary_err,
            "primary backend failed; retrying on alternate"
        );
        decision.selected_backend = alt_kind;
        decision.used_fallback = true;
        let generation = self
            .call(alt_client, messages, &decision.selected_model, &params)
            .await?;
        Ok(self.finish(generation, decision, opts).await)
    }

    /// Always returns a response; total failure becomes a degraded reply
    /// carrying the error text.
    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> RouteResponse {
        match self.try_generate(messages, opts).await {
            Ok(response) => response,
            Err(err) => {
                tracing::error!(event_name = "router.exhausted", error = %err, "routing failed");
                RouteResponse::degraded(err.to_string(), None)
            }
        }
    }

    async fn finish(
        &self,
        generation: Generation,
        decision: RoutingDecision,
        opts: &GenerateOptions,
    ) -> RouteResponse {
        let cost_usd = if generation.cached {
            0.0
        } else {
            cost_for(
                &generation.model,
                generation.input_tokens,
                generation.output_tokens,
                &self.pricing,
            )
        };

        if let (Some(ledger), false) = (&self.ledger, generation.cached) {
            ledger
                .record(UsageRecord {
                    timestamp: Utc::now(),
                    model: generation.model.clone(),
                    backend: decision.selected_backend.label().to_string(),
                    input_tokens: generation.input_tokens,
                    output_tokens: generation.output_tokens,
                    tokens_total: generation.tokens_total,
                    cost_usd,
                    latency_ms: Some(generation.latency_ms),
                    user_id: opts.user_id.clone(),
                })
                .await;
        }

        RouteResponse {
            content: generation.content,
            model: generation.model,
            backend: decision.selected_backend.label().to_string(),
            tokens_total: generation.tokens_total,
            cost_usd,
            latency_ms: generation.latency_ms,
            used_fallback: decision.used_fallback,
            degraded: false,
            decision: Some(decision),
            error: None,
        }
    }
}

fn parse_forced_backend(raw: &str) -> Result<BackendKind, RouteError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        SERVERLESS => Ok(BackendKind::Serverless),
        GPU | "dedicated" => Ok(BackendKind::Gpu),
        other => Err(RouteError::Configuration(format!(
            "unknown backend '{other}'; expected serverless or gpu"
        ))),
    }
}
