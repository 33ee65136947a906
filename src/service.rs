use crate::backends::lambda::{self, GPU, SERVERLESS};
use crate::backends::portkey::PortkeyClient;
use crate::backends::{openrouter, BackendClient};
use crate::budget::{BudgetMonitor, BudgetStatus, RemainingBudget};
use crate::complexity::HeuristicAnalyzer;
use crate::config::{normalize_backend_name, AppConfig, BackendSettings};
use crate::error::AppError;
use crate::gateway::classify::classify;
use crate::gateway::validate::QualityValidator;
use crate::gateway::{self, GatewayCandidate, GatewayResponse, QualityGateway, QualityRequest};
use crate::ledger::{LedgerSummary, SqliteLedger};
use crate::models::{ChatMessage, GenerateOptions, RouteResponse, TimeWindow};
use crate::notify::WebhookNotifier;
use crate::router::{HybridRouter, RouterConfig};
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

pub const OPENROUTER: &str = "openrouter";
pub const PORTKEY: &str = "portkey";

/// Budget check = ledger read plus up to two webhook deliveries.
const FLUSH_TIMEOUTS: u32 = 3;

#[derive(Debug, Clone, Serialize)]
pub struct BackendTestReport {
    pub backend: String,
    pub default_model: String,
    pub status_code: Option<u16>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct UsageReport {
    pub window: String,
    pub since: DateTime<Utc>,
    pub summary: LedgerSummary,
    pub remaining: RemainingBudget,
}

/// Composition root: owns the ledger, the backends and everything built on
/// top of them. Construct one per process and share it by reference.
pub struct RouterService {
    config: AppConfig,
    ledger: Arc<SqliteLedger>,
    monitor: Arc<BudgetMonitor>,
    router: HybridRouter,
    gateway: QualityGateway,
    backends: BTreeMap<String, Arc<dyn BackendClient>>,
    pending_checks: Mutex<Vec<JoinHandle<()>>>,
}

impl RouterService {
    pub fn from_config(config: AppConfig, ledger: Arc<SqliteLedger>) -> Result<Self, AppError> {
        Self::from_config_with_keys(config, ledger, crate::config::lookup_api_key)
    }

    /// Like [`RouterService::from_config`] with an explicit API-key source.
    pub fn from_config_with_keys<F>(
        config: AppConfig,
        ledger: Arc<SqliteLedger>,
        keys: F,
    ) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let http = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        let backends = build_backends(&config, &http, &keys)?;
        tracing::info!(
            event_name = "service.backends_wired",
            backends = ?backends.keys().collect::<Vec<_>>(),
            "inference backends configured"
        );

        let routing = &config.routing;
        let mut router = HybridRouter::new(RouterConfig {
            serverless_ratio: routing.serverless_ratio,
            models: routing.model_tiers(),
            request_timeout: routing.timeout(),
        })
        .with_analyzer(Arc::new(HeuristicAnalyzer::default()))
        .with_ledger(ledger.clone())
        .with_pricing(config.pricing_overrides.clone());
        if let Some(client) = backends.get(SERVERLESS) {
            router = router.with_serverless(client.clone());
        }
        if let Some(client) = backends.get(GPU) {
            router = router.with_gpu(client.clone());
        }
        if let Some(seed) = routing.seed {
            router = router.with_seed(seed);
        }

        let candidates = config
            .gateways
            .iter()
            .filter_map(|profile| match backends.get(&profile.name) {
                Some(client) => Some(GatewayCandidate {
                    profile: profile.clone(),
                    client: client.clone(),
                }),
                None => {
                    tracing::debug!(
                        event_name = "service.gateway_skipped",
                        gateway = %profile.name,
                        "gateway profile has no configured backend"
                    );
                    None
                }
            })
            .collect();
        let gateway = QualityGateway::new(candidates, QualityValidator::new(config.quality.clone()))
            .with_ledger(ledger.clone())
            .with_pricing(config.pricing_overrides.clone())
            .with_timeout(routing.timeout());

        let mut monitor = BudgetMonitor::new(ledger.clone(), config.budget.limits());
        if let Some(url) = config.budget.webhook_url.as_deref().filter(|u| !u.is_empty()) {
            let notifier = WebhookNotifier::new(http.clone(), url)?
                .with_timeout(config.budget.alert_timeout());
            monitor = monitor.with_notifier(Arc::new(notifier));
        }

        Ok(Self {
            config,
            ledger,
            monitor: Arc::new(monitor),
            router,
            gateway,
            backends,
            pending_checks: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<SqliteLedger> {
        &self.ledger
    }

    pub fn monitor(&self) -> &Arc<BudgetMonitor> {
        &self.monitor
    }

    pub fn gateway(&self) -> &QualityGateway {
        &self.gateway
    }

    pub fn backend_names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// `None` when the request may proceed, otherwise the refusal reason.
    async fn admission(&self) -> Option<String> {
        if !self.config.budget.enforce {
            return None;
        }
        match self.monitor.is_within_budget().await {
            Ok(true) => None,
            Ok(false) => Some("budget exceeded; request refused".to_string()),
            Err(err) => {
                tracing::warn!(
                    event_name = "service.budget_check_failed",
                    error = %err,
                    "refusing request because spend could not be verified"
                );
                Some(format!("budget check failed: {err}"))
            }
        }
    }

    fn spawn_budget_check(&self) {
        let monitor = self.monitor.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = monitor.check_and_alert().await {
                tracing::warn!(
                    event_name = "service.budget_check_failed",
                    error = %err,
                    "out-of-band budget check failed"
                );
            }
        });
        match self.pending_checks.lock() {
            Ok(mut pending) => {
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
            }
            Err(poisoned) => poisoned.into_inner().push(handle),
        }
    }

    /// Waits for budget checks spawned by earlier calls. Checks still running
    /// after a few alert timeouts are aborted.
    pub async fn flush(&self) {
        let handles = match self.pending_checks.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        let deadline =
            tokio::time::Instant::now() + self.config.budget.alert_timeout() * FLUSH_TIMEOUTS;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => tracing::warn!(
                    event_name = "service.budget_check_aborted",
                    error = %err,
                    "budget check task did not complete"
                ),
                Err(_) => {
                    tracing::warn!(
                        event_name = "service.budget_check_timeout",
                        "budget check still running at flush deadline; aborting"
                    );
                    handle.abort();
                }
            }
        }
    }

    pub async fn generate(
        &self,
        messages: &[ChatMessage],
        opts: &GenerateOptions,
    ) -> RouteResponse {
        if let Some(reason) = self.admission().await {
            return RouteResponse::degraded(reason, None);
        }
        let response = self.router.generate(messages, opts).await;
        if !response.degraded {
            self.spawn_budget_check();
        }
        response
    }

    pub async fn ask(&self, request: &QualityRequest) -> GatewayResponse {
        if let Some(reason) = self.admission().await {
            return gateway::apology(classify(&request.query), Vec::new(), reason);
        }
        let response = self.gateway.process_request(request).await;
        if response.tokens_total > 0 {
            self.spawn_budget_check();
        }
        response
    }

    pub async fn budget_status(&self) -> Result<BudgetStatus, AppError> {
        self.monitor.check_and_alert().await
    }

    pub async fn report(&self, window: TimeWindow) -> Result<UsageReport, AppError> {
        let since = Utc::now() - Duration::hours(window.as_hours());
        Ok(UsageReport {
            window: window.as_label().to_string(),
            since,
            summary: self.ledger.aggregate_since(since).await?,
            remaining: self.monitor.get_remaining_budget().await?,
        })
    }

    pub async fn test_backend_connection(&self, name: &str) -> Result<BackendTestReport, AppError> {
        let name = normalize_backend_name(name);
        let client = self.backends.get(&name).ok_or_else(|| {
            AppError::Config(format!(
                "Backend '{name}' is not configured. Known backends: {}.",
                self.backend_names().join(", ")
            ))
        })?;
        let started = Instant::now();
        let status_code = client.test_connection().await?;
        Ok(BackendTestReport {
            backend: name,
            default_model: client.default_model().to_string(),
            status_code,
            duration_ms: started.elapsed().as_millis(),
        })
    }
}

fn build_backends<F>(
    config: &AppConfig,
    http: &Client,
    keys: &F,
) -> Result<BTreeMap<String, Arc<dyn BackendClient>>, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    let timeout = config.routing.timeout();
    let settings = |name: &str| -> BackendSettings {
        config.backend_settings.get(name).cloned().unwrap_or_default()
    };
    let mut backends: BTreeMap<String, Arc<dyn BackendClient>> = BTreeMap::new();

    if let Some(key) = keys(SERVERLESS) {
        let s = settings(SERVERLESS);
        let model = s.default_model.as_deref().unwrap_or(&config.routing.default_model);
        let client =
            lambda::serverless_client(http.clone(), key, s.base_url.as_deref(), model, timeout)?;
        backends.insert(SERVERLESS.into(), Arc::new(client));
    }

    let gpu = settings(GPU);
    if let Some(base_url) = gpu.base_url.as_deref() {
        let model = gpu.default_model.as_deref().unwrap_or(&config.routing.default_model);
        let client = lambda::gpu_client(http.clone(), keys(GPU), base_url, model, timeout)?;
        backends.insert(GPU.into(), Arc::new(client));
    }

    if let Some(key) = keys(OPENROUTER) {
        let s = settings(OPENROUTER);
        let client = openrouter::client(
            http.clone(),
            key,
            s.base_url.as_deref(),
            s.default_model.as_deref(),
            timeout,
        )?;
        backends.insert(OPENROUTER.into(), Arc::new(client));
    }

    if let Some(key) = keys(PORTKEY) {
        let s = settings(PORTKEY);
        let client = PortkeyClient::new(
            http.clone(),
            key,
            s.virtual_key,
            s.base_url.as_deref(),
            s.default_model.as_deref(),
            config.cache.clone(),
            timeout,
        )?;
        backends.insert(PORTKEY.into(), Arc::new(client));
    }

    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CostPriority;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;
    use serde_json::json;

    fn serverless_only(server: &MockServer) -> AppConfig {
        let mut config = AppConfig::default();
        config.backend_settings.insert(
            SERVERLESS.into(),
            BackendSettings {
                base_url: Some(server.url("/v1")),
                ..BackendSettings::default()
            },
        );
        config
    }

    fn service(config: AppConfig) -> RouterService {
        let ledger = Arc::new(SqliteLedger::open_in_memory().expect("ledger"));
        RouterService::from_config_with_keys(config, ledger, |name| {
            (name == SERVERLESS).then(|| "sk-test".to_string())
        })
        .expect("service")
    }

    fn completion_mock(server: &MockServer) -> httpmock::Mock<'_> {
        server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-test");
            then.status(200).json_body(json!({
                "model": "llama3.1-8b-instruct",
                "choices": [{"message": {"content": "Pipeline is healthy."}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 5, "total_tokens": 17}
            }));
        })
    }

    #[test]
    fn only_keyed_backends_are_wired() {
        let server = MockServer::start();
        let svc = service(serverless_only(&server));
        assert_eq!(svc.backend_names(), vec![SERVERLESS.to_string()]);
        assert!(svc.gateway().candidate_names().is_empty());
    }

    #[tokio::test]
    async fn generate_routes_records_and_checks_budget() {
        let server = MockServer::start();
        let mock = completion_mock(&server);
        let svc = service(serverless_only(&server));

        let response = svc
            .generate(
                &[ChatMessage::user("How is pipeline?")],
                &GenerateOptions {
                    cost_priority: CostPriority::LowCost,
                    ..GenerateOptions::default()
                },
            )
            .await;
        svc.flush().await;

        mock.assert();
        assert!(!response.degraded, "{:?}", response.error);
        assert_eq!(response.backend, SERVERLESS);
        assert_eq!(response.tokens_total, 17);
        let rows = svc.ledger().export_records().await.expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tokens_total, 17);
    }

    #[tokio::test]
    async fn enforced_budget_refuses_before_calling_backends() {
        let server = MockServer::start();
        let mock = completion_mock(&server);
        let mut config = serverless_only(&server);
        config.budget.enforce = true;
        config.budget.daily_usd = 0.0;
        let svc = service(config);

        let response = svc
            .generate(&[ChatMessage::user("hi")], &GenerateOptions::default())
            .await;
        assert!(response.degraded);
        assert!(response.error.expect("reason").contains("budget exceeded"));
        mock.assert_hits(0);

        let answer = svc.ask(&QualityRequest::new("revenue report")).await;
        assert!(answer.degraded);
    }

    #[tokio::test]
    async fn advisory_budget_still_serves_requests() {
        let server = MockServer::start();
        let mock = completion_mock(&server);
        let mut config = serverless_only(&server);
        config.budget.daily_usd = 0.0;
        let svc = service(config);

        let response = svc
            .generate(
                &[ChatMessage::user("hi")],
                &GenerateOptions {
                    force_backend: Some(SERVERLESS.into()),
                    ..GenerateOptions::default()
                },
            )
            .await;
        assert!(!response.degraded);
        mock.assert_hits(1);
        let status = svc.budget_status().await.expect("status");
        assert_eq!(status.daily_pct, 100.0);
        assert!(!status.alerts.is_empty());
    }

    #[tokio::test]
    async fn flush_is_bounded_by_unresponsive_webhook() {
        let server = MockServer::start();
        completion_mock(&server);
        let hook = MockServer::start();
        hook.mock(|when, then| {
            when.method(POST).path("/alerts");
            then.status(200).delay(std::time::Duration::from_secs(5));
        });
        let mut config = serverless_only(&server);
        config.budget.daily_usd = 0.0;
        config.budget.webhook_url = Some(hook.url("/alerts"));
        config.budget.alert_timeout_ms = 100;
        let svc = service(config);

        let response = svc
            .generate(
                &[ChatMessage::user("hi")],
                &GenerateOptions {
                    force_backend: Some(SERVERLESS.into()),
                    ..GenerateOptions::default()
                },
            )
            .await;
        assert!(!response.degraded, "{:?}", response.error);

        let started = Instant::now();
        svc.flush().await;
        assert!(started.elapsed() < std::time::Duration::from_secs(2));
    }

    #[tokio::test]
    async fn connection_test_reports_status() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/models");
            then.status(200).json_body(json!({"data": []}));
        });
        let svc = service(serverless_only(&server));

        let report = svc
            .test_backend_connection(" Serverless ")
            .await
            .expect("report");
        assert_eq!(report.backend, SERVERLESS);
        assert_eq!(report.default_model, "llama3.3-70b-instruct-fp8");
        assert_eq!(report.status_code, Some(200));

        let err = svc
            .test_backend_connection("gpu")
            .await
            .expect_err("gpu not configured");
        assert!(err.to_string().contains("not configured"));
    }

    #[tokio::test]
    async fn report_covers_window() {
        let server = MockServer::start();
        completion_mock(&server);
        let svc = service(serverless_only(&server));
        svc.generate(
            &[ChatMessage::user("hi")],
            &GenerateOptions {
                cost_priority: CostPriority::LowCost,
                ..GenerateOptions::default()
            },
        )
        .await;

        let report = svc.report(TimeWindow::SevenDays).await.expect("report");
        assert_eq!(report.window, "7d");
        assert_eq!(report.summary.tokens_total, 17);
        assert_eq!(report.summary.by_backend[0].0, SERVERLESS);
    }
}
