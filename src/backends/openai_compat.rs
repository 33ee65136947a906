use crate::backends::BackendClient;
use crate::error::{AppError, BackendError, BackendErrorKind};
use crate::models::{ChatMessage, Generation, GenerationParams};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Map, Value};
use std::time::{Duration, Instant};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(45);

#[derive(Debug, Clone)]
pub enum Auth {
    Bearer(String),
    Header { name: String, value: String },
    None,
}

/// Client for any endpoint speaking the `/v1/chat/completions` protocol.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    name: String,
    base_url: url::Url,
    auth: Auth,
    default_model: String,
    headers: Vec<(String, String)>,
    timeout: Duration,
    client: Client,
}

impl OpenAiCompatibleClient {
    pub fn new(
        client: Client,
        name: impl Into<String>,
        base_url: &str,
        auth: Auth,
        default_model: impl Into<String>,
    ) -> Result<Self, AppError> {
        let name = name.into();
        let base_url = url::Url::parse(base_url).map_err(|e| {
            AppError::Config(format!("invalid base url '{base_url}' for backend '{name}': {e}"))
        })?;
        Ok(Self {
            name,
            base_url,
            auth,
            default_model: default_model.into(),
            headers: Vec::new(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            client,
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn endpoint(&self, suffix: &str) -> url::Url {
        let mut url = self.base_url.clone();
        let path = url.path().trim_end_matches('/').to_string();
        if path.ends_with(suffix) {
            return url;
        }
        let base = path
            .strip_suffix("/chat/completions")
            .or_else(|| path.strip_suffix("/models"))
            .unwrap_or(&path)
            .to_string();
        let base = if base.is_empty() { "/v1".to_string() } else { base };
        url.set_path(&format!("{base}{suffix}"));
        url
    }

    pub fn chat_url(&self) -> url::Url {
        self.endpoint("/chat/completions")
    }

    pub fn models_url(&self) -> url::Url {
        self.endpoint("/models")
    }

    fn authorize(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req = match &self.auth {
            Auth::Bearer(key) => req.bearer_auth(key),
            Auth::Header { name, value } => req.header(name.as_str(), value.as_str()),
            Auth::None => req,
        };
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        req
    }

    pub fn build_body(
        messages: &[ChatMessage],
        model: &str,
        params: &GenerationParams,
    ) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), json!(model));
        body.insert("messages".into(), json!(messages));
        body.insert("max_tokens".into(), json!(params.max_tokens));
        body.insert("temperature".into(), json!(params.temperature));
        if let Some(top_p) = params.top_p {
            body.insert("top_p".into(), json!(top_p));
        }
        if let Some(penalty) = params.frequency_penalty {
            body.insert("frequency_penalty".into(), json!(penalty));
        }
        if let Some(penalty) = params.presence_penalty {
            body.insert("presence_penalty".into(), json!(penalty));
        }
        Value::Object(body)
    }

    /// Pulls content and token usage out of a chat-completions response.
    pub fn parse_completion(
        &self,
        body: &Value,
        requested_model: &str,
        latency_ms: u64,
    ) -> Result<Generation, BackendError> {
        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                BackendError::new(
                    &self.name,
                    BackendErrorKind::MalformedResponse,
                    "response has no choices[0].message.content",
                )
            })?
            .to_string();
        let model = body
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(requested_model)
            .to_string();
        let usage = body.get("usage");
        let count = |key: &str| {
            usage
                .and_then(|u| u.get(key))
                .and_then(Value::as_u64)
                .unwrap_or(0)
        };
        let input_tokens = count("prompt_tokens");
        let output_tokens = count("completion_tokens");
        let tokens_total = usage
            .and_then(|u| u.get("total_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(input_tokens + output_tokens);

        Ok(Generation {
            content,
            model,
            backend: self.name.clone(),
            input_tokens,
            output_tokens,
            tokens_total,
            latency_ms,
            cached: false,
        })
    }
}

#[async_trait]
impl BackendClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn default_model(&self) -> &str {
        &self.default_model
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        params: &GenerationParams,
    ) -> Result<Generation, BackendError> {
        let model = model.unwrap_or(&self.default_model);
        let body = Self::build_body(messages, model, params);
        let started = Instant::now();

        let req = self
            .client
            .post(self.chat_url())
            .timeout(self.timeout)
            .json(&body);
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(&self.name, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let kind = match status.as_u16() {
                401 | 403 => BackendErrorKind::Unauthorized,
                code => BackendErrorKind::Http(code),
            };
            return Err(BackendError::new(&self.name, kind, truncate(&detail, 300)));
        }

        let payload: Value = response.json().await.map_err(|e| {
            if e.is_timeout() {
                BackendError::from_reqwest(&self.name, e)
            } else {
                BackendError::new(&self.name, BackendErrorKind::MalformedResponse, e.to_string())
            }
        })?;
        let latency_ms = started.elapsed().as_millis() as u64;
        let generation = self.parse_completion(&payload, model, latency_ms)?;

        tracing::debug!(
            event_name = "backend.generate.ok",
            backend = %self.name,
            model = %generation.model,
            tokens = generation.tokens_total,
            latency_ms,
            "backend call completed"
        );
        Ok(generation)
    }

    async fn test_connection(&self) -> Result<Option<u16>, AppError> {
        let req = self.client.get(self.models_url()).timeout(self.timeout);
        let response = self.authorize(req).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Some(status.as_u16()));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(AppError::Config(format!(
                "Backend '{}' rejected credentials (unauthorized).",
                self.name
            )));
        }

        Err(AppError::Config(format!(
            "Backend '{}' connection failed with HTTP status {}.",
            self.name, status
        )))
    }
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.chars().count() <= max {
        return raw.to_string();
    }
    let cut: String = raw.chars().take(max).collect();
    format!("{cut}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    fn client(base: &str) -> OpenAiCompatibleClient {
        OpenAiCompatibleClient::new(
            Client::new(),
            "serverless",
            base,
            Auth::Bearer("sk-test".into()),
            "llama3.3-70b-instruct-fp8",
        )
        .expect("client")
    }

    #[test]
    fn endpoint_paths_resolve_from_common_base_urls() {
        assert_eq!(
            client("https://api.lambda.ai/v1").chat_url().as_str(),
            "https://api.lambda.ai/v1/chat/completions"
        );
        assert_eq!(
            client("https://api.lambda.ai/").models_url().as_str(),
            "https://api.lambda.ai/v1/models"
        );
        assert_eq!(
            client("https://openrouter.ai/api/v1/chat/completions")
                .models_url()
                .as_str(),
            "https://openrouter.ai/api/v1/models"
        );
    }

    #[test]
    fn body_omits_unset_sampling_knobs() {
        let params = GenerationParams {
            top_p: Some(0.9),
            ..GenerationParams::default()
        };
        let body = OpenAiCompatibleClient::build_body(&[ChatMessage::user("hi")], "m", &params);
        assert_eq!(body["model"], "m");
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("top_p").is_some());
        assert!(body.get("presence_penalty").is_none());
    }

    #[test]
    fn missing_content_is_malformed() {
        let err = client("https://x.test/v1")
            .parse_completion(&json!({"choices": []}), "m", 1)
            .expect_err("no content");
        assert_eq!(err.kind, BackendErrorKind::MalformedResponse);
    }

    #[test]
    fn total_tokens_falls_back_to_sum() {
        let generation = client("https://x.test/v1")
            .parse_completion(
                &json!({
                    "choices": [{"message": {"role": "assistant", "content": "ok"}}],
                    "usage": {"prompt_tokens": 7, "completion_tokens": 5}
                }),
                "m",
                12,
            )
            .expect("parsed");
        assert_eq!(generation.tokens_total, 12);
        assert_eq!(generation.model, "m");
        assert_eq!(generation.backend, "serverless");
    }

    #[tokio::test]
    async fn generate_sends_bearer_and_parses_usage() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("authorization", "Bearer sk-test")
                .json_body_includes(r#"{"model": "llama3.1-8b-instruct"}"#);
            then.status(200).json_body(json!({
                "model": "llama3.1-8b-instruct",
                "choices": [{"message": {"role": "assistant", "content": "hello"}}],
                "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
            }));
        });

        let generation = client(&server.url("/v1"))
            .generate(
                &[ChatMessage::user("hi")],
                Some("llama3.1-8b-instruct"),
                &GenerationParams::default(),
            )
            .await
            .expect("generation");
        mock.assert();
        assert_eq!(generation.content, "hello");
        assert_eq!(generation.tokens_total, 5);
    }

    #[tokio::test]
    async fn provider_errors_are_normalized() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(503).body("overloaded");
        });

        let err = client(&server.url("/v1"))
            .generate(&[ChatMessage::user("hi")], None, &GenerationParams::default())
            .await
            .expect_err("503");
        assert_eq!(err.kind, BackendErrorKind::Http(503));
        assert!(err.message.contains("overloaded"));
    }

    #[tokio::test]
    async fn slow_backend_times_out() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200)
                .delay(Duration::from_millis(500))
                .json_body(json!({"choices": [{"message": {"content": "late"}}]}));
        });

        let err = client(&server.url("/v1"))
            .with_timeout(Duration::from_millis(50))
            .generate(&[ChatMessage::user("hi")], None, &GenerationParams::default())
            .await
            .expect_err("timeout");
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn connection_test_reports_unauthorized() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/models");
            then.status(401);
        });

        let err = client(&server.url("/v1"))
            .test_connection()
            .await
            .expect_err("unauthorized");
        assert!(err.to_string().contains("rejected credentials"));
    }
}
