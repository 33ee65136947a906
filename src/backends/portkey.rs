use crate::backends::{Auth, BackendClient, OpenAiCompatibleClient};
use crate::error::{AppError, BackendError};
use crate::gateway::cache::{CacheSettings, SemanticCache};
use crate::models::{ChatMessage, Generation, GenerationParams, Role};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use std::sync::Mutex;
use std::time::Duration;

pub const BASE_URL: &str = "https://api.portkey.ai/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";

/// Portkey gateway client with a process-local semantic cache in front.
///
/// Cache hits cost nothing and report zero tokens; callers must not write a
/// usage record for a generation with `cached == true`. Answers enter the
/// cache only through [`BackendClient::remember`], never straight from
/// `generate`.
pub struct PortkeyClient {
    inner: OpenAiCompatibleClient,
    cache: Mutex<SemanticCache>,
}

impl PortkeyClient {
    pub fn new(
        http: Client,
        api_key: String,
        virtual_key: Option<String>,
        base_url: Option<&str>,
        default_model: Option<&str>,
        cache: CacheSettings,
        timeout: Duration,
    ) -> Result<Self, AppError> {
        let mut inner = OpenAiCompatibleClient::new(
            http,
            "portkey",
            base_url.unwrap_or(BASE_URL),
            Auth::Header {
                name: "x-portkey-api-key".into(),
                value: api_key,
            },
            default_model.unwrap_or(DEFAULT_MODEL),
        )?
        .with_timeout(timeout);
        if let Some(vk) = virtual_key.filter(|vk| !vk.is_empty()) {
            inner = inner.with_header("x-portkey-virtual-key", vk);
        }
        Ok(Self {
            inner,
            cache: Mutex::new(SemanticCache::new(cache)),
        })
    }

    fn cache_key(messages: &[ChatMessage]) -> (String, String) {
        let query = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let context = messages
            .iter()
            .filter(|m| m.role != Role::User)
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        (query, context)
    }

    fn now() -> u64 {
        Utc::now().timestamp().max(0) as u64
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

#[async_trait]
impl BackendClient for PortkeyClient {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn default_model(&self) -> &str {
        self.inner.default_model()
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        model: Option<&str>,
        params: &GenerationParams,
    ) -> Result<Generation, BackendError> {
        let hit = if params.bypass_cache {
            None
        } else {
            let (query, context) = Self::cache_key(messages);
            match self.cache.lock() {
                Ok(mut cache) => cache.get(&query, &context, Self::now()),
                Err(_) => None,
            }
        };
        if let Some(hit) = hit {
            tracing::debug!(
                event_name = "portkey.cache_hit",
                exact = hit.exact,
                "serving cached response"
            );
            return Ok(Generation {
                content: hit.response,
                model: hit.model,
                backend: self.name().to_string(),
                input_tokens: 0,
                output_tokens: 0,
                tokens_total: 0,
                latency_ms: 0,
                cached: true,
            });
        }

        self.inner.generate(messages, model, params).await
    }

    fn remember(&self, messages: &[ChatMessage], generation: &Generation) {
        if generation.cached {
            return;
        }
        let (query, context) = Self::cache_key(messages);
        if let Ok(mut cache) = self.cache.lock() {
            cache.put(
                &query,
                &context,
                &generation.content,
                &generation.model,
                Self::now(),
            );
        }
    }

    async fn test_connection(&self) -> Result<Option<u16>, AppError> {
        self.inner.test_connection().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    fn portkey(server: &MockServer) -> PortkeyClient {
        PortkeyClient::new(
            Client::new(),
            "pk-test".into(),
            Some("vk-openai".into()),
            Some(&server.url("/v1")),
            None,
            CacheSettings::default(),
            Duration::from_secs(5),
        )
        .expect("client")
    }

    #[tokio::test]
    async fn repeated_query_is_served_from_cache() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/chat/completions")
                .header("x-portkey-api-key", "pk-test")
                .header("x-portkey-virtual-key", "vk-openai");
            then.status(200).json_body(json!({
                "model": "gpt-4o",
                "choices": [{"message": {"content": "Pipeline grew 12%."}}],
                "usage": {"prompt_tokens": 10, "completion_tokens": 6, "total_tokens": 16}
            }));
        });

        let client = portkey(&server);
        let messages = [
            ChatMessage::system("You are an analyst."),
            ChatMessage::user("How did pipeline change this quarter?"),
        ];
        let first = client
            .generate(&messages, None, &GenerationParams::default())
            .await
            .expect("first");
        client.remember(&messages, &first);
        let second = client
            .generate(&messages, None, &GenerationParams::default())
            .await
            .expect("second");

        mock.assert_hits(1);
        assert!(!first.cached);
        assert!(second.cached);
        assert_eq!(second.content, first.content);
        assert_eq!(second.tokens_total, 0);
        assert_eq!(client.cached_entries(), 1);
    }

    #[tokio::test]
    async fn failed_calls_are_not_cached() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(502);
        });

        let client = portkey(&server);
        let result = client
            .generate(&[ChatMessage::user("q")], None, &GenerationParams::default())
            .await;
        assert!(result.is_err());
        assert_eq!(client.cached_entries(), 0);
    }

    #[tokio::test]
    async fn unaccepted_answers_are_not_cached() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({
                "model": "gpt-4o",
                "choices": [{"message": {"content": "Hello"}}],
                "usage": {"prompt_tokens": 4, "completion_tokens": 1, "total_tokens": 5}
            }));
        });

        let client = portkey(&server);
        let messages = [ChatMessage::user("quarterly revenue by region")];
        for _ in 0..2 {
            let generation = client
                .generate(&messages, None, &GenerationParams::default())
                .await
                .expect("generation");
            assert!(!generation.cached);
        }
        mock.assert_hits(2);
        assert_eq!(client.cached_entries(), 0);
    }

    #[tokio::test]
    async fn bypass_skips_cached_answer() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST).path("/v1/chat/completions");
            then.status(200).json_body(json!({
                "model": "gpt-4o",
                "choices": [{"message": {"content": "Fresh answer."}}],
                "usage": {"prompt_tokens": 4, "completion_tokens": 3, "total_tokens": 7}
            }));
        });

        let client = portkey(&server);
        let messages = [ChatMessage::user("pipeline by stage")];
        let first = client
            .generate(&messages, None, &GenerationParams::default())
            .await
            .expect("first");
        client.remember(&messages, &first);

        let bypass = GenerationParams {
            bypass_cache: true,
            ..GenerationParams::default()
        };
        let second = client
            .generate(&messages, None, &bypass)
            .await
            .expect("second");
        assert!(!second.cached);
        mock.assert_hits(2);
    }
}
