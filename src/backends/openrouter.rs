use crate::backends::{Auth, OpenAiCompatibleClient};
use crate::error::AppError;
use reqwest::Client;
use std::time::Duration;

pub const BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "anthropic/claude-3.5-sonnet";

const APP_REFERER: &str = "https://github.com/llm-router/llm-router";
const APP_TITLE: &str = "llm-router";

pub fn client(
    http: Client,
    api_key: String,
    base_url: Option<&str>,
    default_model: Option<&str>,
    timeout: Duration,
) -> Result<OpenAiCompatibleClient, AppError> {
    Ok(OpenAiCompatibleClient::new(
        http,
        "openrouter",
        base_url.unwrap_or(BASE_URL),
        Auth::Bearer(api_key),
        default_model.unwrap_or(DEFAULT_MODEL),
    )?
    .with_header("HTTP-Referer", APP_REFERER)
    .with_header("X-Title", APP_TITLE)
    .with_timeout(timeout))
}
