//! Lambda inference surfaces: the shared serverless API and a dedicated GPU
//! endpoint (typically a vLLM server on reserved capacity).

use crate::backends::{Auth, OpenAiCompatibleClient};
use crate::error::AppError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SERVERLESS_BASE_URL: &str = "https://api.lambda.ai/v1";

pub const SERVERLESS: &str = "serverless";
pub const GPU: &str = "gpu";

/// Models the router picks from by complexity and cost priority.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelTiers {
    pub small: String,
    pub default: String,
    pub large: String,
}

impl Default for ModelTiers {
    fn default() -> Self {
        Self {
            small: "llama3.1-8b-instruct".into(),
            default: "llama3.3-70b-instruct-fp8".into(),
            large: "llama-4-maverick-17b-128e-instruct-fp8".into(),
        }
    }
}

pub fn serverless_client(
    http: Client,
    api_key: String,
    base_url: Option<&str>,
    default_model: &str,
    timeout: Duration,
) -> Result<OpenAiCompatibleClient, AppError> {
    Ok(OpenAiCompatibleClient::new(
        http,
        SERVERLESS,
        base_url.unwrap_or(SERVERLESS_BASE_URL),
        Auth::Bearer(api_key),
        default_model,
    )?
    .with_timeout(timeout))
}

/// Dedicated endpoints have no public default URL; the key is optional
/// because self-hosted servers are often unauthenticated on a private network.
pub fn gpu_client(
    http: Client,
    api_key: Option<String>,
    base_url: &str,
    default_model: &str,
    timeout: Duration,
) -> Result<OpenAiCompatibleClient, AppError> {
    let auth = match api_key {
        Some(key) if !key.is_empty() => Auth::Bearer(key),
        _ => Auth::None,
    };
    Ok(OpenAiCompatibleClient::new(http, GPU, base_url, auth, default_model)?.with_timeout(timeout))
}
