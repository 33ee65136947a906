use crate::gateway::classify::{mentions_data, RequestType};
use serde::{Deserialize, Serialize};

pub const DATA_QUERY_MULTIPLIER: f64 = 1.5;
pub const TASK_TYPE_BONUS: f64 = 0.5;

/// Static description of a gateway provider, declared in config order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayProfile {
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub best_for: Vec<RequestType>,
    #[serde(default)]
    pub quality_boost: f64,
    #[serde(default)]
    pub data_oriented: bool,
}

pub fn default_catalog() -> Vec<GatewayProfile> {
    vec![
        GatewayProfile {
            name: "portkey".into(),
            capabilities: vec![
                "analysis".into(),
                "structured_output".into(),
                "chat".into(),
                "caching".into(),
            ],
            best_for: vec![RequestType::DataQuery, RequestType::General],
            quality_boost: 0.2,
            data_oriented: true,
        },
        GatewayProfile {
            name: "openrouter".into(),
            capabilities: vec![
                "chat".into(),
                "creative".into(),
                "long_form".into(),
                "reasoning".into(),
            ],
            best_for: vec![RequestType::Creative, RequestType::Reasoning],
            quality_boost: 0.1,
            data_oriented: false,
        },
    ]
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct GatewayScore {
    pub gateway_name: String,
    pub capability_match_score: f64,
    pub task_type_match_bonus: f64,
    pub quality_boost_multiplier: f64,
    pub data_multiplier: f64,
    pub final_score: f64,
}

pub fn score_gateway(
    profile: &GatewayProfile,
    request_type: RequestType,
    data_query: bool,
) -> GatewayScore {
    let capability_match_score = request_type
        .required_capabilities()
        .iter()
        .filter(|cap| profile.capabilities.iter().any(|c| c == *cap))
        .count() as f64;
    let task_type_match_bonus = if profile.best_for.contains(&request_type) {
        TASK_TYPE_BONUS
    } else {
        0.0
    };
    let quality_boost_multiplier = 1.0 + profile.quality_boost;
    let data_multiplier = if data_query && profile.data_oriented {
        DATA_QUERY_MULTIPLIER
    } else {
        1.0
    };

    GatewayScore {
        gateway_name: profile.name.clone(),
        capability_match_score,
        task_type_match_bonus,
        quality_boost_multiplier,
        data_multiplier,
        final_score: (capability_match_score + task_type_match_bonus)
            * quality_boost_multiplier
            * data_multiplier,
    }
}

/// Scores every profile and sorts best first. The sort is stable, so equal
/// scores keep declaration order.
pub fn score_gateways(
    profiles: &[GatewayProfile],
    request_type: RequestType,
    query: &str,
) -> Vec<GatewayScore> {
    let data_query = mentions_data(query);
    let mut scores: Vec<GatewayScore> = profiles
        .iter()
        .map(|p| score_gateway(p, request_type, data_query))
        .collect();
    scores.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
    scores
}
