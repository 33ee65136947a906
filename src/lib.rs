//! Cost-aware routing of LLM requests across serverless, dedicated GPU and
//! third-party gateway backends, with a usage ledger and budget monitor.

pub mod backends;
pub mod budget;
pub mod complexity;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod models;
pub mod notify;
pub mod pricing;
pub mod router;
pub mod service;
pub mod telemetry;
pub mod ui;
