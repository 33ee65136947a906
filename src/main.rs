use clap::{Parser, Subcommand};
use llm_router::config::{
    db_path, ensure_initialized, load_config, normalize_backend_name, save_config, set_api_key,
    BackendSettings,
};
use llm_router::error::AppError;
use llm_router::gateway::{QualityPriority, QualityRequest};
use llm_router::ledger::SqliteLedger;
use llm_router::models::{ChatMessage, CostPriority, GenerateOptions, TimeWindow};
use llm_router::service::RouterService;
use llm_router::telemetry::init_logging;
use llm_router::ui::run::run_tui;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "llm-router")]
#[command(about = "Cost-aware LLM request router with budget tracking")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Init,
    AddBackend {
        name: String,
        #[arg(long)]
        api_key: String,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Route a prompt through the serverless/GPU hybrid router.
    Generate {
        prompt: String,
        #[arg(long, default_value = "balanced")]
        priority: CostPriority,
        #[arg(long)]
        force_backend: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(long, default_value_t = 1024)]
        max_tokens: u32,
        #[arg(long, default_value_t = 0.7)]
        temperature: f32,
        #[arg(long)]
        user: Option<String>,
    },
    /// Answer a query through the quality-scored gateway selection.
    Ask {
        query: String,
        #[arg(long, default_value = "balanced")]
        quality: QualityPriority,
        #[arg(long)]
        context: Option<String>,
        #[arg(long, default_value_t = 1024)]
        max_tokens: u32,
        #[arg(long)]
        user: Option<String>,
    },
    Budget,
    Report {
        #[arg(long, default_value = "1d")]
        window: String,
    },
    Export {
        #[arg(long, default_value = "json")]
        format: String,
    },
    TestBackend {
        name: String,
    },
    Tui,
}

fn parse_window(input: &str) -> TimeWindow {
    match input {
        "1d" => TimeWindow::OneDay,
        "7d" => TimeWindow::SevenDays,
        "30d" => TimeWindow::ThirtyDays,
        _ => TimeWindow::SevenDays,
    }
}

fn validate_window(input: &str) -> Result<TimeWindow, AppError> {
    match input {
        "1d" | "7d" | "30d" => Ok(parse_window(input)),
        _ => Err(AppError::Config(
            "Unsupported window. Use 1d, 7d, or 30d.".into(),
        )),
    }
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

fn open_service() -> Result<RouterService, AppError> {
    let cfg = load_config()?;
    let ledger = Arc::new(SqliteLedger::open(&db_path()?)?);
    RouterService::from_config(cfg, ledger)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let cli = Cli::parse();

    if !matches!(cli.command, Commands::Tui) {
        let logging = load_config().map(|c| c.logging).unwrap_or_default();
        init_logging(&logging);
    }

    match cli.command {
        Commands::Init => {
            ensure_initialized()?;
            println!("Initialized llm-router config and data directories.");
        }
        Commands::AddBackend {
            name,
            api_key,
            base_url,
            model,
        } => {
            ensure_initialized()?;
            let mut cfg = load_config()?;
            let name = normalize_backend_name(&name);
            let entry = cfg
                .backend_settings
                .entry(name.clone())
                .or_insert_with(BackendSettings::default);
            if base_url.is_some() {
                entry.base_url = base_url;
            }
            if model.is_some() {
                entry.default_model = model;
            }

            set_api_key(&name, &api_key)?;
            save_config(&cfg)?;
            println!("Backend '{}' configured.", name);
        }
        Commands::Generate {
            prompt,
            priority,
            force_backend,
            model,
            max_tokens,
            temperature,
            user,
        } => {
            ensure_initialized()?;
            let svc = open_service()?;
            let opts = GenerateOptions {
                model,
                cost_priority: priority,
                force_backend,
                max_tokens,
                temperature,
                user_id: user,
            };
            let response = svc.generate(&[ChatMessage::user(prompt)], &opts).await;
            svc.flush().await;
            print_json(&response)?;
        }
        Commands::Ask {
            query,
            quality,
            context,
            max_tokens,
            user,
        } => {
            ensure_initialized()?;
            let svc = open_service()?;
            let request = QualityRequest {
                query,
                context,
                priority: quality,
                max_tokens,
                user_id: user,
            };
            let response = svc.ask(&request).await;
            svc.flush().await;
            print_json(&response)?;
        }
        Commands::Budget => {
            ensure_initialized()?;
            let svc = open_service()?;
            print_json(&svc.budget_status().await?)?;
        }
        Commands::Report { window } => {
            ensure_initialized()?;
            let window = validate_window(&window)?;
            let svc = open_service()?;
            print_json(&svc.report(window).await?)?;
        }
        Commands::Export { format } => {
            ensure_initialized()?;
            let ledger = SqliteLedger::open(&db_path()?)?;
            if format.eq_ignore_ascii_case("json") {
                println!("{}", ledger.export_json().await?);
            } else if format.eq_ignore_ascii_case("csv") {
                println!(
                    "timestamp,backend,model,input_tokens,output_tokens,tokens_total,cost_usd,latency_ms,user_id"
                );
                for r in ledger.export_records().await? {
                    println!(
                        "{},{},{},{},{},{},{:.8},{},{}",
                        csv_field(&r.timestamp.to_rfc3339()),
                        csv_field(&r.backend),
                        csv_field(&r.model),
                        r.input_tokens,
                        r.output_tokens,
                        r.tokens_total,
                        r.cost_usd,
                        r.latency_ms.map(|v| v.to_string()).unwrap_or_default(),
                        csv_field(r.user_id.as_deref().unwrap_or("")),
                    );
                }
            } else {
                return Err(AppError::Config(
                    "Unsupported export format. Use json or csv".into(),
                ));
            }
        }
        Commands::TestBackend { name } => {
            ensure_initialized()?;
            let svc = open_service()?;
            print_json(&svc.test_backend_connection(&name).await?)?;
        }
        Commands::Tui => {
            ensure_initialized()?;
            let svc = open_service()?;
            run_tui(&svc).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_window_accepts_known_values() {
        assert_eq!(parse_window("1d"), TimeWindow::OneDay);
        assert_eq!(parse_window("7d"), TimeWindow::SevenDays);
        assert_eq!(parse_window("30d"), TimeWindow::ThirtyDays);
    }

    #[test]
    fn parse_window_defaults_to_seven_days_for_unknown() {
        assert_eq!(parse_window("weird"), TimeWindow::SevenDays);
    }

    #[test]
    fn validate_window_rejects_unknown_values() {
        let err = validate_window("2d").expect_err("expected validation error");
        assert!(err.to_string().contains("Unsupported window"));
    }

    #[test]
    fn csv_field_escapes_special_characters() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_field("a\nb"), "\"a\nb\"");
    }

    #[test]
    fn cli_parses_generate_options() {
        let cli = Cli::try_parse_from([
            "llm-router",
            "generate",
            "hello",
            "--priority",
            "latency-critical",
            "--force-backend",
            "gpu",
        ])
        .expect("parse");
        match cli.command {
            Commands::Generate {
                priority,
                force_backend,
                ..
            } => {
                assert_eq!(priority, CostPriority::LatencyCritical);
                assert_eq!(force_backend.as_deref(), Some("gpu"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_unknown_quality() {
        assert!(Cli::try_parse_from(["llm-router", "ask", "q", "--quality", "ultra"]).is_err());
    }
}
