//! `ara` command line.

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ara::api::{self, AppState};
use ara::budget::{BudgetLedger, ModelRegistry};
use ara::engine::LlmEngine;
use ara::llm::OpenRouterClient;
use ara::pipeline::{AnalysisPipeline, PipelineResult, PipelineStatus};
use ara::storage::{DisabledRecordStore, RecordStore, SupabaseStore};
use ara::Config;

#[derive(Parser)]
#[command(name = "ara", version, about = "Multi-agent research pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Research a niche and write the report
    Run {
        /// Niche to research, 5 to 200 characters
        niche: String,
    },
    /// Show the current billing period
    Budget,
    /// List the model cost registry
    Models,
    /// Start the HTTP API
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run { niche } => {
            let pipeline = build_pipeline(&config).await?;
            let result = pipeline.run(&niche).await;
            print_summary(&result);
            if result.status == PipelineStatus::Completed {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Budget => {
            let ledger = open_ledger(&config).await;
            let status = ledger.get_status().await?;
            println!("Period:    {} .. {}", status.period_start.date_naive(), status.period_end().date_naive());
            println!(
                "Used:      {:.2} / {:.2} credits ({:.1}%)",
                status.credits_used,
                status.credits_limit,
                status.usage_percentage()
            );
            println!("Remaining: {:.2}", status.credits_remaining());
            println!("Health:    {:?}", status.health());
            if status.alert_triggered() {
                println!("Alert threshold of {:.0}% reached", status.alert_threshold * 100.0);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Models => {
            let registry = ModelRegistry::default();
            println!("{:<20} {:>8} {:<8} {:<20} ROUTE", "MODEL", "CREDITS", "FREE", "FALLBACK");
            for model in registry.iter() {
                println!(
                    "{:<20} {:>8.2} {:<8} {:<20} {}",
                    model.name,
                    model.credits_per_request,
                    if model.is_free { "yes" } else { "no" },
                    model.fallback_model.as_deref().unwrap_or("-"),
                    model.route
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve { host, port } => {
            let pipeline = build_pipeline(&config).await?;
            let state = Arc::new(AppState::new(Arc::new(pipeline)));
            let host = host.unwrap_or_else(|| config.host.clone());
            api::serve(state, &host, port.unwrap_or(config.port)).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn open_ledger(config: &Config) -> Arc<BudgetLedger> {
    let ledger = BudgetLedger::open(
        &config.ledger_path,
        Arc::new(ModelRegistry::default()),
        config.credits_limit,
    )
    .with_alert_threshold(config.alert_threshold);
    let status = ledger.initialize().await;
    tracing::info!(
        credits_used = status.credits_used,
        credits_limit = status.credits_limit,
        "Budget ledger ready"
    );
    Arc::new(ledger)
}

async fn build_pipeline(config: &Config) -> Result<AnalysisPipeline> {
    let api_key = config.require_api_key()?;
    let llm = match &config.openrouter_base_url {
        Some(url) => OpenRouterClient::with_base_url(api_key, url.as_str(), Duration::from_secs(300))?,
        None => OpenRouterClient::new(api_key)?,
    };
    let engine = LlmEngine::new(Arc::new(llm)).with_max_retries(config.max_retries);

    let remote: Arc<dyn RecordStore> = match &config.supabase {
        Some(sb) => Arc::new(SupabaseStore::new(&sb.url, &sb.key, sb.table.clone())?),
        None => {
            tracing::warn!("SUPABASE_URL/SUPABASE_KEY not set, results are saved locally only");
            Arc::new(DisabledRecordStore)
        }
    };

    let ledger = open_ledger(config).await;
    Ok(AnalysisPipeline::new(
        Arc::new(engine),
        ledger,
        remote,
        config.pipeline_options(),
    ))
}

fn print_summary(result: &PipelineResult) {
    println!();
    println!("Niche:    {}", result.niche);
    println!("Status:   {}", result.status);
    println!("Duration: {:.1} minutes", result.duration_seconds / 60.0);
    println!("Credits:  {:.2}", result.total_credits_used);
    println!(
        "Stages:   {}/{} succeeded",
        result.succeeded_stages(),
        result.agent_results.len()
    );
    if let Some(id) = &result.supabase_record_id {
        println!("Saved:    remote record {}", id);
    } else if result.supabase_saved {
        println!("Saved:    remote");
    }
    if let Some(path) = &result.local_backup_path {
        println!("Backup:   {}", path.display());
    }
    for warning in &result.warnings {
        println!("warning: {}", warning);
    }
    for error in &result.errors {
        println!("error: {}", error);
    }
}
