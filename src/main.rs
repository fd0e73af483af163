use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;

use greenlight::engine::Engine;
use greenlight::engine::models::RunStatus;
use greenlight::engine::notify::NotificationGateway;
use greenlight::engine::store::{EngineDb, StoreHandle};
use greenlight::engine::sweep::Sweeper;
use greenlight::errors::EngineError;
use greenlight::phases::default_pipeline;
use greenlight::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "greenlight")]
#[command(version, about = "Durable human-in-the-loop pipeline engine")]
struct Cli {
    /// Path to the engine database
    #[arg(long, global = true, default_value = ".greenlight/engine.db")]
    db: PathBuf,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server with the default validation pipeline
    Serve {
        #[arg(long, default_value = "4180")]
        port: u16,
        /// Callback URL notified when a run needs a decision
        /// (falls back to GREENLIGHT_NOTIFY_URL)
        #[arg(long)]
        notify_url: Option<String>,
        /// Bind on all interfaces and allow any CORS origin
        #[arg(long)]
        dev: bool,
    },
    /// Submit a run and drive it until it pauses or finishes
    Run {
        /// The idea to validate
        #[arg(long)]
        idea: String,
        /// The problem it solves
        #[arg(long)]
        problem: Option<String>,
        #[arg(long, default_value = "local")]
        project: String,
        #[arg(long, default_value = "cli")]
        user: String,
    },
    /// Show a run's status, pending checkpoint, and history
    Status { run_id: String },
    /// Supply a decision for a pending checkpoint and continue the run
    Resume {
        run_id: String,
        checkpoint: String,
        decision: String,
        #[arg(long)]
        feedback: Option<String>,
        #[arg(long, default_value = "cli")]
        decided_by: String,
    },
    /// One reconciliation pass: expire overdue decisions, re-drive stuck runs
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "greenlight=debug"
    } else {
        "greenlight=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, notify_url, dev } => {
            let config = ServerConfig {
                port,
                db_path: cli.db,
                notify_url: notify_url.or_else(|| std::env::var("GREENLIGHT_NOTIFY_URL").ok()),
                dev_mode: dev,
                ..ServerConfig::default()
            };
            start_server(config, default_pipeline()).await
        }
        Commands::Run { idea, problem, project, user } => {
            let engine = open_engine(&cli.db)?;
            let input = serde_json::json!({
                "input": {"idea": idea, "problem": problem}
            });
            let run = engine.controller().start(&project, &user, input).await?;
            println!("Run {} submitted", style(&run.id).cyan());
            engine.controller().advance(&run.id).await?;
            print_status(&engine, &run.id).await
        }
        Commands::Status { run_id } => {
            let engine = open_engine(&cli.db)?;
            print_status(&engine, &run_id).await
        }
        Commands::Resume { run_id, checkpoint, decision, feedback, decided_by } => {
            let engine = open_engine(&cli.db)?;
            match engine
                .dispatcher()
                .resume(&run_id, &checkpoint, &decision, feedback, &decided_by)
                .await
            {
                Ok(_) => {}
                Err(EngineError::AlreadyDecided { status, .. }) => {
                    println!(
                        "{} checkpoint already decided ({})",
                        style("note:").yellow(),
                        status
                    );
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
            print_status(&engine, &run_id).await
        }
        Commands::Sweep => {
            let engine = open_engine(&cli.db)?;
            let sweeper = Sweeper::new(
                engine.store().clone(),
                std::sync::Arc::clone(engine.controller()),
                chrono::Duration::minutes(10),
            );
            let report = sweeper.run_once().await?;
            println!(
                "Sweep done: {} expired, {} re-advanced",
                report.expired, report.readvanced
            );
            Ok(())
        }
    }
}

fn open_engine(db_path: &PathBuf) -> Result<Engine> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = EngineDb::new(db_path).context("Failed to open engine database")?;
    let notify_url = std::env::var("GREENLIGHT_NOTIFY_URL").ok();
    Ok(Engine::new(
        StoreHandle::new(db),
        default_pipeline(),
        NotificationGateway::new(notify_url),
        chrono::Duration::days(7),
    ))
}

async fn print_status(engine: &Engine, run_id: &str) -> Result<()> {
    let run = engine.controller().load(run_id).await?;

    let status = match run.status {
        RunStatus::Completed => style(run.status.as_str()).green(),
        RunStatus::Failed => style(run.status.as_str()).red(),
        RunStatus::Paused => style(run.status.as_str()).yellow(),
        _ => style(run.status.as_str()).cyan(),
    };
    let phase_name = engine
        .controller()
        .pipeline()
        .phase_name(run.current_phase as usize)
        .unwrap_or("done");
    println!(
        "Run {} — {} (phase {}: {})",
        style(&run.id).cyan(),
        status,
        run.current_phase,
        phase_name
    );

    if let Some(error) = &run.error {
        println!("  {} {}", style("error:").red(), error);
    }

    if let Some(checkpoint) = &run.pending_checkpoint {
        println!(
            "  Awaiting decision {} — {}",
            style(&checkpoint.name).yellow(),
            checkpoint.title
        );
        for option in &checkpoint.options {
            let marker = if checkpoint.recommended_option.as_deref() == Some(option.id.as_str()) {
                style("*").green().to_string()
            } else {
                " ".to_string()
            };
            println!("   {} {} — {}", marker, option.id, option.label);
        }
        println!(
            "  Resolve with: greenlight resume {} {} <decision>",
            run.id, checkpoint.name
        );
    }

    Ok(())
}
