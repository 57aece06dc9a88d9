//! Superagent CLI - host for the session backbone and cron scheduler
//!
//! `serve` runs sessions and cron jobs in-process with a demo handler;
//! the `cron` subcommands manage the job store offline.

mod handler;

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use console::style;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use handler::EchoHandler;
use superagent_core::config::{Config, ConfigManager};
use superagent_core::scheduler::{CronExpr, CronJobRecord, CronScheduler, JobStore};
use superagent_core::session::{
    handler_driver, CancelOutcome, DriverFactory, RequestPayload, ResponseFrame, SessionManager,
    Termination,
};

#[derive(Parser)]
#[command(name = "superagent")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Session backbone and cron scheduler for agent backends", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve requests from stdin, one per line
    Serve {
        /// Session to submit requests into
        #[arg(short, long, default_value = "cli")]
        session: String,
    },

    /// Manage cron jobs
    #[command(subcommand)]
    Cron(CronCommands),

    /// Show configuration
    Config,
}

#[derive(Subcommand)]
enum CronCommands {
    /// Add a job
    Add {
        /// Cron expression, 5 or 6 fields or an @alias
        expr: String,
        /// Task delivered to the cron session on every fire
        description: String,
        /// Job id (generated if omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// List stored jobs
    List,

    /// Delete a job
    Delete {
        /// Job id
        id: String,
    },

    /// Show upcoming fire times of an expression
    Next {
        /// Cron expression
        expr: String,
        /// Number of fire times
        #[arg(short = 'n', long, default_value_t = 5)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::with_path(path.clone())?,
        None => ConfigManager::new()?,
    };

    // Logs go to stderr so they never mix with streamed responses
    let filter = if cli.verbose {
        EnvFilter::new("info,superagent_core=debug,superagent_mcp=debug")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&config_manager.config().general.log_level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Serve { session }) => run_serve(config_manager.config(), &session).await?,
        Some(Commands::Cron(cmd)) => handle_cron_command(config_manager.config(), cmd)?,
        Some(Commands::Config) => show_config(&config_manager)?,
        None => run_serve(config_manager.config(), "cli").await?,
    }

    Ok(())
}

/// Run sessions and cron jobs until stdin closes or Ctrl-C
async fn run_serve(config: &Config, session_id: &str) -> anyhow::Result<()> {
    let connections = config
        .enabled_connections()
        .into_iter()
        .map(|(name, c)| (name.to_string(), c.clone()))
        .collect();
    let driver = handler_driver(Arc::new(EchoHandler::new(connections)));

    let sessions = SessionManager::new(config.session_config());
    let scheduler = CronScheduler::new(sessions.clone(), config.cron_config(), Some(Arc::clone(&driver)));
    let restored = scheduler.load_from_disk();

    println!("{}", style("Superagent").bold());
    println!(
        "  Session {}  cron jobs {}",
        style(session_id).cyan(),
        style(restored).cyan()
    );
    println!(
        "  {}",
        style("Type a request, /cancel <request-id>, /sessions or /quit").dim()
    );
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => {}
            ("/quit", _) => break,
            ("/sessions", _) => {
                for id in sessions.list_sessions() {
                    println!("  {}", style(id).cyan());
                }
            }
            ("/cancel", request_id) => {
                let outcome = sessions.cancel(session_id, request_id.trim()).await;
                let message = match outcome {
                    CancelOutcome::Canceled => style("canceled").yellow(),
                    CancelOutcome::SessionNotFound => style("session not found").red(),
                    CancelOutcome::RequestNotFound => style("request not found or finished").dim(),
                };
                println!("  {}", message);
            }
            _ => submit(&sessions, session_id, &driver, line),
        }
    }

    println!("{}", style("Shutting down...").dim());
    scheduler.shutdown().await;
    sessions.shutdown().await;
    Ok(())
}

/// Queue one request and print its stream in the background
fn submit(sessions: &SessionManager, session_id: &str, driver: &DriverFactory, text: &str) {
    let Some(session) = sessions.get_or_create(session_id, true, Some(driver)) else {
        eprintln!("{}", style("Session unavailable").red());
        return;
    };

    let (request, mut stream) = session.submit(RequestPayload::text(text));
    let short_id: String = request.id().chars().take(8).collect();
    println!("  {} {}", style("queued").dim(), style(request.id()).dim());

    tokio::spawn(async move {
        let mut output = String::new();
        while let Some(frame) = stream.recv().await {
            match frame {
                ResponseFrame::Chunk(chunk) => output.push_str(&chunk),
                ResponseFrame::End(termination) => {
                    let status = match &termination {
                        Termination::Completed => style("done".to_string()).green(),
                        Termination::Rejected => style("rejected".to_string()).red(),
                        Termination::Canceled => style("canceled".to_string()).yellow(),
                        Termination::Failed(reason) => style(format!("failed: {}", reason)).red(),
                    };
                    println!("{} {} [{}]", style(&short_id).cyan(), output.trim_end(), status);
                }
            }
        }
    });
}

/// Manage the job store without starting any job
fn handle_cron_command(config: &Config, cmd: CronCommands) -> anyhow::Result<()> {
    let store = JobStore::new(config.cron_config().persistence_path);

    match cmd {
        CronCommands::Add {
            expr,
            description,
            id,
        } => {
            let parsed = CronExpr::parse(&expr)?;
            let record = CronJobRecord {
                id: id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                cron_expr: parsed.source().to_string(),
                task_description: description,
            };
            let id = record.id.clone();
            store.upsert(record)?;
            println!("{} {}", style("Added").green(), style(id).cyan());
            if let Some(next) = parsed.next_after(Utc::now()) {
                println!("  Next run: {}", next.with_timezone(&Local).to_rfc3339());
            }
        }
        CronCommands::List => {
            let jobs = store.load();
            println!("{}", style("Cron Jobs:").bold());
            println!();
            if jobs.is_empty() {
                println!("  {}", style("No jobs stored").dim());
                println!("  Store: {}", style(store.path().display()).dim());
            }
            for job in jobs {
                let next = CronExpr::parse(&job.cron_expr)
                    .ok()
                    .and_then(|e| e.next_after(Utc::now()))
                    .map(|t| t.with_timezone(&Local).to_rfc3339())
                    .unwrap_or_else(|| "invalid".to_string());
                println!(
                    "  {:<38} {:<18} {}",
                    style(&job.id).cyan(),
                    job.cron_expr,
                    job.task_description
                );
                println!("  {:<38} {}", "", style(format!("next: {}", next)).dim());
            }
        }
        CronCommands::Delete { id } => {
            if store.remove(&id)? {
                println!("{} {}", style("Deleted").green(), style(id).cyan());
            } else {
                println!("{} {}", style("No such job").yellow(), style(id).cyan());
            }
        }
        CronCommands::Next { expr, count } => {
            for time in CronScheduler::next_run_times(&expr, count)? {
                println!("  {}", time.with_timezone(&Local).to_rfc3339());
            }
        }
    }

    Ok(())
}

fn show_config(manager: &ConfigManager) -> anyhow::Result<()> {
    println!("{}", style("Configuration:").bold());
    println!();
    println!("  Config file: {}", style(manager.config_path().display()).green());
    println!(
        "  Cron store: {}",
        style(manager.config().cron.persistence_path.display()).dim()
    );
    println!();
    println!("{}", serde_json::to_string_pretty(manager.config())?);
    Ok(())
}
