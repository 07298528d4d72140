use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;

use verdant::config;
use verdant::devices::SimulatedBus;
use verdant::flows::events::FlowEvent;
use verdant::flows::interpreter::FlowInterpreter;
use verdant::flows::validator::{self, Severity};
use verdant::scheduler::service::Scheduler;
use verdant::store::{FileStore, Store};

#[derive(Parser)]
#[command(name = "verdant", about = "Hydroponic automation engine")]
enum Cli {
    /// Run the scheduler engine against the simulated device bus
    #[command(alias = "serve")]
    Run {
        /// Load and start this program id immediately
        #[arg(long)]
        program: Option<String>,
        /// Controller the program runs against
        #[arg(long, default_value = "controller-1")]
        controller: String,
    },
    /// Validate a flow definition file and print the findings
    Validate {
        /// Path to a flow JSON file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenv().ok();

    match Cli::parse() {
        Cli::Run { program, controller } => run_engine(program, controller).await,
        Cli::Validate { file } => validate_flow(&file),
    }
}

async fn run_engine(
    program: Option<String>,
    controller: String,
) -> Result<(), Box<dyn Error>> {
    let config = config::Config::from_env();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("verdant=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let store: Arc<dyn Store> = Arc::new(FileStore::new(config.data_dir.clone()));
    store.load_all().await.context("failed to load store")?;

    let (events_tx, mut events_rx) = tokio::sync::broadcast::channel::<FlowEvent>(256);

    // Fire-and-forget event consumer: the seam where a dashboard or
    // websocket broadcaster would attach.
    tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            tracing::debug!(
                flow = %event.flow_id,
                run = %&event.run_id[..8.min(event.run_id.len())],
                kind = event.kind.as_str(),
                "{}",
                event.message
            );
        }
    });

    let bus = Arc::new(SimulatedBus::new());
    let interpreter = Arc::new(FlowInterpreter::new(bus, events_tx));
    let scheduler = Arc::new(Scheduler::new(
        store,
        interpreter,
        Duration::from_secs(config.tick_interval_secs),
    ));
    scheduler.restore().await;

    if let Some(program_id) = program {
        scheduler
            .start(&program_id, &controller, chrono::Utc::now())
            .await
            .context("failed to start program")?;
    }

    let loop_handle = tokio::spawn(Arc::clone(&scheduler).run_loop());

    tracing::info!(environment = %config.environment, "verdant engine running, ctrl-c to exit");
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    if scheduler.active_program().await.is_some() {
        let _ = scheduler.stop_program(chrono::Utc::now()).await;
    }
    loop_handle.abort();
    Ok(())
}

fn validate_flow(file: &PathBuf) -> Result<(), Box<dyn Error>> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let flow: verdant::flows::Flow = serde_json::from_str(&content).context("invalid flow JSON")?;

    let issues = validator::validate(&flow);
    if issues.is_empty() {
        println!("{}: ok", flow.id);
        return Ok(());
    }

    let mut errors = 0;
    for issue in &issues {
        let marker = match issue.severity {
            Severity::Error => {
                errors += 1;
                "error"
            }
            Severity::Warning => "warning",
        };
        match &issue.block_id {
            Some(block) => println!("{marker}: [{block}] {}", issue.message),
            None => println!("{marker}: {}", issue.message),
        }
    }
    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
