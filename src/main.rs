use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use tutoria_core::{CodeGenerator, SessionRecord, Tutor};
use tutoria_llm::{HttpCodeGenerator, HttpTutor, UnconfiguredCodeGenerator, UnconfiguredTutor};
use tutoria_server::{reconcile_sessions, AppState, ServerConfig};
use tutoria_settings::TutoriaSettings;
use tutoria_store::{Database, MemorySessionStore, SessionStore, SqliteSessionStore};
use tutoria_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "tutoria", about = "Session server for the block-programming tutor")]
struct Cli {
    /// Settings file. Defaults to ~/.tutoria/settings.json.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the session server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// Keep sessions in memory only.
        #[arg(long)]
        in_memory: bool,
    },
    /// Create a session record so a learner can connect with it.
    Issue {
        #[arg(long)]
        code: String,
        /// Owner identity. A fresh one is generated when omitted.
        #[arg(long)]
        identity: Option<String>,
        #[arg(long, default_value = "en")]
        language: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = match &cli.config {
        Some(path) => tutoria_settings::load_settings_from_path(path),
        None => tutoria_settings::load_settings(),
    }
    .context("failed to load settings")?;

    match cli.command {
        Command::Serve { port, in_memory } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            settings.store.in_memory |= in_memory;
            serve(settings).await
        }
        Command::Issue {
            code,
            identity,
            language,
        } => issue(&settings, code, identity, language).await,
    }
}

async fn serve(settings: TutoriaSettings) -> anyhow::Result<()> {
    let telemetry = tutoria_telemetry::init_telemetry(TelemetryConfig {
        log_level: settings.logging.level.clone(),
        module_levels: settings.logging.module_levels.clone().into_iter().collect(),
        json: settings.logging.json,
        metrics_enabled: true,
    });

    tracing::info!("Starting Tutoria server");

    let store = open_store(&settings)?;
    let state = AppState::assemble(&settings, Arc::clone(&store), tutor(&settings), codegen(&settings))
        .context("failed to set up sandbox orchestrator")?
        .with_metrics(telemetry.metrics().cloned());

    let reconciled = reconcile_sessions(store.as_ref(), state.sandbox().as_ref())
        .await
        .context("failed to reconcile stored sessions")?;
    tracing::info!(reconciled, "stored sessions reconciled");

    let sandbox = Arc::clone(state.sandbox());
    let handle = tutoria_server::start(ServerConfig::from(&settings), state)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port(), "Tutoria server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    sandbox.shutdown().await;
    Ok(())
}

async fn issue(
    settings: &TutoriaSettings,
    code: String,
    identity: Option<String>,
    language: String,
) -> anyhow::Result<()> {
    let identity = identity.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
    let record = SessionRecord::new(code, identity, language);
    let store = open_store(settings)?;
    store
        .insert_new(&record)
        .await
        .with_context(|| format!("failed to issue session {}", record.code))?;

    let issued = serde_json::json!({ "code": record.code, "uuid": record.owner_identity });
    println!("{issued}");
    Ok(())
}

fn open_store(settings: &TutoriaSettings) -> anyhow::Result<Arc<dyn SessionStore>> {
    if settings.store.in_memory {
        return Ok(Arc::new(MemorySessionStore::new()));
    }
    let path = settings.store.resolved_path();
    let db = Database::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    Ok(Arc::new(SqliteSessionStore::new(db)))
}

fn tutor(settings: &TutoriaSettings) -> Arc<dyn Tutor> {
    match &settings.tutor.endpoint {
        Some(endpoint) => Arc::new(HttpTutor::new(
            endpoint.clone(),
            Duration::from_millis(settings.tutor.timeout_ms),
        )),
        None => {
            tracing::warn!("no tutor endpoint configured; tutor requests will fail");
            Arc::new(UnconfiguredTutor)
        }
    }
}

fn codegen(settings: &TutoriaSettings) -> Arc<dyn CodeGenerator> {
    match &settings.codegen.endpoint {
        Some(endpoint) => Arc::new(HttpCodeGenerator::new(
            endpoint.clone(),
            Duration::from_millis(settings.codegen.timeout_ms),
        )),
        None => {
            tracing::warn!("no code generator endpoint configured; sandbox starts will fail");
            Arc::new(UnconfiguredCodeGenerator)
        }
    }
}
