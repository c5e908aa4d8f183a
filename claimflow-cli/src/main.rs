//! Claimflow CLI: claims intake from the terminal.
//!
//! Serves the Claims Processing API, runs OCR and structuring on local files,
//! checks a running deployment, and deploys to Azure Container Apps.

mod commands;

use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Claimflow: insurance claim intake with hosted OCR and LLM structuring
#[derive(Parser, Debug)]
#[command(name = "claimflow", version, about, long_about = None)]
struct Cli {
    /// Workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the Claims Processing API
    Serve {
        /// Port to listen on (overrides server.port / PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to bind (overrides server.host)
        #[arg(long)]
        host: Option<String>,
    },
    /// OCR a document and save `<stem>_ocr_result.json`
    Ocr {
        /// Image or PDF to process
        file: PathBuf,
        /// Output directory (defaults to statements.ocr_results_dir)
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },
    /// Structure OCR output into claim JSON and save `<stem>_structured.json`
    Structure {
        /// OCR result JSON or plain text file
        file: PathBuf,
    },
    /// Run the full OCR → structuring workflow on one image and print the result
    Process {
        /// Claim image
        image: PathBuf,
    },
    /// OCR every statement image in a directory into Markdown files
    Statements {
        /// Input directory (defaults to statements.input_dir)
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Output directory (defaults to statements.output_dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check a running API: health, then a test upload
    Check {
        /// API base URL (defaults to client.api_url / API_URL)
        #[arg(long, env = "API_URL")]
        api_url: Option<String>,
        /// Image to upload (defaults to client.default_image)
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Build, push and deploy the API to Azure Container Apps
    Deploy {
        /// Print the commands without running them
        #[arg(long)]
        dry_run: bool,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Create default configuration file
    Init,
    /// Show current configuration (secrets redacted)
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let workspace = resolve_workspace(&cli.workspace)?;

    // .env files override the process environment; the workspace file is applied last
    let mut env_warnings = Vec::new();
    env_warnings.extend(env_file_warning(
        Path::new(".env"),
        dotenvy::dotenv_override().map(|_| ()),
    ));
    let workspace_env = workspace.join(".env");
    env_warnings.extend(env_file_warning(
        &workspace_env,
        dotenvy::from_path_override(&workspace_env),
    ));

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    // Human-readable layer for stderr (always active)
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "claimflow", "claimflow")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "claimflow.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    for warning in env_warnings {
        tracing::warn!("{warning}");
    }

    commands::handle_command(cli.command, &workspace).await
}

fn resolve_workspace(path: &Path) -> anyhow::Result<PathBuf> {
    let workspace = path
        .canonicalize()
        .with_context(|| format!("Workspace directory {} is not accessible", path.display()))?;
    if !workspace.is_dir() {
        anyhow::bail!("Workspace {} is not a directory", path.display());
    }
    Ok(workspace)
}

/// A missing env file is fine; anything else is worth a warning.
fn env_file_warning(path: &Path, result: Result<(), dotenvy::Error>) -> Option<String> {
    match result {
        Ok(()) => None,
        Err(e) if e.not_found() => None,
        Err(e) => Some(format!("Failed to load {}: {e}", path.display())),
    }
}
