//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use claimflow_core::config::{ClaimflowConfig, init_workspace_config, load_config};
use claimflow_core::deploy::{DeploySettings, Deployer, ProcessRunner};
use claimflow_core::ocr::save_report;
use claimflow_core::providers::create_provider;
use claimflow_core::statements::process_statements;
use claimflow_core::structuring::{load_structuring_input, structured_output_path};
use claimflow_core::{ApiClient, ClaimWorkflow, JsonStructurer, MistralOcrClient, OcrEngine};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Serve { port, host } => handle_serve(port, host, workspace).await,
        Commands::Ocr { file, output_dir } => handle_ocr(file, output_dir, workspace).await,
        Commands::Structure { file } => handle_structure(file, workspace).await,
        Commands::Process { image } => handle_process(image, workspace).await,
        Commands::Statements { input, output } => {
            handle_statements(input, output, workspace).await
        }
        Commands::Check { api_url, image } => handle_check(api_url, image, workspace).await,
        Commands::Deploy { dry_run } => handle_deploy(dry_run, workspace).await,
        Commands::Config { action } => handle_config(action, workspace).await,
    }
}

fn load_workspace_config(workspace: &Path) -> anyhow::Result<ClaimflowConfig> {
    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    for warning in config.validate() {
        warn!("{}", warning);
    }
    Ok(config)
}

/// Relative paths are taken relative to the workspace.
fn resolve(workspace: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

async fn handle_serve(
    port: Option<u16>,
    host: Option<String>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let mut config = load_workspace_config(workspace)?;
    if let Some(port) = port {
        config.server.port = port;
    }
    if let Some(host) = host {
        config.server.host = host;
    }

    let workflow = ClaimWorkflow::from_config(&config)?;
    println!(
        "Claims Processing API listening on http://{}",
        config.server.bind_addr()
    );
    claimflow_core::gateway::run(&config.server, Arc::new(workflow)).await?;
    Ok(())
}

async fn handle_ocr(
    file: PathBuf,
    output_dir: Option<PathBuf>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let client = MistralOcrClient::new(&config.ocr)?;
    let output_dir = resolve(
        workspace,
        output_dir
            .as_deref()
            .unwrap_or(&config.statements.ocr_results_dir),
    );

    let report = client.extract_report(&file).await;
    let saved = save_report(&report, &output_dir)?;

    if !report.is_success() {
        anyhow::bail!(
            "OCR failed for {}: {} (result saved to {})",
            file.display(),
            report.error.as_deref().unwrap_or("unknown error"),
            saved.display()
        );
    }

    println!("OCR completed: {}", file.display());
    println!(
        "  Characters: {}",
        report.character_count.unwrap_or_default()
    );
    println!("  Pages:      {}", report.pages_processed.unwrap_or(1));
    println!("  Saved to:   {}", saved.display());
    let preview: String = report.text.chars().take(500).collect();
    if !preview.is_empty() {
        println!("\n{}", preview);
        if report.text.chars().count() > 500 {
            println!("...");
        }
    }
    Ok(())
}

async fn handle_structure(file: PathBuf, workspace: &Path) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let provider = create_provider(&config.llm, &config.retry)?;
    let structurer = JsonStructurer::new(provider)
        .with_temperature(config.llm.temperature)
        .with_max_tokens(config.llm.max_tokens);

    let input = load_structuring_input(&file)?;
    if input.is_ocr_result() {
        info!(path = %file.display(), "Loaded OCR result");
    } else {
        info!(path = %file.display(), "Loaded raw text");
    }
    let report = input.into_report(&file);
    let structured = structurer.structure_ocr_report(&report).await;

    let out = structured_output_path(&file);
    std::fs::write(&out, serde_json::to_string_pretty(&structured)?)?;

    if let Some(err) = structured.get("error").and_then(|e| e.as_str()) {
        anyhow::bail!("Structuring failed: {} (details saved to {})", err, out.display());
    }
    println!("{}", serde_json::to_string_pretty(&structured)?);
    println!("\nStructured JSON saved to: {}", out.display());
    Ok(())
}

async fn handle_process(image: PathBuf, workspace: &Path) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let workflow = ClaimWorkflow::from_config(&config)?;
    let result = workflow.process(&image).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if let Some(err) = result.get("error").and_then(|e| e.as_str()) {
        anyhow::bail!("Claim processing failed: {}", err);
    }
    Ok(())
}

async fn handle_statements(
    input: Option<PathBuf>,
    output: Option<PathBuf>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let client = MistralOcrClient::new(&config.ocr)?;
    if !client.is_configured() {
        anyhow::bail!(
            "Mistral Document AI is not configured. Set MISTRAL_DOCUMENT_AI_ENDPOINT and MISTRAL_DOCUMENT_AI_KEY."
        );
    }
    let input = resolve(
        workspace,
        input.as_deref().unwrap_or(&config.statements.input_dir),
    );
    let output = resolve(
        workspace,
        output.as_deref().unwrap_or(&config.statements.output_dir),
    );

    let processed = process_statements(&client, &input, &output).await?;
    if processed.is_empty() {
        println!("No statement images found in {}", input.display());
    } else {
        println!(
            "Processed {} statement(s) into {}:",
            processed.len(),
            output.display()
        );
        for name in &processed {
            println!("  {}", name);
        }
    }
    Ok(())
}

async fn handle_check(
    api_url: Option<String>,
    image: Option<PathBuf>,
    workspace: &Path,
) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let client = match api_url {
        Some(url) => ApiClient::new(&url).with_timeouts(
            Duration::from_secs(config.client.health_timeout_secs),
            Duration::from_secs(config.client.upload_timeout_secs),
        ),
        None => ApiClient::from_config(&config.client),
    };
    let image = resolve(
        workspace,
        image.as_deref().unwrap_or(&config.client.default_image),
    );

    println!("Testing Claims Processing API at {}", client.base_url());
    let report = client.acceptance(&image).await?;

    println!(
        "  Health:  HTTP {} ({})",
        report.health.status,
        report.health.body["status"].as_str().unwrap_or("unknown")
    );
    println!("  Upload:  HTTP {}", report.upload.status);
    println!("  Success: {}", report.success());
    if let Some(chars) = report.ocr_characters() {
        println!("  OCR characters: {}", chars);
    }
    if let Some(vehicle) = report.vehicle_info() {
        println!(
            "  Vehicle info: {}",
            serde_json::to_string_pretty(vehicle)?
        );
    }
    if let Some(err) = report.error() {
        println!("  Error: {}", err);
    }

    let failures = report.failures();
    if !failures.is_empty() {
        for failure in &failures {
            println!("  FAIL: {}", failure);
        }
        anyhow::bail!("Acceptance check failed for {}", report.api_url);
    }
    println!("All checks passed.");
    Ok(())
}

async fn handle_deploy(dry_run: bool, workspace: &Path) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let mut settings = DeploySettings::from_config(&config.deploy)?;
    settings.env_file = resolve(workspace, &settings.env_file);
    settings.build_context = resolve(workspace, &settings.build_context);
    if let Some(dockerfile) = settings.dockerfile.take() {
        settings.dockerfile = Some(resolve(workspace, &dockerfile));
    }

    let runner = ProcessRunner;
    let deployer = Deployer::new(&runner, settings);

    if dry_run {
        let steps = deployer.plan()?;
        println!("Deployment plan ({} steps):", steps.len());
        for (i, step) in steps.iter().enumerate() {
            println!("  {:>2}. {:<18} {}", i + 1, step.name, step.command.display());
        }
        if deployer.settings().role_scope.is_none() {
            println!("  (role assignment skipped: deploy.role_scope is not set)");
        }
        return Ok(());
    }

    let outcome = deployer.deploy().await?;
    println!(
        "Container app '{}' {}",
        deployer.settings().app_name,
        if outcome.created { "created" } else { "updated" }
    );
    println!("  Image:        {}", outcome.image);
    println!("  Principal ID: {}", outcome.principal_id);
    if !outcome.role_assigned {
        println!("  Role assignment skipped (deploy.role_scope is not set)");
    }
    if let Some(url) = &outcome.url {
        println!("  URL:          {}", url);
        println!("\nCheck it with: claimflow check --api-url {}", url);
    }
    Ok(())
}

async fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            match init_workspace_config(workspace)? {
                Some(path) => println!("Created default configuration at: {}", path.display()),
                None => println!(
                    "Configuration file already exists at: {}",
                    claimflow_core::config::workspace_config_path(workspace).display()
                ),
            }
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config.redacted())?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace).await.unwrap();

        let config_path = workspace.join(".claimflow").join("config.toml");
        assert!(config_path.exists());

        let content = std::fs::read_to_string(&config_path).unwrap();
        let parsed: ClaimflowConfig = toml::from_str(&content).unwrap();
        assert_eq!(parsed.llm.deployment, "gpt-4o-mini");
        assert_eq!(parsed.server.port, 8080);
    }

    #[tokio::test]
    async fn test_config_init_idempotent() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        let config_path = workspace.join(".claimflow").join("config.toml");
        std::fs::create_dir_all(config_path.parent().unwrap()).unwrap();
        std::fs::write(&config_path, "[server]\nport = 9000\n").unwrap();

        let command = Commands::Config {
            action: ConfigAction::Init,
        };
        handle_command(command, workspace).await.unwrap();

        let content = std::fs::read_to_string(&config_path).unwrap();
        assert_eq!(content, "[server]\nport = 9000\n");
    }

    #[tokio::test]
    async fn test_deploy_dry_run_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let workspace = dir.path();
        std::fs::create_dir_all(workspace.join(".claimflow")).unwrap();
        std::fs::write(
            workspace.join(".claimflow").join("config.toml"),
            "[deploy]\nresource_group = \"rg-claims\"\nregistry = \"claimsacr\"\nenvironment = \"claims-env\"\n",
        )
        .unwrap();
        std::fs::write(
            workspace.join(".env"),
            "MODEL_DEPLOYMENT_NAME=gpt-4o-mini\nAZURE_OPENAI_API_KEY=abc\n",
        )
        .unwrap();

        handle_command(Commands::Deploy { dry_run: true }, workspace)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deploy_requires_resource_group() {
        let dir = TempDir::new().unwrap();
        let err = handle_command(Commands::Deploy { dry_run: true }, dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("deploy.resource_group"));
    }

    #[test]
    fn test_resolve_relative_to_workspace() {
        let ws = Path::new("/srv/claims");
        assert_eq!(
            resolve(ws, Path::new("output/mistral")),
            PathBuf::from("/srv/claims/output/mistral")
        );
        assert_eq!(
            resolve(ws, Path::new("/tmp/statements")),
            PathBuf::from("/tmp/statements")
        );
    }
}
