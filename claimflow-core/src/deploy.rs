//! Container Apps deployment driver.
//!
//! Builds the API image, pushes it to Azure Container Registry, creates or updates the
//! Container App, gives it a system-assigned identity and grants that identity access
//! to the Azure OpenAI resource. Every step shells out to `az` or `docker` through a
//! [`CommandRunner`]; steps run strictly in order and the first failure aborts the run.

use crate::config::DeployConfig;
use crate::error::{ConfigError, DeployError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Placeholder shown in dry-run plans where the identity's principal id will go.
pub const PRINCIPAL_PLACEHOLDER: &str = "<principal-id>";

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Indexes into `args` that must not be printed.
    masked: Vec<usize>,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            masked: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.masked.push(self.args.len());
        self.args.push(arg.into());
        self
    }

    /// Command line with secret values replaced by `***`.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for (i, arg) in self.args.iter().enumerate() {
            line.push(' ');
            if self.masked.contains(&i) {
                match arg.split_once('=') {
                    Some((name, _)) => {
                        line.push_str(name);
                        line.push_str("=***");
                    }
                    None => line.push_str("***"),
                }
            } else if arg.contains(' ') {
                line.push_str(&format!("\"{arg}\""));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Exit code and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Runs external commands.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, command: &CommandSpec) -> std::result::Result<CommandOutput, DeployError>;
}

/// Runs commands as child processes.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, command: &CommandSpec) -> std::result::Result<CommandOutput, DeployError> {
        let output = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DeployError::Spawn {
                program: command.program.clone(),
                message: e.to_string(),
            })?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Variables from the env file, split into plain values and secrets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvVars {
    pub plain: Vec<(String, String)>,
    pub secrets: Vec<(String, String)>,
}

/// Names containing `KEY` or `SECRET` are stored as Container App secrets.
pub fn is_secret_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.contains("KEY") || upper.contains("SECRET")
}

/// Container App secret names allow lowercase alphanumerics and `-` only.
pub fn secret_name(var: &str) -> String {
    var.to_ascii_lowercase().replace('_', "-")
}

impl EnvVars {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut vars = Self::default();
        for (name, value) in pairs {
            if is_secret_name(&name) {
                vars.secrets.push((name, value));
            } else {
                vars.plain.push((name, value));
            }
        }
        vars
    }

    pub fn is_empty(&self) -> bool {
        self.plain.is_empty() && self.secrets.is_empty()
    }

    /// `NAME=value` and `NAME=secretref:name` arguments for `--env-vars`.
    fn env_var_args(&self) -> Vec<String> {
        self.plain
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .chain(
                self.secrets
                    .iter()
                    .map(|(k, _)| format!("{k}=secretref:{}", secret_name(k))),
            )
            .collect()
    }
}

/// Read the deployment env file.
pub fn load_env_file(path: &Path) -> std::result::Result<EnvVars, DeployError> {
    if !path.is_file() {
        return Err(DeployError::EnvFileMissing {
            path: path.to_path_buf(),
        });
    }
    let iter = dotenvy::from_path_iter(path).map_err(|e| DeployError::EnvFileInvalid {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let mut pairs = Vec::new();
    for item in iter {
        let pair = item.map_err(|e| DeployError::EnvFileInvalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        pairs.push(pair);
    }
    Ok(EnvVars::from_pairs(pairs))
}

/// [`DeployConfig`] with every required field present.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploySettings {
    pub env_file: PathBuf,
    pub resource_group: String,
    pub registry: String,
    pub environment: String,
    pub app_name: String,
    pub image_name: String,
    pub image_tag: String,
    pub build_context: PathBuf,
    pub dockerfile: Option<PathBuf>,
    pub target_port: u16,
    pub cpu: String,
    pub memory: String,
    pub min_replicas: u32,
    pub max_replicas: u32,
    pub role: String,
    pub role_scope: Option<String>,
}

fn required(value: Option<&str>, field: &str) -> std::result::Result<String, ConfigError> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConfigError::MissingField {
            field: field.to_string(),
        })
}

impl DeploySettings {
    pub fn from_config(config: &DeployConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            env_file: config.env_file.clone(),
            resource_group: required(config.resource_group.as_deref(), "deploy.resource_group")?,
            registry: required(config.registry.as_deref(), "deploy.registry")?,
            environment: required(config.environment.as_deref(), "deploy.environment")?,
            app_name: config.app_name.clone(),
            image_name: config.image_name.clone(),
            image_tag: config.image_tag.clone(),
            build_context: config.build_context.clone(),
            dockerfile: config.dockerfile.clone(),
            target_port: config.target_port,
            cpu: config.cpu.clone(),
            memory: config.memory.clone(),
            min_replicas: config.min_replicas,
            max_replicas: config.max_replicas,
            role: config.role.clone(),
            role_scope: config
                .role_scope
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string),
        })
    }

    /// `<registry>.azurecr.io`, unless the registry is already a login server.
    pub fn registry_server(&self) -> String {
        if self.registry.contains('.') {
            self.registry.clone()
        } else {
            format!("{}.azurecr.io", self.registry)
        }
    }

    fn registry_name(&self) -> &str {
        self.registry.split('.').next().unwrap_or(&self.registry)
    }

    pub fn local_image(&self) -> String {
        format!("{}:{}", self.image_name, self.image_tag)
    }

    pub fn remote_image(&self) -> String {
        format!("{}/{}:{}", self.registry_server(), self.image_name, self.image_tag)
    }

    fn app_args(&self, verb: &str) -> CommandSpec {
        CommandSpec::new(
            "az",
            [
                "containerapp",
                verb,
                "--name",
                self.app_name.as_str(),
                "--resource-group",
                self.resource_group.as_str(),
            ],
        )
    }

    pub fn environment_show(&self) -> CommandSpec {
        CommandSpec::new(
            "az",
            [
                "containerapp",
                "env",
                "show",
                "--name",
                self.environment.as_str(),
                "--resource-group",
                self.resource_group.as_str(),
                "--output",
                "none",
            ],
        )
    }

    pub fn acr_login(&self) -> CommandSpec {
        CommandSpec::new("az", ["acr", "login", "--name", self.registry_name()])
    }

    pub fn docker_build(&self) -> CommandSpec {
        let mut cmd = CommandSpec::new("docker", ["build", "-t", self.local_image().as_str()]);
        if let Some(dockerfile) = &self.dockerfile {
            cmd = cmd.arg("-f").arg(dockerfile.display().to_string());
        }
        cmd.arg(self.build_context.display().to_string())
    }

    pub fn docker_tag(&self) -> CommandSpec {
        CommandSpec::new("docker", ["tag", self.local_image().as_str(), self.remote_image().as_str()])
    }

    pub fn docker_push(&self) -> CommandSpec {
        CommandSpec::new("docker", ["push", self.remote_image().as_str()])
    }

    pub fn app_show(&self) -> CommandSpec {
        self.app_args("show").arg("--query").arg("name").arg("--output").arg("tsv")
    }

    pub fn app_create(&self, env: &EnvVars) -> CommandSpec {
        let mut cmd = self
            .app_args("create")
            .arg("--environment")
            .arg(&self.environment)
            .arg("--image")
            .arg(self.remote_image())
            .arg("--registry-server")
            .arg(self.registry_server())
            .arg("--target-port")
            .arg(self.target_port.to_string())
            .arg("--ingress")
            .arg("external")
            .arg("--cpu")
            .arg(&self.cpu)
            .arg("--memory")
            .arg(&self.memory)
            .arg("--min-replicas")
            .arg(self.min_replicas.to_string())
            .arg("--max-replicas")
            .arg(self.max_replicas.to_string());
        if !env.secrets.is_empty() {
            cmd = cmd.arg("--secrets");
            for (k, v) in &env.secrets {
                cmd = cmd.secret_arg(format!("{}={v}", secret_name(k)));
            }
        }
        if !env.is_empty() {
            cmd = cmd.arg("--env-vars");
            for arg in env.env_var_args() {
                cmd = cmd.arg(arg);
            }
        }
        cmd
    }

    /// `az containerapp secret set`, needed before an update can reference new secrets.
    pub fn app_secret_set(&self, env: &EnvVars) -> Option<CommandSpec> {
        if env.secrets.is_empty() {
            return None;
        }
        let mut cmd = CommandSpec::new(
            "az",
            [
                "containerapp",
                "secret",
                "set",
                "--name",
                self.app_name.as_str(),
                "--resource-group",
                self.resource_group.as_str(),
                "--secrets",
            ],
        );
        for (k, v) in &env.secrets {
            cmd = cmd.secret_arg(format!("{}={v}", secret_name(k)));
        }
        Some(cmd)
    }

    pub fn app_update(&self, env: &EnvVars) -> CommandSpec {
        let mut cmd = self
            .app_args("update")
            .arg("--image")
            .arg(self.remote_image())
            .arg("--cpu")
            .arg(&self.cpu)
            .arg("--memory")
            .arg(&self.memory)
            .arg("--min-replicas")
            .arg(self.min_replicas.to_string())
            .arg("--max-replicas")
            .arg(self.max_replicas.to_string());
        if !env.is_empty() {
            cmd = cmd.arg("--set-env-vars");
            for arg in env.env_var_args() {
                cmd = cmd.arg(arg);
            }
        }
        cmd
    }

    pub fn identity_assign(&self) -> CommandSpec {
        CommandSpec::new(
            "az",
            [
                "containerapp",
                "identity",
                "assign",
                "--name",
                self.app_name.as_str(),
                "--resource-group",
                self.resource_group.as_str(),
                "--system-assigned",
            ],
        )
    }

    pub fn principal_lookup(&self) -> CommandSpec {
        self.app_args("show")
            .arg("--query")
            .arg("identity.principalId")
            .arg("--output")
            .arg("tsv")
    }

    /// `None` when no role scope is configured.
    pub fn role_assignment(&self, principal_id: &str) -> Option<CommandSpec> {
        let scope = self.role_scope.as_deref()?;
        Some(CommandSpec::new(
            "az",
            [
                "role",
                "assignment",
                "create",
                "--assignee-object-id",
                principal_id,
                "--assignee-principal-type",
                "ServicePrincipal",
                "--role",
                self.role.as_str(),
                "--scope",
                scope,
            ],
        ))
    }

    pub fn fqdn_lookup(&self) -> CommandSpec {
        self.app_args("show")
            .arg("--query")
            .arg("properties.configuration.ingress.fqdn")
            .arg("--output")
            .arg("tsv")
    }
}

/// One named command in a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployStep {
    pub name: String,
    pub command: CommandSpec,
}

impl DeployStep {
    fn new(name: &str, command: CommandSpec) -> Self {
        Self {
            name: name.to_string(),
            command,
        }
    }
}

/// What a completed deployment did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub image: String,
    pub created: bool,
    pub principal_id: String,
    pub role_assigned: bool,
    /// `https://<fqdn>` of the app's ingress, when Azure reports one.
    pub url: Option<String>,
}

/// Runs a deployment against a [`CommandRunner`].
pub struct Deployer<'a> {
    runner: &'a dyn CommandRunner,
    settings: DeploySettings,
}

impl<'a> Deployer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, settings: DeploySettings) -> Self {
        Self { runner, settings }
    }

    pub fn settings(&self) -> &DeploySettings {
        &self.settings
    }

    /// The steps a fresh deployment would run. Nothing is executed.
    ///
    /// Assumes the app does not exist yet and shows [`PRINCIPAL_PLACEHOLDER`] in the
    /// role assignment.
    pub fn plan(&self) -> Result<Vec<DeployStep>> {
        let env = load_env_file(&self.settings.env_file)?;
        let s = &self.settings;
        let mut steps = vec![
            DeployStep::new("check environment", s.environment_show()),
            DeployStep::new("acr login", s.acr_login()),
            DeployStep::new("docker build", s.docker_build()),
            DeployStep::new("docker tag", s.docker_tag()),
            DeployStep::new("docker push", s.docker_push()),
            DeployStep::new("check app", s.app_show()),
            DeployStep::new("create app", s.app_create(&env)),
            DeployStep::new("assign identity", s.identity_assign()),
            DeployStep::new("lookup principal", s.principal_lookup()),
        ];
        if let Some(cmd) = s.role_assignment(PRINCIPAL_PLACEHOLDER) {
            steps.push(DeployStep::new("grant role", cmd));
        }
        Ok(steps)
    }

    async fn step(&self, name: &str, command: &CommandSpec) -> Result<CommandOutput> {
        info!(step = name, "Running deployment step");
        debug!(command = %command.display(), "Executing");
        let output = self.runner.run(command).await?;
        if !output.success() {
            return Err(DeployError::StepFailed {
                step: name.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    /// Run the whole deployment.
    pub async fn deploy(&self) -> Result<DeployOutcome> {
        let s = &self.settings;
        let env = load_env_file(&s.env_file)?;
        info!(
            plain = env.plain.len(),
            secrets = env.secrets.len(),
            "Loaded deployment environment"
        );

        let env_check = self.runner.run(&s.environment_show()).await?;
        if !env_check.success() {
            return Err(DeployError::EnvironmentMissing {
                environment: s.environment.clone(),
                resource_group: s.resource_group.clone(),
            }
            .into());
        }

        self.step("acr login", &s.acr_login()).await?;
        self.step("docker build", &s.docker_build()).await?;
        self.step("docker tag", &s.docker_tag()).await?;
        self.step("docker push", &s.docker_push()).await?;

        let exists = self.runner.run(&s.app_show()).await?.success();
        if exists {
            info!(app = %s.app_name, "Container app exists, updating");
            if let Some(cmd) = s.app_secret_set(&env) {
                self.step("set secrets", &cmd).await?;
            }
            self.step("update app", &s.app_update(&env)).await?;
        } else {
            info!(app = %s.app_name, "Creating container app");
            self.step("create app", &s.app_create(&env)).await?;
        }

        self.step("assign identity", &s.identity_assign()).await?;
        let principal_id = self
            .step("lookup principal", &s.principal_lookup())
            .await?
            .stdout
            .trim()
            .to_string();
        if principal_id.is_empty() {
            return Err(DeployError::StepFailed {
                step: "lookup principal".to_string(),
                code: 0,
                stderr: "no principal id returned".to_string(),
            }
            .into());
        }

        let role_assigned = match s.role_assignment(&principal_id) {
            Some(cmd) => {
                self.step("grant role", &cmd).await?;
                true
            }
            None => {
                warn!("deploy.role_scope not set; skipping role assignment");
                false
            }
        };

        let url = match self.runner.run(&s.fqdn_lookup()).await {
            Ok(out) if out.success() && !out.stdout.trim().is_empty() => {
                Some(format!("https://{}", out.stdout.trim()))
            }
            _ => None,
        };

        info!(image = %s.remote_image(), created = !exists, "Deployment complete");
        Ok(DeployOutcome {
            image: s.remote_image(),
            created: !exists,
            principal_id,
            role_assigned,
            url,
        })
    }
}
