use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{RbError, Result};
use crate::healthcheck::{DEFAULT_MAX_POLLS, HealthCheckSettings};
use crate::plugin::PluginAccess;

const DEFAULT_LOG_LEVEL: &str = "info";

/// Log output format.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Options shared by every subcommand.
#[derive(Debug, Args, Default)]
pub struct GlobalArgs {
    /// Base URL of the K8s orchestration plugin API (e.g. http://host:9015/v1).
    #[arg(long, global = true)]
    pub plugin_url: Option<String>,

    /// Plugin Basic-auth user (defaults to $K8S_PLUGIN_USERNAME).
    #[arg(long, global = true)]
    pub username: Option<String>,

    /// Plugin Basic-auth password (defaults to $K8S_PLUGIN_PASSWORD).
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Blueprint root holding Templates/k8s-profiles (defaults to $RB_BLUEPRINT_ROOT or ".").
    #[arg(long, global = true)]
    pub blueprint_root: Option<PathBuf>,

    /// Optional TOML file with defaults for the options above.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// JSON object of resolved inputs (blueprint properties, inventory payloads).
    #[arg(long, global = true)]
    pub inputs: Option<PathBuf>,

    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormat>,

    /// Log level or filter directive; RUST_LOG takes precedence.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Seconds between health/status polls (default 10).
    #[arg(long, global = true)]
    pub poll_interval_secs: Option<u64>,

    /// Maximum polls per instance before timing out (default 30).
    #[arg(long, global = true)]
    pub max_polls: Option<u32>,
}

/// Resource-bundle coordinates; falls back to resolved inputs when omitted.
#[derive(Debug, Clone, Args, Default)]
pub struct DefinitionArgs {
    /// RB definition name (vf-module model invariant id).
    #[arg(long)]
    pub rb_name: Option<String>,

    /// RB definition version (vf-module model version id).
    #[arg(long)]
    pub rb_version: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct ProfileUploadArgs {
    #[command(flatten)]
    pub definition: DefinitionArgs,

    #[arg(long)]
    pub profile_name: Option<String>,

    #[arg(long)]
    pub namespace: Option<String>,

    /// Replace override_values.yaml in the profile archive with this file.
    #[arg(long, conflicts_with = "supported_nssai")]
    pub override_values: Option<PathBuf>,

    /// Set config.supportedNssai.sNssai.snssai in override_values.yaml.
    #[arg(long)]
    pub supported_nssai: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct InventoryArgs {
    /// Inventory vf-modules response (JSON); defaults to the `vf-modules` input.
    #[arg(long)]
    pub inventory: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
pub struct ConfigApplyArgs {
    #[command(flatten)]
    pub inventory: InventoryArgs,

    /// Supported-NSSAI payload; defaults to the resolved input.
    #[arg(long)]
    pub supported_nssai: Option<String>,

    /// Config name; generated as config_<6 digits> when omitted.
    #[arg(long)]
    pub config_name: Option<String>,
}

#[derive(Debug, Clone, Args)]
pub struct InstancesArgs {
    /// Instance id to check (repeatable); defaults to helm modules of the inventory.
    #[arg(long = "instance")]
    pub instances: Vec<String>,

    #[command(flatten)]
    pub inventory: InventoryArgs,
}

#[derive(Debug, Clone, Args)]
pub struct TransformArgs {
    /// Source tar.gz archive.
    #[arg(long)]
    pub archive: PathBuf,

    /// Manifest path relative to the archive root.
    #[arg(long)]
    pub manifest: PathBuf,

    /// YAML list of manifest mutations.
    #[arg(long)]
    pub mutations: PathBuf,

    /// Output archive; the source is rewritten in place when omitted.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create a profile under an RB definition and upload its archive.
    ProfileUpload(ProfileUploadArgs),
    /// Publish config templates for every vf-module of the inventory.
    ConfigTemplate(InventoryArgs),
    /// Upsert supported-NSSAI config for every vf-module of the inventory.
    ConfigApply(ConfigApplyArgs),
    /// Run plugin health checks against deployed instances.
    HealthCheck(InstancesArgs),
    /// Wait until every pod of the given instances is Running.
    StatusCheck(InstancesArgs),
    /// Apply a mutation file to a local archive.
    Transform(TransformArgs),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::ProfileUpload(_) => "profile-upload",
            Command::ConfigTemplate(_) => "config-template",
            Command::ConfigApply(_) => "config-apply",
            Command::HealthCheck(_) => "health-check",
            Command::StatusCheck(_) => "status-check",
            Command::Transform(_) => "transform",
        }
    }

    pub fn needs_plugin(&self) -> bool {
        !matches!(self, Command::Transform(_))
    }
}

/// Top-level CLI structure.
#[derive(Debug, Parser)]
#[command(
    name = "rb-deployer",
    version,
    about = "Publishes K8s resource-bundle profiles, config templates and configs, and verifies instance health.",
    long_about = "Plugin access comes from --plugin-url/--username/--password or K8S_PLUGIN_URL/K8S_PLUGIN_USERNAME/K8S_PLUGIN_PASSWORD, then from the optional --config TOML file."
)]
pub struct CliArgs {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings read from the optional TOML file. Flags and env vars win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub plugin_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub blueprint_root: Option<PathBuf>,
    pub log_format: Option<LogFormat>,
    pub log_level: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub max_polls: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|err| {
            RbError::Config(format!("failed to read {}: {err}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|err| RbError::Config(format!("invalid config {}: {err}", path.display())))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: DEFAULT_LOG_LEVEL.to_string(),
        }
    }
}

/// Complete configuration used by the deployer.
#[derive(Debug, Clone)]
pub struct RbDeployerConfig {
    pub command: Command,
    pub plugin: Option<PluginAccess>,
    pub blueprint_root: PathBuf,
    pub inputs: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub health: HealthCheckSettings,
}

impl RbDeployerConfig {
    pub fn from_env_and_args(cli: CliArgs) -> Result<Self> {
        Self::from_env_and_args_with_env(cli, |key| env::var(key).ok())
    }

    pub fn from_env_and_args_with_env<F>(cli: CliArgs, get_env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let args = cli.global;
        let file = match args
            .config
            .clone()
            .or_else(|| get_env("RB_DEPLOYER_CONFIG").map(PathBuf::from))
        {
            Some(path) => FileConfig::load(&path)?,
            None => FileConfig::default(),
        };

        let plugin_url = args
            .plugin_url
            .or_else(|| get_env("K8S_PLUGIN_URL"))
            .or(file.plugin_url);
        let plugin = match plugin_url {
            Some(url) => Some(PluginAccess::new(
                validate_plugin_url(&url)?,
                args.username
                    .or_else(|| get_env("K8S_PLUGIN_USERNAME"))
                    .or(file.username)
                    .unwrap_or_default(),
                args.password
                    .or_else(|| get_env("K8S_PLUGIN_PASSWORD"))
                    .or(file.password)
                    .unwrap_or_default(),
            )),
            None if cli.command.needs_plugin() => {
                return Err(RbError::Config(format!(
                    "{} requires --plugin-url or K8S_PLUGIN_URL",
                    cli.command.name()
                )));
            }
            None => None,
        };

        let blueprint_root = args
            .blueprint_root
            .or_else(|| get_env("RB_BLUEPRINT_ROOT").map(PathBuf::from))
            .or(file.blueprint_root)
            .unwrap_or_else(|| PathBuf::from("."));

        let logging = LoggingConfig {
            format: args.log_format.or(file.log_format).unwrap_or_default(),
            level: args
                .log_level
                .or(file.log_level)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string()),
        };

        let defaults = HealthCheckSettings::default();
        let health = HealthCheckSettings {
            poll_interval: args
                .poll_interval_secs
                .or(file.poll_interval_secs)
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            max_polls: args.max_polls.or(file.max_polls).unwrap_or(DEFAULT_MAX_POLLS),
        };

        Ok(Self {
            command: cli.command,
            plugin,
            blueprint_root,
            inputs: args.inputs.or_else(|| get_env("RB_INPUTS").map(PathBuf::from)),
            logging,
            health,
        })
    }

    /// Plugin access, required by every subcommand except `transform`.
    pub fn require_plugin(&self) -> Result<&PluginAccess> {
        self.plugin
            .as_ref()
            .ok_or_else(|| RbError::Config("plugin URL is not configured".into()))
    }
}

fn validate_plugin_url(raw: &str) -> Result<String> {
    let url = Url::parse(raw)
        .map_err(|err| RbError::Config(format!("invalid plugin URL '{raw}': {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(raw.to_string()),
        other => Err(RbError::Config(format!(
            "plugin URL '{raw}' must use http or https, not {other}"
        ))),
    }
}
