#![forbid(unsafe_code)]

pub mod apply;
pub mod archive;
pub mod config;
pub mod deploy;
pub mod error;
pub mod healthcheck;
pub mod host;
pub mod model;
pub mod plugin;
pub mod resolver;
pub mod status_check;
pub mod telemetry;

pub use archive::{ArchiveTransformer, ManifestMutation, StagedArchive};
pub use config::{CliArgs, Command, RbDeployerConfig};
pub use deploy::{UploadOutcome, upload_config_template, upload_profile};
pub use error::{RbError, Result};
pub use healthcheck::{
    AggregateHealthResult, HealthCheckOrchestrator, HealthCheckSettings, SessionState,
    TerminalStatus,
};
pub use model::{ConfigInstance, ConfigTemplate, Profile, RbDefinition};
pub use plugin::{PluginAccess, RbApiClient, RbTransport};
pub use resolver::ResolvedModule;
