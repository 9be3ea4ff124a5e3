//! Blocking deployment workflows: profile upload, config-template upload and
//! config apply. Each one validates locally, checks the definition, then
//! publishes through [`RbApiClient`].

use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::info;

use crate::archive::{ArchiveTransformer, ManifestMutation};
use crate::error::{RbError, Result};
use crate::model::{
    ConfigInstance, ConfigTemplate, Profile, RbDefinition, generate_config_name,
    nssai_config_values, parse_supported_nssai,
};
use crate::plugin::{ContentTarget, CreateOutcome, RbApiClient, RbTransport};
use crate::resolver;

pub const DEFAULT_PROFILE: &str = "default";
pub const OVERRIDE_VALUES: &str = "override_values.yaml";

const PROFILE_DIR: [&str; 2] = ["Templates", "k8s-profiles"];

/// `<root>/Templates/k8s-profiles/<profile>.tar.gz`
pub fn profile_archive_path(blueprint_root: &Path, profile_name: &str) -> PathBuf {
    profile_dir(blueprint_root).join(format!("{profile_name}.tar.gz"))
}

/// `<root>/Templates/k8s-profiles/<type>-config-template.tar.gz`
pub fn config_template_archive_path(blueprint_root: &Path, vf_module_type: &str) -> PathBuf {
    profile_dir(blueprint_root).join(format!("{vf_module_type}-config-template.tar.gz"))
}

/// `<type>/templates/configmap.yaml` inside a config-template archive.
pub fn config_map_manifest(vf_module_type: &str) -> PathBuf {
    Path::new(vf_module_type)
        .join("templates")
        .join("configmap.yaml")
}

fn profile_dir(blueprint_root: &Path) -> PathBuf {
    PROFILE_DIR
        .iter()
        .fold(blueprint_root.to_path_buf(), |path, segment| path.join(segment))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded,
    SkippedDefault,
    SkippedExisting,
}

/// How the stored profile archive is adjusted before upload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ProfileContent {
    /// Upload the stored archive unchanged.
    #[default]
    AsStored,
    /// Replace `override_values.yaml` with the given file.
    OverrideValues(PathBuf),
    /// Set `config.supportedNssai.sNssai.snssai` in `override_values.yaml`.
    SupportedNssai(String),
}

impl ProfileContent {
    fn mutations(&self) -> Vec<ManifestMutation> {
        match self {
            ProfileContent::AsStored => Vec::new(),
            ProfileContent::OverrideValues(source) => vec![ManifestMutation::ReplaceWith {
                source: source.clone(),
            }],
            ProfileContent::SupportedNssai(snssai) => {
                let mut entries = Map::new();
                entries.insert("snssai".to_string(), Value::String(snssai.clone()));
                vec![ManifestMutation::MergeMapping {
                    path: ["config", "supportedNssai", "sNssai"]
                        .iter()
                        .map(|s| s.to_string())
                        .collect(),
                    entries,
                }]
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProfileUploadRequest {
    pub definition: RbDefinition,
    pub profile_name: String,
    pub namespace: String,
    pub content: ProfileContent,
}

pub fn upload_profile<T: RbTransport>(
    client: &RbApiClient<T>,
    transformer: &ArchiveTransformer,
    blueprint_root: &Path,
    request: &ProfileUploadRequest,
) -> Result<UploadOutcome> {
    let profile_name = request.profile_name.trim();
    if profile_name.is_empty() {
        return Err(RbError::EmptyProfileName);
    }
    require_definition(client, &request.definition)?;

    if client.has_profile(&request.definition, profile_name)? {
        if profile_name == DEFAULT_PROFILE {
            info!("using default profile, skipping upload");
            return Ok(UploadOutcome::SkippedDefault);
        }
        info!("profile {profile_name} already exists, skipping upload");
        return Ok(UploadOutcome::SkippedExisting);
    }

    let source = profile_archive_path(blueprint_root, profile_name);
    let staged = transformer.stage(
        &source,
        Path::new(OVERRIDE_VALUES),
        &request.content.mutations(),
    )?;

    let profile = Profile::new(&request.definition, profile_name)
        .with_namespace(request.namespace.clone());
    if client.create_profile(&profile)? == CreateOutcome::AlreadyExists {
        return Ok(UploadOutcome::SkippedExisting);
    }
    client.upload_content(
        &request.definition,
        &ContentTarget::Profile(profile_name.to_string()),
        staged.path(),
    )?;
    info!("profile {profile_name} upload completed");
    Ok(UploadOutcome::Uploaded)
}

#[derive(Debug, Clone)]
pub struct ConfigTemplateRequest {
    pub definition: RbDefinition,
    pub template_name: String,
    pub vf_module_type: String,
    /// `GET /instance/{id}` response of the instance the template targets.
    pub instance_details: Value,
}

pub fn upload_config_template<T: RbTransport>(
    client: &RbApiClient<T>,
    transformer: &ArchiveTransformer,
    blueprint_root: &Path,
    request: &ConfigTemplateRequest,
) -> Result<UploadOutcome> {
    if request.template_name.trim().is_empty() {
        return Err(RbError::Validation("config template name is empty".into()));
    }
    require_definition(client, &request.definition)?;

    let config_map = resolver::config_map_name(&request.instance_details, &request.vf_module_type)
        .ok_or_else(|| {
            RbError::Validation(format!(
                "instance has no ConfigMap for vf-module type '{}'",
                request.vf_module_type
            ))
        })?;
    info!(
        "configmap for {} vf-module: {config_map}",
        request.vf_module_type
    );

    let source = config_template_archive_path(blueprint_root, &request.vf_module_type);
    let staged = transformer.stage(
        &source,
        &config_map_manifest(&request.vf_module_type),
        &[ManifestMutation::OverwriteStrings {
            path: vec!["metadata".to_string()],
            value: config_map,
        }],
    )?;

    if client.has_config_template(&request.definition, &request.template_name)? {
        return Ok(UploadOutcome::SkippedExisting);
    }

    let template = ConfigTemplate {
        template_name: request.template_name.clone(),
        description: " ".to_string(),
        chart_name: request.vf_module_type.clone(),
    };
    if client.create_config_template(&request.definition, &template)?
        == CreateOutcome::AlreadyExists
    {
        return Ok(UploadOutcome::SkippedExisting);
    }
    client.upload_content(
        &request.definition,
        &ContentTarget::ConfigTemplate(request.template_name.clone()),
        staged.path(),
    )?;
    info!("config template {} upload completed", request.template_name);
    Ok(UploadOutcome::Uploaded)
}

#[derive(Debug, Clone)]
pub struct ConfigApplyRequest {
    pub definition: RbDefinition,
    pub profile_name: String,
    pub template_name: String,
    /// Generated as `config_<6 digits>` when absent.
    pub config_name: Option<String>,
    pub supported_nssai: String,
}

/// Upsert the supported-NSSAI config of a profile. No existence check.
pub fn apply_config<T: RbTransport>(
    client: &RbApiClient<T>,
    request: &ConfigApplyRequest,
) -> Result<ConfigInstance> {
    if request.profile_name.trim().is_empty() {
        return Err(RbError::EmptyProfileName);
    }
    let entries = parse_supported_nssai(&request.supported_nssai)?;
    let config = ConfigInstance {
        template_name: request.template_name.clone(),
        config_name: request
            .config_name
            .clone()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(generate_config_name),
        values: nssai_config_values(&entries)?,
    };
    client.create_or_update_config(&request.definition, &config, &request.profile_name)?;
    Ok(config)
}

fn require_definition<T: RbTransport>(
    client: &RbApiClient<T>,
    definition: &RbDefinition,
) -> Result<()> {
    if client.has_definition(definition)? {
        Ok(())
    } else {
        Err(RbError::DefinitionNotFound {
            name: definition.name.clone(),
            version: definition.version.clone(),
        })
    }
}
