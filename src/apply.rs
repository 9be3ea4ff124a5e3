use std::fs;
use std::path::Path;
use std::sync::Arc;

use futures::future::try_join_all;
use serde_json::{Value, json};
use tracing::{Instrument, info, info_span, warn};

use crate::archive::{ArchiveTransformer, ManifestMutation};
use crate::config::{
    Command, ConfigApplyArgs, InstancesArgs, InventoryArgs, ProfileUploadArgs, RbDeployerConfig,
    TransformArgs,
};
use crate::deploy::{
    self, ConfigApplyRequest, ConfigTemplateRequest, ProfileContent, ProfileUploadRequest,
};
use crate::error::{RbError, Result};
use crate::healthcheck::HealthCheckOrchestrator;
use crate::host::{JsonScriptHost, ScriptHost, resolved_parameter};
use crate::model::RbDefinition;
use crate::plugin::{InstanceClient, RbApiClient};
use crate::resolver::{self, ResolvedModule};
use crate::status_check::PodStatusChecker;
use crate::telemetry;

/// Input holding the resolved-data payload of the resource assignment.
const ASSIGNMENT_PARAMS: &str = "assignment-params";
/// Input holding the inventory `vf-modules` response.
const VF_MODULES: &str = "vf-modules";

pub async fn run(config: RbDeployerConfig) -> Result<()> {
    telemetry::init(&config.logging)?;

    let mut host = match &config.inputs {
        Some(path) => JsonScriptHost::from_file(path)?,
        None => JsonScriptHost::default(),
    };

    let span = stage_span(config.command.name(), &config);
    let result = async {
        info!("running {}", config.command.name());
        dispatch(&config, &mut host).await
    }
    .instrument(span)
    .await;

    if let Err(err) = &result {
        warn!(kind = ?err.kind(), "{} failed: {err}", config.command.name());
        host.report_error(&err.to_string());
    }
    if !host.outputs().is_empty() {
        println!("{}", host.outputs_json()?);
    }
    result
}

async fn dispatch(config: &RbDeployerConfig, host: &mut JsonScriptHost) -> Result<()> {
    match &config.command {
        Command::ProfileUpload(args) => profile_upload(config, host, args).await,
        Command::ConfigTemplate(args) => config_template(config, host, args).await,
        Command::ConfigApply(args) => config_apply(config, host, args).await,
        Command::HealthCheck(args) => health_check(config, host, args).await,
        Command::StatusCheck(args) => status_check(config, host, args).await,
        Command::Transform(args) => transform(host, args),
    }
}

async fn profile_upload(
    config: &RbDeployerConfig,
    host: &mut JsonScriptHost,
    args: &ProfileUploadArgs,
) -> Result<()> {
    let definition = RbDefinition::new(
        required_input(host, args.definition.rb_name.clone(), "vf-module-model-invariant-uuid")?,
        required_input(host, args.definition.rb_version.clone(), "vf-module-model-version")?,
    );
    let content = match (&args.override_values, &args.supported_nssai) {
        (Some(path), _) => ProfileContent::OverrideValues(path.clone()),
        (None, Some(snssai)) => ProfileContent::SupportedNssai(snssai.clone()),
        (None, None) => ProfileContent::AsStored,
    };
    let request = ProfileUploadRequest {
        definition,
        // An empty name is rejected by the workflow before any network call.
        profile_name: input(host, args.profile_name.clone(), "k8s-rb-profile-name")
            .unwrap_or_default(),
        namespace: input(host, args.namespace.clone(), "k8s-rb-profile-namespace")
            .unwrap_or_default(),
        content,
    };

    let access = config.require_plugin()?.clone();
    let root = config.blueprint_root.clone();
    let outcome = blocking(move || {
        let client = RbApiClient::connect(access)?;
        deploy::upload_profile(&client, &ArchiveTransformer::new(), &root, &request)
    })
    .await?;

    host.publish_output("profile-upload", serde_json::to_value(outcome)?);
    Ok(())
}

async fn config_template(
    config: &RbDeployerConfig,
    host: &mut JsonScriptHost,
    args: &InventoryArgs,
) -> Result<()> {
    let modules = inventory_modules(host, args)?;
    let access = config.require_plugin()?.clone();
    let instances = InstanceClient::new(access.clone())?;

    let details = try_join_all(
        modules
            .iter()
            .map(|module| instances.instance_details(&module.instance_id)),
    )
    .await?;
    let requests: Vec<ConfigTemplateRequest> = modules
        .iter()
        .zip(details)
        .map(|(module, instance_details)| ConfigTemplateRequest {
            definition: module.definition.clone(),
            template_name: module.template_name.clone(),
            vf_module_type: module.vf_module_type.clone(),
            instance_details,
        })
        .collect();

    let root = config.blueprint_root.clone();
    let outcomes = blocking(move || {
        let client = RbApiClient::connect(access)?;
        let transformer = ArchiveTransformer::new();
        run_batch(&requests, |request| {
            deploy::upload_config_template(&client, &transformer, &root, request)
                .map(|outcome| (request.template_name.clone(), outcome))
        })
    })
    .await?;

    let published: serde_json::Map<String, Value> = outcomes
        .into_iter()
        .map(|(name, outcome)| Ok((name, serde_json::to_value(outcome)?)))
        .collect::<Result<_>>()?;
    host.publish_output("config-template", Value::Object(published));
    Ok(())
}

async fn config_apply(
    config: &RbDeployerConfig,
    host: &mut JsonScriptHost,
    args: &ConfigApplyArgs,
) -> Result<()> {
    let modules = inventory_modules(host, &args.inventory)?;
    let supported_nssai = required_input(host, args.supported_nssai.clone(), "supportedNssai")?;
    let requests: Vec<ConfigApplyRequest> = modules
        .iter()
        .map(|module| ConfigApplyRequest {
            definition: module.definition.clone(),
            profile_name: module.profile_name.clone(),
            template_name: module.template_name.clone(),
            config_name: args.config_name.clone(),
            supported_nssai: supported_nssai.clone(),
        })
        .collect();

    let access = config.require_plugin()?.clone();
    let applied = blocking(move || {
        let client = RbApiClient::connect(access)?;
        run_batch(&requests, |request| deploy::apply_config(&client, request))
    })
    .await?;

    host.publish_output("config-apply", serde_json::to_value(applied)?);
    Ok(())
}

async fn health_check(
    config: &RbDeployerConfig,
    host: &mut JsonScriptHost,
    args: &InstancesArgs,
) -> Result<()> {
    let instance_ids = target_instances(host, args)?;
    let api = Arc::new(InstanceClient::new(config.require_plugin()?.clone())?);
    let orchestrator = HealthCheckOrchestrator::new(api, config.health);
    let result = orchestrator.run(instance_ids).await;

    host.publish_output("health-check", serde_json::to_value(&result)?);
    if result.all_succeeded {
        Ok(())
    } else {
        Err(RbError::HealthCheckFailed(result.failures().join(", ")))
    }
}

async fn status_check(
    config: &RbDeployerConfig,
    host: &mut JsonScriptHost,
    args: &InstancesArgs,
) -> Result<()> {
    let instance_ids = target_instances(host, args)?;
    let api = Arc::new(InstanceClient::new(config.require_plugin()?.clone())?);
    let polls = PodStatusChecker::new(api, config.health)
        .wait_until_running(&instance_ids)
        .await?;
    host.publish_output(
        "status-check",
        json!({ "instances": instance_ids, "polls": polls }),
    );
    Ok(())
}

fn transform(host: &mut JsonScriptHost, args: &TransformArgs) -> Result<()> {
    let raw = fs::read_to_string(&args.mutations).map_err(|err| {
        RbError::Config(format!("failed to read {}: {err}", args.mutations.display()))
    })?;
    let mutations: Vec<ManifestMutation> = serde_yaml_bw::from_str(&raw).map_err(|err| {
        RbError::Yaml(format!("invalid mutations {}: {err}", args.mutations.display()))
    })?;
    let written = ArchiveTransformer::new().transform(
        &args.archive,
        &args.manifest,
        &mutations,
        args.output.as_deref(),
    )?;
    host.publish_output(
        "transform",
        json!({
            "archive": written.display().to_string(),
            "digest": crate::archive::archive_digest(&written)?,
        }),
    );
    Ok(())
}

/// Apply `work` to each item in order. A fatal error aborts the batch;
/// non-fatal ones skip their item.
fn run_batch<T, R>(items: &[T], mut work: impl FnMut(&T) -> Result<R>) -> Result<Vec<R>> {
    let mut done = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match work(item) {
            Ok(value) => done.push(value),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => warn!(kind = ?err.kind(), "skipping batch item {index}: {err}"),
        }
    }
    Ok(done)
}

/// Run blocking plugin calls off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| RbError::Other(format!("blocking task failed: {err}")))?
}

/// Explicit value, then a top-level input, then the assignment resolved data.
fn input(host: &JsonScriptHost, explicit: Option<String>, key: &str) -> Option<String> {
    explicit
        .filter(|value| !value.is_empty())
        .or_else(|| host.resolve_string(key).ok())
        .or_else(|| {
            let payload = assignment_params(host)?;
            Some(resolved_parameter(&payload, key)).filter(|value| !value.is_empty())
        })
}

fn required_input(host: &JsonScriptHost, explicit: Option<String>, key: &str) -> Result<String> {
    input(host, explicit, key)
        .ok_or_else(|| RbError::Config(format!("missing required input '{key}'")))
}

/// The assignment payload may arrive as an object or as JSON text.
fn assignment_params(host: &JsonScriptHost) -> Option<Value> {
    match host.resolve_input(ASSIGNMENT_PARAMS).ok()? {
        Value::String(text) => match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!("ignoring unparsable {ASSIGNMENT_PARAMS}: {err}");
                None
            }
        },
        other => Some(other),
    }
}

fn inventory_payload(host: &JsonScriptHost, file: Option<&Path>) -> Result<Value> {
    match file {
        Some(path) => {
            let raw = fs::read_to_string(path).map_err(|err| {
                RbError::Config(format!("failed to read inventory {}: {err}", path.display()))
            })?;
            Ok(serde_json::from_str(&raw)?)
        }
        None => host.resolve_input(VF_MODULES),
    }
}

fn inventory_modules(host: &JsonScriptHost, args: &InventoryArgs) -> Result<Vec<ResolvedModule>> {
    let payload = inventory_payload(host, args.inventory.as_deref())?;
    let report = resolver::resolve_inventory(&payload)?;
    info!(
        "resolved {} vf-module(s), {} base module(s) skipped, {} rejected",
        report.modules.len(),
        report.skipped_base,
        report.rejected.len()
    );
    Ok(report.modules)
}

fn target_instances(host: &JsonScriptHost, args: &InstancesArgs) -> Result<Vec<String>> {
    if !args.instances.is_empty() {
        return Ok(args.instances.clone());
    }
    let payload = inventory_payload(host, args.inventory.inventory.as_deref())?;
    let records = payload
        .get("vf-module")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            RbError::MalformedInventoryRecord("inventory payload has no 'vf-module' list".into())
        })?;
    let instances = resolver::helm_instances(records);
    if instances.is_empty() {
        return Err(RbError::Validation("no helm instances to check".into()));
    }
    Ok(instances)
}

fn stage_span(stage: &str, config: &RbDeployerConfig) -> tracing::Span {
    let plugin = config
        .plugin
        .as_ref()
        .map(|access| access.url.as_str())
        .unwrap_or("-");
    info_span!(
        "rb",
        stage,
        plugin = %plugin,
        blueprint_root = %config.blueprint_root.display()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_archive(path: &Path, files: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn host(inputs: Value) -> JsonScriptHost {
        JsonScriptHost::new(inputs).expect("object inputs")
    }

    #[test]
    fn explicit_value_wins_over_inputs() {
        let host = host(json!({"k8s-rb-profile-name": "from-input"}));
        assert_eq!(
            input(&host, Some("flag".into()), "k8s-rb-profile-name").as_deref(),
            Some("flag")
        );
        assert_eq!(
            input(&host, None, "k8s-rb-profile-name").as_deref(),
            Some("from-input")
        );
    }

    #[test]
    fn falls_back_to_assignment_text_payload() {
        let payload = json!({
            "resource-accumulator-resolved-data": [
                {"param-name": "vf-module-model-version", "param-value": "ver-9"}
            ]
        });
        let host = host(json!({ ASSIGNMENT_PARAMS: payload.to_string() }));
        assert_eq!(
            required_input(&host, None, "vf-module-model-version").unwrap(),
            "ver-9"
        );
        assert!(required_input(&host, None, "vnf-id").is_err());
    }

    #[test]
    fn target_instances_default_to_helm_modules() {
        let host = host(json!({
            VF_MODULES: {
                "vf-module": [
                    {"vf-module-name": "helm_upf", "heat-stack-id": "sim..upf..helm/inst-1"},
                    {"vf-module-name": "base", "heat-stack-id": "sim..base/inst-0"}
                ]
            }
        }));
        let args = InstancesArgs {
            instances: Vec::new(),
            inventory: InventoryArgs { inventory: None },
        };
        assert_eq!(target_instances(&host, &args).unwrap(), vec!["inst-1"]);
    }

    #[test]
    fn transform_publishes_digest() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("chart.tar.gz");
        write_archive(&archive, &[("values.yaml", "replicas: 1\n"), ("README", "keep")]);
        let mutations = dir.path().join("mutations.yaml");
        fs::write(
            &mutations,
            "- op: merge_mapping\n  path: []\n  entries:\n    replicas: 3\n",
        )
        .unwrap();
        let output = dir.path().join("out.tar.gz");

        let mut host = JsonScriptHost::default();
        transform(
            &mut host,
            &TransformArgs {
                archive: archive.clone(),
                manifest: PathBuf::from("values.yaml"),
                mutations,
                output: Some(output.clone()),
            },
        )
        .unwrap();

        let published = &host.outputs()["transform"];
        assert_eq!(published["archive"], output.display().to_string());
        assert!(published["digest"].as_str().unwrap().starts_with("sha256:"));
    }

    #[test]
    fn batch_skips_non_fatal_and_stops_on_fatal() {
        let mut attempted = Vec::new();
        let done = run_batch(&["a", "dup", "b"], |item| {
            attempted.push(item.to_string());
            match *item {
                "dup" => Err(RbError::AlreadyExists(item.to_string())),
                other => Ok(other.to_uppercase()),
            }
        })
        .unwrap();
        assert_eq!(done, vec!["A", "B"]);
        assert_eq!(attempted, vec!["a", "dup", "b"]);

        let mut attempted = Vec::new();
        let err = run_batch(&["a", "down", "b"], |item| {
            attempted.push(item.to_string());
            match *item {
                "down" => Err(RbError::Transport("connection reset".into())),
                other => Ok(other.to_string()),
            }
        })
        .unwrap_err();
        assert!(matches!(err, RbError::Transport(_)));
        assert_eq!(attempted, vec!["a", "down"]);
    }
}
