//! Maps inventory vf-module records to the resource names used on the plugin.
//!
//! A heat-stack-id has the form `<instance name>/<instance id>`, and the
//! instance name carries the vf-module type as its second `..`-delimited
//! segment (`vfw..firewall..helm_0`). No I/O happens here.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RbError, Result};
use crate::model::RbDefinition;

const HELM_MODULE_PREFIX: &str = "helm_";

/// Identifiers derived from one inventory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedModule {
    pub module_id: String,
    pub definition: RbDefinition,
    pub instance_name: String,
    pub instance_id: String,
    pub vf_module_type: String,
    pub profile_name: String,
    pub template_name: String,
}

/// Outcome of resolving a batch; bad records are reported, not fatal.
#[derive(Debug, Default)]
pub struct ResolutionReport {
    pub modules: Vec<ResolvedModule>,
    pub skipped_base: usize,
    pub rejected: Vec<(usize, RbError)>,
}

pub fn profile_name(module_id: &str) -> String {
    format!("profile_{module_id}")
}

pub fn template_name(module_id: &str) -> String {
    format!("template_{module_id}")
}

/// Split a heat-stack-id into `(instance name, instance id)`.
pub fn split_heat_stack_id(heat_stack_id: &str) -> Result<(String, String)> {
    match heat_stack_id.split_once('/') {
        Some((name, id)) if !name.is_empty() && !id.is_empty() && !id.contains('/') => {
            Ok((name.to_string(), id.to_string()))
        }
        _ => Err(RbError::MalformedInventoryRecord(format!(
            "heat-stack-id '{heat_stack_id}' is not of the form <name>/<instance-id>"
        ))),
    }
}

/// vf-module type token: the second `..`-delimited segment of the instance name.
pub fn vf_module_type(instance_name: &str) -> Result<String> {
    instance_name
        .split("..")
        .nth(1)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            RbError::MalformedInventoryRecord(format!(
                "instance name '{instance_name}' carries no vf-module type segment"
            ))
        })
}

/// Resolve a single vf-module record. Returns `Ok(None)` for base modules.
pub fn resolve_module(record: &Value) -> Result<Option<ResolvedModule>> {
    if is_base_module(record) {
        return Ok(None);
    }

    let module_id = required_field(record, "vf-module-id")?;
    let invariant_id = required_field(record, "model-invariant-id")?;
    let version_id = required_field(record, "model-version-id")?;
    let heat_stack_id = required_field(record, "heat-stack-id")?;

    let (instance_name, instance_id) = split_heat_stack_id(&heat_stack_id)?;
    let vf_module_type = vf_module_type(&instance_name)?;

    Ok(Some(ResolvedModule {
        profile_name: profile_name(&module_id),
        template_name: template_name(&module_id),
        module_id,
        definition: RbDefinition::new(invariant_id, version_id),
        instance_name,
        instance_id,
        vf_module_type,
    }))
}

/// Resolve every record, skipping (and logging) the malformed ones.
pub fn resolve_modules(records: &[Value]) -> ResolutionReport {
    let mut report = ResolutionReport::default();
    for (index, record) in records.iter().enumerate() {
        match resolve_module(record) {
            Ok(Some(module)) => {
                debug!(
                    "vf-module {} -> instance {} ({})",
                    module.module_id, module.instance_id, module.vf_module_type
                );
                report.modules.push(module);
            }
            Ok(None) => report.skipped_base += 1,
            Err(err) => {
                warn!("skipping inventory record #{index}: {err}");
                report.rejected.push((index, err));
            }
        }
    }
    report
}

/// Resolve the `vf-module` list of an inventory `vf-modules` response.
pub fn resolve_inventory(payload: &Value) -> Result<ResolutionReport> {
    let records = payload
        .get("vf-module")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            RbError::MalformedInventoryRecord("inventory payload has no 'vf-module' list".into())
        })?;
    Ok(resolve_modules(records))
}

/// Instance ids of modules whose name starts with `helm_`.
pub fn helm_instances(records: &[Value]) -> Vec<String> {
    records
        .iter()
        .filter(|record| {
            record
                .get("vf-module-name")
                .and_then(Value::as_str)
                .is_some_and(|name| name.starts_with(HELM_MODULE_PREFIX))
        })
        .filter_map(|record| {
            let resolved = required_field(record, "heat-stack-id")
                .and_then(|id| split_heat_stack_id(&id));
            match resolved {
                Ok((_, instance_id)) => Some(instance_id),
                Err(err) => {
                    warn!("skipping helm module: {err}");
                    None
                }
            }
        })
        .collect()
}

/// Name of the ConfigMap deployed for `vf_module_type`, looked up in the
/// `resources` list of an instance-details response.
pub fn config_map_name(instance_details: &Value, vf_module_type: &str) -> Option<String> {
    instance_details
        .get("resources")
        .and_then(Value::as_array)?
        .iter()
        .filter(|resource| {
            resource
                .get("GVK")
                .and_then(|gvk| gvk.get("Kind"))
                .and_then(Value::as_str)
                == Some("ConfigMap")
        })
        .filter_map(|resource| resource.get("Name").and_then(Value::as_str))
        .find(|name| name.contains(vf_module_type))
        .map(str::to_string)
}

fn is_base_module(record: &Value) -> bool {
    match record.get("is-base-vf-module") {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::String(flag)) => flag.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn required_field(record: &Value, key: &str) -> Result<String> {
    match record.get(key).and_then(Value::as_str) {
        Some(value) if !value.is_empty() => Ok(value.to_string()),
        _ => Err(RbError::MalformedInventoryRecord(format!(
            "missing required field '{key}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, heat_stack_id: &str) -> Value {
        json!({
            "vf-module-id": id,
            "vf-module-name": format!("helm_{id}"),
            "model-invariant-id": "inv-1",
            "model-version-id": "ver-1",
            "heat-stack-id": heat_stack_id,
            "is-base-vf-module": false
        })
    }

    #[test]
    fn derives_canonical_names() {
        let module = resolve_module(&record("m1", "sim..upf..helm_m1/inst-42"))
            .unwrap()
            .expect("non-base module");
        assert_eq!(module.profile_name, "profile_m1");
        assert_eq!(module.template_name, "template_m1");
        assert_eq!(module.instance_id, "inst-42");
        assert_eq!(module.instance_name, "sim..upf..helm_m1");
        assert_eq!(module.vf_module_type, "upf");
        assert_eq!(module.definition, RbDefinition::new("inv-1", "ver-1"));
    }

    #[test]
    fn base_modules_are_skipped() {
        let mut base = record("m0", "sim..base..m0/inst-0");
        base["is-base-vf-module"] = json!("true");
        assert!(resolve_module(&base).unwrap().is_none());
    }

    #[test]
    fn malformed_record_does_not_abort_siblings() {
        let mut missing = record("m2", "sim..amf..m2/inst-2");
        missing.as_object_mut().unwrap().remove("model-version-id");
        let records = vec![
            record("m1", "sim..upf..m1/inst-1"),
            missing,
            record("m3", "no-slash"),
            record("m4", "sim..smf..m4/inst-4"),
        ];

        let report = resolve_modules(&records);
        let ids: Vec<_> = report.modules.iter().map(|m| m.module_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m4"]);
        assert_eq!(report.rejected.len(), 2);
        assert_eq!(report.rejected[0].0, 1);
        assert!(report.rejected[1].1.to_string().contains("no-slash"));
    }

    #[test]
    fn instance_name_without_type_segment_is_rejected() {
        let err = resolve_module(&record("m1", "plainname/inst-1")).unwrap_err();
        assert!(matches!(err, RbError::MalformedInventoryRecord(_)));
    }

    #[test]
    fn inventory_payload_requires_module_list() {
        assert!(resolve_inventory(&json!({})).is_err());
        let report =
            resolve_inventory(&json!({"vf-module": [record("m1", "a..b..c/i1")]})).unwrap();
        assert_eq!(report.modules.len(), 1);
    }

    #[test]
    fn helm_instances_filter_by_module_name() {
        let mut other = record("m2", "sim..x..m2/inst-2");
        other["vf-module-name"] = json!("base_m2");
        let records = vec![record("m1", "sim..upf..m1/inst-1"), other];
        assert_eq!(helm_instances(&records), vec!["inst-1".to_string()]);
    }

    #[test]
    fn finds_config_map_for_module_type() {
        let details = json!({
            "resources": [
                {"GVK": {"Kind": "Deployment"}, "Name": "sim-upf"},
                {"GVK": {"Kind": "ConfigMap"}, "Name": "sim-amf-cm"},
                {"GVK": {"Kind": "ConfigMap"}, "Name": "sim-upf-cm"}
            ]
        });
        assert_eq!(config_map_name(&details, "upf").as_deref(), Some("sim-upf-cm"));
        assert_eq!(config_map_name(&details, "smf"), None);
    }
}
