use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{RbError, Result};

/// Identity of a resource-bundle definition on the orchestration plugin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RbDefinition {
    pub name: String,
    pub version: String,
}

impl RbDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for RbDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Profile metadata as posted to `/rb/definition/{name}/{version}/profile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(rename = "profile-name")]
    pub profile_name: String,
    #[serde(rename = "rb-name")]
    pub rb_name: String,
    #[serde(rename = "rb-version")]
    pub rb_version: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Profile {
    pub fn new(definition: &RbDefinition, profile_name: impl Into<String>) -> Self {
        Self {
            profile_name: profile_name.into(),
            rb_name: definition.name.clone(),
            rb_version: definition.version.clone(),
            namespace: default_namespace(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        if !namespace.is_empty() {
            self.namespace = namespace;
        }
        self
    }

    pub fn definition(&self) -> RbDefinition {
        RbDefinition::new(&self.rb_name, &self.rb_version)
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigTemplate {
    #[serde(rename = "template-name")]
    pub template_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "ChartName")]
    pub chart_name: String,
}

/// Per-deployment configuration values applied on top of a profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigInstance {
    #[serde(rename = "template-name")]
    pub template_name: String,
    #[serde(rename = "config-name")]
    pub config_name: String,
    pub values: Value,
}

/// One entry of a supported-NSSAI list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snssai {
    pub snssai: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

/// Parse a supported-NSSAI payload as delivered by the service orchestrator.
///
/// The payload usually arrives as an escaped JSON fragment (`{\r\n \"sNssai\":[...]}`),
/// so whitespace, escaped line breaks and backslashes are dropped before the first
/// JSON array in the text is decoded.
pub fn parse_supported_nssai(raw: &str) -> Result<Vec<Snssai>> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let cleaned = compact.replace("\\r\\n", "").replace('\\', "");

    let start = cleaned
        .find('[')
        .ok_or_else(|| RbError::Validation("supportedNssai payload has no sNssai list".into()))?;
    let end = cleaned[start..]
        .find(']')
        .map(|offset| start + offset)
        .ok_or_else(|| RbError::Validation("supportedNssai list is not terminated".into()))?;

    serde_json::from_str(&cleaned[start..=end])
        .map_err(|err| RbError::Validation(format!("invalid supportedNssai list: {err}")))
}

/// Config values carrying a supported-NSSAI list.
///
/// The plugin expects the list itself as a JSON-encoded string under
/// `config.supportedNssai.sNssai.snssai`.
pub fn nssai_config_values(entries: &[Snssai]) -> Result<Value> {
    let encoded = serde_json::to_string(entries)?;
    Ok(json!({
        "config": {
            "supportedNssai": {
                "sNssai": {
                    "snssai": encoded
                }
            }
        }
    }))
}

/// `config_` followed by six digits derived from the wall clock.
pub fn generate_config_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 + d.as_secs())
        .unwrap_or(0);
    format!("config_{:06}", nanos % 1_000_000)
}
