use std::fs;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{RbError, Result};
use crate::model::{ConfigInstance, ConfigTemplate, Profile, RbDefinition};
use crate::plugin::{HttpTransport, PluginAccess, RbTransport, RestResponse};

/// Result of an idempotent create call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Resource whose `/content` sub-resource receives an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentTarget {
    Profile(String),
    ConfigTemplate(String),
}

impl ContentTarget {
    fn path(&self) -> String {
        match self {
            ContentTarget::Profile(name) => format!("/profile/{name}/content"),
            ContentTarget::ConfigTemplate(name) => format!("/config-template/{name}/content"),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ContentTarget::Profile(name) | ContentTarget::ConfigTemplate(name) => name,
        }
    }
}

/// REST facade over `/rb/definition/{name}/{version}` and its children.
pub struct RbApiClient<T: RbTransport = HttpTransport> {
    transport: T,
}

impl RbApiClient<HttpTransport> {
    pub fn connect(access: PluginAccess) -> Result<Self> {
        Ok(Self::new(HttpTransport::new(access)?))
    }
}

impl<T: RbTransport> RbApiClient<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn has_definition(&self, definition: &RbDefinition) -> Result<bool> {
        self.exists(&definition_path(definition))
    }

    pub fn has_profile(&self, definition: &RbDefinition, profile_name: &str) -> Result<bool> {
        self.exists(&format!(
            "{}/profile/{profile_name}",
            definition_path(definition)
        ))
    }

    pub fn has_config_template(&self, definition: &RbDefinition, template_name: &str) -> Result<bool> {
        let exists = self.exists(&format!(
            "{}/config-template/{template_name}",
            definition_path(definition)
        ))?;
        if exists {
            info!("config template {template_name} already exists");
        }
        Ok(exists)
    }

    /// Non-2xx answers are treated as "already exists".
    pub fn create_profile(&self, profile: &Profile) -> Result<CreateOutcome> {
        let path = format!("{}/profile", definition_path(&profile.definition()));
        let body = serde_json::to_string(profile)?;
        let response = self.transport.post_json(&path, body)?;
        Ok(self.create_outcome(&format!("profile {}", profile.profile_name), &response))
    }

    /// Non-2xx answers are treated as "already exists".
    pub fn create_config_template(
        &self,
        definition: &RbDefinition,
        template: &ConfigTemplate,
    ) -> Result<CreateOutcome> {
        let path = format!("{}/config-template", definition_path(definition));
        let body = serde_json::to_string(template)?;
        let response = self.transport.post_json(&path, body)?;
        Ok(self.create_outcome(
            &format!("config template {}", template.template_name),
            &response,
        ))
    }

    /// Upload a binary archive. Any non-2xx status is fatal.
    pub fn upload_content(
        &self,
        definition: &RbDefinition,
        target: &ContentTarget,
        archive: &Path,
    ) -> Result<()> {
        if !archive.is_file() {
            return Err(RbError::ArtifactNotFound(archive.to_path_buf()));
        }
        let bytes = fs::read(archive)?;
        let path = format!("{}{}", definition_path(definition), target.path());
        info!(
            "uploading {} ({} bytes) for {}",
            archive.display(),
            bytes.len(),
            target.name()
        );
        let response = self.transport.post_binary(&path, bytes)?;
        self.require_success("POST", &path, response)
    }

    /// Post config values under a profile. Always an upsert; non-2xx is fatal.
    pub fn create_or_update_config(
        &self,
        definition: &RbDefinition,
        config: &ConfigInstance,
        profile_name: &str,
    ) -> Result<()> {
        let path = format!(
            "{}/profile/{profile_name}/config",
            definition_path(definition)
        );
        let body = serde_json::to_string(config)?;
        info!(
            "creating or updating config {} from template {}",
            config.config_name, config.template_name
        );
        let response = self.transport.post_json(&path, body)?;
        self.require_success("POST", &path, response)
    }

    fn exists(&self, path: &str) -> Result<bool> {
        let response = self.transport.get(path)?;
        Ok(response.is_success())
    }

    fn create_outcome(&self, what: &str, response: &RestResponse) -> CreateOutcome {
        if response.is_success() {
            info!("{what} created");
            CreateOutcome::Created
        } else {
            let err = RbError::AlreadyExists(what.to_string());
            warn!("{err} (status {}): {}", response.status, response.body);
            CreateOutcome::AlreadyExists
        }
    }

    fn require_success(&self, method: &'static str, path: &str, response: RestResponse) -> Result<()> {
        if response.is_success() {
            return Ok(());
        }
        Err(RbError::Http {
            method,
            url: self.transport.url(path),
            status: response.status,
            body: response.body,
        })
    }
}

fn definition_path(definition: &RbDefinition) -> String {
    format!("/rb/definition/{}/{}", definition.name, definition.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    /// In-memory plugin keeping created resources keyed by path.
    #[derive(Default)]
    struct StubPlugin {
        resources: Mutex<BTreeSet<String>>,
        calls: Mutex<Vec<String>>,
        fail_uploads: bool,
    }

    impl StubPlugin {
        fn with(paths: &[&str]) -> Self {
            let stub = Self::default();
            {
                let mut resources = stub.resources.lock().unwrap();
                for path in paths {
                    resources.insert(path.to_string());
                }
            }
            stub
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl RbTransport for StubPlugin {
        fn get(&self, path: &str) -> Result<RestResponse> {
            self.calls.lock().unwrap().push(format!("GET {path}"));
            if self.resources.lock().unwrap().contains(path) {
                Ok(RestResponse::new(200, "{}"))
            } else {
                Ok(RestResponse::new(404, "not found"))
            }
        }

        fn post_json(&self, path: &str, body: String) -> Result<RestResponse> {
            self.calls.lock().unwrap().push(format!("POST {path}"));
            let value: serde_json::Value = serde_json::from_str(&body).unwrap();
            let name = value
                .get("profile-name")
                .or_else(|| value.get("template-name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let created = format!("{path}/{name}");
            if self.resources.lock().unwrap().insert(created) {
                Ok(RestResponse::new(201, body))
            } else {
                Ok(RestResponse::new(409, "already exists"))
            }
        }

        fn post_binary(&self, path: &str, _bytes: Vec<u8>) -> Result<RestResponse> {
            self.calls.lock().unwrap().push(format!("POST {path}"));
            if self.fail_uploads {
                Ok(RestResponse::new(500, "content rejected"))
            } else {
                Ok(RestResponse::new(200, ""))
            }
        }
    }

    fn definition() -> RbDefinition {
        RbDefinition::new("rb-inv", "rb-ver")
    }

    #[test]
    fn existence_checks_follow_status_codes() {
        let client = RbApiClient::new(StubPlugin::with(&[
            "/rb/definition/rb-inv/rb-ver",
            "/rb/definition/rb-inv/rb-ver/profile/p1",
        ]));
        assert!(client.has_definition(&definition()).unwrap());
        assert!(client.has_profile(&definition(), "p1").unwrap());
        assert!(!client.has_profile(&definition(), "p2").unwrap());
        assert!(!client.has_config_template(&definition(), "t1").unwrap());
        assert!(
            !client
                .has_definition(&RbDefinition::new("other", "1"))
                .unwrap()
        );
    }

    #[test]
    fn second_profile_create_reports_already_exists() {
        let client = RbApiClient::new(StubPlugin::default());
        let profile = Profile::new(&definition(), "p1");
        assert_eq!(client.create_profile(&profile).unwrap(), CreateOutcome::Created);
        assert_eq!(
            client.create_profile(&profile).unwrap(),
            CreateOutcome::AlreadyExists
        );
        let profiles: Vec<_> = client
            .transport()
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.ends_with("/profile/p1"))
            .cloned()
            .collect();
        assert_eq!(profiles.len(), 1);
    }

    #[test]
    fn template_create_is_idempotent() {
        let client = RbApiClient::new(StubPlugin::default());
        let template = ConfigTemplate {
            template_name: "template_m1".into(),
            description: " ".into(),
            chart_name: "upf".into(),
        };
        assert_eq!(
            client.create_config_template(&definition(), &template).unwrap(),
            CreateOutcome::Created
        );
        assert_eq!(
            client.create_config_template(&definition(), &template).unwrap(),
            CreateOutcome::AlreadyExists
        );
    }

    #[test]
    fn failed_upload_surfaces_response_body() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("p1.tar.gz");
        fs::write(&archive, b"bytes").unwrap();
        let client = RbApiClient::new(StubPlugin {
            fail_uploads: true,
            ..StubPlugin::default()
        });

        let err = client
            .upload_content(&definition(), &ContentTarget::Profile("p1".into()), &archive)
            .unwrap_err();
        assert!(matches!(err, RbError::Http { status: 500, .. }));
        assert!(err.to_string().contains("content rejected"));
        assert_eq!(
            client.transport().calls(),
            vec!["POST /rb/definition/rb-inv/rb-ver/profile/p1/content".to_string()]
        );
    }

    #[test]
    fn upload_of_missing_archive_never_hits_the_network() {
        let client = RbApiClient::new(StubPlugin::default());
        let err = client
            .upload_content(
                &definition(),
                &ContentTarget::ConfigTemplate("t1".into()),
                Path::new("/nonexistent/t1.tar.gz"),
            )
            .unwrap_err();
        assert!(matches!(err, RbError::ArtifactNotFound(_)));
        assert!(client.transport().calls().is_empty());
    }

    #[test]
    fn config_posts_under_profile() {
        let client = RbApiClient::new(StubPlugin::default());
        let config = ConfigInstance {
            template_name: "template_m1".into(),
            config_name: "config_123456".into(),
            values: serde_json::json!({"config": {}}),
        };
        client
            .create_or_update_config(&definition(), &config, "profile_m1")
            .unwrap();
        assert_eq!(
            client.transport().calls(),
            vec!["POST /rb/definition/rb-inv/rb-ver/profile/profile_m1/config".to_string()]
        );
    }
}
