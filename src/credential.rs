//! Backend credentials keyed by provider and environment.
//!
//! Credentials are opaque JSON documents; adapters read them through the
//! named accessors on [`Credential`]. Storage and encryption live outside the
//! engine: [`CredentialSet`] is an in-memory resolver that can be filled from
//! a JSON file.

use std::collections::HashMap;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::LifecycleError;
use crate::provider::ProviderKind;
use crate::store::files;

/// Authentication material and defaults for one (provider, environment).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Credential {
    /// Backend family the credential belongs to.
    pub provider: ProviderKind,
    /// Environment name, for example `prod` or `dev`.
    pub environment: String,
    /// Remaining backend-specific fields.
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

impl Credential {
    /// Builds a credential from its parts.
    #[must_use]
    pub fn new(
        provider: ProviderKind,
        environment: impl Into<String>,
        content: Map<String, Value>,
    ) -> Self {
        Self {
            provider,
            environment: environment.into().trim().to_owned(),
            content,
        }
    }

    /// Raw field lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }

    /// String field, ignoring blank values.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Boolean field.
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Required string field.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] naming the missing field.
    pub fn require(&self, key: &str) -> Result<&str, LifecycleError> {
        self.get_str(key).ok_or_else(|| {
            LifecycleError::Credential(format!(
                "{} credential for {} is missing '{key}'",
                self.provider, self.environment
            ))
        })
    }

    /// String-to-string map field, such as zone to pool mappings.
    #[must_use]
    pub fn get_map(&self, key: &str) -> HashMap<String, String> {
        self.get(key)
            .and_then(Value::as_object)
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Checks that every field the provider needs is present.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] listing the absent fields.
    pub fn validate(&self) -> Result<(), LifecycleError> {
        if self.environment.is_empty() {
            return Err(LifecycleError::Credential(String::from(
                "credential environment must not be empty",
            )));
        }
        let missing: Vec<&str> = self
            .provider
            .required_credential_fields()
            .iter()
            .copied()
            .filter(|field| self.get_str(field).is_none())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        Err(LifecycleError::Credential(format!(
            "{} credential for {} requires fields {}",
            self.provider,
            self.environment,
            missing.join(", ")
        )))
    }
}

/// Resolves the credential for a provider in an environment.
pub trait CredentialResolver: Send + Sync {
    /// Returns the credential or an error naming the missing pair.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] when no credential matches.
    fn resolve(&self, provider: ProviderKind, environment: &str)
    -> Result<Credential, LifecycleError>;
}

#[derive(Deserialize)]
struct CredentialDocument {
    credentials: Vec<Credential>,
}

/// In-memory credential table.
#[derive(Clone, Debug, Default)]
pub struct CredentialSet {
    entries: HashMap<(ProviderKind, String), Credential>,
}

impl CredentialSet {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and stores `credential`, replacing any previous entry for
    /// the same provider and environment.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] when required fields are absent.
    pub fn insert(&mut self, credential: Credential) -> Result<(), LifecycleError> {
        credential.validate()?;
        self.entries.insert(
            (credential.provider, credential.environment.clone()),
            credential,
        );
        Ok(())
    }

    /// Removes the credential for the pair, returning whether one existed.
    pub fn remove(&mut self, provider: ProviderKind, environment: &str) -> bool {
        self.entries
            .remove(&(provider, environment.trim().to_owned()))
            .is_some()
    }

    /// Parses a `{"credentials": [...]}` document.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] when the document is malformed
    /// or an entry is incomplete.
    pub fn from_json(raw: &str) -> Result<Self, LifecycleError> {
        let document: CredentialDocument = serde_json::from_str(raw)
            .map_err(|err| LifecycleError::Credential(err.to_string()))?;
        let mut set = Self::new();
        for credential in document.credentials {
            set.insert(credential)?;
        }
        Ok(set)
    }

    /// Loads a credential document from disk. A missing file yields an empty
    /// set.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Credential`] when the file cannot be read or
    /// parsed.
    pub fn load(path: &Utf8Path) -> Result<Self, LifecycleError> {
        let contents = files::read_optional(path)
            .map_err(|err| LifecycleError::Credential(err.to_string()))?;
        match contents {
            Some(raw) if !raw.trim().is_empty() => Self::from_json(&raw),
            _ => Ok(Self::new()),
        }
    }

    /// Number of stored credentials.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CredentialResolver for CredentialSet {
    fn resolve(
        &self,
        provider: ProviderKind,
        environment: &str,
    ) -> Result<Credential, LifecycleError> {
        self.entries
            .get(&(provider, environment.trim().to_owned()))
            .cloned()
            .ok_or_else(|| {
                LifecycleError::Credential(format!("no {provider} credential for {environment}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gce_content() -> Map<String, Value> {
        let Value::Object(map) = json!({
            "project": "acme",
            "zone": "us-east1-b",
            "access_token": "ya29.token",
            "pools": {"us-east1-b": "fast"},
        }) else {
            panic!("object literal");
        };
        map
    }

    #[test]
    fn resolves_inserted_credential() {
        let mut set = CredentialSet::new();
        set.insert(Credential::new(ProviderKind::ComputeDisk, "prod", gce_content()))
            .expect("valid credential");

        let credential = set
            .resolve(ProviderKind::ComputeDisk, " prod ")
            .expect("credential resolves");
        assert_eq!(credential.require("project"), Ok("acme"));
        assert_eq!(
            credential.get_map("pools").get("us-east1-b").map(String::as_str),
            Some("fast")
        );
    }

    #[test]
    fn missing_pair_is_a_credential_error() {
        let set = CredentialSet::new();
        let err = set
            .resolve(ProviderKind::NetworkExport, "dev")
            .expect_err("empty set");
        assert!(matches!(err, LifecycleError::Credential(ref msg) if msg.contains("faas")));
    }

    #[test]
    fn insert_rejects_incomplete_credential() {
        let mut content = gce_content();
        content.remove("access_token");
        let mut set = CredentialSet::new();
        let err = set
            .insert(Credential::new(ProviderKind::ComputeDisk, "prod", content))
            .expect_err("token required");
        assert!(err.to_string().contains("access_token"), "{err}");
        assert!(set.is_empty());
    }

    #[test]
    fn blank_fields_count_as_missing() {
        let mut content = gce_content();
        content.insert(String::from("project"), json!("  "));
        let credential = Credential::new(ProviderKind::ComputeDisk, "prod", content);
        assert!(credential.require("project").is_err());
    }

    #[test]
    fn parses_document_with_flattened_fields() {
        let raw = r#"{"credentials": [
            {"provider": "faas", "environment": "dev", "endpoint": "https://faas",
             "token": "t", "category_id": "1", "access_type": "read-write", "is_secure": true}
        ]}"#;
        let set = CredentialSet::from_json(raw).expect("document parses");
        let credential = set
            .resolve(ProviderKind::NetworkExport, "dev")
            .expect("credential resolves");
        assert_eq!(credential.get_bool("is_secure"), Some(true));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn load_tolerates_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = camino::Utf8PathBuf::from_path_buf(tmp.path().join("absent.json"))
            .expect("utf8 path");
        let set = CredentialSet::load(&path).expect("missing file is empty");
        assert!(set.is_empty());
    }
}
