//! Capabilities over the user-profile file owned by the isolated data process.
//!
//! The profile file itself is never exposed; callers only reach the two
//! operations below through the data protocol.

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use strand_core::{CapabilityDescriptor, Error, Result};
use tokio::sync::Mutex;
use tracing::info;

use crate::{Capability, CapabilityRegistry};

const DEFAULT_USER_ID: &str = "user_123";

/// JSON file of profiles keyed by user id. Writes go through a temp file and rename.
pub struct ProfileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProfileStore {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<Map<String, Value>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Err(Error::NotFound(format!(
                "Profile database not found: {}",
                self.path.display()
            )));
        }
        let content = tokio::fs::read_to_string(&self.path).await?;
        match serde_json::from_str::<Value>(&content)? {
            Value::Object(map) => Ok(map),
            _ => Err(Error::Storage("Profile database is not a JSON object".to_string())),
        }
    }

    pub async fn get(&self, user_id: &str) -> Result<Value> {
        let mut all = self.read_all().await?;
        all.remove(user_id)
            .ok_or_else(|| Error::NotFound(format!("User {} not found", user_id)))
    }

    pub async fn set_preference(&self, user_id: &str, preference: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await?;
        let profile = all
            .get_mut(user_id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Error::NotFound(format!("User {} not found", user_id)))?;
        profile.insert(
            "preferred_communication".to_string(),
            Value::String(preference.to_string()),
        );

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_string_pretty(&Value::Object(all))?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

fn user_id_arg(arguments: &Value) -> &str {
    arguments
        .get("user_id")
        .and_then(Value::as_str)
        .unwrap_or(DEFAULT_USER_ID)
}

// ============ get_user_profile ============

pub struct GetUserProfile {
    store: Arc<ProfileStore>,
}

#[async_trait]
impl Capability for GetUserProfile {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "get_user_profile",
            "Read the full user profile including debt details and risk score. \
             Defaults to the current logged-in user.",
            json!({
                "type": "object",
                "properties": {
                    "user_id": {"type": "string", "default": DEFAULT_USER_ID}
                }
            }),
        )
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        self.store.get(user_id_arg(&arguments)).await
    }
}

// ============ update_communication_preference ============

pub struct UpdateCommunicationPreference {
    store: Arc<ProfileStore>,
}

#[async_trait]
impl Capability for UpdateCommunicationPreference {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(
            "update_communication_preference",
            "Update how the user wants to be contacted (e.g. WhatsApp, Email, Phone).",
            json!({
                "type": "object",
                "properties": {
                    "preference": {"type": "string", "minLength": 1},
                    "user_id": {"type": "string", "default": DEFAULT_USER_ID}
                },
                "required": ["preference"]
            }),
        )
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        let user_id = user_id_arg(&arguments);
        let preference = arguments["preference"].as_str().unwrap_or_default();
        self.store.set_preference(user_id, preference).await?;
        info!(user_id, preference, "Communication preference updated");
        Ok(json!({"user_id": user_id, "preference": preference}))
    }
}

/// The registry a profile data server exposes, and nothing more.
pub fn profile_registry(path: &Path) -> Result<CapabilityRegistry> {
    let store = Arc::new(ProfileStore::new(path));
    let mut registry = CapabilityRegistry::new();
    registry.register(Arc::new(GetUserProfile { store: store.clone() }))?;
    registry.register(Arc::new(UpdateCommunicationPreference { store }))?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seeded() -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(
            &path,
            r#"{"user_123": {"name": "Asha", "debt": 12000, "preferred_communication": "Email"}}"#,
        )
        .unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn test_get_default_user() {
        let (_dir, path) = seeded();
        let reg = profile_registry(&path).unwrap();
        let out = reg.invoke("get_user_profile", json!({})).await.unwrap();
        assert_eq!(out["name"], "Asha");
    }

    #[tokio::test]
    async fn test_missing_user_is_handler_failure() {
        let (_dir, path) = seeded();
        let reg = profile_registry(&path).unwrap();
        let err = reg
            .invoke("get_user_profile", json!({"user_id": "nobody"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandlerFailure { .. }));
    }

    #[tokio::test]
    async fn test_update_preference_persists() {
        let (_dir, path) = seeded();
        let reg = profile_registry(&path).unwrap();
        reg.invoke("update_communication_preference", json!({"preference": "WhatsApp"}))
            .await
            .unwrap();
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["user_123"]["preferred_communication"], "WhatsApp");
        assert_eq!(raw["user_123"]["debt"], 12000);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let reg = profile_registry(&dir.path().join("none.json")).unwrap();
        assert!(reg.invoke("get_user_profile", json!({})).await.is_err());
    }
}
