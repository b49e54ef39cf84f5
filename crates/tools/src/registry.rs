use jsonschema::Validator;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use strand_core::{CapabilityDescriptor, Error, Result};
use tracing::{debug, warn};

use crate::protocol::{ProtocolClient, RemoteCapability};
use crate::{schema, Capability, FnCapability};

#[derive(Clone)]
struct Entry {
    descriptor: CapabilityDescriptor,
    validator: Arc<Validator>,
    capability: Arc<dyn Capability>,
}

/// Name-indexed set of capabilities, fixed before the first run.
#[derive(Clone, Default)]
pub struct CapabilityRegistry {
    entries: HashMap<String, Entry>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in finance capabilities.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for capability in crate::finance::capabilities() {
            // Built-ins have distinct names and static schemas.
            if let Err(e) = registry.register(capability) {
                warn!(error = %e, "Skipping built-in capability");
            }
        }
        registry
    }

    pub fn register(&mut self, capability: Arc<dyn Capability>) -> Result<()> {
        let descriptor = capability.descriptor();
        if self.entries.contains_key(&descriptor.name) {
            return Err(Error::DuplicateCapability {
                capability: descriptor.name,
            });
        }
        let validator = schema::compile(&descriptor.name, &descriptor.input_schema)?;
        debug!(name = %descriptor.name, "Registering capability");
        self.entries.insert(
            descriptor.name.clone(),
            Entry {
                descriptor,
                validator: Arc::new(validator),
                capability,
            },
        );
        Ok(())
    }

    /// Register a synchronous closure under `name`.
    pub fn register_handler<F>(&mut self, name: &str, description: &str, input_schema: Value, handler: F) -> Result<()>
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        let descriptor = CapabilityDescriptor::new(name, description, input_schema);
        self.register(Arc::new(FnCapability::new(descriptor, handler)))
    }

    /// Install every capability a connected data endpoint declared at handshake.
    pub fn register_remote(&mut self, client: Arc<ProtocolClient>) -> Result<usize> {
        let descriptors = client.capabilities().to_vec();
        for descriptor in &descriptors {
            debug!(name = %descriptor.name, endpoint = %client.endpoint(), "Registering remote capability");
            self.register(Arc::new(RemoteCapability::new(descriptor.clone(), client.clone())))?;
        }
        Ok(descriptors.len())
    }

    pub fn get(&self, name: &str) -> Option<&CapabilityDescriptor> {
        self.entries.get(name).map(|e| &e.descriptor)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All descriptors, sorted by name.
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        let mut all: Vec<CapabilityDescriptor> = self.entries.values().map(|e| e.descriptor.clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn validate(&self, name: &str, arguments: &Value) -> Result<()> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::UnknownCapability(name.to_string()))?;
        schema::check(name, &entry.validator, arguments)
    }

    /// Validate and run one invocation. Arguments that violate the schema never reach the handler.
    pub async fn invoke(&self, name: &str, arguments: Value) -> Result<Value> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| Error::UnknownCapability(name.to_string()))?;

        if let Err(e) = schema::check(name, &entry.validator, &arguments) {
            warn!(capability = name, error = %e, "Capability arguments rejected");
            return Err(e);
        }

        debug!(capability = name, "Executing capability");
        entry.capability.execute(arguments).await.map_err(|e| match e {
            // Already classified, typically by a remote endpoint.
            Error::HandlerFailure { .. }
            | Error::Transport(_)
            | Error::UnknownCapability(_)
            | Error::SchemaViolation { .. }
            | Error::Protocol(_) => e,
            other => Error::handler(name, other),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn echo_schema() -> Value {
        json!({
            "type": "object",
            "properties": {"text": {"type": "string"}},
            "required": ["text"]
        })
    }

    #[test]
    fn test_registry_new_empty() {
        let reg = CapabilityRegistry::new();
        assert!(reg.is_empty());
        assert!(reg.get("calculate_emi").is_none());
    }

    #[test]
    fn test_with_defaults_has_finance_capabilities() {
        let reg = CapabilityRegistry::with_defaults();
        assert_eq!(reg.names(), vec!["calculate_emi", "check_settlement_policy"]);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut reg = CapabilityRegistry::new();
        reg.register_handler("echo", "", echo_schema(), Ok).unwrap();
        let err = reg.register_handler("echo", "", echo_schema(), Ok).unwrap_err();
        assert!(matches!(err, Error::DuplicateCapability { capability } if capability == "echo"));
    }

    #[tokio::test]
    async fn test_invoke_unknown() {
        let reg = CapabilityRegistry::new();
        let err = reg.invoke("missing", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::UnknownCapability(_)));
    }

    #[tokio::test]
    async fn test_schema_violation_never_reaches_handler() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut reg = CapabilityRegistry::new();
        reg.register_handler("echo", "", echo_schema(), move |args| {
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(args)
        })
        .unwrap();

        let err = reg.invoke("echo", json!({"text": 5})).await.unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { .. }));
        let err = reg.invoke("echo", json!({})).await.unwrap_err();
        assert!(matches!(err, Error::SchemaViolation { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let out = reg.invoke("echo", json!({"text": "hi"})).await.unwrap();
        assert_eq!(out["text"], "hi");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_handler_errors_are_wrapped() {
        let mut reg = CapabilityRegistry::new();
        reg.register_handler("fail", "", json!({"type": "object"}), |_| {
            Err(Error::Other("disk on fire".into()))
        })
        .unwrap();
        match reg.invoke("fail", json!({})).await.unwrap_err() {
            Error::HandlerFailure { capability, message } => {
                assert_eq!(capability, "fail");
                assert!(message.contains("disk on fire"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_descriptors_sorted() {
        let mut reg = CapabilityRegistry::new();
        reg.register_handler("zeta", "", json!({}), Ok).unwrap();
        reg.register_handler("alpha", "", json!({}), Ok).unwrap();
        let names: Vec<String> = reg.descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
