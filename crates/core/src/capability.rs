use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Public description of a capability: what it is called and what arguments
/// it accepts. This is also the handshake payload of the data protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub input_schema: Value,
}

impl CapabilityDescriptor {
    pub fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        }
    }
}
