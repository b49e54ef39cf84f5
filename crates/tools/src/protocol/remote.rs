use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use strand_core::{CapabilityDescriptor, Result};

use super::ProtocolClient;
use crate::Capability;

/// A capability whose handler runs inside a data endpoint process.
pub struct RemoteCapability {
    descriptor: CapabilityDescriptor,
    client: Arc<ProtocolClient>,
}

impl RemoteCapability {
    pub fn new(descriptor: CapabilityDescriptor, client: Arc<ProtocolClient>) -> Self {
        Self { descriptor, client }
    }
}

#[async_trait]
impl Capability for RemoteCapability {
    fn descriptor(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        self.client.invoke(&self.descriptor.name, arguments).await
    }
}
