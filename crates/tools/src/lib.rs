pub mod finance;
pub mod profile;
pub mod protocol;
pub mod registry;
pub mod schema;

use async_trait::async_trait;
use serde_json::Value;
use strand_core::{CapabilityDescriptor, Result};

pub use protocol::{ProtocolClient, ProtocolServer, RemoteCapability};
pub use registry::CapabilityRegistry;

/// An executable, schema-described operation the engine may invoke.
///
/// Handlers see only their arguments. Whatever they change in the world is
/// reported back through the returned value, never by touching engine state.
#[async_trait]
pub trait Capability: Send + Sync {
    fn descriptor(&self) -> CapabilityDescriptor;
    async fn execute(&self, arguments: Value) -> Result<Value>;
}

/// Adapter turning a plain closure into a [`Capability`].
pub struct FnCapability<F> {
    descriptor: CapabilityDescriptor,
    handler: F,
}

impl<F> FnCapability<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    pub fn new(descriptor: CapabilityDescriptor, handler: F) -> Self {
        Self { descriptor, handler }
    }
}

#[async_trait]
impl<F> Capability for FnCapability<F>
where
    F: Fn(Value) -> Result<Value> + Send + Sync,
{
    fn descriptor(&self) -> CapabilityDescriptor {
        self.descriptor.clone()
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        (self.handler)(arguments)
    }
}
