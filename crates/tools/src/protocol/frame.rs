use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strand_core::{CapabilityDescriptor, Error, InvocationError, Result};
use tokio_util::codec::LengthDelimitedCodec;

/// Largest accepted frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Error code sent when an invoke-request arrives before the handshake.
pub const HANDSHAKE_REQUIRED: &str = "HandshakeRequired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FrameKind {
    HandshakeRequest,
    HandshakeResponse,
    InvokeRequest,
    InvokeResponse,
}

/// One protocol record. Field presence depends on `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub kind: FrameKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<InvocationError>,
}

impl Frame {
    fn empty(kind: FrameKind) -> Self {
        Self {
            kind,
            correlation_id: None,
            capability_name: None,
            arguments: None,
            output: None,
            error: None,
        }
    }

    pub fn handshake_request() -> Self {
        Self::empty(FrameKind::HandshakeRequest)
    }

    pub fn handshake_response(capabilities: &[CapabilityDescriptor]) -> Result<Self> {
        Ok(Self {
            output: Some(serde_json::to_value(capabilities)?),
            ..Self::empty(FrameKind::HandshakeResponse)
        })
    }

    pub fn handshake_refused(error: InvocationError) -> Self {
        Self {
            error: Some(error),
            ..Self::empty(FrameKind::HandshakeResponse)
        }
    }

    pub fn invoke_request(correlation_id: &str, capability_name: &str, arguments: Value) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            capability_name: Some(capability_name.to_string()),
            arguments: Some(arguments),
            ..Self::empty(FrameKind::InvokeRequest)
        }
    }

    pub fn invoke_ok(correlation_id: &str, output: Value) -> Self {
        Self {
            correlation_id: Some(correlation_id.to_string()),
            output: Some(output),
            ..Self::empty(FrameKind::InvokeResponse)
        }
    }

    pub fn invoke_err(correlation_id: Option<String>, error: InvocationError) -> Self {
        Self {
            correlation_id,
            error: Some(error),
            ..Self::empty(FrameKind::InvokeResponse)
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::Protocol(format!("Malformed frame: {}", e)))
    }

    /// Descriptors carried by a handshake-response.
    pub fn capabilities(&self) -> Result<Vec<CapabilityDescriptor>> {
        if let Some(err) = &self.error {
            return Err(Error::Protocol(format!("Handshake refused: {}: {}", err.code, err.message)));
        }
        let output = self
            .output
            .clone()
            .ok_or_else(|| Error::Protocol("Handshake response without capability list".to_string()))?;
        serde_json::from_value(output)
            .map_err(|e| Error::Protocol(format!("Invalid capability list: {}", e)))
    }
}

/// Codec for the 4-byte big-endian length prefix.
pub fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Map a wire error record back onto the runtime's error taxonomy.
pub fn error_from_wire(capability: &str, error: &InvocationError) -> Error {
    match error.code.as_str() {
        "UnknownCapability" => Error::UnknownCapability(capability.to_string()),
        "SchemaViolation" => Error::SchemaViolation {
            capability: capability.to_string(),
            message: error.message.clone(),
        },
        "ProtocolViolation" | HANDSHAKE_REQUIRED => Error::Protocol(error.message.clone()),
        _ => Error::handler(capability, &error.message),
    }
}
