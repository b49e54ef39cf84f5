//! Length-prefixed request/response protocol between the runtime and an
//! isolated data-owning process.
//!
//! Every frame is a 4-byte big-endian length followed by a JSON record. The
//! first exchange on a connection is always the handshake, which fixes the
//! set of capabilities the server will ever answer for.

pub mod client;
pub mod frame;
pub mod remote;
pub mod server;

pub use client::ProtocolClient;
pub use frame::{Frame, FrameKind, MAX_FRAME_LEN};
pub use remote::RemoteCapability;
pub use server::ProtocolServer;
