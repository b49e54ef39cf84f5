use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use strand_core::{CapabilityDescriptor, Error, Result};
use strand_tools::protocol::frame::codec;
use strand_tools::protocol::{Frame, FrameKind};
use strand_tools::{Capability, CapabilityRegistry, ProtocolClient, ProtocolServer};
use tokio::io::{duplex, DuplexStream};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

type RawReader = FramedRead<DuplexStream, LengthDelimitedCodec>;
type RawWriter = FramedWrite<DuplexStream, LengthDelimitedCodec>;

struct Slow;

#[async_trait]
impl Capability for Slow {
    fn descriptor(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new("slow", "", json!({"type": "object"}))
    }

    async fn execute(&self, arguments: Value) -> Result<Value> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(arguments)
    }
}

/// Start a real server over an in-memory pipe and return the client-side halves.
fn start_server(registry: CapabilityRegistry) -> (DuplexStream, DuplexStream) {
    let (client_out, server_in) = duplex(64 * 1024);
    let (server_out, client_in) = duplex(64 * 1024);
    tokio::spawn(async move {
        let server = ProtocolServer::new(registry);
        let _ = server.serve(server_in, server_out).await;
    });
    (client_in, client_out)
}

fn raw(reader: DuplexStream, writer: DuplexStream) -> (RawReader, RawWriter) {
    (FramedRead::new(reader, codec()), FramedWrite::new(writer, codec()))
}

async fn send(writer: &mut RawWriter, frame: Frame) {
    writer.send(frame.encode().unwrap()).await.unwrap();
}

async fn recv(reader: &mut RawReader) -> Frame {
    let body = reader.next().await.unwrap().unwrap();
    Frame::decode(&body).unwrap()
}

#[tokio::test]
async fn test_handshake_then_invoke_through_client() {
    let (rd, wr) = start_server(CapabilityRegistry::with_defaults());
    let client = ProtocolClient::connect("test", rd, wr).await.unwrap();

    let names: Vec<&str> = client.capabilities().iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["calculate_emi", "check_settlement_policy"]);

    let out = client
        .invoke("check_settlement_policy", json!({"debt_amount": 15000}))
        .await
        .unwrap();
    assert_eq!(out["max_discount_percent"], 20);
}

#[tokio::test]
async fn test_unknown_capability_keeps_connection_open() {
    let (rd, wr) = start_server(CapabilityRegistry::with_defaults());
    let (mut reader, mut writer) = raw(rd, wr);

    send(&mut writer, Frame::handshake_request()).await;
    assert_eq!(recv(&mut reader).await.kind, FrameKind::HandshakeResponse);

    send(&mut writer, Frame::invoke_request("a", "launch_rockets", json!({}))).await;
    let reply = recv(&mut reader).await;
    assert_eq!(reply.correlation_id.as_deref(), Some("a"));
    assert_eq!(reply.error.unwrap().code, "UnknownCapability");

    send(
        &mut writer,
        Frame::invoke_request("b", "check_settlement_policy", json!({"debt_amount": 500})),
    )
    .await;
    let reply = recv(&mut reader).await;
    assert_eq!(reply.correlation_id.as_deref(), Some("b"));
    assert_eq!(reply.output.unwrap()["max_discount_percent"], 30);
}

#[tokio::test]
async fn test_invoke_before_handshake_is_refused() {
    let (rd, wr) = start_server(CapabilityRegistry::with_defaults());
    let (mut reader, mut writer) = raw(rd, wr);

    send(&mut writer, Frame::invoke_request("early", "calculate_emi", json!({}))).await;
    let reply = recv(&mut reader).await;
    assert_eq!(reply.error.unwrap().code, "HandshakeRequired");

    send(&mut writer, Frame::handshake_request()).await;
    let reply = recv(&mut reader).await;
    assert_eq!(reply.capabilities().unwrap().len(), 2);

    send(&mut writer, Frame::handshake_request()).await;
    let reply = recv(&mut reader).await;
    assert_eq!(reply.error.unwrap().code, "ProtocolViolation");
}

#[tokio::test]
async fn test_remote_schema_violation_is_classified() {
    let (rd, wr) = start_server(CapabilityRegistry::with_defaults());
    let client = ProtocolClient::connect("test", rd, wr).await.unwrap();

    let err = client
        .invoke("calculate_emi", json!({"principal": -5}))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SchemaViolation { .. }), "{:?}", err);

    let err = client.invoke("not_declared", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::UnknownCapability(_)));
    assert!(client.is_usable());
}

#[tokio::test]
async fn test_slow_and_fast_calls_complete_independently() {
    let mut registry = CapabilityRegistry::with_defaults();
    registry.register(Arc::new(Slow)).unwrap();
    let (rd, wr) = start_server(registry);
    let client = Arc::new(ProtocolClient::connect("test", rd, wr).await.unwrap());

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.invoke("slow", json!({"tag": "slow"})).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let fast = client
        .invoke("check_settlement_policy", json!({"debt_amount": 1}))
        .await
        .unwrap();
    assert_eq!(fast["max_discount_percent"], 30);
    assert!(!slow.is_finished());

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow["tag"], "slow");
}

#[tokio::test]
async fn test_responses_are_matched_by_correlation_id() {
    let (client_out, server_in) = duplex(64 * 1024);
    let (server_out, client_in) = duplex(64 * 1024);
    let (mut reader, mut writer) = raw(server_in, server_out);

    let peer = tokio::spawn(async move {
        assert_eq!(recv(&mut reader).await.kind, FrameKind::HandshakeRequest);
        let descriptors = vec![
            CapabilityDescriptor::new("first", "", json!({"type": "object"})),
            CapabilityDescriptor::new("second", "", json!({"type": "object"})),
        ];
        send(&mut writer, Frame::handshake_response(&descriptors).unwrap()).await;

        let a = recv(&mut reader).await;
        let b = recv(&mut reader).await;
        // Answer in reverse order.
        for req in [b, a] {
            let name = req.capability_name.clone().unwrap();
            send(&mut writer, Frame::invoke_ok(req.correlation_id.as_deref().unwrap(), json!(name))).await;
        }
    });

    let client = Arc::new(ProtocolClient::connect("fake", client_in, client_out).await.unwrap());
    let c1 = client.clone();
    let first = tokio::spawn(async move { c1.invoke("first", json!({})).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = client.invoke("second", json!({})).await.unwrap();

    assert_eq!(second, json!("second"));
    assert_eq!(first.await.unwrap().unwrap(), json!("first"));
    peer.await.unwrap();
}

#[tokio::test]
async fn test_stream_loss_fails_outstanding_calls() {
    let (client_out, server_in) = duplex(64 * 1024);
    let (server_out, client_in) = duplex(64 * 1024);
    let (mut reader, mut writer) = raw(server_in, server_out);

    let peer = tokio::spawn(async move {
        recv(&mut reader).await;
        let descriptors = vec![CapabilityDescriptor::new("hang", "", json!({"type": "object"}))];
        send(&mut writer, Frame::handshake_response(&descriptors).unwrap()).await;
        recv(&mut reader).await;
        recv(&mut reader).await;
        // Drop both halves without answering.
    });

    let client = Arc::new(ProtocolClient::connect("fake", client_in, client_out).await.unwrap());
    let c1 = client.clone();
    let c2 = client.clone();
    let a = tokio::spawn(async move { c1.invoke("hang", json!({})).await });
    let b = tokio::spawn(async move { c2.invoke("hang", json!({})).await });

    peer.await.unwrap();
    assert!(matches!(a.await.unwrap(), Err(Error::Transport(_))));
    assert!(matches!(b.await.unwrap(), Err(Error::Transport(_))));
    assert!(!client.is_usable());

    let err = client.invoke("hang", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
}

#[tokio::test]
async fn test_malformed_frame_closes_server_connection() {
    let (rd, wr) = start_server(CapabilityRegistry::with_defaults());
    let (mut reader, mut writer) = raw(rd, wr);

    writer.send(bytes::Bytes::from_static(b"not json")).await.unwrap();
    assert!(reader.next().await.is_none());
}
