//! Wire Format and Framing
//!
//! Everything that crosses a node boundary is a JSON-encoded [`WireEnvelope`]
//! in a length-prefixed frame: a u32 big-endian byte count followed by the
//! body. Requests and replies share the frame; a reply echoes the request's
//! correlation token and carries a serialized [`AskResponse`] as payload.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::address::{EndpointPath, NodeAddress};
use crate::error::{CommsError, Result};

/// Maximum frame size accepted on either side of a connection.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Result envelope of a remote call.
///
/// On failure `message` describes the cause and `data` is absent; on success
/// `data` carries the payload the caller deserializes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl AskResponse {
    /// Successful response carrying a payload.
    pub fn succeed(data: Value) -> Self {
        Self {
            success: true,
            message: None,
            data: Some(data),
        }
    }

    /// Failed response carrying a cause description.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            data: None,
        }
    }

    /// Render the payload as a UTF-8 string.
    ///
    /// String payloads are returned as-is; any other JSON value is rendered
    /// in its serialized form. Empty when no payload was carried.
    pub fn data_as_string(&self) -> String {
        match &self.data {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// The framed unit on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireEnvelope {
    /// Correlation token tying a reply to its request.
    pub correlation: Uuid,
    /// Runtime system name the envelope is addressed to.
    pub system: String,
    /// Well-known endpoint name on the destination node.
    pub endpoint: String,
    /// `host:port` identity of the sending node.
    pub sender: String,
    /// Request payload, or a serialized [`AskResponse`] on replies.
    pub payload: Value,
}

impl WireEnvelope {
    /// Build a request envelope addressed to `path`.
    pub fn request(
        correlation: Uuid,
        path: &EndpointPath,
        sender: &NodeAddress,
        payload: Value,
    ) -> Self {
        Self {
            correlation,
            system: path.system.clone(),
            endpoint: path.endpoint.name().to_string(),
            sender: sender.to_string(),
            payload,
        }
    }

    /// Build the reply envelope for a request handled on this node.
    pub fn reply(
        correlation: Uuid,
        system: &str,
        sender: &NodeAddress,
        response: &AskResponse,
    ) -> Result<Self> {
        Ok(Self {
            correlation,
            system: system.to_string(),
            endpoint: String::new(),
            sender: sender.to_string(),
            payload: serde_json::to_value(response)?,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if frame.len() > MAX_FRAME_BYTES {
        return Err(CommsError::transport(format!(
            "frame size {} exceeds maximum {MAX_FRAME_BYTES}",
            frame.len()
        )));
    }

    let mut buffer = BytesMut::with_capacity(4 + frame.len());
    buffer.extend_from_slice(&(frame.len() as u32).to_be_bytes());
    buffer.extend_from_slice(frame);

    writer
        .write_all(&buffer)
        .await
        .map_err(|e| CommsError::transport_with_source("failed to write frame", e))?;
    writer
        .flush()
        .await
        .map_err(|e| CommsError::transport_with_source("failed to flush frame", e))?;
    Ok(())
}

/// Read one length-prefixed frame. `None` signals a cleanly closed peer.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => {
            return Err(CommsError::transport_with_source(
                "failed to read frame length",
                e,
            ))
        }
    }

    let frame_len = u32::from_be_bytes(len_bytes) as usize;
    if frame_len > MAX_FRAME_BYTES {
        return Err(CommsError::transport(format!(
            "frame size {frame_len} exceeds maximum {MAX_FRAME_BYTES}"
        )));
    }

    let mut buffer = BytesMut::with_capacity(frame_len);
    buffer.resize(frame_len, 0);
    reader
        .read_exact(&mut buffer)
        .await
        .map_err(|e| CommsError::transport_with_source("failed to read frame body", e))?;

    Ok(Some(buffer.freeze()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{peer_exchange_path, NodeAddress};

    #[test]
    fn failure_response_has_no_payload() {
        let response = AskResponse::fail("busy");

        assert!(!response.success);
        assert_eq!(response.message.as_deref(), Some("busy"));
        assert!(response.data.is_none());
        assert_eq!(response.data_as_string(), "");
    }

    #[test]
    fn success_payload_renders_as_string() {
        let response = AskResponse::succeed(Value::String("ok-42".into()));
        assert_eq!(response.data_as_string(), "ok-42");

        let structured = AskResponse::succeed(serde_json::json!({"slots": 3}));
        assert_eq!(structured.data_as_string(), "{\"slots\":3}");
    }

    #[test]
    fn envelope_roundtrips_through_the_wire_encoding() {
        let sender = NodeAddress::new("10.0.0.1", 10086);
        let path = peer_exchange_path(&NodeAddress::new("10.0.0.2", 10086));
        let envelope = WireEnvelope::request(
            Uuid::new_v4(),
            &path,
            &sender,
            serde_json::json!({"kind": "ping"}),
        );

        let decoded = WireEnvelope::decode(&envelope.encode().unwrap()).unwrap();

        assert_eq!(decoded.correlation, envelope.correlation);
        assert_eq!(decoded.system, "taskgrid-server");
        assert_eq!(decoded.endpoint, "peer");
        assert_eq!(decoded.sender, "10.0.0.1:10086");
        assert_eq!(decoded.payload, envelope.payload);
    }

    #[tokio::test]
    async fn frames_roundtrip_over_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.unwrap();
        let frame = read_frame(&mut server).await.unwrap().unwrap();

        assert_eq!(&frame[..], b"hello");
    }

    #[tokio::test]
    async fn closed_stream_reads_as_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);

        assert!(read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Forge a length prefix past the cap without sending a body.
        let oversized = ((MAX_FRAME_BYTES + 1) as u32).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut client, &oversized)
            .await
            .unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.category(), "transport");
    }
}
