// Wire messages exchanged between clients, hops and the coordinator.
//
// Frame: u32 big-endian body length || JSON body
// Binary fields (ciphertexts, hop data, keys) are standard base64.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CommError, Result};
use crate::topology::ChainTopology;

pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

pub(crate) mod base64_bytes_opt {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_some(&STANDARD.encode(b)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

/// Unit exchanged between hops. Only `this_hop_ciphertext` is required; the
/// clear routing fields are a fallback for layers that carry no route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardingEnvelope {
    #[serde(with = "base64_bytes")]
    pub this_hop_ciphertext: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_destination: Option<String>,
}

impl ForwardingEnvelope {
    pub fn sealed(this_hop_ciphertext: Vec<u8>) -> Self {
        Self {
            this_hop_ciphertext,
            ..Self::default()
        }
    }
}

/// Routing fields a hop acts on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_destination: Option<String>,
    /// RouteLayer for the next hop, sealed to its key.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes_opt")]
    pub onward_route: Option<Vec<u8>>,
}

impl RouteLayer {
    pub fn is_empty(&self) -> bool {
        self.next_hop_address.is_none()
            && self.next_hop_public_key.is_none()
            && self.final_destination.is_none()
            && self.onward_route.is_none()
    }
}

/// Plaintext of `this_hop_ciphertext`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HopLayer {
    #[serde(with = "base64_bytes")]
    pub original_data: Vec<u8>,
    #[serde(flatten)]
    pub route: RouteLayer,
    /// RouteLayer sealed to the receiving hop by the client, relayed opaquely
    /// by the previous hop.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes_opt")]
    pub sealed_route: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardStatus {
    Forwarded,
    FinalProcessed,
    Processed,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardResponse {
    pub status: ForwardStatus,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes_opt")]
    pub data: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downstream: Option<Box<ForwardResponse>>,
}

impl ForwardResponse {
    pub fn processed(data: Vec<u8>) -> Self {
        Self::with_data(ForwardStatus::Processed, data)
    }

    pub fn final_processed(data: Vec<u8>) -> Self {
        Self::with_data(ForwardStatus::FinalProcessed, data)
    }

    pub fn forwarded(downstream: ForwardResponse) -> Self {
        Self {
            status: ForwardStatus::Forwarded,
            data: None,
            message: None,
            downstream: Some(Box::new(downstream)),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ForwardStatus::Error,
            data: None,
            message: Some(message.into()),
            downstream: None,
        }
    }

    fn with_data(status: ForwardStatus, data: Vec<u8>) -> Self {
        Self {
            status,
            data: Some(data),
            message: None,
            downstream: None,
        }
    }

    /// Follow `downstream` links to the innermost response.
    pub fn terminal(&self) -> &ForwardResponse {
        let mut current = self;
        while let Some(next) = current.downstream.as_deref() {
            current = next;
        }
        current
    }

    /// Number of `forwarded` wrappers around the terminal response.
    pub fn forward_depth(&self) -> usize {
        let mut depth = 0;
        let mut current = self;
        while let Some(next) = current.downstream.as_deref() {
            depth += 1;
            current = next;
        }
        depth
    }
}

/// Requests served by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorRequest {
    GetPayload { client_public_key: String },
    ProcessData {
        #[serde(default)]
        data: Option<String>,
    },
}

/// Hybrid-encrypted topology handed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadResponse {
    #[serde(with = "base64_bytes")]
    pub encrypted_payload: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub encrypted_key: Vec<u8>,
}

/// Plaintext of `encrypted_payload`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockCyclePayload {
    pub chain_topology: ChainTopology,
    pub coordinator_address: String,
}

/// Either a payload or a structured error, as sent back by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoordinatorResponse {
    Payload(PayloadResponse),
    Error { status: ForwardStatus, message: String },
}

impl CoordinatorResponse {
    pub fn error(message: impl Into<String>) -> Self {
        CoordinatorResponse::Error {
            status: ForwardStatus::Error,
            message: message.into(),
        }
    }
}

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(body)?)
}

/// Read one frame. `Ok(None)` on clean EOF before a length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(CommError::MalformedEnvelope(format!(
            "frame of {len} bytes exceeds {MAX_FRAME_LEN}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => CommError::MalformedEnvelope(format!("frame truncated before {len} bytes")),
        _ => e.into(),
    })?;
    Ok(Some(body))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(CommError::MalformedEnvelope(format!(
            "frame of {} bytes exceeds {MAX_FRAME_LEN}",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_absent_routing_fields() {
        let envelope = ForwardingEnvelope::sealed(vec![1, 2, 3]);
        let json = String::from_utf8(encode(&envelope).unwrap()).unwrap();
        assert_eq!(json, r#"{"this_hop_ciphertext":"AQID"}"#);
    }

    #[test]
    fn envelope_without_ciphertext_is_rejected() {
        let err = decode::<ForwardingEnvelope>(br#"{"next_hop_address":"a:1"}"#);
        assert!(err.is_err());
        let err = decode::<ForwardingEnvelope>(br#"{"this_hop_ciphertext":"%%%"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn hop_layer_flattens_route() {
        let layer = HopLayer {
            original_data: b"hi".to_vec(),
            route: RouteLayer {
                final_destination: Some("sink:9".into()),
                ..RouteLayer::default()
            },
            sealed_route: None,
        };
        let value: serde_json::Value = serde_json::from_slice(&encode(&layer).unwrap()).unwrap();
        assert_eq!(value["original_data"], "aGk=");
        assert_eq!(value["final_destination"], "sink:9");
        assert!(value.get("next_hop_address").is_none());
        assert_eq!(decode::<HopLayer>(&encode(&layer).unwrap()).unwrap(), layer);
    }

    #[test]
    fn coordinator_request_tagging() {
        let req: CoordinatorRequest =
            decode(br#"{"type":"get_payload","client_public_key":"abc"}"#).unwrap();
        assert_eq!(
            req,
            CoordinatorRequest::GetPayload {
                client_public_key: "abc".into()
            }
        );
        assert!(decode::<CoordinatorRequest>(br#"{"type":"launch_missiles"}"#).is_err());
    }

    #[test]
    fn terminal_response_unwraps_forwards() {
        let response = ForwardResponse::forwarded(ForwardResponse::forwarded(
            ForwardResponse::final_processed(vec![7]),
        ));
        assert_eq!(response.forward_depth(), 2);
        assert_eq!(response.terminal().status, ForwardStatus::FinalProcessed);
        assert_eq!(response.terminal().data.as_deref(), Some(&[7u8][..]));
    }

    #[test]
    fn coordinator_error_response_shape() {
        let json = encode(&CoordinatorResponse::error("nope")).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "nope");
    }

    #[tokio::test]
    async fn frames_round_trip_over_duplex() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, b"").await.unwrap();
        drop(a);
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"first");
        assert_eq!(read_frame(&mut b).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_malformed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32(10).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        assert!(matches!(
            read_frame(&mut b).await,
            Err(CommError::MalformedEnvelope(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_u32((MAX_FRAME_LEN + 1) as u32).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(CommError::MalformedEnvelope(_))
        ));
    }
}
