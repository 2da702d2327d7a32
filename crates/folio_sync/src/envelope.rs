//! Transport envelope shared by the relay and peer channels
//!
//! Every reassembled message is `{ "operation": "...", ...fields }`. The
//! broker stamps proxied messages with the sending notebook as `source`.

use crate::framing::{split_message, ChunkAssembler, ChunkFrame};
use crate::{Result, SyncError};
use folio_common::Notebook;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operation names
pub mod operation {
    pub const AUTHENTICATION: &str = "AUTHENTICATION";
    pub const ERROR: &str = "ERROR";
    pub const PONG: &str = "PONG";
    pub const PROXY: &str = "PROXY";
    pub const OFFER: &str = "OFFER";
    pub const ANSWER: &str = "ANSWER";
    pub const PEER_IDENTITY: &str = "PEER_IDENTITY";
    pub const SHARE_PAGE: &str = "SHARE_PAGE";
    pub const SHARE_PAGE_RESPONSE: &str = "SHARE_PAGE_RESPONSE";
    pub const SHARE_PAGE_UPDATE: &str = "SHARE_PAGE_UPDATE";
    pub const SHARE_PAGE_FORCE: &str = "SHARE_PAGE_FORCE";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub operation: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Notebook>,

    /// Ephemeral operations are dropped silently when nobody handles them
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ephemeral: bool,

    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Envelope {
    /// Build an envelope whose fields are the serialized `data` object
    pub fn new(operation: impl Into<String>, data: impl Serialize) -> Result<Self> {
        let data = match serde_json::to_value(data)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(SyncError::ProtocolError(format!(
                    "envelope data must be an object, got {}",
                    other
                )))
            }
        };

        Ok(Self {
            operation: operation.into(),
            source: None,
            ephemeral: false,
            data,
        })
    }

    pub fn with_source(mut self, source: Notebook) -> Self {
        self.source = Some(source);
        self
    }

    pub fn ephemeral(mut self) -> Self {
        self.ephemeral = true;
        self
    }

    /// Deserialize the operation-specific fields
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.data.clone())).map_err(|e| {
            SyncError::ProtocolError(format!("malformed {} payload: {}", self.operation, e))
        })
    }

    /// The sender, required for operations that must be answered
    pub fn require_source(&self) -> Result<&Notebook> {
        self.source.as_ref().ok_or_else(|| {
            SyncError::ProtocolError(format!("{} arrived without a source", self.operation))
        })
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::ProtocolError(format!("malformed envelope: {}", e)))
    }
}

/// Anything that may arrive as one transport frame
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Chunk(ChunkFrame),
    Envelope(Envelope),
}

impl WireMessage {
    pub fn from_text(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| SyncError::ProtocolError(format!("malformed frame: {}", e)))
    }
}

/// Serialize an envelope into the text frames a transport sends
pub fn encode_frames(envelope: &Envelope, limit: usize) -> Result<Vec<String>> {
    let text = envelope.to_text()?;
    split_message(&text, limit)
        .iter()
        .map(|frame| serde_json::to_string(frame).map_err(SyncError::from))
        .collect()
}

/// Decode one inbound text frame, buffering chunks until complete
pub fn read_frame(text: &str, assembler: &mut ChunkAssembler) -> Result<Option<Envelope>> {
    match WireMessage::from_text(text)? {
        WireMessage::Envelope(envelope) => Ok(Some(envelope)),
        WireMessage::Chunk(frame) => match assembler.receive(frame)? {
            Some(full) => Envelope::from_text(&full).map(Some),
            None => Ok(None),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Invite {
        page_uuid: String,
        notebook_page_id: String,
    }

    #[test]
    fn test_envelope_flattens_fields() {
        let envelope = Envelope::new(
            operation::SHARE_PAGE,
            Invite {
                page_uuid: "p-1".into(),
                notebook_page_id: "Daily".into(),
            },
        )
        .unwrap()
        .with_source(Notebook::new(1, "home"));

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "operation": "SHARE_PAGE",
                "source": {"app": 1, "workspace": "home"},
                "pageUuid": "p-1",
                "notebookPageId": "Daily"
            })
        );

        let back = Envelope::from_text(&value.to_string()).unwrap();
        assert_eq!(back, envelope);
        assert_eq!(
            back.payload::<Invite>().unwrap(),
            Invite {
                page_uuid: "p-1".into(),
                notebook_page_id: "Daily".into()
            }
        );
    }

    #[test]
    fn test_non_object_data_is_rejected() {
        assert!(Envelope::new("X", 5).is_err());
        assert!(Envelope::new("X", ()).unwrap().data.is_empty());
    }

    #[test]
    fn test_wire_message_distinguishes_chunks() {
        let chunk = WireMessage::from_text(r#"{"uuid":"u","chunk":0,"total":1,"message":"{}"}"#).unwrap();
        assert!(matches!(chunk, WireMessage::Chunk(_)));

        let envelope = WireMessage::from_text(r#"{"operation":"PONG"}"#).unwrap();
        assert!(matches!(envelope, WireMessage::Envelope(_)));

        assert!(WireMessage::from_text(r#"{"nothing":"here"}"#).is_err());
        assert!(WireMessage::from_text("not json").is_err());
    }

    #[test]
    fn test_large_envelope_survives_framing() {
        let body = "lorem ipsum ".repeat(200);
        let envelope = Envelope::new(operation::SHARE_PAGE_UPDATE, json!({ "body": body })).unwrap();
        let frames = encode_frames(&envelope, 100).unwrap();
        assert!(frames.len() > 1);

        let mut assembler = ChunkAssembler::new(std::time::Duration::from_secs(60));
        let mut decoded = None;
        for frame in frames.iter().rev() {
            decoded = read_frame(frame, &mut assembler).unwrap();
        }
        assert_eq!(decoded, Some(envelope));
    }

    #[test]
    fn test_bare_envelope_frame_is_accepted() {
        let mut assembler = ChunkAssembler::new(std::time::Duration::from_secs(60));
        let decoded = read_frame(r#"{"operation":"ERROR","message":"nope"}"#, &mut assembler)
            .unwrap()
            .unwrap();
        assert_eq!(decoded.operation, operation::ERROR);
    }

    #[test]
    fn test_missing_payload_field_is_protocol_error() {
        let envelope = Envelope::new(operation::SHARE_PAGE, json!({"pageUuid": "p"})).unwrap();
        let err = envelope.payload::<Invite>().unwrap_err();
        assert!(matches!(err, SyncError::ProtocolError(_)));
        assert!(envelope.require_source().is_err());
    }
}
