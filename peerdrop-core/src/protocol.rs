//! PeerDrop data channel protocol: control message types and interop constants.
//!
//! Control messages travel as JSON text frames, raw file bytes as binary frames.
//! Field names and sizes match the PairDrop web client and must not drift.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Bytes per binary chunk on the data channel.
pub const CHUNK_SIZE: usize = 64_000;

/// Bytes sent between two partition acknowledgements (pacing unit).
pub const PARTITION_SIZE: usize = 1_000_000;

/// One file as announced in a transfer request or a per-file header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    #[serde(rename = "mime")]
    pub mime_type: String,
    pub size: u64,
    /// Folder-relative path; advisory, ignored by peers that don't understand it.
    #[serde(rename = "path", default, skip_serializing_if = "Option::is_none")]
    pub relative_path: Option<String>,
}

impl FileDescriptor {
    pub fn is_image(&self) -> bool {
        self.mime_type.starts_with("image/")
    }
}

/// Batch header sent before any file. List order is the send order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub header: Vec<FileDescriptor>,
    #[serde(rename = "totalSize")]
    pub total_size: u64,
    #[serde(rename = "imagesOnly", default)]
    pub images_only: bool,
}

impl TransferRequest {
    pub fn new(header: Vec<FileDescriptor>) -> Self {
        let total_size = header.iter().map(|f| f.size).sum();
        let images_only = !header.is_empty() && header.iter().all(FileDescriptor::is_image);
        Self {
            header,
            total_size,
            images_only,
        }
    }
}

/// All control messages exchanged over the data channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    Request(TransferRequest),
    /// Sent before each file's binary chunks.
    Header(FileDescriptor),
    /// Sender reached a partition boundary and waits for the ack.
    Partition { offset: u64 },
    PartitionReceived { offset: u64 },
    FilesTransferResponse {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Receiver-side batch progress in 0..=1.
    Progress { progress: f64 },
    FileTransferComplete,
    TransferCanceled,
    Text { text: String },
    DisplayNameChanged {
        #[serde(rename = "displayName")]
        display_name: String,
    },
    DisplayNameRequest,
    #[serde(other)]
    Unrecognized,
}

impl Message {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One data channel message: a JSON control frame or a raw chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChannelMessage {
    Text(String),
    Binary(Bytes),
}

impl ChannelMessage {
    pub fn control(message: &Message) -> Result<Self, ProtocolError> {
        message.to_json().map(ChannelMessage::Text)
    }

    /// Payload length in bytes, as counted against the channel's send buffer.
    pub fn len(&self) -> usize {
        match self {
            ChannelMessage::Text(text) => text.len(),
            ChannelMessage::Binary(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed control message: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn note() -> FileDescriptor {
        FileDescriptor {
            name: "note.md".into(),
            mime_type: "text/markdown".into(),
            size: 12,
            relative_path: Some("notes/note.md".into()),
        }
    }

    #[test]
    fn request_uses_pairdrop_field_names() {
        let msg = Message::Request(TransferRequest::new(vec![note()]));
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request",
                "header": [{"name": "note.md", "mime": "text/markdown", "size": 12, "path": "notes/note.md"}],
                "totalSize": 12,
                "imagesOnly": false
            })
        );
    }

    #[test]
    fn header_is_flattened_into_frame() {
        let mut file = note();
        file.relative_path = None;
        let text = Message::Header(file).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({"type": "header", "name": "note.md", "mime": "text/markdown", "size": 12})
        );
    }

    #[test]
    fn parses_pairdrop_frames() {
        assert_eq!(
            Message::parse(r#"{"type":"partition-received","offset":1024000}"#).unwrap(),
            Message::PartitionReceived { offset: 1_024_000 }
        );
        assert_eq!(
            Message::parse(r#"{"type":"files-transfer-response","accepted":false,"reason":"ios-memory-limit"}"#)
                .unwrap(),
            Message::FilesTransferResponse {
                accepted: false,
                reason: Some("ios-memory-limit".into()),
            }
        );
        assert_eq!(
            Message::parse(r#"{"type":"file-transfer-complete"}"#).unwrap(),
            Message::FileTransferComplete
        );
        assert_eq!(
            Message::parse(r#"{"type":"display-name-changed","displayName":"Laptop"}"#).unwrap(),
            Message::DisplayNameChanged {
                display_name: "Laptop".into()
            }
        );
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        assert_eq!(
            Message::parse(r#"{"type":"thumbnail","dataUrl":"..."}"#).unwrap(),
            Message::Unrecognized
        );
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(Message::parse("not json").is_err());
        assert!(Message::parse(r#"{"offset":3}"#).is_err());
    }

    #[test]
    fn images_only_hint() {
        let png = FileDescriptor {
            name: "a.png".into(),
            mime_type: "image/png".into(),
            size: 3,
            relative_path: None,
        };
        assert!(TransferRequest::new(vec![png.clone()]).images_only);
        assert!(!TransferRequest::new(vec![png, note()]).images_only);
        assert!(!TransferRequest::new(vec![]).images_only);
    }
}
