//! The application JSON envelope (§3, §6): a `Message` identified by an
//! integer `Id` and a `Category` tag, with category-specific fields. The
//! reader/demux (C4) decodes these from `+IPD` payloads and fallback JSON
//! lines; the send pipeline (C6) and demo consumers encode them.

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::checksum;

/// An application-layer record carried inside a `+IPD` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "Category")]
pub enum Message {
    Test(TestMessage),
    Files(FilesMessage),
}

impl Message {
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Message::Test(m) => m.id,
            Message::Files(m) => m.id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestMessage {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Base64Message")]
    pub base64_message: String,
    #[serde(rename = "Base64MessageHash")]
    pub base64_message_hash: String,
    #[serde(rename = "RspReceivedOK")]
    pub rsp_received_ok: bool,
}

impl TestMessage {
    /// Build an outbound request for `payload`, computing its checksum.
    ///
    /// Returns `None` for empty payloads (the checksum is undefined there,
    /// see [`checksum::checksum`]).
    #[must_use]
    pub fn request(id: i64, payload: &[u8]) -> Option<Self> {
        let hash = checksum::checksum_base64(payload)?;
        Some(Self {
            id,
            base64_message: base64::engine::general_purpose::STANDARD.encode(payload),
            base64_message_hash: hash,
            rsp_received_ok: false,
        })
    }

    /// Build the reply echoing `self` back with `RspReceivedOK: true`.
    #[must_use]
    pub fn into_reply(mut self) -> Self {
        self.rsp_received_ok = true;
        self
    }

    /// Recompute the checksum over the decoded `Base64Message` and compare
    /// it against `Base64MessageHash`.
    #[must_use]
    pub fn verify(&self) -> bool {
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(&self.base64_message)
        else {
            return false;
        };
        checksum::checksum_base64(&decoded).as_deref() == Some(self.base64_message_hash.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Header,
    Content,
    End,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesMessage {
    #[serde(rename = "Id")]
    pub id: i64,
    #[serde(rename = "Step")]
    pub step: Step,
    #[serde(rename = "FileName")]
    pub file_name: String,
    #[serde(rename = "FileData", default, skip_serializing_if = "Option::is_none")]
    pub file_data: Option<String>,
    #[serde(
        rename = "ProgressPercentage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_percentage: Option<f64>,
    #[serde(
        rename = "FileBlockSequenceNumber",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub file_block_sequence_number: Option<u32>,
    #[serde(rename = "HashData", default, skip_serializing_if = "Option::is_none")]
    pub hash_data: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip_preserves_payload_and_hash() {
        let req = TestMessage::request(1, b"A").unwrap();
        assert_eq!(req.base64_message, "QQ==");
        assert!(req.verify());

        let reply = req.clone().into_reply();
        assert!(reply.rsp_received_ok);
        assert_eq!(reply.base64_message, req.base64_message);
        assert_eq!(reply.base64_message_hash, req.base64_message_hash);
        assert!(reply.verify());
    }

    #[test]
    fn empty_payload_request_is_rejected() {
        assert!(TestMessage::request(1, b"").is_none());
    }

    #[test]
    fn tampered_hash_fails_verification() {
        let mut m = TestMessage::request(1, b"hello").unwrap();
        m.base64_message_hash = "not-the-real-hash".to_string();
        assert!(!m.verify());
    }

    #[test]
    fn envelope_decodes_with_category_tag() {
        let json = r#"{"Category":"Test","Id":1,"Base64Message":"QQ==","Base64MessageHash":"x","RspReceivedOK":false}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.id(), 1);
        assert!(matches!(msg, Message::Test(_)));
    }

    #[test]
    fn files_header_step_decodes() {
        let json = r#"{"Category":"Files","Id":2,"Step":"Header","FileName":"a.bin"}"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        match msg {
            Message::Files(f) => {
                assert_eq!(f.step, Step::Header);
                assert_eq!(f.file_name, "a.bin");
                assert!(f.file_data.is_none());
            }
            Message::Test(_) => panic!("expected Files variant"),
        }
    }
}
