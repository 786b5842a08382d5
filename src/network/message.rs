//! Wire envelope and replies. Every connection carries one JSON envelope in
//! and one JSON reply out.

use crate::admission::Admission;
use crate::anchor::AnchorRecord;
use crate::blockchain::Block;
use crate::error::Result;
use crate::transaction::Transaction;
use serde::{Deserialize, Serialize};

pub const UNKNOWN_MESSAGE_TYPE: &str = "unknown_message_type";
pub const MALFORMED_MESSAGE: &str = "malformed_message";

const KNOWN_TYPES: [&str; 4] = [
    "transaction",
    "block",
    "bitcoin_anchor",
    "request_anchor_sync",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    Transaction { data: Transaction },
    Block { data: Block },
    BitcoinAnchor { anchor: AnchorRecord },
    RequestAnchorSync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownType(String),
    Malformed(String),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Transaction { .. } => "transaction",
            Envelope::Block { .. } => "block",
            Envelope::BitcoinAnchor { .. } => "bitcoin_anchor",
            Envelope::RequestAnchorSync => "request_anchor_sync",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse an envelope, telling an unrecognized `type` apart from a
    /// recognized one with a bad payload.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Envelope, DecodeError> {
        let value: serde_json::Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .ok_or_else(|| DecodeError::Malformed("missing message type".to_string()))?;
        if !KNOWN_TYPES.contains(&kind) {
            return Err(DecodeError::UnknownType(kind.to_string()));
        }
        serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Failed,
    Invalid,
    Duplicate,
    Late,
    BlockAdded,
    BlockRejected,
    AnchorStored,
    Error,
}

impl From<Admission> for Status {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Valid => Status::Success,
            Admission::Invalid => Status::Invalid,
            Admission::Duplicate => Status::Duplicate,
            Admission::Late => Status::Late,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    AnchorSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Reply {
    AnchorSync {
        #[serde(rename = "type")]
        kind: ReplyKind,
        anchors: Vec<AnchorRecord>,
    },
    Status {
        status: Status,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl Reply {
    pub fn status(status: Status) -> Self {
        Reply::Status {
            status,
            reason: None,
        }
    }

    pub fn error(reason: &str) -> Self {
        Reply::Status {
            status: Status::Error,
            reason: Some(reason.to_string()),
        }
    }

    pub fn anchor_sync(anchors: Vec<AnchorRecord>) -> Self {
        Reply::AnchorSync {
            kind: ReplyKind::AnchorSync,
            anchors,
        }
    }

    pub fn status_code(&self) -> Option<Status> {
        match self {
            Reply::Status { status, .. } => Some(*status),
            Reply::AnchorSync { .. } => None,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_shapes() {
        let tx = Transaction::new("alice", "bob", 5, 1, b"sig".to_vec()).unwrap();
        let value = serde_json::to_value(Envelope::Transaction { data: tx.clone() }).unwrap();
        assert_eq!(value["type"], "transaction");
        assert_eq!(value["data"]["transaction_id"], tx.transaction_id.as_str());

        let value = serde_json::to_value(Envelope::RequestAnchorSync).unwrap();
        assert_eq!(value, json!({"type": "request_anchor_sync"}));
    }

    #[test]
    fn test_decode_distinguishes_unknown_from_malformed() {
        let unknown = Envelope::decode(br#"{"type": "gossip", "data": {}}"#);
        assert_eq!(unknown, Err(DecodeError::UnknownType("gossip".to_string())));

        let malformed = Envelope::decode(br#"{"type": "block", "data": {"index": "x"}}"#);
        assert!(matches!(malformed, Err(DecodeError::Malformed(_))));

        assert!(matches!(
            Envelope::decode(b"not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            Envelope::decode(br#"{"data": {}}"#),
            Err(DecodeError::Malformed(_))
        ));

        assert_eq!(
            Envelope::decode(br#"{"type": "request_anchor_sync"}"#),
            Ok(Envelope::RequestAnchorSync)
        );
    }

    #[test]
    fn test_reply_shapes() {
        let value = serde_json::to_value(Reply::status(Status::BlockRejected)).unwrap();
        assert_eq!(value, json!({"status": "block_rejected"}));

        let value = serde_json::to_value(Reply::error(UNKNOWN_MESSAGE_TYPE)).unwrap();
        assert_eq!(
            value,
            json!({"status": "error", "reason": "unknown_message_type"})
        );

        let value = serde_json::to_value(Reply::anchor_sync(Vec::new())).unwrap();
        assert_eq!(value, json!({"type": "anchor_sync", "anchors": []}));

        let parsed = Reply::decode(br#"{"type": "anchor_sync", "anchors": []}"#).unwrap();
        assert_eq!(parsed, Reply::anchor_sync(Vec::new()));
        let parsed = Reply::decode(br#"{"status": "success"}"#).unwrap();
        assert_eq!(parsed.status_code(), Some(Status::Success));
    }
}
