//! Core message and subscription types for the a3s-pubsub system
//!
//! Option and info types use camelCase JSON serialization, matching the
//! persisted index and config files.

use crate::error::Result;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Default payload published through the router
///
/// Text and binary payloads are written to durable logs unchanged; JSON
/// payloads are encoded on a single line with a trailing newline.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Binary(Bytes),
    /// Structured JSON value
    Json(serde_json::Value),
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(s.to_string())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(s)
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(b))
    }
}

impl From<serde_json::Value> for Message {
    fn from(v: serde_json::Value) -> Self {
        Message::Json(v)
    }
}

/// Encoding of a payload into a durable log line
///
/// Implemented by every payload type that can be routed to a durable
/// subscription. Encoding failures are acknowledged back to the publisher
/// as a per-listener delivery error.
pub trait Encode: Send + Sync + 'static {
    /// Encode the payload as the bytes of one log record
    fn encode(&self) -> Result<Bytes>;
}

impl Encode for Message {
    fn encode(&self) -> Result<Bytes> {
        match self {
            Message::Text(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Message::Binary(b) => Ok(b.clone()),
            Message::Json(v) => json_line(v),
        }
    }
}

impl Encode for String {
    fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl Encode for Bytes {
    fn encode(&self) -> Result<Bytes> {
        Ok(self.clone())
    }
}

impl Encode for serde_json::Value {
    fn encode(&self) -> Result<Bytes> {
        json_line(self)
    }
}

/// Any serializable value, encoded as one line of JSON
///
/// Unlike [`Message::Json`], encoding can fail (e.g. a map with non-string
/// keys), in which case the durable appender rejects the message.
#[derive(Debug, Clone, PartialEq)]
pub struct Json<T>(pub T);

impl<T: Serialize + Send + Sync + 'static> Encode for Json<T> {
    fn encode(&self) -> Result<Bytes> {
        json_line(&self.0)
    }
}

fn json_line<T: Serialize + ?Sized>(value: &T) -> Result<Bytes> {
    let mut buf = BytesMut::new().writer();
    serde_json::to_writer(&mut buf, value)?;
    let mut buf = buf.into_inner();
    buf.put_u8(b'\n');
    Ok(buf.freeze())
}

/// A group of consecutive log lines handed to a consumer in one call
#[derive(Debug, Clone)]
pub struct Batch {
    /// Subscription the batch was read from
    pub sub_id: String,

    /// Newline-terminated lines, in log order
    pub data: Bytes,

    /// Log offset of the first byte in the batch
    pub start_offset: u64,

    /// Log offset just past the last byte in the batch
    pub end_offset: u64,

    /// Delivery attempt, starting at 1
    pub attempt: u32,
}

impl Batch {
    /// Batch contents as UTF-8, if valid
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    /// Iterate over the lines, without their trailing newlines
    pub fn lines(&self) -> impl Iterator<Item = &[u8]> {
        self.data
            .strip_suffix(b"\n")
            .unwrap_or(&self.data[..])
            .split(|b| *b == b'\n')
            .filter(|_| !self.data.is_empty())
    }

    /// Size of the batch in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the batch carries no data
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Options for `open_subscription`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenOptions {
    /// Create the subscription if it does not exist yet
    #[serde(default = "default_true")]
    pub create: bool,

    /// Attach to the subscription if it already exists
    #[serde(default = "default_true")]
    pub reuse: bool,

    /// Batch size cap in bytes (overrides the manager default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_batch_bytes: Option<usize>,

    /// Batch quiescence window in milliseconds (overrides the manager default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_timeout_ms: Option<u64>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            create: true,
            reuse: true,
            max_batch_bytes: None,
            batch_timeout_ms: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Options for `close_subscription`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseOptions {
    /// Also delete the subscription and its log
    #[serde(default)]
    pub delete: bool,
}

/// Lifecycle status of a durable subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum SubscriptionStatus {
    /// Appending, no consumer attached
    Idle,
    /// A consumer handler is receiving batches
    Delivering,
    /// Reader paused by `close_subscription`; still appending
    Closed,
    /// Delivery stopped after a fatal log error
    Broken { reason: String },
}

/// Snapshot of one durable subscription
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionInfo {
    /// Subscription identifier
    pub sub_id: String,

    /// Topic the subscription appends from
    pub topic: String,

    /// Current lifecycle status
    pub status: SubscriptionStatus,

    /// Durably consumed log offset
    pub consumed_offset: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_text_and_binary_pass_through() {
        assert_eq!(Message::from("hello").encode().unwrap(), Bytes::from("hello"));
        assert_eq!(
            Message::from(b"raw\x00".to_vec()).encode().unwrap(),
            Bytes::from_static(b"raw\x00")
        );
        assert_eq!("line\n".to_string().encode().unwrap(), Bytes::from("line\n"));
    }

    #[test]
    fn test_json_is_one_line_with_newline() {
        let m = Message::from(serde_json::json!({"a": 1}));
        assert_eq!(m.encode().unwrap(), Bytes::from("{\"a\":1}\n"));
        assert_eq!(
            serde_json::json!([1, 2]).encode().unwrap(),
            Bytes::from("[1,2]\n")
        );
    }

    #[test]
    fn test_unencodable_json_fails() {
        let mut map = BTreeMap::new();
        map.insert((1u8, 2u8), "x");
        let err = Json(map).encode().unwrap_err();
        assert!(matches!(err, crate::EventError::Serialization(_)));
    }

    #[test]
    fn test_batch_lines() {
        let batch = Batch {
            sub_id: "s".to_string(),
            data: Bytes::from("line1\nline22\n"),
            start_offset: 0,
            end_offset: 13,
            attempt: 1,
        };
        let lines: Vec<&[u8]> = batch.lines().collect();
        assert_eq!(lines, vec![&b"line1"[..], &b"line22"[..]]);
        assert_eq!(batch.as_str(), Some("line1\nline22\n"));
        assert_eq!(batch.len(), 13);
    }

    #[test]
    fn test_empty_batch_has_no_lines() {
        let batch = Batch {
            sub_id: "s".to_string(),
            data: Bytes::new(),
            start_offset: 0,
            end_offset: 0,
            attempt: 1,
        };
        assert_eq!(batch.lines().count(), 0);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_open_options_defaults() {
        let opts = OpenOptions::default();
        assert!(opts.create);
        assert!(opts.reuse);

        let parsed: OpenOptions = serde_json::from_str("{}").unwrap();
        assert!(parsed.create);
        assert!(parsed.reuse);
        assert!(parsed.max_batch_bytes.is_none());

        let json = serde_json::to_string(&opts).unwrap();
        assert!(!json.contains("maxBatchBytes"));
    }

    #[test]
    fn test_status_serialization() {
        let status = SubscriptionStatus::Broken {
            reason: "disk full".to_string(),
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"type\":\"broken\""));
        let parsed: SubscriptionStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, status);
    }
}
