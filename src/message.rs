//! Parsing of the streaming wire format into store updates.
//!
//! The stream carries three named events: `put` (full data set), `patch`
//! (one flag or segment) and `delete` (a tombstone), each with a JSON
//! payload addressing items by `/flags/<key>` or `/segments/<key>` paths.

use crate::models::AllData;
use crate::store::{DataKind, StoreItem};
use serde::Deserialize;
use serde_json::Value;
use tracing::{trace, warn};

#[derive(Debug, thiserror::Error)]
pub enum MessageParseError {
    #[error("Unable to parse event payload: {0}")]
    ParsePayload(serde_json::Error),

    #[error("Missing the data field")]
    MissingData,

    #[error("Failed to parse put data: {0}")]
    ParsePut(serde_json::Error),

    #[error("Update path {0:?} is unknown")]
    UnknownPath(String),

    #[error("Failed to read item payload: {0}")]
    InvalidItem(serde_json::Error),

    #[error("Delete is missing a version")]
    MissingVersion,
}

/// Parsed message from the stream.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum Message {
    /// Replace the whole data set.
    Put(AllData),
    /// Change a single item.
    Patch {
        kind: DataKind,
        key: String,
        item: StoreItem,
    },
    /// Remove a single item at a version.
    Delete {
        kind: DataKind,
        key: String,
        version: u64,
    },
    /// An event name this SDK does not handle.
    Unknown,
}

/// Raw payload shared by all stream events.
#[derive(Debug, Deserialize)]
struct MessagePayload {
    path: String,
    #[serde(default)]
    data: Option<Value>,
    /// only used by deletes
    #[serde(default)]
    version: Option<u64>,
}

impl Message {
    /// Parse one named stream event.
    pub fn parse(name: &str, data: &str) -> Result<Self, MessageParseError> {
        trace!(%name, "reading stream event");

        match name {
            "put" => {
                let payload: MessagePayload =
                    serde_json::from_str(data).map_err(MessageParseError::ParsePayload)?;
                let data = payload.data.ok_or(MessageParseError::MissingData)?;
                let all: AllData =
                    serde_json::from_value(data).map_err(MessageParseError::ParsePut)?;
                trace!(
                    num_flags = all.flags.len(),
                    num_segments = all.segments.len(),
                    "parsed init data"
                );
                Ok(Message::Put(all))
            }
            "patch" | "delete" => {
                let payload: MessagePayload =
                    serde_json::from_str(data).map_err(MessageParseError::ParsePayload)?;
                let (kind, key) = split_path(&payload.path)?;

                if name == "patch" {
                    let data = payload.data.ok_or(MessageParseError::MissingData)?;
                    let item = StoreItem::from_json(kind, data)
                        .map_err(MessageParseError::InvalidItem)?;
                    trace!(?kind, %key, "parsed update");
                    Ok(Message::Patch {
                        kind,
                        key: key.to_string(),
                        item,
                    })
                } else {
                    let version = payload.version.ok_or(MessageParseError::MissingVersion)?;
                    trace!(?kind, %key, version, "parsed delete");
                    Ok(Message::Delete {
                        kind,
                        key: key.to_string(),
                        version,
                    })
                }
            }
            _ => {
                warn!(%name, "unknown event type");
                Ok(Message::Unknown)
            }
        }
    }
}

/// Resolve an update path to its kind and item key.
fn split_path(path: &str) -> Result<(DataKind, &str), MessageParseError> {
    if let Some(key) = path.strip_prefix("/flags/") {
        return Ok((DataKind::Flag, key));
    }
    if let Some(key) = path.strip_prefix("/segments/") {
        return Ok((DataKind::Segment, key));
    }
    Err(MessageParseError::UnknownPath(path.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_put_with_flags_and_segments() {
        let data = r#"{
            "path": "/",
            "data": {
                "flags": {"f1": {"key": "f1", "version": 3}},
                "segments": {"s1": {"key": "s1", "version": 1}}
            }
        }"#;

        match Message::parse("put", data).expect("parse") {
            Message::Put(all) => {
                assert_eq!(all.flags["f1"].version, 3);
                assert_eq!(all.segments["s1"].version, 1);
            }
            other => panic!("expected put, got {:?}", other),
        }
    }

    #[test]
    fn parses_flag_patch() {
        let data = r#"{
            "path": "/flags/my-flag",
            "data": {"key": "my-flag", "version": 8, "on": true}
        }"#;

        match Message::parse("patch", data).expect("parse") {
            Message::Patch { kind, key, item } => {
                assert_eq!(kind, DataKind::Flag);
                assert_eq!(key, "my-flag");
                assert_eq!(item.version(), 8);
            }
            other => panic!("expected patch, got {:?}", other),
        }
    }

    #[test]
    fn parses_segment_patch() {
        let data = r#"{
            "path": "/segments/my-segment",
            "data": {"key": "my-segment", "version": 4}
        }"#;

        match Message::parse("patch", data).expect("parse") {
            Message::Patch { kind, key, .. } => {
                assert_eq!(kind, DataKind::Segment);
                assert_eq!(key, "my-segment");
            }
            other => panic!("expected patch, got {:?}", other),
        }
    }

    #[test]
    fn parses_delete_with_version() {
        let data = r#"{"path": "/flags/gone", "version": 12}"#;

        match Message::parse("delete", data).expect("parse") {
            Message::Delete { kind, key, version } => {
                assert_eq!(kind, DataKind::Flag);
                assert_eq!(key, "gone");
                assert_eq!(version, 12);
            }
            other => panic!("expected delete, got {:?}", other),
        }
    }

    #[test]
    fn delete_without_version_is_an_error() {
        let data = r#"{"path": "/flags/gone"}"#;
        assert!(matches!(
            Message::parse("delete", data),
            Err(MessageParseError::MissingVersion)
        ));
    }

    #[test]
    fn unknown_path_is_an_error() {
        let data = r#"{"path": "/mysteries/x", "data": {}}"#;
        assert!(matches!(
            Message::parse("patch", data),
            Err(MessageParseError::UnknownPath(_))
        ));
    }

    #[test]
    fn unknown_event_name_is_tolerated() {
        assert!(matches!(
            Message::parse("reticulate", "{}").expect("parse"),
            Message::Unknown
        ));
    }
}
