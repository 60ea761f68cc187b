// SPDX-License-Identifier: MPL-2.0

//! Decoding for the label subscription's binary framing.
//!
//! Each WebSocket binary message holds two consecutive DAG-CBOR values: a
//! header `{t, op}` and a body. Anything left over after both values is a
//! protocol error and the whole frame is dropped.

use crate::atproto::{InfoMessage, LabelsMessage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use thiserror::Error;

/// Frame type fragment appended to the subscription NSID
pub const TYPE_LABELS: &str = "#labels";
pub const TYPE_INFO: &str = "#info";

const OP_MESSAGE: i64 = 1;
const OP_ERROR: i64 = -1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameHeader {
    pub op: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// Body of an `op = -1` error frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Labels(LabelsMessage),
    Info(InfoMessage),
    Error(ErrorBody),
}

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid frame header: {0}")]
    Header(String),
    #[error("invalid frame body: {0}")]
    Body(String),
    #[error("trailing bytes after frame body")]
    TrailingBytes,
    #[error("unknown frame op {0}")]
    UnknownOp(i64),
    #[error("unknown frame type {0:?}")]
    UnknownType(String),
}

/// Decode one binary message into a frame
pub fn decode_frame(buf: &[u8]) -> Result<Frame, FrameError> {
    let mut cursor = Cursor::new(buf);

    let header: FrameHeader = serde_ipld_dagcbor::de::from_reader_once(&mut cursor)
        .map_err(|e| FrameError::Header(e.to_string()))?;

    let frame = match header.op {
        OP_ERROR => {
            let body: ErrorBody = serde_ipld_dagcbor::de::from_reader_once(&mut cursor)
                .map_err(|e| FrameError::Body(e.to_string()))?;
            Frame::Error(body)
        }
        OP_MESSAGE => match header.t.as_deref() {
            Some(TYPE_LABELS) => {
                let body: LabelsMessage = serde_ipld_dagcbor::de::from_reader_once(&mut cursor)
                    .map_err(|e| FrameError::Body(e.to_string()))?;
                Frame::Labels(body)
            }
            Some(TYPE_INFO) => {
                let body: InfoMessage = serde_ipld_dagcbor::de::from_reader_once(&mut cursor)
                    .map_err(|e| FrameError::Body(e.to_string()))?;
                Frame::Info(body)
            }
            other => return Err(FrameError::UnknownType(other.unwrap_or("").to_string())),
        },
        op => return Err(FrameError::UnknownOp(op)),
    };

    if (cursor.position() as usize) < buf.len() {
        return Err(FrameError::TrailingBytes);
    }

    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atproto::Label;

    fn labels_body(seq: i64) -> LabelsMessage {
        LabelsMessage {
            seq,
            labels: vec![Label {
                src: "did:plc:a".to_string(),
                uri: "at://did:plc:b/app.bsky.feed.post/1".to_string(),
                cid: None,
                val: "spam".to_string(),
                neg: None,
                cts: "2024-01-01T00:00:00Z".to_string(),
                exp: None,
                ver: None,
                sig: Some(serde_bytes::ByteBuf::from(vec![1u8; 64])),
            }],
        }
    }

    fn encode_frame<B: serde::Serialize>(header: &FrameHeader, body: &B) -> Vec<u8> {
        let mut buf = serde_ipld_dagcbor::to_vec(header).unwrap();
        buf.extend(serde_ipld_dagcbor::to_vec(body).unwrap());
        buf
    }

    #[test]
    fn test_decode_labels_frame() {
        let header = FrameHeader {
            op: 1,
            t: Some("#labels".to_string()),
        };
        let buf = encode_frame(&header, &labels_body(5));

        match decode_frame(&buf).unwrap() {
            Frame::Labels(msg) => {
                assert_eq!(msg.seq, 5);
                assert_eq!(msg.labels.len(), 1);
                assert_eq!(msg.labels[0].val, "spam");
            }
            other => panic!("expected Labels frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_info_frame() {
        let header = FrameHeader {
            op: 1,
            t: Some("#info".to_string()),
        };
        let body = InfoMessage {
            name: "OutdatedCursor".to_string(),
            message: Some("requested cursor exceeded limit".to_string()),
        };
        let buf = encode_frame(&header, &body);

        match decode_frame(&buf).unwrap() {
            Frame::Info(info) => assert_eq!(info.name, "OutdatedCursor"),
            other => panic!("expected Info frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_error_frame() {
        let header = FrameHeader { op: -1, t: None };
        let body = ErrorBody {
            error: "FutureCursor".to_string(),
            message: None,
        };
        let buf = encode_frame(&header, &body);

        match decode_frame(&buf).unwrap() {
            Frame::Error(err) => assert_eq!(err.error, "FutureCursor"),
            other => panic!("expected Error frame, got {other:?}"),
        }
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let header = FrameHeader {
            op: 1,
            t: Some("#labels".to_string()),
        };
        let mut buf = encode_frame(&header, &labels_body(1));
        buf.push(0x00);

        assert!(matches!(
            decode_frame(&buf),
            Err(FrameError::TrailingBytes)
        ));
    }

    #[test]
    fn test_unknown_type_rejected() {
        let header = FrameHeader {
            op: 1,
            t: Some("#bogus".to_string()),
        };
        let buf = encode_frame(&header, &labels_body(1));

        assert!(matches!(decode_frame(&buf), Err(FrameError::UnknownType(t)) if t == "#bogus"));
    }

    #[test]
    fn test_unknown_op_rejected() {
        let header = FrameHeader {
            op: 2,
            t: Some("#labels".to_string()),
        };
        let buf = encode_frame(&header, &labels_body(1));

        assert!(matches!(decode_frame(&buf), Err(FrameError::UnknownOp(2))));
    }

    #[test]
    fn test_garbage_header_rejected() {
        assert!(matches!(
            decode_frame(&[0xff, 0xff, 0xff]),
            Err(FrameError::Header(_))
        ));
    }

    #[test]
    fn test_optional_label_fields_roundtrip() {
        let header = FrameHeader {
            op: 1,
            t: Some("#labels".to_string()),
        };
        let mut body = labels_body(7);
        body.labels[0].cid = Some("bafyreib2rxk3rybk3aobmv5cjuql3bm2twh4jo5uxgf6kpxv".to_string());
        body.labels[0].neg = Some(true);
        body.labels[0].exp = Some("2099-01-01T00:00:00Z".to_string());
        body.labels[0].ver = Some(1);
        let buf = encode_frame(&header, &body);

        match decode_frame(&buf).unwrap() {
            Frame::Labels(msg) => {
                assert_eq!(msg.labels[0].neg, Some(true));
                assert_eq!(msg.labels[0].ver, Some(1));
            }
            other => panic!("expected Labels frame, got {other:?}"),
        }
    }
}
