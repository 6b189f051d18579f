//! WebSocket wire protocol.
//!
//! Text frames carry JSON objects tagged by `type`; binary frames from a
//! client are room updates. Columnar query results go out as binary frames:
//! ```text
//! ┌────────────────┬──────────────────────────────┬──────────────────┐
//! │ header length  │ header JSON                  │ Arrow IPC stream │
//! │ 4 bytes (BE)   │ {"type":"arrow","queryId":…} │ variable         │
//! └────────────────┴──────────────────────────────┴──────────────────┘
//! ```
//!
//! Requests are decoded once here into the closed [`Request`] union; the
//! gateway dispatches on it by exhaustive match.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlroom_engine::QueryKind;

use crate::error::ProtocolError;

const FRAME_HEADER_LEN: usize = 4;

/// Everything a client can ask for.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Query {
        kind: QueryKind,
        sql: String,
        query_id: Option<String>,
        persist: bool,
    },
    Cancel {
        query_id: Option<String>,
    },
    Subscribe {
        channel: String,
    },
    Notify {
        channel: String,
        payload: Value,
    },
    Auth {
        token: String,
    },
    RoomJoin {
        room_id: String,
        client_id: Option<String>,
    },
    RoomSnapshotPush {
        room_id: String,
        data: String,
    },
    /// Raw replicated-document update from a binary frame
    RoomUpdate(Vec<u8>),
}

impl Request {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Request::Query { kind, .. } => kind.as_str(),
            Request::Cancel { .. } => "cancel",
            Request::Subscribe { .. } => "subscribe",
            Request::Notify { .. } => "notify",
            Request::Auth { .. } => "auth",
            Request::RoomJoin { .. } => "crdt-join",
            Request::RoomSnapshotPush { .. } => "crdt-snapshot",
            Request::RoomUpdate(_) => "crdt-update",
        }
    }

    pub fn is_room_request(&self) -> bool {
        matches!(
            self,
            Request::RoomJoin { .. } | Request::RoomSnapshotPush { .. } | Request::RoomUpdate(_)
        )
    }
}

#[derive(Deserialize)]
struct WireQuery {
    sql: String,
    #[serde(rename = "queryId", default)]
    query_id: Option<Value>,
    #[serde(default)]
    persist: bool,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireRequest {
    #[serde(rename = "arrow")]
    Arrow(WireQuery),
    #[serde(rename = "json")]
    Json(WireQuery),
    #[serde(rename = "exec")]
    Exec(WireQuery),
    #[serde(rename = "cancel")]
    Cancel {
        #[serde(rename = "queryId", default)]
        query_id: Option<Value>,
    },
    #[serde(rename = "subscribe")]
    Subscribe {
        #[serde(default)]
        channel: Option<String>,
    },
    #[serde(rename = "notify")]
    Notify {
        #[serde(default)]
        channel: Option<String>,
        #[serde(default)]
        payload: Value,
    },
    #[serde(rename = "auth")]
    Auth {
        #[serde(default)]
        token: Option<String>,
    },
    #[serde(rename = "crdt-join")]
    RoomJoin {
        #[serde(rename = "roomId", default)]
        room_id: Option<String>,
        #[serde(rename = "clientId", default)]
        client_id: Option<Value>,
    },
    #[serde(rename = "crdt-snapshot")]
    RoomSnapshot {
        #[serde(rename = "roomId", default)]
        room_id: Option<String>,
        #[serde(default)]
        data: Option<String>,
    },
}

/// Query ids may be strings or numbers; numbers are kept as their decimal
/// text. Empty strings and null mean no id.
fn query_id(value: Option<Value>) -> Result<Option<String>, ProtocolError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s).filter(|s| !s.is_empty())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(ProtocolError::InvalidMessage),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

impl WireRequest {
    fn into_request(self) -> Result<Request, ProtocolError> {
        let query = |kind: QueryKind, q: WireQuery| -> Result<Request, ProtocolError> {
            Ok(Request::Query {
                kind,
                sql: q.sql,
                query_id: query_id(q.query_id)?,
                persist: q.persist,
            })
        };

        Ok(match self {
            WireRequest::Arrow(q) => query(QueryKind::Arrow, q)?,
            WireRequest::Json(q) => query(QueryKind::Json, q)?,
            WireRequest::Exec(q) => query(QueryKind::Exec, q)?,
            WireRequest::Cancel { query_id: id } => Request::Cancel {
                query_id: query_id(id)?,
            },
            WireRequest::Subscribe { channel } => Request::Subscribe {
                channel: channel
                    .filter(|c| !c.is_empty())
                    .ok_or(ProtocolError::MissingChannel)?,
            },
            WireRequest::Notify { channel, payload } => Request::Notify {
                channel: channel
                    .filter(|c| !c.is_empty())
                    .ok_or(ProtocolError::MissingChannel)?,
                payload,
            },
            WireRequest::Auth { token } => Request::Auth {
                token: token.unwrap_or_default().trim().to_string(),
            },
            WireRequest::RoomJoin { room_id, client_id } => Request::RoomJoin {
                room_id: non_empty(room_id).ok_or(ProtocolError::MissingRoomId)?,
                client_id: match client_id {
                    None | Some(Value::Null) => None,
                    Some(Value::String(s)) if s.is_empty() => None,
                    Some(Value::String(s)) => Some(s),
                    Some(other) => Some(other.to_string()),
                },
            },
            WireRequest::RoomSnapshot { room_id, data } => match (non_empty(room_id), data) {
                (Some(room_id), Some(data)) => Request::RoomSnapshotPush { room_id, data },
                _ => return Err(ProtocolError::MissingRoomIdOrData),
            },
        })
    }
}

/// Decode a text frame.
pub fn decode_text(text: &str) -> Result<Request, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    let wire: WireRequest =
        serde_json::from_value(value).map_err(|_| ProtocolError::InvalidMessage)?;
    wire.into_request()
}

/// Everything the server sends as a text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "json")]
    Json {
        #[serde(rename = "queryId")]
        query_id: String,
        data: String,
    },
    #[serde(rename = "ok")]
    Ok {
        #[serde(rename = "queryId")]
        query_id: String,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(rename = "queryId", default, skip_serializing_if = "Option::is_none")]
        query_id: Option<String>,
        error: String,
    },
    #[serde(rename = "cancelAck")]
    CancelAck {
        #[serde(rename = "queryId")]
        query_id: Option<String>,
        cancelled: bool,
    },
    #[serde(rename = "subscribed")]
    Subscribed { channel: String },
    #[serde(rename = "notify")]
    Notify { channel: String, payload: Value },
    #[serde(rename = "notifyAck")]
    NotifyAck { channel: String },
    #[serde(rename = "authAck")]
    AuthAck,
    #[serde(rename = "crdt-joined")]
    RoomJoined {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "crdt-snapshot")]
    RoomSnapshot {
        #[serde(rename = "roomId")]
        room_id: String,
        data: String,
    },
    #[serde(rename = "crdt-update-ack")]
    RoomUpdateAck {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "crdt-snapshot-ack")]
    RoomSnapshotAck {
        #[serde(rename = "roomId")]
        room_id: String,
    },
}

impl ServerMessage {
    pub fn error(error: impl ToString) -> Self {
        ServerMessage::Error {
            query_id: None,
            error: error.to_string(),
        }
    }

    pub fn query_error(query_id: impl Into<String>, error: impl ToString) -> Self {
        ServerMessage::Error {
            query_id: Some(query_id.into()),
            error: error.to_string(),
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrowHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "queryId")]
    pub query_id: String,
}

/// Build the binary frame carrying an Arrow result for `query_id`.
pub fn encode_arrow_frame(query_id: &str, payload: &[u8]) -> Result<Vec<u8>, serde_json::Error> {
    let header = serde_json::to_vec(&ArrowHeader {
        kind: "arrow".to_string(),
        query_id: query_id.to_string(),
    })?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + header.len() + payload.len());
    frame.extend_from_slice(&(header.len() as u32).to_be_bytes());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Split an Arrow frame into its header and payload.
pub fn decode_arrow_frame(frame: &[u8]) -> Result<(ArrowHeader, &[u8]), ProtocolError> {
    let len_bytes: [u8; FRAME_HEADER_LEN] = frame
        .get(..FRAME_HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(ProtocolError::MalformedFrame("truncated length"))?;
    let header_len = u32::from_be_bytes(len_bytes) as usize;
    let header_end = FRAME_HEADER_LEN
        .checked_add(header_len)
        .filter(|end| *end <= frame.len())
        .ok_or(ProtocolError::MalformedFrame("truncated header"))?;
    let header: ArrowHeader = serde_json::from_slice(&frame[FRAME_HEADER_LEN..header_end])
        .map_err(|_| ProtocolError::MalformedFrame("bad header"))?;
    Ok((header, &frame[header_end..]))
}
