use sqlroom_collab::RoomError;
use sqlroom_engine::EngineError;
use thiserror::Error;

/// A client frame that could not be turned into a request. The display text
/// is sent back verbatim in the `error` field.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid json")]
    InvalidJson,

    #[error("invalid message")]
    InvalidMessage,

    #[error("Missing channel")]
    MissingChannel,

    #[error("missing roomId")]
    MissingRoomId,

    #[error("missing roomId or data")]
    MissingRoomIdOrData,

    #[error("malformed arrow frame: {0}")]
    MalformedFrame(&'static str),
}

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("crdt sync disabled")]
    SyncDisabled,

    #[error("not in a room")]
    NotInRoom,

    #[error("server is shutting down")]
    ShutdownInProgress,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Room(#[from] RoomError),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
