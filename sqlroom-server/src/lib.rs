//! # sqlroom-server: WebSocket gateway for shared queries and rooms
//!
//! ```text
//! ┌──────────┐  text / binary   ┌──────────────┐        ┌──────────────────┐
//! │ clients  │ ◄──────────────► │ SqlRoomServer│ ─────► │ Gateway          │
//! └──────────┘   WebSocket      │ (sessions)   │        │  AuthGate        │
//!                               └──────────────┘        │  ConnectionTable │
//!                                                       │  TopicHub        │
//! ┌──────────┐  /healthz /readyz /version               └───┬──────────┬───┘
//! │ probes   │ ◄──────────────── health (axum)              │          │
//! └──────────┘                                     QueryExecutor   RoomStateManager
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: request union, server messages, Arrow result frames
//! - [`gateway`]: dispatch, query tasks, room fan-out, shutdown
//! - [`server`]: listener and per-connection session loop
//! - [`connection`]: connection ids, outbound queues, backpressure
//! - [`hub`]: channel and room topics
//! - [`auth`]: optional bearer token gate
//! - [`health`]: HTTP probes

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod health;
pub mod hub;
pub mod protocol;
pub mod server;

pub use auth::{AuthGate, AuthOutcome};
pub use config::ServerConfig;
pub use connection::{ConnectionHandle, ConnectionId, ConnectionState, ConnectionTable};
pub use error::{GatewayError, ProtocolError};
pub use gateway::Gateway;
pub use health::VersionInfo;
pub use hub::{HubStats, Topic, TopicHub};
pub use protocol::{
    decode_arrow_frame, decode_text, encode_arrow_frame, ArrowHeader, Request, ServerMessage,
};
pub use server::{shutdown_signal, ShutdownHandle, SqlRoomServer};
