//! Protocol gateway: connection lifecycle, request dispatch, fan-out.
//!
//! ```text
//!  text frame ──► decode_text ──┐
//!  binary frame ─► RoomUpdate ──┼──► AuthGate ──► dispatch (exhaustive match)
//!                               │                   │
//!       ┌───────────────────────┴──────┬────────────┼──────────────┐
//!       ▼                              ▼            ▼              ▼
//!  Query → spawned task          Cancel/Sub/Notify  RoomJoin     RoomUpdate
//!  QueryExecutor ─► own queue    SessionRegistry    RoomState    apply + publish
//!                                TopicHub           Manager      to room group
//! ```
//!
//! Every query runs in its own task so a connection keeps talking while a
//! long statement runs. Results go through the connection's outbound queue
//! tagged with the request id; a result for a closed connection is dropped.

use base64::Engine as _;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{mpsc, OnceCell};
use tokio_tungstenite::tungstenite::Message;

use sqlroom_collab::{RoomStateManager, SnapshotStore, SqlSnapshotStore};
use sqlroom_engine::{
    generate_query_id, Engine, EngineError, QueryExecutor, QueryKind, QueryOutcome, QueryRequest,
    SessionRegistry,
};

use crate::auth::{AuthGate, AuthOutcome};
use crate::config::ServerConfig;
use crate::connection::{ConnectionHandle, ConnectionId, ConnectionTable};
use crate::error::{GatewayError, ProtocolError};
use crate::hub::{Topic, TopicHub};
use crate::protocol::{decode_text, encode_arrow_frame, Request, ServerMessage};

pub struct Gateway {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    executor: Arc<QueryExecutor>,
    rooms: Option<Arc<RoomStateManager>>,
    hub: TopicHub,
    connections: ConnectionTable,
    auth: AuthGate,
    /// Queries spawned but not yet registered; true once cancelled.
    launching: Mutex<HashMap<String, bool>>,
    next_conn_id: AtomicU64,
    shutting_down: AtomicBool,
    shutdown_done: OnceCell<()>,
}

impl Gateway {
    /// Open the engine and, when sync is enabled, a room manager persisting
    /// into the metadata table.
    pub fn open(config: ServerConfig) -> Result<Arc<Self>, GatewayError> {
        let engine = Engine::open(config.engine.clone())?;
        let rooms = if config.sync_enabled {
            let store: Arc<dyn SnapshotStore> = Arc::new(
                SqlSnapshotStore::new(engine.registry.clone(), engine.meta.clone())
                    .with_retry(config.engine.retry.clone()),
            );
            Some(Arc::new(RoomStateManager::new(store, config.rooms.clone())))
        } else {
            None
        };
        Ok(Self::from_parts(config, engine, rooms))
    }

    /// Assemble a gateway around an already open engine.
    pub fn from_parts(
        config: ServerConfig,
        engine: Engine,
        rooms: Option<Arc<RoomStateManager>>,
    ) -> Arc<Self> {
        let auth = AuthGate::new(config.auth_token.clone());
        if auth.is_enabled() {
            log::info!("Bearer authentication enabled");
        }
        if rooms.is_some() {
            log::info!("Room sync enabled");
        }
        Arc::new(Self {
            config,
            registry: engine.registry,
            executor: engine.executor,
            rooms,
            hub: TopicHub::new(),
            connections: ConnectionTable::new(),
            auth,
            launching: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown_done: OnceCell::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn rooms(&self) -> Option<&Arc<RoomStateManager>> {
        self.rooms.as_ref()
    }

    pub fn hub(&self) -> &TopicHub {
        &self.hub
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn is_ready(&self) -> bool {
        !self.shutting_down.load(Ordering::SeqCst) && self.registry.is_ready()
    }

    /// Register a new connection. The receiver feeds its writer task.
    pub async fn connect(&self) -> (ConnectionHandle, mpsc::UnboundedReceiver<Message>) {
        let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (handle, receiver) = ConnectionHandle::new(id, self.config.backpressure_threshold);
        self.connections.insert(handle.clone()).await;
        log::info!("Connection {id} opened");
        (handle, receiver)
    }

    pub async fn handle_text(self: &Arc<Self>, id: ConnectionId, text: &str) {
        match decode_text(text) {
            Ok(request) => self.handle_request(id, request).await,
            Err(e) => {
                log::debug!("Rejected frame from {id}: {e}");
                if let Some(handle) = self.connections.handle(id).await {
                    handle.send_message(&ServerMessage::error(e));
                }
            }
        }
    }

    pub async fn handle_binary(self: &Arc<Self>, id: ConnectionId, bytes: Vec<u8>) {
        self.handle_request(id, Request::RoomUpdate(bytes)).await;
    }

    /// Screen `request` through auth, dispatch it, and answer any failure
    /// with an error frame.
    pub async fn handle_request(self: &Arc<Self>, id: ConnectionId, request: Request) {
        let Some(handle) = self.connections.handle(id).await else {
            return;
        };
        let outcome = self
            .connections
            .update(id, |state| self.auth.screen(&mut state.authenticated, &request))
            .await;

        match outcome {
            Some(AuthOutcome::Continue) => {}
            Some(AuthOutcome::Acknowledged) => {
                handle.send_message(&ServerMessage::AuthAck);
                return;
            }
            Some(AuthOutcome::Unauthorized) => {
                handle.send_message(&ServerMessage::error(GatewayError::Unauthorized));
                return;
            }
            None => return,
        }

        log::debug!("{id} → {}", request.name());
        if let Err(e) = self.dispatch(&handle, request).await {
            log::warn!("Request from {id} failed: {e}");
            handle.send_message(&ServerMessage::error(e));
        }
    }

    async fn dispatch(
        self: &Arc<Self>,
        handle: &ConnectionHandle,
        request: Request,
    ) -> Result<(), GatewayError> {
        // Queries are refused by the registry with their id attached.
        if request.is_room_request() && self.shutting_down.load(Ordering::SeqCst) {
            return Err(GatewayError::ShutdownInProgress);
        }
        match request {
            Request::Query {
                kind,
                sql,
                query_id,
                persist,
            } => {
                let query_id = query_id.unwrap_or_else(generate_query_id);
                self.launching_queries().insert(query_id.clone(), false);
                let gateway = self.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    gateway
                        .run_query(handle, query_id, kind, sql, persist)
                        .await;
                });
            }

            Request::Cancel { query_id } => {
                let cancelled = query_id
                    .as_deref()
                    .is_some_and(|id| self.registry.cancel(id) || self.cancel_launching(id));
                handle.send_message(&ServerMessage::CancelAck {
                    query_id,
                    cancelled,
                });
            }

            Request::Subscribe { channel } => {
                self.hub
                    .subscribe(Topic::Channel(channel.clone()), handle.clone())
                    .await;
                handle.send_message(&ServerMessage::Subscribed { channel });
            }

            Request::Notify { channel, payload } => {
                let text = ServerMessage::Notify {
                    channel: channel.clone(),
                    payload,
                }
                .encode()
                .map_err(|_| ProtocolError::InvalidMessage)?;
                let reached = self
                    .hub
                    .publish(
                        &Topic::Channel(channel.clone()),
                        Message::text(text.clone()),
                        Some(handle.id()),
                    )
                    .await;
                log::debug!("Notify on {channel} reached {reached} subscribers");
                handle.send(Message::text(text));
                handle.send_message(&ServerMessage::NotifyAck { channel });
            }

            // Auth messages are answered by the gate before dispatch.
            Request::Auth { .. } => {
                handle.send_message(&ServerMessage::AuthAck);
            }

            Request::RoomJoin { room_id, client_id } => {
                let rooms = self.rooms.as_ref().ok_or(GatewayError::SyncDisabled)?;
                self.join_room(handle, rooms, room_id, client_id).await?;
            }

            Request::RoomSnapshotPush { room_id, data } => {
                let rooms = self.rooms.as_ref().ok_or(GatewayError::SyncDisabled)?;
                let bytes = rooms.accept_client_snapshot(&room_id, &data).await?;
                log::info!(
                    "Accepted client snapshot for room {room_id} ({} bytes) from {}",
                    bytes.len(),
                    handle.id()
                );
                self.hub
                    .publish(
                        &Topic::Room(room_id.clone()),
                        Message::binary(bytes),
                        Some(handle.id()),
                    )
                    .await;
                handle.send_message(&ServerMessage::RoomSnapshotAck { room_id });
            }

            Request::RoomUpdate(bytes) => {
                let rooms = self.rooms.as_ref().ok_or(GatewayError::SyncDisabled)?;
                let room_id = self
                    .connections
                    .state(handle.id())
                    .await
                    .and_then(|state| state.room_id)
                    .ok_or(GatewayError::NotInRoom)?;
                rooms.apply_update(&room_id, &bytes).await?;
                let reached = self
                    .hub
                    .publish(
                        &Topic::Room(room_id.clone()),
                        Message::binary(bytes),
                        Some(handle.id()),
                    )
                    .await;
                log::debug!("Update to room {room_id} reached {reached} peers");
                handle.send_message(&ServerMessage::RoomUpdateAck { room_id });
            }
        }
        Ok(())
    }

    async fn join_room(
        &self,
        handle: &ConnectionHandle,
        rooms: &RoomStateManager,
        room_id: String,
        client_id: Option<String>,
    ) -> Result<(), GatewayError> {
        let id = handle.id();
        rooms.ensure_loaded(&room_id).await?;

        let previous = self
            .connections
            .update(id, |state| {
                state.client_id = client_id.clone();
                state.room_id.replace(room_id.clone())
            })
            .await
            .flatten();
        if let Some(previous) = previous.filter(|prev| *prev != room_id) {
            self.hub.unsubscribe(&Topic::Room(previous), id).await;
        }
        self.hub
            .subscribe(Topic::Room(room_id.clone()), handle.clone())
            .await;
        log::info!(
            "{id} joined room {room_id} (client {})",
            client_id.as_deref().unwrap_or("-")
        );

        handle.send_message(&ServerMessage::RoomJoined {
            room_id: room_id.clone(),
        });
        let snapshot = rooms.export_snapshot(&room_id).await?;
        log::debug!("Sending {} byte snapshot of room {room_id}", snapshot.len());
        handle.send_message(&ServerMessage::RoomSnapshot {
            room_id,
            data: base64::engine::general_purpose::STANDARD.encode(snapshot),
        });
        Ok(())
    }

    async fn run_query(
        &self,
        handle: ConnectionHandle,
        query_id: String,
        kind: QueryKind,
        sql: String,
        persist: bool,
    ) {
        let started = Instant::now();
        let cancelled_early = self
            .launching_queries()
            .remove(&query_id)
            .unwrap_or(false);
        if cancelled_early {
            log::info!("Query {query_id} cancelled before it started");
            handle.send_message(&ServerMessage::query_error(&query_id, EngineError::Cancelled));
            return;
        }

        let mut request = QueryRequest::new(query_id.clone(), kind, sql);
        request.persist = persist;

        let delivered = match self.executor.execute(request).await {
            Ok(QueryOutcome::Arrow(bytes)) => match encode_arrow_frame(&query_id, &bytes) {
                Ok(frame) => handle.send_binary(frame),
                Err(e) => handle.send_message(&ServerMessage::query_error(&query_id, e)),
            },
            Ok(QueryOutcome::NoData) | Ok(QueryOutcome::Ok) => {
                handle.send_message(&ServerMessage::Ok {
                    query_id: query_id.clone(),
                })
            }
            Ok(QueryOutcome::Json(data)) => handle.send_message(&ServerMessage::Json {
                query_id: query_id.clone(),
                data,
            }),
            Err(e) => handle.send_message(&ServerMessage::query_error(&query_id, e)),
        };

        if !delivered {
            log::debug!("Dropped result of {query_id}: {} is closed", handle.id());
        }
        log::info!(
            "Query {query_id} done in {} ms",
            started.elapsed().as_millis()
        );
    }

    fn launching_queries(&self) -> std::sync::MutexGuard<'_, HashMap<String, bool>> {
        self.launching.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_launching(&self, query_id: &str) -> bool {
        match self.launching_queries().get_mut(query_id) {
            Some(cancelled) => {
                *cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Forget a connection. If it was in a room, flush that room now.
    pub async fn disconnect(&self, id: ConnectionId) {
        let state = self.connections.remove(id).await;
        self.hub.unsubscribe_all(id).await;
        log::info!("Connection {id} closed");

        let room_id = state.and_then(|s| s.room_id);
        if let (Some(rooms), Some(room_id)) = (&self.rooms, room_id) {
            match rooms.flush(&room_id).await {
                Ok(true) => log::debug!("Flushed room {room_id} after {id} left"),
                Ok(false) => {}
                Err(e) => log::error!("Flushing room {room_id} after {id} left failed: {e}"),
            }
        }
    }

    /// Stop taking work, cancel queries, flush rooms, close the database.
    /// Runs once; concurrent and later callers wait for the first run.
    pub async fn shutdown(&self) {
        self.shutdown_done
            .get_or_init(|| async {
                self.shutting_down.store(true, Ordering::SeqCst);
                self.registry.begin_shutdown();
                let cancelled = self.registry.cancel_all();
                let flushed = match &self.rooms {
                    Some(rooms) => rooms.close().await,
                    None => 0,
                };
                self.registry.finish_shutdown();
                log::info!(
                    "Gateway shut down ({cancelled} queries cancelled, {flushed} rooms flushed)"
                );
            })
            .await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_done.initialized()
    }
}
