//! End-to-end tests over real WebSocket connections.
//!
//! Each test starts a server on a free port and talks to it with
//! `tokio_tungstenite` clients, the same way browsers do.

use arrow::array::{Array, Int64Array};
use arrow::ipc::reader::StreamReader;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use sqlroom_engine::DatabaseConfig;
use sqlroom_server::{decode_arrow_frame, Gateway, ServerConfig, ShutdownHandle, SqlRoomServer};
use yrs::updates::decoder::Decode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update, WriteTxn};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LONG_QUERY: &str = "WITH RECURSIVE c(n) AS (SELECT 1 UNION ALL SELECT n + 1 FROM c) \
                          SELECT count(*) AS n FROM c";

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

struct TestServer {
    port: u16,
    gateway: Arc<Gateway>,
    shutdown: ShutdownHandle,
}

/// Start a server on a free port with `config`.
async fn start_test_server(mut config: ServerConfig) -> TestServer {
    let port = free_port().await;
    config.bind_addr = format!("127.0.0.1:{port}");
    let server = SqlRoomServer::open(config).unwrap();
    let gateway = server.gateway().clone();
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    TestServer {
        port,
        gateway,
        shutdown,
    }
}

async fn connect(port: u16) -> Client {
    let url = format!("ws://127.0.0.1:{port}");
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

async fn send_json(client: &mut Client, value: Value) {
    client.send(Message::text(value.to_string())).await.unwrap();
}

/// Next data or close frame, skipping pings and pongs.
async fn next_frame(client: &mut Client) -> Message {
    loop {
        let message = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        match message {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

async fn next_json(client: &mut Client) -> Value {
    match next_frame(client).await {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {other:?}"),
    }
}

async fn next_binary(client: &mut Client) -> Vec<u8> {
    match next_frame(client).await {
        Message::Binary(data) => data.to_vec(),
        other => panic!("expected binary frame, got {other:?}"),
    }
}

/// Append `text` to a fresh document and return the update.
fn text_update(text: &str) -> Vec<u8> {
    let doc = Doc::new();
    let mut txn = doc.transact_mut();
    let content = txn.get_or_insert_text("content");
    content.insert(&mut txn, 0, text);
    txn.encode_state_as_update_v1(&StateVector::default())
}

#[tokio::test]
async fn test_arrow_query_round_trip() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    send_json(
        &mut client,
        json!({"type": "arrow", "sql": "select 1 as x", "queryId": "q1"}),
    )
    .await;

    let frame = next_binary(&mut client).await;
    let (header, payload) = decode_arrow_frame(&frame).unwrap();
    assert_eq!(header.kind, "arrow");
    assert_eq!(header.query_id, "q1");

    let reader = StreamReader::try_new(std::io::Cursor::new(payload.to_vec()), None).unwrap();
    let batches: Vec<_> = reader.map(|b| b.unwrap()).collect();
    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    assert_eq!(rows, 1);
    let column = batches[0]
        .column(0)
        .as_any()
        .downcast_ref::<Int64Array>()
        .unwrap();
    assert_eq!(column.value(0), 1);
}

#[tokio::test]
async fn test_exec_then_json_query() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    send_json(
        &mut client,
        json!({"type": "exec", "sql": "create table t(a integer)", "queryId": "c"}),
    )
    .await;
    assert_eq!(next_json(&mut client).await, json!({"type": "ok", "queryId": "c"}));

    send_json(
        &mut client,
        json!({"type": "exec", "sql": "insert into t values (1), (2)", "queryId": "i"}),
    )
    .await;
    assert_eq!(next_json(&mut client).await["type"], "ok");

    send_json(
        &mut client,
        json!({"type": "json", "sql": "select a from t order by a", "queryId": "s"}),
    )
    .await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "json");
    assert_eq!(reply["queryId"], "s");
    let rows: Value = serde_json::from_str(reply["data"].as_str().unwrap()).unwrap();
    assert_eq!(rows, json!([{"a": 1}, {"a": 2}]));
}

#[tokio::test]
async fn test_ui_state_is_client_readable_and_writable() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    send_json(
        &mut client,
        json!({
            "type": "exec",
            "sql": "insert or replace into __sqlrooms_ui_state (key, payload_json) \
                    values ('default', '{\"panels\":2}')",
            "queryId": "w"
        }),
    )
    .await;
    assert_eq!(next_json(&mut client).await, json!({"type": "ok", "queryId": "w"}));

    send_json(
        &mut client,
        json!({
            "type": "json",
            "sql": "select payload_json from __sqlrooms_ui_state where key = 'default'",
            "queryId": "r"
        }),
    )
    .await;
    let reply = next_json(&mut client).await;
    let rows: Value = serde_json::from_str(reply["data"].as_str().unwrap()).unwrap();
    assert_eq!(rows, json!([{"payload_json": "{\"panels\":2}"}]));
}

#[tokio::test]
async fn test_sql_error_is_reported_with_query_id() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    send_json(
        &mut client,
        json!({"type": "json", "sql": "select * from missing_table", "queryId": "bad"}),
    )
    .await;
    let reply = next_json(&mut client).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["queryId"], "bad");
    assert!(reply["error"].as_str().unwrap().contains("missing_table"));
}

#[tokio::test]
async fn test_cancel_running_query() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    send_json(
        &mut client,
        json!({"type": "json", "sql": LONG_QUERY, "queryId": "long_q"}),
    )
    .await;

    // Wait for the query to be registered before cancelling.
    for _ in 0..100 {
        if server.gateway.registry().active_ids().contains(&"long_q".to_string()) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    send_json(&mut client, json!({"type": "cancel", "queryId": "long_q"})).await;

    let mut ack = None;
    let mut outcome = None;
    while ack.is_none() || outcome.is_none() {
        let reply = next_json(&mut client).await;
        match reply["type"].as_str() {
            Some("cancelAck") => ack = Some(reply),
            Some(_) => outcome = Some(reply),
            None => panic!("untyped reply {reply}"),
        }
    }

    let ack = ack.unwrap();
    assert_eq!(ack["queryId"], "long_q");
    assert_eq!(ack["cancelled"], true);

    let outcome = outcome.unwrap();
    assert_eq!(outcome["type"], "error");
    assert_eq!(outcome["queryId"], "long_q");
    let message = outcome["error"].as_str().unwrap().to_lowercase();
    assert!(message.contains("cancel") || message.contains("interrupt"), "{message}");
}

#[tokio::test]
async fn test_cancel_unknown_query() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    send_json(&mut client, json!({"type": "cancel", "queryId": "nope"})).await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "cancelAck", "queryId": "nope", "cancelled": false})
    );
}

#[tokio::test]
async fn test_subscribe_and_notify() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut alice = connect(server.port).await;
    let mut bob = connect(server.port).await;

    send_json(&mut bob, json!({"type": "subscribe", "channel": "news"})).await;
    assert_eq!(
        next_json(&mut bob).await,
        json!({"type": "subscribed", "channel": "news"})
    );

    send_json(
        &mut alice,
        json!({"type": "notify", "channel": "news", "payload": {"n": 1}}),
    )
    .await;

    let expected = json!({"type": "notify", "channel": "news", "payload": {"n": 1}});
    assert_eq!(next_json(&mut bob).await, expected);
    assert_eq!(next_json(&mut alice).await, expected);
    assert_eq!(
        next_json(&mut alice).await,
        json!({"type": "notifyAck", "channel": "news"})
    );
}

#[tokio::test]
async fn test_malformed_messages() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    client.send(Message::text("{not json")).await.unwrap();
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "invalid json"})
    );

    send_json(&mut client, json!({"type": "bogus"})).await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "invalid message"})
    );

    send_json(&mut client, json!({"type": "subscribe"})).await;
    assert_eq!(next_json(&mut client).await["type"], "error");

    // The connection survives bad input.
    send_json(&mut client, json!({"type": "cancel", "queryId": "x"})).await;
    assert_eq!(next_json(&mut client).await["type"], "cancelAck");
}

#[tokio::test]
async fn test_room_join_receives_baseline() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    send_json(
        &mut client,
        json!({"type": "crdt-join", "roomId": "r1", "clientId": "c1"}),
    )
    .await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "crdt-joined", "roomId": "r1"})
    );

    let snapshot = next_json(&mut client).await;
    assert_eq!(snapshot["type"], "crdt-snapshot");
    assert_eq!(snapshot["roomId"], "r1");
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(snapshot["data"].as_str().unwrap())
        .unwrap();
    assert_eq!(bytes.len(), sqlroom_collab::empty_snapshot_len());
}

#[tokio::test]
async fn test_room_update_reaches_peer() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut alice = connect(server.port).await;
    let mut bob = connect(server.port).await;

    for client in [&mut alice, &mut bob] {
        send_json(client, json!({"type": "crdt-join", "roomId": "r1"})).await;
        assert_eq!(next_json(client).await["type"], "crdt-joined");
        assert_eq!(next_json(client).await["type"], "crdt-snapshot");
    }

    let update = text_update("hello");
    alice.send(Message::binary(update.clone())).await.unwrap();

    assert_eq!(
        next_json(&mut alice).await,
        json!({"type": "crdt-update-ack", "roomId": "r1"})
    );
    let relayed = next_binary(&mut bob).await;
    assert_eq!(relayed, update);

    let replica = Doc::new();
    {
        let mut txn = replica.transact_mut();
        txn.apply_update(Update::decode_v1(&relayed).unwrap()).unwrap();
    }
    let txn = replica.transact();
    assert_eq!(txn.get_text("content").unwrap().get_string(&txn), "hello");

    // A late joiner gets the merged state in its snapshot.
    let mut carol = connect(server.port).await;
    send_json(&mut carol, json!({"type": "crdt-join", "roomId": "r1"})).await;
    assert_eq!(next_json(&mut carol).await["type"], "crdt-joined");
    let snapshot = next_json(&mut carol).await;
    use base64::Engine as _;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(snapshot["data"].as_str().unwrap())
        .unwrap();
    let late = Doc::new();
    {
        let mut txn = late.transact_mut();
        txn.apply_update(Update::decode_v1(&bytes).unwrap()).unwrap();
    }
    let txn = late.transact();
    assert_eq!(txn.get_text("content").unwrap().get_string(&txn), "hello");
}

#[tokio::test]
async fn test_update_without_join_is_rejected() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    client.send(Message::binary(text_update("x"))).await.unwrap();
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "not in a room"})
    );
}

#[tokio::test]
async fn test_sync_disabled_rejects_rooms() {
    let config = ServerConfig {
        sync_enabled: false,
        ..ServerConfig::for_testing()
    };
    let server = start_test_server(config).await;
    let mut client = connect(server.port).await;

    send_json(&mut client, json!({"type": "crdt-join", "roomId": "r1"})).await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "crdt sync disabled"})
    );
}

#[tokio::test]
async fn test_auth_required_before_queries() {
    let config = ServerConfig {
        auth_token: Some("secret".to_string()),
        ..ServerConfig::for_testing()
    };
    let server = start_test_server(config).await;
    let mut client = connect(server.port).await;

    send_json(
        &mut client,
        json!({"type": "json", "sql": "select 1 as x", "queryId": "early"}),
    )
    .await;
    assert_eq!(
        next_json(&mut client).await,
        json!({"type": "error", "error": "unauthorized"})
    );

    send_json(&mut client, json!({"type": "auth", "token": "wrong"})).await;
    assert_eq!(next_json(&mut client).await["error"], "unauthorized");

    send_json(&mut client, json!({"type": "auth", "token": "secret"})).await;
    assert_eq!(next_json(&mut client).await, json!({"type": "authAck"}));

    send_json(
        &mut client,
        json!({"type": "json", "sql": "select 1 as x", "queryId": "late"}),
    )
    .await;
    assert_eq!(next_json(&mut client).await["type"], "json");

    // Authentication belongs to the connection.
    let mut other = connect(server.port).await;
    send_json(&mut other, json!({"type": "subscribe", "channel": "c"})).await;
    assert_eq!(next_json(&mut other).await["error"], "unauthorized");
}

#[tokio::test]
async fn test_disconnect_flushes_room_to_database() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("rooms.db");
    let mut config = ServerConfig::for_testing();
    config.engine.registry.database = DatabaseConfig::with_path(db_path.to_string_lossy());
    config.rooms.save_debounce = Duration::from_secs(60);
    let server = start_test_server(config).await;

    let mut writer = connect(server.port).await;
    send_json(&mut writer, json!({"type": "crdt-join", "roomId": "saved"})).await;
    next_json(&mut writer).await;
    next_json(&mut writer).await;
    writer.send(Message::binary(text_update("persist me"))).await.unwrap();
    assert_eq!(next_json(&mut writer).await["type"], "crdt-update-ack");
    writer.close(None).await.unwrap();

    let mut reader = connect(server.port).await;
    let mut saved = 0;
    for attempt in 0..50 {
        send_json(
            &mut reader,
            json!({
                "type": "json",
                "sql": "select count(*) as n from \"__sqlrooms_sync_rooms\" where room_id = 'saved'",
                "queryId": format!("poll-{attempt}"),
            }),
        )
        .await;
        let reply = next_json(&mut reader).await;
        if reply["type"] == "json" {
            let rows: Value = serde_json::from_str(reply["data"].as_str().unwrap()).unwrap();
            saved = rows[0]["n"].as_i64().unwrap();
            if saved == 1 {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(saved, 1);
}

#[tokio::test]
async fn test_ping_gets_pong() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    client.send(Message::Ping(b"hi".to_vec().into())).await.unwrap();
    let pong = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Pong(payload))) => return payload.to_vec(),
                Some(Ok(_)) => continue,
                other => panic!("unexpected {other:?}"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(pong, b"hi");
}

#[tokio::test]
async fn test_shutdown_closes_sessions() {
    let server = start_test_server(ServerConfig::for_testing()).await;
    let mut client = connect(server.port).await;

    server.shutdown.trigger();
    assert!(server.shutdown.is_triggered());

    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "client should see the session close");

    for _ in 0..100 {
        if server.gateway.is_shut_down() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(server.gateway.is_shut_down());
    assert!(!server.gateway.is_ready());
}

async fn http_get(port: u16, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

#[tokio::test]
async fn test_health_endpoints() {
    let health_port = free_port().await;
    let config = ServerConfig {
        health_addr: Some(format!("127.0.0.1:{health_port}")),
        ..ServerConfig::for_testing()
    };
    let _server = start_test_server(config).await;

    let healthz = http_get(health_port, "/healthz").await;
    assert!(healthz.starts_with("HTTP/1.1 200"));
    assert!(healthz.ends_with("ok"));

    let readyz = http_get(health_port, "/readyz").await;
    assert!(readyz.starts_with("HTTP/1.1 200"));

    let version = http_get(health_port, "/version").await;
    assert!(version.contains("\"name\":\"sqlroom-server\""));
    assert!(version.contains("\"sqlite\":\"3."));
}
