//! An in-process server speaking the wire protocol, plus end-to-end tests that drive the
//! whole core (discovery, selection, checkout, execution, retry) against it.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use bson::{doc, Bson, Document};
use tokio::net::{TcpListener, TcpStream};

use crate::{
    cmap::conn::wire::{Message, MessageFlags},
    cmap::test::EventSink,
    error::RETRYABLE_WRITE_ERROR,
    event::cmap::{CmapEvent, CmapEventHandler, ConnectionClosedReason},
    operation::Insert,
    options::{ClientOptions, ServerAddress},
    runtime,
    Client,
    TopologyType,
};

/// A scripted server. Every accepted connection replies to `hello`/`isMaster` commands with
/// the configured hello document; other commands pop a scripted reply from the override queue
/// for that command name, falling back to `{ok: 1, n: 1}`.
struct MockServer {
    address: ServerAddress,
    hello: Mutex<Document>,
    overrides: Mutex<HashMap<String, VecDeque<Document>>>,
    delays: Mutex<HashMap<String, Duration>>,
    received: Mutex<Vec<Document>>,
}

impl MockServer {
    async fn start() -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = ServerAddress::Tcp {
            host: "127.0.0.1".to_string(),
            port: Some(listener.local_addr().unwrap().port()),
        };

        let server = Arc::new(MockServer {
            address,
            hello: Mutex::new(Self::standalone_hello()),
            overrides: Default::default(),
            delays: Default::default(),
            received: Default::default(),
        });

        let accept_server = server.clone();
        runtime::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((socket, _)) => {
                        let conn_server = accept_server.clone();
                        runtime::spawn(async move {
                            let _ = conn_server.serve_connection(socket).await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        server
    }

    /// Starts a mock server that reports itself as a replica set primary, which is the shape
    /// needed for retryable writes (standalone servers don't accept transaction numbers).
    async fn start_as_primary(max_wire_version: i32) -> Arc<Self> {
        let server = Self::start().await;
        let hello = doc! {
            "ok": 1,
            "isWritablePrimary": true,
            "helloOk": true,
            "setName": "repl",
            "hosts": [server.address.to_string()],
            "me": server.address.to_string(),
            "minWireVersion": 7,
            "maxWireVersion": max_wire_version,
            "logicalSessionTimeoutMinutes": 30,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxMessageSizeBytes": 48_000_000,
            "maxWriteBatchSize": 100_000,
        };
        *server.hello.lock().unwrap() = hello;
        server
    }

    fn standalone_hello() -> Document {
        doc! {
            "ok": 1,
            "isWritablePrimary": true,
            "helloOk": true,
            "minWireVersion": 7,
            "maxWireVersion": 17,
            "logicalSessionTimeoutMinutes": 30,
            "maxBsonObjectSize": 16 * 1024 * 1024,
            "maxMessageSizeBytes": 48_000_000,
            "maxWriteBatchSize": 100_000,
        }
    }

    /// Queue a scripted reply for the next command with the given name.
    fn push_reply(&self, command_name: &str, reply: Document) {
        self.overrides
            .lock()
            .unwrap()
            .entry(command_name.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Delay replies to the given command.
    fn set_delay(&self, command_name: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(command_name.to_string(), delay);
    }

    /// All received commands with the given name.
    fn received_commands(&self, command_name: &str) -> Vec<Document> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|doc| doc.contains_key(command_name))
            .cloned()
            .collect()
    }

    async fn serve_connection(&self, mut socket: TcpStream) -> crate::error::Result<()> {
        loop {
            let request = Message::read_from(&mut socket).await?;
            let request_id = request.request_id;
            let command = request.single_document_response();

            let command_name = command
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            self.received.lock().unwrap().push(command.clone());

            let delay = self.delays.lock().unwrap().get(&command_name).copied();
            if let Some(delay) = delay {
                runtime::delay_for(delay).await;
            }

            let reply_doc = if command_name == "hello" || command_name == "isMaster" {
                self.hello.lock().unwrap().clone()
            } else {
                let scripted = self
                    .overrides
                    .lock()
                    .unwrap()
                    .get_mut(&command_name)
                    .and_then(|queue| queue.pop_front());
                scripted.unwrap_or_else(|| doc! { "ok": 1, "n": 1 })
            };

            let reply = Message {
                response_to: request_id.unwrap_or(0),
                flags: MessageFlags::empty(),
                document_payload: reply_doc,
                document_sequences: Vec::new(),
                request_id: None,
            };
            reply.write_to(&mut socket).await?;
        }
    }
}

fn test_options(server: &MockServer, sink: Arc<EventSink>) -> ClientOptions {
    let mut options = ClientOptions::builder()
        .hosts(vec![server.address.clone()])
        .direct_connection(true)
        .heartbeat_freq(Duration::from_millis(500))
        .server_selection_timeout(Duration::from_secs(10))
        .cmap_event_handler(sink as Arc<dyn CmapEventHandler>)
        .build();
    options.test_options_mut().min_heartbeat_freq = Some(Duration::from_millis(50));
    options
}

fn ok_value(reply: &Document) -> i64 {
    reply.get("ok").and_then(crate::bson_util::get_int).unwrap_or(0)
}

#[tokio::test]
async fn discovers_standalone_and_runs_commands() {
    let server = MockServer::start().await;
    let sink = EventSink::new();
    let client = Client::with_options(test_options(&server, sink)).unwrap();

    let reply = client.run_command("admin", doc! { "ping": 1 }).await.unwrap();
    assert_eq!(ok_value(&reply), 1);

    assert_eq!(client.topology_type(), TopologyType::Single);

    // The handshake and heartbeat hellos should all have reached the server.
    assert!(!server.received_commands("isMaster").is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn retryable_write_reuses_transaction_number() {
    let server = MockServer::start_as_primary(17).await;
    let sink = EventSink::new();
    let client = Client::with_options(test_options(&server, sink.clone())).unwrap();

    // On 4.4+ servers, retryable errors carry the RetryableWriteError label.
    server.push_reply(
        "insert",
        doc! {
            "ok": 0,
            "code": 11602,
            "codeName": "InterruptedDueToReplStateChange",
            "errmsg": "interrupted due to replica set state change",
            "errorLabels": [RETRYABLE_WRITE_ERROR],
        },
    );

    let mut insert = Insert::new(
        "items".to_string(),
        "widgets".to_string(),
        vec![doc! { "x": 1 }],
    );
    let n = client.execute_operation(&mut insert).await.unwrap();
    assert_eq!(n, 1);

    let inserts = server.received_commands("insert");
    assert_eq!(inserts.len(), 2, "the write should be retried exactly once");

    // The retry must reuse the same transaction number and session so the server can
    // deduplicate the write.
    let first_txn = inserts[0].get("txnNumber").cloned();
    let second_txn = inserts[1].get("txnNumber").cloned();
    assert!(matches!(first_txn, Some(Bson::Int64(_))), "{:?}", first_txn);
    assert_eq!(first_txn, second_txn);
    assert_eq!(
        inserts[0].get_document("lsid").unwrap(),
        inserts[1].get_document("lsid").unwrap()
    );

    // Code 11602 is not a shutdown error, and the server is 4.2+, so the pool must not have
    // been cleared.
    assert!(!sink.contains(|e| matches!(e, CmapEvent::PoolCleared(_))));

    client.shutdown().await;
}

#[tokio::test]
async fn state_change_error_on_pre_42_server_clears_pool() {
    let server = MockServer::start_as_primary(7).await;
    let sink = EventSink::new();
    let client = Client::with_options(test_options(&server, sink.clone())).unwrap();

    server.push_reply(
        "insert",
        doc! {
            "ok": 0,
            "code": 10107,
            "codeName": "NotWritablePrimary",
            "errmsg": "not primary",
        },
    );

    let mut insert = Insert::new(
        "items".to_string(),
        "widgets".to_string(),
        vec![doc! { "x": 1 }],
    );
    let n = client.execute_operation(&mut insert).await.unwrap();
    assert_eq!(n, 1);

    // On a pre-4.2 server, a "not primary" error clears the pool.
    sink.wait_for(|e| matches!(e, CmapEvent::PoolCleared(_))).await;

    let inserts = server.received_commands("insert");
    assert_eq!(inserts.len(), 2, "the write should be retried exactly once");

    client.shutdown().await;
}

#[tokio::test]
async fn cancelled_operation_does_not_clear_pool() {
    let server = MockServer::start().await;
    let sink = EventSink::new();
    let client = Client::with_options(test_options(&server, sink.clone())).unwrap();

    // Make sure the pool and topology are warm before racing the cancellation.
    client.run_command("admin", doc! { "ping": 1 }).await.unwrap();

    server.set_delay("find", Duration::from_secs(5));

    // Cancel the operation while its reply is still in flight.
    let result = runtime::timeout(
        Duration::from_millis(100),
        client.run_command("items", doc! { "find": "widgets" }),
    )
    .await;
    assert!(result.is_err(), "operation should have been cancelled");

    // The connection had a partial reply outstanding, so it must be discarded rather than
    // reused, but the pool must NOT be cleared.
    sink.wait_for(|e| {
        matches!(
            e,
            CmapEvent::ConnectionClosed(event) if event.reason == ConnectionClosedReason::Dropped
        )
    })
    .await;
    assert!(!sink.contains(|e| matches!(e, CmapEvent::PoolCleared(_))));

    client.shutdown().await;
}

#[tokio::test]
async fn load_balanced_mode_skips_monitoring_and_routes_operations() {
    let server = MockServer::start().await;
    {
        // A load balancer backend identifies itself with a serviceId on handshake.
        let mut hello = server.hello.lock().unwrap();
        hello.insert("msg", "isdbgrid");
        hello.insert("serviceId", bson::oid::ObjectId::new());
    }

    let uri = format!("mongodb://{}/?loadBalanced=true", server.address);
    let mut options = ClientOptions::parse(&uri).await.unwrap();
    options.server_selection_timeout = Some(Duration::from_secs(10));
    let sink = EventSink::new();
    options.cmap_event_handler = Some(sink.clone() as Arc<dyn CmapEventHandler>);
    let client = Client::with_options(options).unwrap();

    assert_eq!(client.topology_type(), TopologyType::LoadBalanced);

    let reply = client.run_command("admin", doc! { "ping": 1 }).await.unwrap();
    assert_eq!(ok_value(&reply), 1);

    // No monitors run against a load balancer; the only hellos are connection handshakes,
    // which use the modern command because loadBalanced was requested.
    assert!(server.received_commands("isMaster").is_empty());
    assert!(!server.received_commands("hello").is_empty());

    client.shutdown().await;
}

#[tokio::test]
async fn command_errors_surface_code_and_labels() {
    let server = MockServer::start().await;
    let sink = EventSink::new();
    let client = Client::with_options(test_options(&server, sink)).unwrap();

    server.push_reply(
        "grantRolesToUser",
        doc! {
            "ok": 0,
            "code": 13,
            "codeName": "Unauthorized",
            "errmsg": "not authorized",
            "errorLabels": ["SomeLabel"],
        },
    );

    let error = client
        .run_command("admin", doc! { "grantRolesToUser": "someone" })
        .await
        .unwrap_err();

    match *error.kind {
        crate::error::ErrorKind::Command(ref command_error) => {
            assert_eq!(command_error.code, 13);
            assert_eq!(command_error.code_name, "Unauthorized");
        }
        ref other => panic!("expected command error, got {:?}", other),
    }
    assert!(error.contains_label("SomeLabel"));

    client.shutdown().await;
}
