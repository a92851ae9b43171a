//! End-to-end tests: a real server on an ephemeral port, fed through a
//! `ChannelSource`, with raw WebSocket clients and `ReconnectingClient`.

use can_frame_decoder::CanFrame;
use can_stream_server::client::{ClientConfig, ClientEvent, ConnectionState, ReconnectingClient};
use can_stream_server::distributor::DistributorConfig;
use can_stream_server::protocol::ServerMessage;
use can_stream_server::server::{self, ServerConfig, ServerHandle};
use can_stream_server::source::{ChannelSource, SourceEvent};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

async fn start_server(heartbeat_interval: Duration) -> (ServerHandle, mpsc::Sender<SourceEvent>) {
    start_server_on(0, heartbeat_interval).await
}

async fn start_server_on(
    port: u16,
    heartbeat_interval: Duration,
) -> (ServerHandle, mpsc::Sender<SourceEvent>) {
    let (source, tx) = ChannelSource::new("loopback");
    let config = ServerConfig {
        bind: "127.0.0.1".to_string(),
        port,
        distributor: DistributorConfig {
            heartbeat_interval,
            ..Default::default()
        },
        ..Default::default()
    };
    (server::start(config, source).await.unwrap(), tx)
}

async fn open(url: &str) -> Ws {
    let (ws, _) = connect_async(url).await.unwrap();
    ws
}

async fn next_json(ws: &mut Ws) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn next_of_type(ws: &mut Ws, msg_type: &str) -> Value {
    loop {
        let value = next_json(ws).await;
        if value["type"] == msg_type {
            return value;
        }
    }
}

async fn wait_streaming(ws: &mut Ws) {
    loop {
        if next_of_type(ws, "status").await["streaming"] == true {
            return;
        }
    }
}

async fn wait_for_stream(events: &mut mpsc::Receiver<ClientEvent>) {
    timeout(WAIT, async {
        loop {
            if let Some(ClientEvent::Message(ServerMessage::Status { streaming: true, .. })) = events.recv().await {
                return;
            }
        }
    })
    .await
    .unwrap();
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

#[tokio::test]
async fn test_subscription_filtering_and_relay() {
    let (server, source_tx) = start_server(Duration::from_secs(30)).await;
    let url = server.ws_url();

    let mut observer = open(&url).await;
    wait_streaming(&mut observer).await;
    let mut sender = open(&url).await;
    wait_streaming(&mut sender).await;

    send(&mut observer, json!({"type": "subscribe", "messageIds": [0x100]})).await;
    assert_eq!(next_of_type(&mut observer, "subscribed").await["messageIds"], json!([0x100]));

    for id in [0x100u32, 0x200] {
        source_tx
            .send(SourceEvent::Frame(CanFrame::new(id, vec![id as u8], 1)))
            .await
            .unwrap();
    }

    // Wildcard session sees both frames in order
    assert_eq!(next_of_type(&mut sender, "frame").await["frame"]["id"], 0x100);
    assert_eq!(next_of_type(&mut sender, "frame").await["frame"]["id"], 0x200);

    // Subscribed session sees only 0x100, then the relayed frame
    assert_eq!(next_of_type(&mut observer, "frame").await["frame"]["id"], 0x100);

    send(&mut sender, json!({"type": "send_frame", "frame": {"id": 0x100, "data": [7, 7]}})).await;
    let response = next_of_type(&mut sender, "send_frame_response").await;
    assert_eq!(response["success"], true);

    let relayed = next_of_type(&mut observer, "frame").await;
    assert_eq!(relayed["frame"]["data"], json!([7, 7]));

    send(&mut sender, json!({"type": "get_interface_info"})).await;
    let info = next_of_type(&mut sender, "interface_info").await;
    assert_eq!(info["interface"], "loopback");
    assert_eq!(info["sessions"], 2);
    assert_eq!(info["stats"]["framesReceived"], 2);
    assert_eq!(info["stats"]["framesRelayed"], 1);

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_messages_get_error_replies() {
    let (server, _source_tx) = start_server(Duration::from_secs(30)).await;
    let mut ws = open(&server.ws_url()).await;
    wait_streaming(&mut ws).await;

    ws.send(Message::text("not json".to_string())).await.unwrap();
    assert!(next_of_type(&mut ws, "error").await["error"]
        .as_str()
        .unwrap()
        .contains("malformed"));

    send(&mut ws, json!({"type": "launch"})).await;
    assert!(next_of_type(&mut ws, "error").await["error"]
        .as_str()
        .unwrap()
        .contains("launch"));

    // Still usable
    send(&mut ws, json!({"type": "heartbeat"})).await;
    assert!(next_of_type(&mut ws, "heartbeat").await["timestamp"].as_u64().unwrap() > 0);

    server.shutdown().await;
}

#[tokio::test]
async fn test_silent_session_is_evicted() {
    let (server, _source_tx) = start_server(Duration::from_millis(200)).await;
    let mut ws = open(&server.ws_url()).await;

    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "session was not evicted");

    let health = server.distributor().health().await.unwrap();
    assert_eq!(health.sessions, 0);
    assert!(!health.streaming);

    server.shutdown().await;
}

#[tokio::test]
async fn test_reconnecting_client_receives_batches() {
    let (server, source_tx) = start_server(Duration::from_secs(30)).await;

    let mut client = ReconnectingClient::new(ClientConfig {
        url: server.ws_url(),
        batch_interval: Duration::from_millis(20),
        batch_size: 3,
        ..Default::default()
    });
    let mut events = client.take_events().unwrap();
    client.connect();
    client.wait_connected(WAIT).await.unwrap();

    // Frames sent before the stream starts would be discarded
    wait_for_stream(&mut events).await;

    for id in 1..=7u32 {
        source_tx
            .send(SourceEvent::Frame(CanFrame::new(id, vec![], id as u64)))
            .await
            .unwrap();
    }

    let mut received = Vec::new();
    timeout(WAIT, async {
        while received.len() < 7 {
            if let Some(ClientEvent::Batch(batch)) = events.recv().await {
                assert!(batch.len() <= 3);
                received.extend(batch.into_iter().map(|f| f.id));
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, (1..=7).collect::<Vec<u32>>());

    let history: Vec<u32> = client.history().await.iter().map(|f| f.id).collect();
    assert_eq!(history, received);

    let stats = client.stats().await;
    assert_eq!(stats.frames_received, 7);
    assert_eq!(stats.connections, 1);
    assert!(stats.batches_flushed >= 3);

    client.disconnect().await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    server.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_flushes_partial_batch() {
    let (server, source_tx) = start_server(Duration::from_secs(30)).await;

    let mut client = ReconnectingClient::new(ClientConfig {
        url: server.ws_url(),
        batch_interval: Duration::from_secs(60),
        batch_size: 1000,
        ..Default::default()
    });
    let mut events = client.take_events().unwrap();
    client.connect();
    client.wait_connected(WAIT).await.unwrap();
    wait_for_stream(&mut events).await;

    for id in 1..=3u32 {
        source_tx
            .send(SourceEvent::Frame(CanFrame::new(id, vec![], 0)))
            .await
            .unwrap();
    }
    timeout(WAIT, async {
        while client.stats().await.frames_received < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Below both thresholds: still buffered
    assert!(client.history().await.is_empty());
    assert_eq!(client.stats().await.batches_flushed, 0);

    client.disconnect().await;

    let history: Vec<u32> = client.history().await.iter().map(|f| f.id).collect();
    assert_eq!(history, vec![1, 2, 3]);
    assert_eq!(client.stats().await.batches_flushed, 1);

    let mut batch = None;
    while let Ok(event) = events.try_recv() {
        if let ClientEvent::Batch(frames) = event {
            batch = Some(frames.into_iter().map(|f| f.id).collect::<Vec<u32>>());
        }
    }
    assert_eq!(batch, Some(vec![1, 2, 3]));

    server.shutdown().await;
}

#[tokio::test]
async fn test_client_reconnects_to_restarted_server() {
    let (first, _source_tx) = start_server(Duration::from_secs(30)).await;
    let port = first.local_addr().port();

    let mut client = ReconnectingClient::new(ClientConfig {
        url: first.ws_url(),
        reconnect_delay: Duration::from_millis(100),
        max_reconnect_attempts: 50,
        ..Default::default()
    });
    client.connect();
    client.wait_connected(WAIT).await.unwrap();

    first.shutdown().await;
    timeout(WAIT, async {
        while client.state() == ConnectionState::Connected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("client did not notice the server going away");

    let (second, _source_tx) = start_server_on(port, Duration::from_secs(30)).await;
    timeout(WAIT, async {
        while client.stats().await.connections < 2 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client did not reconnect");

    client.wait_connected(WAIT).await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    let stats = client.stats().await;
    assert_eq!(stats.connections, 2);
    assert_eq!(stats.reconnect_attempts, 0);
    assert!(stats.connection_errors >= 1);
    assert!(!client.gave_up().await);

    client.disconnect().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_client_outbound_helpers_reach_server() {
    let (server, source_tx) = start_server(Duration::from_secs(30)).await;
    let mut observer = open(&server.ws_url()).await;
    wait_streaming(&mut observer).await;

    let mut client = ReconnectingClient::new(ClientConfig {
        url: server.ws_url(),
        ..Default::default()
    });
    let mut events = client.take_events().unwrap();
    client.connect();
    client.wait_connected(WAIT).await.unwrap();

    client.set_filters(None, Some(vec![0x42])).unwrap();
    client.send_frame(&CanFrame::new(0x42, vec![1, 2, 3], 0)).unwrap();

    let relayed = next_of_type(&mut observer, "frame").await;
    assert_eq!(relayed["frame"]["id"], 0x42);
    assert_eq!(relayed["frame"]["data"], json!([1, 2, 3]));

    let mut saw_filters = false;
    let mut saw_response = false;
    timeout(WAIT, async {
        while !(saw_filters && saw_response) {
            match events.recv().await {
                Some(ClientEvent::Message(ServerMessage::FiltersUpdated { id_filter, .. })) => {
                    assert_eq!(id_filter, Some(vec![0x42]));
                    saw_filters = true;
                }
                Some(ClientEvent::Message(ServerMessage::SendFrameResponse { success, .. })) => {
                    assert!(success);
                    saw_response = true;
                }
                Some(_) => {}
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .unwrap();

    // Filtered out for the client, delivered to the observer
    source_tx
        .send(SourceEvent::Frame(CanFrame::new(0x43, vec![], 0)))
        .await
        .unwrap();
    assert_eq!(next_of_type(&mut observer, "frame").await["frame"]["id"], 0x43);
    assert_eq!(client.stats().await.frames_received, 0);

    client.disconnect().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_client_gives_up_after_server_goes_away() {
    let (server, _source_tx) = start_server(Duration::from_secs(30)).await;

    let mut client = ReconnectingClient::new(ClientConfig {
        url: server.ws_url(),
        reconnect_delay: Duration::from_millis(200),
        max_reconnect_attempts: 2,
        ..Default::default()
    });
    client.connect();
    client.wait_connected(WAIT).await.unwrap();

    server.shutdown().await;

    timeout(WAIT, async {
        while !client.gave_up().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("client kept retrying");

    assert!(matches!(client.state(), ConnectionState::Error(_)));
    let stats = client.stats().await;
    assert_eq!(stats.connections, 1);
    assert_eq!(stats.connection_attempts, 3);
    assert!(stats.connection_errors >= 3);
}
