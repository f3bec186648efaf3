use std::sync::Arc;
use std::time::{Duration, Instant};

use tungstenite::Message;

use portcullis::server::WsServer;
use portcullis::ws::{
    Connection, ConnectionFilter, ConnectionRegistry, MessageDispatcher, MessageQueue,
    SendOptions, UpgradePolicy,
};

fn echo_dispatcher() -> MessageDispatcher {
    MessageDispatcher::builder()
        .fallback(Arc::new(
            |_conn: &Arc<Connection>, msg: Message| Ok(Some(msg)),
        ))
        .build()
}

fn wait_until(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_upgrade_rejected_without_origin() {
    let server = WsServer::builder()
        .policy(
            UpgradePolicy::builder()
                .allow_anonymous_origin(false)
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let handle = server.start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    // tungstenite's client sends no Origin header, so the upgrade must be
    // refused before any socket is handed out.
    let result = tungstenite::connect(format!("ws://{}/lobby", handle.addr()));
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 403);
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }

    handle.stop();
}

#[test]
fn test_echo_round_trip_and_indexing() {
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(MessageQueue::new())));
    let server = WsServer::builder()
        .registry(registry.clone())
        .dispatcher(echo_dispatcher())
        .build()
        .unwrap();
    let handle = server.start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    let (mut client, _response) =
        tungstenite::connect(format!("ws://{}/echo", handle.addr())).unwrap();
    assert!(wait_until(Duration::from_secs(2), || registry.len() == 1));

    let filter = ConnectionFilter::new().channel("echo");
    assert_eq!(registry.matching(&filter).count(), 1);

    client.send(Message::text("ping!")).unwrap();
    let reply = client.read().unwrap();
    assert_eq!(reply, Message::text("ping!"));

    client.close(None).unwrap();
    // The reader loop notices the close and removes the connection.
    assert!(wait_until(Duration::from_secs(2), || registry.len() == 0));

    handle.stop();
}

#[test]
fn test_queued_message_delivered_at_connect() {
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(MessageQueue::new())));
    let server = WsServer::builder()
        .registry(registry.clone())
        .dispatcher(echo_dispatcher())
        .build()
        .unwrap();
    let handle = server.start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    // Nobody is connected to the channel yet; queue the message.
    let sent = registry.broadcast(
        &ConnectionFilter::new().channel("lobby"),
        Message::text("welcome"),
        SendOptions::queued(),
    );
    assert_eq!(sent, 0);
    assert_eq!(registry.queue().len(), 1);

    let (mut client, _response) =
        tungstenite::connect(format!("ws://{}/lobby", handle.addr())).unwrap();
    let msg = client.read().unwrap();
    assert_eq!(msg, Message::text("welcome"));
    assert!(registry.queue().is_empty());

    client.close(None).unwrap();
    handle.stop();
}

#[test]
fn test_broadcast_reaches_live_client() {
    let registry = Arc::new(ConnectionRegistry::new(Arc::new(MessageQueue::new())));
    let server = WsServer::builder()
        .registry(registry.clone())
        .dispatcher(echo_dispatcher())
        .build()
        .unwrap();
    let handle = server.start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    let (mut client, _response) =
        tungstenite::connect(format!("ws://{}/news", handle.addr())).unwrap();
    assert!(wait_until(Duration::from_secs(2), || registry.len() == 1));

    let sent = registry.broadcast(
        &ConnectionFilter::new().channel("news"),
        Message::text("flash"),
        SendOptions::default(),
    );
    assert_eq!(sent, 1);
    assert_eq!(client.read().unwrap(), Message::text("flash"));

    client.close(None).unwrap();
    handle.stop();
}

#[test]
fn test_channel_allow_list_rejects_other_paths() {
    let server = WsServer::builder()
        .policy(
            UpgradePolicy::builder()
                .allow_channel("chat")
                .build()
                .unwrap(),
        )
        .build()
        .unwrap();
    let handle = server.start("127.0.0.1:0").unwrap();
    handle.wait_ready().unwrap();

    assert!(tungstenite::connect(format!("ws://{}/chat", handle.addr())).is_ok());
    let result = tungstenite::connect(format!("ws://{}/admin", handle.addr()));
    match result {
        Err(tungstenite::Error::Http(response)) => {
            assert_eq!(response.status().as_u16(), 403);
        }
        other => panic!("expected HTTP rejection, got {other:?}"),
    }

    handle.stop();
}
