//! Integration tests for RPC over the real transports.

use std::sync::Arc;
use std::time::Duration;

use fiberlens::channel::{BroadcastChannel, BroadcastHub, ErrorCode, SocketChannel, SocketListener};
use fiberlens::rpc::{handler, DEFAULT_TIMEOUT};
use fiberlens::{Channel, ConnectionState, Message, RpcError, RpcPeer, RpcTable};
use serde_json::{json, Value};

fn echo_table() -> Arc<RpcTable> {
    let table = RpcTable::new();
    table
        .register("echo.upper", handler(|args| async move {
            let text = args.first().and_then(Value::as_str).unwrap_or_default();
            Ok(json!(text.to_uppercase()))
        }))
        .unwrap();
    table
}

#[tokio::test]
async fn test_round_trip_over_websocket() {
    let listener = SocketListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move {
        let channel = listener.accept().await.unwrap();
        RpcPeer::new(channel, echo_table(), DEFAULT_TIMEOUT)
    });
    let client = RpcPeer::new(SocketChannel::connect(&url).await.unwrap(), RpcTable::new(), DEFAULT_TIMEOUT);
    let server = server.await.unwrap();

    let result = client.call("echo.upper", vec![json!("fiber")]).await.unwrap();
    assert_eq!(result, json!("FIBER"));

    let err = client.call("echo.lower", vec![]).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::MethodNotFound);

    client.close().await;
    server.close().await;
}

#[tokio::test]
async fn test_remote_close_rejects_pending_calls() {
    let listener = SocketListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    let server = tokio::spawn(async move { listener.accept().await.unwrap() });
    let client = RpcPeer::new(SocketChannel::connect(&url).await.unwrap(), RpcTable::new(), DEFAULT_TIMEOUT);
    // Accepted but never answered.
    let server_channel = server.await.unwrap();

    let caller = Arc::clone(&client);
    let pending = tokio::spawn(async move { caller.call("slow.op", vec![]).await });
    while client.pending_count() == 0 {
        tokio::task::yield_now().await;
    }

    server_channel.close().await;
    let outcome = tokio::time::timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    assert_eq!(outcome, Err(RpcError::Closed));
    assert_eq!(client.pending_count(), 0);
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_round_trip_over_broadcast_skips_own_echo() {
    let hub = BroadcastHub::new();
    let a = RpcPeer::new(BroadcastChannel::open(&hub, "devtools"), echo_table(), DEFAULT_TIMEOUT);
    let own = RpcTable::new();
    own.register("echo.upper", handler(|_| async { Ok(json!("self")) })).unwrap();
    let b = RpcPeer::new(BroadcastChannel::open(&hub, "devtools"), own, DEFAULT_TIMEOUT);

    // Without echo filtering `b` would also answer its own request.
    for _ in 0..5 {
        let result = b.call("echo.upper", vec![json!("tab")]).await.unwrap();
        assert_eq!(result, json!("TAB"));
    }
    assert_eq!(a.pending_count(), 0);
}

#[tokio::test]
async fn test_second_panel_tab_does_not_answer_for_the_host() {
    let hub = BroadcastHub::new();
    let other_tab = RpcPeer::new(BroadcastChannel::open(&hub, "devtools"), RpcTable::new(), DEFAULT_TIMEOUT);
    let _host = RpcPeer::new(BroadcastChannel::open(&hub, "devtools"), echo_table(), DEFAULT_TIMEOUT);
    let tab = RpcPeer::new(BroadcastChannel::open(&hub, "devtools"), RpcTable::new(), DEFAULT_TIMEOUT);

    for word in ["one", "two", "three"] {
        let result = tab.call("echo.upper", vec![json!(word)]).await.unwrap();
        assert_eq!(result, json!(word.to_uppercase()));
    }
    assert_eq!(other_tab.pending_count(), 0);
}

#[tokio::test]
async fn test_close_rejects_both_pending_and_later_sends_are_noops() {
    let hub = BroadcastHub::new();
    let channel = BroadcastChannel::open(&hub, "quiet");
    let peer = RpcPeer::new(Arc::clone(&channel) as Arc<dyn Channel>, RpcTable::new(), DEFAULT_TIMEOUT);
    let _silent = BroadcastChannel::open(&hub, "quiet");

    let first = tokio::spawn({
        let peer = Arc::clone(&peer);
        async move { peer.call("never.one", vec![]).await }
    });
    let second = tokio::spawn({
        let peer = Arc::clone(&peer);
        async move { peer.call("never.two", vec![]).await }
    });
    while peer.pending_count() < 2 {
        tokio::task::yield_now().await;
    }

    peer.close().await;
    assert_eq!(first.await.unwrap(), Err(RpcError::Closed));
    assert_eq!(second.await.unwrap(), Err(RpcError::Closed));

    assert_eq!(channel.state(), ConnectionState::Disconnected);
    assert!(channel.send(&Message::request("late", "never.three", vec![])).is_ok());
    assert_eq!(peer.call("never.four", vec![]).await, Err(RpcError::Closed));
}

#[tokio::test(start_paused = true)]
async fn test_unanswered_call_times_out_with_no_pending_left() {
    let hub = BroadcastHub::new();
    let peer = RpcPeer::new(BroadcastChannel::open(&hub, "void"), RpcTable::new(), Duration::from_secs(2));

    let err = peer.call("slow.op", vec![json!(1)]).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout { ref method, .. } if method == "slow.op"));
    assert_eq!(err.code(), ErrorCode::Timeout);
    assert_eq!(peer.pending_count(), 0);
    assert!(!peer.is_closed());
}
