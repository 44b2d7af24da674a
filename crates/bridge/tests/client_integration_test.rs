use bridge::protocol::DEFAULT_MAX_FRAME_LEN;
use bridge::{BridgeError, InferenceClient, Mode, read_inference_request};
use schema::Camera;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Spawns a one-connection peer that records the request and answers `reply`.
async fn spawn_peer(reply: &'static [u8]) -> (String, mpsc::Receiver<(Mode, Vec<Vec<u8>>)>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let (tx, rx) = mpsc::channel(1);

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let request = read_inference_request(&mut socket, DEFAULT_MAX_FRAME_LEN)
            .await
            .unwrap();
        tx.send(request).await.unwrap();
        // Answer in two writes to prove the client reads until close.
        let (head, tail) = reply.split_at(reply.len() / 2);
        socket.write_all(head).await.unwrap();
        socket.flush().await.unwrap();
        socket.write_all(tail).await.unwrap();
        socket.shutdown().await.unwrap();
    });

    (addr, rx)
}

#[tokio::test]
async fn test_analyze_sends_dual_request_and_reads_until_close() {
    let reply = br#"{"result":"ok","det_top":[["can",0.97]],"det_side":[]}"#;
    let (addr, mut requests) = spawn_peer(reply).await;
    let client = InferenceClient::new(addr, Duration::from_secs(5));

    let top = vec![1u8; 4096];
    let side = vec![2u8; 1234];
    let raw = client.analyze(&top, &side).await.unwrap();

    assert_eq!(raw.as_bytes(), reply);

    let (mode, fields) = requests.recv().await.unwrap();
    assert_eq!(mode, Mode::Dual);
    assert_eq!(fields, vec![top, side], "TOP must precede SIDE");
}

#[tokio::test]
async fn test_analyze_single_sends_camera_label() {
    let (addr, mut requests) = spawn_peer(br#"{"result":"ok"}"#).await;
    let client = InferenceClient::new(addr, Duration::from_secs(5));

    client.analyze_single(Camera::Side, b"img").await.unwrap();

    let (mode, fields) = requests.recv().await.unwrap();
    assert_eq!(mode, Mode::Single);
    assert_eq!(fields[0], b"side".to_vec());
    assert_eq!(fields[1], b"img".to_vec());
}

#[tokio::test]
async fn test_invalid_utf8_is_replaced_not_rejected() {
    let (addr, _requests) = spawn_peer(b"ok\xff\xfe").await;
    let client = InferenceClient::new(addr, Duration::from_secs(5));

    let raw = client.analyze(b"a", b"b").await.unwrap();
    assert!(raw.starts_with("ok"));
    assert!(raw.contains('\u{FFFD}'));
}

#[tokio::test]
async fn test_health_check() {
    let (addr, mut requests) = spawn_peer(b"OK").await;
    let client = InferenceClient::new(addr, Duration::from_secs(5));
    client.health_check().await.unwrap();
    let (mode, fields) = requests.recv().await.unwrap();
    assert_eq!(mode, Mode::Health);
    assert!(fields.is_empty());

    let (addr, _requests) = spawn_peer(b"BUSY").await;
    let client = InferenceClient::new(addr, Duration::from_secs(5));
    assert!(matches!(
        client.health_check().await,
        Err(BridgeError::Unhealthy(answer)) if answer == "BUSY"
    ));
}

#[tokio::test]
async fn test_connect_failure_is_bridge_error() {
    // Bind then drop to get a port nobody listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let client = InferenceClient::new(addr.clone(), Duration::from_secs(5));
    match client.analyze(b"a", b"b").await {
        Err(BridgeError::Connect { addr: reported, .. }) => assert_eq!(reported, addr),
        other => panic!("Expected connect failure, got {other:?}"),
    }
}

#[tokio::test]
async fn test_silent_peer_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (_socket, _) = listener.accept().await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    let client = InferenceClient::new(addr, Duration::from_millis(200));
    assert!(matches!(
        client.analyze(b"a", b"b").await,
        Err(BridgeError::Timeout(d)) if d == Duration::from_millis(200)
    ));
}
