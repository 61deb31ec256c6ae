//! End-to-end tests for the relay protocol
//!
//! Each test runs the real listener and WebSocket adapter on loopback and
//! drives it with a tungstenite client, checking what reaches the in-memory
//! output devices.

use audiorelay_core::domain::audio::{AudioConfig, OutputDevice};
use audiorelay_core::domain::protocol::CLOSE_INTERNAL_ERROR;
use audiorelay_core::testing::{MemoryOutput, OpenCall};
use audiorelay_tests::{
    config_message, expect_devices, next_message, select_message, wait_until, TestServer,
};
use futures_util::SinkExt;
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

fn close_code(message: &Option<Message>) -> Option<u16> {
    match message {
        Some(Message::Close(Some(frame))) => Some(u16::from(frame.code)),
        _ => None,
    }
}

// ============================================================================
// HANDSHAKE
// ============================================================================

#[tokio::test]
async fn test_handshake_lists_devices_and_opens_selection() {
    let output = MemoryOutput::new(vec![
        OutputDevice {
            index: 0,
            name: "Built-in Output".to_string(),
        },
        OutputDevice {
            index: 3,
            name: "USB Audio DAC".to_string(),
        },
    ]);
    let server = TestServer::start(output).await;
    let mut client = server.connect().await;

    client.send(config_message(44100, 2, 3, 512)).await.unwrap();
    let devices = expect_devices(&mut client).await;
    assert_eq!(
        devices,
        json!([
            {"index": 0, "name": "Built-in Output"},
            {"index": 3, "name": "USB Audio DAC"}
        ])
    );

    client.send(select_message(json!(3))).await.unwrap();
    wait_until(|| server.output.sinks().len() == 1).await;

    assert_eq!(
        server.output.open_calls(),
        vec![OpenCall {
            config: AudioConfig::new(44100, 2, 3, 512).unwrap(),
            device_index: 3,
        }]
    );

    client.close(None).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_browser_style_string_fields() {
    let server = TestServer::with_devices(&["Speakers", "Headphones"]).await;
    let mut client = server.connect().await;

    let config = json!({
        "type": "config",
        "data": {
            "sampleRate": "48000",
            "channels": "1",
            "sampleWidthBytes": "2",
            "framesPerBuffer": "1024"
        }
    });
    client.send(Message::Text(config.to_string())).await.unwrap();
    expect_devices(&mut client).await;

    client.send(select_message(json!("1"))).await.unwrap();
    wait_until(|| server.output.sinks().len() == 1).await;
    assert_eq!(server.output.open_calls()[0].device_index, 1);

    client.close(None).await.unwrap();
    server.stop().await;
}

#[tokio::test]
async fn test_unsupported_width_closes_with_internal_error() {
    let server = TestServer::with_devices(&["Speakers"]).await;
    let mut client = server.connect().await;

    client.send(config_message(48000, 2, 5, 256)).await.unwrap();

    let reply = next_message(&mut client).await;
    assert_eq!(close_code(&reply), Some(CLOSE_INTERNAL_ERROR), "{:?}", reply);
    assert!(server.output.open_calls().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_first_message_gets_no_response() {
    let server = TestServer::with_devices(&["Speakers"]).await;
    let mut client = server.connect().await;

    client.send(select_message(json!(0))).await.unwrap();

    // The server only closes the connection; no devices message and no error code
    match next_message(&mut client).await {
        None | Some(Message::Close(None)) => {}
        other => panic!("expected a bare close, got {:?}", other),
    }
    assert!(server.output.open_calls().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_device_closes_with_reason() {
    let server = TestServer::with_devices(&["Speakers"]).await;
    let mut client = server.connect().await;

    client.send(config_message(48000, 2, 2, 256)).await.unwrap();
    expect_devices(&mut client).await;
    client.send(select_message(json!(7))).await.unwrap();

    match next_message(&mut client).await {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(u16::from(frame.code), CLOSE_INTERNAL_ERROR);
            assert!(frame.reason.contains("device"), "{}", frame.reason);
        }
        other => panic!("expected close with reason, got {:?}", other),
    }
    assert!(server.output.sinks().is_empty());

    server.stop().await;
}

// ============================================================================
// STREAMING
// ============================================================================

#[tokio::test]
async fn test_frames_arrive_in_order_and_sink_is_released_once() {
    let server = TestServer::with_devices(&["Speakers"]).await;
    let mut client = server.connect().await;

    client.send(config_message(48000, 2, 2, 128)).await.unwrap();
    expect_devices(&mut client).await;
    client.send(select_message(json!(0))).await.unwrap();

    let frames: Vec<Vec<u8>> = (0u32..2_000)
        .map(|i| {
            let mut frame = i.to_le_bytes().to_vec();
            frame.resize(512, (i % 251) as u8);
            frame
        })
        .collect();
    for (i, frame) in frames.iter().enumerate() {
        client.send(Message::Binary(frame.clone())).await.unwrap();
        if i % 500 == 0 {
            client
                .send(Message::Text("keepalive".to_string()))
                .await
                .unwrap();
        }
    }
    client.close(None).await.unwrap();

    wait_until(|| {
        server
            .output
            .sinks()
            .first()
            .is_some_and(|log| log.close_calls() == 1)
    })
    .await;

    let log = &server.output.sinks()[0];
    assert_eq!(log.frames(), frames);
    assert_eq!(log.stop_calls(), 1);
    assert_eq!(log.close_calls(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_abrupt_disconnect_only_ends_that_session() {
    let server = TestServer::with_devices(&["Speakers", "Headphones"]).await;

    let mut dropped = server.connect().await;
    dropped.send(config_message(48000, 2, 4, 256)).await.unwrap();
    expect_devices(&mut dropped).await;
    dropped.send(select_message(json!(0))).await.unwrap();
    wait_until(|| server.output.sinks().len() == 1).await;

    let mut healthy = server.connect().await;
    healthy.send(config_message(48000, 2, 4, 256)).await.unwrap();
    expect_devices(&mut healthy).await;
    healthy.send(select_message(json!(1))).await.unwrap();
    wait_until(|| server.output.sinks().len() == 2).await;

    dropped.send(Message::Binary(vec![1u8; 64])).await.unwrap();
    healthy.send(Message::Binary(vec![2u8; 64])).await.unwrap();

    // No closing handshake: the TCP connection just goes away
    drop(dropped);

    let dropped_log = server.output.sinks()[0].clone();
    wait_until(|| dropped_log.close_calls() == 1).await;
    assert_eq!(dropped_log.stop_calls(), 1);
    assert_eq!(dropped_log.frame_count(), 1);

    for _ in 0..10 {
        healthy.send(Message::Binary(vec![3u8; 64])).await.unwrap();
    }
    healthy.close(None).await.unwrap();

    let healthy_log = server.output.sinks()[1].clone();
    wait_until(|| healthy_log.close_calls() == 1).await;
    assert_eq!(healthy_log.frame_count(), 11);
    assert_eq!(healthy_log.stop_calls(), 1);
    assert_eq!(dropped_log.close_calls(), 1);

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_sessions_stream_independently() {
    let server = TestServer::with_devices(&["Speakers", "Headphones"]).await;
    let mut first = server.connect().await;
    let mut second = server.connect().await;

    first.send(config_message(48000, 1, 1, 64)).await.unwrap();
    second.send(config_message(44100, 2, 2, 64)).await.unwrap();
    expect_devices(&mut first).await;
    expect_devices(&mut second).await;

    first.send(select_message(json!(0))).await.unwrap();
    wait_until(|| server.output.sinks().len() == 1).await;
    second.send(select_message(json!(1))).await.unwrap();
    wait_until(|| server.output.sinks().len() == 2).await;

    for i in 0u8..50 {
        first.send(Message::Binary(vec![i; 16])).await.unwrap();
        second.send(Message::Binary(vec![i.wrapping_add(100); 32])).await.unwrap();
    }
    first.close(None).await.unwrap();
    second.close(None).await.unwrap();

    let logs = server.output.sinks();
    wait_until(|| logs.iter().all(|log| log.close_calls() == 1)).await;

    let expected_first: Vec<Vec<u8>> = (0u8..50).map(|i| vec![i; 16]).collect();
    let expected_second: Vec<Vec<u8>> = (0u8..50).map(|i| vec![i.wrapping_add(100); 32]).collect();
    assert_eq!(logs[0].frames(), expected_first);
    assert_eq!(logs[1].frames(), expected_second);

    server.stop().await;
}

#[tokio::test]
async fn test_server_stop_releases_streaming_sessions() {
    let server = TestServer::with_devices(&["Speakers"]).await;
    let mut client = server.connect().await;

    client.send(config_message(48000, 2, 2, 256)).await.unwrap();
    expect_devices(&mut client).await;
    client.send(select_message(json!(0))).await.unwrap();
    wait_until(|| server.output.sinks().len() == 1).await;

    let log = server.output.sinks()[0].clone();
    server.stop().await;

    assert_eq!(log.stop_calls(), 1);
    assert_eq!(log.close_calls(), 1);
}
