//! Channel multiplexing tests between a client and a loopback server.

mod common;

use common::*;
use latch_platform::LatchError;
use latch_proto::ssh::connection::{exit_status_data, EXTENDED_DATA_STDERR};
use latch_proto::ssh::{ChannelEvent, ChannelState, State};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_channel_lifecycle() {
    let (client, server) = pair().await;
    let mut listener = server.accept_channels("session").unwrap();

    let server_task = tokio::spawn(async move {
        let channel = listener.accept().await.unwrap();
        channel.set_request_handler(|request_type, _| request_type == "exec");
        channel.write(b"ready").await.unwrap();

        let mut command = None;
        while command.is_none() {
            match channel.recv().await.unwrap().unwrap() {
                ChannelEvent::Request {
                    request_type, data, ..
                } if request_type == "exec" => command = Some(data),
                _ => {}
            }
        }
        channel.write(b"ran").await.unwrap();
        channel
            .send_request("exit-status", false, &exit_status_data(0))
            .await
            .unwrap();
        channel.eof().await.unwrap();
        channel.close().await.unwrap();
        while channel.recv().await.unwrap().is_some() {}
        (server, command.unwrap())
    });

    let channel = client.open_session_channel().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Open);
    assert_eq!(read_exact(&channel, 5).await, b"ready");

    assert!(!channel.send_request("env", true, b"").await.unwrap());
    assert!(channel.exec("ls -l").await.unwrap());

    let output = channel.read_to_end().await.unwrap();
    assert_eq!(output, b"ran");
    assert_eq!(channel.exit_status(), Some(0));
    assert!(channel.snapshot().eof_received);

    // The peer's CLOSE follows its EOF
    assert_eq!(channel.recv().await.unwrap(), Some(ChannelEvent::Closed));
    assert_eq!(channel.recv().await.unwrap(), None);
    assert_eq!(channel.state(), ChannelState::Closed);

    let (_server, command) = server_task.await.unwrap();
    let mut expected = (5u32).to_be_bytes().to_vec();
    expected.extend_from_slice(b"ls -l");
    assert_eq!(command, expected);
    assert!(eventually(|| client.channel_count() == 0).await);
}

#[tokio::test]
async fn test_exit_status_and_stderr() {
    let (client, server) = pair().await;
    let mut listener = server.accept_channels("session").unwrap();
    let _server_task = tokio::spawn(async move {
        let channel = listener.accept().await.unwrap();
        channel.write_extended(EXTENDED_DATA_STDERR, b"oops").await.unwrap();
        channel
            .send_request("exit-status", false, &exit_status_data(3))
            .await
            .unwrap();
        channel.close().await.unwrap();
        while channel.recv().await.unwrap().is_some() {}
        server
    });

    let channel = client.open_session_channel().await.unwrap();
    let mut stderr = Vec::new();
    let mut saw_request = false;
    while let Some(event) = channel.recv().await.unwrap() {
        match event {
            ChannelEvent::ExtendedData { code, data } if code == EXTENDED_DATA_STDERR => {
                stderr.extend_from_slice(&data)
            }
            ChannelEvent::Request {
                request_type,
                want_reply,
                ..
            } => {
                assert_eq!(request_type, "exit-status");
                assert!(!want_reply);
                saw_request = true;
            }
            _ => {}
        }
    }
    assert_eq!(stderr, b"oops");
    assert!(saw_request);
    assert_eq!(channel.exit_status(), Some(3));
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (client, server) = pair().await;
    let _echo = spawn_echo(&server);

    let channel = client.open_session_channel().await.unwrap();
    channel.write(b"hello").await.unwrap();
    assert_eq!(read_exact(&channel, 5).await, b"hello");

    channel.eof().await.unwrap();
    assert!(channel.write(b"late").await.is_err());
    assert_eq!(channel.read_to_end().await.unwrap(), b"");
}

#[tokio::test]
async fn test_writes_respect_peer_max_packet() {
    let (client, server) = pair_with(
        client_builder().build().unwrap(),
        server_builder()
            .with_channel_max_packet(16384)
            .build()
            .unwrap(),
    )
    .await;
    let mut listener = server.accept_channels("session").unwrap();

    let channel = client.open_session_channel().await.unwrap();
    assert_eq!(channel.snapshot().remote_max_packet, 16384);
    let inbound = listener.accept().await.unwrap();

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    channel.write(&data).await.unwrap();

    let mut received = Vec::new();
    while received.len() < data.len() {
        match inbound.recv().await.unwrap().unwrap() {
            ChannelEvent::Data(chunk) => {
                assert!(chunk.len() <= 16384);
                received.extend_from_slice(&chunk);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
    assert_eq!(received, data);
}

#[tokio::test]
async fn test_write_waits_for_window() {
    let (client, server) = pair_with(
        client_builder().build().unwrap(),
        server_builder()
            .with_channel_window(32768)
            .with_channel_max_packet(16384)
            .build()
            .unwrap(),
    )
    .await;
    let mut listener = server.accept_channels("session").unwrap();

    let channel = Arc::new(client.open_session_channel().await.unwrap());
    let inbound = listener.accept().await.unwrap();

    let writer = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move { channel.write(&vec![7u8; 100_000]).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!writer.is_finished());
    assert_eq!(channel.snapshot().remote_window, 0);
    assert_eq!(inbound.snapshot().local_window, 0);

    let received = read_exact(&inbound, 100_000).await;
    assert_eq!(received.len(), 100_000);
    assert!(received.iter().all(|&b| b == 7));
    writer.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_open_refused() {
    let (client, _server) = pair().await;

    let err = client
        .open_channel("direct-tcpip", b"")
        .await
        .unwrap_err();
    match err {
        LatchError::ChannelOpenFailed { reason, .. } => assert_eq!(reason, 1),
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(client.state(), State::Ready);
    assert_eq!(client.channel_count(), 0);
}

#[tokio::test]
async fn test_channel_ids_reused_after_close() {
    let (client, server) = pair().await;
    let _echo = spawn_echo(&server);

    let first = client.open_session_channel().await.unwrap();
    let second = client.open_session_channel().await.unwrap();
    assert_eq!(first.local_id(), 0);
    assert_eq!(second.local_id(), 1);

    first.close().await.unwrap();
    assert_ne!(first.state(), ChannelState::Open);
    while first.recv().await.unwrap().is_some() {}
    assert!(eventually(|| client.channel_count() == 1).await);

    let third = client.open_session_channel().await.unwrap();
    assert_eq!(third.local_id(), 0);
    assert!(first.write(b"stale").await.is_err());
}

#[tokio::test]
async fn test_concurrent_channels() {
    let (client, server) = pair().await;
    let _echo = spawn_echo(&server);
    let client = Arc::new(client);

    let mut tasks = Vec::new();
    for i in 0..8u8 {
        let client = Arc::clone(&client);
        tasks.push(tokio::spawn(async move {
            let channel = client.open_session_channel().await.unwrap();
            let data = vec![i; 50_000];
            channel.write(&data).await.unwrap();
            assert_eq!(read_exact(&channel, data.len()).await, data);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_open_timeout_leaves_session_usable() {
    let (a, b) = tokio::io::duplex(1 << 16);
    let (muted, mute) = Muted::new(a);
    let (client, server) = establish_pair(
        muted,
        b,
        client_builder()
            .with_channel_open_timeout(Duration::from_millis(200))
            .build()
            .unwrap(),
        server_builder().build().unwrap(),
    )
    .await;
    let client = client.unwrap();
    let _server = server.unwrap();

    mute.store(true, Ordering::SeqCst);
    let err = client.open_session_channel().await.unwrap_err();
    assert!(matches!(err, LatchError::Timeout(_)), "{:?}", err);
    assert_eq!(client.state(), State::Ready);
}

#[tokio::test]
async fn test_session_loss_fails_channels() {
    let (client, server) = pair().await;
    let _echo = spawn_echo(&server);
    let channel = client.open_session_channel().await.unwrap();

    drop(server);

    let err = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match channel.recv().await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("channel closed without an error"),
                Err(e) => return e,
            }
        }
    })
    .await
    .unwrap();
    assert!(matches!(err, LatchError::Terminated(_)), "{:?}", err);
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(matches!(
        channel.write(b"x").await.unwrap_err(),
        LatchError::Terminated(_)
    ));
}

#[tokio::test]
async fn test_server_opens_channel_to_client() {
    let (client, server) = pair().await;
    let mut listener = client.accept_channels("x-test@latch").unwrap();

    let opened = tokio::spawn(async move {
        let channel = server.open_channel("x-test@latch", b"extra").await.unwrap();
        channel.write(b"push").await.unwrap();
        channel.eof().await.unwrap();
        (server, channel)
    });

    let inbound = listener.accept().await.unwrap();
    assert_eq!(inbound.read_to_end().await.unwrap(), b"push");
    let _ = opened.await.unwrap();
}
