//! Session teardown paths and isolation between sessions.

use bytes::BytesMut;
use futures_util::StreamExt;
use live_harness::wire::handshake;
use live_harness::wire::messages::HelloAck;
use live_harness::wire::{FrameCodec, Message};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::codec::{Encoder, FramedRead};

use super::test_helpers::{TestHost, MAX_FRAME_BYTES, TOKEN, WAIT};

#[tokio::test]
async fn socket_closed_mid_frame_removes_the_session() {
    let harness = TestHost::start().await;
    let mut stream = TcpStream::connect(harness.addr()).await.expect("connect");

    let mut hello = BytesMut::new();
    FrameCodec::new(MAX_FRAME_BYTES)
        .encode(
            Message::from(handshake::client_hello("flaky", TOKEN)),
            &mut hello,
        )
        .expect("encode hello");
    stream.write_all(&hello).await.expect("send hello");

    {
        let mut reader = FramedRead::new(&mut stream, FrameCodec::new(MAX_FRAME_BYTES));
        let ack = tokio::time::timeout(WAIT, reader.next())
            .await
            .expect("ack in time")
            .expect("ack frame")
            .expect("decodes");
        assert!(matches!(ack, Message::HelloAck(_)));
    }
    harness.wait_for_sessions(1).await;

    // Length prefix promises 100 bytes; only three arrive before the close.
    stream
        .write_all(&[0, 0, 0, 100, 30, 1, 2])
        .await
        .expect("write partial frame");
    drop(stream);

    harness.wait_for_sessions(0).await;
    assert!(harness.host.abort_reason().is_none());

    // The host keeps accepting.
    let client = harness.connect().await;
    client.disconnect("done").await.expect("disconnect");
    harness.shutdown().await;
}

#[tokio::test]
async fn client_disconnect_removes_the_session() {
    let harness = TestHost::start().await;
    let first = harness.connect().await;
    let second = harness.connect().await;
    harness.wait_for_sessions(2).await;

    first.disconnect("bye").await.expect("disconnect");
    harness.wait_for_sessions(1).await;

    second.disconnect("bye").await.expect("disconnect");
    harness.wait_for_sessions(0).await;
    harness.shutdown().await;
}

#[tokio::test]
async fn abrupt_close_removes_the_session() {
    let harness = TestHost::start().await;
    let client = harness.connect().await;
    harness.wait_for_sessions(1).await;

    drop(client);
    harness.wait_for_sessions(0).await;
    assert!(harness.host.abort_reason().is_none());
    harness.shutdown().await;
}

#[tokio::test]
async fn protocol_violation_only_ends_the_offending_session() {
    let harness = TestHost::start().await;
    let mut rogue = harness.connect().await;
    let mut healthy = harness.connect().await;
    healthy
        .push_image(super::test_helpers::menu_image(), None)
        .await
        .expect("load");

    rogue
        .send(HelloAck {
            session_id: "fake".into(),
            server: "fake".into(),
        })
        .await
        .expect("send");
    match rogue.recv_timeout(WAIT).await.expect("disconnect frame") {
        Message::Disconnect(d) => {
            assert!(d.reason.contains("unexpected HelloAck frame"), "{}", d.reason);
        }
        other => panic!("expected disconnect, got {other:?}"),
    }
    assert!(rogue.recv().await.expect("clean close").is_none());

    harness.wait_for_sessions(1).await;
    let catalog = healthy.list_catalog().await.expect("still served");
    assert_eq!(catalog.entries.len(), 2);
    assert!(harness.host.abort_reason().is_none());

    healthy.disconnect("done").await.expect("disconnect");
    harness.shutdown().await;
}

#[tokio::test]
async fn second_hello_is_a_protocol_violation() {
    let harness = TestHost::start().await;
    let mut client = harness.connect().await;

    client
        .send(handshake::client_hello("again", TOKEN))
        .await
        .expect("send");
    match client.recv_timeout(WAIT).await.expect("disconnect frame") {
        Message::Disconnect(d) => assert!(d.reason.contains("Hello received after handshake")),
        other => panic!("expected disconnect, got {other:?}"),
    }
    harness.wait_for_sessions(0).await;
    harness.shutdown().await;
}

#[tokio::test]
async fn simulated_input_reaches_the_target() {
    use live_harness::target::InputEvent;
    use live_harness::wire::messages::SimulateInput;

    let harness = TestHost::start().await;
    let mut client = harness.connect().await;

    client
        .send(SimulateInput {
            event: InputEvent::KeyDown {
                key: "space".into(),
            },
        })
        .await
        .expect("send input");
    client
        .send(SimulateInput {
            event: InputEvent::Click {
                element: "missing".into(),
            },
        })
        .await
        .expect("send click");

    match client.recv_timeout(WAIT).await.expect("warning") {
        Message::Log(log) => assert!(log.line.contains("'missing' is not clickable")),
        other => panic!("expected log, got {other:?}"),
    }
    assert_eq!(harness.target.held_keys(), vec!["space"]);

    client.disconnect("done").await.expect("disconnect");
    harness.shutdown().await;
}
