//! Frame codec tests: kinds, limits, and malformed input.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use live_harness::engine::{CheckpointDecision, RunStatus, TimeFlow};
use live_harness::target::InputEvent;
use live_harness::wire::codec::MAX_HANDSHAKE_FRAME_BYTES;
use live_harness::wire::messages::{
    Catalog, CheckpointAnswer, CheckpointPrompt, CodeImage, EntryPointInfo, Hello, HelloAck,
    HelloNack, ListCatalog, LoadFailed, LogLevel, RunEntryPoint, RunResult, RunStarted,
    SimulateInput, StopRun,
};
use live_harness::wire::{FrameCodec, FrameKind, Message, PROTOCOL_VERSION};
use live_harness::AppError;

const FULL_LIMIT: usize = 4 * 1024 * 1024;

fn one_of_each() -> Vec<Message> {
    vec![
        Hello {
            protocol_version: PROTOCOL_VERSION,
            client: "ctl".into(),
            token: "s3cret".into(),
        }
        .into(),
        HelloAck {
            session_id: "sess".into(),
            server: "live-harness/test".into(),
        }
        .into(),
        HelloNack {
            reason: "invalid token".into(),
        }
        .into(),
        CodeImage {
            image: vec![1, 2, 3],
            symbols: Some(vec![4]),
        }
        .into(),
        Catalog {
            image: "smoke".into(),
            digest: "ab".repeat(32),
            entries: vec![EntryPointInfo {
                index: 0,
                type_name: "MainMenu".into(),
                method: "opens".into(),
                summary: "main menu opens".into(),
                order: -1000,
            }],
            skipped: vec!["type Broken: unresolved dependency 'x'".into()],
        }
        .into(),
        LoadFailed {
            reason: "bad magic".into(),
        }
        .into(),
        ListCatalog.into(),
        RunEntryPoint {
            index: 0,
            time_flow: TimeFlow::Accelerated { scale: 2.5 },
        }
        .into(),
        RunStarted {
            run_id: "run".into(),
            entry: "MainMenu.opens".into(),
        }
        .into(),
        StopRun {
            run_id: "run".into(),
        }
        .into(),
        RunResult {
            run_id: "run".into(),
            entry: "MainMenu.opens".into(),
            status: RunStatus::OperatorAbort,
            completed: false,
            duration_ms: 1500,
            message: Some("aborted".into()),
            started_at: "2026-01-01T00:00:00Z".into(),
            finished_at: "2026-01-01T00:00:01.5Z".into(),
        }
        .into(),
        Message::log(Some("run"), LogLevel::Warn, "careful"),
        CheckpointPrompt {
            run_id: "run".into(),
            prompt_id: "prompt".into(),
            message: "continue?".into(),
            choices: vec![CheckpointDecision::Retry, CheckpointDecision::Abort],
        }
        .into(),
        CheckpointAnswer {
            prompt_id: "prompt".into(),
            decision: CheckpointDecision::Pause,
        }
        .into(),
        SimulateInput {
            event: InputEvent::Click {
                element: "play".into(),
            },
        }
        .into(),
        Message::disconnect("bye"),
    ]
}

fn frame_with_body(body: &[u8]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32(u32::try_from(body.len()).expect("small body"));
    buf.extend_from_slice(body);
    buf
}

#[test]
fn every_kind_survives_a_stream_of_frames() {
    let messages = one_of_each();
    let mut kinds: Vec<u8> = messages.iter().map(|m| m.kind().as_byte()).collect();
    kinds.dedup();
    assert_eq!(kinds.len(), 16, "one message per frame kind");

    let mut codec = FrameCodec::upgraded(FULL_LIMIT);
    let mut buf = BytesMut::new();
    for message in &messages {
        codec.encode(message.clone(), &mut buf).expect("encode");
    }

    let mut decoded = Vec::new();
    while let Some(message) = codec.decode(&mut buf).expect("decode") {
        decoded.push(message);
    }
    assert_eq!(decoded, messages);
    assert!(buf.is_empty());
}

#[test]
fn frame_split_across_reads_waits_for_the_rest() {
    let mut codec = FrameCodec::new(FULL_LIMIT);
    let mut encoded = BytesMut::new();
    codec
        .encode(Message::disconnect("later"), &mut encoded)
        .expect("encode");

    let mut buf = BytesMut::new();
    let (last, head) = encoded.split_last().expect("non-empty frame");
    for byte in head {
        buf.put_u8(*byte);
        assert!(codec.decode(&mut buf).expect("partial").is_none());
    }
    buf.put_u8(*last);
    assert_eq!(
        codec.decode(&mut buf).expect("complete"),
        Some(Message::disconnect("later"))
    );
}

#[test]
fn oversized_frame_is_rejected_before_the_handshake() {
    let mut codec = FrameCodec::new(FULL_LIMIT);
    assert_eq!(codec.max_frame_length(), MAX_HANDSHAKE_FRAME_BYTES);

    let mut buf = BytesMut::new();
    buf.put_u32(u32::try_from(MAX_HANDSHAKE_FRAME_BYTES + 1).expect("fits"));
    buf.put_u8(FrameKind::CodeImage.as_byte());

    let err = codec.decode(&mut buf).expect_err("too large");
    assert!(matches!(err, AppError::Protocol(_)));
    assert!(err.to_string().contains("frame too large"), "{err}");
}

#[test]
fn upgrade_lifts_the_limit() {
    let mut codec = FrameCodec::new(FULL_LIMIT);
    codec.upgrade();
    assert_eq!(codec.max_frame_length(), FULL_LIMIT);

    let mut buf = BytesMut::new();
    buf.put_u32(u32::try_from(MAX_HANDSHAKE_FRAME_BYTES + 1).expect("fits"));
    buf.put_u8(FrameKind::CodeImage.as_byte());
    assert!(codec.decode(&mut buf).expect("within limit").is_none());
}

#[test]
fn encoder_enforces_the_same_limit() {
    let mut codec = FrameCodec::new(FULL_LIMIT);
    let image = CodeImage {
        image: vec![0; MAX_HANDSHAKE_FRAME_BYTES + 16],
        symbols: None,
    };
    let mut buf = BytesMut::new();
    let err = codec
        .encode(Message::from(image.clone()), &mut buf)
        .expect_err("too large before handshake");
    assert!(matches!(err, AppError::Protocol(_)));

    codec.upgrade();
    codec
        .encode(Message::from(image), &mut buf)
        .expect("fits after upgrade");
}

#[test]
fn empty_frame_is_a_protocol_error() {
    let mut codec = FrameCodec::new(FULL_LIMIT);
    let mut buf = frame_with_body(&[]);
    let err = codec.decode(&mut buf).expect_err("empty");
    assert_eq!(err.to_string(), "protocol: empty frame");
}

#[test]
fn unknown_kind_is_a_protocol_error() {
    let mut codec = FrameCodec::new(FULL_LIMIT);
    let mut buf = frame_with_body(&[99, 0, 0]);
    let err = codec.decode(&mut buf).expect_err("unknown kind");
    assert_eq!(err.to_string(), "protocol: unknown frame kind 99");
}

#[test]
fn trailing_payload_bytes_are_rejected() {
    let mut encoded = BytesMut::new();
    FrameCodec::new(FULL_LIMIT)
        .encode(Message::disconnect("x"), &mut encoded)
        .expect("encode");

    let mut body = encoded[4..].to_vec();
    body.push(0xff);
    let mut buf = frame_with_body(&body);

    let err = FrameCodec::new(FULL_LIMIT)
        .decode(&mut buf)
        .expect_err("trailing byte");
    assert!(err.to_string().starts_with("protocol: malformed payload"), "{err}");
}

#[test]
fn truncated_payload_is_rejected() {
    let mut buf = frame_with_body(&[FrameKind::RunStarted.as_byte(), 1, 0]);
    let err = FrameCodec::new(FULL_LIMIT)
        .decode(&mut buf)
        .expect_err("truncated");
    assert!(matches!(err, AppError::Protocol(_)));
}

#[test]
fn eof_inside_a_frame_is_a_network_error() {
    let mut codec = FrameCodec::new(FULL_LIMIT);
    let mut buf = BytesMut::new();
    buf.put_u32(100);
    buf.extend_from_slice(&[FrameKind::Log.as_byte(), 1, 2]);

    let err = codec.decode_eof(&mut buf).expect_err("partial frame");
    assert!(matches!(err, AppError::Network(_)), "{err}");

    let mut empty = BytesMut::new();
    assert!(codec.decode_eof(&mut empty).expect("clean eof").is_none());
}
