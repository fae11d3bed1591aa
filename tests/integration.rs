//! Wire-level integration tests for procwire-dispatch.
//!
//! A raw peer speaks the frame protocol to a [`Server`] over an in-memory
//! duplex stream, so these tests pin down exactly which frames are sent.

use std::time::Duration;

use procwire_dispatch::codec::{Codec, Compression, MsgPackCodec};
use procwire_dispatch::protocol::{
    build_frame, flags, kind, CallHead, Frame, FrameBuffer, Header, Hello, Status, Trailer,
    DEFAULT_MAX_PAYLOAD_SIZE, INITIAL_WINDOW, PROTOCOL_VERSION,
};
use procwire_dispatch::{
    CallShape, ChunkStream, ClientStreamCommand, Command, Server, ServerStreamCommand,
};
use serde::{Deserialize, Serialize};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Upper {
    text: String,
}

impl Command for Upper {
    const NAME: &'static str = "text.upper";
    type Output = String;
}

#[derive(Serialize, Deserialize)]
struct Ticks {
    count: u32,
}

impl ServerStreamCommand for Ticks {
    const NAME: &'static str = "ticks";
    type Item = u32;
}

#[derive(Serialize, Deserialize)]
struct Total;

impl ClientStreamCommand for Total {
    const NAME: &'static str = "total";
    type Item = u64;
    type Output = u64;
}

#[derive(Serialize, Deserialize)]
struct Hang;

impl Command for Hang {
    const NAME: &'static str = "hang";
    type Output = ();
}

/// Raw protocol peer.
struct Peer {
    stream: DuplexStream,
    parser: FrameBuffer,
    queued: Vec<Frame>,
    codec: Codec,
}

impl Peer {
    async fn write(&mut self, kind: u8, flags: u8, call_id: u32, payload: &[u8]) {
        let header = Header::new(kind, flags, call_id, payload.len() as u32);
        self.stream
            .write_all(&build_frame(&header, payload))
            .await
            .unwrap();
    }

    async fn hello(&mut self, version: &str) {
        let payload = MsgPackCodec::encode(&Hello {
            version: version.to_string(),
            commands: vec![],
            max_payload_size: None,
        })
        .unwrap();
        self.write(kind::HELLO, 0, 0, &payload).await;
    }

    async fn open(&mut self, call_id: u32, name: &str, shape: CallShape) {
        let head = CallHead {
            path: format!("/{name}"),
            shape: Some(shape),
            ..Default::default()
        };
        let payload = MsgPackCodec::encode(&head).unwrap();
        self.write(kind::OPEN, 0, call_id, &payload).await;
    }

    async fn data<T: Serialize>(&mut self, call_id: u32, value: &T, end_stream: bool) {
        let encoded = self.codec.encode(value).unwrap();
        let mut frame_flags = if end_stream { flags::END_STREAM } else { 0 };
        if encoded.compressed {
            frame_flags |= flags::COMPRESSED;
        }
        self.write(kind::DATA, frame_flags, call_id, &encoded.bytes)
            .await;
    }

    /// Next frame, or `None` if nothing arrives within `wait`.
    async fn next_within(&mut self, wait: Duration) -> Option<Frame> {
        if !self.queued.is_empty() {
            return Some(self.queued.remove(0));
        }
        let mut buf = vec![0u8; 16 * 1024];
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let n = match tokio::time::timeout_at(deadline, self.stream.read(&mut buf)).await {
                Ok(read) => read.unwrap(),
                Err(_) => return None,
            };
            if n == 0 {
                return None;
            }
            self.queued.extend(self.parser.push(&buf[..n]).unwrap());
            if !self.queued.is_empty() {
                return Some(self.queued.remove(0));
            }
        }
    }

    async fn next(&mut self) -> Frame {
        self.next_within(Duration::from_secs(5))
            .await
            .expect("expected a frame")
    }

    async fn trailer(&mut self) -> Trailer {
        let frame = self.next().await;
        assert_eq!(frame.kind(), kind::TRAILER, "expected TRAILER");
        assert!(frame.is_end_stream());
        MsgPackCodec::decode(frame.payload()).unwrap()
    }
}

fn server() -> Server {
    Server::builder()
        .handle_fn::<Upper, _, _>(|cmd, ctx| async move {
            if cmd.text.is_empty() {
                ctx.add_field_error("text", "must not be empty");
            }
            Ok(cmd.text.to_uppercase())
        })
        .handle_server_stream_fn::<Ticks, _, _>(|cmd, mut sink, _ctx| async move {
            for i in 0..cmd.count {
                sink.send(i).await?;
            }
            Ok(())
        })
        // Answers without reading any input.
        .handle_client_stream_fn::<Total, _, _>(|_, _items: ChunkStream<u64>, _ctx| async move {
            Ok(7)
        })
        .handle_fn::<Hang, _, _>(|_, ctx| async move {
            ctx.cancelled().await;
            Ok(())
        })
        .build()
        .unwrap()
}

async fn connect(server: &Server) -> (Peer, JoinHandle<()>) {
    let (client, server_side) = duplex(256 * 1024);
    let server = server.clone();
    let task = tokio::spawn(async move {
        let _ = server.serve_connection(server_side).await;
    });

    let mut peer = Peer {
        stream: client,
        parser: FrameBuffer::new(),
        queued: Vec::new(),
        codec: Codec::default(),
    };
    peer.hello(PROTOCOL_VERSION).await;
    (peer, task)
}

#[tokio::test]
async fn test_handshake_advertises_commands() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;

    let frame = peer.next().await;
    assert_eq!(frame.kind(), kind::HELLO);
    assert_eq!(frame.call_id(), 0);

    let hello: Hello = MsgPackCodec::decode(frame.payload()).unwrap();
    let names: Vec<_> = hello.commands.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["hang", "text.upper", "ticks", "total"]);
    assert_eq!(hello.commands[2].shape, CallShape::ServerStreaming);
    assert_eq!(hello.max_payload_size, Some(DEFAULT_MAX_PAYLOAD_SIZE));
}

#[tokio::test]
async fn test_version_mismatch_drops_connection() {
    let server = server();
    let (client, server_side) = duplex(4096);
    let mut peer = Peer {
        stream: client,
        parser: FrameBuffer::new(),
        queued: Vec::new(),
        codec: Codec::default(),
    };

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve_connection(server_side).await })
    };
    peer.hello("2.0.0").await;

    let result = serving.await.unwrap();
    assert!(result.is_err());
    assert!(peer.next_within(Duration::from_millis(100)).await.is_none());
}

#[tokio::test]
async fn test_unary_call_frames() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await; // HELLO

    peer.open(1, Upper::NAME, CallShape::Unary).await;
    peer.data(1, &Upper { text: "abc".into() }, true).await;

    let data = peer.next().await;
    assert!(data.is_data());
    assert_eq!(data.call_id(), 1);
    let value: String = peer.codec.decode_frame(&data).unwrap();
    assert_eq!(value, "ABC");

    let trailer = peer.trailer().await;
    assert_eq!(trailer.status, Status::Ok);
    assert!(trailer.errors.is_empty());
}

#[tokio::test]
async fn test_validation_errors_in_trailer() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    peer.open(3, Upper::NAME, CallShape::Unary).await;
    peer.data(3, &Upper { text: String::new() }, true).await;

    // No result frame on failure.
    let trailer = peer.trailer().await;
    assert_eq!(trailer.status, Status::ValidationFailed);
    assert_eq!(trailer.errors.field("text").unwrap(), ["must not be empty"]);
    assert_eq!(trailer.errors.len(), 1);
}

#[tokio::test]
async fn test_unknown_command_rejected() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    peer.open(5, "nobody.home", CallShape::Unary).await;
    let trailer = peer.trailer().await;
    assert_eq!(trailer.status, Status::Unregistered);
}

#[tokio::test]
async fn test_shape_mismatch_rejected() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    peer.open(7, Ticks::NAME, CallShape::Unary).await;
    let trailer = peer.trailer().await;
    assert_eq!(trailer.status, Status::BindingMismatch);
}

#[tokio::test]
async fn test_server_stream_frames_in_order() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    peer.open(9, Ticks::NAME, CallShape::ServerStreaming).await;
    peer.data(9, &Ticks { count: 20 }, true).await;

    for expected in 0..20u32 {
        let frame = peer.next().await;
        assert!(frame.is_data());
        let item: u32 = peer.codec.decode_frame(&frame).unwrap();
        assert_eq!(item, expected);
    }
    assert_eq!(peer.trailer().await.status, Status::Ok);
}

#[tokio::test]
async fn test_server_stream_waits_for_window() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    let count = INITIAL_WINDOW + 10;
    peer.open(9, Ticks::NAME, CallShape::ServerStreaming).await;
    peer.data(9, &Ticks { count }, true).await;

    for expected in 0..INITIAL_WINDOW {
        let frame = peer.next().await;
        let item: u32 = peer.codec.decode_frame(&frame).unwrap();
        assert_eq!(item, expected);
    }
    assert!(
        peer.next_within(Duration::from_millis(100)).await.is_none(),
        "server sent past the window"
    );

    peer.write(kind::WINDOW, 0, 9, &10u32.to_be_bytes()).await;
    for expected in INITIAL_WINDOW..count {
        let frame = peer.next().await;
        let item: u32 = peer.codec.decode_frame(&frame).unwrap();
        assert_eq!(item, expected);
    }
    assert_eq!(peer.trailer().await.status, Status::Ok);
}

#[tokio::test]
async fn test_client_stream_result_held_until_end_of_input() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    peer.open(11, Total::NAME, CallShape::ClientStreaming).await;
    peer.data(11, &Total, false).await;
    for i in 0..3u64 {
        peer.data(11, &i, false).await;
    }

    // The handler has already answered, but the input is still open.
    assert!(peer.next_within(Duration::from_millis(150)).await.is_none());

    peer.write(kind::DATA, flags::END_STREAM, 11, &[]).await;
    let data = peer.next().await;
    let total: u64 = peer.codec.decode_frame(&data).unwrap();
    assert_eq!(total, 7);
    assert_eq!(peer.trailer().await.status, Status::Ok);
}

#[tokio::test]
async fn test_cancel_sends_nothing_further() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    peer.open(13, Hang::NAME, CallShape::Unary).await;
    peer.data(13, &Hang, true).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    peer.write(kind::CANCEL, 0, 13, &[]).await;
    assert!(peer.next_within(Duration::from_millis(150)).await.is_none());

    // The connection is still usable.
    peer.open(15, Upper::NAME, CallShape::Unary).await;
    peer.data(15, &Upper { text: "ok".into() }, true).await;
    assert!(peer.next().await.is_data());
    assert_eq!(peer.trailer().await.status, Status::Ok);
}

#[tokio::test]
async fn test_deadline_in_call_head() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    let head = CallHead {
        path: format!("/{}", Hang::NAME),
        shape: Some(CallShape::Unary),
        timeout_ms: Some(30),
        ..Default::default()
    };
    let payload = MsgPackCodec::encode(&head).unwrap();
    peer.write(kind::OPEN, 0, 17, &payload).await;
    peer.data(17, &Hang, true).await;

    assert_eq!(peer.trailer().await.status, Status::DeadlineExceeded);
}

#[tokio::test]
async fn test_compressed_command_accepted() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    let text = "compress me ".repeat(100);
    peer.codec = Codec::new(Compression::deflate());
    peer.open(19, Upper::NAME, CallShape::Unary).await;
    peer.data(19, &Upper { text: text.clone() }, true).await;

    let data = peer.next().await;
    assert!(data.is_compressed());
    let value: String = peer.codec.decode_frame(&data).unwrap();
    assert_eq!(value, text.to_uppercase());
}

#[tokio::test]
async fn test_fragmented_writes_are_reassembled() {
    let server = server();
    let (mut peer, _task) = connect(&server).await;
    peer.next().await;

    let head = MsgPackCodec::encode(&CallHead {
        path: format!("/{}", Upper::NAME),
        shape: Some(CallShape::Unary),
        ..Default::default()
    })
    .unwrap();
    let command = MsgPackCodec::encode(&Upper { text: "split".into() }).unwrap();

    let mut bytes = build_frame(&Header::new(kind::OPEN, 0, 21, head.len() as u32), &head);
    bytes.extend(build_frame(
        &Header::new(kind::DATA, flags::END_STREAM, 21, command.len() as u32),
        &command,
    ));
    for chunk in bytes.chunks(3) {
        peer.stream.write_all(chunk).await.unwrap();
        peer.stream.flush().await.unwrap();
    }

    let data = peer.next().await;
    let value: String = peer.codec.decode_frame(&data).unwrap();
    assert_eq!(value, "SPLIT");
}

#[tokio::test]
async fn test_reserved_flags_drop_connection() {
    let server = server();
    let (mut peer, task) = connect(&server).await;
    peer.next().await;

    peer.write(kind::DATA, 0b1000_0000, 23, b"x").await;
    task.await.unwrap();
    assert!(peer.next_within(Duration::from_millis(50)).await.is_none());
}
