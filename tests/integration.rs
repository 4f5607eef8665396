//! End-to-end coverage driven over an in-memory `tokio::io::duplex` pipe,
//! exercising the connection driver the way the unit tests in
//! `connection.rs` do, but for scenarios that need either a second stream
//! or a hand-built (non-conformant) peer: flow-controlled backpressure,
//! HPACK state shared across streams, and header-validation failures that
//! a validating client would never let us send in the first place.

use bytes::Bytes;
use h2_core::connection::PREFACE;
use h2_core::frame::{self, Frame};
use h2_core::hpack;
use h2_core::settings::SettingsParameter;
use h2_core::{ClientRequest, Config, Connection, ErrorCode, HeaderField};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

fn req_headers(path: &'static str) -> Vec<HeaderField> {
    vec![
        HeaderField::new(Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
        HeaderField::new(Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
        HeaderField::new(Bytes::from_static(b":authority"), Bytes::from_static(b"example.com")),
        HeaderField::new(Bytes::from_static(b":path"), Bytes::from(path)),
    ]
}

/// Scenario: body upload under a small advertised `INITIAL_WINDOW_SIZE`
/// forces the writer to suspend mid-stream and resume once WINDOW_UPDATE
/// replenishes it, rather than ever exceeding the peer's window.
#[tokio::test]
async fn send_data_suspends_and_resumes_under_a_small_window() {
    let mut server_config = Config::server();
    server_config.local_settings.set(SettingsParameter::InitialWindowSize, 4096);

    let (client_io, server_io) = tokio::io::duplex(256 * 1024);
    let (client_res, server_res) =
        tokio::join!(Connection::open_client(client_io, Config::client()), Connection::open_server(server_io, server_config));
    let client = client_res.unwrap();
    let mut server = server_res.unwrap();

    // Larger than the server's advertised window: a naive writer that
    // ignored flow control would overrun it in a single DATA frame.
    let payload = Bytes::from(vec![b'x'; 20_000]);
    let payload_for_server = payload.clone();

    let server_task = tokio::spawn(async move {
        let mut req = server.accept().await.expect("request arrives");
        let body = req.body.read_to_end().await;
        assert_eq!(body.len(), payload_for_server.len());
        assert_eq!(body.as_ref(), payload_for_server.as_ref());
        req.handle
            .send_headers(
                vec![HeaderField::new(Bytes::from_static(b":status"), Bytes::from_static(b"200"))],
                true,
            )
            .unwrap();
        server
    });

    let mut headers = req_headers("/upload");
    headers.push(HeaderField::new(
        Bytes::from_static(b"content-length"),
        Bytes::from(payload.len().to_string()),
    ));

    let response = client
        .request(ClientRequest {
            headers,
            body: Some(payload),
            end_stream_after_headers: true,
        })
        .await
        .expect("response arrives despite the narrow window");

    assert_eq!(response.headers[0].value.as_ref(), b"200");
    let _server = server_task.await.unwrap();
}

/// Scenario: HPACK dynamic-table state (the shared encoder on the writer
/// side, the shared decoder on the reader side) persists across distinct
/// streams on the same connection, not just across calls within one.
#[tokio::test]
async fn hpack_dynamic_table_state_carries_across_streams() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_res, server_res) =
        tokio::join!(Connection::open_client(client_io, Config::client()), Connection::open_server(server_io, Config::server()));
    let client = client_res.unwrap();
    let mut server = server_res.unwrap();

    let server_task = tokio::spawn(async move {
        for _ in 0..2 {
            let mut req = server.accept().await.expect("request arrives");
            let _ = req.body.read_to_end().await;
            assert!(req.headers.iter().any(|f| f.name.as_ref() == b"x-session" && f.value.as_ref() == b"abc123"));
            req.handle
                .send_headers(
                    vec![HeaderField::new(Bytes::from_static(b":status"), Bytes::from_static(b"200"))],
                    true,
                )
                .unwrap();
        }
        server
    });

    for path in ["/first", "/second"] {
        let mut headers = req_headers(path);
        headers.push(HeaderField::new(Bytes::from_static(b"x-session"), Bytes::from_static(b"abc123")));
        let response = client
            .request(ClientRequest {
                headers,
                body: None,
                end_stream_after_headers: true,
            })
            .await
            .expect("response arrives");
        assert_eq!(response.headers[0].value.as_ref(), b"200");
    }

    let _server = server_task.await.unwrap();
}

/// Drives the server half of the startup handshake by hand so a test can
/// then send frames the validating `Connection::request` API would refuse
/// to build, the way an adversarial or buggy peer might.
async fn raw_handshake<S>(mut io: S) -> S
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    io.write_all(PREFACE).await.unwrap();
    frame::write_frame(&mut io, &Frame::Settings { ack: false, params: vec![] })
        .await
        .unwrap();

    // Server's initial SETTINGS, then its ack of ours.
    frame::read_frame(&mut io, 16_384).await.unwrap().unwrap().unwrap();
    let ack = frame::read_frame(&mut io, 16_384).await.unwrap().unwrap().unwrap();
    assert!(matches!(ack, Frame::Settings { ack: true, .. }));
    io
}

/// Scenario: a HEADERS block carrying an uppercase header name is a
/// PROTOCOL_ERROR scoped to that stream — the connection must survive and
/// keep serving other streams, not just one raw frame exchange.
#[tokio::test]
async fn uppercase_header_name_resets_only_its_stream() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let server_task = tokio::spawn(Connection::open_server(server_io, Config::server()));
    let mut raw = raw_handshake(client_io).await;

    let bad_headers = vec![
        HeaderField::new(Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
        HeaderField::new(Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
        HeaderField::new(Bytes::from_static(b":authority"), Bytes::from_static(b"example.com")),
        HeaderField::new(Bytes::from_static(b":path"), Bytes::from_static(b"/")),
        HeaderField::new(Bytes::from_static(b"Content-Type"), Bytes::from_static(b"text/plain")),
    ];
    let mut encoder = hpack::Encoder::default();
    let block = encoder.encode(&bad_headers);

    frame::write_frame(
        &mut raw,
        &Frame::Headers {
            stream_id: 1,
            end_stream: true,
            end_headers: true,
            priority: None,
            padded: None,
            header_block_fragment: block,
        },
    )
    .await
    .unwrap();

    let reset = loop {
        match frame::read_frame(&mut raw, 16_384).await.unwrap().unwrap().unwrap() {
            Frame::RstStream { stream_id, error_code } => break (stream_id, error_code),
            _ => continue,
        }
    };
    assert_eq!(reset, (1, ErrorCode::ProtocolError));

    // The connection itself is still alive: a second, well-formed stream
    // on the same wire still gets a response instead of a GOAWAY.
    let good_headers = req_headers("/fine");
    let mut encoder2 = hpack::Encoder::default();
    let good_block = encoder2.encode(&good_headers);
    frame::write_frame(
        &mut raw,
        &Frame::Headers {
            stream_id: 3,
            end_stream: true,
            end_headers: true,
            priority: None,
            padded: None,
            header_block_fragment: good_block,
        },
    )
    .await
    .unwrap();

    let mut server = server_task.await.unwrap().unwrap();
    let req = server.accept().await.expect("the second stream still arrives");
    assert_eq!(req.stream_id, 3);
    req.handle
        .send_headers(
            vec![HeaderField::new(Bytes::from_static(b":status"), Bytes::from_static(b"200"))],
            true,
        )
        .unwrap();

    let response = loop {
        match frame::read_frame(&mut raw, 16_384).await.unwrap().unwrap().unwrap() {
            Frame::Headers { stream_id: 3, .. } => break true,
            Frame::GoAway { .. } => panic!("connection went away after a stream-scoped error"),
            _ => continue,
        }
    };
    assert!(response);
}

/// Scenario: a server response closes with trailing headers rather than a
/// bare END_STREAM DATA frame; the client's `BodyReader::trailers` must
/// resolve with them once the body has been fully drained.
#[tokio::test]
async fn trailing_headers_are_delivered_after_the_body() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_res, server_res) =
        tokio::join!(Connection::open_client(client_io, Config::client()), Connection::open_server(server_io, Config::server()));
    let client = client_res.unwrap();
    let mut server = server_res.unwrap();

    let server_task = tokio::spawn(async move {
        let req = server.accept().await.expect("request arrives");
        req.handle
            .send_headers(
                vec![HeaderField::new(Bytes::from_static(b":status"), Bytes::from_static(b"200"))],
                false,
            )
            .unwrap();
        req.handle.send_data(Bytes::from_static(b"streamed"), false).await.unwrap();
        req.handle
            .send_trailers(vec![HeaderField::new(Bytes::from_static(b"x-checksum"), Bytes::from_static(b"deadbeef"))])
            .unwrap();
        server
    });

    let mut response = client
        .request(ClientRequest {
            headers: req_headers("/stream"),
            body: None,
            end_stream_after_headers: true,
        })
        .await
        .expect("response arrives");

    let body = response.body.read_to_end().await;
    assert_eq!(body.as_ref(), b"streamed");
    let trailers = response.body.trailers().await;
    assert_eq!(trailers.len(), 1);
    assert_eq!(trailers[0].name.as_ref(), b"x-checksum");
    assert_eq!(trailers[0].value.as_ref(), b"deadbeef");

    let _server = server_task.await.unwrap();
}

/// Scenario: the server promises a pushed resource alongside the requested
/// one; the client sees it through `accept_push`, with the promised
/// request headers attached to its PUSH_PROMISE and the actual response
/// arriving later as an ordinary HEADERS frame on the reserved stream.
#[tokio::test]
async fn a_pushed_response_is_delivered_with_its_promised_request() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_res, server_res) =
        tokio::join!(Connection::open_client(client_io, Config::client()), Connection::open_server(server_io, Config::server()));
    let mut client = client_res.unwrap();
    let mut server = server_res.unwrap();

    let server_task = tokio::spawn(async move {
        let req = server.accept().await.expect("request arrives");
        let pushed = req
            .handle
            .push_promise(vec![
                HeaderField::new(Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
                HeaderField::new(Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
                HeaderField::new(Bytes::from_static(b":authority"), Bytes::from_static(b"example.com")),
                HeaderField::new(Bytes::from_static(b":path"), Bytes::from_static(b"/style.css")),
            ])
            .expect("push is promised");
        pushed
            .send_headers(
                vec![HeaderField::new(Bytes::from_static(b":status"), Bytes::from_static(b"200"))],
                false,
            )
            .unwrap();
        pushed.send_data(Bytes::from_static(b"body{color:red}"), true).await.unwrap();

        req.handle
            .send_headers(
                vec![HeaderField::new(Bytes::from_static(b":status"), Bytes::from_static(b"200"))],
                true,
            )
            .unwrap();
        server
    });

    // The connection's reader/writer tasks run independently of this call,
    // so the PUSH_PROMISE lands in `push_rx` regardless of when we get
    // around to draining it below.
    let response = client
        .request(ClientRequest {
            headers: req_headers("/index.html"),
            body: None,
            end_stream_after_headers: true,
        })
        .await
        .expect("response arrives");
    assert_eq!(response.headers[0].value.as_ref(), b"200");

    let mut pushed = client.accept_push().await.expect("push arrives");
    assert!(pushed
        .request_headers
        .iter()
        .any(|f| f.name.as_ref() == b":path" && f.value.as_ref() == b"/style.css"));
    assert_eq!(pushed.response_headers[0].value.as_ref(), b"200");
    let pushed_body = pushed.body.read_to_end().await;
    assert_eq!(pushed_body.as_ref(), b"body{color:red}");

    let _server = server_task.await.unwrap();
}
