//! End-to-end scenarios against a hand-rolled in-process server speaking
//! raw RFC 6455, so every byte the client emits can be inspected.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::mpsc;
use std::time::Duration;

use ws_conn::protocol::cal_accept_key;
use ws_conn::{ClientBuilder, ErrorKind};

const TIMEOUT: Duration = Duration::from_secs(5);

fn read_until_blank_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while !buf.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte).unwrap();
        assert!(n > 0, "client hung up during handshake");
        buf.push(byte[0]);
    }
    String::from_utf8(buf).unwrap()
}

fn extract_key(request: &str) -> String {
    request
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim()
                .eq_ignore_ascii_case("sec-websocket-key")
                .then(|| value.trim().to_string())
        })
        .expect("no sec-websocket-key header in request")
}

fn accept_upgrade(stream: &mut TcpStream) {
    let request = read_until_blank_line(stream);
    assert!(request.starts_with("GET / HTTP/1.1\r\n"));
    let key = extract_key(&request);
    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        cal_accept_key(&key)
    );
    stream.write_all(response.as_bytes()).unwrap();
}

struct RawFrame {
    fin: bool,
    masked: bool,
    opcode: u8,
    payload: Vec<u8>,
}

fn read_frame(stream: &mut TcpStream) -> RawFrame {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    let fin = head[0] & 0x80 != 0;
    let opcode = head[0] & 0x0F;
    let masked = head[1] & 0x80 != 0;
    let mut len = (head[1] & 0x7F) as u64;
    if len == 126 {
        let mut ext = [0u8; 2];
        stream.read_exact(&mut ext).unwrap();
        len = u16::from_be_bytes(ext) as u64;
    } else if len == 127 {
        let mut ext = [0u8; 8];
        stream.read_exact(&mut ext).unwrap();
        len = u64::from_be_bytes(ext);
    }
    let mask = if masked {
        let mut key = [0u8; 4];
        stream.read_exact(&mut key).unwrap();
        Some(key)
    } else {
        None
    };
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).unwrap();
    if let Some(key) = mask {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i & 3];
        }
    }
    RawFrame {
        fin,
        masked,
        opcode,
        payload,
    }
}

fn write_frame(stream: &mut TcpStream, fin: bool, opcode: u8, payload: &[u8]) {
    let mut buf = Vec::new();
    buf.push(if fin { 0x80 } else { 0x00 } | opcode);
    if payload.len() <= 125 {
        buf.push(payload.len() as u8);
    } else if payload.len() <= 65535 {
        buf.push(126);
        buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        buf.push(127);
        buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }
    buf.extend_from_slice(payload);
    stream.write_all(&buf).unwrap();
}

/// bind an ephemeral port, run `server` against the first connection on
/// its own thread, return the port to dial
fn serve_once<F>(server: F) -> u16
where
    F: FnOnce(TcpStream) + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(TIMEOUT)).unwrap();
        server(stream);
    });
    port
}

fn builder_for(port: u16) -> ClientBuilder {
    ClientBuilder::new()
        .scheme("ws")
        .host("127.0.0.1")
        .port(port)
        .path("/")
}

#[test]
fn happy_handshake_then_graceful_close() {
    let (close_tx, close_rx) = mpsc::channel();
    let port = serve_once(move |mut stream| {
        accept_upgrade(&mut stream);
        let frame = read_frame(&mut stream);
        assert_eq!(frame.opcode, 0x8);
        assert!(frame.masked, "client close frame must be masked");
        let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        write_frame(&mut stream, true, 0x8, &frame.payload);
        close_tx.send(code).unwrap();
    });
    let (conn_tx, conn_rx) = mpsc::channel();
    let (disc_tx, disc_rx) = mpsc::channel();
    let client = builder_for(port)
        .on_connected(move |_| conn_tx.send(()).unwrap())
        .on_disconnected(move |err| disc_tx.send(err.cloned()).unwrap())
        .connect()
        .unwrap();
    conn_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(client.is_connected());
    client.disconnect();
    assert_eq!(close_rx.recv_timeout(TIMEOUT).unwrap(), 1000);
    let err = disc_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(err.is_none(), "clean close must not report an error: {err:?}");
}

#[test]
fn wrong_accept_fails_connection() {
    let port = serve_once(|mut stream| {
        let _ = read_until_blank_line(&mut stream);
        stream
            .write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\
                  Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBvbmU=\r\n\r\n",
            )
            .unwrap();
        // hold the socket until the client gives up on us
        let _ = stream.read(&mut [0u8; 16]);
    });
    let (disc_tx, disc_rx) = mpsc::channel();
    let client = builder_for(port)
        .on_connected(|_| panic!("must not connect on a bad accept"))
        .on_disconnected(move |err| disc_tx.send(err.cloned()).unwrap())
        .connect()
        .unwrap();
    let err = disc_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(err.kind(), ErrorKind::BadSecAccept);
    assert!(!client.is_connected());
}

#[test]
fn non_101_reports_http_status() {
    let port = serve_once(|mut stream| {
        let _ = read_until_blank_line(&mut stream);
        stream
            .write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        let _ = stream.read(&mut [0u8; 16]);
    });
    let (disc_tx, disc_rx) = mpsc::channel();
    let _client = builder_for(port)
        .on_disconnected(move |err| disc_tx.send(err.cloned()).unwrap())
        .connect()
        .unwrap();
    let err = disc_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(err.kind(), ErrorKind::NotSwitchingProtocols);
    assert_eq!(err.http_status(), Some(404));
}

#[test]
fn ping_answered_with_pong_without_callbacks() {
    let (pong_tx, pong_rx) = mpsc::channel();
    let port = serve_once(move |mut stream| {
        accept_upgrade(&mut stream);
        write_frame(&mut stream, true, 0x9, &[0xDE, 0xAD]);
        let frame = read_frame(&mut stream);
        pong_tx.send((frame.opcode, frame.masked, frame.payload)).unwrap();
        write_frame(&mut stream, true, 0x8, &1000u16.to_be_bytes());
        let _ = read_frame(&mut stream);
    });
    let (text_tx, text_rx) = mpsc::channel::<String>();
    let (bin_tx, bin_rx) = mpsc::channel::<Vec<u8>>();
    let (disc_tx, disc_rx) = mpsc::channel();
    let _client = builder_for(port)
        .on_received_text(move |_, text| text_tx.send(text.to_string()).unwrap())
        .on_received_binary(move |_, data| bin_tx.send(data.to_vec()).unwrap())
        .on_disconnected(move |_| disc_tx.send(()).unwrap())
        .connect()
        .unwrap();
    let (opcode, masked, payload) = pong_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(opcode, 0xA);
    assert!(masked, "client pong must be masked");
    assert_eq!(payload, vec![0xDE, 0xAD]);
    disc_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(text_rx.try_recv().is_err(), "ping must not reach callbacks");
    assert!(bin_rx.try_recv().is_err(), "ping must not reach callbacks");
}

#[test]
fn fragmented_text_reassembled() {
    let port = serve_once(|mut stream| {
        accept_upgrade(&mut stream);
        write_frame(&mut stream, false, 0x1, b"Hel");
        write_frame(&mut stream, false, 0x0, b"lo, ");
        write_frame(&mut stream, true, 0x0, b"world");
        let _ = stream.read(&mut [0u8; 16]);
    });
    let (text_tx, text_rx) = mpsc::channel();
    let _client = builder_for(port)
        .on_received_text(move |_, text| text_tx.send(text.to_string()).unwrap())
        .on_disconnected(|_| {})
        .connect()
        .unwrap();
    let text = text_rx.recv_timeout(TIMEOUT).unwrap();
    assert_eq!(text, "Hello, world");
    assert_eq!(text.len(), 12);
}

#[test]
fn residual_handshake_bytes_start_the_frame_stream() {
    let port = serve_once(|mut stream| {
        let request = read_until_blank_line(&mut stream);
        let key = extract_key(&request);
        // 101 response and the first frame arrive in one segment
        let mut bytes = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            cal_accept_key(&key)
        )
        .into_bytes();
        bytes.extend_from_slice(&[0x81, 0x05]);
        bytes.extend_from_slice(b"early");
        stream.write_all(&bytes).unwrap();
        let _ = stream.read(&mut [0u8; 16]);
    });
    let (text_tx, text_rx) = mpsc::channel();
    let _client = builder_for(port)
        .on_received_text(move |_, text| text_tx.send(text.to_string()).unwrap())
        .on_disconnected(|_| {})
        .connect()
        .unwrap();
    assert_eq!(text_rx.recv_timeout(TIMEOUT).unwrap(), "early");
}

#[test]
fn sends_transmitted_in_order() {
    const COUNT: usize = 20;
    let (order_tx, order_rx) = mpsc::channel();
    let port = serve_once(move |mut stream| {
        accept_upgrade(&mut stream);
        let mut seen = Vec::new();
        for _ in 0..COUNT {
            let frame = read_frame(&mut stream);
            assert_eq!(frame.opcode, 0x1);
            assert!(frame.fin);
            assert!(frame.masked);
            seen.push(String::from_utf8(frame.payload).unwrap());
        }
        order_tx.send(seen).unwrap();
    });
    let (conn_tx, conn_rx) = mpsc::channel();
    let client = builder_for(port)
        .on_connected(move |_| conn_tx.send(()).unwrap())
        .on_disconnected(|_| {})
        .connect()
        .unwrap();
    conn_rx.recv_timeout(TIMEOUT).unwrap();
    for i in 0..COUNT {
        client.send_text(&format!("msg-{i}")).unwrap();
    }
    let seen = order_rx.recv_timeout(TIMEOUT).unwrap();
    let expect: Vec<String> = (0..COUNT).map(|i| format!("msg-{i}")).collect();
    assert_eq!(seen, expect);
}

#[test]
fn sends_queued_before_handshake_are_delivered() {
    let (msg_tx, msg_rx) = mpsc::channel();
    let port = serve_once(move |mut stream| {
        accept_upgrade(&mut stream);
        let frame = read_frame(&mut stream);
        assert_eq!(frame.opcode, 0x1);
        msg_tx.send(String::from_utf8(frame.payload).unwrap()).unwrap();
    });
    let client = builder_for(port).on_disconnected(|_| {}).connect().unwrap();
    // queued immediately, delivered once the worker reaches steady state
    client.send_text("queued early").unwrap();
    assert_eq!(msg_rx.recv_timeout(TIMEOUT).unwrap(), "queued early");
}

#[test]
fn server_initiated_close_echoed_with_peer_code() {
    let (echo_tx, echo_rx) = mpsc::channel();
    let port = serve_once(move |mut stream| {
        accept_upgrade(&mut stream);
        write_frame(&mut stream, true, 0x8, &1001u16.to_be_bytes());
        let frame = read_frame(&mut stream);
        assert_eq!(frame.opcode, 0x8);
        let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        echo_tx.send(code).unwrap();
    });
    let (disc_tx, disc_rx) = mpsc::channel();
    let _client = builder_for(port)
        .on_disconnected(move |err| disc_tx.send(err.cloned()).unwrap())
        .connect()
        .unwrap();
    assert_eq!(echo_rx.recv_timeout(TIMEOUT).unwrap(), 1001);
    let err = disc_rx.recv_timeout(TIMEOUT).unwrap();
    assert!(err.is_none(), "peer-initiated close is clean: {err:?}");
}

#[test]
fn invalid_utf8_text_fails_with_1007() {
    let (close_tx, close_rx) = mpsc::channel();
    let port = serve_once(move |mut stream| {
        accept_upgrade(&mut stream);
        write_frame(&mut stream, true, 0x1, &[0xC3, 0x28]);
        let frame = read_frame(&mut stream);
        assert_eq!(frame.opcode, 0x8);
        let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        close_tx.send(code).unwrap();
    });
    let (text_tx, text_rx) = mpsc::channel::<String>();
    let (disc_tx, disc_rx) = mpsc::channel();
    let _client = builder_for(port)
        .on_received_text(move |_, text| text_tx.send(text.to_string()).unwrap())
        .on_disconnected(move |err| disc_tx.send(err.cloned()).unwrap())
        .connect()
        .unwrap();
    assert_eq!(close_rx.recv_timeout(TIMEOUT).unwrap(), 1007);
    let err = disc_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(text_rx.try_recv().is_err(), "bad text must not reach callbacks");
}

#[test]
fn malformed_frame_fails_with_1002() {
    let (close_tx, close_rx) = mpsc::channel();
    let port = serve_once(move |mut stream| {
        accept_upgrade(&mut stream);
        // reserved bits set
        stream.write_all(&[0xF1, 0x02, b'h', b'i']).unwrap();
        let frame = read_frame(&mut stream);
        assert_eq!(frame.opcode, 0x8);
        let code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        close_tx.send(code).unwrap();
    });
    let (disc_tx, disc_rx) = mpsc::channel();
    let _client = builder_for(port)
        .on_disconnected(move |err| disc_tx.send(err.cloned()).unwrap())
        .connect()
        .unwrap();
    assert_eq!(close_rx.recv_timeout(TIMEOUT).unwrap(), 1002);
    let err = disc_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(err.kind(), ErrorKind::FrameParse);
}

#[test]
fn connect_refused_reports_connect_failed() {
    // bind then drop, so the port is very likely unused
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let (disc_tx, disc_rx) = mpsc::channel();
    let _client = builder_for(port)
        .on_disconnected(move |err| disc_tx.send(err.cloned()).unwrap())
        .connect()
        .unwrap();
    let err = disc_rx.recv_timeout(TIMEOUT).unwrap().unwrap();
    assert_eq!(err.kind(), ErrorKind::ConnectFailed);
}

#[test]
fn callbacks_can_reply_through_the_sender() {
    let (reply_tx, reply_rx) = mpsc::channel();
    let port = serve_once(move |mut stream| {
        accept_upgrade(&mut stream);
        write_frame(&mut stream, true, 0x1, b"marco");
        let frame = read_frame(&mut stream);
        reply_tx.send(String::from_utf8(frame.payload).unwrap()).unwrap();
    });
    let _client = builder_for(port)
        .on_received_text(|conn, text| {
            if text == "marco" {
                conn.send_text("polo").unwrap();
            }
        })
        .on_disconnected(|_| {})
        .connect()
        .unwrap();
    assert_eq!(reply_rx.recv_timeout(TIMEOUT).unwrap(), "polo");
}
