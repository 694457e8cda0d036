use std::collections::VecDeque;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use tracing::{debug, trace, warn};

use crate::codec::{FrameDecoder, Incoming};
use crate::errors::{ProtocolError, WsError};
use crate::frame::{OpCode, OwnedFrame};
use crate::protocol::{self, close_code, Mode};
use crate::stream::WsStream;

/// largest payload carried by one outgoing data frame; bigger messages
/// are fragmented
const SEND_MTU: usize = 32 * 1024;
/// nap between ticks that made no progress
const TICK_NAP: Duration = Duration::from_millis(10);
/// how long teardown waits for the peer's close reply
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const READ_CHUNK: usize = 4096;

/// Worker state progression. The worker owns every transition except
/// `Idle -> Disconnect` and `* -> End`, which the handle takes when the
/// caller releases the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    ConnectToHost,
    SendHandshake,
    WaitHandshakeResponse,
    Idle,
    Disconnect,
    InformDisconnected,
    End,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// state visible to both the handle and the worker
struct Shared {
    command: Mutex<Command>,
    send_frames: Mutex<VecDeque<OwnedFrame>>,
    connected: AtomicBool,
    error: Mutex<Option<WsError>>,
}

impl Shared {
    /// Fragment a message into frames of at most [`SEND_MTU`] and queue
    /// them in order; never blocks on I/O. Frames queued before the
    /// handshake completes sit until the worker reaches steady state.
    fn enqueue_message(&self, code: OpCode, data: &[u8]) -> Result<(), WsError> {
        let mut queue = lock(&self.send_frames);
        let mut offset = 0;
        let mut first = true;
        loop {
            let end = usize::min(offset + SEND_MTU, data.len());
            let fin = end == data.len();
            let opcode = if first { code } else { OpCode::Continue };
            queue.push_back(OwnedFrame::new(
                fin,
                opcode,
                rand::random::<[u8; 4]>(),
                &data[offset..end],
            ));
            if fin {
                break;
            }
            first = false;
            offset = end;
        }
        Ok(())
    }
}

/// Cheap cloneable sending half of a connection. Every callback receives
/// one, so a handler can answer without access to the owning [`WsClient`].
#[derive(Clone)]
pub struct WsSender {
    shared: Arc<Shared>,
}

impl WsSender {
    /// queue a text message; returns without touching the network
    pub fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.shared.enqueue_message(OpCode::Text, text.as_bytes())
    }

    /// queue a binary message; returns without touching the network
    pub fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.shared.enqueue_message(OpCode::Binary, data)
    }

    /// true between a validated handshake and teardown
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

type OnConnected = Box<dyn FnMut(&WsSender) + Send>;
type OnDisconnected = Box<dyn FnMut(Option<&WsError>) + Send>;
type OnText = Box<dyn FnMut(&WsSender, &str) + Send>;
type OnBinary = Box<dyn FnMut(&WsSender, &[u8]) + Send>;

#[derive(Default)]
struct Callbacks {
    connected: Option<OnConnected>,
    disconnected: Option<OnDisconnected>,
    text: Option<OnText>,
    binary: Option<OnBinary>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("connected", &self.connected.is_some())
            .field("disconnected", &self.disconnected.is_some())
            .field("text", &self.text.is_some())
            .field("binary", &self.binary.is_some())
            .finish()
    }
}

/// Configuration for one connection: endpoint parts plus callback slots.
/// `on_disconnected` is the only mandatory callback.
#[derive(Default, Debug)]
pub struct ClientBuilder {
    scheme: Option<String>,
    host: Option<String>,
    port: u16,
    path: Option<String>,
    callbacks: Callbacks,
}

impl ClientBuilder {
    /// create an empty builder
    pub fn new() -> Self {
        Default::default()
    }

    /// populate scheme, host, port and path from a ws/wss uri in one go
    pub fn uri(mut self, uri: &str) -> Result<Self, WsError> {
        let uri: http::Uri = uri
            .parse()
            .map_err(|e: http::uri::InvalidUri| WsError::InvalidUri(e.to_string()))?;
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| WsError::InvalidUri("missing scheme".to_string()))?;
        let mode = Mode::from_scheme(scheme)?;
        let host = uri
            .host()
            .ok_or_else(|| WsError::InvalidUri("missing host".to_string()))?;
        self.scheme = Some(scheme.to_string());
        self.host = Some(host.to_string());
        self.port = uri.port_u16().unwrap_or_else(|| mode.default_port());
        let path = match uri.path() {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        self.path = Some(match uri.query() {
            Some(query) => format!("{path}?{query}"),
            None => path,
        });
        Ok(self)
    }

    /// set the uri scheme, `ws` or `wss`
    pub fn scheme(mut self, scheme: &str) -> Self {
        self.scheme = Some(scheme.to_string());
        self
    }

    /// set the host to connect to
    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    /// set the port to connect to
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// set the request path (with query, if any)
    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    /// called once on the worker thread after a validated handshake
    pub fn on_connected<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&WsSender) + Send + 'static,
    {
        self.callbacks.connected = Some(Box::new(callback));
        self
    }

    /// Called exactly once on the worker thread when the connection ends;
    /// receives the error that caused teardown, or `None` after a clean
    /// close. Mandatory.
    pub fn on_disconnected<F>(mut self, callback: F) -> Self
    where
        F: FnMut(Option<&WsError>) + Send + 'static,
    {
        self.callbacks.disconnected = Some(Box::new(callback));
        self
    }

    /// called on the worker thread for every complete text message; the
    /// payload is borrowed for the duration of the call
    pub fn on_received_text<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&WsSender, &str) + Send + 'static,
    {
        self.callbacks.text = Some(Box::new(callback));
        self
    }

    /// called on the worker thread for every complete binary message; the
    /// payload is borrowed for the duration of the call
    pub fn on_received_binary<F>(mut self, callback: F) -> Self
    where
        F: FnMut(&WsSender, &[u8]) + Send + 'static,
    {
        self.callbacks.binary = Some(Box::new(callback));
        self
    }

    /// Validate the configuration and spawn the worker. Fails fast,
    /// without starting anything, naming the first missing field; all
    /// later failures are reported through `on_disconnected`.
    pub fn connect(self) -> Result<WsClient, WsError> {
        if self.port == 0 {
            return Err(WsError::MissingParameter("port"));
        }
        let scheme = self.scheme.ok_or(WsError::MissingParameter("scheme"))?;
        let host = self.host.ok_or(WsError::MissingParameter("host"))?;
        let path = self.path.ok_or(WsError::MissingParameter("path"))?;
        if self.callbacks.disconnected.is_none() {
            return Err(WsError::MissingParameter("on_disconnected"));
        }
        let mode = Mode::from_scheme(&scheme)?;

        let shared = Arc::new(Shared {
            command: Mutex::new(Command::ConnectToHost),
            send_frames: Mutex::new(VecDeque::new()),
            connected: AtomicBool::new(false),
            error: Mutex::new(None),
        });
        let sender = WsSender {
            shared: Arc::clone(&shared),
        };
        let worker = Worker {
            shared,
            mode,
            host,
            port: self.port,
            path,
            callbacks: self.callbacks,
            sender: sender.clone(),
            stream: None,
            recv_buf: BytesMut::with_capacity(READ_CHUNK),
            write_buf: BytesMut::new(),
            decoder: FrameDecoder::default(),
            recvd_frames: VecDeque::new(),
            expected_accept: String::new(),
            peer_close_code: None,
            close_sent: false,
            close_received: false,
            close_deadline: None,
        };
        thread::Builder::new()
            .name("ws-conn".to_string())
            .spawn(move || worker.run())
            .map_err(|e| WsError::Unknown(format!("failed to spawn worker: {e}")))?;
        Ok(WsClient { sender })
    }
}

/// Handle to a live connection. Dropping it (or calling
/// [`WsClient::disconnect`]) releases the connection without blocking:
/// the worker sends a close frame if the handshake completed, finishes
/// teardown and fires `on_disconnected` on its own thread.
pub struct WsClient {
    sender: WsSender,
}

impl WsClient {
    /// queue a text message; returns without touching the network
    pub fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.sender.send_text(text)
    }

    /// queue a binary message; returns without touching the network
    pub fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.sender.send_binary(data)
    }

    /// true between a validated handshake and teardown
    pub fn is_connected(&self) -> bool {
        self.sender.is_connected()
    }

    /// Error that ended (or is ending) the connection, if any. Stable
    /// once `on_disconnected` has fired.
    pub fn last_error(&self) -> Option<WsError> {
        lock(&self.sender.shared.error).clone()
    }

    /// a sending half usable from other threads
    pub fn sender(&self) -> WsSender {
        self.sender.clone()
    }

    /// release the connection; equivalent to dropping the handle
    pub fn disconnect(self) {}
}

impl Drop for WsClient {
    fn drop(&mut self) {
        // Undelivered queued frames are discarded; frames already picked
        // up by the worker are flushed best-effort before the close.
        lock(&self.sender.shared.send_frames).clear();
        let mut cmd = lock(&self.sender.shared.command);
        match *cmd {
            Command::Idle => *cmd = Command::Disconnect,
            Command::Disconnect | Command::InformDisconnected | Command::End => {}
            // Released before the handshake finished: the worker winds
            // down without a close exchange or a disconnect callback.
            _ => *cmd = Command::End,
        }
    }
}

/// single-threaded connection driver; everything here runs on the worker
struct Worker {
    shared: Arc<Shared>,
    mode: Mode,
    host: String,
    port: u16,
    path: String,
    callbacks: Callbacks,
    sender: WsSender,
    stream: Option<WsStream>,
    recv_buf: BytesMut,
    write_buf: BytesMut,
    decoder: FrameDecoder,
    recvd_frames: VecDeque<Incoming>,
    expected_accept: String,
    peer_close_code: Option<u16>,
    close_sent: bool,
    close_received: bool,
    close_deadline: Option<Instant>,
}

impl Worker {
    fn run(mut self) {
        debug!("worker started for {}:{}{}", self.host, self.port, self.path);
        loop {
            let command = *lock(&self.shared.command);
            let progressed = match command {
                Command::ConnectToHost => self.connect_to_host(),
                Command::SendHandshake => self.send_handshake(),
                Command::WaitHandshakeResponse => self.wait_handshake_response(),
                Command::Idle => self.tick(),
                Command::Disconnect => self.drain_close(),
                Command::InformDisconnected => self.inform_disconnected(),
                Command::End => break,
            };
            if !progressed {
                thread::sleep(TICK_NAP);
            }
        }
        if let Some(stream) = self.stream.as_mut() {
            stream.shutdown();
        }
        debug!("worker finished");
    }

    /// move `from` to `to` unless the caller redirected the state machine
    /// in the meantime (release flips to Disconnect or End)
    fn advance(&self, from: Command, to: Command) {
        let mut cmd = lock(&self.shared.command);
        if *cmd == from {
            *cmd = to;
        }
    }

    /// record the error and go inform, skipping the close exchange
    fn fail(&mut self, err: WsError) {
        warn!("connection failed: {err}");
        *lock(&self.shared.error) = Some(err);
        if let Some(stream) = self.stream.as_mut() {
            stream.shutdown();
        }
        self.stream = None;
        let mut cmd = lock(&self.shared.command);
        if *cmd != Command::End {
            *cmd = Command::InformDisconnected;
        }
    }

    /// record a protocol violation, stage the failing close frame and go
    /// through the close exchange
    fn fail_protocol(&mut self, error: ProtocolError) {
        warn!("protocol violation: {error}");
        let close = if error == ProtocolError::InvalidUtf8 {
            close_code::INVALID_PAYLOAD
        } else {
            close_code::PROTOCOL_ERROR
        };
        if !self.close_sent {
            OwnedFrame::close_frame(rand::random::<[u8; 4]>(), close, &[])
                .write_to(&mut self.write_buf);
            self.close_sent = true;
        }
        *lock(&self.shared.error) = Some(WsError::ProtocolError {
            close_code: close,
            error,
        });
        let mut cmd = lock(&self.shared.command);
        if *cmd != Command::End {
            *cmd = Command::Disconnect;
        }
    }

    fn connect_to_host(&mut self) -> bool {
        debug!("connecting to {}:{}", self.host, self.port);
        match WsStream::connect(self.mode, &self.host, self.port) {
            Ok(stream) => {
                self.stream = Some(stream);
                match protocol::build_handshake_request(
                    self.mode,
                    &self.host,
                    self.port,
                    &self.path,
                ) {
                    Ok((accept, request)) => {
                        self.expected_accept = accept;
                        self.write_buf.extend_from_slice(request.as_bytes());
                        self.advance(Command::ConnectToHost, Command::SendHandshake);
                    }
                    Err(err) => self.fail(err),
                }
            }
            Err(err) => self.fail(err),
        }
        true
    }

    fn send_handshake(&mut self) -> bool {
        match self.flush_write_buf() {
            Ok(progressed) => {
                if self.write_buf.is_empty() {
                    debug!("handshake request sent");
                    self.advance(Command::SendHandshake, Command::WaitHandshakeResponse);
                    true
                } else {
                    progressed
                }
            }
            Err(err) => {
                self.fail(err);
                true
            }
        }
    }

    fn wait_handshake_response(&mut self) -> bool {
        match self.read_chunk() {
            Ok(false) => return false,
            Ok(true) => {}
            Err(err) => {
                self.fail(err);
                return true;
            }
        }
        match protocol::parse_handshake_response(&self.recv_buf) {
            Ok(None) => true,
            Ok(Some((resp, consumed))) => {
                match protocol::check_handshake_response(&resp, &self.expected_accept) {
                    Ok(()) => {
                        // whatever follows the blank line already belongs
                        // to the frame stream
                        self.recv_buf.advance(consumed);
                        self.shared.connected.store(true, Ordering::Release);
                        debug!("handshake complete");
                        if let Some(cb) = self.callbacks.connected.as_mut() {
                            cb(&self.sender);
                        }
                        self.advance(Command::WaitHandshakeResponse, Command::Idle);
                    }
                    Err(err) => self.fail(err),
                }
                true
            }
            Err(err) => {
                self.fail(err);
                true
            }
        }
    }

    /// one steady-state pass: read, decode, dispatch, flush sends
    fn tick(&mut self) -> bool {
        let mut progressed = false;
        match self.read_chunk() {
            Ok(read) => progressed |= read,
            Err(err) => {
                self.fail(err);
                return true;
            }
        }
        let mut decode_err = None;
        loop {
            match self.decoder.decode(&mut self.recv_buf) {
                Ok(Some(item)) => {
                    self.recvd_frames.push_back(item);
                    progressed = true;
                }
                Ok(None) => break,
                Err(err) => {
                    // frames decoded before the bad one are still delivered
                    decode_err = Some(err);
                    break;
                }
            }
        }
        while let Some(item) = self.recvd_frames.pop_front() {
            if let Err(err) = self.dispatch(item) {
                self.fail_protocol(err);
                return true;
            }
            if *lock(&self.shared.command) != Command::Idle {
                return true;
            }
        }
        if let Some(err) = decode_err {
            self.fail_protocol(err);
            return true;
        }
        match self.flush_sends() {
            Ok(wrote) => progressed |= wrote,
            Err(err) => {
                self.fail(err);
                return true;
            }
        }
        progressed
    }

    fn dispatch(&mut self, item: Incoming) -> Result<(), ProtocolError> {
        match item {
            Incoming::Ping(data) => {
                trace!("ping {} bytes, queueing pong", data.len());
                let pong = OwnedFrame::pong_frame(rand::random::<[u8; 4]>(), &data);
                // pong jumps the queue ahead of pending data frames
                lock(&self.shared.send_frames).push_front(pong);
            }
            Incoming::Pong(data) => {
                trace!("pong {} bytes ignored", data.len());
            }
            Incoming::Close { code, .. } => {
                debug!("close received from peer, code {code:?}");
                self.close_received = true;
                self.peer_close_code = code;
                let mut cmd = lock(&self.shared.command);
                if *cmd != Command::End {
                    *cmd = Command::Disconnect;
                }
            }
            Incoming::Message { code, data } => {
                if code == OpCode::Text {
                    let text =
                        std::str::from_utf8(&data).map_err(|_| ProtocolError::InvalidUtf8)?;
                    if let Some(cb) = self.callbacks.text.as_mut() {
                        cb(&self.sender, text);
                    }
                } else if let Some(cb) = self.callbacks.binary.as_mut() {
                    cb(&self.sender, &data);
                }
            }
        }
        Ok(())
    }

    /// teardown: make sure a close went out, wait briefly for the peer's
    /// close, then drop the transport
    fn drain_close(&mut self) -> bool {
        if self.stream.is_none() {
            self.advance(Command::Disconnect, Command::InformDisconnected);
            return true;
        }
        if self.close_deadline.is_none() {
            self.close_deadline = Some(Instant::now() + CLOSE_GRACE);
        }
        if !self.close_sent {
            let code = self.peer_close_code.unwrap_or(close_code::NORMAL);
            OwnedFrame::close_frame(rand::random::<[u8; 4]>(), code, &[])
                .write_to(&mut self.write_buf);
            self.close_sent = true;
            debug!("close frame staged, status {code}");
        }
        let mut progressed = self.flush_write_buf().unwrap_or(false);
        if !self.close_received {
            match self.read_chunk() {
                Ok(read) => {
                    progressed |= read;
                    loop {
                        match self.decoder.decode(&mut self.recv_buf) {
                            Ok(Some(Incoming::Close { code, .. })) => {
                                debug!("peer close reply received");
                                self.close_received = true;
                                if self.peer_close_code.is_none() {
                                    self.peer_close_code = code;
                                }
                                break;
                            }
                            // data arriving after our close is discarded
                            Ok(Some(_)) => continue,
                            Ok(None) => break,
                            Err(_) => {
                                self.close_received = true;
                                break;
                            }
                        }
                    }
                }
                Err(_) => self.close_received = true,
            }
        }
        let deadline_passed = self
            .close_deadline
            .map(|d| Instant::now() >= d)
            .unwrap_or(true);
        if (self.close_received && self.write_buf.is_empty()) || deadline_passed {
            if let Some(stream) = self.stream.as_mut() {
                stream.shutdown();
            }
            self.stream = None;
            self.advance(Command::Disconnect, Command::InformDisconnected);
            return true;
        }
        progressed
    }

    fn inform_disconnected(&mut self) -> bool {
        self.shared.connected.store(false, Ordering::Release);
        let error = lock(&self.shared.error).clone();
        debug!("disconnected, error: {error:?}");
        if let Some(cb) = self.callbacks.disconnected.as_mut() {
            cb(error.as_ref());
        }
        self.advance(Command::InformDisconnected, Command::End);
        true
    }

    /// pull one chunk off the transport into the receive buffer
    fn read_chunk(&mut self) -> Result<bool, WsError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(false);
        };
        let mut chunk = [0u8; READ_CHUNK];
        match stream.read(&mut chunk) {
            Ok(0) => Err(WsError::PeerClosed),
            Ok(n) => {
                self.recv_buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if e.kind() == IoErrorKind::WouldBlock => Ok(false),
            Err(e) if e.kind() == IoErrorKind::Interrupted => Ok(false),
            Err(e) => Err(WsError::RecvFailed(e.to_string())),
        }
    }

    /// serialise every queued frame behind the pending bytes, then write
    /// as much as the transport takes
    fn flush_sends(&mut self) -> Result<bool, WsError> {
        {
            let mut queue = lock(&self.shared.send_frames);
            while let Some(frame) = queue.pop_front() {
                frame.write_to(&mut self.write_buf);
            }
        }
        self.flush_write_buf()
    }

    fn flush_write_buf(&mut self) -> Result<bool, WsError> {
        if self.write_buf.is_empty() {
            return Ok(false);
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(WsError::SendFailed("transport closed".to_string()));
        };
        let mut progressed = false;
        while !self.write_buf.is_empty() {
            match stream.write(&self.write_buf) {
                Ok(0) => return Err(WsError::SendFailed("write returned zero".to_string())),
                Ok(n) => {
                    self.write_buf.advance(n);
                    progressed = true;
                }
                Err(e) if e.kind() == IoErrorKind::WouldBlock => break,
                Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
                Err(e) => return Err(WsError::SendFailed(e.to_string())),
            }
        }
        Ok(progressed)
    }
}
