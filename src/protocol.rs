use std::collections::HashMap;

use sha1::Digest;

use crate::errors::WsError;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// close status codes this crate sends itself
pub mod close_code {
    /// 1000, normal closure
    pub const NORMAL: u16 = 1000;
    /// 1002, protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// 1007, payload inconsistent with message type (bad utf-8)
    pub const INVALID_PAYLOAD: u16 = 1007;
}

/// connection mode derived from the uri scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// plain tcp
    Ws,
    /// tcp wrapped in tls
    Wss,
}

impl Mode {
    /// map a scheme string to a mode, case-insensitively
    pub fn from_scheme(scheme: &str) -> Result<Self, WsError> {
        match scheme.to_lowercase().as_str() {
            "ws" => Ok(Mode::Ws),
            "wss" => Ok(Mode::Wss),
            s => Err(WsError::InvalidUri(format!("unknown scheme {s}"))),
        }
    }

    /// scheme string for this mode
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Ws => "ws",
            Mode::Wss => "wss",
        }
    }

    /// port implied when the uri does not name one
    pub fn default_port(&self) -> u16 {
        match self {
            Mode::Ws => 80,
            Mode::Wss => 443,
        }
    }
}

/// random 16-byte nonce, base64-encoded, for `Sec-WebSocket-Key`
pub fn gen_key() -> String {
    let r: [u8; 16] = rand::random();
    base64::encode(r)
}

/// `Sec-WebSocket-Accept` value a compliant server must answer `key` with:
/// base64(sha1(key || guid))
pub fn cal_accept_key(key: &str) -> String {
    let mut sha1 = sha1::Sha1::default();
    sha1.update(key.as_bytes());
    sha1.update(GUID);
    base64::encode(sha1.finalize())
}

/// Build the upgrade request for one connection attempt. Returns the
/// accept value the server is expected to echo and the request bytes.
pub(crate) fn build_handshake_request(
    mode: Mode,
    host: &str,
    port: u16,
    path: &str,
) -> Result<(String, String), WsError> {
    let key = gen_key();
    let accept = cal_accept_key(&key);
    let host_header = if port == mode.default_port() {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    let req = http::Request::builder()
        .uri(path)
        .header("Host", host_header)
        .header("Upgrade", "websocket")
        .header("Connection", "Upgrade")
        .header("Sec-WebSocket-Key", &key)
        .header("Sec-WebSocket-Version", "13")
        .header("Origin", format!("{}://{}", mode.as_str(), host))
        .body(())
        .map_err(|e| WsError::InvalidUri(e.to_string()))?;
    let headers = req
        .headers()
        .iter()
        .map(|(k, v)| format!("{}: {}", k, v.to_str().unwrap_or_default()))
        .collect::<Vec<String>>()
        .join("\r\n");
    let request = format!(
        "{} {} {:?}\r\n{}\r\n\r\n",
        http::Method::GET,
        path,
        http::Version::HTTP_11,
        headers
    );
    Ok((accept, request))
}

/// parsed upgrade response; header names are lowercased
#[derive(Debug)]
pub(crate) struct HandshakeResponse {
    /// minor http version as httparse reports it, `Some(1)` for HTTP/1.1
    pub version: Option<u8>,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

/// Try to parse a complete response off the front of `buf`. `Ok(None)`
/// until the terminating blank line has arrived; on success also returns
/// how many bytes the response occupied, so the caller can keep whatever
/// follows as the start of the frame stream.
pub(crate) fn parse_handshake_response(
    buf: &[u8],
) -> Result<Option<(HandshakeResponse, usize)>, WsError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    let consumed = match resp
        .parse(buf)
        .map_err(|e| WsError::ParseHandshake(e.to_string()))?
    {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(n) => n,
    };
    let status = resp
        .code
        .ok_or_else(|| WsError::ParseHandshake("no status code".to_string()))?;
    let mut parsed = HandshakeResponse {
        version: resp.version,
        status,
        headers: HashMap::new(),
    };
    for header in resp.headers.iter() {
        parsed.headers.insert(
            header.name.to_lowercase(),
            String::from_utf8_lossy(header.value).to_string(),
        );
    }
    Ok(Some((parsed, consumed)))
}

/// validate an upgrade response against the accept value we expect
pub(crate) fn check_handshake_response(
    resp: &HandshakeResponse,
    expect_accept: &str,
) -> Result<(), WsError> {
    // the upgrade is only defined for an HTTP/1.1 status line
    if resp.version != Some(1) {
        return Err(WsError::ParseHandshake(
            "expected an http/1.1 status line".to_string(),
        ));
    }
    if resp.status != 101 {
        return Err(WsError::NotSwitchingProtocols {
            status: resp.status,
        });
    }
    let upgraded = resp
        .headers
        .get("upgrade")
        .map(|v| v.to_lowercase() == "websocket")
        .unwrap_or_default();
    if !upgraded {
        return Err(WsError::ParseHandshake(
            "missing or invalid upgrade header".to_string(),
        ));
    }
    let connection_upgrade = resp
        .headers
        .get("connection")
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or_default();
    if !connection_upgrade {
        return Err(WsError::ParseHandshake(
            "missing or invalid connection header".to_string(),
        ));
    }
    match resp.headers.get("sec-websocket-accept") {
        None => Err(WsError::MissingSecAccept),
        Some(got) if got.trim() != expect_accept => Err(WsError::BadSecAccept {
            expect: expect_accept.to_string(),
            got: got.trim().to_string(),
        }),
        Some(_) => Ok(()),
    }
}
