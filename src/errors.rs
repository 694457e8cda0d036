use thiserror::Error;

use crate::frame::OpCode;

/// Flat error-code taxonomy, independent of the payload a [`WsError`]
/// variant carries. Useful for matching on failure classes without
/// destructuring the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// a required configuration field was not set before `connect`
    MissingParameter,
    /// the uri (or one of its parts) is not a usable ws/wss endpoint
    InvalidUri,
    /// opening the transport failed
    ConnectFailed,
    /// writing to the transport failed
    SendFailed,
    /// reading from the transport failed
    RecvFailed,
    /// the handshake response could not be parsed or was not an upgrade
    ParseHandshake,
    /// the server answered with a status other than 101
    NotSwitchingProtocols,
    /// the 101 response carried no `Sec-WebSocket-Accept` header
    MissingSecAccept,
    /// the `Sec-WebSocket-Accept` value did not match the expectation
    BadSecAccept,
    /// a frame could not be decoded from the byte stream
    FrameParse,
    /// a well-formed frame violated protocol rules
    Protocol,
    /// the peer closed the transport outside a close exchange
    PeerClosed,
    /// allocation failure; never produced here (allocation failure aborts
    /// the process), kept so the taxonomy is closed over all failure classes
    Memory,
    /// anything else
    Unknown,
}

/// errors during connect, handshake and frame exchange
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum WsError {
    /// the first missing required field, by name
    #[error("missing required parameter `{0}`")]
    MissingParameter(&'static str),
    /// unusable uri or uri part
    #[error("invalid uri `{0}`")]
    InvalidUri(String),
    /// transport could not be opened
    #[error("connection failed `{0}`")]
    ConnectionFailed(String),
    /// transport write failed
    #[error("send failed `{0}`")]
    SendFailed(String),
    /// transport read failed
    #[error("receive failed `{0}`")]
    RecvFailed(String),
    /// response was not parseable http or not a websocket upgrade
    #[error("failed to parse handshake response `{0}`")]
    ParseHandshake(String),
    /// the server refused the upgrade; carries the HTTP status it sent
    #[error("expected 101 switching protocols, got {status}")]
    NotSwitchingProtocols {
        /// status code of the refusing response
        status: u16,
    },
    /// the 101 response had no accept header at all
    #[error("no sec-websocket-accept header in response")]
    MissingSecAccept,
    /// accept value present but wrong, byte for byte
    #[error("mismatch sec-websocket-accept, expect `{expect}`, got `{got}`")]
    BadSecAccept {
        /// value derived from the key we sent
        expect: String,
        /// value the server answered with
        got: String,
    },
    /// protocol violation; `close_code` is the status sent to the peer
    /// when failing the connection (1002, or 1007 for utf-8 faults)
    #[error("{error}")]
    ProtocolError {
        /// close status sent to the peer
        close_code: u16,
        /// what exactly was violated
        error: ProtocolError,
    },
    /// transport reached end of stream outside a close exchange
    #[error("connection closed by peer")]
    PeerClosed,
    /// anything without a better class
    #[error("unknown error `{0}`")]
    Unknown(String),
}

impl WsError {
    /// classify this error into the flat [`ErrorKind`] taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            WsError::MissingParameter(_) => ErrorKind::MissingParameter,
            WsError::InvalidUri(_) => ErrorKind::InvalidUri,
            WsError::ConnectionFailed(_) => ErrorKind::ConnectFailed,
            WsError::SendFailed(_) => ErrorKind::SendFailed,
            WsError::RecvFailed(_) => ErrorKind::RecvFailed,
            WsError::ParseHandshake(_) => ErrorKind::ParseHandshake,
            WsError::NotSwitchingProtocols { .. } => ErrorKind::NotSwitchingProtocols,
            WsError::MissingSecAccept => ErrorKind::MissingSecAccept,
            WsError::BadSecAccept { .. } => ErrorKind::BadSecAccept,
            WsError::ProtocolError { error, .. } => {
                if error.is_framing() {
                    ErrorKind::FrameParse
                } else {
                    ErrorKind::Protocol
                }
            }
            WsError::PeerClosed => ErrorKind::PeerClosed,
            WsError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// HTTP status attached to the error, if any. Populated for
    /// [`WsError::NotSwitchingProtocols`] only.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            WsError::NotSwitchingProtocols { status } => Some(*status),
            _ => None,
        }
    }
}

/// errors while decoding frames from raw bytes
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// nonzero rsv bits
    #[error("invalid leading bits {0:b}")]
    InvalidLeadingBits(u8),
    /// 64-bit payload length with the high bit set
    #[error("invalid leading payload len {0}")]
    InvalidLeadingLen(u8),
    /// reserved opcode
    #[error("unsupported frame {0:?}")]
    UnsupportedFrame(OpCode),
    /// continuation frame with no fragmented message in progress
    #[error("missing initial fragmented frame")]
    MissInitialFragmentedFrame,
    /// new data frame while a fragmented message is in progress
    #[error("not continue frame after initial fragmented frame")]
    NotContinueFrameAfterFragmented,
    /// control frame with fin unset
    #[error("fragmented control frame")]
    FragmentedControlFrame,
    /// control frame payload above 125 bytes
    #[error("control frame is too big {0}")]
    ControlFrameTooBig(usize),
    /// close frame with a one byte payload
    #[error("invalid close frame payload len, expect 0 or >= 2")]
    InvalidCloseFramePayload,
    /// close code outside the ranges RFC 6455 permits on the wire
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    /// text (or close reason) that is not valid utf-8
    #[error("invalid utf-8 text")]
    InvalidUtf8,
}

impl ProtocolError {
    /// true when the byte stream itself was malformed, as opposed to a
    /// well-formed frame breaking a protocol rule
    pub(crate) fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidLeadingBits(_)
                | ProtocolError::InvalidLeadingLen(_)
                | ProtocolError::UnsupportedFrame(_)
        )
    }
}
