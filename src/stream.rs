use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};

use tracing::debug;

use crate::errors::WsError;
use crate::protocol::Mode;

/// Transport the worker drives: plain tcp, or tls when built with the
/// `tls` feature and the uri scheme is `wss`. The socket is switched to
/// non-blocking after connect (and after the tls handshake), so reads
/// and writes surface `WouldBlock` instead of stalling the worker.
pub enum WsStream {
    /// plain tcp
    Plain(TcpStream),
    /// tls over tcp
    #[cfg(feature = "tls")]
    Tls(rustls_connector::TlsStream<TcpStream>),
}

impl WsStream {
    /// open the transport for `host:port`, wrapping in tls for wss
    pub fn connect(mode: Mode, host: &str, port: u16) -> Result<Self, WsError> {
        let tcp = TcpStream::connect((host, port))
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        let _ = tcp.set_nodelay(true);
        let mut stream = match mode {
            Mode::Ws => WsStream::Plain(tcp),
            Mode::Wss => Self::wrap_tls(tcp, host)?,
        };
        stream
            .stream_mut()
            .set_nonblocking(true)
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        debug!("transport ready for {host}:{port}");
        Ok(stream)
    }

    #[cfg(feature = "tls")]
    fn wrap_tls(tcp: TcpStream, host: &str) -> Result<Self, WsError> {
        let connector = rustls_connector::RustlsConnector::new_with_native_certs()
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        let tls = connector
            .connect(host, tcp)
            .map_err(|e| WsError::ConnectionFailed(e.to_string()))?;
        debug!("tls connection established");
        Ok(WsStream::Tls(tls))
    }

    #[cfg(not(feature = "tls"))]
    fn wrap_tls(_tcp: TcpStream, _host: &str) -> Result<Self, WsError> {
        Err(WsError::ConnectionFailed(
            "wss scheme requires the `tls` feature".to_string(),
        ))
    }

    /// underlying tcp socket
    pub fn stream_mut(&mut self) -> &mut TcpStream {
        match self {
            WsStream::Plain(s) => s,
            #[cfg(feature = "tls")]
            WsStream::Tls(tls) => tls.get_mut(),
        }
    }

    /// best-effort shutdown of both directions
    pub fn shutdown(&mut self) {
        let _ = self.stream_mut().shutdown(Shutdown::Both);
    }
}

impl Read for WsStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.read(buf),
            #[cfg(feature = "tls")]
            WsStream::Tls(s) => s.read(buf),
        }
    }
}

impl Write for WsStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            WsStream::Plain(s) => s.write(buf),
            #[cfg(feature = "tls")]
            WsStream::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            WsStream::Plain(s) => s.flush(),
            #[cfg(feature = "tls")]
            WsStream::Tls(s) => s.flush(),
        }
    }
}
