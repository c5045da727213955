//! MHSP stream transport.
//!
//! Framed messages over non-blocking TCP. [`HostListener`] accepts
//! connections on the host side; [`MessageStream`] wraps one connection on
//! either side, accumulating bytes until complete frames can be decoded.
//! Everything is pumped from the single-threaded runner loop; suspension
//! happens only at these I/O boundaries.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::{Duration, Instant};

use super::messages::{DecodeError, WireMessage, decode_frame};

/// Read chunk size for incoming MHSP frames
const RECV_CHUNK_SIZE: usize = 8192;

/// Default MHSP port
pub const DEFAULT_MHSP_PORT: u16 = 8082;

/// MHSP transport error types
#[derive(Debug, Clone)]
pub enum SocketError {
    /// Failed to bind the listener
    Bind(String),
    /// Failed to connect to the host
    Connect(String),
    /// Failed to accept a connection
    Accept(String),
    /// Failed to set socket options
    SocketOption(String),
    /// Failed to send a message
    Send(String),
    /// Frame decode error
    Decode(DecodeError),
    /// The peer closed the connection
    Closed,
}

impl std::fmt::Display for SocketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bind(e) => write!(f, "Failed to bind: {}", e),
            Self::Connect(e) => write!(f, "Failed to connect: {}", e),
            Self::Accept(e) => write!(f, "Failed to accept: {}", e),
            Self::SocketOption(e) => write!(f, "Socket option error: {}", e),
            Self::Send(e) => write!(f, "Send error: {}", e),
            Self::Decode(e) => write!(f, "Decode error: {}", e),
            Self::Closed => write!(f, "Connection closed"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<DecodeError> for SocketError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

/// Listening socket on the host side.
pub struct HostListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl HostListener {
    /// Bind a non-blocking listener to the given address
    /// (e.g. "0.0.0.0:8082" or "127.0.0.1:0").
    pub fn bind(addr: &str) -> Result<Self, SocketError> {
        let listener = TcpListener::bind(addr).map_err(|e| SocketError::Bind(e.to_string()))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| SocketError::SocketOption(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| SocketError::Bind(e.to_string()))?;

        tracing::debug!(port = local_addr.port(), "HostListener bound");

        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Accept one pending connection, if any.
    pub fn accept(&self) -> Option<Result<MessageStream, SocketError>> {
        match self.listener.accept() {
            Ok((stream, peer)) => Some(MessageStream::from_stream(stream, peer)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => Some(Err(SocketError::Accept(e.to_string()))),
        }
    }
}

/// One framed MHSP connection.
pub struct MessageStream {
    stream: TcpStream,
    peer_addr: SocketAddr,
    recv_buf: Vec<u8>,
    recv_queue: VecDeque<WireMessage>,
    closed: bool,
}

impl MessageStream {
    /// Connect to a host (e.g. "127.0.0.1:8082").
    pub fn connect(addr: &str) -> Result<Self, SocketError> {
        let stream = TcpStream::connect(addr).map_err(|e| SocketError::Connect(e.to_string()))?;
        let peer = stream
            .peer_addr()
            .map_err(|e| SocketError::Connect(e.to_string()))?;
        Self::from_stream(stream, peer)
    }

    fn from_stream(stream: TcpStream, peer_addr: SocketAddr) -> Result<Self, SocketError> {
        stream
            .set_nonblocking(true)
            .map_err(|e| SocketError::SocketOption(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        Ok(Self {
            stream,
            peer_addr,
            recv_buf: Vec::new(),
            recv_queue: VecDeque::new(),
            closed: false,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the connection is gone (peer closed or framing error).
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Send a message, blocking briefly if the socket buffer is full.
    pub fn send(&mut self, msg: &WireMessage) -> Result<(), SocketError> {
        if self.closed {
            return Err(SocketError::Closed);
        }

        let bytes = msg.to_bytes();
        let mut sent = 0;
        while sent < bytes.len() {
            match self.stream.write(&bytes[sent..]) {
                Ok(0) => {
                    self.closed = true;
                    return Err(SocketError::Closed);
                }
                Ok(n) => sent += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.closed = true;
                    return Err(SocketError::Send(e.to_string()));
                }
            }
        }

        tracing::trace!(?msg, "Sent MHSP message");
        Ok(())
    }

    /// Poll for the next complete message (non-blocking).
    pub fn poll(&mut self) -> Option<WireMessage> {
        self.recv_all();
        self.recv_queue.pop_front()
    }

    /// Receive everything available and slice it into frames.
    fn recv_all(&mut self) {
        if !self.closed {
            let mut chunk = [0u8; RECV_CHUNK_SIZE];
            loop {
                match self.stream.read(&mut chunk) {
                    Ok(0) => {
                        self.closed = true;
                        break;
                    }
                    Ok(n) => self.recv_buf.extend_from_slice(&chunk[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Receive error");
                        self.closed = true;
                        break;
                    }
                }
            }
        }

        loop {
            match decode_frame(&self.recv_buf) {
                Ok(Some((msg, consumed))) => {
                    tracing::trace!(?msg, "Received MHSP message");
                    self.recv_buf.drain(..consumed);
                    self.recv_queue.push_back(msg);
                }
                Ok(None) => break,
                Err(e) => {
                    // Stream framing is unrecoverable once out of sync.
                    tracing::warn!(error = %e, "Closing connection with undecodable frame");
                    self.closed = true;
                    self.recv_buf.clear();
                    break;
                }
            }
        }
    }

    /// Wait for a message matching the predicate (blocking with timeout).
    ///
    /// Non-matching messages stay queued in arrival order.
    pub fn wait_for<F>(&mut self, timeout: Duration, predicate: F) -> Option<WireMessage>
    where
        F: Fn(&WireMessage) -> bool,
    {
        let start = Instant::now();
        while start.elapsed() < timeout {
            self.recv_all();
            for i in 0..self.recv_queue.len() {
                if predicate(&self.recv_queue[i]) {
                    return self.recv_queue.remove(i);
                }
            }
            if self.closed {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        None
    }

    /// Forcibly close the connection.
    pub fn shutdown(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.closed = true;
    }
}

impl std::fmt::Debug for MessageStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStream")
            .field("peer_addr", &self.peer_addr)
            .field("queued_messages", &self.recv_queue.len())
            .field("closed", &self.closed)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::messages::{VersionHello, WireMessage};

    fn pair() -> (MessageStream, MessageStream) {
        let listener = HostListener::bind("127.0.0.1:0").unwrap();
        let client = MessageStream::connect(&listener.local_addr().to_string()).unwrap();
        let server = loop {
            if let Some(accepted) = listener.accept() {
                break accepted.unwrap();
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        (server, client)
    }

    #[test]
    fn listener_bind_assigns_port() {
        let listener = HostListener::bind("127.0.0.1:0").unwrap();
        assert!(listener.port() > 0);
    }

    #[test]
    fn send_receive_roundtrip() {
        let (mut server, mut client) = pair();

        let msg = WireMessage::Version(VersionHello {
            version: "1.2.3".to_string(),
        });
        client.send(&msg).unwrap();

        let received = server.wait_for(Duration::from_secs(1), |_| true);
        assert_eq!(received, Some(msg));

        server.send(&WireMessage::DeniedBadSecret).unwrap();
        let received = client.wait_for(Duration::from_secs(1), |_| true);
        assert_eq!(received, Some(WireMessage::DeniedBadSecret));
    }

    #[test]
    fn back_to_back_messages_preserve_order() {
        let (mut server, mut client) = pair();

        for n in 0..5u32 {
            client
                .send(&WireMessage::Version(VersionHello {
                    version: format!("{n}.0.0"),
                }))
                .unwrap();
        }

        for n in 0..5u32 {
            let msg = server.wait_for(Duration::from_secs(1), |_| true).unwrap();
            assert_eq!(
                msg,
                WireMessage::Version(VersionHello {
                    version: format!("{n}.0.0"),
                })
            );
        }
    }

    #[test]
    fn peer_shutdown_marks_closed() {
        let (mut server, mut client) = pair();
        client.shutdown();

        let deadline = Instant::now() + Duration::from_secs(1);
        while !server.is_closed() && Instant::now() < deadline {
            let _ = server.poll();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(server.is_closed());
        assert!(matches!(server.send(&WireMessage::DeniedBadSecret), Err(_)));
    }

    #[test]
    fn garbage_input_closes_stream() {
        let listener = HostListener::bind("127.0.0.1:0").unwrap();
        let mut raw = TcpStream::connect(listener.local_addr()).unwrap();
        let mut server = loop {
            if let Some(accepted) = listener.accept() {
                break accepted.unwrap();
            }
            std::thread::sleep(Duration::from_millis(1));
        };

        raw.write_all(b"this is not an MHSP frame").unwrap();
        raw.flush().unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while !server.is_closed() && Instant::now() < deadline {
            let _ = server.poll();
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(server.is_closed());
    }
}
