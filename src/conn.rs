//! TCP connection to the radar controller.
//!
//! Handles byte-stream I/O and header validation. No application logic:
//! the session functions in [`crate::seq`] drive each exchange.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};

use tracing::trace;

use crate::codec;
use crate::error::WireError;
use crate::frame::{HEADER_LEN, Header};
use crate::opcode::Opcode;
use crate::protocol::Request;

/// Default controller address and port.
pub const DEFAULT_ADDR: &str = "127.0.0.1:45000";

/// Errors from connection operations.
#[derive(Debug)]
pub enum ConnError {
    /// TCP I/O error.
    Io(io::Error),
    /// Wire protocol decode error.
    Wire(WireError),
    /// TCP stream closed by the controller.
    Disconnected,
    /// Protocol violation (a response that makes no sense for the request).
    Protocol(String),
    /// The controller answered with a status the caller treats as refusal.
    Rejected { opcode: Opcode, status: i32 },
}

impl ConnError {
    /// OS error number carried by this error, if any.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            ConnError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnError::Io(e) => write!(f, "I/O error: {e}"),
            ConnError::Wire(e) => write!(f, "wire error: {e}"),
            ConnError::Disconnected => write!(f, "connection closed by controller"),
            ConnError::Protocol(msg) => write!(f, "protocol error: {msg}"),
            ConnError::Rejected { opcode, status } => {
                write!(f, "{opcode} rejected with status {status}")
            }
        }
    }
}

impl std::error::Error for ConnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConnError::Io(e) => Some(e),
            ConnError::Wire(e) => Some(e),
            ConnError::Disconnected | ConnError::Protocol(_) | ConnError::Rejected { .. } => None,
        }
    }
}

impl From<io::Error> for ConnError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            ConnError::Disconnected
        } else {
            ConnError::Io(e)
        }
    }
}

impl From<WireError> for ConnError {
    fn from(e: WireError) -> Self {
        ConnError::Wire(e)
    }
}

/// Ordered request/response channel to the controller.
///
/// Synchronous and single-threaded: every request is fully answered before
/// the next one is written. Generic over the stream so tests can script the
/// controller's side.
///
/// # Example
///
/// ```no_run
/// use radarctl::{Connection, ConnError, seq};
///
/// let mut conn = Connection::connect(radarctl::conn::DEFAULT_ADDR)?;
/// seq::ping(&mut conn)?;
/// # Ok::<(), ConnError>(())
/// ```
pub struct Connection<S = TcpStream> {
    stream: S,
    /// Called at the top of `send()` with the request.
    on_send: Option<Box<dyn FnMut(&Request)>>,
}

impl Connection<TcpStream> {
    /// Connect to the controller.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self, ConnError> {
        let stream = TcpStream::connect(addr)?;
        // Requests are small and strictly alternating; disable Nagle.
        let _ = stream.set_nodelay(true);
        Ok(Self::from_stream(stream))
    }

    /// The peer address of the underlying TCP connection.
    pub fn peer_addr(&self) -> Result<SocketAddr, ConnError> {
        Ok(self.stream.peer_addr()?)
    }

    /// Shut down the TCP connection.
    pub fn shutdown(&self) -> Result<(), ConnError> {
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    /// Raw descriptor of the socket, for the interrupt escalation path.
    pub fn raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl<S: Read + Write> Connection<S> {
    pub fn from_stream(stream: S) -> Self {
        Self { stream, on_send: None }
    }

    /// Register a callback invoked at the top of every [`send()`](Self::send) call.
    pub fn set_on_send(&mut self, f: impl FnMut(&Request) + 'static) {
        self.on_send = Some(Box::new(f));
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    /// Write a request: header followed by payload.
    pub fn send(&mut self, req: &Request) -> Result<(), ConnError> {
        if let Some(cb) = self.on_send.as_mut() {
            cb(req);
        }
        trace!(request = %req.debug_hex(), "send");
        self.stream.write_all(&req.encode())?;
        self.stream.flush()?;
        Ok(())
    }

    /// Read exactly `len` bytes of response payload.
    pub fn recv_exact(&mut self, len: usize) -> Result<Vec<u8>, ConnError> {
        let mut buf = vec![0u8; len];
        self.stream.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn recv_i32(&mut self) -> Result<i32, ConnError> {
        let buf = self.recv_exact(4)?;
        Ok(codec::read_i32(&buf, 0)?)
    }

    pub fn recv_u32(&mut self) -> Result<u32, ConnError> {
        let buf = self.recv_exact(4)?;
        Ok(codec::read_u32(&buf, 0)?)
    }

    pub fn recv_f32(&mut self) -> Result<f32, ConnError> {
        let buf = self.recv_exact(4)?;
        Ok(codec::read_f32(&buf, 0)?)
    }

    pub fn recv_u8(&mut self) -> Result<u8, ConnError> {
        let buf = self.recv_exact(1)?;
        Ok(buf[0])
    }

    /// Read the trailing status header of a response and check that it
    /// echoes `expect`. Returns the status.
    pub fn recv_status(&mut self, expect: Opcode) -> Result<i32, ConnError> {
        let mut wire = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut wire)?;
        let header = Header::parse(&wire)?;
        trace!(opcode = %header.opcode, status = header.status, "recv");
        if header.opcode != expect {
            return Err(WireError::UnexpectedOpcode {
                sent: expect.name(),
                got: header.opcode.name(),
            }
            .into());
        }
        Ok(header.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MockStream;

    #[test]
    fn send_writes_header_and_payload() {
        let mut conn = Connection::from_stream(MockStream::new(vec![]));
        conn.send(&Request::SetRadarChan { radar: 1, channel: 1 }).unwrap();
        assert_eq!(conn.get_ref().written(), &[b'R', 0, 0, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn status_must_echo_request() {
        let mut conn = Connection::from_stream(MockStream::new(vec![b'c', 0, 0, 0, 0]));
        let err = conn.recv_status(Opcode::Ping).unwrap_err();
        assert!(matches!(
            err,
            ConnError::Wire(WireError::UnexpectedOpcode { sent: "PING", got: "GET_PARAMETERS" })
        ));
    }

    #[test]
    fn closed_stream_is_disconnect() {
        let mut conn = Connection::from_stream(MockStream::new(vec![1, 2]));
        assert!(matches!(conn.recv_i32(), Err(ConnError::Disconnected)));
    }

    #[test]
    fn on_send_sees_every_request() {
        use std::cell::RefCell;
        use std::rc::Rc;

        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        let mut conn = Connection::from_stream(MockStream::new(vec![]));
        conn.set_on_send(move |req| sink.borrow_mut().push(req.opcode()));
        conn.send(&Request::Ping).unwrap();
        conn.send(&Request::Quit).unwrap();
        assert_eq!(*seen.borrow(), vec![Opcode::Ping, Opcode::Quit]);
    }

    #[test]
    fn rejected_display() {
        let e = ConnError::Rejected { opcode: Opcode::RegisterSeq, status: 0 };
        assert_eq!(e.to_string(), "REGISTER_SEQ rejected with status 0");
        assert!(e.raw_os_error().is_none());
    }
}
