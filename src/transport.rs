//! Length-prefixed framing over TCP.
//!
//! Every message on the wire is `u32_be length || payload`. There is no checksum and no
//! compression: TCP is trusted for integrity.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::trace;

use crate::error::{ControlError, Result};

/// Frames larger than this are treated as stream corruption.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// A TCP connection speaking the framed protocol.
///
/// Writes take `&mut self`, so a header and its payload can never be interleaved with another
/// writer's frame.
#[derive(Debug)]
pub struct FramedConnection {
    stream: TcpStream,
}

impl FramedConnection {
    /// Connect to `host:port`, applying `timeout` to the connect and to every later read and
    /// write on this connection.
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<FramedConnection> {
        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|e| ControlError::connection("resolving simulator address", e))?
            .collect();

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::from_stream(stream, Some(timeout)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) => ControlError::connection("connecting to simulator", e),
            None => ControlError::ConnectionFault(format!("'{host}' resolved to no address")),
        })
    }

    /// Wrap an already connected stream.
    pub fn from_stream(stream: TcpStream, timeout: Option<Duration>) -> Result<FramedConnection> {
        stream
            .set_nodelay(true)
            .map_err(|e| ControlError::connection("setting TCP_NODELAY", e))?;
        stream
            .set_read_timeout(timeout)
            .map_err(|e| ControlError::connection("setting read timeout", e))?;
        stream
            .set_write_timeout(timeout)
            .map_err(|e| ControlError::connection("setting write timeout", e))?;
        Ok(FramedConnection { stream })
    }

    /// Write one frame.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .ok()
            .filter(|len| *len as usize <= MAX_FRAME_LEN)
            .ok_or_else(|| {
                ControlError::ConnectionFault(format!("frame of {} bytes is too large", payload.len()))
            })?;

        let mut buf = Vec::with_capacity(4 + payload.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(payload);
        self.stream
            .write_all(&buf)
            .and_then(|_| self.stream.flush())
            .map_err(|e| ControlError::connection("sending frame", e))
    }

    pub fn send_str(&mut self, msg: &str) -> Result<()> {
        trace!(msg, "send");
        self.send(msg.as_bytes())
    }

    /// Read one frame, blocking until it is complete.
    ///
    /// A clean close before the length prefix and a close in the middle of a frame are both
    /// reported as [`ControlError::ConnectionFault`].
    pub fn recv(&mut self) -> Result<Vec<u8>> {
        let mut header = [0u8; 4];
        self.read_exact(&mut header, "reading frame header")?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ControlError::ConnectionFault(format!(
                "implausible frame length {len}, stream is corrupted"
            )));
        }
        let mut payload = vec![0u8; len];
        self.read_exact(&mut payload, "reading frame payload")?;
        Ok(payload)
    }

    /// Read a frame holding a single big-endian `u32` (status words, ports).
    pub fn recv_u32(&mut self) -> Result<u32> {
        let frame = self.recv()?;
        let bytes: [u8; 4] = frame.as_slice().try_into().map_err(|_| {
            ControlError::ConnectionFault(format!(
                "expected a 4 byte status reply, got {} bytes",
                frame.len()
            ))
        })?;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Read a frame as text. Invalid UTF-8 is replaced rather than rejected.
    pub fn recv_string(&mut self) -> Result<String> {
        let frame = self.recv()?;
        Ok(String::from_utf8_lossy(&frame).into_owned())
    }

    /// Shut both directions down. Errors are ignored: the peer may already be gone.
    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }

    pub fn peer_port(&self) -> Option<u16> {
        self.stream.peer_addr().ok().map(|addr| addr.port())
    }

    fn read_exact(&mut self, buf: &mut [u8], context: &str) -> Result<()> {
        self.stream.read_exact(buf).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => {
                ControlError::ConnectionFault(format!("{context}: connection closed by simulator"))
            }
            ErrorKind::WouldBlock | ErrorKind::TimedOut => {
                ControlError::ConnectionFault(format!("{context}: timed out"))
            }
            _ => ControlError::connection(context, e),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::thread;

    use super::*;

    fn pair() -> (FramedConnection, FramedConnection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let accept = thread::spawn(move || listener.accept().unwrap().0);
        let client = FramedConnection::connect("127.0.0.1", port, Duration::from_secs(5)).unwrap();
        let server =
            FramedConnection::from_stream(accept.join().unwrap(), Some(Duration::from_secs(5)))
                .unwrap();
        (client, server)
    }

    #[test]
    fn frames_survive_loopback() {
        let (mut client, mut server) = pair();
        let payloads: Vec<Vec<u8>> = vec![
            vec![],
            vec![0],
            b"<Peek/>".to_vec(),
            (0..=255u8).cycle().take(70_000).collect(),
        ];
        for payload in &payloads {
            client.send(payload).unwrap();
        }
        for payload in &payloads {
            assert_eq!(&server.recv().unwrap(), payload);
        }
    }

    #[test]
    fn status_words_are_big_endian() {
        let (mut client, mut server) = pair();
        server.send(&[0, 0, 0, 1]).unwrap();
        server.send(&9001u32.to_be_bytes()).unwrap();
        assert_eq!(client.recv_u32().unwrap(), 1);
        assert_eq!(client.recv_u32().unwrap(), 9001);
    }

    #[test]
    fn short_status_is_a_connection_fault() {
        let (mut client, mut server) = pair();
        server.send(&[1]).unwrap();
        assert!(client.recv_u32().unwrap_err().is_connection_fault());
    }

    #[test]
    fn close_mid_frame_is_a_connection_fault() {
        let (mut client, server) = pair();
        let mut raw = server.stream.try_clone().unwrap();
        raw.write_all(&10u32.to_be_bytes()).unwrap();
        raw.write_all(b"abc").unwrap();
        server.shutdown();
        drop(raw);
        let err = client.recv().unwrap_err();
        assert!(err.is_connection_fault(), "{err}");
    }

    #[test]
    fn implausible_length_fails_fast() {
        let (mut client, server) = pair();
        let mut raw = server.stream.try_clone().unwrap();
        raw.write_all(&u32::MAX.to_be_bytes()).unwrap();
        let err = client.recv().unwrap_err();
        assert!(err.to_string().contains("implausible"), "{err}");
    }

    #[test]
    fn silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let _keep = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            thread::sleep(Duration::from_secs(2));
            drop(stream);
        });
        let mut client =
            FramedConnection::connect("127.0.0.1", port, Duration::from_millis(200)).unwrap();
        assert!(client.recv().unwrap_err().is_connection_fault());
    }
}
