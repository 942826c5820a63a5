// Byte-stream transport abstraction
// The state machine only needs non-blocking reads, whole-buffer writes,
// and close; everything else about the transport stays out here.

use std::io;

/// Non-blocking byte-stream endpoint consumed by the connection state
/// machine. `read_into` returning `WouldBlock` means no data right now;
/// `Ok(0)` means the peer closed.
pub trait Socket {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn close(&mut self);
}

/// [`Socket`] over a tokio TCP stream.
///
/// Reads map to `try_read`. Writes spin on `try_write` until the kernel
/// buffer drains; protocol frames are small relative to the send buffer,
/// so the spin is rare and short. Close drops the stream, which shuts the
/// descriptor so the peer's in-flight read observes end-of-file.
pub struct TokioSocket {
    stream: Option<tokio::net::TcpStream>,
}

impl TokioSocket {
    pub fn new(stream: tokio::net::TcpStream) -> Self {
        TokioSocket {
            stream: Some(stream),
        }
    }

    /// Wait until the stream is readable (or errors). Used by the driver
    /// between `handle_connection` invocations.
    pub async fn readable(&self) -> io::Result<()> {
        match &self.stream {
            Some(stream) => stream.readable().await,
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        }
    }
}

impl Socket for TokioSocket {
    fn read_into(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &self.stream {
            Some(stream) => stream.try_read(buf),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        }
    }

    fn write_all(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        let stream = match &self.stream {
            Some(stream) => stream,
            None => return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed")),
        };
        while !bytes.is_empty() {
            match stream.try_write(bytes) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote 0 bytes"));
                }
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => std::thread::yield_now(),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        self.stream = None;
    }
}

/// In-memory duplex socket pair for exercising the state machine without
/// the network.
#[cfg(test)]
pub use memory::MemorySocket;
