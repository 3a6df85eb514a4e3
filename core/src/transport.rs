//! Non-blocking byte transports
//!
//! The framer and send queue only ever see this trait, so they can be driven
//! by a real socket inside the reactor or by [`MemoryTransport`] in tests.
//! Every method must return immediately; "nothing to do right now" is
//! reported as an error of kind `WouldBlock`.

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use tokio::io::Interest;
use tokio::net::TcpStream;

/// A non-blocking, stream oriented byte transport
pub trait Transport: Send {
    /// Copy pending input into `buf` without consuming it
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Consume pending input into `buf`
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write as much of `buf` as the transport accepts right now
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Resolve once the transport is readable, or writable when `want_write`
    fn readiness(&self, want_write: bool) -> BoxFuture<'_, ()>;

    /// Human readable peer description
    fn peer(&self) -> String;
}

/// Whether an I/O error only means "retry on the next readiness event"
pub fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) || in_progress(err)
}

#[cfg(unix)]
fn in_progress(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINPROGRESS) | Some(libc::EALREADY))
}

#[cfg(not(unix))]
fn in_progress(_err: &io::Error) -> bool {
    false
}

impl Transport for TcpStream {
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::peek(self, buf)
            .now_or_never()
            .unwrap_or_else(|| Err(io::ErrorKind::WouldBlock.into()))
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.try_read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.try_write(buf)
    }

    fn readiness(&self, want_write: bool) -> BoxFuture<'_, ()> {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };

        Box::pin(async move {
            if let Err(e) = self.ready(interest).await {
                tracing::debug!("Readiness wait failed: {}", e);
            }
        })
    }

    fn peer(&self) -> String {
        self.peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string())
    }
}

/// Scripted in-memory transport
///
/// Input is fed explicitly; reads can be capped to simulate short reads and
/// writes can be given a byte budget to simulate a full socket buffer.
/// Clones share state, so a test can keep a handle after giving one away.
#[derive(Debug, Clone, Default)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    name: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    inbound: VecDeque<u8>,
    outbound: Vec<u8>,
    closed: bool,
    read_chunk: Option<usize>,
    write_budget: Option<usize>,
    write_error: Option<io::ErrorKind>,
}

impl MemoryState {
    fn available(&self, want: usize) -> io::Result<usize> {
        if self.inbound.is_empty() {
            if self.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }

        let mut n = want.min(self.inbound.len());
        if let Some(chunk) = self.read_chunk {
            n = n.min(chunk);
        }
        Ok(n)
    }
}

impl MemoryTransport {
    /// Create a new memory transport
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Make bytes available for reading
    pub fn feed(&self, bytes: &[u8]) {
        self.state.lock().inbound.extend(bytes);
    }

    /// Feed a protocol line, adding CRLF
    pub fn feed_line(&self, line: &str) {
        self.feed(format!("{}\r\n", line).as_bytes());
    }

    /// Signal end of stream once buffered input has been consumed
    pub fn close_input(&self) {
        self.state.lock().closed = true;
    }

    /// Cap how many bytes a single peek or read can return
    pub fn set_read_chunk(&self, chunk: Option<usize>) {
        self.state.lock().read_chunk = chunk;
    }

    /// Limit how many more bytes writes will accept; `None` is unlimited
    pub fn set_write_budget(&self, budget: Option<usize>) {
        self.state.lock().write_budget = budget;
    }

    /// Make every following write fail with `kind`
    pub fn fail_writes(&self, kind: io::ErrorKind) {
        self.state.lock().write_error = Some(kind);
    }

    /// Everything written so far
    pub fn written(&self) -> Vec<u8> {
        self.state.lock().outbound.clone()
    }

    /// Drain written bytes as text
    pub fn take_written(&self) -> String {
        let mut state = self.state.lock();
        let text = String::from_utf8_lossy(&state.outbound).into_owned();
        state.outbound.clear();
        text
    }

    /// Drain written bytes as lines, terminators stripped
    pub fn take_lines(&self) -> Vec<String> {
        self.take_written()
            .split("\r\n")
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Bytes fed but not yet consumed
    pub fn pending_input(&self) -> usize {
        self.state.lock().inbound.len()
    }
}

impl Transport for MemoryTransport {
    fn peek(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let state = self.state.lock();
        let n = state.available(buf.len())?;
        for (dst, src) in buf.iter_mut().zip(state.inbound.iter()).take(n) {
            *dst = *src;
        }
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        let n = state.available(buf.len())?;
        for (dst, src) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if let Some(kind) = state.write_error {
            return Err(kind.into());
        }

        let n = match state.write_budget {
            Some(0) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(budget) => {
                let n = budget.min(buf.len());
                state.write_budget = Some(budget - n);
                n
            }
            None => buf.len(),
        };

        state.outbound.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn readiness(&self, want_write: bool) -> BoxFuture<'_, ()> {
        let ready = {
            let state = self.state.lock();
            !state.inbound.is_empty()
                || state.closed
                || (want_write && state.write_budget != Some(0))
        };

        if ready {
            Box::pin(futures_util::future::ready(()))
        } else {
            Box::pin(futures_util::future::pending())
        }
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_transport_peek_does_not_consume() {
        let mut t = MemoryTransport::new("test");
        t.feed(b"abc");

        let mut buf = [0u8; 8];
        assert_eq!(t.peek(&mut buf).unwrap(), 3);
        assert_eq!(t.pending_input(), 3);
        assert_eq!(t.read(&mut buf[..2]).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(t.pending_input(), 1);
    }

    #[test]
    fn test_memory_transport_would_block_and_eof() {
        let mut t = MemoryTransport::new("test");
        let mut buf = [0u8; 4];
        let err = t.read(&mut buf).unwrap_err();
        assert!(is_transient(&err));

        t.close_input();
        assert_eq!(t.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_transient_error_kinds() {
        assert!(is_transient(&io::ErrorKind::WouldBlock.into()));
        assert!(is_transient(&io::ErrorKind::Interrupted.into()));
        assert!(!is_transient(&io::ErrorKind::BrokenPipe.into()));
        assert!(!is_transient(&io::ErrorKind::UnexpectedEof.into()));

        #[cfg(unix)]
        {
            assert!(is_transient(&io::Error::from_raw_os_error(libc::EINPROGRESS)));
            assert!(is_transient(&io::Error::from_raw_os_error(libc::EALREADY)));
            assert!(!is_transient(&io::Error::from_raw_os_error(libc::ECONNREFUSED)));
        }
    }

    #[test]
    fn test_memory_transport_write_budget() {
        let mut t = MemoryTransport::new("test");
        t.set_write_budget(Some(3));
        assert_eq!(t.write(b"hello").unwrap(), 3);
        assert!(is_transient(&t.write(b"lo").unwrap_err()));
        assert_eq!(t.written(), b"hel");
    }

    #[test]
    fn test_memory_transport_clones_share_state() {
        let handle = MemoryTransport::new("test");
        let mut boxed: Box<dyn Transport> = Box::new(handle.clone());

        handle.feed_line("PING :x");
        let mut buf = [0u8; 16];
        assert_eq!(boxed.read(&mut buf).unwrap(), 9);

        boxed.write(b"PONG :x\r\n").unwrap();
        assert_eq!(handle.take_lines(), vec!["PONG :x"]);
        assert!(handle.written().is_empty());
    }
}
