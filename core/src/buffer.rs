//! Buffer management for send and receive queues
//!
//! [`LineFramer`] extracts one line at a time from a transport into a fixed
//! size buffer, and [`SendQueue`] keeps unwritten output in submission order
//! across partial writes. Neither ever blocks; both rely on the reactor to
//! call them again on the next readiness event.

use crate::transport::{is_transient, Transport};
use std::collections::VecDeque;
use std::io;

/// Result of one framing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete line, terminator stripped
    Line(Vec<u8>),
    /// A full buffer without any newline; the rest of this line is discarded
    Unterminated(Vec<u8>),
    /// No complete line yet, try again on the next readiness event
    Pending,
}

/// Fixed capacity line framer
#[derive(Debug)]
pub struct LineFramer {
    /// Receive buffer, never grown
    buffer: Box<[u8]>,
    /// Bytes of the current line already consumed from the transport
    fill: usize,
    /// Discarding input until the next newline
    resync: bool,
}

impl LineFramer {
    /// Create a framer with a fixed buffer of `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![0u8; capacity.max(1)].into_boxed_slice(),
            fill: 0,
            resync: false,
        }
    }

    /// Buffer capacity in bytes
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes buffered for a line not yet complete
    pub fn buffered(&self) -> usize {
        self.fill
    }

    /// Whether the framer is discarding the tail of an oversized line
    pub fn is_resyncing(&self) -> bool {
        self.resync
    }

    /// Try to extract one line
    ///
    /// Peeks into the unfilled part of the buffer and consumes exactly up to
    /// and including the first newline, or everything peeked when there is
    /// none. Transient errors are reported as [`Frame::Pending`]; end of
    /// stream and any other failure are hard errors.
    pub fn read_line<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<Frame> {
        let start = self.fill;
        let peeked = match transport.peek(&mut self.buffer[start..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Ok(Frame::Pending),
            Err(e) => return Err(e),
        };

        let want = match self.buffer[start..start + peeked].iter().position(|&b| b == b'\n') {
            Some(pos) => pos + 1,
            None => peeked,
        };

        let got = match transport.read(&mut self.buffer[start..start + want]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => n,
            Err(e) if is_transient(&e) => return Ok(Frame::Pending),
            Err(e) => return Err(e),
        };

        let newline = self.buffer[start..start + got].iter().position(|&b| b == b'\n');

        if self.resync {
            // Discarded bytes never accumulate.
            self.fill = 0;
            if newline.is_some() {
                self.resync = false;
                tracing::debug!("Line framer resynchronised");
            }
            return Ok(Frame::Pending);
        }

        if let Some(pos) = newline {
            let end = start + pos;
            let line = trim_cr(&self.buffer[..end]).to_vec();
            self.fill = 0;
            return Ok(Frame::Line(line));
        }

        self.fill = start + got;
        if self.fill < self.buffer.len() {
            return Ok(Frame::Pending);
        }

        let line = self.buffer[..self.fill].to_vec();
        self.fill = 0;
        self.resync = true;
        Ok(Frame::Unterminated(line))
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    match line.last() {
        Some(b'\r') => &line[..line.len() - 1],
        _ => line,
    }
}

/// One queued output buffer and how much of it has been written
#[derive(Debug)]
pub struct SendQueueEntry {
    data: Box<[u8]>,
    cursor: usize,
}

impl SendQueueEntry {
    fn remaining(&self) -> &[u8] {
        &self.data[self.cursor..]
    }
}

/// Outcome of a drain attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Every queued byte has been written
    Drained,
    /// The transport stopped accepting bytes; retry when writable
    WouldBlock,
}

/// Ordered, resumable output queue
#[derive(Debug, Default)]
pub struct SendQueue {
    /// Pending buffers, oldest first
    entries: VecDeque<SendQueueEntry>,
    /// Unwritten bytes across all entries
    queued: usize,
}

impl SendQueue {
    /// Create a new, empty send queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit bytes for output
    ///
    /// When nothing is queued and a transport is available the bytes are
    /// written directly; only the unwritten remainder is queued.
    pub fn enqueue<T: Transport + ?Sized>(
        &mut self,
        transport: Option<&mut T>,
        bytes: &[u8],
    ) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let mut written = 0;
        if self.entries.is_empty() {
            if let Some(transport) = transport {
                written = match transport.write(bytes) {
                    Ok(n) => n,
                    Err(e) if is_transient(&e) => 0,
                    Err(e) => return Err(e),
                };
            }
        }

        if written < bytes.len() {
            let rest = &bytes[written..];
            self.queued += rest.len();
            self.entries.push_back(SendQueueEntry {
                data: rest.to_vec().into_boxed_slice(),
                cursor: 0,
            });
        }

        Ok(())
    }

    /// Write queued entries in order until done or the transport pushes back
    pub fn drain<T: Transport + ?Sized>(&mut self, transport: &mut T) -> io::Result<DrainStatus> {
        while let Some(entry) = self.entries.front_mut() {
            let remaining = entry.remaining().len();
            let n = match transport.write(entry.remaining()) {
                Ok(0) => return Ok(DrainStatus::WouldBlock),
                Ok(n) => n,
                Err(e) if is_transient(&e) => return Ok(DrainStatus::WouldBlock),
                Err(e) => return Err(e),
            };

            self.queued -= n;
            if n < remaining {
                entry.cursor += n;
                return Ok(DrainStatus::WouldBlock);
            }
            self.entries.pop_front();
        }

        Ok(DrainStatus::Drained)
    }

    /// Unwritten bytes across all entries
    pub fn queue_length(&self) -> usize {
        self.queued
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if nothing is waiting to be written
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Discard everything queued
    pub fn clear(&mut self) {
        self.entries.clear();
        self.queued = 0;
    }
}
