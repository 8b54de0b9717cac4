//! Newline framer
//!
//! Accumulates bytes received from a session and yields complete
//! `\n`-terminated frames in arrival order. There is no maximum line length.

use bytes::{Buf, BytesMut};

/// Initial buffer capacity per session
const INITIAL_CAPACITY: usize = 1024;

/// Incremental line framer
#[derive(Debug)]
pub struct LineFramer {
    buf: BytesMut,
}

impl LineFramer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(INITIAL_CAPACITY),
        }
    }

    /// Append freshly received bytes
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete frame, terminator included
    pub fn next_line(&mut self) -> Option<BytesMut> {
        let end = self.buf.iter().position(|&b| b == b'\n')?;
        Some(self.buf.split_to(end + 1))
    }

    /// Take whatever unterminated bytes remain (used at EOF)
    pub fn take_remainder(&mut self) -> Option<BytesMut> {
        if self.buf.has_remaining() {
            Some(self.buf.split())
        } else {
            None
        }
    }

    /// Bytes buffered but not yet framed
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

impl Default for LineFramer {
    fn default() -> Self {
        Self::new()
    }
}
