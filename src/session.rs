//! Session struct definition
//!
//! Represents one connected chat client: its socket, the address cached at
//! accept time, an optional nickname, the read event source and the bytes
//! received but not yet framed into lines.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;

use bytes::BytesMut;
use futures_util::FutureExt;
use tokio::io::unix::AsyncFd;
use tracing::debug;

use crate::error::SessionError;
use crate::framer::LineFramer;
use crate::reactor::{Event, EventSender, EventSource};
use crate::types::{Generation, PeerAddress, SessionKey};

/// Bytes read per readiness notification
const READ_CHUNK_SIZE: usize = 4096;

/// How a session presents itself to others
///
/// Independent of the socket so it stays valid after the socket is closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub address: PeerAddress,
    pub name: Option<String>,
}

impl Identity {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            name: None,
        }
    }

    /// The nickname if set, otherwise the quoted address
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self.address.to_string(),
        }
    }

    /// Name-and-address rendering used by `/who`
    pub fn full_description(&self) -> String {
        match &self.name {
            Some(name) => format!("{} is {}", name, self.address),
            None => self.address.to_string(),
        }
    }
}

/// Connected chat client
///
/// Identity for equality purposes is the socket descriptor.
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    generation: Generation,
    io: Arc<AsyncFd<TcpStream>>,
    identity: Identity,
    read_source: EventSource,
    inbound: LineFramer,
}

impl Session {
    /// Wrap an accepted connection and start watching it for input
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        stream: TcpStream,
        address: PeerAddress,
        generation: Generation,
        queue: EventSender,
    ) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let key = SessionKey::of(&stream);
        let io = Arc::new(AsyncFd::new(stream)?);
        let event = Event::Readable(key, generation);
        let read_source = EventSource::new(Arc::clone(&io), event, queue);

        Ok(Self {
            key,
            generation,
            io,
            identity: Identity::new(address),
            read_source,
            inbound: LineFramer::new(),
        })
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn set_name(&mut self, name: String) {
        self.identity.name = Some(name);
    }

    pub fn display_name(&self) -> String {
        self.identity.display_name()
    }

    pub fn full_description(&self) -> String {
        self.identity.full_description()
    }

    /// Let the read source post its next notification
    pub fn rearm(&self) {
        self.read_source.rearm();
    }

    /// One non-blocking recv into the line buffer
    ///
    /// Returns `Ok(None)` when no data is available right now.
    pub fn receive(&mut self) -> Result<Option<usize>, SessionError> {
        let Some(ready) = self.io.readable().now_or_never() else {
            return Ok(None);
        };
        let mut guard = ready.map_err(SessionError::Receive)?;

        let mut buf = [0u8; READ_CHUNK_SIZE];
        match guard.try_io(|inner| inner.get_ref().read(&mut buf)) {
            Ok(Ok(0)) => Err(SessionError::ConnectionClosed),
            Ok(Ok(n)) => {
                self.inbound.push(&buf[..n]);
                Ok(Some(n))
            }
            Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => Ok(None),
            Ok(Err(e)) => Err(SessionError::Receive(e)),
            Err(_would_block) => Ok(None),
        }
    }

    /// Next complete line received from the peer
    pub fn next_line(&mut self) -> Option<BytesMut> {
        self.inbound.next_line()
    }

    /// Unterminated bytes left over when the peer closed
    pub fn take_remainder(&mut self) -> Option<BytesMut> {
        self.inbound.take_remainder()
    }

    /// Write the whole payload, retrying partial writes
    pub async fn send_all(&self, payload: &[u8]) -> Result<(), SessionError> {
        let mut sent = 0;
        while sent < payload.len() {
            let mut guard = self.io.writable().await.map_err(SessionError::Send)?;
            match guard.try_io(|inner| inner.get_ref().write(&payload[sent..])) {
                Ok(Ok(0)) => {
                    return Err(SessionError::Send(io::ErrorKind::WriteZero.into()));
                }
                Ok(Ok(n)) => sent += n,
                Ok(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Ok(Err(e)) => return Err(SessionError::Send(e)),
                Err(_would_block) => {}
            }
        }
        Ok(())
    }

    /// Tear down: cancel the read source, then close the socket
    ///
    /// Close errors are ignored.
    pub async fn close(mut self) {
        self.read_source.release().await;
        if let Err(e) = self.io.get_ref().shutdown(Shutdown::Both) {
            debug!("Ignoring close error for {}: {}", self, e);
        }
        // Last handle on the descriptor goes with `self`
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Session {}

impl std::fmt::Display for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}
