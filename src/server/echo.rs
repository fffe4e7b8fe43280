// src/server/echo.rs

//! A minimal connection used by the demo server: echoes whatever it reads.

use crate::connection::{CloseReason, Connection, ConnectionId, ManagerHandle};
use crate::core::multiplexer::EventKind;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use tracing::{debug, warn};

const READ_BUFFER_SIZE: usize = 4096;

pub struct EchoConnection {
    id: ConnectionId,
    peer: SocketAddr,
    stream: TcpStream,
    handle: ManagerHandle<EchoConnection>,
    /// Set once a close has been queued; later events are ignored.
    closing: bool,
}

impl EchoConnection {
    /// Wraps an accepted socket and stamps its identity.
    pub fn new(stream: TcpStream, handle: ManagerHandle<EchoConnection>) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr()?;
        let id = ConnectionId::stamp(stream.as_raw_fd());
        Ok(Self {
            id,
            peer,
            stream,
            handle,
            closing: false,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn close(&mut self, reason: CloseReason) {
        if !self.closing {
            self.closing = true;
            self.handle.close_connection(self.id, reason);
        }
    }

    fn on_readable(&mut self) {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    debug!("Peer {} closed connection {}.", self.peer, self.id);
                    self.close(CloseReason::PeerClosed);
                    return;
                }
                Ok(n) => {
                    self.handle.heartbeat_touch(self.id);
                    if let Err(e) = self.stream.write_all(&buf[..n]) {
                        warn!("Echo to {} failed: {}", self.peer, e);
                        self.close(CloseReason::Error);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Read from {} failed: {}", self.peer, e);
                    self.close(CloseReason::Error);
                    return;
                }
            }
        }
    }
}

impl Connection for EchoConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn on_event(&mut self, event: EventKind) {
        if self.closing {
            return;
        }
        match event {
            EventKind::Read => self.on_readable(),
            EventKind::Error => {
                debug!("Error event on connection {} from {}.", self.id, self.peer);
                self.close(CloseReason::Error);
            }
        }
    }
}
