//! One direction of a peer pair: a framed duplex TCP stream. All writes go
//! through a per-link mutex so concurrent senders cannot interleave message
//! bodies. TLS support wraps the stream handed to `Link::new`; both ends of
//! a deployment wrap their streams identically.

use crate::error::{RemotingError, RemotingResult};
use crate::lock;
use crate::logging::{self, Logger};
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Bodies at or above this size are written while holding the link lock
/// instead of being assembled into an intermediate buffer first.
pub const LARGE_BODY_THRESHOLD: usize = 64 * 1024;

/// Shared cancellation token for a peer pair. Once fired, every pending call
/// fails with a link-down error and the pumping threads wind down.
pub struct Terminator {
    fired: AtomicBool,
}

impl Terminator {
    #[inline]
    pub fn new() -> Terminator {
        Terminator {
            fired: AtomicBool::new(false),
        }
    }

    /// Fire the token. Returns true for the call that actually flipped it.
    #[inline]
    pub fn fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    #[inline]
    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

pub struct Link {
    writer: Mutex<TcpStream>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    terminator: Arc<Terminator>,
    log: Logger,
}

impl Link {
    /// Wrap a connected stream. Returns the link plus a cloned read half for
    /// the single reader thread that owns the inbound direction.
    pub fn new(
        stream: TcpStream,
        terminator: Arc<Terminator>,
        log: &Logger,
    ) -> std::io::Result<(Arc<Link>, TcpStream)> {
        stream.set_nodelay(true)?;

        let reader = stream.try_clone()?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;

        let link = Arc::new(Link {
            writer: Mutex::new(stream),
            local_addr,
            peer_addr,
            terminator,
            log: log.new(logging::o!("peer" => peer_addr.to_string())),
        });

        Ok((link, reader))
    }

    /// Write a fully assembled frame. The body was buffered locally, so the
    /// link lock is held only for the copy.
    pub fn transmit(&self, frame: &[u8]) -> RemotingResult<()> {
        if self.terminator.is_fired() {
            return Err(RemotingError::LinkDown);
        }

        let mut writer = lock(&self.writer);
        writer.write_all(frame)?;
        writer.flush()?;

        logging::trace!(self.log, "frame transmitted"; "bytes" => frame.len());
        Ok(())
    }

    /// Write a frame piecewise while holding the link lock for the whole
    /// duration. Used for bodies too large to buffer.
    pub fn transmit_with<F>(&self, write: F) -> RemotingResult<()>
    where
        F: FnOnce(&mut dyn Write) -> RemotingResult<()>,
    {
        if self.terminator.is_fired() {
            return Err(RemotingError::LinkDown);
        }

        let mut writer = lock(&self.writer);
        write(&mut *writer)?;
        writer.flush()?;

        logging::trace!(self.log, "streamed frame transmitted");
        Ok(())
    }

    #[inline]
    pub fn terminator(&self) -> &Arc<Terminator> {
        &self.terminator
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    #[inline]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shut the socket down in both directions, waking any blocked reader.
    pub fn close(&self) {
        let writer = lock(&self.writer);
        let _ = writer.shutdown(Shutdown::Both);

        logging::debug!(self.log, "link closed");
    }
}
