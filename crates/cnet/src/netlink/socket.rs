//! Low-level async RTNETLINK socket.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::BytesMut;
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

use super::error::{Error, Result};

/// Receive window. One read drains at most this much; multi-part replies
/// loop until the kernel signals DONE.
const RECV_PAGE: usize = 8192;

/// Async netlink socket bound to NETLINK_ROUTE.
///
/// A socket is owned by exactly one [`super::Connection`] and lives its whole
/// life inside the network namespace it was created in. Crossing a namespace
/// means building a new socket there; an existing socket is never moved.
pub struct NetlinkSocket {
    fd: AsyncFd<Socket>,
    /// Sequence counter; stamped into every request header.
    seq: AtomicU32,
    /// Port ID the kernel assigned at bind time.
    pid: u32,
}

impl NetlinkSocket {
    /// Create a socket in the current network namespace.
    pub fn new() -> Result<Self> {
        let mut socket = Socket::new(NETLINK_ROUTE)?;
        socket.set_non_blocking(true)?;

        let mut addr = SocketAddr::new(0, 0);
        socket.bind(&addr)?;
        socket.get_address(&mut addr)?;
        let pid = addr.port_number();

        let fd = AsyncFd::new(socket)?;

        Ok(Self {
            fd,
            seq: AtomicU32::new(1),
            pid,
        })
    }

    /// Create a socket inside the namespace referenced by an open fd.
    ///
    /// The calling thread temporarily enters the target namespace, creates
    /// the socket there, and restores its original namespace. The socket
    /// keeps operating in the target namespace from any thread afterwards.
    pub fn new_in_namespace(ns_fd: RawFd) -> Result<Self> {
        let current = File::open("/proc/self/ns/net")
            .map_err(|e| Error::InvalidMessage(format!("cannot open current namespace: {e}")))?;

        // SAFETY: ns_fd is an open descriptor to a network-namespace file;
        // setns(CLONE_NEWNET) rebinds only this thread.
        let ret = unsafe { libc::setns(ns_fd, libc::CLONE_NEWNET) };
        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        let result = Self::new();

        // SAFETY: current was opened from /proc/self/ns/net above and is
        // still open; restoring cannot reference a dead namespace.
        let restore = unsafe { libc::setns(current.as_raw_fd(), libc::CLONE_NEWNET) };
        if restore < 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "failed to restore original namespace after socket creation"
            );
        }

        result
    }

    /// Create a socket inside the namespace at the given path
    /// (`/var/run/netns/<name>` or `/proc/<pid>/ns/net`).
    pub fn new_in_namespace_path<P: AsRef<Path>>(ns_path: P) -> Result<Self> {
        let ns_file = File::open(ns_path.as_ref()).map_err(|e| {
            Error::InvalidMessage(format!(
                "cannot open namespace '{}': {e}",
                ns_path.as_ref().display()
            ))
        })?;
        Self::new_in_namespace(ns_file.as_raw_fd())
    }

    /// Next sequence number.
    pub fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Port ID assigned by the kernel.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Send a complete request message.
    pub async fn send(&self, msg: &[u8]) -> Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::WRITABLE).await?;
            match guard.try_io(|inner| inner.get_ref().send(msg, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(());
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Receive one page worth of reply messages.
    pub async fn recv_page(&self) -> Result<Vec<u8>> {
        let mut buf = BytesMut::with_capacity(RECV_PAGE);
        loop {
            let mut guard = self.fd.ready(Interest::READABLE).await?;
            match guard.try_io(|inner| inner.get_ref().recv(&mut buf, 0)) {
                Ok(result) => {
                    result?;
                    return Ok(buf.to_vec());
                }
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for NetlinkSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.get_ref().as_raw_fd()
    }
}
