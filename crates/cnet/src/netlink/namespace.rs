//! Network namespace handling.
//!
//! Two distinct mechanisms live here:
//!
//! 1. **Socket placement**: most cross-namespace work should not move the
//!    thread at all: build a [`super::Connection`] with
//!    [`super::Connection::in_namespace_path`] and the socket does the work
//!    from the other side while the caller stays put.
//! 2. **Thread entry**: operations that read or write per-namespace files
//!    (`/proc/sys/...`) or that must create sockets indirectly need the OS
//!    thread itself inside the namespace. [`NetNs::enter`] switches the
//!    calling thread and returns a guard; until the guard is dropped (or
//!    [`NsGuard::exit`] is called) the thread MUST NOT be yielded to an
//!    async scheduler. Use [`run_in_namespace`] which brackets the closure
//!    on a dedicated blocking thread.
//!
//! Every successful enter is matched by exactly one exit; the guard enforces
//! it by restoring the saved namespace on drop.

use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::error::{Error, Result};

/// Runtime directory for named network namespaces.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Path of the calling thread's network namespace file.
pub fn current_thread_ns_path() -> String {
    // SAFETY: gettid has no failure modes.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    format!("/proc/{}/task/{}/ns/net", std::process::id(), tid)
}

/// Path of a named namespace.
pub fn named_path(name: &str) -> PathBuf {
    PathBuf::from(NETNS_RUN_DIR).join(name)
}

/// Check whether a named namespace exists.
pub fn exists(name: &str) -> bool {
    named_path(name).exists()
}

/// An open handle to a network namespace file.
#[derive(Debug)]
pub struct NetNs {
    file: File,
    path: PathBuf,
}

impl NetNs {
    /// Open a namespace file (`/var/run/netns/<name>` or
    /// `/proc/<pid>/ns/net`).
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            Error::InvalidMessage(format!("cannot open namespace '{}': {e}", path.display()))
        })?;
        Ok(Self { file, path })
    }

    /// Open a named namespace.
    pub fn open_named(name: &str) -> Result<Self> {
        let path = named_path(name);
        if !path.exists() {
            return Err(Error::NamespaceNotFound { name: name.into() });
        }
        Self::open(path)
    }

    /// Raw fd, usable with [`super::Connection::in_namespace`] and
    /// `set_link_netns`.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// The path this handle was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the calling thread into this namespace.
    ///
    /// The returned guard restores the previous namespace on exit or drop.
    /// The calling thread is the unit of affinity: do not await across the
    /// guard's lifetime.
    pub fn enter(&self) -> Result<NsGuard> {
        let original = File::open(current_thread_ns_path())
            .map_err(|e| Error::InvalidMessage(format!("cannot snapshot current namespace: {e}")))?;

        // SAFETY: self.file is an open namespace descriptor; CLONE_NEWNET
        // rebinds only the calling thread's network namespace.
        let ret = unsafe { libc::setns(self.file.as_raw_fd(), libc::CLONE_NEWNET) };
        if ret < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }

        Ok(NsGuard {
            original: Some(original),
        })
    }
}

/// Guard holding the thread inside a namespace; restores the saved namespace
/// when exited or dropped.
#[derive(Debug)]
pub struct NsGuard {
    original: Option<File>,
}

impl NsGuard {
    /// Leave the namespace explicitly, surfacing restore errors.
    pub fn exit(mut self) -> Result<()> {
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        if let Some(original) = self.original.take() {
            // SAFETY: original was snapshotted from this thread's own
            // namespace file and is still open.
            let ret = unsafe { libc::setns(original.as_raw_fd(), libc::CLONE_NEWNET) };
            if ret < 0 {
                return Err(Error::Io(std::io::Error::last_os_error()));
            }
        }
        Ok(())
    }
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "failed to restore network namespace on exit");
        }
    }
}

/// Run a blocking closure with the OS thread inside the given namespace.
///
/// The closure executes on a dedicated blocking thread that enters the
/// namespace, runs, and exits before the future resolves, so the enter/exit
/// bracket can never straddle an await point.
pub async fn run_in_namespace<P, F, T>(ns_path: P, f: F) -> Result<T>
where
    P: AsRef<Path>,
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    let path = ns_path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || {
        let ns = NetNs::open(&path)?;
        let guard = ns.enter()?;
        let result = f();
        guard.exit()?;
        result
    })
    .await
    .map_err(|e| Error::InvalidMessage(format!("namespace task panicked: {e}")))?
}

// ============================================================================
// Named namespaces
// ============================================================================

/// Create a named namespace: a fresh network namespace bind-mounted onto
/// `/var/run/netns/<name>`. Succeeds if the namespace already exists.
pub async fn create_named(name: &str) -> Result<()> {
    if exists(name) {
        return Ok(());
    }
    let target = named_path(name);

    tokio::task::spawn_blocking(move || {
        std::fs::create_dir_all(NETNS_RUN_DIR)?;
        // The mount point must exist before the bind.
        File::create(&target)?;

        let original = File::open(current_thread_ns_path())?;

        // SAFETY: unshare(CLONE_NEWNET) detaches only this thread into a new
        // network namespace.
        if unsafe { libc::unshare(libc::CLONE_NEWNET) } < 0 {
            let err = std::io::Error::last_os_error();
            let _ = std::fs::remove_file(&target);
            return Err(Error::Io(err));
        }

        let src = std::ffi::CString::new(current_thread_ns_path()).expect("no nul in proc path");
        let dst = std::ffi::CString::new(target.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::InvalidMessage("namespace name contains NUL".into()))?;

        // SAFETY: both paths are valid C strings; MS_BIND keeps the new
        // namespace alive past this thread.
        let mounted =
            unsafe { libc::mount(src.as_ptr(), dst.as_ptr(), std::ptr::null(), libc::MS_BIND, std::ptr::null()) };
        let mount_err = std::io::Error::last_os_error();

        // Return the thread to its original namespace regardless.
        // SAFETY: original is this thread's own saved namespace descriptor.
        if unsafe { libc::setns(original.as_raw_fd(), libc::CLONE_NEWNET) } < 0 {
            warn!(
                error = %std::io::Error::last_os_error(),
                "failed to restore namespace after creating a named one"
            );
        }

        if mounted < 0 {
            let _ = std::fs::remove_file(&target);
            return Err(Error::Io(mount_err));
        }
        Ok(())
    })
    .await
    .map_err(|e| Error::InvalidMessage(format!("namespace task panicked: {e}")))?
}

/// Delete a named namespace: unmount the bind and remove the file.
pub async fn delete_named(name: &str) -> Result<()> {
    let target = named_path(name);
    if !target.exists() {
        return Ok(());
    }

    tokio::task::spawn_blocking(move || {
        let path = std::ffi::CString::new(target.as_os_str().as_encoded_bytes())
            .map_err(|_| Error::InvalidMessage("namespace name contains NUL".into()))?;

        // SAFETY: path is a valid C string; MNT_DETACH lazily drops the bind
        // even if a process still holds the namespace open.
        if unsafe { libc::umount2(path.as_ptr(), libc::MNT_DETACH) } < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINVAL) && err.raw_os_error() != Some(libc::ENOENT)
            {
                return Err(Error::Io(err));
            }
        }
        std::fs::remove_file(&target)?;
        Ok(())
    })
    .await
    .map_err(|e| Error::InvalidMessage(format!("namespace task panicked: {e}")))?
}
