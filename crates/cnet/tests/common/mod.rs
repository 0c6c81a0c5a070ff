//! Shared helpers for integration tests.
//!
//! Tests run inside throwaway network namespaces so they never disturb the
//! host and can run in parallel. Everything here requires root.

use std::io;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

use cnet::netlink::{Connection, Error, Result};

static NAMESPACE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Install the tracing subscriber once; `RUST_LOG` controls verbosity.
fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

fn unique_ns_name(prefix: &str) -> String {
    let id = NAMESPACE_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("cnet-test-{}-{}-{}", prefix, std::process::id(), id)
}

/// Whether the test process runs as root.
pub fn is_root() -> bool {
    // SAFETY: geteuid has no failure modes.
    unsafe { libc::geteuid() == 0 }
}

/// A test network namespace with automatic cleanup on drop.
pub struct TestNamespace {
    name: String,
}

impl TestNamespace {
    /// Create a namespace with a unique name and bring its loopback up.
    pub fn new(prefix: &str) -> Result<Self> {
        init_logging();
        let name = unique_ns_name(prefix);
        let status = Command::new("ip")
            .args(["netns", "add", &name])
            .status()
            .map_err(|e| Error::Io(io::Error::from(e.kind())))?;
        if !status.success() {
            return Err(Error::InvalidMessage(format!(
                "failed to create namespace {name}"
            )));
        }
        let ns = Self { name };
        ns.exec_ignore("ip", &["link", "set", "lo", "up"]);
        Ok(ns)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace file path, for `Connection::in_namespace_path`.
    pub fn path(&self) -> String {
        format!("/var/run/netns/{}", self.name)
    }

    /// A netlink connection inside this namespace.
    pub fn connection(&self) -> Result<Connection> {
        Connection::in_namespace_path(self.path())
    }

    /// Run a command inside the namespace, returning stdout.
    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let output = Command::new("ip")
            .args(["netns", "exec", &self.name, cmd])
            .args(args)
            .output()
            .map_err(|e| Error::Io(io::Error::from(e.kind())))?;
        if !output.status.success() {
            return Err(Error::InvalidMessage(format!(
                "command failed in {}: {} {:?}: {}",
                self.name,
                cmd,
                args,
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Run a command inside the namespace, ignoring failures.
    pub fn exec_ignore(&self, cmd: &str, args: &[&str]) {
        let _ = Command::new("ip")
            .args(["netns", "exec", &self.name, cmd])
            .args(args)
            .output();
    }
}

impl Drop for TestNamespace {
    fn drop(&mut self) {
        let _ = Command::new("ip")
            .args(["netns", "delete", &self.name])
            .status();
    }
}

/// Skip the test unless running as root.
#[macro_export]
macro_rules! require_root {
    () => {
        if !crate::common::is_root() {
            eprintln!("Skipping test: requires root");
            return Ok(());
        }
    };
}
