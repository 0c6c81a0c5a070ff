//! External command execution.
//!
//! The data plane leans on a handful of CLIs (`iptables`, `ebtables`,
//! `ovs-vsctl`, `ovs-ofctl`, `sysctl`, `systemd-resolve`). All of them go
//! through [`Exec`] so the rule-programming layers can be exercised in tests
//! against a recording mock, and so in-namespace invocations can share one
//! code path with host-side ones.

use std::collections::HashMap;
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Result type for command execution.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Errors from external commands.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The command could not be spawned.
    #[error("cannot run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// The command ran and failed.
    #[error("command failed: {command} (exit {code}): {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
}

impl ExecError {
    /// The failing command line, for callers that probe-and-tolerate.
    pub fn command(&self) -> &str {
        match self {
            Self::Spawn { command, .. } | Self::CommandFailed { command, .. } => command,
        }
    }
}

#[derive(Default)]
struct MockState {
    /// Every command line run, in order.
    commands: Vec<String>,
    /// Canned stdout keyed by exact command line.
    replies: HashMap<String, String>,
    /// Command lines (by substring) that should fail.
    failures: Vec<(String, String)>,
}

enum Inner {
    Real,
    Mock(Mutex<MockState>),
}

/// A command runner: the real thing, or a recorder for tests.
#[derive(Clone)]
pub struct Exec {
    inner: Arc<Inner>,
}

impl Exec {
    /// Runner that spawns real processes.
    pub fn real() -> Self {
        Self {
            inner: Arc::new(Inner::Real),
        }
    }

    /// Recording mock. Commands succeed with empty output unless configured
    /// otherwise.
    pub fn mock() -> Self {
        Self {
            inner: Arc::new(Inner::Mock(Mutex::new(MockState::default()))),
        }
    }

    /// Run a command, returning its stdout. Blocking; safe to call from a
    /// namespace-entered thread (the child inherits the thread's namespace).
    pub fn run_blocking(&self, program: &str, args: &[&str]) -> Result<String> {
        let command_line = render(program, args);
        match &*self.inner {
            Inner::Real => {
                tracing::debug!(command = %command_line, "exec");
                let output = Command::new(program).args(args).output().map_err(|source| {
                    ExecError::Spawn {
                        command: command_line.clone(),
                        source,
                    }
                })?;
                if !output.status.success() {
                    return Err(ExecError::CommandFailed {
                        command: command_line,
                        code: output.status.code().unwrap_or(-1),
                        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                    });
                }
                Ok(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Inner::Mock(state) => {
                let mut state = state.lock().unwrap();
                state.commands.push(command_line.clone());
                if let Some((_, stderr)) = state
                    .failures
                    .iter()
                    .find(|(needle, _)| command_line.contains(needle))
                {
                    return Err(ExecError::CommandFailed {
                        command: command_line,
                        code: 1,
                        stderr: stderr.clone(),
                    });
                }
                Ok(state.replies.get(&command_line).cloned().unwrap_or_default())
            }
        }
    }

    /// Async wrapper over [`Self::run_blocking`].
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let this = self.clone();
        let program = program.to_string();
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        tokio::task::spawn_blocking(move || {
            let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
            this.run_blocking(&program, &arg_refs)
        })
        .await
        .expect("exec task never panics")
    }

    /// Run a command, logging and swallowing failure. For best-effort
    /// teardown paths.
    pub async fn run_tolerated(&self, program: &str, args: &[&str]) {
        if let Err(e) = self.run(program, args).await {
            tracing::warn!(error = %e, "tolerated command failure");
        }
    }

    // ------------------------------------------------------------------------
    // Mock inspection (tests)
    // ------------------------------------------------------------------------

    /// Every command line the mock has run.
    pub fn recorded(&self) -> Vec<String> {
        match &*self.inner {
            Inner::Real => Vec::new(),
            Inner::Mock(state) => state.lock().unwrap().commands.clone(),
        }
    }

    /// Whether any recorded command line contains the needle.
    pub fn saw(&self, needle: &str) -> bool {
        self.recorded().iter().any(|c| c.contains(needle))
    }

    /// Configure the mock to reply with `stdout` for an exact command line.
    pub fn reply_with(&self, command_line: &str, stdout: &str) {
        if let Inner::Mock(state) = &*self.inner {
            state
                .lock()
                .unwrap()
                .replies
                .insert(command_line.to_string(), stdout.to_string());
        }
    }

    /// Configure the mock to fail any command line containing `needle`.
    pub fn fail_on(&self, needle: &str, stderr: &str) {
        if let Inner::Mock(state) = &*self.inner {
            state
                .lock()
                .unwrap()
                .failures
                .push((needle.to_string(), stderr.to_string()));
        }
    }
}

fn render(program: &str, args: &[&str]) -> String {
    let mut line = String::from(program);
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
