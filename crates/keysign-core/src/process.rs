//! Subprocess execution
//!
//! Every external tool a ceremony touches runs through [`ProcessRunner`].
//! A non-zero exit surfaces as [`ProcessError::NonZeroExit`]: completeness
//! checks read that as "not done yet" through [`probe`], actions treat it as
//! a failure.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{ChildStdin, Command, Stdio};

use thiserror::Error;
use tracing::debug;

use crate::secret::SecretBytes;

/// Errors from running an external tool
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The program could not be started at all
    #[error("Failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The program ran and reported failure
    #[error("{program} failed ({status}){}", stderr_suffix(.stderr))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        status: String,
        stderr: String,
    },

    /// Talking to the running program failed
    #[error("IO error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn stderr_suffix(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {}", stderr)
    }
}

impl ProcessError {
    /// Whether the program ran and exited unsuccessfully
    pub fn is_non_zero_exit(&self) -> bool {
        matches!(self, ProcessError::NonZeroExit { .. })
    }
}

/// A secret handed to the child on a dedicated file descriptor
#[derive(Debug, Clone)]
pub struct SecretHandoff {
    /// Descriptor number the child reads the secret from
    pub fd: i32,
    pub secret: SecretBytes,
}

/// Everything needed to run one external command.
///
/// Secrets only travel in `stdin` and `secret_fd`; `args` and `env` are
/// visible to other processes on the host and must never carry them.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Full replacement for the child's environment when set
    pub env: Option<BTreeMap<String, String>>,
    pub stdin: Option<SecretBytes>,
    pub secret_fd: Option<SecretHandoff>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: None,
            stdin: None,
            secret_fd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Replace the child's environment entirely
    pub fn env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    /// Write `payload` to the child's stdin, then close it
    pub fn stdin(mut self, payload: SecretBytes) -> Self {
        self.stdin = Some(payload);
        self
    }

    /// Deliver `secret` on descriptor `fd` in the child only
    pub fn secret_fd(mut self, fd: i32, secret: SecretBytes) -> Self {
        self.secret_fd = Some(SecretHandoff { fd, secret });
        self
    }

    /// Program and arguments, for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn io_error(&self, source: io::Error) -> ProcessError {
        ProcessError::Io {
            program: self.program.clone(),
            source,
        }
    }
}

/// Captured result of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
}

impl Output {
    pub fn new(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
        }
    }

    /// Stdout as (lossy) UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Move stdout into a zeroize-on-drop buffer without copying
    pub fn into_secret(self) -> SecretBytes {
        SecretBytes::new(self.stdout)
    }
}

/// Runs external commands on behalf of a ceremony
pub trait ProcessRunner {
    /// Run `spec` to completion. Non-zero exit is [`ProcessError::NonZeroExit`].
    fn run(&self, spec: &CommandSpec) -> Result<Output, ProcessError>;
}

/// Read a probe's result as a completeness answer.
///
/// Success means complete, a non-zero exit means "not yet", anything else
/// (the tool is missing, IO failed) is a real error.
pub fn probe(result: Result<Output, ProcessError>) -> Result<bool, ProcessError> {
    match result {
        Ok(_) => Ok(true),
        Err(e) if e.is_non_zero_exit() => Ok(false),
        Err(e) => Err(e),
    }
}

/// [`ProcessRunner`] backed by `std::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<Output, ProcessError> {
        debug!(command = %spec.display(), "Running");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        if let Some(env) = &spec.env {
            cmd.env_clear().envs(env);
        }

        let channel = match &spec.secret_fd {
            Some(handoff) => {
                Some(handoff::attach(&mut cmd, handoff.fd).map_err(|e| spec.io_error(e))?)
            }
            None => None,
        };

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        // Inputs are written while the output pipes drain, so a chatty child
        // cannot stall on a full stderr before it has read its stdin.
        let stdin = child.stdin.take();
        let (output, write_error) = std::thread::scope(|scope| {
            let writer = scope.spawn(move || feed(spec, channel, stdin));
            let output = child.wait_with_output();
            let write_error = writer
                .join()
                .unwrap_or_else(|_| Some(io::Error::other("input writer panicked")));
            (output, write_error)
        });
        let output = output.map_err(|e| spec.io_error(e))?;

        if !output.status.success() {
            return Err(ProcessError::NonZeroExit {
                program: spec.program.clone(),
                code: output.status.code(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        if let Some(e) = write_error {
            return Err(spec.io_error(e));
        }

        Ok(Output {
            stdout: output.stdout,
        })
    }
}

/// Hand the secret and the stdin payload to the child, closing each pipe
/// afterwards. An early exit turns these writes into EPIPE; the caller lets
/// the exit status win over the returned error.
fn feed(
    spec: &CommandSpec,
    channel: Option<handoff::Channel>,
    stdin: Option<ChildStdin>,
) -> Option<io::Error> {
    let mut write_error = None;
    if let (Some(channel), Some(handoff)) = (channel, &spec.secret_fd) {
        if let Err(e) = channel.deliver(handoff.secret.expose()) {
            write_error.get_or_insert(e);
        }
    }
    if let (Some(mut stdin), Some(payload)) = (stdin, &spec.stdin) {
        if let Err(e) = stdin.write_all(payload.expose()) {
            write_error.get_or_insert(e);
        }
    }
    write_error
}

#[cfg(unix)]
mod handoff {
    use std::fs::File;
    use std::io::{self, Write};
    use std::os::fd::{AsRawFd, OwnedFd, RawFd};
    use std::os::unix::process::CommandExt;
    use std::process::Command;

    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use nix::unistd::{dup2, pipe};

    /// Parent side of a one-shot secret pipe
    pub(super) struct Channel {
        reader: Option<OwnedFd>,
        writer: File,
    }

    /// Open a close-on-exec pipe and arrange for its read end to appear as
    /// `target` in the child, and only in the child.
    #[allow(unsafe_code)]
    pub(super) fn attach(cmd: &mut Command, target: RawFd) -> io::Result<Channel> {
        let (reader, writer) = pipe()?;
        for end in [&reader, &writer] {
            fcntl(end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        }

        let source = reader.as_raw_fd();
        // SAFETY: pre_exec runs between fork() and exec(). The closure only
        // issues dup2/fcntl on descriptor numbers captured by value; it does
        // not allocate or take locks.
        unsafe {
            cmd.pre_exec(move || {
                if source == target {
                    // dup2 onto itself would keep FD_CLOEXEC set
                    fcntl(source, FcntlArg::F_SETFD(FdFlag::empty()))?;
                } else {
                    dup2(source, target)?;
                }
                Ok(())
            });
        }

        Ok(Channel {
            reader: Some(reader),
            writer: File::from(writer),
        })
    }

    impl Channel {
        /// Close our read end, write the secret, close the write end
        pub(super) fn deliver(mut self, secret: &[u8]) -> io::Result<()> {
            drop(self.reader.take());
            self.writer.write_all(secret)
        }
    }
}

#[cfg(not(unix))]
mod handoff {
    use std::io;
    use std::process::Command;

    pub(super) struct Channel;

    pub(super) fn attach(_cmd: &mut Command, _target: i32) -> io::Result<Channel> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "secret descriptor handoff requires a Unix platform",
        ))
    }

    impl Channel {
        pub(super) fn deliver(self, _secret: &[u8]) -> io::Result<()> {
            Ok(())
        }
    }
}
