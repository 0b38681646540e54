//! External tool invocation.
//!
//! Every kernel-facing side effect in the subsystem goes through an external
//! tool (`rbd`, `mount`, `cryptsetup`, `ip`, `iptables`, ...). This module
//! provides the one seam those invocations pass through: a [`CommandRunner`]
//! that produces the tool's stdout, stderr and exit code. Production code
//! uses [`SystemRunner`]; tests substitute [`ScriptedRunner`].

use std::io::Write;
use std::process::{Command, Stdio};

use parking_lot::Mutex;

use crate::error::{CaskError, CaskResult};

/// Captured result of a tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Exit code; -1 if the process was terminated by a signal.
    pub code: i32,
}

impl ToolOutput {
    /// A successful invocation with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            code: 0,
        }
    }

    /// A failed invocation with the given exit code and stderr.
    #[must_use]
    pub fn fail(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            code,
        }
    }

    /// Whether the tool exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// The stderr tail with trailing newlines removed, for error reporting.
    #[must_use]
    pub fn stderr_trimmed(&self) -> String {
        self.stderr.trim_end_matches('\n').to_string()
    }
}

/// Runs external tools.
///
/// An `Err` return means the tool could not be spawned at all; a spawned
/// tool that exits non-zero is reported through [`ToolOutput::code`] so the
/// caller can apply its own failure policy.
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, optionally piping `stdin` to the child.
    fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> CaskResult<ToolOutput>;
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> CaskResult<ToolOutput> {
        tracing::debug!(program, ?args, "Running external tool");

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|e| CaskError::Internal {
            message: format!("Failed to execute {}: {}", program, e),
        })?;

        if let Some(bytes) = stdin {
            // Take the handle so it is closed before waiting, otherwise the
            // child blocks reading stdin forever.
            let mut pipe = child.stdin.take().ok_or_else(|| CaskError::Internal {
                message: format!("No stdin pipe for {}", program),
            })?;
            pipe.write_all(bytes)?;
        }

        let output = child.wait_with_output()?;
        Ok(ToolOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            code: output.status.code().unwrap_or(-1),
        })
    }
}

/// A recorded invocation, as seen by a [`ScriptedRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Program name.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Bytes piped to stdin, if any.
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    /// Render as a single command line, for assertions.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// [`CommandRunner`] that replays canned outputs and records invocations.
///
/// Outputs are consumed in FIFO order; once the script is exhausted every
/// further invocation succeeds with empty output.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    script: Mutex<std::collections::VecDeque<ToolOutput>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    /// Create a runner with no scripted outputs (everything succeeds).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next output to return.
    pub fn push(&self, output: ToolOutput) {
        self.script.lock().push_back(output);
    }

    /// All invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// Command lines of all invocations recorded so far.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        self.invocations()
            .iter()
            .map(Invocation::command_line)
            .collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> CaskResult<ToolOutput> {
        self.invocations.lock().push(Invocation {
            program: program.to_string(),
            args: args.to_vec(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
        Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| ToolOutput::ok("")))
    }
}
