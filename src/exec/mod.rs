//! Process execution engine.
//!
//! Runs one external command per request through one of three interpreter
//! families, with two mutually exclusive modes:
//!
//! - **captured**: stdout/stderr are piped, read line by line while the
//!   child runs, and combined into the result text;
//! - **elevated**: the command goes through the OS privilege mechanism,
//!   which does not allow stream redirection. Completion is the exit
//!   notification and the result text is a fixed status.
//!
//! Both modes are bounded by a timeout. A timed-out child is killed and the
//! result carries `timed_out = true` so callers can tell "ran and failed"
//! apart from "never finished".

mod elevation;
mod engine;
mod launcher;

use std::fmt;
use std::str::FromStr;

pub use elevation::ElevationStrategy;
pub use engine::{ProcessEngine, ELEVATED_STATUS, TIMED_OUT_NOT_TERMINATED, TIMED_OUT_TERMINATED};

/// Interpreter family a command is handed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpreterKind {
    /// `cmd.exe /c` on Windows, `sh -c` elsewhere
    ShellCommand,
    /// PowerShell (`powershell.exe` on Windows, `pwsh` elsewhere)
    NativeShell,
    /// Python (`python.exe` on Windows, `python3` elsewhere)
    ScriptInterpreter,
}

impl InterpreterKind {
    /// Program and argument vector that run `command` with this interpreter.
    ///
    /// The command is passed as a single argument, so no extra quoting is
    /// applied on top of what the interpreter itself expects.
    pub fn invocation(&self, command: &str) -> (String, Vec<String>) {
        let (program, mut args): (&str, Vec<&str>) = match (self, cfg!(windows)) {
            (Self::ShellCommand, true) => ("cmd.exe", vec!["/c"]),
            (Self::ShellCommand, false) => ("sh", vec!["-c"]),
            (Self::NativeShell, true) => (
                "powershell.exe",
                vec!["-NoProfile", "-ExecutionPolicy", "Bypass", "-Command"],
            ),
            (Self::NativeShell, false) => ("pwsh", vec!["-NoProfile", "-Command"]),
            (Self::ScriptInterpreter, true) => ("python.exe", vec!["-c"]),
            (Self::ScriptInterpreter, false) => ("python3", vec!["-c"]),
        };
        args.push(command);
        (
            program.to_string(),
            args.into_iter().map(String::from).collect(),
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShellCommand => "cmd",
            Self::NativeShell => "powershell",
            Self::ScriptInterpreter => "python",
        }
    }
}

impl FromStr for InterpreterKind {
    type Err = ExecError;

    /// Accepts the names button definitions use, case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cmd" | "shell" | "sh" => Ok(Self::ShellCommand),
            "powershell" | "pwsh" => Ok(Self::NativeShell),
            "python" | "python3" => Ok(Self::ScriptInterpreter),
            _ => Err(ExecError::UnsupportedInterpreter(s.to_string())),
        }
    }
}

impl fmt::Display for InterpreterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command to run. Not persisted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub kind: InterpreterKind,
    pub command: String,
    pub elevate: bool,
}

impl ExecutionRequest {
    pub fn new(kind: InterpreterKind, command: impl Into<String>, elevate: bool) -> Self {
        Self {
            kind,
            command: command.into(),
            elevate,
        }
    }

    /// Builds a request from the interpreter name a button carries.
    /// An unknown name fails here, before any process exists.
    pub fn parse(kind: &str, command: impl Into<String>, elevate: bool) -> Result<Self, ExecError> {
        Ok(Self::new(kind.parse()?, command, elevate))
    }
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Captured output (stdout, then an `Errors:` section with stderr), or a
    /// fixed status text for elevated and timed-out runs.
    pub output: String,
    /// The child exited in time with a success status.
    pub succeeded: bool,
    pub timed_out: bool,
    /// Exit code when the OS reports one.
    pub exit_code: Option<i32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("Unsupported script type: {0}")]
    UnsupportedInterpreter(String),

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed while waiting for '{program}': {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("elevation of '{program}' was refused or failed (exit code {code})")]
    ElevationRefused { program: String, code: i32 },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to open '{url}': {reason}")]
    Open { url: String, reason: String },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
}
