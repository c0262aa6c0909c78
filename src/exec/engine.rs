use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

use super::{ElevationStrategy, ExecError, ExecutionRequest, ExecutionResult};

/// Result text of an elevated run. Elevation forbids redirection, so there
/// is never real output to report.
pub const ELEVATED_STATUS: &str = "Command executed with admin rights";

pub const TIMED_OUT_TERMINATED: &str = "Process execution timed out and was terminated.";

pub const TIMED_OUT_NOT_TERMINATED: &str =
    "Process execution timed out but could not be terminated.";

/// Default execution timeout: 30 seconds
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Runs external commands, one child process per call.
///
/// Cheap to clone; clones share nothing mutable. Concurrent `run` calls are
/// independent of each other.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    elevation: ElevationStrategy,
    timeout: Duration,
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::new(ElevationStrategy::platform_default(), DEFAULT_TIMEOUT)
    }
}

impl ProcessEngine {
    pub fn new(elevation: ElevationStrategy, timeout: Duration) -> Self {
        Self { elevation, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn elevation(&self) -> &ElevationStrategy {
        &self.elevation
    }

    /// Runs a request with the engine's configured timeout.
    pub async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecError> {
        self.run_with_timeout(request, self.timeout).await
    }

    /// Runs a request to completion or until `limit` elapses.
    ///
    /// Errors are reserved for failures to start or wait on the child.
    /// A non-zero exit and a timeout are both reported in the result.
    pub async fn run_with_timeout(
        &self,
        request: &ExecutionRequest,
        limit: Duration,
    ) -> Result<ExecutionResult, ExecError> {
        info!(
            kind = %request.kind,
            elevate = request.elevate,
            "Executing {} script: {}",
            request.kind,
            request.command
        );

        let (program, args) = request.kind.invocation(&request.command);
        let result = if request.elevate {
            self.run_elevated(&program, &args, limit).await
        } else {
            self.run_captured(&program, &args, limit).await
        };

        match &result {
            Ok(r) if r.timed_out => {
                warn!(kind = %request.kind, "Execution timed out after {:?}", limit)
            }
            Ok(r) => debug!(kind = %request.kind, exit_code = ?r.exit_code, "Execution finished"),
            Err(e) => error!(kind = %request.kind, "Error executing script: {e}"),
        }
        result
    }

    /// Captured mode: both streams piped and drained concurrently.
    async fn run_captured(
        &self,
        program: &str,
        args: &[String],
        limit: Duration,
    ) -> Result<ExecutionResult, ExecError> {
        let deadline = Instant::now() + limit;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);
        // Own group, so a timeout reaches whatever the command started
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;
        let pgid = child.id();

        // Readers start right away so a chatty child never blocks on a full pipe
        let mut stdout_task = tokio::spawn(collect_lines(child.stdout.take()));
        let mut stderr_task = tokio::spawn(collect_lines(child.stderr.take()));

        let status = match timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => {
                stdout_task.abort();
                stderr_task.abort();
                return Err(ExecError::Wait {
                    program: program.to_string(),
                    source,
                });
            }
            Err(_) => {
                stdout_task.abort();
                stderr_task.abort();
                if let Some(pgid) = pgid {
                    if let Err(e) = kill_group(pgid) {
                        debug!("Cannot signal the process group of '{program}': {e}");
                    }
                }
                return Ok(terminate(&mut child, program).await);
            }
        };

        // The child is gone but a descendant may still hold the pipes open.
        // The drain shares the same deadline.
        let drained = timeout_at(deadline, async {
            let out = (&mut stdout_task).await.unwrap_or_default();
            let err = (&mut stderr_task).await.unwrap_or_default();
            (out, err)
        })
        .await;

        let (stdout, stderr) = match drained {
            Ok(streams) => streams,
            Err(_) => {
                stdout_task.abort();
                stderr_task.abort();
                warn!("Output streams of '{program}' still open after exit");
                let message = match pgid.map(kill_group) {
                    Some(Ok(())) => TIMED_OUT_TERMINATED,
                    Some(Err(e)) => {
                        error!("Error terminating processes left by '{program}': {e}");
                        TIMED_OUT_NOT_TERMINATED
                    }
                    None => TIMED_OUT_NOT_TERMINATED,
                };
                return Ok(timed_out(message));
            }
        };

        if !stderr.is_empty() {
            debug!("'{program}' wrote {} bytes to stderr", stderr.len());
        }

        Ok(finished(status, combine_output(stdout, &stderr)))
    }

    /// Elevated mode: no redirection possible, exit is the only signal.
    async fn run_elevated(
        &self,
        program: &str,
        args: &[String],
        limit: Duration,
    ) -> Result<ExecutionResult, ExecError> {
        let (elevator, elevated_args) = self.elevation.wrap(program, args);
        debug!("Elevating via {elevator}");

        let mut cmd = Command::new(&elevator);
        cmd.args(&elevated_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
            program: elevator.clone(),
            source,
        })?;

        match tokio::time::timeout(limit, child.wait()).await {
            Ok(Ok(status)) if self.elevation.refused(status.code()) => {
                warn!("Elevation of '{program}' refused, {elevator} exited with {status}");
                Err(ExecError::ElevationRefused {
                    program: program.to_string(),
                    code: status.code().unwrap_or_default(),
                })
            }
            Ok(Ok(status)) => Ok(finished(status, ELEVATED_STATUS.to_string())),
            Ok(Err(source)) => Err(ExecError::Wait {
                program: elevator,
                source,
            }),
            Err(_) => Ok(terminate(&mut child, &elevator).await),
        }
    }
}

/// Appends an `Errors:` section when stderr is non-empty, then trims the
/// trailing whitespace.
pub(crate) fn combine_output(mut stdout: String, stderr: &str) -> String {
    if !stderr.is_empty() {
        if !stdout.is_empty() {
            stdout.push('\n');
        }
        stdout.push_str("Errors:\n");
        stdout.push_str(stderr);
    }
    stdout.trim_end().to_string()
}

fn finished(status: ExitStatus, output: String) -> ExecutionResult {
    ExecutionResult {
        output,
        succeeded: status.success(),
        timed_out: false,
        exit_code: status.code(),
    }
}

fn timed_out(message: &str) -> ExecutionResult {
    ExecutionResult {
        output: message.to_string(),
        succeeded: false,
        timed_out: true,
        exit_code: None,
    }
}

/// Kills a child past its deadline. The result is a timeout either way.
async fn terminate(child: &mut Child, program: &str) -> ExecutionResult {
    match child.kill().await {
        Ok(()) => timed_out(TIMED_OUT_TERMINATED),
        Err(e) => {
            error!("Error terminating '{program}': {e}");
            timed_out(TIMED_OUT_NOT_TERMINATED)
        }
    }
}

/// Sends SIGKILL to every process in the group led by `pgid`.
#[cfg(unix)]
fn kill_group(pgid: u32) -> std::io::Result<()> {
    let pgid = libc::pid_t::try_from(pgid)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;
    // SAFETY: kill() takes plain integers; a negative pid targets the group
    let rc = unsafe { libc::kill(-pgid, libc::SIGKILL) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

/// Reads a stream to end-of-stream, one line at a time, each line followed
/// by `\n`. Invalid UTF-8 is replaced rather than failing the read.
async fn collect_lines<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let mut reader = BufReader::new(reader);
    let mut buffer = String::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                buffer.push_str(&String::from_utf8_lossy(&line));
                buffer.push('\n');
            }
            Err(e) => {
                debug!("Stream read error: {e}");
                break;
            }
        }
    }
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::InterpreterKind;

    #[test]
    fn test_combine_output_without_stderr() {
        assert_eq!(combine_output("hello\n\n".to_string(), ""), "hello");
    }

    #[test]
    fn test_combine_output_with_stderr() {
        assert_eq!(
            combine_output("out\n".to_string(), "err\n"),
            "out\n\nErrors:\nerr"
        );
    }

    #[test]
    fn test_combine_output_only_stderr() {
        assert_eq!(combine_output(String::new(), "boom\n"), "Errors:\nboom");
    }

    #[cfg(unix)]
    fn shell(command: &str) -> ExecutionRequest {
        ExecutionRequest::new(InterpreterKind::ShellCommand, command, false)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_stdout() {
        let engine = ProcessEngine::default();
        let result = engine.run(&shell("echo hello; echo world")).await.unwrap();
        assert_eq!(result.output, "hello\nworld");
        assert!(result.succeeded);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.output.contains("Errors:"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_appends_errors_section() {
        let engine = ProcessEngine::default();
        let result = engine
            .run(&shell("echo out; echo oops 1>&2"))
            .await
            .unwrap();
        assert_eq!(result.output, "out\n\nErrors:\noops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_failure_exit_code() {
        let engine = ProcessEngine::default();
        let result = engine.run(&shell("echo partial; exit 3")).await.unwrap();
        assert!(!result.succeeded);
        assert!(!result.timed_out);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.output, "partial");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out_and_terminates() {
        let engine = ProcessEngine::default();
        let started = std::time::Instant::now();
        let result = engine
            .run_with_timeout(&shell("sleep 5"), Duration::from_millis(300))
            .await
            .unwrap();
        assert!(result.timed_out);
        assert!(!result.succeeded);
        assert_eq!(result.output, TIMED_OUT_TERMINATED);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_kills_background_pipe_holders() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("still-running");
        let command = format!("echo fast; (sleep 1; touch '{}') &", marker.display());

        let engine = ProcessEngine::default();
        let started = std::time::Instant::now();
        let result = engine
            .run_with_timeout(&shell(&command), Duration::from_millis(500))
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(result.timed_out);
        assert_eq!(result.output, TIMED_OUT_TERMINATED);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "background job survived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_the_whole_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("grandchild");
        let command = format!("(sleep 1; touch '{}') & sleep 5", marker.display());

        let engine = ProcessEngine::default();
        let result = engine
            .run_with_timeout(&shell(&command), Duration::from_millis(300))
            .await
            .unwrap();
        assert_eq!(result.output, TIMED_OUT_TERMINATED);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "grandchild survived the timeout");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_elevated_run_never_reports_output() {
        // `env` stands in for the privilege prompt: it just runs its argv
        let engine = ProcessEngine::new(
            ElevationStrategy::Prefix {
                program: "env".to_string(),
                args: vec![],
            },
            DEFAULT_TIMEOUT,
        );
        let request = ExecutionRequest::new(InterpreterKind::ShellCommand, "echo secret", true);
        let result = engine.run(&request).await.unwrap();
        assert_eq!(result.output, ELEVATED_STATUS);
        assert!(!result.output.contains("secret"));
        assert!(result.succeeded);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_elevated_run_refused_is_an_error() {
        let engine = ProcessEngine::new(
            ElevationStrategy::Prefix {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 126".to_string()],
            },
            DEFAULT_TIMEOUT,
        );
        let request = ExecutionRequest::new(InterpreterKind::ShellCommand, "echo hi", true);
        let err = engine.run(&request).await.unwrap_err();
        assert!(matches!(err, ExecError::ElevationRefused { code: 126, .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_elevated_run_times_out() {
        let engine = ProcessEngine::new(
            ElevationStrategy::Prefix {
                program: "env".to_string(),
                args: vec![],
            },
            Duration::from_millis(300),
        );
        let request = ExecutionRequest::new(InterpreterKind::ShellCommand, "sleep 5", true);
        let result = engine.run(&request).await.unwrap();
        assert!(result.timed_out);
    }

    #[tokio::test]
    async fn test_missing_elevator_is_a_spawn_error() {
        let engine = ProcessEngine::new(
            ElevationStrategy::Prefix {
                program: "/nonexistent/toolbar-kit-elevate".to_string(),
                args: vec![],
            },
            DEFAULT_TIMEOUT,
        );
        let request = ExecutionRequest::new(InterpreterKind::ShellCommand, "echo hi", true);
        let err = engine.run(&request).await.unwrap_err();
        assert!(matches!(err, ExecError::Spawn { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let engine = ProcessEngine::default();
        let a = shell("for i in 1 2 3; do echo alpha; done");
        let b = shell("for i in 1 2 3; do echo beta 1>&2; done");
        let (ra, rb) = tokio::join!(engine.run(&a), engine.run(&b));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert_eq!(ra.output, "alpha\nalpha\nalpha");
        assert_eq!(rb.output, "Errors:\nbeta\nbeta\nbeta");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_python_expression() {
        let available = std::process::Command::new("python3")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !available {
            return;
        }
        let engine = ProcessEngine::default();
        let request = ExecutionRequest::parse("Python", "print(6 * 7)", false).unwrap();
        let result = engine.run(&request).await.unwrap();
        assert_eq!(result.output, "42");
        assert!(!result.output.contains("Errors:"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_is_replaced() {
        let engine = ProcessEngine::default();
        let result = engine.run(&shell("printf 'a\\377b\\n'")).await.unwrap();
        assert_eq!(result.output, "a\u{FFFD}b");
    }
}
