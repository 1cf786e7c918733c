//! Compiles a model-supplied Rust snippet and runs it with its output
//! captured away from the host's own stdout.
//!
//! The snippet is built with `rustc` in a scratch directory and executed as a
//! child process with piped stdio, so the host's output stream is never
//! redirected and stays intact on every exit path. There is no resource or
//! permission sandboxing beyond that: submitted code runs with the full
//! privilege of this process's user.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::sync::Mutex;

type SandboxResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Wall-clock limit for one execution. Submitted code that loops forever is
/// killed and reported as a failure instead of hanging the host.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

// Executions share process-wide resources (CPU, the scratch binary's
// runtime); only one may run at a time.
static EXEC_LOCK: Mutex<()> = Mutex::const_new(());

/// Result of the compile step. Exactly one variant applies.
#[derive(Debug)]
pub enum CompileOutcome {
    /// Compiler rejected the source; one entry per error line, in order.
    Diagnostics(Vec<String>),
    /// The source built; the handle stays runnable until dropped.
    Executable(CompiledProgram),
}

/// Opaque handle to a built program. Owns the scratch directory so the
/// binary outlives the compile call.
#[derive(Debug)]
pub struct CompiledProgram {
    _dir: TempDir,
    binary: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecResult {
    /// Everything the program wrote to stdout.
    Output(String),
    /// Why the run failed: panic message, exit status, or timeout.
    Failure(String),
}

/// Wrap loose statements in an entry point. Source that already defines
/// `fn main` is passed through untouched; the check is a plain substring
/// match, same as the answer text the model produces.
pub fn normalize_source(source: &str) -> String {
    if source.contains("fn main") {
        source.to_string()
    } else {
        format!("fn main() {{\n{source}\n}}\n")
    }
}

/// Compile `source` in a fresh scratch directory.
///
/// Compiler diagnostics are an outcome, not an error; `Err` here means the
/// toolchain itself could not be driven (rustc missing, scratch dir
/// unwritable).
pub async fn compile(source: &str) -> SandboxResult<CompileOutcome> {
    let dir = tempfile::tempdir()?;
    let source_path = dir.path().join("main.rs");
    let binary = dir.path().join("program");
    tokio::fs::write(&source_path, normalize_source(source)).await?;

    tracing::debug!(path = %source_path.display(), "compiling submitted code");
    let output = Command::new("rustc")
        .arg("--edition")
        .arg("2021")
        .arg("-o")
        .arg(&binary)
        .arg(&source_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if output.status.success() {
        return Ok(CompileOutcome::Executable(CompiledProgram {
            _dir: dir,
            binary,
        }));
    }

    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut diagnostics: Vec<String> = stderr
        .lines()
        .filter(|line| line.starts_with("error"))
        .map(str::to_string)
        .collect();
    if diagnostics.is_empty() {
        diagnostics.push(stderr.trim().to_string());
    }
    Ok(CompileOutcome::Diagnostics(diagnostics))
}

/// Run a compiled program, capturing its stdout, under `deadline`.
pub async fn run(program: &CompiledProgram, deadline: Duration) -> ExecResult {
    let _guard = EXEC_LOCK.lock().await;

    let child = Command::new(&program.binary)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let child = match child {
        Ok(child) => child,
        Err(err) => return ExecResult::Failure(format!("failed to launch program: {err}")),
    };

    let output = match tokio::time::timeout(deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(err)) => {
            return ExecResult::Failure(format!("failed to collect program output: {err}"));
        }
        // Dropping the timed-out future kills the child (kill_on_drop).
        Err(_) => {
            tracing::warn!("submitted code exceeded the execution deadline");
            return ExecResult::Failure(format!(
                "code execution timed out after {}s",
                deadline.as_secs()
            ));
        }
    };

    if output.status.success() {
        ExecResult::Output(String::from_utf8_lossy(&output.stdout).to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = if stderr.trim().is_empty() {
            format!("program exited with {}", output.status)
        } else {
            stderr.trim().to_string()
        };
        ExecResult::Failure(message)
    }
}
