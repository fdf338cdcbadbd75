//! Child-process entry points.
//!
//! The entry file runs as its own process so it can be killed on timeout or
//! stop. It talks back to the agent over stdout: any line starting with
//! `@fleet ` carries one JSON message tagged by `op`:
//!
//! ```text
//! @fleet {"op":"log","message":"...","level":"info","step_id":null}
//! @fleet {"op":"step","step_id":"login","description":"...","status":"completed","data":{},"screenshot":true}
//! @fleet {"op":"get_asset","asset_id":"db-password"}
//! @fleet {"op":"result","value":{"success":true}}
//! @fleet {"op":"error","kind":"ValueError","message":"..."}
//! ```
//!
//! `get_asset` is answered with one JSON line on stdin:
//! `{"asset_id":"db-password","value":"..."}` (`null` when missing).
//! Every other stdout line is logged as-is.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};

use crate::api::StepStatus;
use crate::error::{JobError, RuntimeFault};
use crate::execution::{ExecutionContext, LogLevel, RunOutcome};
use crate::package::descriptor::DEPS_DIR;
use crate::runner::{EntryPoint, LoadTarget, PackageLoader};

/// Prefix marking a protocol line on stdout.
pub const PROTOCOL_PREFIX: &str = "@fleet ";

/// Stderr lines kept for failure messages.
const STDERR_TAIL: usize = 20;

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Message {
    Log {
        message: String,
        #[serde(default)]
        level: LogLevel,
        #[serde(default)]
        step_id: Option<String>,
    },
    Step {
        step_id: String,
        #[serde(default)]
        description: String,
        #[serde(default)]
        status: StepStatus,
        #[serde(default)]
        data: Option<Value>,
        #[serde(default)]
        screenshot: bool,
    },
    GetAsset {
        asset_id: String,
    },
    Result {
        value: Value,
    },
    Error {
        kind: String,
        message: String,
    },
}

/// Loads entry files as child processes, picking an interpreter by extension.
#[derive(Debug, Clone)]
pub struct ProcessLoader {
    interpreters: Vec<(String, Vec<String>)>,
}

impl Default for ProcessLoader {
    fn default() -> Self {
        let entry = |ext: &str, argv: &[&str]| {
            (
                ext.to_string(),
                argv.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            )
        };
        Self {
            interpreters: vec![
                entry("sh", &["sh"]),
                entry("bash", &["bash"]),
                entry("py", &["python3", "-u"]),
                entry("js", &["node"]),
            ],
        }
    }
}

impl ProcessLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `argv` to run files with extension `ext`.
    pub fn with_interpreter(mut self, ext: impl Into<String>, argv: Vec<String>) -> Self {
        let ext = ext.into();
        self.interpreters.retain(|(e, _)| *e != ext);
        self.interpreters.push((ext, argv));
        self
    }

    fn interpreter_for(&self, path: &Path) -> Option<&[String]> {
        let ext = path.extension()?.to_str()?;
        self.interpreters
            .iter()
            .find(|(e, _)| e == ext)
            .map(|(_, argv)| argv.as_slice())
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("exe"))
}

#[async_trait]
impl PackageLoader for ProcessLoader {
    async fn load(&self, target: &LoadTarget) -> Result<Arc<dyn EntryPoint>, JobError> {
        if !target.entry_file.is_file() {
            return Err(JobError::LoadFailure {
                path: target.entry_file.clone(),
                reason: "entry file does not exist".to_string(),
            });
        }

        let entry_str = target.entry_file.to_string_lossy().to_string();
        let argv = match self.interpreter_for(&target.entry_file) {
            Some([program, args @ ..]) => {
                let mut argv = vec![program.clone()];
                argv.extend(args.iter().cloned());
                argv.push(entry_str);
                argv
            }
            _ if is_executable(&target.entry_file) => vec![entry_str],
            _ => {
                return Err(JobError::LoadFailure {
                    path: target.entry_file.clone(),
                    reason: "no interpreter for file type and file is not executable".to_string(),
                });
            }
        };

        Ok(Arc::new(ProcessEntry {
            argv,
            package_dir: target.package_dir.clone(),
        }))
    }
}

/// An entry file bound to the command that runs it.
#[derive(Debug)]
pub struct ProcessEntry {
    argv: Vec<String>,
    package_dir: PathBuf,
}

impl ProcessEntry {
    fn command(&self, ctx: &ExecutionContext) -> Result<Command, RuntimeFault> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| RuntimeFault::new("LoadFailure", "empty command"))?;

        let working_dir = ctx
            .working_dir()
            .unwrap_or_else(|| self.package_dir.clone());
        let parameters = serde_json::to_string(ctx.parameters())
            .map_err(|e| RuntimeFault::new("SerializationError", e.to_string()))?;

        let mut python_path = vec![self.package_dir.join(DEPS_DIR), self.package_dir.clone()];
        if let Some(existing) = std::env::var_os("PYTHONPATH") {
            python_path.extend(std::env::split_paths(&existing));
        }
        let python_path = std::env::join_paths(python_path)
            .map_err(|e| RuntimeFault::new("EnvironmentError", e.to_string()))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&working_dir)
            .env("FLEET_EXECUTION_ID", ctx.execution_id())
            .env("FLEET_JOB_ID", ctx.job_id())
            .env("FLEET_WORKING_DIR", &working_dir)
            .env("FLEET_PACKAGE_DIR", &self.package_dir)
            .env("FLEET_PARAMETERS", parameters)
            .env("PYTHONPATH", python_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }

    async fn handle(
        &self,
        ctx: &ExecutionContext,
        message: Message,
        stdin: &mut Option<ChildStdin>,
        reported: &mut Option<Value>,
        fault: &mut Option<RuntimeFault>,
    ) {
        match message {
            Message::Log {
                message,
                level,
                step_id,
            } => ctx.log(&message, level, step_id.as_deref()).await,
            Message::Step {
                step_id,
                description,
                status,
                data,
                screenshot,
            } => {
                ctx.log_step(&step_id, &description, status, data, screenshot)
                    .await
            }
            Message::GetAsset { asset_id } => {
                let value = ctx
                    .get_asset(&asset_id)
                    .await
                    .map(|secret| Value::String(secret.expose_secret().to_owned()))
                    .unwrap_or(Value::Null);
                let reply = format!("{}\n", json!({ "asset_id": asset_id, "value": value }));
                if let Some(pipe) = stdin.as_mut()
                    && let Err(e) = write_line(pipe, &reply).await
                {
                    tracing::warn!(execution_id = %ctx.execution_id(), error = %e, "Failed to answer asset request");
                    *stdin = None;
                }
            }
            Message::Result { value } => {
                ctx.set_result(value.clone()).await;
                *reported = Some(value);
            }
            Message::Error { kind, message } => {
                *fault = Some(RuntimeFault::new(kind, message));
            }
        }
    }
}

/// Read one line, replacing invalid UTF-8. `None` at end of stream.
async fn read_line_lossy<R>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn write_line(pipe: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    pipe.write_all(line.as_bytes()).await?;
    pipe.flush().await
}

/// Parse a trailing `Kind: message` line, as printed by uncaught exceptions.
fn fault_from_stderr(tail: &[String]) -> Option<RuntimeFault> {
    let last = tail.iter().rev().find(|l| !l.trim().is_empty())?;
    let (kind, message) = last.split_once(": ")?;
    let kind = kind.trim();
    let short = kind.rsplit('.').next().unwrap_or(kind);
    let looks_like_kind = kind
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && short.chars().next().is_some_and(|c| c.is_ascii_uppercase());
    looks_like_kind.then(|| RuntimeFault::new(short, message.trim()))
}

#[async_trait]
impl EntryPoint for ProcessEntry {
    async fn run(&self, ctx: Arc<ExecutionContext>) -> Result<RunOutcome, RuntimeFault> {
        let mut child = self
            .command(&ctx)?
            .spawn()
            .map_err(|e| RuntimeFault::new("SpawnError", format!("{}: {e}", self.argv.join(" "))))?;
        tracing::info!(execution_id = %ctx.execution_id(), command = %self.argv.join(" "), pid = ?child.id(), "Started package process");

        let mut stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeFault::new("SpawnError", "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| RuntimeFault::new("SpawnError", "stderr not captured"))?;

        let stderr_task = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                let mut tail = VecDeque::with_capacity(STDERR_TAIL);
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                loop {
                    let line = match read_line_lossy(&mut reader, &mut buf).await {
                        Ok(Some(line)) => line,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(execution_id = %ctx.execution_id(), error = %e, "Failed reading package stderr");
                            break;
                        }
                    };
                    ctx.log(&line, LogLevel::Warning, None).await;
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail)
            })
        };

        let cancel = ctx.cancellation();
        let mut reported = None;
        let mut fault = None;
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(RuntimeFault::new("Cancelled", "package process killed"));
                }
                line = read_line_lossy(&mut reader, &mut buf) => match line {
                    Ok(Some(line)) => match line.strip_prefix(PROTOCOL_PREFIX) {
                        Some(payload) => match serde_json::from_str::<Message>(payload) {
                            Ok(message) => {
                                self.handle(&ctx, message, &mut stdin, &mut reported, &mut fault)
                                    .await
                            }
                            Err(e) => {
                                tracing::warn!(execution_id = %ctx.execution_id(), error = %e, "Malformed protocol line");
                                ctx.log(&line, LogLevel::Info, None).await;
                            }
                        },
                        None => ctx.log(&line, LogLevel::Info, None).await,
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(execution_id = %ctx.execution_id(), error = %e, "Failed reading package output");
                        break;
                    }
                },
            }
        }

        // a child still writing gets EPIPE instead of blocking
        drop(reader);
        drop(stdin);
        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(RuntimeFault::new("Cancelled", "package process killed"));
            }
            status = child.wait() => status
                .map_err(|e| RuntimeFault::new("ProcessError", e.to_string()))?,
        };
        let tail = stderr_task.await.unwrap_or_default();
        tracing::info!(execution_id = %ctx.execution_id(), status = %status, "Package process exited");

        if let Some(fault) = fault {
            return Err(fault);
        }

        let Some(code) = status.code() else {
            return Err(RuntimeFault::new(
                "Terminated",
                format!("package process terminated by signal ({status})"),
            ));
        };

        if code != 0 {
            if let Some(fault) = fault_from_stderr(&tail) {
                return Err(fault);
            }
            if !tail.is_empty() {
                return Err(RuntimeFault::new(
                    "ProcessExit",
                    format!("exit code {code}: {}", tail.join(" | ")),
                ));
            }
            return Ok(RunOutcome::ExitCode {
                code: i64::from(code),
            });
        }

        Ok(match reported {
            Some(value) => RunOutcome::from_value(value),
            None => RunOutcome::ExitCode { code: 0 },
        })
    }
}
