// Script action executor: interpreter dispatch, path sandbox, parameter
// injection and subprocess lifetime. The child is always reaped; timeout and
// shutdown both kill it.

use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ActionConfig, ActionKind, ScriptSource, SecurityConfig};
use crate::executors::ActionExecutor;
use crate::gitsource::{normalize_path, GitSourceManager};
use crate::protocol::{Delivery, ExecutionResult, RenderedParams};

/// Environment prefix parameters are injected under, uppercased:
/// `msg` becomes `REC_PARAM_MSG`.
pub const PARAM_ENV_PREFIX: &str = "REC_PARAM_";

/// Captured output is bounded; the child is still drained to EOF so it never
/// blocks on a full pipe.
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

pub struct ScriptRunner {
    git: Arc<GitSourceManager>,
    security: SecurityConfig,
}

impl ScriptRunner {
    pub fn new(git: Arc<GitSourceManager>, security: SecurityConfig) -> Self {
        Self { git, security }
    }

    async fn resolve_script_path(&self, action: &ActionConfig) -> Result<PathBuf, String> {
        let configured = action
            .script_path
            .as_deref()
            .ok_or_else(|| format!("action '{}' has no script_path", action.id))?;

        match action.source {
            ScriptSource::Git => {
                let url = action
                    .git_options
                    .as_ref()
                    .map(|g| g.url.as_str())
                    .ok_or_else(|| format!("action '{}' has no git_options", action.id))?;
                self.git
                    .script_path(url, configured)
                    .await
                    .map_err(|e| e.to_string())
            }
            ScriptSource::Local => {
                let path = PathBuf::from(configured);
                if path.is_absolute() {
                    Ok(normalize_path(&path))
                } else {
                    let cwd = std::env::current_dir().map_err(|e| e.to_string())?;
                    Ok(normalize_path(&cwd.join(path)))
                }
            }
        }
    }
}

#[async_trait]
impl ActionExecutor for ScriptRunner {
    fn can_handle(&self, kind: ActionKind) -> bool {
        kind == ActionKind::Script
    }

    async fn execute(
        &self,
        action: &ActionConfig,
        _delivery: &Delivery,
        params: &RenderedParams,
        cancel: &CancellationToken,
    ) -> ExecutionResult {
        // Hold the repo read lock for the whole run so a background pull
        // cannot rewrite the script underneath us.
        let _repo_guard = if action.source == ScriptSource::Git {
            let url = action
                .git_options
                .as_ref()
                .map(|g| g.url.as_str())
                .unwrap_or_default();
            match self.git.read_lock(url).await {
                Ok(guard) => Some(guard),
                Err(err) => {
                    return ExecutionResult::failure(
                        1,
                        format!("failed to lock script repository '{url}': {err}"),
                    )
                }
            }
        } else {
            None
        };

        let script = match self.resolve_script_path(action).await {
            Ok(path) => path,
            Err(message) => return ExecutionResult::failure(1, message),
        };

        if let Err(message) = sandbox_check(&script, &self.security.allowed_script_paths) {
            return ExecutionResult::failure(1, message);
        }

        if !script.is_file() {
            return ExecutionResult::failure(
                1,
                format!("script '{}' does not exist", script.display()),
            );
        }

        let (interpreter, pre_args) = interpreter_for(&script);
        let mut command = match &interpreter {
            Some(program) => {
                let mut c = Command::new(program);
                c.args(pre_args);
                c.arg(&script);
                c
            }
            // No known extension: execute directly and rely on the shebang.
            None => Command::new(&script),
        };

        command.args(encode_flags(&action.flags));
        command.args(&action.args);

        command.envs(&self.security.global_env);
        command.envs(&action.env);
        for (key, value) in params {
            command.env(format!("{PARAM_ENV_PREFIX}{}", key.to_uppercase()), value);
        }

        if let Some(dir) = script.parent() {
            command.current_dir(dir);
        }

        let timeout = Duration::from_secs(action.effective_timeout(&self.security));
        debug!(
            action = %action.id,
            script = %script.display(),
            interpreter = interpreter.as_deref().unwrap_or("(direct)"),
            timeout_sec = timeout.as_secs(),
            "running script"
        );

        let result = run_child(command, timeout, cancel).await;
        write_sink(action.stdout.as_deref(), &result.stdout);
        write_sink(action.stderr.as_deref(), &result.stderr);
        result
    }
}

/// Reject a script outside every allowed root. An empty allow-list means
/// unrestricted.
pub fn sandbox_check(script: &Path, allowed: &[PathBuf]) -> Result<(), String> {
    if allowed.is_empty() {
        return Ok(());
    }
    let script = normalize_path(script);
    let permitted = allowed
        .iter()
        .map(|root| normalize_path(root))
        .any(|root| script.starts_with(&root));
    if permitted {
        return Ok(());
    }
    let roots: Vec<String> = allowed.iter().map(|p| p.display().to_string()).collect();
    Err(format!(
        "script '{}' is outside the allowed paths [{}]; add its directory to \
         security.allowed_script_paths or move the script under an allowed root",
        script.display(),
        roots.join(", ")
    ))
}

/// Interpreter and fixed pre-arguments by (lowercased) extension.
pub fn interpreter_for(script: &Path) -> (Option<String>, &'static [&'static str]) {
    let ext = script
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "py" => {
            let python = if find_in_path("python3").is_some() {
                "python3"
            } else {
                "python"
            };
            (Some(python.to_string()), &[])
        }
        "sh" => (Some("sh".to_string()), &[]),
        "bash" => (Some("bash".to_string()), &[]),
        "ps1" => (Some("powershell".to_string()), &["-File"]),
        "rb" => (Some("ruby".to_string()), &[]),
        "js" => (Some("node".to_string()), &[]),
        "go" => (Some("go".to_string()), &["run"]),
        _ => (None, &[]),
    }
}

/// `--key` for empty/"true" values, `--key=value` otherwise. Keys come out
/// in map order, ahead of all positional args.
pub fn encode_flags(flags: &BTreeMap<String, String>) -> Vec<String> {
    flags
        .iter()
        .map(|(key, value)| {
            if value.is_empty() || value == "true" {
                format!("--{key}")
            } else {
                format!("--{key}={value}")
            }
        })
        .collect()
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

async fn run_child(
    mut command: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> ExecutionResult {
    let started = Instant::now();
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return ExecutionResult::failure(1, format!("failed to spawn script: {err}"));
        }
    };

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let stdout_task = tokio::spawn(read_capped(stdout_pipe));
    let stderr_task = tokio::spawn(read_capped(stderr_pipe));

    let mut error = None;
    let exit_code;
    tokio::select! {
        status = child.wait() => {
            exit_code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(err) => {
                    error = Some(format!("failed to wait for script: {err}"));
                    -1
                }
            };
        }
        _ = tokio::time::sleep(timeout) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            exit_code = -1;
            error = Some(format!("script timed out after {}s", timeout.as_secs()));
        }
        _ = cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            exit_code = -1;
            error = Some("script cancelled during shutdown".to_string());
        }
    }

    let stdout = stdout_task.await.unwrap_or_default();
    let stderr = stderr_task.await.unwrap_or_default();

    ExecutionResult {
        exit_code,
        stdout,
        stderr,
        duration_ms: started.elapsed().as_millis() as u64,
        error,
    }
}

/// Read a pipe to EOF, keeping at most `MAX_CAPTURE_BYTES`. Draining past
/// the cap keeps the child from blocking on a full pipe.
async fn read_capped<R: tokio::io::AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                if captured.len() < MAX_CAPTURE_BYTES {
                    let room = MAX_CAPTURE_BYTES - captured.len();
                    captured.extend_from_slice(&chunk[..n.min(room)]);
                }
            }
            Err(_) => break,
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

/// Mirror a captured stream into a configured sink file. Failures are
/// warnings; the execution result already carries the stream.
fn write_sink(path: Option<&Path>, content: &str) {
    let Some(path) = path else { return };
    if let Err(err) = std::fs::write(path, content) {
        warn!(path = %path.display(), error = %err, "failed to write output sink");
    }
}
