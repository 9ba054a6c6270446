//! Child-process transport speaking line-delimited JSON-RPC
//!
//! The transport owns the child for its whole lifetime: spawn on create,
//! SIGTERM with a short grace then SIGKILL on close. A PID file per server
//! lets a restarted proxy terminate orphans left by a crash.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use mcpproxy_interfaces::CommandSpec;

use super::{Transport, TransportHealth};
use crate::error::{UpstreamError, UpstreamResult};
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

struct ProcessIo {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

/// Stdio transport for a local MCP server process
pub struct StdioTransport {
    server_name: String,
    command: String,
    io: Mutex<Option<ProcessIo>>,
    health: Mutex<TransportHealth>,
    pid_file: Option<PathBuf>,
    shutdown_grace: Duration,
    containerized: bool,
}

impl StdioTransport {
    /// Spawn the configured command and take ownership of the child
    pub async fn spawn(
        server_name: &str,
        spec: CommandSpec,
        pid_file: Option<PathBuf>,
        shutdown_grace: Duration,
        containerized: bool,
    ) -> UpstreamResult<Self> {
        if spec.command.trim().is_empty() {
            return Err(UpstreamError::configuration(format!(
                "server '{}' has an empty command",
                server_name
            )));
        }

        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&spec.env)
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            if !Path::new(dir).is_dir() {
                return Err(UpstreamError::configuration(format!(
                    "working directory '{}' is not readable",
                    dir
                )));
            }
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(&spec.command, e))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            UpstreamError::transport("failed to capture child stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            UpstreamError::transport("failed to capture child stdout")
        })?;

        // Drain stderr so the child never blocks on a full pipe; lines go
        // to the log under the server's name.
        if let Some(stderr) = child.stderr.take() {
            let name = server_name.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %name, "stderr: {}", line);
                }
            });
        }

        if let Some(path) = &pid_file {
            if let Some(pid) = child.id() {
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                if let Err(e) = tokio::fs::write(path, pid.to_string()).await {
                    tracing::warn!(server = %server_name, "failed to write pid file: {}", e);
                }
            }
        }

        tracing::info!(
            server = %server_name,
            command = %spec.command,
            pid = ?child.id(),
            "spawned stdio server"
        );

        Ok(Self {
            server_name: server_name.to_string(),
            command: spec.command,
            io: Mutex::new(Some(ProcessIo {
                child,
                stdin: BufWriter::new(stdin),
                stdout: BufReader::new(stdout),
            })),
            health: Mutex::new(TransportHealth::healthy()),
            pid_file,
            shutdown_grace,
            containerized,
        })
    }

    async fn write_line(io: &mut ProcessIo, line: &str) -> UpstreamResult<()> {
        io.stdin.write_all(line.as_bytes()).await?;
        io.stdin.write_all(b"\n").await?;
        io.stdin.flush().await?;
        Ok(())
    }

    async fn read_line(io: &mut ProcessIo) -> UpstreamResult<String> {
        let mut line = String::new();
        let bytes_read = io.stdout.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(UpstreamError::connection_failed(
                "server closed stdout".to_string(),
            ));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    fn is_process_running(io: &mut ProcessIo) -> bool {
        io.child.try_wait().map_or(true, |status| status.is_none())
    }

    async fn mark_failure(&self, error: &UpstreamError) {
        self.health.lock().await.mark_failure(error.to_string());
    }

    /// Write the request and read until its response arrives. Notifications
    /// and server-initiated requests share the same stream and are skipped.
    async fn request_on(
        io: &mut ProcessIo,
        server_name: &str,
        request: &JsonRpcRequest,
        expected_id: &str,
    ) -> UpstreamResult<JsonRpcResponse> {
        if !Self::is_process_running(io) {
            return Err(UpstreamError::connection_failed(
                "server process has terminated",
            ));
        }

        let json = serde_json::to_string(request)?;
        Self::write_line(io, &json).await?;

        loop {
            let line = Self::read_line(io).await?;
            if line.is_empty() {
                continue;
            }

            let value: serde_json::Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!(server = %server_name, "unparseable line from server: {}", e);
                    continue;
                }
            };

            if value.get("method").is_some() {
                tracing::trace!(server = %server_name, "skipping server-initiated message");
                continue;
            }

            let response: JsonRpcResponse = serde_json::from_value(value)?;
            match response.id_key() {
                Some(ref id) if id.as_str() == expected_id => return Ok(response),
                other => {
                    tracing::warn!(
                        server = %server_name,
                        expected = %expected_id,
                        got = ?other,
                        "response id mismatch; skipping"
                    );
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
    async fn send_request(&self, request: JsonRpcRequest) -> UpstreamResult<JsonRpcResponse> {
        let expected_id = request.id_key().ok_or_else(|| {
            UpstreamError::protocol("send_request requires a request id")
        })?;

        let started = Instant::now();
        let result = {
            let mut guard = self.io.lock().await;
            match guard.as_mut() {
                Some(io) => Self::request_on(io, &self.server_name, &request, &expected_id).await,
                None => Err(UpstreamError::transport("transport not connected")),
            }
        };

        match &result {
            Ok(_) => {
                self.health.lock().await.mark_success(Some(started.elapsed()));
            }
            Err(e) => self.mark_failure(e).await,
        }
        result
    }

    async fn send_notification(&self, notification: JsonRpcRequest) -> UpstreamResult<()> {
        let result = {
            let mut guard = self.io.lock().await;
            match guard.as_mut() {
                Some(io) => {
                    let json = serde_json::to_string(&notification)?;
                    Self::write_line(io, &json).await
                }
                None => Err(UpstreamError::transport("transport not connected")),
            }
        };

        if let Err(e) = &result {
            self.mark_failure(e).await;
        }
        result
    }

    async fn is_alive(&self) -> bool {
        let mut guard = self.io.lock().await;
        match guard.as_mut() {
            Some(io) => Self::is_process_running(io),
            None => false,
        }
    }

    async fn health(&self) -> TransportHealth {
        self.health.lock().await.clone()
    }

    async fn close(&self) -> UpstreamResult<()> {
        let Some(mut io) = self.io.lock().await.take() else {
            return Ok(());
        };

        // Closing stdin asks the server to exit on its own.
        let _ = io.stdin.shutdown().await;

        #[cfg(unix)]
        if let Some(pid) = io.child.id() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }

        match tokio::time::timeout(self.shutdown_grace, io.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.server_name, ?status, "stdio server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %self.server_name, "error waiting for child: {}", e);
            }
            Err(_) => {
                tracing::warn!(server = %self.server_name, "child ignored SIGTERM; killing");
                let _ = io.child.kill().await;
            }
        }

        if let Some(path) = &self.pid_file {
            let _ = tokio::fs::remove_file(path).await;
        }

        self.health.lock().await.connected = false;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }

    fn is_containerized(&self) -> bool {
        self.containerized
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Best effort cleanup; close() is the orderly path
        if let Ok(mut guard) = self.io.try_lock() {
            if let Some(io) = guard.as_mut() {
                let _ = io.child.start_kill();
            }
        }
    }
}

fn spawn_error(command: &str, err: std::io::Error) -> UpstreamError {
    match err.kind() {
        std::io::ErrorKind::NotFound => UpstreamError::CommandNotFound {
            command: command.to_string(),
        },
        std::io::ErrorKind::PermissionDenied => UpstreamError::transport(format!(
            "permission denied spawning '{}': {}",
            command, err
        )),
        _ => UpstreamError::connection_failed(format!(
            "failed to spawn '{}': {}",
            command, err
        )),
    }
}

/// Terminate orphaned children recorded in `*.pid` files under `dir`.
pub async fn reconcile_pid_files(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().map(|e| e != "pid").unwrap_or(true) {
            continue;
        }

        let pid = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents.trim().parse::<i32>().ok(),
            Err(_) => None,
        };

        if let Some(pid) = pid {
            terminate_orphan(pid, &path).await;
        }

        let _ = tokio::fs::remove_file(&path).await;
    }
}

#[cfg(unix)]
async fn terminate_orphan(pid: i32, path: &Path) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(pid);
    // Signal 0 probes for existence without affecting the process
    if kill(pid, None).is_err() {
        return;
    }

    tracing::warn!(?path, pid = pid.as_raw(), "terminating orphaned server process");
    let _ = kill(pid, Signal::SIGTERM);
    tokio::time::sleep(Duration::from_millis(500)).await;
    if kill(pid, None).is_ok() {
        let _ = kill(pid, Signal::SIGKILL);
    }
}

#[cfg(not(unix))]
async fn terminate_orphan(_pid: i32, path: &Path) {
    tracing::warn!(?path, "stale pid file found; process cleanup is unix-only");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn spec(command: &str, args: Vec<&str>) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            args: args.into_iter().map(String::from).collect(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_spawn_missing_command_classifies() {
        let result = StdioTransport::spawn(
            "demo",
            spec("definitely-not-a-real-binary-xyz", vec![]),
            None,
            Duration::from_millis(100),
            false,
        )
        .await;

        assert!(matches!(result, Err(UpstreamError::CommandNotFound { .. })));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let result = StdioTransport::spawn(
            "demo",
            spec("  ", vec![]),
            None,
            Duration::from_millis(100),
            false,
        )
        .await;

        assert!(matches!(result, Err(UpstreamError::Configuration { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_close_cat() {
        let transport = StdioTransport::spawn(
            "demo",
            spec("cat", vec![]),
            None,
            Duration::from_millis(200),
            false,
        )
        .await
        .unwrap();

        assert!(transport.is_alive().await);
        assert!(transport.health().await.connected);

        transport.close().await.unwrap();
        assert!(!transport.is_alive().await);

        // Closing again is fine
        transport.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_request_response_round_trip() {
        // A one-shot server: reads a line, answers a canned response for id 1
        let script = r#"read line; printf '%s\n' '{"jsonrpc":"2.0","result":{"ok":true},"id":1}'"#;
        let transport = StdioTransport::spawn(
            "demo",
            spec("sh", vec!["-c", script]),
            None,
            Duration::from_millis(200),
            false,
        )
        .await
        .unwrap();

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            method: "ping".to_string(),
            params: None,
            id: Some(serde_json::json!(1)),
        };

        let response = transport.send_request(request).await.unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);

        transport.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("demo.pid");

        let transport = StdioTransport::spawn(
            "demo",
            spec("cat", vec![]),
            Some(pid_file.clone()),
            Duration::from_millis(200),
            false,
        )
        .await
        .unwrap();

        assert!(pid_file.exists());
        transport.close().await.unwrap();
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_reconcile_ignores_garbage() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("bogus.pid"), "not-a-pid")
            .await
            .unwrap();
        tokio::fs::write(dir.path().join("other.txt"), "ignored")
            .await
            .unwrap();

        reconcile_pid_files(dir.path()).await;

        assert!(!dir.path().join("bogus.pid").exists());
        assert!(dir.path().join("other.txt").exists());
    }
}
