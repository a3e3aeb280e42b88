//! Child process transport.
//!
//! Runs an upstream MCP server as a child process and exchanges
//! newline-delimited JSON-RPC on its stdin/stdout. Stderr is drained for
//! diagnostics only. A crash is distinguished from a requested shutdown by
//! the `shutdown_requested` flag at exit time.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::core::{
    Transport, TransportCapabilities, TransportError, TransportEvent, TransportEventEmitter,
    TransportMessage, TransportMetrics, TransportResult, TransportState, TransportType,
};
use mcphub_core::MessageId;

/// Environment injected into every child to keep its output machine-readable
const SANITIZED_ENV: &[(&str, &str)] = &[
    ("NO_COLOR", "1"),
    ("NO_UPDATE_NOTIFIER", "1"),
    ("NPM_CONFIG_UPDATE_NOTIFIER", "false"),
];

/// How the child process is launched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpawnKind {
    /// A local executable
    Local,
    /// The npx packaging front-end; prompts are suppressed and the offline
    /// cache preferred
    Npx {
        /// Package to run
        package: String,
        /// Optional pinned version
        version: Option<String>,
    },
}

/// Configuration for child process transport
#[derive(Debug, Clone)]
pub struct ChildProcessConfig {
    /// Command to execute
    pub command: String,

    /// Arguments to pass to the command
    pub args: Vec<String>,

    /// Working directory for the process
    pub working_directory: Option<String>,

    /// Environment variables to set
    pub environment: HashMap<String, String>,

    /// How the process is launched
    pub spawn_kind: SpawnKind,

    /// Startup deadline for a warm cache
    pub startup_timeout: Duration,

    /// Startup deadline for a first run (package download may be needed)
    pub first_run_timeout: Duration,

    /// Whether the package cache is known to be warm
    pub cache_warmed: bool,

    /// Timeout for process shutdown before a hard kill
    pub shutdown_timeout: Duration,

    /// Maximum message size in bytes
    pub max_message_size: usize,

    /// Whether to kill the process on drop
    pub kill_on_drop: bool,
}

impl Default for ChildProcessConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            working_directory: None,
            environment: HashMap::new(),
            spawn_kind: SpawnKind::Local,
            startup_timeout: Duration::from_secs(10),
            first_run_timeout: Duration::from_secs(120),
            cache_warmed: true,
            shutdown_timeout: Duration::from_secs(5),
            max_message_size: mcphub_core::MAX_MESSAGE_SIZE,
            kill_on_drop: true,
        }
    }
}

impl ChildProcessConfig {
    /// Build a configuration for an npx-packaged server
    #[must_use]
    pub fn npx(package: impl Into<String>, version: Option<String>, args: Vec<String>) -> Self {
        let package = package.into();
        let spec = match &version {
            Some(v) => format!("{package}@{v}"),
            None => package.clone(),
        };
        let mut full_args = vec!["--yes".to_string(), "--prefer-offline".to_string(), spec];
        full_args.extend(args);
        Self {
            command: "npx".to_string(),
            args: full_args,
            spawn_kind: SpawnKind::Npx { package, version },
            cache_warmed: false,
            ..Default::default()
        }
    }

    /// The startup deadline, picked by the cache-warmth flag
    #[must_use]
    pub fn effective_startup_timeout(&self) -> Duration {
        if self.cache_warmed {
            self.startup_timeout
        } else {
            self.first_run_timeout
        }
    }
}

/// Child process transport implementation
#[derive(Debug)]
pub struct ChildProcessTransport {
    /// Process configuration
    config: ChildProcessConfig,

    /// Child process handle
    child: Option<Child>,

    /// Transport state
    state: Arc<Mutex<TransportState>>,

    /// Transport capabilities
    capabilities: TransportCapabilities,

    /// Metrics tracking
    metrics: Arc<Mutex<TransportMetrics>>,

    /// Event emitter
    event_emitter: TransportEventEmitter,

    /// Set before a deliberate stop so exit is not reported as a crash
    shutdown_requested: Arc<AtomicBool>,

    /// STDIO communication channels
    stdin_sender: Option<mpsc::Sender<String>>,
    stdout_receiver: Option<mpsc::Receiver<String>>,

    /// Background task handles
    _stdin_task: Option<tokio::task::JoinHandle<()>>,
    _stdout_task: Option<tokio::task::JoinHandle<()>>,
}

impl ChildProcessTransport {
    /// Create a new child process transport
    #[must_use]
    pub fn new(config: ChildProcessConfig) -> Self {
        let capabilities = TransportCapabilities {
            max_message_size: Some(config.max_message_size),
            supports_streaming: false,
            supports_notifications: true,
            supports_session_id: false,
        };

        Self {
            config,
            child: None,
            state: Arc::new(Mutex::new(TransportState::Disconnected)),
            capabilities,
            metrics: Arc::new(Mutex::new(TransportMetrics::default())),
            event_emitter: TransportEventEmitter::default(),
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            stdin_sender: None,
            stdout_receiver: None,
            _stdin_task: None,
            _stdout_task: None,
        }
    }

    /// Attach an event emitter so lifecycle events reach the supervisor
    #[must_use]
    pub fn with_event_emitter(mut self, emitter: TransportEventEmitter) -> Self {
        self.event_emitter = emitter;
        self
    }

    fn endpoint_label(&self) -> String {
        format!("{} {}", self.config.command, self.config.args.join(" "))
    }

    /// Start the child process and set up communication channels
    async fn start_process(&mut self) -> TransportResult<()> {
        if self.config.command.is_empty() {
            return Err(TransportError::ConfigurationError(
                "Command cannot be empty".to_string(),
            ));
        }

        info!(
            command = %self.config.command,
            args = ?self.config.args,
            "starting child process"
        );

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(self.config.kill_on_drop);

        if let Some(ref wd) = self.config.working_directory {
            cmd.current_dir(wd);
        }

        for (key, value) in SANITIZED_ENV {
            cmd.env(key, value);
        }
        for (key, value) in &self.config.environment {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            error!(error = %e, "failed to spawn child process");
            TransportError::ConnectionFailed(format!("Failed to spawn process: {e}"))
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::ConnectionFailed("Failed to get stdin handle".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::ConnectionFailed("Failed to get stdout handle".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            TransportError::ConnectionFailed("Failed to get stderr handle".to_string())
        })?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(100);
        let (stdout_tx, stdout_rx) = mpsc::channel::<String>(100);

        // STDIN writer task: one JSON document per line
        let stdin_task = {
            let mut writer = BufWriter::new(stdin);
            tokio::spawn(async move {
                let mut stdin_rx = stdin_rx;
                while let Some(message) = stdin_rx.recv().await {
                    if let Err(e) = writer.write_all(message.as_bytes()).await {
                        error!(error = %e, "failed to write to process stdin");
                        break;
                    }
                    if let Err(e) = writer.write_all(b"\n").await {
                        error!(error = %e, "failed to write newline to process stdin");
                        break;
                    }
                    if let Err(e) = writer.flush().await {
                        error!(error = %e, "failed to flush process stdin");
                        break;
                    }
                    trace!("sent message to child process");
                }
                debug!("stdin writer task completed");
            })
        };

        // STDOUT reader task: newline splitter with size guard
        let stdout_task = {
            let reader = BufReader::new(stdout);
            let max_size = self.config.max_message_size;
            tokio::spawn(async move {
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.len() > max_size {
                        warn!(bytes = line.len(), "dropping oversized message from child");
                        continue;
                    }
                    if line.trim().is_empty() {
                        continue;
                    }
                    trace!("received message from child process");
                    if stdout_tx.send(line).await.is_err() {
                        debug!("stdout receiver dropped, stopping reader task");
                        break;
                    }
                }
                debug!("stdout reader task completed");
            })
        };

        // STDERR drain: diagnostics only, never parsed
        let _stderr_task = {
            let reader = BufReader::new(stderr);
            let endpoint = self.endpoint_label();
            tokio::spawn(async move {
                let mut lines = reader.lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(child = %endpoint, "stderr: {line}");
                }
            })
        };

        self.child = Some(child);
        self.stdin_sender = Some(stdin_tx);
        self.stdout_receiver = Some(stdout_rx);
        self._stdin_task = Some(stdin_task);
        self._stdout_task = Some(stdout_task);
        self.shutdown_requested.store(false, Ordering::SeqCst);

        *self.state.lock() = TransportState::Connected;

        // The effective deadline covers the period until the process proves
        // it is alive; first runs of packaged servers get the longer budget.
        let deadline = self.config.effective_startup_timeout();
        match timeout(deadline, self.wait_for_ready()).await {
            Ok(Ok(())) => {
                info!("child process started");
                self.event_emitter.emit(TransportEvent::Connected {
                    transport_type: TransportType::ChildProcess,
                    endpoint: self.endpoint_label(),
                });
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = %e, "child process startup failed");
                self.stop_process().await?;
                Err(e)
            }
            Err(_) => {
                error!("child process startup timed out");
                self.stop_process().await?;
                Err(TransportError::Timeout)
            }
        }
    }

    /// Confirm the process did not exit immediately after spawn
    async fn wait_for_ready(&mut self) -> TransportResult<()> {
        if let Some(ref mut child) = self.child {
            return match child.try_wait() {
                Ok(Some(status)) => {
                    error!(%status, "child process exited early");
                    Err(TransportError::ConnectionFailed(format!(
                        "Process exited early: {status}"
                    )))
                }
                Ok(None) => Ok(()),
                Err(e) => Err(TransportError::ConnectionFailed(format!(
                    "Failed to check process status: {e}"
                ))),
            };
        }
        Err(TransportError::ConnectionFailed(
            "No child process".to_string(),
        ))
    }

    /// Stop the child process gracefully
    async fn stop_process(&mut self) -> TransportResult<()> {
        info!("stopping child process");
        self.shutdown_requested.store(true, Ordering::SeqCst);

        // Closing stdin signals well-behaved servers to exit.
        self.stdin_sender = None;
        self.stdout_receiver = None;

        if let Some(mut child) = self.child.take() {
            match timeout(self.config.shutdown_timeout, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(%status, "child process exited");
                }
                Ok(Err(e)) => {
                    error!(error = %e, "failed to wait for child process exit");
                }
                Err(_) => {
                    warn!("child process shutdown timed out, forcing kill");
                    if let Err(e) = child.kill().await {
                        error!(error = %e, "failed to force kill child process");
                    }
                }
            }
        }

        *self.state.lock() = TransportState::Disconnected;
        self.event_emitter.emit(TransportEvent::Disconnected {
            transport_type: TransportType::ChildProcess,
            endpoint: self.endpoint_label(),
            reason: Some("Process stopped".to_string()),
        });

        Ok(())
    }

    /// Record an unexpected child exit as a crash
    fn mark_crashed(&self, reason: String) {
        *self.state.lock() = TransportState::Failed {
            reason: reason.clone(),
        };
        self.event_emitter.emit(TransportEvent::Crashed {
            transport_type: TransportType::ChildProcess,
            endpoint: self.endpoint_label(),
            reason,
        });
    }

    /// Check if the child process is still running
    pub fn is_process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.child {
            matches!(child.try_wait(), Ok(None))
        } else {
            false
        }
    }
}

#[async_trait]
impl Transport for ChildProcessTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::ChildProcess
    }

    fn capabilities(&self) -> &TransportCapabilities {
        &self.capabilities
    }

    async fn state(&self) -> TransportState {
        self.state.lock().clone()
    }

    async fn connect(&mut self) -> TransportResult<()> {
        match *self.state.lock() {
            TransportState::Connected => return Ok(()),
            TransportState::Connecting => {
                return Err(TransportError::Internal("Already connecting".to_string()));
            }
            _ => {}
        }

        *self.state.lock() = TransportState::Connecting;
        self.start_process().await
    }

    async fn disconnect(&mut self) -> TransportResult<()> {
        self.stop_process().await
    }

    async fn send(&mut self, message: TransportMessage) -> TransportResult<()> {
        let state = self.state.lock().clone();
        if state != TransportState::Connected {
            return Err(TransportError::SendFailed(format!(
                "Cannot send in state: {state}"
            )));
        }

        if message.payload.len() > self.config.max_message_size {
            return Err(TransportError::SendFailed(format!(
                "Message too large: {} bytes (max: {})",
                message.payload.len(),
                self.config.max_message_size
            )));
        }

        let payload_str = String::from_utf8(message.payload.to_vec()).map_err(|e| {
            TransportError::SerializationFailed(format!("Invalid UTF-8 in message payload: {e}"))
        })?;

        if let Some(ref sender) = self.stdin_sender {
            sender.send(payload_str).await.map_err(|_| {
                TransportError::ConnectionLost("STDIN channel closed".to_string())
            })?;

            let mut metrics = self.metrics.lock();
            metrics.messages_sent += 1;
            metrics.bytes_sent += message.payload.len() as u64;
            Ok(())
        } else {
            Err(TransportError::ConnectionLost(
                "No stdin channel available".to_string(),
            ))
        }
    }

    async fn receive(&mut self) -> TransportResult<Option<TransportMessage>> {
        let line = match self.stdout_receiver.as_mut() {
            Some(receiver) => receiver.recv().await,
            None => return Ok(None),
        };

        match line {
            Some(line) => {
                let payload = Bytes::from(line);
                let message =
                    TransportMessage::new(MessageId::from(Uuid::new_v4().to_string()), payload);

                let mut metrics = self.metrics.lock();
                metrics.messages_received += 1;
                metrics.bytes_received += message.payload.len() as u64;
                drop(metrics);

                Ok(Some(message))
            }
            None => {
                // Stdout closed: either a requested shutdown or a crash.
                if self.shutdown_requested.load(Ordering::SeqCst) {
                    Ok(None)
                } else {
                    let status = self
                        .child
                        .as_mut()
                        .and_then(|c| c.try_wait().ok().flatten())
                        .map_or_else(|| "unknown exit".to_string(), |s| s.to_string());
                    let reason = format!("child process exited unexpectedly: {status}");
                    warn!(%reason, "child transport crashed");
                    self.mark_crashed(reason.clone());
                    Err(TransportError::ConnectionLost(reason))
                }
            }
        }
    }

    async fn metrics(&self) -> TransportMetrics {
        self.metrics.lock().clone()
    }

    fn endpoint(&self) -> Option<String> {
        Some(self.endpoint_label())
    }
}

impl Drop for ChildProcessTransport {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            if self.config.kill_on_drop {
                let _ = child.start_kill();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[test]
    fn test_config_defaults() {
        let config = ChildProcessConfig::default();
        assert_eq!(config.startup_timeout, Duration::from_secs(10));
        assert_eq!(config.first_run_timeout, Duration::from_secs(120));
        assert!(config.cache_warmed);
        assert!(config.kill_on_drop);
    }

    #[test]
    fn test_npx_config_flags() {
        let config = ChildProcessConfig::npx(
            "@example/server",
            Some("1.2.3".to_string()),
            vec!["--flag".to_string()],
        );
        assert_eq!(config.command, "npx");
        assert_eq!(
            config.args,
            vec!["--yes", "--prefer-offline", "@example/server@1.2.3", "--flag"]
        );
        assert!(!config.cache_warmed);
        assert!(matches!(config.spawn_kind, SpawnKind::Npx { .. }));
    }

    #[test]
    fn test_effective_startup_timeout() {
        let mut config = ChildProcessConfig::npx("@example/server", None, vec![]);
        assert_eq!(config.effective_startup_timeout(), config.first_run_timeout);
        config.cache_warmed = true;
        assert_eq!(config.effective_startup_timeout(), config.startup_timeout);
    }

    #[tokio::test]
    async fn test_empty_command_error() {
        let mut transport = ChildProcessTransport::new(ChildProcessConfig::default());
        let result = transport.connect().await;
        assert!(matches!(
            result,
            Err(TransportError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let mut transport = ChildProcessTransport::new(ChildProcessConfig {
            command: "cat".to_string(),
            ..Default::default()
        });
        let message = TransportMessage::new(MessageId::from("m1"), Bytes::from("{}"));
        assert!(matches!(
            transport.send(message).await,
            Err(TransportError::SendFailed(_))
        ));
    }

    // Integration test with a simple line-echoing command
    #[tokio::test]
    async fn test_echo_roundtrip() {
        let config = ChildProcessConfig {
            command: "cat".to_string(),
            startup_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let mut transport = ChildProcessTransport::new(config);
        if transport.connect().await.is_ok() {
            sleep(Duration::from_millis(50)).await;

            let payload = Bytes::from(r#"{"jsonrpc":"2.0","method":"ping","id":1}"#);
            let message = TransportMessage::new(MessageId::from("m1"), payload.clone());
            if transport.send(message).await.is_ok() {
                if let Ok(Some(response)) = transport.receive().await {
                    assert_eq!(response.payload, payload);
                }
            }
            let _ = transport.disconnect().await;
        }
        // May be skipped in environments where spawning 'cat' is restricted.
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_crash() {
        let config = ChildProcessConfig {
            command: "true".to_string(),
            startup_timeout: Duration::from_secs(5),
            ..Default::default()
        };

        let mut transport = ChildProcessTransport::new(config);
        if transport.connect().await.is_ok() {
            // 'true' exits immediately; the next receive observes the crash.
            match transport.receive().await {
                Err(TransportError::ConnectionLost(reason)) => {
                    assert!(reason.contains("unexpectedly"));
                    assert!(matches!(
                        transport.state().await,
                        TransportState::Failed { .. }
                    ));
                }
                Ok(None) => panic!("exit without shutdown must be reported as a crash"),
                other => panic!("unexpected receive outcome: {other:?}"),
            }
        }
    }
}
