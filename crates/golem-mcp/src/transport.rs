//! Stdio transport for MCP server communication.
//!
//! Spawns a child process and frames newline-delimited JSON-RPC messages
//! over its stdin/stdout, fanning `message`/`error`/`close` events out to
//! any number of subscribers.

use crate::error::McpError;
use crate::jsonrpc::JsonRpcMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, broadcast};

/// How long `close` waits for a graceful exit before force-killing.
const GRACEFUL_EXIT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the reader waits to collect the exit status after stdout EOF.
const EXIT_STATUS_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum bytes of an unparseable line echoed into an error event.
const PARSE_ERROR_EXCERPT_BYTES: usize = 200;

/// Buffered events per subscriber; slow subscribers drop oldest events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Options for spawning a stdio transport.
#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub command: String,
    pub args: Vec<String>,
    /// Merged over the host environment of the child process.
    pub env: HashMap<String, String>,
}

/// An event emitted by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A parsed JSON-RPC message arrived from the server.
    Message(JsonRpcMessage),
    /// A non-fatal transport problem: an unparseable stdout line or a
    /// chunk of stderr output.
    Error(String),
    /// The underlying process closed; carries its exit code when known.
    Close(Option<i32>),
}

/// The minimal contract the protocol engine needs from a transport.
///
/// Both the real stdio transport and in-memory test doubles implement
/// this; no engine code depends on stdio specifics.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start(&self) -> Result<(), McpError>;
    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError>;
    /// Idempotent; never fails.
    async fn close(&self);
    fn is_connected(&self) -> bool;
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;
    fn pid(&self) -> Option<u32> {
        None
    }
}

struct Shared {
    connected: AtomicBool,
    stdin: Mutex<Option<ChildStdin>>,
    child: Mutex<Option<Child>>,
    pid: std::sync::Mutex<Option<u32>>,
    events: broadcast::Sender<TransportEvent>,
}

/// Async stdio transport speaking line-delimited JSON-RPC to a child
/// process.
pub struct StdioTransport {
    options: TransportOptions,
    started: AtomicBool,
    shared: Arc<Shared>,
}

impl StdioTransport {
    pub fn new(options: TransportOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            options,
            started: AtomicBool::new(false),
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                stdin: Mutex::new(None),
                child: Mutex::new(None),
                pid: std::sync::Mutex::new(None),
                events,
            }),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<(), McpError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(McpError::AlreadyStarted);
        }

        let mut cmd = Command::new(&self.options.command);
        cmd.args(&self.options.args)
            .envs(&self.options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            command: self.options.command.clone(),
            source: e,
        })?;

        // A child that is already gone never produced a usable pipe.
        if let Ok(Some(status)) = child.try_wait() {
            return Err(McpError::ProcessExitedImmediately {
                code: status.code(),
            });
        }

        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::Protocol("child stdin was not captured".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::Protocol("child stdout was not captured".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            McpError::Protocol("child stderr was not captured".to_string())
        })?;

        if let Ok(mut pid) = self.shared.pid.lock() {
            *pid = child.id();
        }
        *self.shared.stdin.lock().await = Some(stdin);
        *self.shared.child.lock().await = Some(child);
        self.shared.connected.store(true, Ordering::SeqCst);

        // Stderr task: surface each trimmed, non-empty chunk as an error
        // event.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if !trimmed.is_empty() {
                    let _ = shared.events.send(TransportEvent::Error(trimmed.to_string()));
                }
            }
        });

        // Reader task: split stdout on newlines, parse each non-empty
        // line, emit message events; emit exactly one close event at EOF.
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcMessage>(&line) {
                    Ok(message) => {
                        let _ = shared.events.send(TransportEvent::Message(message));
                    }
                    Err(e) => {
                        tracing::warn!("failed to parse message from server: {e}");
                        let _ = shared.events.send(TransportEvent::Error(format!(
                            "unparseable message: {}",
                            truncate(&line, PARSE_ERROR_EXCERPT_BYTES)
                        )));
                    }
                }
            }

            shared.connected.store(false, Ordering::SeqCst);
            let code = {
                let mut child = shared.child.lock().await;
                match child.as_mut() {
                    Some(child) => {
                        match tokio::time::timeout(EXIT_STATUS_TIMEOUT, child.wait()).await {
                            Ok(Ok(status)) => status.code(),
                            _ => None,
                        }
                    }
                    None => None,
                }
            };
            let _ = shared.events.send(TransportEvent::Close(code));
        });

        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), McpError> {
        if !self.is_connected() {
            return Err(McpError::NotConnected);
        }
        let mut line = serde_json::to_string(message)?;
        line.push('\n');

        let mut stdin = self.shared.stdin.lock().await;
        let Some(stdin) = stdin.as_mut() else {
            return Err(McpError::NotConnected);
        };
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| McpError::WriteFailed(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| McpError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);

        // Dropping stdin sends EOF, the usual shutdown cue for a
        // well-behaved server.
        self.shared.stdin.lock().await.take();

        let mut child = self.shared.child.lock().await;
        if let Some(child) = child.as_mut() {
            let graceful = tokio::time::timeout(GRACEFUL_EXIT_TIMEOUT, child.wait()).await;
            if graceful.is_err() {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn pid(&self) -> Option<u32> {
        self.shared.pid.lock().ok().and_then(|pid| *pid)
    }
}

fn truncate(line: &str, max_bytes: usize) -> &str {
    if line.len() <= max_bytes {
        return line;
    }
    let mut end = max_bytes;
    while end > 0 && !line.is_char_boundary(end) {
        end -= 1;
    }
    &line[..end]
}
