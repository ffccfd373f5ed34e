use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::time::timeout;

use crate::config::McpServerConfig;
use crate::error::McpError;
use crate::protocol::{Incoming, Notification, Request};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// A JSON-RPC connection to one server.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Sends a request and waits for its result.
    async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, McpError>;

    /// Sends a notification, which has no response.
    async fn notify(&self, method: &str, params: Value) -> Result<(), McpError>;

    /// Shuts the connection down. Outstanding requests fail with
    /// [`McpError::Closed`].
    async fn close(&self);
}

/// Opens transports for server configurations.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        config: &McpServerConfig,
    ) -> Result<Box<dyn McpTransport>, McpError>;
}

/// Launches servers as child processes.
#[derive(Clone, Debug)]
pub struct StdioConnector {
    request_timeout: Duration,
}

impl Default for StdioConnector {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl StdioConnector {
    /// Sets the time limit of each request round trip.
    #[inline]
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

#[async_trait]
impl Connector for StdioConnector {
    async fn connect(
        &self,
        config: &McpServerConfig,
    ) -> Result<Box<dyn McpTransport>, McpError> {
        let transport = StdioTransport::spawn(config, self.request_timeout)?;
        Ok(Box::new(transport))
    }
}

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<i64, oneshot::Sender<Result<Value, McpError>>>,
}

struct Inner {
    server: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: Mutex<Pending>,
}

/// JSON-RPC over the stdin/stdout of a child process, one message per line.
pub struct StdioTransport {
    inner: Arc<Inner>,
    next_id: AtomicI64,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Starts the server process. The handshake is left to the caller.
    pub fn spawn(
        config: &McpServerConfig,
        request_timeout: Duration,
    ) -> Result<Self, McpError> {
        debug!(
            server = %config.name,
            command = %config.command,
            args = ?config.args,
            "starting MCP server"
        );
        let mut child = Command::new(&config.command)
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| McpError::Spawn {
                command: config.command.clone(),
                source,
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(McpError::Io(io::Error::other(
                "child process has no stdio pipes",
            )));
        };

        let inner = Arc::new(Inner {
            server: config.name.clone(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(child),
            pending: Mutex::new(Pending::default()),
        });
        tokio::spawn(read_loop(Arc::clone(&inner), stdout));
        tokio::spawn(drain_stderr(config.name.clone(), stderr));

        Ok(Self {
            inner,
            next_id: AtomicI64::new(0),
            request_timeout,
        })
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn request(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let rx = {
            let mut pending = self.inner.pending.lock().await;
            if pending.closed {
                return Err(McpError::Closed);
            }
            let (tx, rx) = oneshot::channel();
            pending.waiters.insert(id, tx);
            rx
        };
        let line = serde_json::to_string(&Request::new(id, method, params))?;
        trace!(server = %self.inner.server, id, method, "sending MCP request");

        let exchange = async {
            self.inner.write_line(&line).await?;
            rx.await.map_err(|_| McpError::Closed)?
        };
        let result = match timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                method: method.to_owned(),
                timeout: self.request_timeout,
            }),
        };
        if result.is_err() {
            self.inner.pending.lock().await.waiters.remove(&id);
        }
        result
    }

    async fn notify(
        &self,
        method: &str,
        params: Value,
    ) -> Result<(), McpError> {
        let line = serde_json::to_string(&Notification::new(method, params))?;
        let write = self.inner.write_line(&line);
        match timeout(self.request_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(McpError::Timeout {
                method: method.to_owned(),
                timeout: self.request_timeout,
            }),
        }
    }

    async fn close(&self) {
        let mut child = self.inner.child.lock().await;
        if let Err(err) = child.start_kill() {
            debug!(
                server = %self.inner.server,
                "failed to kill MCP server: {err}"
            );
        }
        if timeout(KILL_GRACE, child.wait()).await.is_err() {
            warn!(
                server = %self.inner.server,
                "MCP server did not exit after kill"
            );
        }
        self.inner.fail_pending().await;
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // The reader task keeps `inner` alive, so `kill_on_drop` alone does
        // not fire while the server keeps its stdout open.
        if let Ok(mut child) = self.inner.child.try_lock() {
            let _ = child.start_kill();
        }
    }
}

impl Inner {
    async fn write_line(&self, line: &str) -> Result<(), McpError> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    async fn fail_pending(&self) {
        let mut pending = self.pending.lock().await;
        pending.closed = true;
        // Dropping the senders wakes the waiters with `Closed`.
        pending.waiters.clear();
    }

    async fn dispatch(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }
        let msg: Incoming = match serde_json::from_str(line) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(
                    server = %self.server,
                    "ignoring non-JSON-RPC output: {err}"
                );
                return;
            }
        };

        if let Some(id) = msg.response_id() {
            let Some(tx) = self.pending.lock().await.waiters.remove(&id) else {
                debug!(
                    server = %self.server,
                    id,
                    "response to an unknown request"
                );
                return;
            };
            let result = match (msg.error, msg.result) {
                (Some(err), _) => Err(McpError::Rpc {
                    code: err.code,
                    message: err.message,
                }),
                (None, result) => Ok(result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
            return;
        }

        match (msg.method, msg.id) {
            (Some(method), Some(id)) => {
                // Requests from the server. Only liveness checks are served.
                let reply = if method == "ping" {
                    json!({ "jsonrpc": "2.0", "id": id, "result": {} })
                } else {
                    json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": {
                            "code": -32601,
                            "message":
                                format!("method not supported: {method}"),
                        },
                    })
                };
                if let Err(err) = self.write_line(&reply.to_string()).await {
                    debug!(
                        server = %self.server,
                        "failed to answer `{method}`: {err}"
                    );
                }
            }
            (Some(method), None) => {
                trace!(server = %self.server, "notification `{method}`");
            }
            _ => debug!(server = %self.server, "ignoring unexpected message"),
        }
    }
}

async fn read_loop(inner: Arc<Inner>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => inner.dispatch(&line).await,
            Ok(None) => break,
            Err(err) => {
                warn!(
                    server = %inner.server,
                    "failed to read from MCP server: {err}"
                );
                break;
            }
        }
    }
    debug!(server = %inner.server, "MCP server closed its output");
    inner.fail_pending().await;
}

async fn drain_stderr(server: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(server = %server, "stderr: {line}");
    }
}
