//! 单个 Worker 子进程
//!
//! 子进程的 stdin/stdout 由一个独立任务独占；外部只通过消息通道发起调用或关闭，
//! 通过 CancellationToken 强制终止。任何协议违规或 I/O 错误之后该任务都会终止子进程，
//! Worker 不再复用。

use std::process::Stdio;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::protocol::{
    HandshakeResult, ProtocolError, ToolRequest, ToolResponse, HANDSHAKE_METHOD,
    PROTOCOL_VERSION, SHUTDOWN_METHOD,
};
use super::registry::WorkerSpec;
use super::WorkerError;
use crate::core::DatabaseFamily;

/// 发给 Worker 任务的消息
pub(crate) enum WorkerMessage {
    Call {
        tool: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, WorkerError>>,
    },
    Close {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

/// 已完成握手、正在运行的 Worker
pub(crate) struct SpawnedWorker {
    pub handshake: HandshakeResult,
    pub calls: mpsc::Sender<WorkerMessage>,
    pub kill: CancellationToken,
    pub pid: Option<u32>,
}

struct WorkerConnection {
    worker_id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
}

/// 启动子进程并完成握手；握手失败或超时时子进程会被杀掉
pub(crate) async fn spawn_worker(
    worker_id: &str,
    family: DatabaseFamily,
    spec: &WorkerSpec,
    startup_timeout: Duration,
) -> Result<SpawnedWorker, WorkerError> {
    let start_err = |message: String| WorkerError::Start { family, message };

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| start_err(format!("{}: {}", spec.program.display(), e)))?;

    let pid = child.id();
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| start_err("stdin not captured".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| start_err("stdout not captured".into()))?;
    if let Some(stderr) = child.stderr.take() {
        let id = worker_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(worker_id = %id, "worker stderr: {}", line);
            }
        });
    }

    let mut conn = WorkerConnection {
        worker_id: worker_id.to_string(),
        child,
        stdin: Some(stdin),
        stdout: BufReader::new(stdout).lines(),
        next_id: 1,
    };

    let handshake = match tokio::time::timeout(startup_timeout, conn.handshake()).await {
        Ok(Ok(h)) => h,
        Ok(Err(e)) => {
            conn.terminate().await;
            return Err(start_err(e.to_string()));
        }
        Err(_) => {
            conn.terminate().await;
            return Err(WorkerError::Timeout {
                worker_id: worker_id.to_string(),
                tool: HANDSHAKE_METHOD.to_string(),
                timeout_ms: startup_timeout.as_millis() as u64,
            });
        }
    };

    tracing::info!(
        worker_id,
        pid,
        server = %handshake.server,
        tools = handshake.tools.len(),
        "Worker ready"
    );

    let (tx, rx) = mpsc::channel(1);
    let kill = CancellationToken::new();
    tokio::spawn(conn.run(rx, kill.clone()));

    Ok(SpawnedWorker {
        handshake,
        calls: tx,
        kill,
        pid,
    })
}

impl WorkerConnection {
    async fn handshake(&mut self) -> Result<HandshakeResult, WorkerError> {
        let params = serde_json::json!({ "protocol_version": PROTOCOL_VERSION });
        let result = self
            .request(HANDSHAKE_METHOD, params)
            .await?
            .map_err(|e| self.protocol(ProtocolError::Malformed(format!("handshake rejected: {e}"))))?;
        let handshake: HandshakeResult = serde_json::from_value(result)
            .map_err(|e| self.protocol(ProtocolError::Malformed(e.to_string())))?;
        handshake.verify().map_err(|e| self.protocol(e))?;
        Ok(handshake)
    }

    fn protocol(&self, source: ProtocolError) -> WorkerError {
        WorkerError::Protocol {
            worker_id: self.worker_id.clone(),
            source,
        }
    }

    /// 发送一条请求并读取对应响应；外层 Err 为传输/协议错误
    async fn request(
        &mut self,
        method: &str,
        params: Value,
    ) -> Result<Result<Value, String>, WorkerError> {
        let id = self.next_id;
        self.next_id += 1;
        let line = ToolRequest::new(id, method, params)
            .to_line()
            .map_err(|e| self.protocol(e))?;

        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| WorkerError::Exited(self.worker_id.clone()))?;
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            return Err(WorkerError::Io(e.to_string()));
        }
        if let Err(e) = stdin.flush().await {
            return Err(WorkerError::Io(e.to_string()));
        }

        loop {
            let next = self
                .stdout
                .next_line()
                .await
                .map_err(|e| WorkerError::Io(e.to_string()))?;
            let Some(raw) = next else {
                return Err(self.protocol(ProtocolError::Closed));
            };
            if raw.trim().is_empty() {
                continue;
            }
            let response = ToolResponse::parse(&raw).map_err(|e| self.protocol(e))?;
            if response.id != id {
                return Err(self.protocol(ProtocolError::CorrelationMismatch {
                    expected: id,
                    got: response.id,
                }));
            }
            return response.into_outcome().map_err(|e| self.protocol(e));
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<WorkerMessage>, kill: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = kill.cancelled() => None,
                msg = rx.recv() => match msg {
                    Some(m) => Some(m),
                    None => {
                        // 所有发送端都已释放：按默认宽限期关闭
                        self.close(Duration::from_millis(500)).await;
                        return;
                    }
                },
            };
            let Some(message) = message else {
                self.terminate().await;
                return;
            };

            match message {
                WorkerMessage::Call {
                    tool,
                    params,
                    reply,
                } => {
                    let outcome = tokio::select! {
                        r = self.request(&tool, params) => Some(r),
                        _ = kill.cancelled() => None,
                    };
                    match outcome {
                        None => {
                            self.terminate().await;
                            let _ = reply.send(Err(WorkerError::Exited(self.worker_id.clone())));
                            return;
                        }
                        Some(Ok(Ok(value))) => {
                            let _ = reply.send(Ok(value));
                        }
                        Some(Ok(Err(tool_error))) => {
                            let _ = reply.send(Err(WorkerError::Tool(tool_error)));
                        }
                        Some(Err(e)) => {
                            tracing::warn!(worker_id = %self.worker_id, error = %e, "Worker failed; terminating");
                            self.terminate().await;
                            let _ = reply.send(Err(e));
                            return;
                        }
                    }
                }
                WorkerMessage::Close { grace, done } => {
                    self.close(grace).await;
                    let _ = done.send(());
                    return;
                }
            }
        }
    }

    /// 优雅关闭：发送 shutdown、关闭 stdin、等待退出，超过宽限期则强杀
    async fn close(&mut self, grace: Duration) {
        let polite = async {
            let _ = self.request(SHUTDOWN_METHOD, Value::Null).await;
        };
        let _ = tokio::time::timeout(grace, polite).await;
        self.stdin.take();

        let waited = tokio::time::timeout(grace, self.child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                tracing::info!(worker_id = %self.worker_id, %status, "Worker stopped");
            }
            _ => {
                tracing::warn!(worker_id = %self.worker_id, "Worker did not exit within grace period; killing");
                self.terminate().await;
            }
        }
    }

    async fn terminate(&mut self) {
        self.stdin.take();
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(worker_id = %self.worker_id, error = %e, "kill failed (already exited?)");
        }
        let _ = self.child.wait().await;
    }
}
