//! Worker 编排器
//!
//! Worker 表只由一个后台任务持有；所有操作（登记、占用、归还、停止、回收、列表）
//! 都是发给它的命令，因此表的读写天然串行。启动子进程与等待调用结果发生在调用方任务里，
//! 不会阻塞编排循环。
//!
//! 每个 Worker 同一时刻最多只有一个进行中的调用：`Idle → Busy → Idle`；
//! 调用超时或协议出错时 Worker 被强杀并移出表。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::process::{spawn_worker, WorkerMessage};
use super::protocol::ToolSpec;
use super::registry::WorkerRegistry;
use super::WorkerError;
use crate::config::WorkersSection;
use crate::core::DatabaseFamily;

/// 编排器参数（来自 [workers] 段）
#[derive(Clone, Debug)]
pub struct OrchestratorSettings {
    pub call_timeout: Duration,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub idle_timeout: Duration,
    pub reaper_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from(&WorkersSection::default())
    }
}

impl From<&WorkersSection> for OrchestratorSettings {
    fn from(section: &WorkersSection) -> Self {
        Self {
            call_timeout: Duration::from_secs(section.call_timeout_secs),
            startup_timeout: Duration::from_secs(section.startup_timeout_secs),
            stop_grace: Duration::from_millis(section.stop_grace_millis),
            idle_timeout: Duration::from_secs(section.idle_minutes * 60),
            reaper_interval: Duration::from_secs(section.reaper_interval_secs.max(1)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Idle,
    Busy,
    Stopping,
}

/// Worker 的对外视图
#[derive(Clone, Debug, Serialize)]
pub struct WorkerInfo {
    pub id: String,
    pub family: DatabaseFamily,
    pub pid: Option<u32>,
    pub server: String,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub state: WorkerState,
    pub calls: u64,
    pub tools: Vec<ToolSpec>,
}

impl WorkerInfo {
    pub fn is_active(&self) -> bool {
        self.state != WorkerState::Stopping
    }
}

#[derive(Clone)]
struct WorkerEntry {
    info: WorkerInfo,
    last_activity: Instant,
    calls: mpsc::Sender<WorkerMessage>,
    kill: CancellationToken,
}

type Checkout = (mpsc::Sender<WorkerMessage>, CancellationToken);

enum PoolCommand {
    Register(WorkerEntry),
    Checkout {
        id: String,
        reply: oneshot::Sender<Result<Checkout, WorkerError>>,
    },
    Checkin {
        id: String,
    },
    /// 标记为 Stopping 并交出句柄，由调用方执行关闭
    Detach {
        id: String,
        reply: oneshot::Sender<Option<WorkerEntry>>,
    },
    Forget {
        id: String,
    },
    Reap {
        idle: Duration,
        reply: oneshot::Sender<Vec<WorkerEntry>>,
    },
    Get {
        id: String,
        reply: oneshot::Sender<Option<WorkerInfo>>,
    },
    List {
        reply: oneshot::Sender<Vec<WorkerInfo>>,
    },
    Drain {
        reply: oneshot::Sender<Vec<WorkerEntry>>,
    },
}

/// Worker 编排器句柄（可克隆，所有克隆共享同一张表）
#[derive(Clone)]
pub struct WorkerOrchestrator {
    tx: mpsc::UnboundedSender<PoolCommand>,
    registry: Arc<WorkerRegistry>,
    settings: OrchestratorSettings,
    shutdown: CancellationToken,
}

impl WorkerOrchestrator {
    /// 创建编排器并启动后台任务（需在 tokio 运行时内调用）
    pub fn new(registry: WorkerRegistry, settings: OrchestratorSettings) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        tokio::spawn(run_pool(rx, settings.clone(), shutdown.clone()));
        Self {
            tx,
            registry: Arc::new(registry),
            settings,
            shutdown,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn families(&self) -> Vec<DatabaseFamily> {
        self.registry.families()
    }

    fn send(&self, cmd: PoolCommand) -> Result<(), WorkerError> {
        self.tx.send(cmd).map_err(|_| WorkerError::PoolClosed)
    }

    async fn ask<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> PoolCommand,
    ) -> Result<T, WorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| WorkerError::PoolClosed)
    }

    /// 启动指定类型的 Worker，握手成功后登记为 Idle，返回 Worker id
    pub async fn start_worker(&self, family: DatabaseFamily) -> Result<String, WorkerError> {
        if self.shutdown.is_cancelled() {
            return Err(WorkerError::PoolClosed);
        }
        let spec = self.registry.resolve(family)?;
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let id = format!("{}_{}", family, &simple[..12]);

        let spawned = spawn_worker(&id, family, spec, self.settings.startup_timeout).await?;
        let now = Utc::now();
        let entry = WorkerEntry {
            info: WorkerInfo {
                id: id.clone(),
                family,
                pid: spawned.pid,
                server: spawned.handshake.server,
                started_at: now,
                last_activity_at: now,
                state: WorkerState::Idle,
                calls: 0,
                tools: spawned.handshake.tools,
            },
            last_activity: Instant::now(),
            calls: spawned.calls,
            kill: spawned.kill,
        };
        let kill = entry.kill.clone();
        if self.send(PoolCommand::Register(entry)).is_err() {
            kill.cancel();
            return Err(WorkerError::PoolClosed);
        }
        Ok(id)
    }

    /// 调用工具（使用默认超时）
    pub async fn call_tool(&self, id: &str, tool: &str, params: Value) -> Result<Value, WorkerError> {
        self.call_tool_with_timeout(id, tool, params, self.settings.call_timeout)
            .await
    }

    /// 调用工具；超时则强杀 Worker 并返回 Timeout
    pub async fn call_tool_with_timeout(
        &self,
        id: &str,
        tool: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value, WorkerError> {
        let started = std::time::Instant::now();
        let (calls, kill) = self
            .ask(|reply| PoolCommand::Checkout {
                id: id.to_string(),
                reply,
            })
            .await??;

        let (reply, reply_rx) = oneshot::channel();
        let message = WorkerMessage::Call {
            tool: tool.to_string(),
            params,
            reply,
        };
        let result = if calls.send(message).await.is_err() {
            Err(WorkerError::Exited(id.to_string()))
        } else {
            match tokio::time::timeout(timeout, reply_rx).await {
                Ok(Ok(r)) => r,
                Ok(Err(_)) => Err(WorkerError::Exited(id.to_string())),
                Err(_) => {
                    kill.cancel();
                    Err(WorkerError::Timeout {
                        worker_id: id.to_string(),
                        tool: tool.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                }
            }
        };

        match &result {
            Err(e) if e.is_fatal() => {
                let _ = self.send(PoolCommand::Forget { id: id.to_string() });
            }
            _ => {
                let _ = self.send(PoolCommand::Checkin { id: id.to_string() });
            }
        }

        let outcome = match &result {
            Ok(_) => "ok",
            Err(WorkerError::Tool(_)) => "tool_error",
            Err(WorkerError::Timeout { .. }) => "timeout",
            Err(_) => "failed",
        };
        let audit = serde_json::json!({
            "event": "worker_call",
            "worker_id": id,
            "tool": tool,
            "ok": result.is_ok(),
            "outcome": outcome,
            "duration_ms": started.elapsed().as_millis() as u64,
        });
        tracing::info!(audit = %audit.to_string(), "worker");

        result
    }

    /// 停止 Worker；不存在时视为已停止
    pub async fn stop_worker(&self, id: &str) -> Result<(), WorkerError> {
        let entry = self
            .ask(|reply| PoolCommand::Detach {
                id: id.to_string(),
                reply,
            })
            .await?;
        if let Some(entry) = entry {
            close_entry(entry, self.settings.stop_grace).await;
            let _ = self.send(PoolCommand::Forget { id: id.to_string() });
        }
        Ok(())
    }

    /// 停止所有空闲超过 `idle` 的 Worker，返回停止数量
    pub async fn cleanup_inactive(&self, idle: Duration) -> Result<usize, WorkerError> {
        let entries = self.ask(|reply| PoolCommand::Reap { idle, reply }).await?;
        let count = entries.len();
        for entry in entries {
            close_entry(entry, self.settings.stop_grace).await;
        }
        if count > 0 {
            tracing::info!(count, "Stopped inactive workers");
        }
        Ok(count)
    }

    pub async fn list_tools(&self, id: &str) -> Result<Vec<ToolSpec>, WorkerError> {
        self.worker_status(id)
            .await?
            .map(|info| info.tools)
            .ok_or_else(|| WorkerError::NotFound(id.to_string()))
    }

    pub async fn worker_status(&self, id: &str) -> Result<Option<WorkerInfo>, WorkerError> {
        self.ask(|reply| PoolCommand::Get {
            id: id.to_string(),
            reply,
        })
        .await
    }

    pub async fn list_workers(&self) -> Result<Vec<WorkerInfo>, WorkerError> {
        self.ask(|reply| PoolCommand::List { reply }).await
    }

    /// 停止全部 Worker 并关闭编排循环；返回停止数量
    pub async fn shutdown(&self) -> usize {
        let entries = match self.ask(|reply| PoolCommand::Drain { reply }).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let count = entries.len();
        for entry in entries {
            close_entry(entry, self.settings.stop_grace).await;
        }
        self.shutdown.cancel();
        count
    }
}

/// 请求 Worker 优雅退出；忙碌中的 Worker 直接强杀
async fn close_entry(entry: WorkerEntry, grace: Duration) {
    if entry.info.state == WorkerState::Busy {
        entry.kill.cancel();
        return;
    }
    let (done, done_rx) = oneshot::channel();
    let message = WorkerMessage::Close { grace, done };
    if entry.calls.send(message).await.is_err() {
        entry.kill.cancel();
        return;
    }
    // 进程侧最多等待两个宽限期（shutdown 响应 + 退出）
    if tokio::time::timeout(grace * 2 + Duration::from_secs(1), done_rx)
        .await
        .is_err()
    {
        entry.kill.cancel();
    }
}

/// 取出并移除空闲超过 `idle` 的 Worker（返回的句柄状态为 Stopping）
fn take_idle(table: &mut HashMap<String, WorkerEntry>, idle: Duration) -> Vec<WorkerEntry> {
    let now = Instant::now();
    let ids: Vec<String> = table
        .iter()
        .filter(|(_, e)| {
            e.info.state == WorkerState::Idle && now.duration_since(e.last_activity) >= idle
        })
        .map(|(id, _)| id.clone())
        .collect();
    ids.into_iter()
        .filter_map(|id| table.remove(&id))
        .map(|mut e| {
            e.info.state = WorkerState::Stopping;
            e
        })
        .collect()
}

async fn run_pool(
    mut rx: mpsc::UnboundedReceiver<PoolCommand>,
    settings: OrchestratorSettings,
    shutdown: CancellationToken,
) {
    let mut table: HashMap<String, WorkerEntry> = HashMap::new();
    let mut reaper = tokio::time::interval(settings.reaper_interval);
    reaper.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = reaper.tick() => {
                for entry in take_idle(&mut table, settings.idle_timeout) {
                    tracing::info!(worker_id = %entry.info.id, "Reaping idle worker");
                    let grace = settings.stop_grace;
                    tokio::spawn(async move {
                        close_entry(entry, grace).await;
                    });
                }
            }
            cmd = rx.recv() => {
                let Some(cmd) = cmd else { break };
                handle_command(&mut table, cmd);
            }
        }
    }

    for (id, entry) in table.drain() {
        tracing::debug!(worker_id = %id, "Killing worker on pool exit");
        entry.kill.cancel();
    }
}

fn handle_command(table: &mut HashMap<String, WorkerEntry>, cmd: PoolCommand) {
    match cmd {
        PoolCommand::Register(entry) => {
            table.insert(entry.info.id.clone(), entry);
        }
        PoolCommand::Checkout { id, reply } => {
            let result = match table.get_mut(&id) {
                None => Err(WorkerError::NotFound(id)),
                Some(entry) => match entry.info.state {
                    WorkerState::Idle => {
                        entry.info.state = WorkerState::Busy;
                        entry.info.calls += 1;
                        entry.last_activity = Instant::now();
                        entry.info.last_activity_at = Utc::now();
                        Ok((entry.calls.clone(), entry.kill.clone()))
                    }
                    WorkerState::Busy => Err(WorkerError::Busy(id)),
                    WorkerState::Stopping => Err(WorkerError::NotFound(id)),
                },
            };
            let _ = reply.send(result);
        }
        PoolCommand::Checkin { id } => {
            if let Some(entry) = table.get_mut(&id) {
                if entry.info.state == WorkerState::Busy {
                    entry.info.state = WorkerState::Idle;
                }
                entry.last_activity = Instant::now();
                entry.info.last_activity_at = Utc::now();
            }
        }
        PoolCommand::Detach { id, reply } => {
            let entry = match table.get_mut(&id) {
                Some(entry) if entry.info.state != WorkerState::Stopping => {
                    let detached = entry.clone();
                    entry.info.state = WorkerState::Stopping;
                    Some(detached)
                }
                _ => None,
            };
            let _ = reply.send(entry);
        }
        PoolCommand::Forget { id } => {
            table.remove(&id);
        }
        PoolCommand::Reap { idle, reply } => {
            let _ = reply.send(take_idle(table, idle));
        }
        PoolCommand::Get { id, reply } => {
            let _ = reply.send(table.get(&id).map(|e| e.info.clone()));
        }
        PoolCommand::List { reply } => {
            let mut infos: Vec<WorkerInfo> = table.values().map(|e| e.info.clone()).collect();
            infos.sort_by_key(|i| i.started_at);
            let _ = reply.send(infos);
        }
        PoolCommand::Drain { reply } => {
            let _ = reply.send(table.drain().map(|(_, e)| e).collect());
        }
    }
}
