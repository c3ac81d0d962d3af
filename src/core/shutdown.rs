//! 优雅关闭
//!
//! 退出时（输入流结束、Ctrl+C 或 SIGTERM）按注册顺序执行清理：
//! 先停止 Agent 的后台清扫与全部 Worker 子进程，再清扫过期会话。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::storage::SessionStore;

/// 触发关闭的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    Interrupt,
    /// SIGTERM
    Terminate,
}

/// 关闭信号
#[derive(Clone, Default)]
pub struct ShutdownManager {
    token: CancellationToken,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        if !self.token.is_cancelled() {
            tracing::info!(reason = ?reason, "Shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// 监听 Ctrl+C 与 SIGTERM
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.shutdown(ShutdownReason::Interrupt);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    manager.shutdown(ShutdownReason::Terminate);
                }
            });
        }
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 按注册顺序执行清理任务；单个任务失败或超时不影响后续任务
pub struct ShutdownCoordinator {
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(task_timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            task_timeout,
        }
    }

    pub fn register(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.tasks.push(task);
    }

    /// 返回成功完成的任务数
    pub async fn run_cleanup(&self) -> usize {
        let mut completed = 0;
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.task_timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    completed += 1;
                    tracing::debug!(task = name, "Cleanup finished");
                }
                Ok(Err(e)) => tracing::warn!(task = name, error = %e, "Cleanup failed"),
                Err(_) => tracing::warn!(
                    task = name,
                    timeout_ms = self.task_timeout.as_millis() as u64,
                    "Cleanup timed out"
                ),
            }
        }
        tracing::info!(completed, total = self.tasks.len(), "Shutdown cleanup finished");
        completed
    }
}

/// 退出前删除过期记录与孤立引用
#[async_trait::async_trait]
impl ShutdownCleanup for SessionStore {
    async fn cleanup(&self) -> anyhow::Result<()> {
        let removed = self.cleanup_expired().await?;
        tracing::info!(removed, "Session store swept");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "session_store"
    }
}

/// 运行 `app` 直到它结束或收到关闭信号，然后执行 `cleanup`
pub async fn run_with_graceful_shutdown<F, Fut>(
    manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    manager.install_signal_handlers();

    tokio::select! {
        _ = app => tracing::info!("Input closed"),
        _ = manager.wait_for_shutdown() => {}
    }

    cleanup().await;
}
