//! 优雅关闭处理
//!
//! 统一的关闭信号监听和清理逻辑，按注册顺序执行：
//! - 停止引擎后台循环（心跳、队列轮询、配置监听）
//! - 停止活动脚本（停止钩子执行，结果写入缓存）
//! - 发送最后一次心跳，带上刚写入的结果，失败忽略

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::engine::Engine;
use crate::remote::RemoteChannel;
use crate::script::ScriptSupervisor;

/// 关闭信号管理器
#[derive(Clone)]
pub struct ShutdownManager {
    shutdown_token: CancellationToken,
    reason_tx: broadcast::Sender<ShutdownReason>,
}

/// 关闭原因
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    FatalError(String),
}

impl ShutdownManager {
    pub fn new() -> Self {
        let (reason_tx, _) = broadcast::channel(1);
        Self {
            shutdown_token: CancellationToken::new(),
            reason_tx,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn shutdown(&self, reason: ShutdownReason) {
        tracing::info!(reason = ?reason, "Shutdown requested");
        let _ = self.reason_tx.send(reason);
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.reason_tx.subscribe()
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown_token.cancelled().await;
    }

    /// 安装系统信号处理器 (Ctrl+C, SIGTERM)
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                    sigterm.recv().await;
                    tracing::info!("Received SIGTERM, initiating graceful shutdown...");
                    manager.shutdown(ShutdownReason::Signal);
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时需要执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 清理任务名称（用于日志）
    fn name(&self) -> &'static str;
}

/// 关闭协调器：按注册顺序执行清理任务，每个任务单独限时
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    cleanup_tasks: Vec<Arc<dyn ShutdownCleanup>>,
    timeout_secs: u64,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            cleanup_tasks: Vec::new(),
            timeout_secs: 5,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn register<T: ShutdownCleanup + 'static>(&mut self, task: T) {
        self.cleanup_tasks.push(Arc::new(task));
    }

    /// 注册引擎的三个清理任务：循环 → 脚本 → 最终心跳
    pub fn register_engine(&mut self, engine: &Arc<Engine>) {
        self.register(EngineLoopsCleanup::new(Arc::clone(engine)));
        self.register(ScriptStopCleanup::new(Arc::clone(engine.supervisor())));
        self.register(FinalHeartbeatCleanup::new(Arc::clone(engine.channel())));
    }

    pub fn len(&self) -> usize {
        self.cleanup_tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cleanup_tasks.is_empty()
    }

    pub async fn run_cleanup(&self) {
        tracing::info!("Running {} cleanup tasks...", self.cleanup_tasks.len());

        let timeout = tokio::time::Duration::from_secs(self.timeout_secs);

        for task in &self.cleanup_tasks {
            let name = task.name();
            match tokio::time::timeout(timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup task '{}' completed successfully", name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup task '{}' failed: {}", name, e);
                }
                Err(_) => {
                    tracing::warn!("Cleanup task '{}' timed out after {}s", name, self.timeout_secs);
                }
            }
        }

        tracing::info!("All cleanup tasks finished");
    }

    pub fn manager(&self) -> &Arc<ShutdownManager> {
        &self.manager
    }
}

/// 停止引擎后台循环
pub struct EngineLoopsCleanup {
    engine: Arc<Engine>,
}

impl EngineLoopsCleanup {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for EngineLoopsCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.engine.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "EngineLoops"
    }
}

/// 停止活动脚本
pub struct ScriptStopCleanup {
    supervisor: Arc<ScriptSupervisor>,
}

impl ScriptStopCleanup {
    pub fn new(supervisor: Arc<ScriptSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for ScriptStopCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        if let Some(script) = self.supervisor.stop().await {
            tracing::info!(script = %script, "Active script stopped for shutdown");
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "ActiveScript"
    }
}

/// 最后一次心跳
pub struct FinalHeartbeatCleanup {
    channel: Arc<RemoteChannel>,
}

impl FinalHeartbeatCleanup {
    pub fn new(channel: Arc<RemoteChannel>) -> Self {
        Self { channel }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for FinalHeartbeatCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.channel.final_heartbeat().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "FinalHeartbeat"
    }
}

/// 运行主应用直到收到关闭信号，然后执行清理
pub async fn run_with_graceful_shutdown<F, Fut>(
    shutdown_manager: Arc<ShutdownManager>,
    app: F,
    cleanup: impl FnOnce() -> Fut,
) where
    F: Future<Output = ()>,
    Fut: Future<Output = ()>,
{
    shutdown_manager.install_signal_handlers();

    tokio::select! {
        _ = app => {
            tracing::info!("Application finished normally");
        }
        _ = shutdown_manager.wait_for_shutdown() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cleanup().await;
}
