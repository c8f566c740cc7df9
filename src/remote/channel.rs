//! 远程控制通道：周期心跳
//!
//! 每轮：取出结果缓存 → 组装状态快照 → 发送。成功则清零失败计数、应用配置、把命令翻译入队；
//! 失败则把结果放回缓存、累加失败计数，达到阈值进入降级模式（只发信号，策略由外部决定）。
//! 下一轮延迟 = 基础间隔，或 min(基础间隔 × 倍数^min(失败数, 上限指数), 上限)。

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

use super::protocol::{Command, CommandDefaults, HeartbeatRequest, HeartbeatResponse};
use super::transport::{HeartbeatTransport, TransportError};
use crate::config::{LiveConfig, ServerSection};
use crate::core::ErrorTracker;
use crate::device::DeviceInfoProvider;
use crate::queue::{TaskQueue, TaskResult};
use crate::script::ScriptSupervisor;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Server rejected heartbeat: {0}")]
    Rejected(String),
}

/// 通道参数（基础间隔取自 LiveConfig）
#[derive(Debug, Clone, Copy)]
pub struct ChannelConfig {
    pub backoff_multiplier: f64,
    pub backoff_cap_exponent: u32,
    pub max_interval: Duration,
    pub degraded_threshold: u32,
    pub clock_skew_warn: Duration,
    pub final_heartbeat_timeout: Duration,
}

impl ChannelConfig {
    pub fn from_server(server: &ServerSection) -> Self {
        Self {
            backoff_multiplier: server.backoff_multiplier,
            backoff_cap_exponent: server.backoff_cap_exponent,
            max_interval: Duration::from_secs(server.max_interval_secs),
            degraded_threshold: server.degraded_threshold,
            clock_skew_warn: Duration::from_secs(server.clock_skew_warn_secs),
            final_heartbeat_timeout: Duration::from_secs(server.final_heartbeat_timeout_secs),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self::from_server(&ServerSection::default())
    }
}

/// 指数退避延迟
pub fn backoff_delay(
    base: Duration,
    failures: u32,
    multiplier: f64,
    cap_exponent: u32,
    ceiling: Duration,
) -> Duration {
    if failures == 0 {
        return base;
    }
    let exponent = failures.min(cap_exponent) as i32;
    let secs = base.as_secs_f64() * multiplier.max(1.0).powi(exponent);
    if !secs.is_finite() || secs >= ceiling.as_secs_f64() {
        return ceiling;
    }
    Duration::from_secs_f64(secs)
}

pub struct RemoteChannel {
    transport: Arc<dyn HeartbeatTransport>,
    device: Arc<dyn DeviceInfoProvider>,
    queue: Arc<TaskQueue>,
    supervisor: Arc<ScriptSupervisor>,
    errors: Arc<ErrorTracker>,
    live: Arc<LiveConfig>,
    config: ChannelConfig,
    defaults: CommandDefaults,
    failures: AtomicU32,
    degraded: watch::Sender<bool>,
    last_heartbeat_at: AtomicI64,
    last_success_at: AtomicI64,
    wake: Notify,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl RemoteChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn HeartbeatTransport>,
        device: Arc<dyn DeviceInfoProvider>,
        queue: Arc<TaskQueue>,
        supervisor: Arc<ScriptSupervisor>,
        errors: Arc<ErrorTracker>,
        live: Arc<LiveConfig>,
        config: ChannelConfig,
        defaults: CommandDefaults,
    ) -> Self {
        let (degraded, _) = watch::channel(false);
        Self {
            transport,
            device,
            queue,
            supervisor,
            errors,
            live,
            config,
            defaults,
            failures: AtomicU32::new(0),
            degraded,
            last_heartbeat_at: AtomicI64::new(0),
            last_success_at: AtomicI64::new(0),
            wake: Notify::new(),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    pub fn subscribe_degraded(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    pub fn last_heartbeat_at(&self) -> Option<i64> {
        Some(self.last_heartbeat_at.load(Ordering::SeqCst)).filter(|t| *t > 0)
    }

    pub fn last_success_at(&self) -> Option<i64> {
        Some(self.last_success_at.load(Ordering::SeqCst)).filter(|t| *t > 0)
    }

    /// 提前触发下一次心跳（ReportStatus 任务）
    pub fn request_report(&self) {
        self.wake.notify_one();
    }

    pub fn next_delay(&self) -> Duration {
        backoff_delay(
            self.live.get().heartbeat_interval(),
            self.consecutive_failures(),
            self.config.backoff_multiplier,
            self.config.backoff_cap_exponent,
            self.config.max_interval,
        )
    }

    pub fn build_request(&self, task_results: Vec<TaskResult>) -> HeartbeatRequest {
        let battery = self.device.battery();
        HeartbeatRequest {
            device_id: self.device.device_id(),
            server_id: self.device.server_id(),
            app_version: self.device.app_version(),
            os_version: self.device.os_version(),
            battery_level: battery.level,
            charging: battery.charging,
            network_type: self.device.network_type(),
            group_tag: self.live.get().group_tag.clone().or_else(|| self.device.group_tag()),
            script: self.supervisor.status(),
            accessibility_enabled: self.supervisor.context().dispatcher().surface_available(),
            last_error: self.errors.last(),
            resources: self.device.resources(),
            task_results,
            degraded: self.is_degraded(),
            timestamp: now_ms(),
        }
    }

    /// 执行一轮心跳，返回入队的命令数
    pub async fn heartbeat_once(&self) -> Result<usize, ChannelError> {
        let request = self.prepare();
        self.exchange(request).await
    }

    /// 取出结果缓存并组装请求
    fn prepare(&self) -> HeartbeatRequest {
        let request = self.build_request(self.queue.drain_results());
        self.last_heartbeat_at.store(request.timestamp, Ordering::SeqCst);
        request
    }

    async fn exchange(&self, request: HeartbeatRequest) -> Result<usize, ChannelError> {
        let outcome = match self.transport.send(&request).await {
            Ok(resp) if resp.success => Ok(resp),
            Ok(resp) => Err(ChannelError::Rejected(
                resp.message.unwrap_or_else(|| "success=false".to_string()),
            )),
            Err(e) => Err(ChannelError::Transport(e)),
        };

        match outcome {
            Ok(resp) => Ok(self.on_success(resp)),
            Err(e) => {
                self.queue.restore_results(request.task_results);
                self.on_failure(&e);
                Err(e)
            }
        }
    }

    fn on_success(&self, resp: HeartbeatResponse) -> usize {
        let previous = self.failures.swap(0, Ordering::SeqCst);
        self.last_success_at.store(now_ms(), Ordering::SeqCst);
        if self.degraded.send_if_modified(|d| std::mem::replace(d, false)) {
            tracing::info!(previous_failures = previous, "Heartbeat recovered, leaving degraded mode");
        }

        if let Some(id) = resp.server_id {
            self.device.set_server_id(id);
        }
        if let Some(server_time) = resp.server_time {
            let skew = (server_time - now_ms()).unsigned_abs();
            if skew > self.config.clock_skew_warn.as_millis() as u64 {
                tracing::warn!(skew_ms = skew, "Clock skew against server exceeds threshold");
            }
        }
        if let Some(update) = resp.config {
            if let Err(e) = self.live.apply_update(&update) {
                tracing::warn!(error = %e, "Ignoring malformed config update");
            }
        }
        if let Some(message) = resp.message {
            tracing::debug!(message = %message, "Server message");
        }

        let mut enqueued = 0;
        for raw in resp.commands {
            let command = match Command::parse(raw) {
                Ok(command) => command,
                Err(Some(result)) => {
                    self.queue.record_result(result);
                    continue;
                }
                Err(None) => continue,
            };
            match command.into_task(self.defaults) {
                Ok(task) => {
                    if self.queue.enqueue(task) {
                        enqueued += 1;
                    }
                }
                Err(result) => self.queue.record_result(result),
            }
        }
        tracing::debug!(enqueued, "Heartbeat succeeded");
        enqueued
    }

    fn on_failure(&self, err: &ChannelError) {
        let failures = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        self.errors.record("HEARTBEAT_FAILED", err.to_string());
        tracing::warn!(failures, error = %err, "Heartbeat failed");

        if failures >= self.config.degraded_threshold
            && self.degraded.send_if_modified(|d| !std::mem::replace(d, true))
        {
            tracing::warn!(failures, "Entering degraded mode");
        }
    }

    /// 心跳循环：每轮结束后按 next_delay 重新调度；取消时立即返回
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("Heartbeat loop started");
        loop {
            let request = self.prepare();
            let in_flight = request.task_results.clone();
            tokio::select! {
                _ = cancel.cancelled() => {
                    // 未完成的发送被放弃，结果放回缓存交给最终心跳
                    self.queue.restore_results(in_flight);
                    break;
                }
                _ = self.exchange(request) => {}
            }
            let delay = self.next_delay();
            tracing::debug!(delay_ms = delay.as_millis() as u64, "Next heartbeat scheduled");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
        }
        tracing::info!("Heartbeat loop stopped");
    }

    /// 关闭前的最后一次心跳，失败忽略，返回的命令不再入队
    pub async fn final_heartbeat(&self) {
        let request = self.build_request(self.queue.drain_results());
        match tokio::time::timeout(self.config.final_heartbeat_timeout, self.transport.send(&request)).await {
            Ok(Ok(_)) => tracing::info!("Final heartbeat sent"),
            Ok(Err(e)) => tracing::debug!(error = %e, "Final heartbeat failed"),
            Err(_) => tracing::debug!("Final heartbeat timed out"),
        }
    }
}
