//! 引擎运行时
//!
//! 持有全部服务并运行后台循环：心跳循环、队列轮询循环、配置变更监听。
//! 队列轮询按优先级取出任务：脚本类任务交给监管器，其余任务在此直接处理，
//! 每个任务恰好写入一条结果（StartScript 的结果在脚本结束时写入）。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::behavior::{BehaviorPolicy, BehaviorProfile, ProfileBook, ProfileError};
use crate::config::{AppConfig, LiveConfig, RemoteConfig};
use crate::core::{EngineStatus, ErrorTracker, SupervisorError, TaskErrorCode};
use crate::dispatch::ActionDispatcher;
use crate::queue::{Task, TaskQueue, TaskResult, TaskSource, TaskStatus, TaskType};
use crate::remote::{RemoteChannel, TransportError};
use crate::script::ScriptSupervisor;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Behavior profile error: {0}")]
    Profile(#[from] ProfileError),

    #[error("Transport setup failed: {0}")]
    Transport(#[from] TransportError),
}

pub(super) struct EngineParts {
    pub config: AppConfig,
    pub queue: Arc<TaskQueue>,
    pub policy: Arc<BehaviorPolicy>,
    pub dispatcher: Arc<ActionDispatcher>,
    pub supervisor: Arc<ScriptSupervisor>,
    pub channel: Arc<RemoteChannel>,
    pub live: Arc<LiveConfig>,
    pub errors: Arc<ErrorTracker>,
    pub profiles: ProfileBook,
}

/// 任务处理结果：Done 表示已写入（或将由脚本结束时写入）结果
enum Handled {
    Done,
    Result(TaskResult),
}

pub struct Engine {
    config: AppConfig,
    queue: Arc<TaskQueue>,
    policy: Arc<BehaviorPolicy>,
    dispatcher: Arc<ActionDispatcher>,
    supervisor: Arc<ScriptSupervisor>,
    channel: Arc<RemoteChannel>,
    live: Arc<LiveConfig>,
    errors: Arc<ErrorTracker>,
    profiles: ProfileBook,
    cancel: CancellationToken,
    running: AtomicBool,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub(super) fn from_parts(parts: EngineParts) -> Self {
        Self {
            config: parts.config,
            queue: parts.queue,
            policy: parts.policy,
            dispatcher: parts.dispatcher,
            supervisor: parts.supervisor,
            channel: parts.channel,
            live: parts.live,
            errors: parts.errors,
            profiles: parts.profiles,
            cancel: CancellationToken::new(),
            running: AtomicBool::new(false),
            loops: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn policy(&self) -> &Arc<BehaviorPolicy> {
        &self.policy
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    pub fn supervisor(&self) -> &Arc<ScriptSupervisor> {
        &self.supervisor
    }

    pub fn channel(&self) -> &Arc<RemoteChannel> {
        &self.channel
    }

    pub fn live_config(&self) -> &Arc<LiveConfig> {
        &self.live
    }

    pub fn errors(&self) -> &Arc<ErrorTracker> {
        &self.errors
    }

    /// 启动后台循环；重复调用无效果
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.push(tokio::spawn(
            Arc::clone(&self.channel).run(self.cancel.child_token()),
        ));
        loops.push(tokio::spawn(Arc::clone(self).poll_loop(self.cancel.child_token())));
        loops.push(tokio::spawn(Arc::clone(self).config_loop(self.cancel.child_token())));
        tracing::info!("Engine started");
    }

    /// 停止后台循环（不停止脚本，脚本由关闭清理任务停止）
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .loops
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Engine loop terminated abnormally");
            }
        }
        self.running.store(false, Ordering::SeqCst);
        tracing::info!("Engine loops stopped");
    }

    // ---------- 对外接口 ----------

    pub async fn start_script(&self, name: &str) -> Result<(), SupervisorError> {
        self.supervisor.start(name, None).await
    }

    pub async fn stop_script(&self) -> Option<String> {
        self.supervisor.stop().await
    }

    pub async fn pause_script(&self) -> Result<(), SupervisorError> {
        self.supervisor.pause().await
    }

    pub async fn resume_script(&self) -> Result<(), SupervisorError> {
        self.supervisor.resume().await
    }

    /// 直接推送任务（与远程命令等价）
    pub fn push_task(&self, task: Task) -> bool {
        let task = if task.source == TaskSource::Remote {
            task
        } else {
            task.with_source(TaskSource::Local)
        };
        self.queue.enqueue(task)
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            running: self.running.load(Ordering::SeqCst),
            paused: self.supervisor.is_paused(),
            current_script: self.supervisor.current(),
            script: self.supervisor.status(),
            queue: self.queue.status(),
            dispatch: self.dispatcher.stats(),
            degraded: self.channel.is_degraded(),
            consecutive_heartbeat_failures: self.channel.consecutive_failures(),
            last_error: self.errors.last(),
        }
    }

    // ---------- 后台循环 ----------

    async fn poll_loop(self: Arc<Self>, cancel: CancellationToken) {
        let interval = Duration::from_millis(self.config.queue.poll_interval_ms.max(1));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            self.drain_queue(&cancel).await;
        }
        tracing::debug!("Queue poll loop stopped");
    }

    /// 处理当前队列中的全部任务
    pub async fn drain_queue(&self, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            let Some(task) = self.queue.dequeue() else {
                break;
            };
            self.process(task).await;
        }
    }

    pub async fn process(&self, task: Task) {
        let started = Instant::now();
        tracing::info!(task_id = %task.id, task_type = task.task_type.as_str(), "Executing task");
        if let Handled::Result(result) = self.handle(&task).await {
            let elapsed = started.elapsed().as_millis() as u64;
            self.queue.record_result(result.with_duration(elapsed));
        }
    }

    async fn handle(&self, task: &Task) -> Handled {
        let ok = |data: Value| Handled::Result(TaskResult::for_task(task, TaskStatus::Completed).with_data(data));
        let fail = |code: TaskErrorCode, message: String| {
            Handled::Result(TaskResult::for_task(task, TaskStatus::Failed).with_error(code, message))
        };

        match task.task_type {
            TaskType::StartScript => {
                let Some(name) = task.param_str("script").map(str::to_string) else {
                    return fail(TaskErrorCode::InvalidParams, "missing 'script' parameter".into());
                };
                match self.supervisor.start(&name, Some(task.clone())).await {
                    Ok(()) => Handled::Done,
                    Err(e) if e.is_retryable() => {
                        tracing::warn!(task_id = %task.id, script = %name, error = %e, "Start precondition failed, retrying later");
                        let delay = Duration::from_millis(self.config.queue.retry_delay_ms);
                        self.queue.retry(task.clone(), delay);
                        Handled::Done
                    }
                    Err(e) => fail(e.task_code(), e.to_string()),
                }
            }
            TaskType::StopScript => {
                let stopped = self.supervisor.stop().await;
                ok(serde_json::json!({ "stopped": stopped }))
            }
            TaskType::PauseScript => match self.supervisor.pause().await {
                Ok(()) => ok(serde_json::json!({ "script": self.supervisor.current() })),
                Err(e) => fail(e.task_code(), e.to_string()),
            },
            TaskType::ResumeScript => match self.supervisor.resume().await {
                Ok(()) => ok(serde_json::json!({ "script": self.supervisor.current() })),
                Err(e) => fail(e.task_code(), e.to_string()),
            },
            TaskType::UpdateConfig => {
                let update = Value::Object(task.payload.clone().into_iter().collect());
                match self.live.apply_update(&update) {
                    Ok(config) => ok(serde_json::to_value(config.as_ref()).unwrap_or(Value::Null)),
                    Err(e) => fail(TaskErrorCode::InvalidParams, format!("invalid config: {e}")),
                }
            }
            TaskType::SwitchProfile => match self.resolve_profile(task.payload.get("profile")) {
                Ok(profile) => {
                    self.policy.swap_profile(profile);
                    ok(serde_json::json!({ "profile": self.policy.profile().name }))
                }
                Err(message) => fail(TaskErrorCode::InvalidParams, message),
            },
            TaskType::ReportStatus => {
                self.channel.request_report();
                ok(serde_json::to_value(self.status()).unwrap_or(Value::Null))
            }
        }
    }

    /// 档案参数：字符串为档案名，对象为内联档案
    fn resolve_profile(&self, param: Option<&Value>) -> Result<BehaviorProfile, String> {
        match param {
            Some(Value::String(name)) => self.profiles.get(name).map_err(|e| e.to_string()),
            Some(value @ Value::Object(_)) => serde_json::from_value(value.clone())
                .map_err(|e| format!("invalid inline profile: {e}")),
            _ => Err("missing 'profile' parameter".to_string()),
        }
    }

    async fn config_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.live.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            let config = rx.borrow_and_update().clone();
            self.apply_config(&config);
        }
    }

    /// 把运行期配置落到各组件（心跳间隔由通道每轮读取）
    pub fn apply_config(&self, config: &RemoteConfig) {
        self.supervisor.set_tick_interval(config.tick_interval());

        let profile = match &config.profile {
            Some(inline) => Some(inline.clone()),
            None if config.behavior_profile != self.policy.profile().name => {
                match self.profiles.get(&config.behavior_profile) {
                    Ok(profile) => Some(profile),
                    Err(e) => {
                        tracing::warn!(error = %e, "Config names unknown profile, keeping current");
                        None
                    }
                }
            }
            None => None,
        };
        if let Some(profile) = profile {
            self.policy.swap_profile(profile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{FixedClock, Point};
    use crate::dispatch::{ActionSpec, SimulatedSurface};
    use crate::engine::EngineBuilder;
    use crate::remote::{HeartbeatRequest, HeartbeatResponse, HeartbeatTransport};

    struct OkTransport;

    #[async_trait::async_trait]
    impl HeartbeatTransport for OkTransport {
        async fn send(&self, _request: &HeartbeatRequest) -> Result<HeartbeatResponse, TransportError> {
            Ok(HeartbeatResponse {
                success: true,
                ..Default::default()
            })
        }
    }

    fn engine(surface: Arc<SimulatedSurface>) -> Arc<Engine> {
        engine_with_retry_delay(surface, 0)
    }

    fn engine_with_retry_delay(surface: Arc<SimulatedSurface>, retry_delay_ms: u64) -> Arc<Engine> {
        let mut config = AppConfig::default();
        config.queue.retry_delay_ms = retry_delay_ms;
        EngineBuilder::new(config)
            .with_surface(surface)
            .with_transport(Arc::new(OkTransport))
            .with_clock(Arc::new(FixedClock::new(12)))
            .with_seed(7)
            .build()
            .unwrap()
    }

    fn results_for(engine: &Engine, id: &str) -> Vec<TaskResult> {
        engine
            .queue()
            .drain_results()
            .into_iter()
            .filter(|r| r.task_id == id)
            .collect()
    }

    #[tokio::test]
    async fn test_start_task_with_unknown_script() {
        let engine = engine(Arc::new(SimulatedSurface::new()));
        engine.push_task(Task::start_script("nope").with_id("t1"));
        engine.drain_queue(&CancellationToken::new()).await;

        let results = results_for(&engine, "t1");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].error_code, Some(TaskErrorCode::InvalidParams));
    }

    #[tokio::test]
    async fn test_start_task_missing_param() {
        let engine = engine(Arc::new(SimulatedSurface::new()));
        engine.push_task(Task::new(TaskType::StartScript).with_id("t1"));
        engine.drain_queue(&CancellationToken::new()).await;
        assert_eq!(results_for(&engine, "t1")[0].error_code, Some(TaskErrorCode::InvalidParams));
    }

    #[tokio::test]
    async fn test_unavailable_surface_retries_then_fails() {
        let surface = Arc::new(SimulatedSurface::new());
        surface.set_available(false);
        let engine = engine(surface);
        engine.push_task(Task::start_script("scroll_read").with_id("t1").with_max_retries(2));
        engine.drain_queue(&CancellationToken::new()).await;

        let results = results_for(&engine, "t1");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert_eq!(results[0].error_code, Some(TaskErrorCode::MaxRetriesExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_start_waiting_for_retry() {
        let surface = Arc::new(SimulatedSurface::new());
        surface.set_available(false);
        let engine = engine_with_retry_delay(surface.clone(), 5000);
        let cancel = CancellationToken::new();

        engine.push_task(Task::start_script("scroll_read").with_id("s1"));
        engine.drain_queue(&cancel).await;
        assert!(engine.queue().contains("s1"));

        surface.set_available(true);
        engine.push_task(Task::new(TaskType::StopScript).with_id("stop1"));
        engine.drain_queue(&cancel).await;

        tokio::time::advance(Duration::from_secs(6)).await;
        engine.drain_queue(&cancel).await;
        assert!(!engine.supervisor().is_running());

        let results = engine.queue().drain_results();
        assert_eq!(results.len(), 2);
        let start = results.iter().find(|r| r.task_id == "s1").unwrap();
        assert_eq!(start.status, TaskStatus::Cancelled);
        assert_eq!(start.error_code, Some(TaskErrorCode::Cancelled));
        assert_eq!(results.iter().find(|r| r.task_id == "stop1").unwrap().status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_pause_without_script_fails() {
        let engine = engine(Arc::new(SimulatedSurface::new()));
        engine.push_task(Task::new(TaskType::PauseScript).with_id("p1"));
        engine.push_task(Task::new(TaskType::StopScript).with_id("s1"));
        engine.drain_queue(&CancellationToken::new()).await;

        let results = engine.queue().drain_results();
        let pause = results.iter().find(|r| r.task_id == "p1").unwrap();
        assert_eq!(pause.status, TaskStatus::Failed);
        assert_eq!(pause.error_code, Some(TaskErrorCode::ExecutionError));
        let stop = results.iter().find(|r| r.task_id == "s1").unwrap();
        assert_eq!(stop.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_switch_profile_task() {
        let engine = engine(Arc::new(SimulatedSurface::new()));
        engine.push_task(
            Task::new(TaskType::SwitchProfile)
                .with_id("sp1")
                .with_param("profile", Value::from("cautious")),
        );
        engine.push_task(
            Task::new(TaskType::SwitchProfile)
                .with_id("sp2")
                .with_param("profile", Value::from("ghost")),
        );
        engine.drain_queue(&CancellationToken::new()).await;

        // 同类型后到者取代先到者
        let results = engine.queue().drain_results();
        assert_eq!(results.iter().find(|r| r.task_id == "sp1").unwrap().status, TaskStatus::Cancelled);
        let sp2 = results.iter().find(|r| r.task_id == "sp2").unwrap();
        assert_eq!(sp2.error_code, Some(TaskErrorCode::InvalidParams));

        engine.push_task(
            Task::new(TaskType::SwitchProfile)
                .with_id("sp3")
                .with_param("profile", serde_json::json!({ "name": "inline", "think_probability": 0.0 })),
        );
        engine.drain_queue(&CancellationToken::new()).await;
        assert_eq!(engine.policy().profile().name, "inline");
    }

    #[tokio::test]
    async fn test_update_config_applies_tick_interval_and_profile() {
        let engine = engine(Arc::new(SimulatedSurface::new()));
        engine.push_task(
            Task::new(TaskType::UpdateConfig)
                .with_id("u1")
                .with_param("tickIntervalMs", Value::from(250))
                .with_param("behaviorProfile", Value::from("brisk")),
        );
        engine.drain_queue(&CancellationToken::new()).await;

        assert_eq!(results_for(&engine, "u1")[0].status, TaskStatus::Completed);
        let config = engine.live_config().get();
        engine.apply_config(&config);
        assert_eq!(engine.supervisor().tick_interval(), Duration::from_millis(250));
        assert_eq!(engine.policy().profile().name, "brisk");
    }

    #[tokio::test]
    async fn test_report_status_returns_snapshot() {
        let engine = engine(Arc::new(SimulatedSurface::new()));
        engine.push_task(Task::new(TaskType::ReportStatus).with_id("r1"));
        engine.drain_queue(&CancellationToken::new()).await;
        let result = results_for(&engine, "r1").pop().unwrap();
        let data = result.data.unwrap();
        assert_eq!(data["running"], Value::Bool(false));
        assert!(data["queue"].is_object());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_dispatch_stats() {
        let surface = Arc::new(SimulatedSurface::new());
        let engine = engine(surface.clone());
        let tap = ActionSpec::Tap {
            at: Point::new(5, 5),
            press: Duration::from_millis(30),
        };
        assert!(engine.dispatcher().execute_default(tap.clone()).await);
        surface.set_available(false);
        assert!(!engine.dispatcher().execute_default(tap).await);

        let status = engine.status();
        assert_eq!(status.dispatch.succeeded, 1);
        assert_eq!(status.dispatch.failed, 1);

        engine.push_task(Task::new(TaskType::ReportStatus).with_id("r1"));
        engine.drain_queue(&CancellationToken::new()).await;
        let data = results_for(&engine, "r1").pop().unwrap().data.unwrap();
        assert_eq!(data["dispatch"]["succeeded"], Value::from(1));
        assert_eq!(data["dispatch"]["timedOut"], Value::from(0));
    }
}
