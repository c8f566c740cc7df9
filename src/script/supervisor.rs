//! 脚本生命周期监管
//!
//! 同一时刻至多一个活动脚本。start 校验前置条件后先同步停止旧脚本再启动新脚本；
//! tick 循环外包一层错误边界（含 panic），按分类处理并统计连续步错误，超过阈值强制结束。
//! 停止钩子通过 `finalized` 标志保证恰好执行一次，无论由 stop、自然结束还是错误触发。

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::NaiveDate;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::context::ScriptContext;
use super::traits::{Script, ScriptRegistry, StepOutcome};
use crate::behavior::GateRejection;
use crate::core::{
    ErrorClass, ErrorTracker, RunStatus, ScriptError, ScriptStatus, SupervisorError, TaskErrorCode,
};
use crate::queue::{Task, TaskQueue, TaskResult, TaskStatus};

/// 监管器参数
#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub tick_interval: Duration,
    /// 连续步错误阈值，0 表示不强制结束
    pub max_step_errors: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_step_errors: 5,
        }
    }
}

/// 脚本退出原因
#[derive(Debug)]
enum Exit {
    Stopped,
    Finished,
    Fatal(ScriptError),
    ForceFinished(u32),
}

impl Exit {
    fn label(&self) -> &'static str {
        match self {
            Exit::Stopped => "stopped",
            Exit::Finished => "finished",
            Exit::Fatal(_) => "fatal",
            Exit::ForceFinished(_) => "force_finished",
        }
    }
}

// ---------- 状态板 ----------

#[derive(Debug)]
struct Board {
    status: ScriptStatus,
    running_since: Option<Instant>,
    day: NaiveDate,
    runtime_today: Duration,
}

/// 脚本状态与当日运行时长
#[derive(Debug)]
struct StatusBoard {
    inner: Mutex<Board>,
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl StatusBoard {
    fn new() -> Self {
        Self {
            inner: Mutex::new(Board {
                status: ScriptStatus::default(),
                running_since: None,
                day: today(),
                runtime_today: Duration::ZERO,
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut Board) -> T) -> T {
        let mut board = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        board.roll_day();
        f(&mut board)
    }

    fn begin(&self, key: &str, state: Option<String>) {
        self.with(|b| {
            b.status.key = Some(key.to_string());
            b.status.status = RunStatus::Running;
            b.status.started_at = Some(now_ms());
            b.status.current_state = state;
            b.running_since = Some(Instant::now());
        });
    }

    fn start_failed(&self, key: &str) {
        self.with(|b| {
            b.status.key = Some(key.to_string());
            b.status.status = RunStatus::Error;
            b.status.current_state = None;
        });
    }

    fn mark_success(&self, state: Option<String>) {
        self.with(|b| {
            b.status.last_success_at = Some(now_ms());
            b.status.current_state = state;
        });
    }

    fn set_state(&self, state: Option<String>) {
        self.with(|b| b.status.current_state = state);
    }

    fn paused(&self) {
        self.with(|b| {
            b.accumulate();
            b.status.status = RunStatus::Paused;
        });
    }

    fn resumed(&self) {
        self.with(|b| {
            b.status.status = RunStatus::Running;
            b.running_since = Some(Instant::now());
        });
    }

    fn ended(&self, status: RunStatus) {
        self.with(|b| {
            b.accumulate();
            b.status.status = status;
        });
    }

    fn snapshot(&self) -> ScriptStatus {
        self.with(|b| {
            let running = b.running_since.map(|s| s.elapsed()).unwrap_or_default();
            let mut status = b.status.clone();
            status.daily_runtime_minutes = (b.runtime_today + running).as_secs() / 60;
            status
        })
    }
}

impl Board {
    fn accumulate(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.runtime_today += since.elapsed();
        }
    }

    /// 跨天后清零；正在运行的段落从零点后重新计
    fn roll_day(&mut self) {
        let day = today();
        if day != self.day {
            self.day = day;
            self.runtime_today = Duration::ZERO;
            if self.running_since.is_some() {
                self.running_since = Some(Instant::now());
            }
        }
    }
}

// ---------- 单次运行 ----------

struct StepReport {
    outcome: Result<StepOutcome, ScriptError>,
    class: Option<ErrorClass>,
    state: Option<String>,
}

/// 一次脚本运行的共享部分：tick 循环与 stop 都持有
struct RunShared {
    key: String,
    script: tokio::sync::Mutex<Box<dyn Script>>,
    ctx: ScriptContext,
    origin: Option<Task>,
    started: Instant,
    finalized: AtomicBool,
    queue: Arc<TaskQueue>,
    errors: Arc<ErrorTracker>,
    board: Arc<StatusBoard>,
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl RunShared {
    async fn step(&self) -> StepReport {
        let mut script = self.script.lock().await;
        let result = AssertUnwindSafe(script.on_tick(&self.ctx)).catch_unwind().await;
        let (outcome, class) = match result {
            Ok(Ok(outcome)) => (Ok(outcome), None),
            Ok(Err(e)) => {
                let class = script.on_error(&e);
                (Err(e), Some(class))
            }
            Err(payload) => (
                Err(ScriptError::Panicked(panic_message(payload))),
                Some(ErrorClass::Fatal),
            ),
        };
        StepReport {
            outcome,
            class,
            state: script.current_state(),
        }
    }

    async fn reset(&self) {
        let mut script = self.script.lock().await;
        script.on_reset();
        self.board.set_state(script.current_state());
    }

    /// 执行停止钩子并写入来源任务结果；只有第一次调用生效
    async fn finalize(&self, exit: Exit) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut script = self.script.lock().await;
            if let Err(payload) = AssertUnwindSafe(script.on_stop(&self.ctx)).catch_unwind().await {
                tracing::error!(script = %self.key, panic = %panic_message(payload), "Stop hook panicked");
            }
        }

        let (status, board_status) = match &exit {
            Exit::Stopped | Exit::Finished => (TaskStatus::Completed, RunStatus::Stopped),
            Exit::Fatal(_) | Exit::ForceFinished(_) => (TaskStatus::Failed, RunStatus::Error),
        };
        self.board.ended(board_status);
        tracing::info!(script = %self.key, reason = exit.label(), "Script ended");

        if let Some(task) = &self.origin {
            let elapsed = self.started.elapsed().as_millis() as u64;
            let mut result = TaskResult::for_task(task, status)
                .with_duration(elapsed)
                .with_data(serde_json::json!({ "script": self.key, "reason": exit.label() }));
            match exit {
                Exit::Fatal(e) => {
                    result = result.with_error(TaskErrorCode::ExecutionError, e.to_string());
                }
                Exit::ForceFinished(n) => {
                    result = result.with_error(
                        TaskErrorCode::ExecutionError,
                        format!("force-finished after {n} consecutive step errors"),
                    );
                }
                Exit::Stopped | Exit::Finished => {}
            }
            self.queue.record_result(result);
        }
    }
}

struct ActiveScript {
    run_id: u64,
    key: String,
    cancel: CancellationToken,
    pause_tx: Arc<watch::Sender<bool>>,
    handle: JoinHandle<()>,
    shared: Arc<RunShared>,
}

// ---------- 监管器 ----------

pub struct ScriptSupervisor {
    registry: ScriptRegistry,
    ctx: ScriptContext,
    queue: Arc<TaskQueue>,
    errors: Arc<ErrorTracker>,
    /// 串行化 start / stop / pause / resume
    lifecycle: tokio::sync::Mutex<()>,
    active: Arc<Mutex<Option<ActiveScript>>>,
    board: Arc<StatusBoard>,
    tick_interval_ms: Arc<AtomicU64>,
    max_step_errors: u32,
    next_run: AtomicU64,
}

impl ScriptSupervisor {
    pub fn new(
        registry: ScriptRegistry,
        ctx: ScriptContext,
        queue: Arc<TaskQueue>,
        errors: Arc<ErrorTracker>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            registry,
            ctx,
            queue,
            errors,
            lifecycle: tokio::sync::Mutex::new(()),
            active: Arc::new(Mutex::new(None)),
            board: Arc::new(StatusBoard::new()),
            tick_interval_ms: Arc::new(AtomicU64::new(config.tick_interval.as_millis() as u64)),
            max_step_errors: config.max_step_errors,
            next_run: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &ScriptRegistry {
        &self.registry
    }

    pub fn context(&self) -> &ScriptContext {
        &self.ctx
    }

    /// 下一次 tick 起生效
    pub fn set_tick_interval(&self, interval: Duration) {
        self.tick_interval_ms
            .store(interval.as_millis().max(1) as u64, Ordering::Relaxed);
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.load(Ordering::Relaxed))
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<ActiveScript>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn current(&self) -> Option<String> {
        self.slot().as_ref().map(|a| a.key.clone())
    }

    pub fn is_running(&self) -> bool {
        self.slot().is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.slot().as_ref().map(|a| *a.pause_tx.borrow()).unwrap_or(false)
    }

    pub fn status(&self) -> ScriptStatus {
        self.board.snapshot()
    }

    /// 启动脚本。`origin` 为触发启动的任务，其结果在脚本结束时写入
    pub async fn start(&self, name: &str, origin: Option<Task>) -> Result<(), SupervisorError> {
        let _guard = self.lifecycle.lock().await;

        if !self.registry.contains(name) {
            return Err(SupervisorError::NotRegistered(name.to_string()));
        }
        if self.current().as_deref() == Some(name) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }
        if !self.ctx.dispatcher().surface_available() {
            return Err(SupervisorError::SurfaceUnavailable);
        }
        if let Err(GateRejection::Curfew { hour }) = self.ctx.policy().check_operating_hours() {
            return Err(SupervisorError::OutsideOperatingHours(hour));
        }

        if let Some(previous) = self.stop_active().await {
            tracing::info!(previous = %previous, next = %name, "Stopped previous script before start");
        }

        let mut script = self
            .registry
            .create(name)
            .ok_or_else(|| SupervisorError::NotRegistered(name.to_string()))?;
        self.ctx.policy().reset_session();

        let started = match AssertUnwindSafe(script.on_start(&self.ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(ScriptError::Panicked(panic_message(payload))),
        };
        if let Err(e) = started {
            tracing::error!(script = %name, error = %e, "Script start hook failed");
            if let Err(payload) = AssertUnwindSafe(script.on_stop(&self.ctx)).catch_unwind().await {
                tracing::error!(script = %name, panic = %panic_message(payload), "Stop hook panicked");
            }
            self.errors.record(e.code(), e.to_string());
            self.board.start_failed(name);
            return Err(SupervisorError::StartFailed(e));
        }

        self.board.begin(name, script.current_state());
        let run_id = self.next_run.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(RunShared {
            key: name.to_string(),
            script: tokio::sync::Mutex::new(script),
            ctx: self.ctx.clone(),
            origin,
            started: Instant::now(),
            finalized: AtomicBool::new(false),
            queue: Arc::clone(&self.queue),
            errors: Arc::clone(&self.errors),
            board: Arc::clone(&self.board),
        });
        let cancel = CancellationToken::new();
        let (pause_tx, pause_rx) = watch::channel(false);

        // 持有槽位锁直到登记完成，循环立即结束时也能正确清理
        let mut slot = self.slot();
        let handle = tokio::spawn(tick_loop(TickLoop {
            run_id,
            shared: Arc::clone(&shared),
            cancel: cancel.clone(),
            pause_rx,
            interval_ms: Arc::clone(&self.tick_interval_ms),
            max_step_errors: self.max_step_errors,
            active: Arc::clone(&self.active),
        }));

        *slot = Some(ActiveScript {
            run_id,
            key: name.to_string(),
            cancel,
            pause_tx: Arc::new(pause_tx),
            handle,
            shared,
        });
        drop(slot);
        tracing::info!(script = %name, run_id, "Script started");
        Ok(())
    }

    /// 停止当前脚本，返回被停止的脚本名
    pub async fn stop(&self) -> Option<String> {
        let _guard = self.lifecycle.lock().await;
        self.stop_active().await
    }

    async fn stop_active(&self) -> Option<String> {
        let active = self.slot().take()?;
        active.cancel.cancel();
        if let Err(e) = active.handle.await {
            tracing::error!(script = %active.key, error = %e, "Tick loop terminated abnormally");
        }
        // tick 循环正常退出时已经 finalize，这里是空操作
        active.shared.finalize(Exit::Stopped).await;
        Some(active.key)
    }

    fn active_parts(
        &self,
    ) -> Result<(Arc<RunShared>, Arc<watch::Sender<bool>>), SupervisorError> {
        self.slot()
            .as_ref()
            .map(|a| (Arc::clone(&a.shared), Arc::clone(&a.pause_tx)))
            .ok_or(SupervisorError::NoActiveScript)
    }

    /// 只置暂停标志；暂停钩子由 tick 循环在下一个步骤边界执行，不等待进行中的步骤
    pub async fn pause(&self) -> Result<(), SupervisorError> {
        let _guard = self.lifecycle.lock().await;
        let (shared, pause_tx) = self.active_parts()?;
        if pause_tx.send_replace(true) {
            return Ok(());
        }
        self.board.paused();
        tracing::info!(script = %shared.key, "Script paused");
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), SupervisorError> {
        let _guard = self.lifecycle.lock().await;
        let (shared, pause_tx) = self.active_parts()?;
        if !*pause_tx.borrow() {
            return Ok(());
        }
        self.board.resumed();
        pause_tx.send_replace(false);
        tracing::info!(script = %shared.key, "Script resumed");
        Ok(())
    }
}

struct TickLoop {
    run_id: u64,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
    pause_rx: watch::Receiver<bool>,
    interval_ms: Arc<AtomicU64>,
    max_step_errors: u32,
    active: Arc<Mutex<Option<ActiveScript>>>,
}

async fn tick_loop(mut run: TickLoop) {
    let shared = Arc::clone(&run.shared);
    let mut step_errors = 0u32;

    let exit = 'ticks: loop {
        if *run.pause_rx.borrow() {
            shared.script.lock().await.on_pause(&shared.ctx).await;
            tracing::debug!(script = %shared.key, "Tick loop parked");
            tokio::select! {
                _ = run.cancel.cancelled() => break 'ticks Exit::Stopped,
                changed = run.pause_rx.wait_for(|paused| !*paused) => {
                    if changed.is_err() {
                        break 'ticks Exit::Stopped;
                    }
                }
            }
            shared.script.lock().await.on_resume(&shared.ctx).await;
        }

        let report = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => break 'ticks Exit::Stopped,
            report = shared.step() => report,
        };

        match report.outcome {
            Ok(StepOutcome::Continue) => {
                step_errors = 0;
                shared.board.mark_success(report.state);
            }
            Ok(StepOutcome::Finished) => {
                shared.board.mark_success(report.state);
                break 'ticks Exit::Finished;
            }
            Err(e) => {
                step_errors += 1;
                shared.board.set_state(report.state);
                shared.errors.record(e.code(), e.to_string());
                match report.class.unwrap_or_else(|| e.class()) {
                    ErrorClass::Recoverable => {
                        tracing::warn!(script = %shared.key, error = %e, step_errors, "Recoverable step error");
                    }
                    ErrorClass::Fatal => {
                        tracing::error!(script = %shared.key, error = %e, "Fatal step error, stopping script");
                        break 'ticks Exit::Fatal(e);
                    }
                    ErrorClass::Timeout => {
                        tracing::warn!(script = %shared.key, error = %e, "State timeout, resetting script");
                        shared.reset().await;
                    }
                }
                if run.max_step_errors > 0 && step_errors >= run.max_step_errors {
                    tracing::error!(script = %shared.key, step_errors, "Step error tolerance exceeded, force-finishing");
                    shared.errors.record(
                        "SCRIPT_FORCE_FINISHED",
                        format!("{step_errors} consecutive step errors"),
                    );
                    break 'ticks Exit::ForceFinished(step_errors);
                }
            }
        }

        let interval = Duration::from_millis(run.interval_ms.load(Ordering::Relaxed));
        tokio::select! {
            _ = run.cancel.cancelled() => break 'ticks Exit::Stopped,
            _ = tokio::time::sleep(interval) => {}
        }
    };

    shared.finalize(exit).await;

    let mut slot = run.active.lock().unwrap_or_else(|e| e.into_inner());
    if slot.as_ref().map(|a| a.run_id) == Some(run.run_id) {
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::{BehaviorPolicy, BehaviorProfile, FixedClock};
    use crate::dispatch::{ActionDispatcher, SimulatedSurface};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    /// 记录钩子调用顺序的脚本
    struct HookScript {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        mode: Mode,
        ticks: Arc<AtomicU32>,
    }

    #[derive(Clone, Copy)]
    enum Mode {
        Forever,
        FinishAfter(u32),
        FailRecoverable,
        FailFatal,
        Timeout,
        Panic,
        FailStart,
        /// 每个步骤耗时固定时长
        SlowTick(u64),
    }

    impl HookScript {
        fn push(&self, event: &str) {
            self.log.lock().unwrap().push(format!("{}:{event}", self.name));
        }
    }

    #[async_trait]
    impl Script for HookScript {
        fn name(&self) -> &str {
            self.name
        }

        async fn on_start(&mut self, _ctx: &ScriptContext) -> Result<(), ScriptError> {
            self.push("start");
            if matches!(self.mode, Mode::FailStart) {
                return Err(ScriptError::Fatal("no login".into()));
            }
            Ok(())
        }

        async fn on_tick(&mut self, _ctx: &ScriptContext) -> Result<StepOutcome, ScriptError> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            match self.mode {
                Mode::Forever | Mode::FailStart => Ok(StepOutcome::Continue),
                Mode::FinishAfter(limit) if n >= limit => Ok(StepOutcome::Finished),
                Mode::FinishAfter(_) => Ok(StepOutcome::Continue),
                Mode::FailRecoverable => Err(ScriptError::Recoverable("flaky".into())),
                Mode::FailFatal => Err(ScriptError::Fatal("banned".into())),
                Mode::Timeout => Err(ScriptError::StateTimeout { state: "WAIT".into(), retries: 3 }),
                Mode::Panic => panic!("step exploded"),
                Mode::SlowTick(ms) => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(StepOutcome::Continue)
                }
            }
        }

        async fn on_stop(&mut self, _ctx: &ScriptContext) {
            self.push("stop");
        }

        async fn on_pause(&mut self, _ctx: &ScriptContext) {
            self.push("pause");
        }

        async fn on_resume(&mut self, _ctx: &ScriptContext) {
            self.push("resume");
        }

        fn on_reset(&mut self) {
            self.push("reset");
        }
    }

    struct Harness {
        supervisor: ScriptSupervisor,
        queue: Arc<TaskQueue>,
        errors: Arc<ErrorTracker>,
        surface: Arc<SimulatedSurface>,
        log: Arc<Mutex<Vec<String>>>,
        ticks: Arc<AtomicU32>,
    }

    impl Harness {
        fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn harness(modes: &[(&'static str, Mode)], max_step_errors: u32, clock: Option<Arc<FixedClock>>) -> Harness {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ticks = Arc::new(AtomicU32::new(0));
        let mut registry = ScriptRegistry::new();
        for &(name, mode) in modes {
            let log = Arc::clone(&log);
            let ticks = Arc::clone(&ticks);
            registry.register(name, move || {
                Box::new(HookScript {
                    name,
                    log: Arc::clone(&log),
                    mode,
                    ticks: Arc::clone(&ticks),
                }) as Box<dyn Script>
            });
        }

        let surface = Arc::new(SimulatedSurface::new());
        let dispatcher = Arc::new(ActionDispatcher::new(surface.clone(), Duration::from_secs(1)));
        let profile = BehaviorProfile {
            curfew_start_hour: 1,
            curfew_end_hour: 7,
            ..BehaviorProfile::default()
        };
        let clock: Arc<FixedClock> = clock.unwrap_or_else(|| Arc::new(FixedClock::new(12)));
        let policy = BehaviorPolicy::with_seed(profile, 3).with_clock(clock);
        let queue = Arc::new(TaskQueue::default());
        let errors = Arc::new(ErrorTracker::new());
        let supervisor = ScriptSupervisor::new(
            registry,
            ScriptContext::new(dispatcher, Arc::new(policy)),
            Arc::clone(&queue),
            Arc::clone(&errors),
            SupervisorConfig {
                tick_interval: Duration::from_millis(10),
                max_step_errors,
            },
        );
        Harness { supervisor, queue, errors, surface, log, ticks }
    }

    async fn wait_idle(supervisor: &ScriptSupervisor) {
        for _ in 0..200 {
            if !supervisor.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("script never stopped");
    }

    #[tokio::test]
    async fn test_start_b_stops_a_first() {
        let h = harness(&[("a", Mode::Forever), ("b", Mode::Forever)], 5, None);
        h.supervisor.start("a", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.supervisor.start("b", None).await.unwrap();

        assert_eq!(h.events(), vec!["a:start", "a:stop", "b:start"]);
        assert_eq!(h.supervisor.current().as_deref(), Some("b"));
        h.supervisor.stop().await;
        assert_eq!(h.events().iter().filter(|e| *e == "a:stop").count(), 1);
        assert_eq!(h.events().last().map(String::as_str), Some("b:stop"));
    }

    #[tokio::test]
    async fn test_start_errors() {
        let h = harness(&[("a", Mode::Forever)], 5, None);
        assert!(matches!(h.supervisor.start("zzz", None).await, Err(SupervisorError::NotRegistered(_))));

        h.supervisor.start("a", None).await.unwrap();
        let err = h.supervisor.start("a", None).await.unwrap_err();
        assert_eq!(err.task_code(), TaskErrorCode::AlreadyRunning);
        h.supervisor.stop().await;

        h.surface.set_available(false);
        let err = h.supervisor.start("a", None).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SurfaceUnavailable));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_curfew_blocks_start() {
        let clock = Arc::new(FixedClock::new(3));
        let h = harness(&[("a", Mode::Forever)], 5, Some(clock.clone()));
        assert!(matches!(
            h.supervisor.start("a", None).await,
            Err(SupervisorError::OutsideOperatingHours(3))
        ));
        clock.set_hour(9);
        h.supervisor.start("a", None).await.unwrap();
        h.supervisor.stop().await;
    }

    #[tokio::test]
    async fn test_start_hook_failure_still_runs_stop_hook() {
        let h = harness(&[("a", Mode::FailStart)], 5, None);
        let err = h.supervisor.start("a", None).await.unwrap_err();
        assert!(matches!(err, SupervisorError::StartFailed(_)));
        assert_eq!(h.events(), vec!["a:start", "a:stop"]);
        assert!(!h.supervisor.is_running());
        assert_eq!(h.supervisor.status().status, RunStatus::Error);
        assert_eq!(h.errors.last().unwrap().code, "SCRIPT_FATAL");
    }

    #[tokio::test]
    async fn test_natural_finish_records_origin_result() {
        let h = harness(&[("a", Mode::FinishAfter(3))], 5, None);
        let task = Task::start_script("a").with_id("t-start");
        h.supervisor.start("a", Some(task)).await.unwrap();
        wait_idle(&h.supervisor).await;

        assert_eq!(h.events(), vec!["a:start", "a:stop"]);
        let results = h.queue.drain_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].task_id, "t-start");
        assert_eq!(results[0].status, TaskStatus::Completed);
        assert_eq!(h.supervisor.status().status, RunStatus::Stopped);
        assert!(h.supervisor.status().last_success_at.is_some());
    }

    #[tokio::test]
    async fn test_fatal_error_stops_script() {
        let h = harness(&[("a", Mode::FailFatal)], 5, None);
        h.supervisor.start("a", Some(Task::start_script("a").with_id("t1"))).await.unwrap();
        wait_idle(&h.supervisor).await;

        assert_eq!(h.ticks.load(Ordering::SeqCst), 1);
        let results = h.queue.drain_results();
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert_eq!(results[0].error_code, Some(TaskErrorCode::ExecutionError));
        assert_eq!(h.errors.last().unwrap().code, "SCRIPT_FATAL");
    }

    #[tokio::test]
    async fn test_recoverable_errors_force_finish_at_threshold() {
        let h = harness(&[("a", Mode::FailRecoverable)], 3, None);
        h.supervisor.start("a", Some(Task::start_script("a").with_id("t1"))).await.unwrap();
        wait_idle(&h.supervisor).await;

        assert_eq!(h.ticks.load(Ordering::SeqCst), 3);
        assert_eq!(h.events(), vec!["a:start", "a:stop"]);
        let results = h.queue.drain_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, TaskStatus::Failed);
        assert_eq!(h.supervisor.status().status, RunStatus::Error);
        assert_eq!(h.errors.last().unwrap().code, "SCRIPT_FORCE_FINISHED");
    }

    #[tokio::test]
    async fn test_timeout_resets_without_stopping() {
        let h = harness(&[("a", Mode::Timeout)], 2, None);
        h.supervisor.start("a", None).await.unwrap();
        wait_idle(&h.supervisor).await;
        // 超时只重置；第二次连续错误触发强制结束
        assert_eq!(h.events(), vec!["a:start", "a:reset", "a:reset", "a:stop"]);
    }

    #[tokio::test]
    async fn test_panicking_step_is_fatal() {
        let h = harness(&[("a", Mode::Panic)], 5, None);
        h.supervisor.start("a", None).await.unwrap();
        wait_idle(&h.supervisor).await;
        assert_eq!(h.events(), vec!["a:start", "a:stop"]);
        assert_eq!(h.errors.last().unwrap().code, "SCRIPT_PANIC");
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let h = harness(&[("a", Mode::Forever)], 5, None);
        assert!(matches!(h.supervisor.pause().await, Err(SupervisorError::NoActiveScript)));

        h.supervisor.start("a", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        h.supervisor.pause().await.unwrap();
        assert!(h.supervisor.is_paused());
        assert_eq!(h.supervisor.status().status, RunStatus::Paused);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let frozen = h.ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.ticks.load(Ordering::SeqCst), frozen);

        h.supervisor.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.ticks.load(Ordering::SeqCst) > frozen);
        assert_eq!(h.supervisor.status().status, RunStatus::Running);

        // 暂停中停止依然执行停止钩子
        h.supervisor.pause().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.supervisor.stop().await.as_deref(), Some("a"));
        assert_eq!(h.events(), vec!["a:start", "a:pause", "a:resume", "a:pause", "a:stop"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_does_not_wait_for_running_step() {
        let h = harness(&[("a", Mode::SlowTick(500))], 5, None);
        h.supervisor.start("a", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // 步骤仍在进行，暂停立即返回，钩子推迟到步骤边界
        let paused = tokio::time::timeout(Duration::from_millis(10), h.supervisor.pause()).await;
        assert!(matches!(paused, Ok(Ok(()))));
        assert_eq!(h.supervisor.status().status, RunStatus::Paused);
        assert_eq!(h.events(), vec!["a:start"]);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(h.events(), vec!["a:start", "a:pause"]);
        assert_eq!(h.ticks.load(Ordering::SeqCst), 1);

        h.supervisor.resume().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(h.events(), vec!["a:start", "a:pause", "a:resume"]);
        assert_eq!(h.supervisor.stop().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_stop_with_nothing_running() {
        let h = harness(&[("a", Mode::Forever)], 5, None);
        assert!(h.supervisor.stop().await.is_none());
        assert_eq!(h.supervisor.status().status, RunStatus::Idle);
    }
}
