//! 通用脚本状态机
//!
//! 以枚举状态类型参数化。每次 tick：先检查当前状态停留时长，超时则累加重试计数并给一个新的宽限窗口，
//! 超过最大重试次数时抛出一次 Timeout 类错误；随后用当前状态调用处理器，由处理器自行 `move_to`。

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::context::ScriptContext;
use super::traits::{Script, StepOutcome};
use crate::core::ScriptError;

/// 脚本状态枚举需实现的约束
pub trait ScriptState: Copy + Eq + Debug + Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn is_terminal(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MachineConfig {
    /// 单个状态最长停留时间，零表示不限制
    pub max_state_duration: Duration,
    /// 允许的连续宽限窗口数
    pub max_state_retry: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            max_state_duration: Duration::from_secs(30),
            max_state_retry: 3,
        }
    }
}

pub struct StateMachine<S: ScriptState> {
    initial: S,
    current: S,
    entered_at: Instant,
    retries: u32,
    config: MachineConfig,
}

impl<S: ScriptState> StateMachine<S> {
    pub fn new(initial: S, config: MachineConfig) -> Self {
        Self {
            initial,
            current: initial,
            entered_at: Instant::now(),
            retries: 0,
            config,
        }
    }

    pub fn current(&self) -> S {
        self.current
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn time_in_state(&self) -> Duration {
        self.entered_at.elapsed()
    }

    /// 停留超时检查；超过重试上限时返回 StateTimeout 并重新开始计数
    pub fn check_deadline(&mut self) -> Result<S, ScriptError> {
        let limit = self.config.max_state_duration;
        if limit.is_zero() || self.time_in_state() <= limit {
            return Ok(self.current);
        }

        self.retries += 1;
        self.entered_at = Instant::now();
        if self.retries > self.config.max_state_retry {
            let retries = self.retries;
            self.retries = 0;
            tracing::warn!(state = self.current.name(), retries, "State exceeded retries");
            return Err(ScriptError::StateTimeout {
                state: self.current.name().to_string(),
                retries: self.config.max_state_retry,
            });
        }
        tracing::debug!(state = self.current.name(), retry = self.retries, "State overstayed, granting another window");
        Ok(self.current)
    }

    pub fn move_to(&mut self, next: S) {
        if next == self.current {
            return;
        }
        tracing::info!(from = self.current.name(), to = next.name(), "State transition");
        self.current = next;
        self.entered_at = Instant::now();
        self.retries = 0;
    }

    pub fn reset(&mut self) {
        tracing::info!(from = self.current.name(), to = self.initial.name(), "State machine reset");
        self.current = self.initial;
        self.entered_at = Instant::now();
        self.retries = 0;
    }

    /// 执行一次 tick，返回处理后的状态
    pub async fn tick<H>(&mut self, handler: &mut H, ctx: &ScriptContext) -> Result<S, ScriptError>
    where
        H: StateHandler<S> + ?Sized,
    {
        let state = self.check_deadline()?;
        handler.handle_state(state, self, ctx).await?;
        Ok(self.current)
    }
}

/// 状态处理器：每种脚本的业务逻辑
#[async_trait]
pub trait StateHandler<S: ScriptState>: Send {
    async fn handle_state(
        &mut self,
        state: S,
        machine: &mut StateMachine<S>,
        ctx: &ScriptContext,
    ) -> Result<(), ScriptError>;

    async fn on_start(&mut self, _ctx: &ScriptContext) -> Result<(), ScriptError> {
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ScriptContext) {}
}

/// 把「状态机 + 处理器」包装成可注册的 Script
pub struct MachineScript<S: ScriptState, H: StateHandler<S>> {
    name: String,
    machine: StateMachine<S>,
    handler: H,
}

impl<S: ScriptState, H: StateHandler<S>> MachineScript<S, H> {
    pub fn new(name: impl Into<String>, initial: S, config: MachineConfig, handler: H) -> Self {
        Self {
            name: name.into(),
            machine: StateMachine::new(initial, config),
            handler,
        }
    }

    pub fn machine(&self) -> &StateMachine<S> {
        &self.machine
    }
}

#[async_trait]
impl<S: ScriptState, H: StateHandler<S>> Script for MachineScript<S, H> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_start(&mut self, ctx: &ScriptContext) -> Result<(), ScriptError> {
        self.machine.reset();
        self.handler.on_start(ctx).await
    }

    async fn on_tick(&mut self, ctx: &ScriptContext) -> Result<StepOutcome, ScriptError> {
        let state = self.machine.tick(&mut self.handler, ctx).await?;
        Ok(if state.is_terminal() {
            StepOutcome::Finished
        } else {
            StepOutcome::Continue
        })
    }

    async fn on_stop(&mut self, ctx: &ScriptContext) {
        self.handler.on_stop(ctx).await;
    }

    fn on_reset(&mut self) {
        self.machine.reset();
    }

    fn current_state(&self) -> Option<String> {
        Some(self.machine.current().name().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Door {
        Closed,
        Open,
        Gone,
    }

    impl ScriptState for Door {
        fn name(&self) -> &'static str {
            match self {
                Door::Closed => "CLOSED",
                Door::Open => "OPEN",
                Door::Gone => "GONE",
            }
        }

        fn is_terminal(&self) -> bool {
            *self == Door::Gone
        }
    }

    fn config(ms: u64, retries: u32) -> MachineConfig {
        MachineConfig {
            max_state_duration: Duration::from_millis(ms),
            max_state_retry: retries,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_raised_once_after_retries() {
        let mut machine = StateMachine::new(Door::Closed, config(100, 2));
        let mut timeouts = 0;
        for _ in 0..3 {
            tokio::time::advance(Duration::from_millis(150)).await;
            if machine.check_deadline().is_err() {
                timeouts += 1;
            }
        }
        assert_eq!(timeouts, 1);
        assert_eq!(machine.retries(), 0);

        // 之后只要不再超时就不会再次抛出
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(50)).await;
            assert!(machine.check_deadline().is_ok());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_window_resets_entry_time() {
        let mut machine = StateMachine::new(Door::Closed, config(100, 5));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(machine.check_deadline().is_ok());
        assert_eq!(machine.retries(), 1);
        assert!(machine.time_in_state() < Duration::from_millis(10));
    }

    #[test]
    fn test_move_to_same_state_is_noop() {
        let mut machine = StateMachine::new(Door::Closed, MachineConfig::default());
        machine.retries = 2;
        machine.move_to(Door::Closed);
        assert_eq!(machine.retries(), 2);

        machine.move_to(Door::Open);
        assert_eq!(machine.current(), Door::Open);
        assert_eq!(machine.retries(), 0);

        machine.reset();
        assert_eq!(machine.current(), Door::Closed);
    }

    #[test]
    fn test_zero_duration_disables_deadline() {
        let mut machine = StateMachine::new(Door::Open, config(0, 0));
        for _ in 0..10 {
            assert_eq!(machine.check_deadline().unwrap(), Door::Open);
        }
    }

    struct Walker {
        visited: Vec<Door>,
    }

    #[async_trait]
    impl StateHandler<Door> for Walker {
        async fn handle_state(
            &mut self,
            state: Door,
            machine: &mut StateMachine<Door>,
            _ctx: &ScriptContext,
        ) -> Result<(), ScriptError> {
            self.visited.push(state);
            match state {
                Door::Closed => machine.move_to(Door::Open),
                Door::Open => machine.move_to(Door::Gone),
                Door::Gone => {}
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_machine_script_runs_to_terminal() {
        use crate::behavior::{BehaviorPolicy, BehaviorProfile};
        use crate::dispatch::{ActionDispatcher, SimulatedSurface};
        use std::sync::Arc;

        let surface = Arc::new(SimulatedSurface::new());
        let ctx = ScriptContext::new(
            Arc::new(ActionDispatcher::new(surface, Duration::from_secs(1))),
            Arc::new(BehaviorPolicy::with_seed(BehaviorProfile::default(), 1)),
        );
        let mut script = MachineScript::new(
            "walker",
            Door::Closed,
            MachineConfig::default(),
            Walker { visited: vec![] },
        );

        script.on_start(&ctx).await.unwrap();
        assert_eq!(script.on_tick(&ctx).await.unwrap(), StepOutcome::Continue);
        assert_eq!(script.current_state().as_deref(), Some("OPEN"));
        assert_eq!(script.on_tick(&ctx).await.unwrap(), StepOutcome::Finished);
        assert_eq!(script.handler.visited, vec![Door::Closed, Door::Open]);

        script.on_reset();
        assert_eq!(script.machine().current(), Door::Closed);
    }
}
