//! 内置通用脚本
//!
//! `scroll_read`：滑动一屏 → 按阅读模型停顿 → 重复 N 轮后结束。不针对任何具体应用，
//! 用于本地运行和验证运行时。

use async_trait::async_trait;

use super::context::ScriptContext;
use super::machine::{MachineConfig, MachineScript, ScriptState, StateHandler, StateMachine};
use super::traits::{Script, ScriptRegistry};
use crate::behavior::Point;
use crate::core::ScriptError;

pub const SCROLL_READ: &str = "scroll_read";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollReadState {
    Init,
    Scroll,
    Read,
    Done,
}

impl ScriptState for ScrollReadState {
    fn name(&self) -> &'static str {
        match self {
            ScrollReadState::Init => "INIT",
            ScrollReadState::Scroll => "SCROLL",
            ScrollReadState::Read => "READ",
            ScrollReadState::Done => "DONE",
        }
    }

    fn is_terminal(&self) -> bool {
        *self == ScrollReadState::Done
    }
}

#[derive(Debug, Clone)]
pub struct ScrollRead {
    /// 0 表示不限轮数
    rounds: u32,
    completed: u32,
    chars_per_page: usize,
    from: Point,
    to: Point,
}

impl ScrollRead {
    pub fn new(rounds: u32) -> Self {
        Self {
            rounds,
            completed: 0,
            chars_per_page: 240,
            from: Point::new(540, 1600),
            to: Point::new(540, 500),
        }
    }

    pub fn with_page(mut self, chars_per_page: usize) -> Self {
        self.chars_per_page = chars_per_page;
        self
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }
}

#[async_trait]
impl StateHandler<ScrollReadState> for ScrollRead {
    async fn handle_state(
        &mut self,
        state: ScrollReadState,
        machine: &mut StateMachine<ScrollReadState>,
        ctx: &ScriptContext,
    ) -> Result<(), ScriptError> {
        match state {
            ScrollReadState::Init => {
                if !ctx.dispatcher().surface_available() {
                    return Err(ScriptError::Recoverable("automation surface unavailable".into()));
                }
                machine.move_to(ScrollReadState::Scroll);
            }
            ScrollReadState::Scroll => {
                ctx.swipe(self.from, self.to).await?;
                machine.move_to(ScrollReadState::Read);
            }
            ScrollReadState::Read => {
                ctx.read_pause(self.chars_per_page).await;
                self.completed += 1;
                if self.rounds > 0 && self.completed >= self.rounds {
                    machine.move_to(ScrollReadState::Done);
                } else {
                    machine.move_to(ScrollReadState::Scroll);
                }
            }
            ScrollReadState::Done => {}
        }
        Ok(())
    }

    async fn on_start(&mut self, _ctx: &ScriptContext) -> Result<(), ScriptError> {
        self.completed = 0;
        Ok(())
    }

    async fn on_stop(&mut self, _ctx: &ScriptContext) {
        tracing::info!(rounds = self.completed, "scroll_read finished");
    }
}

pub fn scroll_read(config: MachineConfig, rounds: u32) -> MachineScript<ScrollReadState, ScrollRead> {
    MachineScript::new(SCROLL_READ, ScrollReadState::Init, config, ScrollRead::new(rounds))
}

/// 注册全部内置脚本
pub fn register_builtin(registry: &mut ScriptRegistry, config: MachineConfig, rounds: u32) {
    registry.register(SCROLL_READ, move || Box::new(scroll_read(config, rounds)) as Box<dyn Script>);
}
