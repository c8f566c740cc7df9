//! 脚本能力集与注册表
//!
//! 每个自动化目标实现 Script trait（on_start / on_tick / on_stop / on_pause / on_resume / on_error），
//! 由 ScriptRegistry 按名注册工厂；监管器每次启动时新建一个实例。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::context::ScriptContext;
use crate::core::{ErrorClass, ScriptError};

/// 单次 tick 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    /// 脚本自然结束
    Finished,
}

#[async_trait]
pub trait Script: Send {
    fn name(&self) -> &str;

    async fn on_start(&mut self, ctx: &ScriptContext) -> Result<(), ScriptError>;

    async fn on_tick(&mut self, ctx: &ScriptContext) -> Result<StepOutcome, ScriptError>;

    /// 无论启动或 tick 是否出错，停止时都会调用且只调用一次
    async fn on_stop(&mut self, ctx: &ScriptContext);

    async fn on_pause(&mut self, _ctx: &ScriptContext) {}

    async fn on_resume(&mut self, _ctx: &ScriptContext) {}

    /// 错误分类，默认沿用错误自身的分类
    fn on_error(&mut self, err: &ScriptError) -> ErrorClass {
        err.class()
    }

    /// Timeout 类错误时调用：回到初始状态
    fn on_reset(&mut self) {}

    fn current_state(&self) -> Option<String> {
        None
    }
}

/// 脚本工厂
pub type ScriptFactory = Arc<dyn Fn() -> Box<dyn Script> + Send + Sync>;

/// 脚本注册表：按名称存储工厂
#[derive(Default, Clone)]
pub struct ScriptRegistry {
    factories: HashMap<String, ScriptFactory>,
}

impl ScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Script> + Send + Sync + 'static,
    {
        let name = name.into();
        tracing::debug!(script = %name, "Script registered");
        self.factories.insert(name, Arc::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn Script>> {
        self.factories.get(name).map(|f| f())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ScriptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptRegistry").field("scripts", &self.names()).finish()
    }
}
