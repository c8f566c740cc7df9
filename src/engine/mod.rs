//! 调度执行引擎：组件装配与后台循环

mod builder;
mod runtime;

pub use builder::EngineBuilder;
pub use runtime::{Engine, EngineError};
