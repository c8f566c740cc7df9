//! Drone - 远程调度的自动化执行代理
//!
//! 模块划分：
//! - **behavior**: 拟人化行为策略（档案、风控闸门、随机时序）
//! - **config**: 应用配置加载（TOML + 环境变量）与服务端下发的运行期配置
//! - **core**: 错误分类、状态快照、优雅关闭
//! - **device**: 设备信息上报
//! - **dispatch**: 宿主自动化接口契约与单飞串行动作分发
//! - **engine**: 组件装配与后台循环（心跳、队列轮询、配置监听）
//! - **observability**: tracing 初始化
//! - **queue**: 优先级任务队列与结果缓存
//! - **remote**: 心跳协议、HTTP 传输、带退避的控制通道
//! - **script**: 脚本契约、状态机运行时、生命周期监管器与内置脚本

pub mod behavior;
pub mod config;
pub mod core;
pub mod device;
pub mod dispatch;
pub mod engine;
pub mod observability;
pub mod queue;
pub mod remote;
pub mod script;

pub use engine::{Engine, EngineBuilder, EngineError};
