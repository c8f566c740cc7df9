//! 错误类型与分类
//!
//! 三类脚本错误（Recoverable / Fatal / Timeout）由生命周期监管边界统一分类处理；
//! 任务级错误码（TaskErrorCode）保证每个终止任务恰好产生一条 TaskResult。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 脚本单步错误的分类，决定监管器的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// 记录日志，继续 tick
    Recoverable,
    /// 停止当前脚本并上报
    Fatal,
    /// 将脚本状态机重置回初始状态，不停止
    Timeout,
}

/// 脚本执行过程中的错误
#[derive(Error, Debug, Clone)]
pub enum ScriptError {
    #[error("Recoverable step error: {0}")]
    Recoverable(String),

    #[error("Fatal script error: {0}")]
    Fatal(String),

    /// 状态停留超时且超过重试次数
    #[error("State {state} exceeded {retries} retries")]
    StateTimeout { state: String, retries: u32 },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Action failed: {0}")]
    ActionFailed(String),

    /// 行为策略闸门拒绝（宵禁 / 会话上限 / 连续错误熔断）
    #[error("Action rejected by policy: {0}")]
    Rejected(String),

    #[error("Step panicked: {0}")]
    Panicked(String),
}

impl ScriptError {
    /// 默认分类；脚本可通过 `Script::on_error` 覆盖
    pub fn class(&self) -> ErrorClass {
        match self {
            ScriptError::Recoverable(_)
            | ScriptError::NodeNotFound(_)
            | ScriptError::ActionFailed(_) => ErrorClass::Recoverable,
            ScriptError::StateTimeout { .. } => ErrorClass::Timeout,
            ScriptError::Fatal(_) | ScriptError::Rejected(_) | ScriptError::Panicked(_) => {
                ErrorClass::Fatal
            }
        }
    }

    /// 上报给服务端的错误码
    pub fn code(&self) -> &'static str {
        match self {
            ScriptError::Recoverable(_) => "SCRIPT_RECOVERABLE",
            ScriptError::Fatal(_) => "SCRIPT_FATAL",
            ScriptError::StateTimeout { .. } => "STATE_TIMEOUT",
            ScriptError::NodeNotFound(_) => "NODE_NOT_FOUND",
            ScriptError::ActionFailed(_) => "ACTION_FAILED",
            ScriptError::Rejected(_) => "POLICY_REJECTED",
            ScriptError::Panicked(_) => "SCRIPT_PANIC",
        }
    }
}

/// 任务级错误码（随 TaskResult 上报）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskErrorCode {
    Expired,
    MaxRetriesExceeded,
    InvalidParams,
    UnsupportedType,
    AlreadyRunning,
    ExecutionError,
    Cancelled,
}

impl TaskErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskErrorCode::Expired => "EXPIRED",
            TaskErrorCode::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            TaskErrorCode::InvalidParams => "INVALID_PARAMS",
            TaskErrorCode::UnsupportedType => "UNSUPPORTED_TYPE",
            TaskErrorCode::AlreadyRunning => "ALREADY_RUNNING",
            TaskErrorCode::ExecutionError => "EXECUTION_ERROR",
            TaskErrorCode::Cancelled => "CANCELLED",
        }
    }
}

/// 脚本生命周期操作（start / stop / pause / resume）的错误
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Script not registered: {0}")]
    NotRegistered(String),

    #[error("Script already running: {0}")]
    AlreadyRunning(String),

    #[error("Automation surface unavailable")]
    SurfaceUnavailable,

    #[error("Outside allowed operating hours (hour {0})")]
    OutsideOperatingHours(u32),

    #[error("Script start hook failed: {0}")]
    StartFailed(ScriptError),

    #[error("No active script")]
    NoActiveScript,
}

impl SupervisorError {
    /// 前置条件类错误可稍后重试
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SupervisorError::SurfaceUnavailable | SupervisorError::OutsideOperatingHours(_)
        )
    }

    pub fn task_code(&self) -> TaskErrorCode {
        match self {
            SupervisorError::NotRegistered(_) => TaskErrorCode::InvalidParams,
            SupervisorError::AlreadyRunning(_) => TaskErrorCode::AlreadyRunning,
            _ => TaskErrorCode::ExecutionError,
        }
    }
}
