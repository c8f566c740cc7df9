//! 状态快照：脚本状态、最近错误、引擎/队列状态
//!
//! 均为按需组装的只读投影，不持久化；心跳上报与对外查询共用同一组结构。

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchStats;

/// 脚本运行状态（心跳上报值：running|idle|error|paused|stopped）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Idle,
    Error,
    Paused,
    Stopped,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Idle
    }
}

/// 当前脚本状态快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptStatus {
    /// 脚本注册名，无脚本时为 None
    pub key: Option<String>,
    pub status: RunStatus,
    /// 最近一次成功 tick 的时间（毫秒时间戳）
    pub last_success_at: Option<i64>,
    /// 当日累计运行分钟数
    pub daily_runtime_minutes: u64,
    /// 状态机当前状态名
    pub current_state: Option<String>,
    pub started_at: Option<i64>,
}

/// 最近一次分类后的错误
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    pub code: String,
    pub message: String,
    /// 毫秒时间戳
    pub time: i64,
    /// 同一错误码连续出现次数
    pub count: u32,
}

/// 最近错误追踪：监管器与心跳通道共同写入，心跳读取
#[derive(Debug, Default)]
pub struct ErrorTracker {
    last: Mutex<Option<ErrorReport>>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录错误；与上一条错误码相同则累加计数
    pub fn record(&self, code: &str, message: impl Into<String>) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let count = match last.as_ref() {
            Some(prev) if prev.code == code => prev.count.saturating_add(1),
            _ => 1,
        };
        *last = Some(ErrorReport {
            code: code.to_string(),
            message: message.into(),
            time: chrono::Utc::now().timestamp_millis(),
            count,
        });
    }

    pub fn last(&self) -> Option<ErrorReport> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// 队列状态快照
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub pending: usize,
    /// 按任务类型统计的待执行数
    pub by_type: HashMap<String, usize>,
    pub cached_results: usize,
}

/// 引擎状态快照（对外查询接口）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub running: bool,
    pub paused: bool,
    pub current_script: Option<String>,
    pub script: ScriptStatus,
    pub queue: QueueStatus,
    pub dispatch: DispatchStats,
    pub degraded: bool,
    pub consecutive_heartbeat_failures: u32,
    pub last_error: Option<ErrorReport>,
}
