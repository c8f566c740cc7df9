//! 任务与任务结果
//!
//! 任务由远程命令翻译或本地直接创建；有效优先级 = 类型等级 × PRIORITY_SCALE + 覆盖值，
//! 覆盖值被钳制在 ±MAX_PRIORITY_OVERRIDE 内，因此类型等级永远占主导。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::TaskErrorCode;

/// 任务 ID（队列内唯一）
pub type TaskId = String;

/// 类型等级的放大系数
pub const PRIORITY_SCALE: i64 = 1000;

/// 覆盖值上限；必须小于 PRIORITY_SCALE / 2
pub const MAX_PRIORITY_OVERRIDE: i32 = 499;

/// 任务类型，每种类型携带固定的优先级等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    StartScript,
    StopScript,
    PauseScript,
    ResumeScript,
    UpdateConfig,
    SwitchProfile,
    ReportStatus,
}

impl TaskType {
    pub fn rank(&self) -> i64 {
        match self {
            TaskType::StopScript => 6,
            TaskType::PauseScript | TaskType::ResumeScript => 5,
            TaskType::UpdateConfig | TaskType::SwitchProfile => 4,
            TaskType::ReportStatus => 3,
            TaskType::StartScript => 2,
        }
    }

    /// 命令类型字符串 → 任务类型；无法识别返回 None
    pub fn from_command_type(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start_script" | "start" => Some(TaskType::StartScript),
            "stop_script" | "stop" => Some(TaskType::StopScript),
            "pause_script" | "pause" => Some(TaskType::PauseScript),
            "resume_script" | "resume" => Some(TaskType::ResumeScript),
            "update_config" => Some(TaskType::UpdateConfig),
            "switch_profile" => Some(TaskType::SwitchProfile),
            "report_status" => Some(TaskType::ReportStatus),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::StartScript => "start_script",
            TaskType::StopScript => "stop_script",
            TaskType::PauseScript => "pause_script",
            TaskType::ResumeScript => "resume_script",
            TaskType::UpdateConfig => "update_config",
            TaskType::SwitchProfile => "switch_profile",
            TaskType::ReportStatus => "report_status",
        }
    }

    /// 「最新意图优先」的类型：入队时移除队列中同类型的旧任务
    pub fn supersedes_same_type(&self) -> bool {
        matches!(
            self,
            TaskType::StartScript | TaskType::UpdateConfig | TaskType::SwitchProfile
        )
    }
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Expired | TaskStatus::Cancelled
        )
    }
}

/// 任务来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskSource {
    /// 心跳下发的命令
    Remote,
    /// 宿主应用 / UI 直接推送
    Local,
    /// 引擎内部产生
    Internal,
}

/// 队列中的任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub task_type: TaskType,
    pub payload: HashMap<String, Value>,
    /// 优先级覆盖值（已钳制）
    pub priority_override: i32,
    /// 过期时间（毫秒时间戳）
    pub expires_at: Option<i64>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// 创建时间（毫秒时间戳）
    pub created_at: i64,
    pub status: TaskStatus,
    /// 来源命令 ID
    pub command_id: Option<String>,
    pub source: TaskSource,
}

impl Task {
    pub fn new(task_type: TaskType) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            task_type,
            payload: HashMap::new(),
            priority_override: 0,
            expires_at: None,
            retry_count: 0,
            max_retries: 3,
            created_at: chrono::Utc::now().timestamp_millis(),
            status: TaskStatus::Pending,
            command_id: None,
            source: TaskSource::Local,
        }
    }

    /// 启动指定脚本的任务
    pub fn start_script(script: &str) -> Self {
        Self::new(TaskType::StartScript).with_param("script", Value::String(script.to_string()))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_param(mut self, key: &str, value: Value) -> Self {
        self.payload.insert(key.to_string(), value);
        self
    }

    pub fn with_payload(mut self, payload: HashMap<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority_override = priority.clamp(-MAX_PRIORITY_OVERRIDE, MAX_PRIORITY_OVERRIDE);
        self
    }

    pub fn with_expiry(mut self, expires_at: i64) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_command(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn with_source(mut self, source: TaskSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn effective_priority(&self) -> i64 {
        self.task_type.rank() * PRIORITY_SCALE + self.priority_override as i64
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.map(|exp| now_ms > exp).unwrap_or(false)
    }

    /// 读取字符串参数
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

/// 任务终止结果，经下一次心跳上报
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub command_id: Option<String>,
    pub status: TaskStatus,
    pub error_code: Option<TaskErrorCode>,
    pub error_message: Option<String>,
    pub data: Option<Value>,
    /// 毫秒时间戳
    pub executed_at: i64,
    pub duration_ms: u64,
}

impl TaskResult {
    pub fn for_task(task: &Task, status: TaskStatus) -> Self {
        Self {
            task_id: task.id.clone(),
            command_id: task.command_id.clone(),
            status,
            error_code: None,
            error_message: None,
            data: None,
            executed_at: chrono::Utc::now().timestamp_millis(),
            duration_ms: 0,
        }
    }

    pub fn with_error(mut self, code: TaskErrorCode, message: impl Into<String>) -> Self {
        self.error_code = Some(code);
        self.error_message = Some(message.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_executed_at(mut self, executed_at: i64) -> Self {
        self.executed_at = executed_at;
        self
    }
}
