//! 心跳协议报文与命令翻译
//!
//! JSON 字段一律 camelCase。命令逐条解析、翻译为任务：单条命令格式错误返回 INVALID_PARAMS 结果，
//! 类型无法识别返回 UNSUPPORTED_TYPE 结果，由调用方写入结果缓存，不影响本轮其它命令。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{ErrorReport, ScriptStatus, TaskErrorCode};
use crate::device::ResourceStats;
use crate::queue::{Task, TaskResult, TaskSource, TaskStatus, TaskType};

/// 上行心跳
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub device_id: String,
    pub server_id: Option<String>,
    pub app_version: String,
    pub os_version: String,
    pub battery_level: u8,
    pub charging: bool,
    pub network_type: String,
    pub group_tag: Option<String>,
    pub script: ScriptStatus,
    /// 自动化接口（无障碍服务）是否可用
    pub accessibility_enabled: bool,
    pub last_error: Option<ErrorReport>,
    pub resources: ResourceStats,
    pub task_results: Vec<TaskResult>,
    pub degraded: bool,
    /// 毫秒时间戳
    pub timestamp: i64,
}

/// 下行响应
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatResponse {
    pub success: bool,
    /// 服务端分配的设备标识
    pub server_id: Option<String>,
    /// 配置更新（整体替换 RemoteConfig）
    pub config: Option<Value>,
    /// 原始命令条目，由 `Command::parse` 逐条解析
    pub commands: Vec<Value>,
    pub server_time: Option<i64>,
    pub message: Option<String>,
}

/// 服务端命令
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    /// 过期时间（毫秒时间戳）
    #[serde(default)]
    pub expiration: Option<i64>,
    #[serde(default)]
    pub priority: i32,
}

/// 翻译时使用的缺省值
#[derive(Debug, Clone, Copy)]
pub struct CommandDefaults {
    pub max_retries: u32,
    /// 命令未携带过期时间时的有效期
    pub expiry_secs: Option<u64>,
}

impl Default for CommandDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            expiry_secs: None,
        }
    }
}

fn task_id_for(command_id: &str) -> String {
    format!("task_{command_id}")
}

/// 无法成为任务的命令对应的失败结果
fn rejected(command_id: &str, code: TaskErrorCode, message: String) -> TaskResult {
    let placeholder = Task::new(TaskType::ReportStatus)
        .with_id(task_id_for(command_id))
        .with_command(command_id);
    TaskResult::for_task(&placeholder, TaskStatus::Failed).with_error(code, message)
}

impl Command {
    /// 解析单条命令。格式错误时：能取到 id 则返回 INVALID_PARAMS 结果，否则返回 None
    pub fn parse(raw: Value) -> Result<Command, Option<TaskResult>> {
        let id = raw.get("id").and_then(Value::as_str).map(str::to_string);
        serde_json::from_value::<Command>(raw).map_err(|e| match id {
            Some(id) => {
                tracing::warn!(command_id = %id, error = %e, "Malformed command");
                Some(rejected(&id, TaskErrorCode::InvalidParams, format!("malformed command: {e}")))
            }
            None => {
                tracing::warn!(error = %e, "Skipping command without id");
                None
            }
        })
    }

    /// 任务 ID 由命令 ID 派生，服务端重复下发同一命令时被队列按 ID 去重
    pub fn task_id(&self) -> String {
        task_id_for(&self.id)
    }

    pub fn into_task(self, defaults: CommandDefaults) -> Result<Task, TaskResult> {
        let task_id = self.task_id();
        let Some(task_type) = TaskType::from_command_type(&self.command_type) else {
            tracing::warn!(command_id = %self.id, command_type = %self.command_type, "Unsupported command type");
            return Err(rejected(
                &self.id,
                TaskErrorCode::UnsupportedType,
                format!("unsupported command type: {}", self.command_type),
            ));
        };

        let mut task = Task::new(task_type)
            .with_id(task_id)
            .with_command(self.id)
            .with_source(TaskSource::Remote)
            .with_payload(self.params)
            .with_priority(self.priority)
            .with_max_retries(defaults.max_retries);
        let expiry = self
            .expiration
            .or_else(|| defaults.expiry_secs.map(|secs| task.created_at + secs as i64 * 1000));
        if let Some(expires_at) = expiry {
            task = task.with_expiry(expires_at);
        }
        Ok(task)
    }
}
