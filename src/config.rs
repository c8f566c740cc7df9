//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `DRONE__*` 覆盖（双下划线表示嵌套，如 `DRONE__SERVER__HEARTBEAT_URL=...`）。
//! 服务端可下发的子集（RemoteConfig）单独保存在 LiveConfig 中，运行期整体替换。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::behavior::BehaviorProfile;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub device: DeviceSection,
    pub server: ServerSection,
    pub queue: QueueSection,
    pub script: ScriptSection,
    pub dispatch: DispatchSection,
    pub behavior: BehaviorSection,
}

/// [device] 段：设备标识与上报信息
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceSection {
    /// 未设置时启动时生成 uuid
    pub device_id: Option<String>,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    #[serde(default = "default_os_version")]
    pub os_version: String,
    pub group_tag: Option<String>,
    #[serde(default = "default_network_type")]
    pub network_type: String,
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_os_version() -> String {
    std::env::consts::OS.to_string()
}

fn default_network_type() -> String {
    "wifi".to_string()
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            device_id: None,
            app_version: default_app_version(),
            os_version: default_os_version(),
            group_tag: None,
            network_type: default_network_type(),
        }
    }
}

/// [server] 段：心跳地址、间隔与退避
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_heartbeat_url")]
    pub heartbeat_url: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_backoff_cap_exponent")]
    pub backoff_cap_exponent: u32,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// 连续失败达到该值进入降级模式
    #[serde(default = "default_degraded_threshold")]
    pub degraded_threshold: u32,
    /// 传输层重试次数（不含首次）
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,
    #[serde(default = "default_transport_backoff_ms")]
    pub transport_backoff_ms: u64,
    #[serde(default = "default_clock_skew_warn_secs")]
    pub clock_skew_warn_secs: u64,
    #[serde(default = "default_final_heartbeat_timeout_secs")]
    pub final_heartbeat_timeout_secs: u64,
}

fn default_heartbeat_url() -> String {
    "http://127.0.0.1:8080/api/device/heartbeat".to_string()
}

fn default_request_timeout_secs() -> u64 {
    15
}

fn default_base_interval_secs() -> u64 {
    30
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_cap_exponent() -> u32 {
    5
}

fn default_max_interval_secs() -> u64 {
    600
}

fn default_degraded_threshold() -> u32 {
    5
}

fn default_transport_retries() -> u32 {
    2
}

fn default_transport_backoff_ms() -> u64 {
    1000
}

fn default_clock_skew_warn_secs() -> u64 {
    30
}

fn default_final_heartbeat_timeout_secs() -> u64 {
    5
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            heartbeat_url: default_heartbeat_url(),
            request_timeout_secs: default_request_timeout_secs(),
            base_interval_secs: default_base_interval_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_cap_exponent: default_backoff_cap_exponent(),
            max_interval_secs: default_max_interval_secs(),
            degraded_threshold: default_degraded_threshold(),
            transport_retries: default_transport_retries(),
            transport_backoff_ms: default_transport_backoff_ms(),
            clock_skew_warn_secs: default_clock_skew_warn_secs(),
            final_heartbeat_timeout_secs: default_final_heartbeat_timeout_secs(),
        }
    }
}

/// [queue] 段
#[derive(Debug, Clone, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_result_capacity")]
    pub result_capacity: usize,
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 命令未携带过期时间时使用；None 表示永不过期
    pub default_expiry_secs: Option<u64>,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_result_capacity() -> usize {
    crate::queue::DEFAULT_RESULT_CAPACITY
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5000
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            result_capacity: default_result_capacity(),
            default_max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            default_expiry_secs: None,
        }
    }
}

/// [script] 段：tick 间隔与状态机超时
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptSection {
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_max_state_duration_ms")]
    pub max_state_duration_ms: u64,
    #[serde(default = "default_max_state_retry")]
    pub max_state_retry: u32,
    /// 连续步错误阈值，0 表示不强制结束
    #[serde(default = "default_max_step_errors")]
    pub max_step_errors: u32,
    /// 内置 scroll_read 的轮数，0 表示不限
    #[serde(default = "default_scroll_read_rounds")]
    pub scroll_read_rounds: u32,
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_max_state_duration_ms() -> u64 {
    30_000
}

fn default_max_state_retry() -> u32 {
    3
}

fn default_max_step_errors() -> u32 {
    5
}

fn default_scroll_read_rounds() -> u32 {
    20
}

impl Default for ScriptSection {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_state_duration_ms: default_max_state_duration_ms(),
            max_state_retry: default_max_state_retry(),
            max_step_errors: default_max_step_errors(),
            scroll_read_rounds: default_scroll_read_rounds(),
        }
    }
}

/// [dispatch] 段
#[derive(Debug, Clone, Deserialize)]
pub struct DispatchSection {
    #[serde(default = "default_action_timeout_ms")]
    pub action_timeout_ms: u64,
}

fn default_action_timeout_ms() -> u64 {
    5000
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            action_timeout_ms: default_action_timeout_ms(),
        }
    }
}

/// [behavior] 段：启用的档案名与可选档案文件
#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorSection {
    #[serde(default = "default_profile_name")]
    pub profile: String,
    pub profiles_path: Option<PathBuf>,
}

fn default_profile_name() -> String {
    "default".to_string()
}

impl Default for BehaviorSection {
    fn default() -> Self {
        Self {
            profile: default_profile_name(),
            profiles_path: None,
        }
    }
}

/// 从 config 目录加载配置，环境变量 DRONE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 DRONE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("DRONE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

// ---------- 服务端可下发的配置 ----------

/// 服务端可下发的配置子集；更新时整体替换，缺省字段取默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemoteConfig {
    pub heartbeat_interval_secs: u64,
    /// 档案名（预设或档案文件中的名字）
    pub behavior_profile: String,
    /// 内联档案，优先于 behavior_profile
    pub profile: Option<BehaviorProfile>,
    pub group_tag: Option<String>,
    pub tick_interval_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_base_interval_secs(),
            behavior_profile: default_profile_name(),
            profile: None,
            group_tag: None,
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl RemoteConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            heartbeat_interval_secs: config.server.base_interval_secs,
            behavior_profile: config.behavior.profile.clone(),
            profile: None,
            group_tag: config.device.group_tag.clone(),
            tick_interval_ms: config.script.tick_interval_ms,
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }
}

/// 运行期配置；替换时通知订阅方
#[derive(Debug)]
pub struct LiveConfig {
    tx: watch::Sender<Arc<RemoteConfig>>,
}

impl LiveConfig {
    pub fn new(initial: RemoteConfig) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    pub fn get(&self) -> Arc<RemoteConfig> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<RemoteConfig>> {
        self.tx.subscribe()
    }

    pub fn replace(&self, config: RemoteConfig) {
        tracing::info!(
            heartbeat_interval_secs = config.heartbeat_interval_secs,
            profile = %config.behavior_profile,
            tick_interval_ms = config.tick_interval_ms,
            "Live config replaced"
        );
        self.tx.send_replace(Arc::new(config));
    }

    /// 以服务端下发的 JSON 整体替换；无法解析时保持原值
    pub fn apply_update(&self, update: &Value) -> Result<Arc<RemoteConfig>, serde_json::Error> {
        let config: RemoteConfig = serde_json::from_value(update.clone())?;
        self.replace(config);
        Ok(self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.base_interval_secs, 30);
        assert_eq!(config.server.degraded_threshold, 5);
        assert_eq!(config.queue.poll_interval_ms, 1000);
        assert_eq!(config.queue.result_capacity, 100);
        assert_eq!(config.script.max_state_duration_ms, 30_000);
        assert_eq!(config.behavior.profile, "default");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = config::Config::builder()
            .add_source(config::File::from_str(
                "[server]\nbase_interval_secs = 10\n[script]\nmax_step_errors = 0\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let config: AppConfig = c.try_deserialize().unwrap();
        assert_eq!(config.server.base_interval_secs, 10);
        assert_eq!(config.server.max_interval_secs, 600);
        assert_eq!(config.script.max_step_errors, 0);
        assert_eq!(config.script.tick_interval_ms, 1000);
        assert_eq!(config.dispatch.action_timeout_ms, 5000);
    }

    #[test]
    fn test_remote_update_replaces_whole_object() {
        let live = LiveConfig::new(RemoteConfig {
            heartbeat_interval_secs: 10,
            behavior_profile: "brisk".into(),
            profile: None,
            group_tag: Some("g1".into()),
            tick_interval_ms: 500,
        });
        let mut rx = live.subscribe();

        let updated = live
            .apply_update(&serde_json::json!({ "heartbeatIntervalSecs": 60 }))
            .unwrap();
        assert_eq!(updated.heartbeat_interval_secs, 60);
        // 未下发的字段回到默认值，而不是保留旧值
        assert_eq!(updated.behavior_profile, "default");
        assert_eq!(updated.group_tag, None);
        assert_eq!(updated.tick_interval_ms, 1000);
        assert!(rx.has_changed().unwrap());

        assert!(live.apply_update(&serde_json::json!({ "heartbeatIntervalSecs": "soon" })).is_err());
        assert_eq!(live.get().heartbeat_interval_secs, 60);
    }

    #[test]
    fn test_inline_profile_in_update() {
        let live = LiveConfig::new(RemoteConfig::default());
        let updated = live
            .apply_update(&serde_json::json!({
                "profile": { "name": "night", "tap_interval_min_ms": 2000, "tap_interval_max_ms": 100 }
            }))
            .unwrap();
        let profile = updated.profile.clone().unwrap();
        assert_eq!(profile.name, "night");
        assert_eq!(profile.tap_interval_min_ms, 2000);
    }
}
