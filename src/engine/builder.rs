//! 引擎构建器：统一的组件初始化逻辑
//!
//! 构造顺序固定：Queue → Policy → Dispatcher → Supervisor → Channel。
//! 外部协作者（自动化接口、传输、设备信息、时钟）可注入，未注入时使用默认实现。

use std::sync::Arc;
use std::time::Duration;

use crate::behavior::{BehaviorPolicy, Clock, ProfileBook};
use crate::config::{AppConfig, LiveConfig, RemoteConfig};
use crate::core::ErrorTracker;
use crate::device::{DeviceInfoProvider, StaticDeviceInfo};
use crate::dispatch::{ActionDispatcher, AutomationSurface, SimulatedSurface};
use crate::queue::TaskQueue;
use crate::remote::{ChannelConfig, CommandDefaults, HeartbeatTransport, HttpTransport, RemoteChannel};
use crate::script::{
    register_builtin, MachineConfig, Script, ScriptContext, ScriptRegistry, ScriptSupervisor,
    SupervisorConfig,
};

use super::runtime::{Engine, EngineError, EngineParts};

pub struct EngineBuilder {
    config: AppConfig,
    surface: Option<Arc<dyn AutomationSurface>>,
    transport: Option<Arc<dyn HeartbeatTransport>>,
    device: Option<Arc<dyn DeviceInfoProvider>>,
    clock: Option<Arc<dyn Clock>>,
    seed: Option<u64>,
    registry: ScriptRegistry,
    builtin_scripts: bool,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            surface: None,
            transport: None,
            device: None,
            clock: None,
            seed: None,
            registry: ScriptRegistry::new(),
            builtin_scripts: true,
        }
    }

    pub fn with_surface(mut self, surface: Arc<dyn AutomationSurface>) -> Self {
        self.surface = Some(surface);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HeartbeatTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_device(mut self, device: Arc<dyn DeviceInfoProvider>) -> Self {
        self.device = Some(device);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// 固定行为策略的随机种子
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// 是否注册内置脚本（默认注册）
    pub fn with_builtin_scripts(mut self, enable: bool) -> Self {
        self.builtin_scripts = enable;
        self
    }

    pub fn register_script<F>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Script> + Send + Sync + 'static,
    {
        self.registry.register(name, factory);
        self
    }

    pub fn machine_config(&self) -> MachineConfig {
        MachineConfig {
            max_state_duration: Duration::from_millis(self.config.script.max_state_duration_ms),
            max_state_retry: self.config.script.max_state_retry,
        }
    }

    pub fn build(self) -> Result<Arc<Engine>, EngineError> {
        let config = self.config.clone();
        let machine = self.machine_config();

        let queue = Arc::new(TaskQueue::new(config.queue.result_capacity));

        let profiles = match &config.behavior.profiles_path {
            Some(path) => ProfileBook::load(path)?,
            None => ProfileBook::new(),
        };
        let profile = profiles.get(&config.behavior.profile)?;
        let mut policy = match self.seed {
            Some(seed) => BehaviorPolicy::with_seed(profile, seed),
            None => BehaviorPolicy::new(profile),
        };
        if let Some(clock) = self.clock {
            policy = policy.with_clock(clock);
        }
        let policy = Arc::new(policy);

        let surface = self
            .surface
            .unwrap_or_else(|| Arc::new(SimulatedSurface::new()));
        let dispatcher = Arc::new(ActionDispatcher::new(
            surface,
            Duration::from_millis(config.dispatch.action_timeout_ms),
        ));

        let mut registry = self.registry;
        if self.builtin_scripts {
            register_builtin(&mut registry, machine, config.script.scroll_read_rounds);
        }
        tracing::info!(scripts = ?registry.names(), "Script registry ready");

        let errors = Arc::new(ErrorTracker::new());
        let supervisor = Arc::new(ScriptSupervisor::new(
            registry,
            ScriptContext::new(Arc::clone(&dispatcher), Arc::clone(&policy)),
            Arc::clone(&queue),
            Arc::clone(&errors),
            SupervisorConfig {
                tick_interval: Duration::from_millis(config.script.tick_interval_ms),
                max_step_errors: config.script.max_step_errors,
            },
        ));

        let transport: Arc<dyn HeartbeatTransport> = match self.transport {
            Some(t) => t,
            None => Arc::new(HttpTransport::from_config(&config.server)?),
        };
        let device = self
            .device
            .unwrap_or_else(|| Arc::new(StaticDeviceInfo::from_config(&config.device)));
        let live = Arc::new(LiveConfig::new(RemoteConfig::from_app(&config)));
        let channel = Arc::new(RemoteChannel::new(
            transport,
            device,
            Arc::clone(&queue),
            Arc::clone(&supervisor),
            Arc::clone(&errors),
            Arc::clone(&live),
            ChannelConfig::from_server(&config.server),
            CommandDefaults {
                max_retries: config.queue.default_max_retries,
                expiry_secs: config.queue.default_expiry_secs,
            },
        ));

        Ok(Arc::new(Engine::from_parts(EngineParts {
            config,
            queue,
            policy,
            dispatcher,
            supervisor,
            channel,
            live,
            errors,
            profiles,
        })))
    }
}
