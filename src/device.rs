//! 设备信息（外部协作者）
//!
//! 心跳需要的设备标识、电量、网络类型与资源统计由宿主提供；StaticDeviceInfo 由 [device] 配置构造，
//! 用于无宿主运行与测试。

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::config::DeviceSection;

/// 电量
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryInfo {
    pub level: u8,
    pub charging: bool,
}

/// 资源统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStats {
    pub cpu_percent: f32,
    pub memory_mb: u64,
    pub free_storage_mb: u64,
}

pub trait DeviceInfoProvider: Send + Sync {
    fn device_id(&self) -> String;

    /// 服务端分配的标识（首次心跳后下发）
    fn server_id(&self) -> Option<String> {
        None
    }

    fn set_server_id(&self, _id: String) {}

    fn app_version(&self) -> String;

    fn os_version(&self) -> String;

    fn group_tag(&self) -> Option<String>;

    fn network_type(&self) -> String;

    fn battery(&self) -> BatteryInfo;

    fn resources(&self) -> ResourceStats;
}

#[derive(Debug)]
pub struct StaticDeviceInfo {
    device_id: String,
    server_id: Mutex<Option<String>>,
    app_version: String,
    os_version: String,
    group_tag: Option<String>,
    network_type: String,
}

impl StaticDeviceInfo {
    pub fn from_config(section: &DeviceSection) -> Self {
        let device_id = section
            .device_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        Self {
            device_id,
            server_id: Mutex::new(None),
            app_version: section.app_version.clone(),
            os_version: section.os_version.clone(),
            group_tag: section.group_tag.clone(),
            network_type: section.network_type.clone(),
        }
    }
}

impl DeviceInfoProvider for StaticDeviceInfo {
    fn device_id(&self) -> String {
        self.device_id.clone()
    }

    fn server_id(&self) -> Option<String> {
        self.server_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_server_id(&self, id: String) {
        *self.server_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id);
    }

    fn app_version(&self) -> String {
        self.app_version.clone()
    }

    fn os_version(&self) -> String {
        self.os_version.clone()
    }

    fn group_tag(&self) -> Option<String> {
        self.group_tag.clone()
    }

    fn network_type(&self) -> String {
        self.network_type.clone()
    }

    fn battery(&self) -> BatteryInfo {
        BatteryInfo {
            level: 100,
            charging: true,
        }
    }

    fn resources(&self) -> ResourceStats {
        ResourceStats::default()
    }
}
