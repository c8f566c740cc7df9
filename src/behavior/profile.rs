//! 行为档案
//!
//! 一组命名的时序区间、空间抖动、概率触发器、阅读速度模型与风控参数。
//! 所有来源（内置预设 / profiles.toml / 服务端下发）都必须经过 `normalize()`，
//! 归一化后不可变，只能整体替换。

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Failed to read profile file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid profile file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Unknown behavior profile: {0}")]
    Unknown(String),
}

/// 行为档案（毫秒 / 像素 / 概率）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorProfile {
    pub name: String,

    /// 相邻动作间隔
    pub tap_interval_min_ms: u64,
    pub tap_interval_max_ms: u64,
    /// 单次点击按压时长
    pub tap_press_min_ms: u64,
    pub tap_press_max_ms: u64,
    pub swipe_duration_min_ms: u64,
    pub swipe_duration_max_ms: u64,

    /// 点击坐标抖动上限（±px）
    pub tap_offset_px: u32,
    /// 滑动端点抖动上限（±px）
    pub swipe_offset_px: u32,

    pub hesitate_probability: f64,
    pub hesitate_min_ms: u64,
    pub hesitate_max_ms: u64,

    pub think_probability: f64,
    pub think_min_ms: u64,
    pub think_max_ms: u64,

    /// 先点偏附近位置再点目标的概率
    pub mis_tap_probability: f64,
    pub mis_tap_distance_px: u32,

    /// 阅读速度（字/秒）
    pub reading_chars_per_sec_min: f64,
    pub reading_chars_per_sec_max: f64,

    /// 单次会话最长分钟数，0 表示不限制
    pub session_max_minutes: u64,
    /// 宵禁区间 [start, end)，小时；start == end 表示不启用，支持跨午夜
    pub curfew_start_hour: u32,
    pub curfew_end_hour: u32,
    /// 连续动作失败容忍次数，0 表示不启用熔断
    pub max_consecutive_errors: u32,
}

impl Default for BehaviorProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            tap_interval_min_ms: 800,
            tap_interval_max_ms: 2500,
            tap_press_min_ms: 60,
            tap_press_max_ms: 150,
            swipe_duration_min_ms: 300,
            swipe_duration_max_ms: 800,
            tap_offset_px: 8,
            swipe_offset_px: 20,
            hesitate_probability: 0.1,
            hesitate_min_ms: 300,
            hesitate_max_ms: 1200,
            think_probability: 0.05,
            think_min_ms: 2000,
            think_max_ms: 6000,
            mis_tap_probability: 0.02,
            mis_tap_distance_px: 40,
            reading_chars_per_sec_min: 8.0,
            reading_chars_per_sec_max: 15.0,
            session_max_minutes: 120,
            curfew_start_hour: 1,
            curfew_end_hour: 7,
            max_consecutive_errors: 5,
        }
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

fn order_pair(min: u64, max: u64) -> (u64, u64) {
    (min, max.max(min))
}

impl BehaviorProfile {
    /// 归一化：概率 ∈ [0,1]，max ≥ min，小时取模 24，阅读速度为正
    pub fn normalize(mut self) -> Self {
        if self.name.trim().is_empty() {
            self.name = "custom".to_string();
        }
        (self.tap_interval_min_ms, self.tap_interval_max_ms) =
            order_pair(self.tap_interval_min_ms, self.tap_interval_max_ms);
        (self.tap_press_min_ms, self.tap_press_max_ms) =
            order_pair(self.tap_press_min_ms, self.tap_press_max_ms);
        (self.swipe_duration_min_ms, self.swipe_duration_max_ms) =
            order_pair(self.swipe_duration_min_ms, self.swipe_duration_max_ms);
        (self.hesitate_min_ms, self.hesitate_max_ms) =
            order_pair(self.hesitate_min_ms, self.hesitate_max_ms);
        (self.think_min_ms, self.think_max_ms) = order_pair(self.think_min_ms, self.think_max_ms);

        self.hesitate_probability = clamp_probability(self.hesitate_probability);
        self.think_probability = clamp_probability(self.think_probability);
        self.mis_tap_probability = clamp_probability(self.mis_tap_probability);

        let fallback = Self::default();
        if !(self.reading_chars_per_sec_min.is_finite() && self.reading_chars_per_sec_min > 0.0) {
            self.reading_chars_per_sec_min = fallback.reading_chars_per_sec_min;
        }
        if !(self.reading_chars_per_sec_max.is_finite()
            && self.reading_chars_per_sec_max >= self.reading_chars_per_sec_min)
        {
            self.reading_chars_per_sec_max = self.reading_chars_per_sec_min;
        }

        self.curfew_start_hour %= 24;
        self.curfew_end_hour %= 24;
        self
    }

    /// 内置预设
    pub fn preset(name: &str) -> Option<Self> {
        let base = Self::default();
        let profile = match name {
            "default" => base,
            // 慢节奏、更多停顿、更严格的风控
            "cautious" => Self {
                name: "cautious".to_string(),
                tap_interval_min_ms: 1500,
                tap_interval_max_ms: 4000,
                hesitate_probability: 0.2,
                think_probability: 0.1,
                think_max_ms: 9000,
                reading_chars_per_sec_min: 5.0,
                reading_chars_per_sec_max: 10.0,
                session_max_minutes: 60,
                curfew_start_hour: 0,
                curfew_end_hour: 8,
                max_consecutive_errors: 3,
                ..base
            },
            "brisk" => Self {
                name: "brisk".to_string(),
                tap_interval_min_ms: 400,
                tap_interval_max_ms: 1200,
                swipe_duration_min_ms: 200,
                swipe_duration_max_ms: 500,
                hesitate_probability: 0.05,
                think_probability: 0.02,
                mis_tap_probability: 0.01,
                reading_chars_per_sec_min: 12.0,
                reading_chars_per_sec_max: 20.0,
                session_max_minutes: 180,
                ..base
            },
            _ => return None,
        };
        Some(profile.normalize())
    }
}

#[derive(Debug, Deserialize, Default)]
struct ProfileFile {
    #[serde(default)]
    profiles: HashMap<String, BehaviorProfile>,
}

/// 命名档案集合：文件中定义的档案优先，其次内置预设
#[derive(Debug, Clone, Default)]
pub struct ProfileBook {
    profiles: HashMap<String, BehaviorProfile>,
}

impl ProfileBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// 解析 `[profiles.<name>]` 表
    pub fn from_toml_str(s: &str) -> Result<Self, ProfileError> {
        let file: ProfileFile = toml::from_str(s)?;
        let profiles = file
            .profiles
            .into_iter()
            .map(|(name, mut profile)| {
                profile.name = name.clone();
                (name, profile.normalize())
            })
            .collect();
        Ok(Self { profiles })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ProfileError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn get(&self, name: &str) -> Result<BehaviorProfile, ProfileError> {
        self.profiles
            .get(name)
            .cloned()
            .or_else(|| BehaviorProfile::preset(name))
            .ok_or_else(|| ProfileError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        self.profiles.keys().cloned().collect()
    }
}
