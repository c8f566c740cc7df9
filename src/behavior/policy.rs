//! 行为策略引擎
//!
//! 每个原子动作前先过风控闸门（宵禁 → 会话时长 → 连续错误熔断），
//! 通过后按概率注入「思考」与「犹豫」停顿；动作参数（坐标抖动、误触、间隔、滑动时长）
//! 均从当前档案的区间中均匀抽样。随机源可播种，便于确定性测试。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Timelike;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;
use tokio::time::Instant;

use super::profile::BehaviorProfile;

/// 单次阅读停顿上限
pub const MAX_READING_DELAY: Duration = Duration::from_secs(300);

/// 本地时钟（用于宵禁判断），测试时可注入固定时钟
pub trait Clock: Send + Sync {
    /// 当前本地小时（0-23）
    fn local_hour(&self) -> u32;
}

/// 系统本地时钟
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_hour(&self) -> u32 {
        chrono::Local::now().hour()
    }
}

/// 固定小时的时钟，可在运行中修改
#[derive(Debug, Default)]
pub struct FixedClock {
    hour: AtomicU32,
}

impl FixedClock {
    pub fn new(hour: u32) -> Self {
        Self {
            hour: AtomicU32::new(hour % 24),
        }
    }

    pub fn set_hour(&self, hour: u32) {
        self.hour.store(hour % 24, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn local_hour(&self) -> u32 {
        self.hour.load(Ordering::SeqCst)
    }
}

/// 风控闸门拒绝原因
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateRejection {
    #[error("curfew in effect (hour {hour})")]
    Curfew { hour: u32 },

    #[error("session cap reached after {elapsed_minutes} minutes")]
    SessionExpired { elapsed_minutes: u64 },

    #[error("{count} consecutive action errors")]
    ErrorTolerance { count: u32 },
}

/// 屏幕坐标
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// 动作前的停顿计划；两种停顿可同时触发
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PausePlan {
    pub think: Option<Duration>,
    pub hesitate: Option<Duration>,
}

impl PausePlan {
    pub fn total(&self) -> Duration {
        self.think.unwrap_or_default() + self.hesitate.unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapPlan {
    pub target: Point,
    /// 误触位置（先点这里，再点 target）
    pub mis_tap: Option<Point>,
    pub press: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwipePlan {
    pub from: Point,
    pub to: Point,
    pub duration: Duration,
}

/// 判断小时是否落在宵禁区间 [start, end)，支持跨午夜；start == end 视为未启用
pub fn in_curfew(hour: u32, start: u32, end: u32) -> bool {
    if start == end {
        return false;
    }
    if start < end {
        hour >= start && hour < end
    } else {
        hour >= start || hour < end
    }
}

/// 行为策略引擎
pub struct BehaviorPolicy {
    profile: RwLock<Arc<BehaviorProfile>>,
    rng: Mutex<StdRng>,
    clock: Arc<dyn Clock>,
    session_started: Mutex<Instant>,
    consecutive_errors: AtomicU32,
}

impl BehaviorPolicy {
    pub fn new(profile: BehaviorProfile) -> Self {
        Self::build(profile, StdRng::from_rng(&mut rand::rng()), Arc::new(SystemClock))
    }

    /// 固定随机种子（测试用）
    pub fn with_seed(profile: BehaviorProfile, seed: u64) -> Self {
        Self::build(profile, StdRng::seed_from_u64(seed), Arc::new(SystemClock))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn build(profile: BehaviorProfile, rng: StdRng, clock: Arc<dyn Clock>) -> Self {
        Self {
            profile: RwLock::new(Arc::new(profile.normalize())),
            rng: Mutex::new(rng),
            clock,
            session_started: Mutex::new(Instant::now()),
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn profile(&self) -> Arc<BehaviorProfile> {
        self.profile.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 整体替换档案（先归一化）
    pub fn swap_profile(&self, profile: BehaviorProfile) {
        let profile = profile.normalize();
        tracing::info!(profile = %profile.name, "Behavior profile switched");
        *self.profile.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(profile);
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut rng)
    }

    fn draw_ms(&self, min: u64, max: u64) -> Duration {
        let ms = if max <= min {
            min
        } else {
            self.with_rng(|rng| rng.random_range(min..=max))
        };
        Duration::from_millis(ms)
    }

    fn chance(&self, probability: f64) -> bool {
        if probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        self.with_rng(|rng| rng.random_bool(probability))
    }

    fn offset(&self, bound: u32) -> i32 {
        if bound == 0 {
            return 0;
        }
        let bound = bound.min(i32::MAX as u32) as i32;
        self.with_rng(|rng| rng.random_range(-bound..=bound))
    }

    // ---------- 风控闸门 ----------

    /// 仅检查宵禁（脚本启动前置条件）
    pub fn check_operating_hours(&self) -> Result<(), GateRejection> {
        let profile = self.profile();
        let hour = self.clock.local_hour();
        if in_curfew(hour, profile.curfew_start_hour, profile.curfew_end_hour) {
            return Err(GateRejection::Curfew { hour });
        }
        Ok(())
    }

    /// 动作前闸门：宵禁 → 会话上限 → 连续错误
    pub fn gate(&self) -> Result<(), GateRejection> {
        let profile = self.profile();
        self.check_operating_hours()?;

        if profile.session_max_minutes > 0 {
            let elapsed = self.session_elapsed();
            if elapsed >= Duration::from_secs(profile.session_max_minutes * 60) {
                return Err(GateRejection::SessionExpired {
                    elapsed_minutes: elapsed.as_secs() / 60,
                });
            }
        }

        let count = self.consecutive_errors();
        if profile.max_consecutive_errors > 0 && count >= profile.max_consecutive_errors {
            return Err(GateRejection::ErrorTolerance { count });
        }
        Ok(())
    }

    /// 抽样本次动作前的停顿
    pub fn plan_pauses(&self) -> PausePlan {
        let profile = self.profile();
        let think = self
            .chance(profile.think_probability)
            .then(|| self.draw_ms(profile.think_min_ms, profile.think_max_ms));
        let hesitate = self
            .chance(profile.hesitate_probability)
            .then(|| self.draw_ms(profile.hesitate_min_ms, profile.hesitate_max_ms));
        PausePlan { think, hesitate }
    }

    /// 闸门 + 停顿；返回实际执行的停顿计划
    pub async fn before_action(&self) -> Result<PausePlan, GateRejection> {
        if let Err(rejection) = self.gate() {
            tracing::warn!(reason = %rejection, "Action rejected by behavior gate");
            return Err(rejection);
        }
        let plan = self.plan_pauses();
        if let Some(think) = plan.think {
            tracing::debug!(ms = think.as_millis() as u64, "Thinking pause");
            tokio::time::sleep(think).await;
        }
        if let Some(hesitate) = plan.hesitate {
            tracing::debug!(ms = hesitate.as_millis() as u64, "Hesitation pause");
            tokio::time::sleep(hesitate).await;
        }
        Ok(plan)
    }

    // ---------- 动作参数 ----------

    pub fn jitter(&self, point: Point, bound: u32) -> Point {
        Point {
            x: point.x.saturating_add(self.offset(bound)),
            y: point.y.saturating_add(self.offset(bound)),
        }
    }

    pub fn plan_tap(&self, x: i32, y: i32) -> TapPlan {
        let profile = self.profile();
        let target = self.jitter(Point::new(x, y), profile.tap_offset_px);
        let mis_tap = self.chance(profile.mis_tap_probability).then(|| {
            let d = profile.mis_tap_distance_px.max(1) as i32;
            let dx = self.with_rng(|rng| if rng.random_bool(0.5) { d } else { -d });
            let dy = self.offset(profile.mis_tap_distance_px);
            Point::new(target.x.saturating_add(dx), target.y.saturating_add(dy))
        });
        TapPlan {
            target,
            mis_tap,
            press: self.draw_ms(profile.tap_press_min_ms, profile.tap_press_max_ms),
        }
    }

    pub fn plan_swipe(&self, from: Point, to: Point) -> SwipePlan {
        let profile = self.profile();
        SwipePlan {
            from: self.jitter(from, profile.swipe_offset_px),
            to: self.jitter(to, profile.swipe_offset_px),
            duration: self.draw_ms(profile.swipe_duration_min_ms, profile.swipe_duration_max_ms),
        }
    }

    /// 相邻动作间隔
    pub fn action_interval(&self) -> Duration {
        let profile = self.profile();
        self.draw_ms(profile.tap_interval_min_ms, profile.tap_interval_max_ms)
    }

    /// 按阅读速度模型估算阅读 `chars` 个字所需时长
    pub fn reading_delay(&self, chars: usize) -> Duration {
        if chars == 0 {
            return Duration::ZERO;
        }
        let profile = self.profile();
        let (min, max) = (profile.reading_chars_per_sec_min, profile.reading_chars_per_sec_max);
        let speed = if max > min {
            self.with_rng(|rng| rng.random_range(min..=max))
        } else {
            min
        };
        Duration::try_from_secs_f64(chars as f64 / speed)
            .map_or(MAX_READING_DELAY, |d| d.min(MAX_READING_DELAY))
    }

    // ---------- 状态 ----------

    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// 返回累加后的连续错误数
    pub fn record_failure(&self) -> u32 {
        self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    /// 开始新会话：重置会话计时与错误计数
    pub fn reset_session(&self) {
        *self.session_started.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    pub fn session_elapsed(&self) -> Duration {
        self.session_started
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .elapsed()
    }
}
