//! 拟人化行为策略：行为档案 + 风控闸门 + 随机时序

mod policy;
mod profile;

pub use policy::{
    in_curfew, BehaviorPolicy, Clock, FixedClock, GateRejection, PausePlan, Point, SwipePlan,
    SystemClock, TapPlan, MAX_READING_DELAY,
};
pub use profile::{BehaviorProfile, ProfileBook, ProfileError};
