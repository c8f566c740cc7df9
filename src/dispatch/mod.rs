//! 动作分发：宿主自动化接口契约 + 单飞串行分发器

mod dispatcher;
mod simulated;
mod surface;

pub use dispatcher::{ActionDispatcher, DispatchStats};
pub use simulated::SimulatedSurface;
pub use surface::{
    ActionOutcome, ActionSpec, AutomationSurface, Completion, NodeHandle, SurfaceError,
};
