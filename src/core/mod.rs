//! 核心层：错误分类、状态快照、优雅关闭

pub mod error;
pub mod shutdown;
pub mod state;

pub use error::{ErrorClass, ScriptError, SupervisorError, TaskErrorCode};
pub use shutdown::{
    run_with_graceful_shutdown, ShutdownCleanup, ShutdownCoordinator, ShutdownManager,
    ShutdownReason,
};
pub use state::{EngineStatus, ErrorReport, ErrorTracker, QueueStatus, RunStatus, ScriptStatus};
