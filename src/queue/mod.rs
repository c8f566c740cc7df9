//! 任务队列：优先级排序、去重、过期清理、有界结果缓存

mod task;
mod task_queue;

pub use task::{
    Task, TaskId, TaskResult, TaskSource, TaskStatus, TaskType, MAX_PRIORITY_OVERRIDE,
    PRIORITY_SCALE,
};
pub use task_queue::{TaskQueue, DEFAULT_RESULT_CAPACITY};
