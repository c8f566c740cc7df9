//! 宿主自动化接口（外部协作者）
//!
//! UI 树查询与手势注入由宿主提供；手势以回调方式完成，这里用单次赋值的 `Completion`
//! 把回调转换为可等待的 future。迟到或重复的完成回调是无害的空操作。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;

use crate::behavior::Point;

/// 原子手势
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionSpec {
    Tap { at: Point, press: Duration },
    Swipe { from: Point, to: Point, duration: Duration },
    LongPress { at: Point, duration: Duration },
}

impl ActionSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            ActionSpec::Tap { .. } => "tap",
            ActionSpec::Swipe { .. } => "swipe",
            ActionSpec::LongPress { .. } => "long_press",
        }
    }

    /// 手势本身的执行时长
    pub fn gesture_duration(&self) -> Duration {
        match self {
            ActionSpec::Tap { press, .. } => *press,
            ActionSpec::Swipe { duration, .. } | ActionSpec::LongPress { duration, .. } => *duration,
        }
    }
}

/// 宿主上报的手势结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed,
    Cancelled,
}

/// UI 节点句柄（宿主定义的不透明标识）
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle(pub String);

#[derive(Error, Debug, Clone)]
pub enum SurfaceError {
    #[error("automation surface error: {0}")]
    Failed(String),

    #[error("automation surface disconnected")]
    Disconnected,
}

struct CompletionInner {
    done: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<ActionOutcome>>>,
}

/// 单次赋值的完成单元：第一次 `complete` 生效，其后全部忽略
#[derive(Clone)]
pub struct Completion {
    inner: Arc<CompletionInner>,
}

impl Completion {
    pub fn new() -> (Self, oneshot::Receiver<ActionOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                inner: Arc::new(CompletionInner {
                    done: AtomicBool::new(false),
                    tx: Mutex::new(Some(tx)),
                }),
            },
            rx,
        )
    }

    /// 返回本次调用是否真正完成了该单元
    pub fn complete(&self, outcome: ActionOutcome) -> bool {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return false;
        }
        let tx = self.inner.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
        true
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    /// 等待方已放弃（超时）；之后的完成回调不再生效
    pub(crate) fn abandon(&self) {
        if !self.inner.done.swap(true, Ordering::SeqCst) {
            self.inner.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").field("done", &self.is_done()).finish()
    }
}

/// 宿主自动化接口
pub trait AutomationSurface: Send + Sync {
    /// 接口当前是否可用（例如无障碍服务是否开启）
    fn is_available(&self) -> bool;

    fn find_node_by_text(&self, text: &str) -> Option<NodeHandle>;

    fn find_node_by_id(&self, id: &str) -> Option<NodeHandle>;

    fn click_node(&self, node: &NodeHandle) -> Result<bool, SurfaceError>;

    fn input_text(&self, node: &NodeHandle, text: &str) -> Result<bool, SurfaceError>;

    /// 提交手势；返回是否被接受。结束时宿主调用 `completion.complete(..)`
    fn dispatch_action(
        &self,
        spec: &ActionSpec,
        completion: Completion,
        timeout: Duration,
    ) -> Result<bool, SurfaceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completion_is_single_assignment() {
        let (completion, rx) = Completion::new();
        let other = completion.clone();
        assert!(completion.complete(ActionOutcome::Completed));
        assert!(!other.complete(ActionOutcome::Cancelled));
        assert_eq!(rx.await.unwrap(), ActionOutcome::Completed);
    }

    #[tokio::test]
    async fn test_abandoned_completion_ignores_late_callback() {
        let (completion, rx) = Completion::new();
        completion.abandon();
        assert!(!completion.complete(ActionOutcome::Completed));
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_action_spec_duration() {
        let spec = ActionSpec::Swipe {
            from: Point::new(0, 0),
            to: Point::new(0, 100),
            duration: Duration::from_millis(400),
        };
        assert_eq!(spec.kind(), "swipe");
        assert_eq!(spec.gesture_duration(), Duration::from_millis(400));
    }
}
