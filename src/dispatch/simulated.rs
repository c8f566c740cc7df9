//! 无界面模拟接口
//!
//! 在没有真实宿主时使用（本地运行、集成测试）：手势按其时长异步完成，节点表可预置，
//! 所有动作被记录下来供检查。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::surface::{
    ActionOutcome, ActionSpec, AutomationSurface, Completion, NodeHandle, SurfaceError,
};

#[derive(Default)]
pub struct SimulatedSurface {
    available: AtomicBool,
    nodes: Mutex<HashMap<String, NodeHandle>>,
    actions: Mutex<Vec<ActionSpec>>,
    clicks: Mutex<Vec<NodeHandle>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl SimulatedSurface {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// 预置一个可通过文本或 ID 查找到的节点
    pub fn add_node(&self, key: &str) {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), NodeHandle(format!("node:{key}")));
    }

    pub fn actions(&self) -> Vec<ActionSpec> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clicks(&self) -> Vec<NodeHandle> {
        self.clicks.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn lookup(&self, key: &str) -> Option<NodeHandle> {
        self.nodes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

impl AutomationSurface for SimulatedSurface {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn find_node_by_text(&self, text: &str) -> Option<NodeHandle> {
        self.lookup(text)
    }

    fn find_node_by_id(&self, id: &str) -> Option<NodeHandle> {
        self.lookup(id)
    }

    fn click_node(&self, node: &NodeHandle) -> Result<bool, SurfaceError> {
        self.clicks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(node.clone());
        Ok(true)
    }

    fn input_text(&self, node: &NodeHandle, text: &str) -> Result<bool, SurfaceError> {
        tracing::debug!(node = %node.0, chars = text.chars().count(), "Simulated text input");
        Ok(true)
    }

    fn dispatch_action(
        &self,
        spec: &ActionSpec,
        completion: Completion,
        _timeout: Duration,
    ) -> Result<bool, SurfaceError> {
        if !self.is_available() {
            return Ok(false);
        }
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(spec.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let in_flight = Arc::clone(&self.in_flight);
        let duration = spec.gesture_duration();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            completion.complete(ActionOutcome::Completed);
        });
        Ok(true)
    }
}
