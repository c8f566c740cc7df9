//! 动作分发串行器
//!
//! 模拟单一物理输入设备：全局一把 FIFO 公平的互斥闸门，同一时刻至多一个手势在途。
//! 每次调用恰好产出一个成功/失败结果；超时后释放闸门，迟到的完成回调被忽略。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::surface::{ActionOutcome, ActionSpec, AutomationSurface, Completion, NodeHandle};

/// 分发统计
#[derive(Debug, Default)]
struct DispatchCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

/// 分发统计快照，随状态上报
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchStats {
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
}

pub struct ActionDispatcher {
    surface: Arc<dyn AutomationSurface>,
    gate: Mutex<()>,
    default_timeout: Duration,
    counters: DispatchCounters,
}

impl ActionDispatcher {
    pub fn new(surface: Arc<dyn AutomationSurface>, default_timeout: Duration) -> Self {
        Self {
            surface,
            gate: Mutex::new(()),
            default_timeout,
            counters: DispatchCounters::default(),
        }
    }

    pub fn surface(&self) -> &Arc<dyn AutomationSurface> {
        &self.surface
    }

    pub fn surface_available(&self) -> bool {
        self.surface.is_available()
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn count(&self, ok: bool) -> bool {
        if ok {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// 执行手势；接口不可用时不获取闸门直接失败
    pub async fn execute(&self, spec: ActionSpec, limit: Duration) -> bool {
        if !self.surface.is_available() {
            tracing::warn!(action = spec.kind(), "Automation surface unavailable, action skipped");
            return self.count(false);
        }

        let _gate = self.gate.lock().await;
        let start = Instant::now();
        let (completion, rx) = Completion::new();

        match self.surface.dispatch_action(&spec, completion.clone(), limit) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(action = spec.kind(), "Action rejected by surface");
                return self.count(false);
            }
            Err(e) => {
                tracing::warn!(action = spec.kind(), error = %e, "Action dispatch failed");
                completion.abandon();
                return self.count(false);
            }
        }

        let ok = match timeout(limit, rx).await {
            Ok(Ok(ActionOutcome::Completed)) => true,
            Ok(Ok(ActionOutcome::Cancelled)) => {
                tracing::debug!(action = spec.kind(), "Action cancelled by surface");
                false
            }
            Ok(Err(_)) => {
                tracing::warn!(action = spec.kind(), "Surface dropped completion without result");
                false
            }
            Err(_) => {
                completion.abandon();
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(action = spec.kind(), timeout_ms = limit.as_millis() as u64, "Action timed out");
                false
            }
        };
        tracing::debug!(action = spec.kind(), ok, elapsed_ms = start.elapsed().as_millis() as u64, "Action finished");
        self.count(ok)
    }

    pub async fn execute_default(&self, spec: ActionSpec) -> bool {
        self.execute(spec, self.default_timeout).await
    }

    pub fn find_by_text(&self, text: &str) -> Option<NodeHandle> {
        self.surface.find_node_by_text(text)
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeHandle> {
        self.surface.find_node_by_id(id)
    }

    /// 节点点击同样是物理动作，走同一闸门
    pub async fn click_node(&self, node: &NodeHandle) -> bool {
        if !self.surface.is_available() {
            return self.count(false);
        }
        let _gate = self.gate.lock().await;
        let ok = match self.surface.click_node(node) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(node = %node.0, error = %e, "Node click failed");
                false
            }
        };
        self.count(ok)
    }

    pub async fn input_text(&self, node: &NodeHandle, text: &str) -> bool {
        if !self.surface.is_available() {
            return self.count(false);
        }
        let _gate = self.gate.lock().await;
        let ok = match self.surface.input_text(node, text) {
            Ok(ok) => ok,
            Err(e) => {
                tracing::warn!(node = %node.0, error = %e, "Text input failed");
                false
            }
        };
        self.count(ok)
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }
}
