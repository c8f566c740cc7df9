//! 脚本上下文：拟人化动作入口
//!
//! 每个原子动作的流程：风控闸门 → 思考/犹豫停顿 → （可能）误触 → 真实动作 → 记录结果 → 动作间隔。
//! 脚本只通过这里操作界面，从而保证所有动作都受行为策略约束、经串行器分发。

use std::sync::Arc;
use std::time::Duration;

use crate::behavior::{BehaviorPolicy, Point};
use crate::core::ScriptError;
use crate::dispatch::{ActionDispatcher, ActionSpec, NodeHandle};

#[derive(Clone)]
pub struct ScriptContext {
    dispatcher: Arc<ActionDispatcher>,
    policy: Arc<BehaviorPolicy>,
}

impl ScriptContext {
    pub fn new(dispatcher: Arc<ActionDispatcher>, policy: Arc<BehaviorPolicy>) -> Self {
        Self { dispatcher, policy }
    }

    pub fn policy(&self) -> &Arc<BehaviorPolicy> {
        &self.policy
    }

    pub fn dispatcher(&self) -> &Arc<ActionDispatcher> {
        &self.dispatcher
    }

    async fn gate(&self) -> Result<(), ScriptError> {
        self.policy
            .before_action()
            .await
            .map(|_| ())
            .map_err(|r| ScriptError::Rejected(r.to_string()))
    }

    /// 记录动作结果并等待动作间隔
    async fn settle(&self, ok: bool, what: &str) -> Result<(), ScriptError> {
        if ok {
            self.policy.record_success();
        } else {
            let count = self.policy.record_failure();
            tracing::warn!(action = what, consecutive_errors = count, "Action failed");
        }
        tokio::time::sleep(self.policy.action_interval()).await;
        if ok {
            Ok(())
        } else {
            Err(ScriptError::ActionFailed(what.to_string()))
        }
    }

    pub async fn tap(&self, x: i32, y: i32) -> Result<(), ScriptError> {
        self.gate().await?;
        let plan = self.policy.plan_tap(x, y);
        if let Some(miss) = plan.mis_tap {
            tracing::debug!(x = miss.x, y = miss.y, "Deliberate near-miss tap");
            self.dispatcher
                .execute_default(ActionSpec::Tap {
                    at: miss,
                    press: plan.press,
                })
                .await;
            tokio::time::sleep(self.policy.action_interval() / 2).await;
        }
        let ok = self
            .dispatcher
            .execute_default(ActionSpec::Tap {
                at: plan.target,
                press: plan.press,
            })
            .await;
        self.settle(ok, "tap").await
    }

    pub async fn swipe(&self, from: Point, to: Point) -> Result<(), ScriptError> {
        self.gate().await?;
        let plan = self.policy.plan_swipe(from, to);
        let limit = self.dispatcher.default_timeout() + plan.duration;
        let ok = self
            .dispatcher
            .execute(
                ActionSpec::Swipe {
                    from: plan.from,
                    to: plan.to,
                    duration: plan.duration,
                },
                limit,
            )
            .await;
        self.settle(ok, "swipe").await
    }

    pub async fn long_press(&self, x: i32, y: i32, duration: Duration) -> Result<(), ScriptError> {
        self.gate().await?;
        let at = self.policy.jitter(Point::new(x, y), self.policy.profile().tap_offset_px);
        let limit = self.dispatcher.default_timeout() + duration;
        let ok = self
            .dispatcher
            .execute(ActionSpec::LongPress { at, duration }, limit)
            .await;
        self.settle(ok, "long_press").await
    }

    async fn click(&self, node: Option<NodeHandle>, query: &str) -> Result<(), ScriptError> {
        let node = node.ok_or_else(|| ScriptError::NodeNotFound(query.to_string()))?;
        self.gate().await?;
        let ok = self.dispatcher.click_node(&node).await;
        self.settle(ok, "click").await
    }

    pub async fn click_text(&self, text: &str) -> Result<(), ScriptError> {
        self.click(self.dispatcher.find_by_text(text), text).await
    }

    pub async fn click_id(&self, id: &str) -> Result<(), ScriptError> {
        self.click(self.dispatcher.find_by_id(id), id).await
    }

    /// 在指定 ID 的输入框中输入文本
    pub async fn input_text(&self, id: &str, text: &str) -> Result<(), ScriptError> {
        let node = self
            .dispatcher
            .find_by_id(id)
            .ok_or_else(|| ScriptError::NodeNotFound(id.to_string()))?;
        self.gate().await?;
        let ok = self.dispatcher.input_text(&node, text).await;
        self.settle(ok, "input_text").await
    }

    pub fn exists(&self, text: &str) -> bool {
        self.dispatcher.find_by_text(text).is_some()
    }

    /// 按阅读速度模型停顿
    pub async fn read_pause(&self, chars: usize) {
        let delay = self.policy.reading_delay(chars);
        tracing::debug!(chars, ms = delay.as_millis() as u64, "Reading pause");
        tokio::time::sleep(delay).await;
    }
}
