//! 优先级任务队列
//!
//! 核心规则：
//! - 出队顺序：有效优先级降序，创建时间升序
//! - 按 ID 去重；已过期任务拒绝入队并记录 Expired 结果
//! - StopScript 入队时原子地移除所有待执行的 StartScript（停止意图总是胜出）
//! - 「最新意图优先」类型入队时替换同类型旧任务
//! - 延迟重试的任务留在队列内（未到期不出队），同样受停止抢占与同类替换约束
//! - 结果缓存有界，超出容量时淘汰 executed_at 最早的一条
//!
//! 心跳生产者、队列消费者与脚本结束回调并发访问，内部用一把 Mutex 保护，锁从不跨 await 持有。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;

use crate::core::{QueueStatus, TaskErrorCode};
use super::task::{Task, TaskId, TaskResult, TaskStatus, TaskType};

/// 默认结果缓存容量
pub const DEFAULT_RESULT_CAPACITY: usize = 100;

/// 排序键：(-有效优先级, 创建时间, 插入序号)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    neg_priority: i64,
    created_at: i64,
    seq: u64,
}

/// 等待重试的任务
struct Delayed {
    ready_at: Instant,
    task: Task,
}

#[derive(Default)]
struct QueueInner {
    entries: BTreeMap<QueueKey, Task>,
    index: HashMap<TaskId, QueueKey>,
    delayed: Vec<Delayed>,
    results: Vec<TaskResult>,
    seq: u64,
}

impl QueueInner {
    fn remove(&mut self, id: &str) -> Option<Task> {
        let key = self.index.remove(id)?;
        self.entries.remove(&key)
    }

    /// 同时移除就绪与延迟中的匹配任务
    fn remove_where(&mut self, pred: impl Fn(&Task) -> bool) -> Vec<Task> {
        let ids: Vec<TaskId> = self
            .entries
            .values()
            .filter(|t| pred(t))
            .map(|t| t.id.clone())
            .collect();
        let mut removed: Vec<Task> = ids.iter().filter_map(|id| self.remove(id)).collect();

        let (hit, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|d| pred(&d.task));
        self.delayed = keep;
        removed.extend(hit.into_iter().map(|d| d.task));
        removed
    }

    fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id) || self.delayed.iter().any(|d| d.task.id == id)
    }

    fn insert(&mut self, task: Task) {
        self.seq += 1;
        let key = QueueKey {
            neg_priority: -task.effective_priority(),
            created_at: task.created_at,
            seq: self.seq,
        };
        self.index.insert(task.id.clone(), key);
        self.entries.insert(key, task);
    }

    /// 把到期的延迟任务移入就绪队列
    fn promote_ready(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.delayed)
            .into_iter()
            .partition(|d| d.ready_at <= now);
        self.delayed = waiting;
        for delayed in ready {
            tracing::debug!(task_id = %delayed.task.id, "Retry delay elapsed, task ready");
            self.insert(delayed.task);
        }
    }

    fn pending(&self) -> impl Iterator<Item = &Task> {
        self.entries.values().chain(self.delayed.iter().map(|d| &d.task))
    }

    fn push_result(&mut self, result: TaskResult, capacity: usize) {
        self.results.retain(|r| r.task_id != result.task_id);
        self.results.push(result);
        while self.results.len() > capacity {
            let oldest = self
                .results
                .iter()
                .enumerate()
                .min_by_key(|(_, r)| r.executed_at)
                .map(|(i, _)| i);
            match oldest {
                Some(i) => {
                    let evicted = self.results.remove(i);
                    tracing::debug!(task_id = %evicted.task_id, "Result cache full, evicted oldest result");
                }
                None => break,
            }
        }
    }
}

/// 任务队列（线程安全）
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    result_capacity: usize,
}

impl TaskQueue {
    pub fn new(result_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            result_capacity: result_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 入队；返回是否被接受
    pub fn enqueue(&self, mut task: Task) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        let mut inner = self.lock();

        if task.is_expired(now) {
            tracing::info!(task_id = %task.id, task_type = task.task_type.as_str(), "Rejecting expired task");
            let result = TaskResult::for_task(&task, TaskStatus::Expired)
                .with_error(TaskErrorCode::Expired, "task expired before enqueue");
            inner.push_result(result, self.result_capacity);
            return false;
        }

        if inner.contains(&task.id) {
            tracing::debug!(task_id = %task.id, "Duplicate task id, ignoring");
            return false;
        }

        if task.task_type == TaskType::StopScript {
            let preempted = inner.remove_where(|t| t.task_type == TaskType::StartScript);
            for start in preempted {
                tracing::info!(task_id = %start.id, "Pending start preempted by stop");
                let result = TaskResult::for_task(&start, TaskStatus::Cancelled)
                    .with_error(TaskErrorCode::Cancelled, "preempted by stop");
                inner.push_result(result, self.result_capacity);
            }
        }

        if task.task_type.supersedes_same_type() {
            let task_type = task.task_type;
            let superseded = inner.remove_where(|t| t.task_type == task_type);
            for old in superseded {
                tracing::info!(task_id = %old.id, by = %task.id, "Pending task superseded");
                let result = TaskResult::for_task(&old, TaskStatus::Cancelled)
                    .with_error(TaskErrorCode::Cancelled, format!("superseded by {}", task.id));
                inner.push_result(result, self.result_capacity);
            }
        }

        task.status = TaskStatus::Pending;
        tracing::debug!(task_id = %task.id, task_type = task.task_type.as_str(), priority = task.effective_priority(), "Task enqueued");
        inner.insert(task);
        true
    }

    /// 出队最高优先级任务并标记为 Executing；沿途清理过期与已取消任务
    pub fn dequeue(&self) -> Option<Task> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut inner = self.lock();
        inner.promote_ready(Instant::now());

        while let Some((_, mut task)) = inner.entries.pop_first() {
            inner.index.remove(&task.id);

            if task.is_expired(now) {
                tracing::info!(task_id = %task.id, "Purging expired task");
                let result = TaskResult::for_task(&task, TaskStatus::Expired)
                    .with_error(TaskErrorCode::Expired, "task expired in queue");
                inner.push_result(result, self.result_capacity);
                continue;
            }

            if task.status == TaskStatus::Cancelled {
                let result = TaskResult::for_task(&task, TaskStatus::Cancelled)
                    .with_error(TaskErrorCode::Cancelled, "cancelled before execution");
                inner.push_result(result, self.result_capacity);
                continue;
            }

            task.status = TaskStatus::Executing;
            return Some(task);
        }
        None
    }

    /// 查看下一条将被出队的任务（不含未到期的延迟重试）
    pub fn peek(&self) -> Option<Task> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut inner = self.lock();
        inner.promote_ready(Instant::now());
        inner
            .entries
            .values()
            .find(|t| !t.is_expired(now) && t.status != TaskStatus::Cancelled)
            .cloned()
    }

    /// 重试：超过最大次数则记录 Failed 结果并返回 false；否则放回队列，`delay` 到期前不出队
    pub fn retry(&self, mut task: Task, delay: Duration) -> bool {
        task.retry_count += 1;
        if task.retry_count > task.max_retries {
            tracing::warn!(task_id = %task.id, retries = task.max_retries, "Task failed permanently");
            self.record_result(
                TaskResult::for_task(&task, TaskStatus::Failed)
                    .with_error(TaskErrorCode::MaxRetriesExceeded, "max retries exceeded"),
            );
            return false;
        }

        tracing::info!(task_id = %task.id, attempt = task.retry_count, delay_ms = delay.as_millis() as u64, "Retrying task");
        task.status = TaskStatus::Pending;
        if delay.is_zero() {
            return self.enqueue(task);
        }

        let mut inner = self.lock();
        if inner.contains(&task.id) {
            tracing::debug!(task_id = %task.id, "Task already pending, retry dropped");
            return false;
        }
        inner.delayed.push(Delayed {
            ready_at: Instant::now() + delay,
            task,
        });
        true
    }

    /// 记录任务结果；同一任务 ID 只保留一条
    /// 写入终态结果；非终态（Pending/Executing）不进入缓存
    pub fn record_result(&self, result: TaskResult) {
        if !result.status.is_terminal() {
            tracing::warn!(task_id = %result.task_id, status = ?result.status, "Ignoring non-terminal task result");
            return;
        }
        tracing::info!(
            task_id = %result.task_id,
            status = ?result.status,
            code = result.error_code.map(|c| c.as_str()).unwrap_or("-"),
            "Task finished"
        );
        self.lock().push_result(result, self.result_capacity);
    }

    /// 取出并清空所有缓存结果（每个心跳周期一次）
    pub fn drain_results(&self) -> Vec<TaskResult> {
        let mut results = std::mem::take(&mut self.lock().results);
        results.sort_by_key(|r| r.executed_at);
        results
    }

    /// 心跳发送失败时放回结果，尽力保证下次送达
    pub fn restore_results(&self, results: Vec<TaskResult>) {
        let mut inner = self.lock();
        for result in results {
            if inner.results.iter().any(|r| r.task_id == result.task_id) {
                continue;
            }
            inner.push_result(result, self.result_capacity);
        }
    }

    /// 将待执行任务标记为已取消（出队时丢弃）
    pub fn cancel(&self, id: &str) -> bool {
        let mut inner = self.lock();
        let task = match inner.index.get(id).copied() {
            Some(key) => inner.entries.get_mut(&key),
            None => inner
                .delayed
                .iter_mut()
                .map(|d| &mut d.task)
                .find(|t| t.id == id),
        };
        match task {
            Some(task) if task.status != TaskStatus::Cancelled => {
                task.status = TaskStatus::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// 移除指定类型的全部待执行任务
    pub fn clear_by_type(&self, task_type: TaskType) -> usize {
        self.lock().remove_where(|t| t.task_type == task_type).len()
    }

    /// 清空待执行任务（不影响结果缓存）
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let n = inner.entries.len() + inner.delayed.len();
        inner.entries.clear();
        inner.index.clear();
        inner.delayed.clear();
        n
    }

    pub fn get(&self, id: &str) -> Option<Task> {
        self.lock().pending().find(|t| t.id == id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    /// 待执行任务数（含延迟重试中的任务）
    pub fn len(&self) -> usize {
        let inner = self.lock();
        inner.entries.len() + inner.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn result_count(&self) -> usize {
        self.lock().results.len()
    }

    pub fn status(&self) -> QueueStatus {
        let inner = self.lock();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for task in inner.pending() {
            *by_type.entry(task.task_type.as_str().to_string()).or_default() += 1;
        }
        QueueStatus {
            pending: inner.entries.len() + inner.delayed.len(),
            by_type,
            cached_results: inner.results.len(),
        }
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_CAPACITY)
    }
}
