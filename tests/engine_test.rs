//! 引擎集成测试：心跳命令 → 队列 → 脚本监管 → 结果回传

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drone::behavior::FixedClock;
use drone::config::AppConfig;
use drone::core::{RunStatus, ShutdownCoordinator, ShutdownManager, TaskErrorCode};
use drone::dispatch::SimulatedSurface;
use drone::queue::{TaskResult, TaskStatus};
use drone::remote::{Command, HeartbeatRequest, HeartbeatResponse, HeartbeatTransport, TransportError};
use drone::script::SCROLL_READ;
use drone::{Engine, EngineBuilder};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// 按顺序返回预设响应，用完后一律返回空的成功响应；记录全部请求
#[derive(Default)]
struct ScriptedTransport {
    responses: Mutex<VecDeque<Result<HeartbeatResponse, TransportError>>>,
    sent: Mutex<Vec<HeartbeatRequest>>,
}

impl ScriptedTransport {
    fn push_commands(&self, commands: Vec<Command>) {
        self.responses.lock().unwrap().push_back(Ok(HeartbeatResponse {
            success: true,
            commands: commands
                .iter()
                .map(|c| serde_json::to_value(c).unwrap())
                .collect(),
            ..Default::default()
        }));
    }

    fn push_failure(&self) {
        self.responses.lock().unwrap().push_back(Err(TransportError::Status {
            status: 503,
            body: "unavailable".into(),
        }));
    }

    fn last_results(&self) -> Vec<TaskResult> {
        self.sent
            .lock()
            .unwrap()
            .last()
            .map(|r| r.task_results.clone())
            .unwrap_or_default()
    }

    fn last_request(&self) -> HeartbeatRequest {
        self.sent.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait::async_trait]
impl HeartbeatTransport for ScriptedTransport {
    async fn send(&self, request: &HeartbeatRequest) -> Result<HeartbeatResponse, TransportError> {
        self.sent.lock().unwrap().push(request.clone());
        self.responses.lock().unwrap().pop_front().unwrap_or_else(|| {
            Ok(HeartbeatResponse {
                success: true,
                ..Default::default()
            })
        })
    }
}

fn command(id: &str, command_type: &str, params: &[(&str, Value)]) -> Command {
    Command {
        id: id.to_string(),
        command_type: command_type.to_string(),
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<HashMap<_, _>>(),
        expiration: None,
        priority: 0,
    }
}

fn start_command(id: &str) -> Command {
    command(id, "start_script", &[("script", Value::from(SCROLL_READ))])
}

fn engine(transport: Arc<ScriptedTransport>) -> Arc<Engine> {
    let mut config = AppConfig::default();
    config.script.scroll_read_rounds = 0;
    config.script.tick_interval_ms = 50;
    config.queue.poll_interval_ms = 100;
    EngineBuilder::new(config)
        .with_surface(Arc::new(SimulatedSurface::new()))
        .with_transport(transport)
        .with_clock(Arc::new(FixedClock::new(12)))
        .with_seed(42)
        .build()
        .unwrap()
}

fn find<'a>(results: &'a [TaskResult], id: &str) -> &'a TaskResult {
    results
        .iter()
        .find(|r| r.task_id == id)
        .unwrap_or_else(|| panic!("no result for {id}"))
}

#[tokio::test(start_paused = true)]
async fn test_remote_start_then_stop_reports_both_results() {
    let transport = Arc::new(ScriptedTransport::default());
    let engine = engine(transport.clone());
    let cancel = CancellationToken::new();

    transport.push_commands(vec![start_command("c1")]);
    assert_eq!(engine.channel().heartbeat_once().await.unwrap(), 1);
    engine.drain_queue(&cancel).await;
    assert_eq!(engine.supervisor().current().as_deref(), Some(SCROLL_READ));

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(engine.supervisor().is_running());

    transport.push_commands(vec![command("c2", "stop_script", &[])]);
    engine.channel().heartbeat_once().await.unwrap();
    // 脚本仍在运行，启动任务的结果尚未写入
    assert!(transport.last_results().is_empty());
    assert_eq!(transport.last_request().script.status, RunStatus::Running);

    engine.drain_queue(&cancel).await;
    assert!(!engine.supervisor().is_running());

    engine.channel().heartbeat_once().await.unwrap();
    let results = transport.last_results();
    assert_eq!(results.len(), 2);
    assert_eq!(find(&results, "task_c1").status, TaskStatus::Completed);
    let stop = find(&results, "task_c2");
    assert_eq!(stop.status, TaskStatus::Completed);
    assert_eq!(stop.data.as_ref().unwrap()["stopped"], Value::from(SCROLL_READ));
    assert_eq!(transport.last_request().script.status, RunStatus::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_stop_preempts_pending_start() {
    let transport = Arc::new(ScriptedTransport::default());
    let engine = engine(transport.clone());
    let cancel = CancellationToken::new();

    transport.push_commands(vec![start_command("c1"), command("c2", "stop_script", &[])]);
    assert_eq!(engine.channel().heartbeat_once().await.unwrap(), 2);
    assert_eq!(engine.queue().len(), 1);
    engine.drain_queue(&cancel).await;

    let results = engine.queue().drain_results();
    assert_eq!(results.len(), 2);
    let start = find(&results, "task_c1");
    assert_eq!(start.status, TaskStatus::Cancelled);
    assert_eq!(start.error_code, Some(TaskErrorCode::Cancelled));
    assert_eq!(find(&results, "task_c2").status, TaskStatus::Completed);
    assert!(!engine.supervisor().is_running());
}

#[tokio::test(start_paused = true)]
async fn test_start_after_stop_in_same_batch_still_runs() {
    let transport = Arc::new(ScriptedTransport::default());
    let engine = engine(transport.clone());
    let cancel = CancellationToken::new();

    transport.push_commands(vec![command("c1", "stop_script", &[]), start_command("c2")]);
    assert_eq!(engine.channel().heartbeat_once().await.unwrap(), 2);
    engine.drain_queue(&cancel).await;

    // 停止优先级更高先执行（当时无脚本），随后启动生效
    let results = engine.queue().drain_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].task_id, "task_c1");
    assert_eq!(results[0].data.as_ref().unwrap()["stopped"], Value::Null);
    assert!(engine.supervisor().is_running());

    engine.stop_script().await;
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_command_is_not_executed_twice() {
    let transport = Arc::new(ScriptedTransport::default());
    let engine = engine(transport.clone());

    transport.push_commands(vec![command("c1", "pause_script", &[])]);
    transport.push_commands(vec![command("c1", "pause_script", &[])]);
    assert_eq!(engine.channel().heartbeat_once().await.unwrap(), 1);
    assert_eq!(engine.channel().heartbeat_once().await.unwrap(), 0);
    assert_eq!(engine.queue().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_results_survive_failed_heartbeat() {
    let transport = Arc::new(ScriptedTransport::default());
    let engine = engine(transport.clone());

    transport.push_commands(vec![command("c1", "reboot_device", &[])]);
    transport.push_failure();
    engine.channel().heartbeat_once().await.unwrap();
    assert!(engine.channel().heartbeat_once().await.is_err());
    assert_eq!(engine.channel().consecutive_failures(), 1);
    assert_eq!(engine.status().last_error.unwrap().code, "HEARTBEAT_FAILED");

    engine.channel().heartbeat_once().await.unwrap();
    let results = transport.last_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].error_code, Some(TaskErrorCode::UnsupportedType));
    assert_eq!(engine.channel().consecutive_failures(), 0);

    engine.channel().heartbeat_once().await.unwrap();
    assert!(transport.last_results().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_background_loops_and_graceful_shutdown() {
    let transport = Arc::new(ScriptedTransport::default());
    let engine = engine(transport.clone());
    transport.push_commands(vec![start_command("c1")]);

    engine.start();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(engine.status().running);
    assert_eq!(engine.status().current_script.as_deref(), Some(SCROLL_READ));

    let mut coordinator = ShutdownCoordinator::new(Arc::new(ShutdownManager::new()));
    coordinator.register_engine(&engine);
    assert_eq!(coordinator.len(), 3);
    coordinator.run_cleanup().await;

    assert!(!engine.status().running);
    assert!(!engine.supervisor().is_running());

    // 最后一次心跳带上脚本结束时写入的启动结果
    let last = transport.last_request();
    assert_eq!(last.script.status, RunStatus::Stopped);
    assert_eq!(find(&last.task_results, "task_c1").status, TaskStatus::Completed);
}
