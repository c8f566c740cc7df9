//! Drone - 远程调度的自动化执行代理
//!
//! 入口：初始化日志、加载配置、装配引擎并运行，收到关闭信号后按序清理。
//! 用法：`drone [config.toml]`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use drone::config::load_config;
use drone::core::{run_with_graceful_shutdown, ShutdownCoordinator, ShutdownManager};
use drone::dispatch::SimulatedSurface;
use drone::{observability, EngineBuilder};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(config_path).context("Failed to load config")?;
    tracing::info!(
        heartbeat_url = %config.server.heartbeat_url,
        profile = %config.behavior.profile,
        "Configuration loaded"
    );

    // 未接入真实宿主时使用模拟表面
    let engine = EngineBuilder::new(config)
        .with_surface(Arc::new(SimulatedSurface::new()))
        .build()
        .context("Failed to build engine")?;

    let manager = Arc::new(ShutdownManager::new());
    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&manager));
    coordinator.register_engine(&engine);

    engine.start();

    let app_manager = Arc::clone(&manager);
    run_with_graceful_shutdown(
        manager,
        async move { app_manager.wait_for_shutdown().await },
        || async move { coordinator.run_cleanup().await },
    )
    .await;

    Ok(())
}
