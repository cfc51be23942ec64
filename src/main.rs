//! Hornet - Rust 自主任务执行引擎
//!
//! 入口：初始化日志、装配编排器并驱动一条任务到结束。
//! 用法：
//!   hornet <mission goal...>       启动新任务
//!   hornet --resume [session_id]   恢复被中断的会话（缺省恢复最近一个）
//!   hornet --cleanup               清理超龄的终结会话

use std::sync::Arc;

use anyhow::Context;
use hornet::actions::LocalActionExecutor;
use hornet::config::load_config;
use hornet::core::{MissionOrchestrator, RecoveryCoordinator};
use hornet::llm::create_llm_from_config;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志：默认 info，可通过 RUST_LOG 覆盖
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer())
        .init();

    let cfg = load_config(None).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        hornet::config::AppConfig::default()
    });

    let sessions_dir = cfg
        .app
        .sessions_dir
        .clone()
        .unwrap_or_else(|| "sessions".into());
    let workspace = cfg
        .actions
        .workspace_root
        .clone()
        .unwrap_or_else(|| "workspace".into());
    std::fs::create_dir_all(&workspace).ok();

    let llm = create_llm_from_config(&cfg.llm);
    let executor = Arc::new(LocalActionExecutor::new(
        &workspace,
        cfg.actions.allowed_commands.clone(),
    ));

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("--cleanup") => {
            let coordinator = RecoveryCoordinator::new(&sessions_dir);
            let deleted = coordinator.cleanup_old_sessions(cfg.recovery.retention_days)?;
            println!("Deleted {} old session(s)", deleted);
            Ok(())
        }
        Some("--resume") => {
            let coordinator = RecoveryCoordinator::new(&sessions_dir);
            let session_id = match args.get(1) {
                Some(id) => id.clone(),
                None => coordinator
                    .find_interrupted_sessions()
                    .into_iter()
                    .next_back()
                    .context("No interrupted session to resume")?,
            };
            let state = coordinator.recover(&session_id)?;
            let mut orchestrator =
                MissionOrchestrator::from_recovered(&cfg, state, llm, executor);
            let report = orchestrator.resume().await?;
            println!("{}", report.summary);
            println!("{}", report.budget_summary);
            Ok(())
        }
        Some(_) => {
            let goal = args.join(" ");
            let mut orchestrator = MissionOrchestrator::new(&cfg, llm, executor);
            tracing::info!(session = %orchestrator.session_id(), "new mission session");
            let report = orchestrator.run_mission(&goal, None).await?;
            println!("{}", report.summary);
            println!("{}", report.budget_summary);
            Ok(())
        }
        None => {
            eprintln!("Usage: hornet <mission goal...> | --resume [session_id] | --cleanup");
            std::process::exit(2);
        }
    }
}
