//! foampilot - CFD 仿真流程编排智能体
//!
//! 入口：初始化日志、加载配置、装配编排器，把命令行参数当作仿真请求，
//! 驱动一次完整会话并按终态设置退出码。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use foampilot::agent::AgentEvent;
use foampilot::config::load_config;
use foampilot::core::{create_orchestrator, SessionStatus, StaticApprover};
use foampilot::tools::{EchoTool, ToolRegistry};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 日志走 stderr，默认 info，可通过 RUST_LOG 覆盖；stdout 留给事件流
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let request = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if request.trim().is_empty() {
        anyhow::bail!("usage: foampilot <simulation request>");
    }

    let config_path = std::env::var("FOAMPILOT_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load config")?;
    cfg.validate().context("Invalid configuration")?;

    // 领域工具（read_file / run_command / search_tutorials 等）由宿主注册，
    // 这个最小驱动只带冒烟工具
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);

    // 事件流以 NDJSON 打到 stdout
    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<AgentEvent>();
    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            match serde_json::to_string(&ev) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!("Event serialization failed: {e}"),
            }
        }
    });

    tracing::info!("Approvals auto-granted (non-interactive driver)");
    let orchestrator = create_orchestrator(cfg, registry)
        .context("Failed to assemble orchestrator")?
        .with_approver(Arc::new(StaticApprover::allow_all()))
        .with_event_tx(event_tx);

    // Ctrl-C 触发协作式取消；循环在下一个挂起点退出
    let cancel = orchestrator.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Ctrl-C received, cancelling session");
            cancel.cancel();
        }
    });

    let state = orchestrator
        .run(&request)
        .await
        .context("Session run failed")?;
    drop(orchestrator); // 关闭事件发送端，打印任务随之退出
    let _ = printer.await;

    tracing::info!(
        "Session {} finished: {}",
        state.session_id,
        state.status.as_str()
    );
    if state.status != SessionStatus::Completed {
        let code = if state.status == SessionStatus::Aborted {
            130
        } else {
            1
        };
        std::process::exit(code);
    }
    Ok(())
}
