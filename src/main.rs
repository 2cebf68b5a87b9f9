mod config;
mod engine;
mod state;
mod store;
mod supervisor;
mod tasks;
mod web;

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;
use config::{AppConfig, StreamRegistry};
use engine::Engine;
use state::AppState;
use std::path::{Path, PathBuf};
use store::StateStore;
use tracing::{error, info};
use tracing_subscriber::{
    filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

/// VTX Capture - Live Stream Capture Supervisor
/// 监督外部采集进程：接收上线通知、定时轮询、崩溃后从持久化状态恢复
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "vtx-capture.yaml")]
    config: PathBuf,

    /// 存在持久化状态时恢复上次的会话
    #[arg(long)]
    resume: bool,

    /// 额外把 ERROR 级别日志写入该文件
    #[arg(long)]
    error_log: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 解析命令行参数并初始化日志系统
    let args = Args::parse();
    init_logging(args.error_log.as_deref())?;

    // 加载配置文件和流注册表
    let config = AppConfig::load(&args.config)?;
    let registry = StreamRegistry::build(&config)?;
    for dir in [
        &config.paths.download_dir,
        &config.paths.completed_dir,
        &config.paths.log_dir,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    info!(
        "VTX Capture initialized. Downloads: {:?}, completed: {:?}",
        config.paths.download_dir, config.paths.completed_dir
    );

    // 读取持久化状态
    let store = StateStore::from_config(&config.state);
    let persisted = store.load().await.context("could not load state")?;
    if !persisted.is_empty() && !args.resume {
        anyhow::bail!(
            "state contains {} unfinished sessions but --resume was not given",
            persisted.len()
        );
    }

    // 初始化全局状态并恢复未完成的会话
    let state = AppState::new(&args.config, config.clone(), registry, store);
    *state.streams.lock().unwrap() = persisted;
    Engine::resume_sessions(&state);

    // 注册HTTP路由
    let app = Router::new()
        .route("/online/:stream", post(web::admin::online_handler)) // 上线通知
        .route("/state", get(web::admin::state_handler)) // 会话状态
        .route("/ext-streamlist", get(web::admin::ext_streamlist_handler)) // 外部流列表
        .route("/reload", post(web::admin::reload_handler)) // 重新加载配置
        .with_state(state.clone());

    info!("Listening on {}", config.server.listen);
    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    state.tasks.spawn("http", async move {
        axum::serve(listener, app).await.map_err(anyhow::Error::from)
    });

    // 启动轮询任务
    if config.poll.enabled {
        supervisor::spawn_poll_tasks(&state, config.poll.interval_sec);
    }

    // 回收所有任务，包括运行期间新加入的
    tokio::select! {
        _ = state.tasks.drain() => info!("All tasks finished"),
        _ = shutdown_signal() => info!("Shutting down. Capture processes keep running."),
    }

    Ok(())
}

fn init_logging(error_log: Option<&Path>) -> anyhow::Result<()> {
    let console = fmt::layer().with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    let error_file = match error_log {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open error log {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(LevelFilter::ERROR),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(error_file)
        .init();
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
