pub mod config;
pub mod error;
pub mod gateway;
pub mod grok;
pub mod stats;
pub mod token;
pub mod util;

use anyhow::Context;
use axum::routing::{get, post};
use axum::{Router, middleware};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing();

    let store = Arc::new(token::FileTokenStore::new(&cfg.data_dir));
    let usage = Arc::new(grok::usage::UsageService::new(&cfg).context("初始化 UsageService 失败")?);
    let manager = Arc::new(token::TokenManager::new(cfg.clone(), store, usage));

    // 启动加载失败不阻塞服务：空池照常起服务，后续 reload 再补。
    if let Err(e) = manager.reload().await {
        tracing::warn!("启动加载 token 池失败: {e:#}");
    }
    spawn_reload_task(manager.clone(), cfg.token_reload_ttl_secs);

    let upstream = Arc::new(grok::client::GrokClient::new(&cfg).context("初始化 GrokClient 失败")?);
    let chat = gateway::chat::ChatService::new(
        cfg.clone(),
        manager,
        upstream,
        Arc::new(stats::RequestStats::new()),
    );
    let state = Arc::new(gateway::openai::handler::AppState {
        cfg: cfg.clone(),
        chat,
    });

    let public_routes = Router::new().route("/health", get(handle_health));

    let api_routes = Router::new()
        .route(
            "/v1/models",
            get(gateway::openai::handler::handle_list_models),
        )
        .route(
            "/v1/chat/completions",
            post(gateway::openai::handler::handle_chat_completions),
        )
        // 兼容带尾随斜杠的同一路径
        .route(
            "/v1/chat/completions/",
            post(gateway::openai::handler::handle_chat_completions),
        )
        .route("/stats", get(gateway::openai::handler::handle_stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            gateway::auth::api_auth_middleware,
        ))
        .with_state(state);

    let app = Router::new().merge(public_routes).merge(api_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出")?;

    Ok(())
}

async fn handle_health() -> &'static str {
    "ok"
}

/// 后台定期刷新 token 池，配合请求路径上的按需 reload。
fn spawn_reload_task(manager: Arc<token::TokenManager>, interval_secs: u64) {
    if interval_secs == 0 {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
        interval.tick().await;
        loop {
            interval.tick().await;
            manager.reload_if_stale().await;
        }
    });
}

fn init_tracing() {
    // 依赖库日志压到 warn，本项目自身日志保持 info 起步。
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new("warn,grok2api=info")
    } else if env.contains("grok2api") {
        EnvFilter::new(env)
    } else {
        EnvFilter::new(format!("{env},grok2api=info"))
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
