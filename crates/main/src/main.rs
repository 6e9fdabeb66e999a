//! 主应用程序入口
//!
//! 加载配置、组装协作者并启动 Axum 聊天中继服务。

use std::{sync::Arc, time::Duration};

use application::RelayService;
use config::RelayConfig;
use infrastructure::Infrastructure;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

/// 过期配额的清理周期
const QUOTA_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = RelayConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置加载完成");

    let infrastructure = Infrastructure::connect(&config).await?;
    let relay = Arc::new(RelayService::new(infrastructure.into_dependencies(&config)));
    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));

    tokio::spawn({
        let relay = relay.clone();
        async move {
            let mut ticker = tokio::time::interval(QUOTA_SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                relay.rate_limiter().cleanup_expired_quotas();
            }
        }
    });

    // 启动 Web 服务器
    let app = router(AppState::new(relay, jwt_service));
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("聊天中继启动在 http://{}", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("聊天中继已停止");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，开始关闭");
}
