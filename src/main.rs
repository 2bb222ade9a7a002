use anyhow::{Context, Result};
use clap::Parser;

use feishu_relay::{
    config::Config,
    context::RelayContext,
    events::{init_logging, RelayEvent},
    webhook::webhook_router,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::parse();
    init_logging(&cfg)?;

    let (ctx, inbound_rx) = RelayContext::from_config(&cfg)?;
    tracing::info!(
        worker = %ctx.connection.url(),
        forward_via = ?cfg.forward_via,
        listen = %cfg.listen,
        "starting feishu relay"
    );

    ctx.connection.start();
    let router_task = tokio::spawn(ctx.router.clone().run(inbound_rx));
    let sweeper = ctx.filter.spawn_sweeper(cfg.dedup_sweep_interval());

    let app = webhook_router(
        ctx.router.clone(),
        ctx.connection.clone(),
        cfg.feishu_verification_token.clone(),
    );
    let listener = tokio::net::TcpListener::bind(cfg.listen)
        .await
        .with_context(|| format!("failed to bind webhook listener on {}", cfg.listen))?;
    let server = tokio::spawn(async move {
        if let Err(error) = axum::serve(listener, app).await {
            tracing::error!(error = %error, "webhook server error");
        }
    });
    ctx.events.emit(RelayEvent::Started {
        listen: cfg.listen.to_string(),
    });

    wait_for_shutdown().await?;

    tracing::info!("shutting down");
    ctx.connection.stop().await;
    server.abort();
    sweeper.abort();
    router_task.abort();
    ctx.events.emit(RelayEvent::Stopped);
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => tracing::info!("received SIGTERM"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
