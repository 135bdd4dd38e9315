use gai_stream::handlers::router;
use gai_stream::init::app_init;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting event stream server...");
    let (config, state) = app_init().await?;
    log::info!("✅ Application state initialized");
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    log::info!("");
    log::info!("🎉 Server started!");
    log::info!("📍 http://{}", addr);
    log::info!("📡 Stream: http://{}/v1/generate/stream", addr);
    log::info!("📡 NDJSON: http://{}/v1/generate/stream/ndjson", addr);
    log::info!("🔁 Passthrough: http://{}/v1/chat/completions", addr);
    log::info!("❤️  Health: http://{}/health", addr);
    log::info!("");
    log::info!(
        "💓 Heartbeat every {:?}, NDJSON flush every {:?}",
        config.stream.sse.heartbeat_interval,
        config.stream.ndjson.flush_interval
    );
    log::info!("");

    axum::serve(listener, app).await?;

    Ok(())
}
