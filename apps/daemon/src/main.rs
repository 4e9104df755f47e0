use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional; real environment variables take precedence
    dotenvy::dotenv().ok();

    // Keep the guard alive for the entire program - dropping it stops file logging
    let _log_guard = mcpbridge_daemon::init_tracing()?;

    let config = mcpbridge_daemon::load_config()?;
    mcpbridge_daemon::run(config).await
}
