use anyhow::Result;
use chat_server::{auth, config};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let cfg = config::Config::load(&cli)?;
    let level = if cfg.logging_enabled { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    if let Some(user_id) = cli.issue_token {
        let secret = auth::resolve_secret(cfg.jwt_secret.as_deref(), &cfg.data_dir)?;
        let token = auth::issue_jwt(&secret, user_id, &cli.name, time::Duration::days(30))?;
        println!("{token}");
        return Ok(());
    }
    chat_server::run(cfg).await
}
