//! Demo bot binary. Configuration comes from the environment (and `.env`).

use hello_gateway::bot::{self, Credentials};
use hello_gateway::config::BotConfig;
use tracing::error;

#[tokio::main]
async fn main() {
    // Respects RUST_LOG, defaults to info.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match BotConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(1);
        }
    };

    let credentials = match (std::env::var("BOT_USERNAME"), std::env::var("BOT_PASSWORD")) {
        (Ok(username), Ok(password)) if config.token.is_none() => Some(Credentials { username, password }),
        _ => None,
    };

    if config.token.is_none() && credentials.is_none() {
        error!("set BOT_TOKEN, or BOT_USERNAME and BOT_PASSWORD");
        std::process::exit(1);
    }

    if let Err(e) = bot::run(config, credentials).await {
        error!(error = %e, "bot stopped");
        std::process::exit(1);
    }
}
