use tracing::error;
use tracing_subscriber::EnvFilter;

use home_relay::config::Config;
use home_relay::error::RelayError;
use home_relay::AppState;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let state = match AppState::init(config).await {
        Ok(state) => state,
        Err(e) => {
            error!("startup failed: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = home_relay::serve(state).await {
        error!("{}", e);
        match e {
            RelayError::Bind(_) => std::process::exit(2),
            _ => std::process::exit(1),
        }
    }
}
