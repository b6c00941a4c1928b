use skewer_relay::{app, config::Config, logger};
use tracing::error;

#[tokio::main]
async fn main() {
    logger::init();
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(2);
        }
    };
    if let Err(err) = app::run(config).await {
        error!(error = %err, "relay failed");
        std::process::exit(1);
    }
}
