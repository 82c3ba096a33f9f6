//! SocialHub demo: a scripted feed session on the in-memory backend.
//!
//! Pass a JSON config file as the first argument to override the
//! defaults. Run with `RUST_LOG=info` (or `debug` for merge details).

mod scenario;

use log::info;
use socialhub_feed::FeedConfig;

use scenario::Scenario;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => {
            info!("Loading config from {path}");
            FeedConfig::load(&path)?
        }
        None => FeedConfig::default(),
    };

    info!("Starting SocialHub demo...");
    let scenario = Scenario::start(config).await?;
    scenario.run().await;
    info!("Demo finished");
    Ok(())
}
