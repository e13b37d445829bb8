#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use rtpmidi_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.sessions.is_empty() && config.store.is_none() {
        log::warn!(
            "No sessions are configured, it's just a program without any functionality :-)"
        );

        return Ok(());
    }

    let manager = rtpmidi_server::start_server(config).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("shutting down");

    manager.reset().await
}
