use anyhow::Context;
use tracing::{error, info};

use arena_harness::init_logger;
use arena_harness::prelude::*;

fn spawn_ctrl_c_watcher(signal: ShutdownSignal) -> anyhow::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Could not build the signal runtime")?;
    std::thread::Builder::new()
        .name("ctrl-c".into())
        .spawn(move || {
            runtime.block_on(async {
                match tokio::signal::ctrl_c().await {
                    Ok(()) => {
                        info!("interrupted, shutting down");
                        signal.request();
                    }
                    Err(e) => error!("could not listen for Ctrl-C: {e}"),
                }
            });
        })
        .context("Could not spawn the Ctrl-C watcher")?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // a missing .env file is fine, the environment may be set already
    let _ = dotenvy::dotenv();

    let config = Configuration::from_env().context("Invalid configuration")?;
    init_logger(config.logs_to_file(), config.log_level())?;

    let harness = Harness::new(config)?;
    spawn_ctrl_c_watcher(harness.shutdown_signal())?;

    let summary = harness.run()?;
    println!("{summary}");
    Ok(())
}
