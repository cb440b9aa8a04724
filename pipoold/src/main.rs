#![deny(unsafe_code)]

use pipool_api::Result;
use tracing::info;

mod automations;
mod bus;
mod config;
mod device;
mod hal;
mod pinger;
mod relay;
mod sensor;
mod store;
mod supervisor;
mod timer;
mod watchdog;

async fn run() -> Result<()> {
    // The log level lives in the configuration, so the config has to
    // load before the subscriber can exist. `None` means the process
    // shouldn't run (bad config, or `--print-config` already did its
    // job.)

    let Some(cfg) = config::get().await else {
        return Ok(());
    };

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(cfg.get_log_level())
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Unable to set global default subscriber");

    // First thing worth logging: which world the relays live in.

    info!(
        "pipoold starting -- {:?} hardware{}",
        cfg.hardware_mode(),
        if cfg.no_devices {
            ", relay switching inhibited"
        } else {
            ""
        }
    );

    supervisor::run(cfg).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("ERROR: {e:?}")
    }
}
