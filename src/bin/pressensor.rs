use clap::Parser;
use log::{error, info, LevelFilter};
use pressensor_ble::{init_logging, run, Args};
use pressensor_ble::error::{AppRunError, ConfigError};

#[tokio::main]
async fn main() -> Result<(), AppRunError> {
    let args = Args::parse();
    init_logging(if args.verbose { LevelFilter::Debug } else { LevelFilter::Info });
    info!(concat!("Pressensor BLE ", env!("CARGO_PKG_VERSION")));

    match run(args).await {
        Err(AppRunError::ConfigError { source: ConfigError::CanNotLock { .. } }) => {
            error!("Another session is already running with this config file");
            Ok(())
        },
        Err(err) => {
            error!("Unexpected error: {}", err);
            Err(err)
        },
        Ok(_) => Ok(()),
    }
}
