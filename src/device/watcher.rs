use std::sync::Arc;
use futures::channel::mpsc::Sender;
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

use crate::device::constants::SCAN_RESTART_DELAY;
use crate::device::transport::BleTransport;
use crate::device::types::{Advertisement, ConnectionState, DeviceIdentity};
use crate::error::DeviceError;

/**
 * Scan for advertisements of `identity` for as long as `cancel` is not cancelled, and signal the
 * connection manager that the device is reachable. Nothing is signalled while the manager is
 * connecting or connected, or while a previous signal is still pending.
 */
pub fn watch_advertisements<T: BleTransport>(
    cancel: CancellationToken,
    transport: Arc<T>,
    identity: DeviceIdentity,
    state: watch::Receiver<ConnectionState>,
    mut reachable: Sender<Advertisement>,
) -> JoinHandle<()> {
    spawn(async move {
        let mut retry = false;

        'mainloop: loop {
            if retry {
                tokio::select! {
                    _ = cancel.cancelled() => break 'mainloop,
                    _ = sleep(Duration::from_millis(SCAN_RESTART_DELAY)) => {},
                }
            }
            retry = true;

            let mut advertisements = match transport.advertisements().await {
                Ok(stream) => stream,
                Err(err) => {
                    warn!("Scanning failed {:?}", err);
                    continue;
                },
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    advertisement = advertisements.next() => {
                        let Some(advertisement) = advertisement else {
                            info!("Advertisement scan ended; restarting");
                            break;
                        };

                        if !identity.matches(&advertisement) {
                            continue;
                        }

                        let current_state = *state.borrow();
                        if current_state.is_busy() {
                            continue;
                        }

                        match reachable.try_send(advertisement) {
                            Ok(()) => debug!("{} is reachable", identity.address()),
                            Err(err) if err.is_disconnected() => {
                                debug!("Connection manager is gone; stopping watcher");
                                break 'mainloop;
                            },
                            // a previous signal is still pending
                            Err(_) => {},
                        }
                    },
                }
            }
        }
    })
}

/// Scan until the first Pressensor advertises, for at most `deadline`.
pub async fn discover_first<T: BleTransport>(transport: &T, deadline: Duration) -> Result<Option<DeviceIdentity>, DeviceError> {
    let mut advertisements = transport.advertisements().await?;

    let found = timeout(deadline, async {
        while let Some(advertisement) = advertisements.next().await {
            if let Some(identity) = DeviceIdentity::from_advertisement(&advertisement) {
                info!(
                    "Found {} {} rssi {:?}",
                    identity.address(),
                    identity.name().unwrap_or("NONE"),
                    advertisement.rssi,
                );
                return Some(identity);
            }
        }
        None
    }).await;

    Ok(found.unwrap_or(None))
}
