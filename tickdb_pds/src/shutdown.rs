//! Ties the store into the process's ordered shutdown.

use std::{sync::Arc, time::Duration};

use tickdb_shutdown::ShutdownToken;
use tracing::{error, info, warn};

use crate::PersistentDataStore;

/// Waits for `token` to signal shutdown, then drains the store before completing the token.
///
/// Dirty files are given up to `timeout` to reach the file store, and the writers the same again
/// to exit. `None` waits without a deadline. The store's blocking calls run on tokio's blocking
/// pool.
pub async fn drain_on_shutdown(
    store: Arc<PersistentDataStore>,
    token: ShutdownToken,
    timeout: Option<Duration>,
) {
    token.wait_for_shutdown().await;
    info!(
        dirty_files = store.num_dirty_files(),
        "draining persistent data store"
    );

    let drained = tokio::task::spawn_blocking(move || {
        store.start_shutdown();
        let stored = match store.wait_until_data_stored(timeout) {
            Ok(stored) => stored,
            Err(error) => {
                warn!(%error, "waiting for dirty files was interrupted");
                false
            }
        };
        if !stored {
            warn!(
                dirty_files = store.num_dirty_files(),
                "not all dirty files were stored before shutdown"
            );
        }
        store.shutdown();
        store.wait_for_shutdown(timeout)
    })
    .await;

    match drained {
        Ok(true) => info!("persistent data store drained"),
        Ok(false) => warn!("writers did not stop in time"),
        Err(error) => error!(%error, "persistent data store drain task failed"),
    }
    token.complete();
}
