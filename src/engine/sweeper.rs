//! EZKV - Background Expiry Sweeper
//! Write transactions already purge due entries, but a store that stops
//! receiving writes would keep expired entries in memory indefinitely. The
//! sweeper runs an empty write transaction on an interval to purge them.
//!
//! The thread only holds a `Weak` reference to the store, so it never keeps
//! a dropped store alive.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;

use super::StoreInner;

/// Handle to the running sweeper thread. Dropping it signals the thread to
/// stop without waiting for it.
#[derive(Debug)]
pub struct Sweeper {
    shutdown_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    pub(crate) fn start(store: Weak<StoreInner>, interval: Duration) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name("ezkv-sweeper".into())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(inner) = store.upgrade() else {
                    break;
                };
                match inner.sweep() {
                    Ok(0) => {}
                    Ok(purged) => log::debug!("Sweeper purged {} expired entries", purged),
                    Err(err) => {
                        log::debug!("Sweeper stopping: {}", err);
                        break;
                    }
                }
            })?;

        log::info!("Background expiry sweeper started (every {:?})", interval);

        Ok(Self {
            shutdown_tx,
            handle: Some(handle),
        })
    }

    /// Signal the thread and wait for it to exit.
    pub fn stop(mut self) {
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::warn!("Expiry sweeper thread panicked");
            }
        }
        log::info!("Background expiry sweeper stopped");
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}
