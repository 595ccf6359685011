//! Background refresh of the flag-definition snapshot.
//!
//! The poller owns the only writer to the shared snapshot: readers clone an
//! `Arc<FlagCache>` out of an `RwLock` while the poller swaps in a freshly
//! built cache after each successful fetch. A failed fetch keeps the previous
//! snapshot and bumps a failure counter instead of crashing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use super::FlagCache;
use crate::transport::Transport;

pub(crate) struct FlagPoller {
    cache: Arc<RwLock<Arc<FlagCache>>>,
    failures: Arc<AtomicU64>,
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl FlagPoller {
    /// Fetch immediately, then refresh every `interval` until stopped.
    pub fn start(
        transport: Transport,
        project_api_key: String,
        personal_api_key: String,
        interval: Duration,
    ) -> Self {
        let cache = Arc::new(RwLock::new(Arc::new(FlagCache::default())));
        let failures = Arc::new(AtomicU64::new(0));
        let (stop_tx, stop_rx) = bounded(1);
        let worker_cache = Arc::clone(&cache);
        let worker_failures = Arc::clone(&failures);
        let handle = thread::spawn(move || {
            poll_loop(
                transport,
                project_api_key,
                personal_api_key,
                interval,
                stop_rx,
                worker_cache,
                worker_failures,
            );
        });
        Self {
            cache,
            failures,
            stop: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Immutable view of the latest definitions. Empty until the first
    /// successful fetch.
    pub fn snapshot(&self) -> Arc<FlagCache> {
        Arc::clone(&self.cache.read())
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Stop polling and join the thread. Idempotent.
    pub fn stop(&self) {
        let Some(stop_tx) = self.stop.lock().take() else {
            return;
        };
        let _ = stop_tx.send(());
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("flag poller thread panicked");
            }
        }
    }
}

impl Drop for FlagPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    transport: Transport,
    project_api_key: String,
    personal_api_key: String,
    interval: Duration,
    stop_rx: Receiver<()>,
    cache: Arc<RwLock<Arc<FlagCache>>>,
    failures: Arc<AtomicU64>,
) {
    let mut version: u64 = 0;
    loop {
        match transport.local_evaluation(&project_api_key, &personal_api_key) {
            Ok(response) => {
                version += 1;
                let next = Arc::new(FlagCache::new(response.flags, version));
                debug!(
                    "loaded {} feature flag definitions (version {version})",
                    next.len()
                );
                *cache.write() = next;
            }
            Err(err) => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!("failed to refresh feature flags, keeping previous set: {err}");
            }
        }
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
