//! Client configuration.
//!
//! [`ClientOptions`] carries every tunable the client understands, with
//! defaults matching the hosted service's recommendations. Construct one,
//! override what you need, and hand it to [`Client::new`](crate::Client::new).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::event::Event;
use crate::transport::TransportError;

/// Endpoint base used when no host is configured.
pub const DEFAULT_HOST: &str = "https://app.posthog.com";
/// How often the poller refreshes flag definitions.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Bounded queue capacity between producers and upload workers.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;
/// Number of upload workers draining the queue.
pub const DEFAULT_WORKER_COUNT: usize = 1;
/// Batch size target for a single upload.
pub const DEFAULT_FLUSH_AT: usize = 100;
/// Longest a queued message waits before a partial batch is uploaded.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);
/// Per-HTTP-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);
/// Retry budget per batch for transient upload failures.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
/// Upper bound on a graceful shutdown, flush included.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
/// Window within which repeated `$feature_flag_called` events for the same
/// `(distinct_id, key, value)` are suppressed.
pub const DEFAULT_FLAG_CALL_WINDOW: Duration = Duration::from_secs(600);

/// Largest serialized size accepted for a single record.
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024;
/// Upper bound on the serialized size of one upload batch.
pub const BATCH_SIZE_LIMIT: usize = 500 * 1024;

/// Callback invoked when a batch is dropped after its retry budget is spent
/// or a permanent rejection.
pub type OnError = Arc<dyn Fn(&TransportError, &[Event]) + Send + Sync>;

/// Options accepted by [`Client::new`](crate::Client::new).
///
/// At least one of `api_key` and `project_api_key` is required; everything
/// else has a default.
#[derive(Clone)]
pub struct ClientOptions {
    /// Project write key used for ingestion and remote flag decisions.
    pub api_key: Option<String>,
    /// Alias for `api_key`; either satisfies the key requirement.
    pub project_api_key: Option<String>,
    /// Personal key authorizing flag-definition fetches. Setting it enables
    /// local flag evaluation via the background poller.
    pub personal_api_key: Option<String>,
    /// Endpoint base, e.g. `https://app.posthog.com`.
    pub host: String,
    /// Log every built message at debug level.
    pub debug: bool,
    /// When false, messages are built and validated but never sent.
    pub send: bool,
    /// Deliver each message inline on the calling thread; no queue, no
    /// workers.
    pub sync_mode: bool,
    /// Turn every operation into a no-op.
    pub disabled: bool,
    /// Gzip-compress upload bodies.
    pub gzip: bool,
    /// Flag-definition refresh period.
    pub poll_interval: Duration,
    /// Queue capacity; `put` fails fast once reached.
    pub max_queue_size: usize,
    /// Number of upload workers.
    pub worker_count: usize,
    /// Batch size target.
    pub flush_at: usize,
    /// Maximum batching latency.
    pub flush_interval: Duration,
    /// Per-HTTP-request timeout.
    pub timeout: Duration,
    /// Transient-failure retry budget per batch.
    pub max_retries: u32,
    /// Upper bound on flush/join during shutdown.
    pub shutdown_timeout: Duration,
    /// Dedup window for `$feature_flag_called` events.
    pub feature_flag_call_window: Duration,
    /// Invoked with the error and the dropped batch when uploads give up.
    pub on_error: Option<OnError>,
}

impl ClientOptions {
    /// Options for the given project write key, everything else default.
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            project_api_key: None,
            personal_api_key: None,
            host: DEFAULT_HOST.to_string(),
            debug: false,
            send: true,
            sync_mode: false,
            disabled: false,
            gzip: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            worker_count: DEFAULT_WORKER_COUNT,
            flush_at: DEFAULT_FLUSH_AT,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            feature_flag_call_window: DEFAULT_FLAG_CALL_WINDOW,
            on_error: None,
        }
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("host", &self.host)
            .field("debug", &self.debug)
            .field("send", &self.send)
            .field("sync_mode", &self.sync_mode)
            .field("disabled", &self.disabled)
            .field("gzip", &self.gzip)
            .field("poll_interval", &self.poll_interval)
            .field("max_queue_size", &self.max_queue_size)
            .field("worker_count", &self.worker_count)
            .field("flush_at", &self.flush_at)
            .field("flush_interval", &self.flush_interval)
            .field("timeout", &self.timeout)
            .field("max_retries", &self.max_retries)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("on_error", &self.on_error.as_ref().map(|_| ".."))
            .finish()
    }
}
