//! In-process PostHog analytics client.
//!
//! Events are normalized, queued into a bounded channel, and delivered in
//! size- and time-bounded batches by background upload workers with retries
//! and an error callback. Feature flags evaluate locally against a polled
//! definition set when a personal API key is configured, falling back to the
//! remote decision endpoint otherwise.
//!
//! ```no_run
//! use posthog::{CaptureOptions, Client, ClientOptions};
//!
//! let client = Client::new(ClientOptions::with_api_key("phc_..."))?;
//! client.capture("distinct-id", "movie played", CaptureOptions::default())?;
//! client.shutdown();
//! # Ok::<(), posthog::ClientError>(())
//! ```

mod client;
mod config;
mod consumer;
mod error;
mod event;
pub mod flags;
mod queue;
mod transport;
mod version;

pub use client::{CaptureOptions, Client, FlagOptions};
pub use config::{
    BATCH_SIZE_LIMIT, ClientOptions, DEFAULT_FLAG_CALL_WINDOW, DEFAULT_FLUSH_AT,
    DEFAULT_FLUSH_INTERVAL, DEFAULT_HOST, DEFAULT_MAX_QUEUE_SIZE, DEFAULT_MAX_RETRIES,
    DEFAULT_POLL_INTERVAL, DEFAULT_SHUTDOWN_TIMEOUT, DEFAULT_TIMEOUT, MAX_MESSAGE_SIZE, OnError,
};
pub use error::{ClientError, ValidationError};
pub use event::{DistinctId, Event, MessageOptions, Properties};
pub use flags::{FeatureFlag, FlagCache, FlagValue, matcher::Match};
pub use transport::TransportError;
pub use version::{LIB_NAME, VERSION};
