//! Client facade: owns the queue, upload workers, and flag poller, and
//! exposes the public capture and feature-flag API.
//!
//! Producer operations return synchronously with the normalized record or a
//! [`ClientError`]; background failures surface through the `on_error`
//! callback and the log, never to the producing thread.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;
use log::{debug, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::config::ClientOptions;
use crate::consumer::{ConsumerConfig, ShutdownSignal, spawn_consumer};
use crate::error::ClientError;
use crate::event::{self, DistinctId, Event, MessageOptions, Properties};
use crate::flags::poller::FlagPoller;
use crate::flags::{FlagCache, FlagValue, matcher};
use crate::queue::{Command, MessageQueue};
use crate::transport::{Transport, TransportError};

/// Options accepted by [`Client::capture`].
#[derive(Clone, Debug, Default)]
pub struct CaptureOptions {
    pub properties: Option<Properties>,
    pub context: Option<Properties>,
    pub timestamp: Option<DateTime<Utc>>,
    pub uuid: Option<String>,
    /// Group attributions for this event, group type → group key.
    pub groups: Option<HashMap<String, String>>,
    /// Stamp the event with the caller's current feature flags.
    pub send_feature_flags: bool,
}

impl CaptureOptions {
    fn message(&self) -> MessageOptions {
        MessageOptions {
            context: self.context.clone(),
            timestamp: self.timestamp,
            uuid: self.uuid.clone(),
        }
    }
}

/// Options shared by the flag-evaluation entry points.
#[derive(Clone, Debug)]
pub struct FlagOptions {
    /// Group memberships, group type → group key.
    pub groups: HashMap<String, String>,
    pub person_properties: Properties,
    /// Group properties, group type → property bag.
    pub group_properties: HashMap<String, Properties>,
    /// Never fall back to the decision endpoint.
    pub only_evaluate_locally: bool,
    /// Record a `$feature_flag_called` event for this lookup.
    pub send_feature_flag_events: bool,
}

impl Default for FlagOptions {
    fn default() -> Self {
        Self {
            groups: HashMap::new(),
            person_properties: Properties::new(),
            group_properties: HashMap::new(),
            only_evaluate_locally: false,
            send_feature_flag_events: true,
        }
    }
}

/// Analytics client delivering events in batches and answering feature-flag
/// queries. Cheap operations; all I/O happens on background threads unless
/// `sync_mode` is set.
pub struct Client {
    options: ClientOptions,
    api_key: String,
    transport: Transport,
    queue: Option<MessageQueue>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    shutdown: ShutdownSignal,
    poller: Option<FlagPoller>,
    flag_calls: Mutex<HashMap<(String, String, String), Instant>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.options)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Client {
    /// Build a client and start its background threads.
    ///
    /// Fails with [`ClientError::Config`] when neither `api_key` nor
    /// `project_api_key` is set.
    pub fn new(options: ClientOptions) -> Result<Self, ClientError> {
        let api_key = options
            .api_key
            .clone()
            .or_else(|| options.project_api_key.clone())
            .ok_or_else(|| {
                ClientError::Config("either api_key or project_api_key is required".to_owned())
            })?;
        let transport = Transport::new(&options.host, options.timeout)
            .map_err(|err| ClientError::Config(format!("transport setup failed: {err}")))?;
        let shutdown = ShutdownSignal::new();

        let mut queue = None;
        let mut workers = Vec::new();
        if !options.sync_mode && !options.disabled {
            let message_queue = MessageQueue::with_capacity(options.max_queue_size);
            for _ in 0..options.worker_count.max(1) {
                workers.push(spawn_consumer(
                    message_queue.receiver(),
                    transport.clone(),
                    shutdown.clone(),
                    ConsumerConfig {
                        api_key: api_key.clone(),
                        gzip: options.gzip,
                        flush_at: options.flush_at,
                        flush_interval: options.flush_interval,
                        max_retries: options.max_retries,
                        on_error: options.on_error.clone(),
                    },
                ));
            }
            queue = Some(message_queue);
        }

        let poller = match (&options.personal_api_key, options.disabled) {
            (Some(personal_api_key), false) => Some(FlagPoller::start(
                transport.clone(),
                api_key.clone(),
                personal_api_key.clone(),
                options.poll_interval,
            )),
            _ => None,
        };

        Ok(Self {
            options,
            api_key,
            transport,
            queue,
            workers: Mutex::new(workers),
            shutdown,
            poller,
            flag_calls: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Record that `event` happened for `distinct_id`.
    pub fn capture(
        &self,
        distinct_id: impl Into<DistinctId>,
        event: &str,
        options: CaptureOptions,
    ) -> Result<Event, ClientError> {
        let distinct_id = distinct_id.into();
        let mut options = options;
        let mut properties = options.properties.take().unwrap_or_default();
        if options.send_feature_flags && !self.options.disabled {
            if let Ok(id) = distinct_id.canonical() {
                self.stamp_feature_flags(&id, options.groups.as_ref(), &mut properties);
            }
        }
        let record = event::capture_event(
            &distinct_id,
            event,
            properties,
            options.groups.as_ref(),
            options.message(),
        )?;
        self.enqueue(record)
    }

    /// Attach (or overwrite) person properties for `distinct_id`.
    pub fn identify(
        &self,
        distinct_id: impl Into<DistinctId>,
        properties: Properties,
        options: MessageOptions,
    ) -> Result<Event, ClientError> {
        let record = event::identify_event(&distinct_id.into(), properties, options)?;
        self.enqueue(record)
    }

    /// Overwrite person properties, like `identify`.
    pub fn set(
        &self,
        distinct_id: impl Into<DistinctId>,
        properties: Properties,
        options: MessageOptions,
    ) -> Result<Event, ClientError> {
        let record = event::set_event(&distinct_id.into(), properties, options)?;
        self.enqueue(record)
    }

    /// Set person properties only where no value exists yet.
    pub fn set_once(
        &self,
        distinct_id: impl Into<DistinctId>,
        properties: Properties,
        options: MessageOptions,
    ) -> Result<Event, ClientError> {
        let record = event::set_once_event(&distinct_id.into(), properties, options)?;
        self.enqueue(record)
    }

    /// Declare that `previous_id` and `distinct_id` are the same user.
    pub fn alias(
        &self,
        previous_id: impl Into<DistinctId>,
        distinct_id: impl Into<DistinctId>,
        options: MessageOptions,
    ) -> Result<Event, ClientError> {
        let record = event::alias_event(&previous_id.into(), &distinct_id.into(), options)?;
        self.enqueue(record)
    }

    /// Set properties on a `(group_type, group_key)` entity.
    pub fn group_identify(
        &self,
        group_type: &str,
        group_key: &str,
        properties: Properties,
        options: MessageOptions,
    ) -> Result<Event, ClientError> {
        let record = event::group_identify_event(group_type, group_key, properties, options)?;
        self.enqueue(record)
    }

    /// Record a page view of `url`.
    pub fn page(
        &self,
        distinct_id: impl Into<DistinctId>,
        url: &str,
        properties: Properties,
        options: MessageOptions,
    ) -> Result<Event, ClientError> {
        let record = event::page_event(&distinct_id.into(), url, properties, options)?;
        self.enqueue(record)
    }

    /// Record a mobile screen view.
    pub fn screen(
        &self,
        distinct_id: impl Into<DistinctId>,
        name: &str,
        properties: Properties,
        options: MessageOptions,
    ) -> Result<Event, ClientError> {
        let record = event::screen_event(&distinct_id.into(), name, properties, options)?;
        self.enqueue(record)
    }

    /// Whether `key` is enabled for `distinct_id`. Never fails: evaluation
    /// errors coerce to `false`.
    pub fn feature_enabled(&self, key: &str, distinct_id: &str, options: FlagOptions) -> bool {
        self.get_feature_flag(key, distinct_id, options)
            .map(|value| value.is_active())
            .unwrap_or(false)
    }

    /// The flag's value for `distinct_id`: a boolean, a variant key, or
    /// `None` when it cannot be resolved.
    pub fn get_feature_flag(
        &self,
        key: &str,
        distinct_id: &str,
        options: FlagOptions,
    ) -> Option<FlagValue> {
        if self.options.disabled {
            return None;
        }
        let mut response = None;
        if let Some(cache) = self.snapshot() {
            if let Some(flag) = cache.get(key) {
                match matcher::evaluate(
                    flag,
                    distinct_id,
                    &options.groups,
                    &options.person_properties,
                    &options.group_properties,
                ) {
                    matcher::Match::Decided(value) => response = Some(value),
                    matcher::Match::Undecidable => {
                        debug!("flag {key} undecidable locally for {distinct_id}");
                    }
                }
            }
        }
        if response.is_none() && !options.only_evaluate_locally {
            response = self
                .decide_flags(distinct_id, &options)
                .ok()
                .and_then(|mut flags| flags.remove(key));
        }
        if options.send_feature_flag_events {
            self.report_flag_call(distinct_id, key, response.as_ref());
        }
        response
    }

    /// Every flag value resolvable for `distinct_id`. Locally decided values
    /// win; one decision call fills the remainder when allowed.
    pub fn get_all_flags(
        &self,
        distinct_id: &str,
        options: FlagOptions,
    ) -> HashMap<String, FlagValue> {
        self.all_flags(distinct_id, &options).unwrap_or_default()
    }

    /// Block until every message enqueued before this call has been handed
    /// to the transport. Workers keep running.
    pub fn flush(&self) -> bool {
        let Some(queue) = &self.queue else {
            return true;
        };
        let worker_count = self.workers.lock().len();
        if worker_count == 0 {
            return queue.is_empty();
        }
        let deadline = Instant::now() + self.options.shutdown_timeout;
        let mut acks = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (ack_tx, ack_rx) = bounded(1);
            let remaining = deadline.saturating_duration_since(Instant::now());
            if queue
                .sender()
                .send_timeout(Command::Flush(ack_tx), remaining)
                .is_err()
            {
                return false;
            }
            acks.push(ack_rx);
        }
        for ack in acks {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if ack.recv_timeout(remaining).is_err() {
                return false;
            }
        }
        true
    }

    /// Stop the workers (each drains the queue first) and the poller.
    pub fn join(&self) {
        self.shutdown.signal();
        let handles: Vec<_> = {
            let mut workers = self.workers.lock();
            workers.drain(..).collect()
        };
        let deadline = Instant::now() + self.options.shutdown_timeout;
        let mut acked = true;
        if let Some(queue) = &self.queue {
            let mut acks = Vec::with_capacity(handles.len());
            for _ in &handles {
                let (ack_tx, ack_rx) = bounded(1);
                let remaining = deadline.saturating_duration_since(Instant::now());
                if queue
                    .sender()
                    .send_timeout(Command::Shutdown(ack_tx), remaining)
                    .is_ok()
                {
                    acks.push(ack_rx);
                } else {
                    acked = false;
                }
            }
            for ack in acks {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if ack.recv_timeout(remaining).is_err() {
                    acked = false;
                }
            }
        }
        if acked {
            for handle in handles {
                if handle.join().is_err() {
                    warn!("consumer thread panicked");
                }
            }
        } else {
            warn!(
                "shutdown deadline passed with workers still draining; detaching {} threads",
                handles.len()
            );
        }
        if let Some(poller) = &self.poller {
            poller.stop();
        }
    }

    /// Flush pending messages, then stop all background threads. Idempotent.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.flush();
        self.join();
    }

    /// Advisory count of queued messages (racy).
    pub fn pending(&self) -> usize {
        self.queue.as_ref().map_or(0, MessageQueue::len)
    }

    /// Failure count of the flag poller, when one is running.
    pub fn flag_poll_failures(&self) -> Option<u64> {
        self.poller.as_ref().map(FlagPoller::failure_count)
    }

    fn enqueue(&self, record: Event) -> Result<Event, ClientError> {
        if self.options.debug {
            debug!(
                "built message: {}",
                serde_json::to_string(&record).unwrap_or_default()
            );
        }
        if self.options.disabled || !self.options.send {
            return Ok(record);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if self.options.sync_mode {
            let batch = std::slice::from_ref(&record);
            if let Err(err) = self
                .transport
                .batch_post(&self.api_key, batch, self.options.gzip)
            {
                if let Some(on_error) = &self.options.on_error {
                    on_error(&err, batch);
                }
                return Err(err.into());
            }
            return Ok(record);
        }
        let Some(queue) = &self.queue else {
            return Err(ClientError::Closed);
        };
        queue.put(record.clone())?;
        Ok(record)
    }

    fn snapshot(&self) -> Option<Arc<FlagCache>> {
        self.poller.as_ref().map(FlagPoller::snapshot)
    }

    fn all_flags(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Result<HashMap<String, FlagValue>, TransportError> {
        if self.options.disabled {
            return Ok(HashMap::new());
        }
        let mut decided = HashMap::new();
        let mut fallback_needed = true;
        if let Some(cache) = self.snapshot() {
            let (local, undecidable) = matcher::evaluate_all(
                &cache,
                distinct_id,
                &options.groups,
                &options.person_properties,
                &options.group_properties,
            );
            fallback_needed = cache.is_empty() || !undecidable.is_empty();
            decided = local;
        }
        if fallback_needed && !options.only_evaluate_locally {
            let remote = self.decide_flags(distinct_id, options)?;
            for (key, value) in remote {
                decided.entry(key).or_insert(value);
            }
        }
        Ok(decided)
    }

    /// One remote evaluation; results are never cached here.
    fn decide_flags(
        &self,
        distinct_id: &str,
        options: &FlagOptions,
    ) -> Result<HashMap<String, FlagValue>, TransportError> {
        let response = self.transport.decide(
            &self.api_key,
            distinct_id,
            &options.groups,
            &options.person_properties,
            &options.group_properties,
        )?;
        debug!(
            "decide returned {} flags for {distinct_id}",
            response.feature_flags.len()
        );
        Ok(response.feature_flags)
    }

    /// Merge `$feature/<key>` properties and `$active_feature_flags` into a
    /// capture. Failures are swallowed; the event ships without flag data.
    fn stamp_feature_flags(
        &self,
        distinct_id: &str,
        groups: Option<&HashMap<String, String>>,
        properties: &mut Properties,
    ) {
        let options = FlagOptions {
            groups: groups.cloned().unwrap_or_default(),
            ..FlagOptions::default()
        };
        match self.all_flags(distinct_id, &options) {
            Ok(flags) => {
                let mut active: Vec<String> = flags
                    .iter()
                    .filter(|(_, value)| value.is_active())
                    .map(|(key, _)| key.clone())
                    .collect();
                active.sort();
                for (key, value) in &flags {
                    properties.insert(format!("$feature/{key}"), value.as_property());
                }
                properties.insert(
                    "$active_feature_flags".to_owned(),
                    Value::Array(active.into_iter().map(Value::String).collect()),
                );
            }
            Err(err) => debug!("skipping feature-flag stamping: {err}"),
        }
    }

    /// Enqueue a `$feature_flag_called` event unless an identical call was
    /// reported within the dedup window.
    fn report_flag_call(&self, distinct_id: &str, key: &str, value: Option<&FlagValue>) {
        let rendered = value.map_or_else(|| "undefined".to_owned(), ToString::to_string);
        let now = Instant::now();
        {
            let mut calls = self.flag_calls.lock();
            if calls.len() > 4_096 {
                let window = self.options.feature_flag_call_window;
                calls.retain(|_, seen| now.duration_since(*seen) < window);
            }
            let dedup_key = (distinct_id.to_owned(), key.to_owned(), rendered);
            if let Some(seen) = calls.get(&dedup_key) {
                if now.duration_since(*seen) < self.options.feature_flag_call_window {
                    return;
                }
            }
            calls.insert(dedup_key, now);
        }
        let mut properties = Properties::new();
        properties.insert("$feature_flag".to_owned(), Value::String(key.to_owned()));
        properties.insert(
            "$feature_flag_response".to_owned(),
            value.map_or(Value::Null, FlagValue::as_property),
        );
        let record = event::capture_event(
            &DistinctId::Text(distinct_id.to_owned()),
            "$feature_flag_called",
            properties,
            None,
            MessageOptions::default(),
        );
        match record {
            Ok(record) => {
                if let Err(err) = self.enqueue(record) {
                    debug!("dropping $feature_flag_called event: {err}");
                }
            }
            Err(err) => debug!("could not build $feature_flag_called event: {err}"),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown();
    }
}
