//! Upload workers draining the shared queue into bounded batches.
//!
//! Each worker blocks on the queue for at most `flush_interval`, greedily
//! fills a batch up to `flush_at` records or the serialized byte cap, and
//! uploads it inline. Transient failures retry with full jitter; permanent
//! failures hand the batch to the `on_error` callback and drop it. On
//! shutdown a worker drains whatever is left before exiting.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::config::{BATCH_SIZE_LIMIT, OnError};
use crate::event::Event;
use crate::queue::Command;
use crate::transport::{Transport, TransportError};

/// Longest single backoff sleep between retry attempts.
const RETRY_SLEEP_CAP: Duration = Duration::from_secs(30);

/// Cancellable stop signal shared by the facade and its workers.
///
/// Workers park on it during retry backoff so a shutdown interrupts the
/// sleep instead of waiting it out.
#[derive(Clone)]
pub(crate) struct ShutdownSignal {
    inner: Arc<SignalInner>,
}

struct SignalInner {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SignalInner {
                stopped: Mutex::new(false),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn signal(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.condvar.notify_all();
    }

    pub fn is_signalled(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleep up to `timeout`; returns true when the signal has fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if !*stopped {
            self.inner.condvar.wait_for(&mut stopped, timeout);
        }
        *stopped
    }
}

/// Per-worker settings, copied out of the client options at spawn time.
pub(crate) struct ConsumerConfig {
    pub api_key: String,
    pub gzip: bool,
    pub flush_at: usize,
    pub flush_interval: Duration,
    pub max_retries: u32,
    pub on_error: Option<OnError>,
}

enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Consumer {
    rx: Receiver<Command>,
    transport: Transport,
    shutdown: ShutdownSignal,
    config: ConsumerConfig,
    /// Current batch size target; halved after a 413 rejection.
    flush_at: usize,
    rng: StdRng,
}

pub(crate) fn spawn_consumer(
    rx: Receiver<Command>,
    transport: Transport,
    shutdown: ShutdownSignal,
    config: ConsumerConfig,
) -> thread::JoinHandle<()> {
    thread::spawn(move || Consumer::new(rx, transport, shutdown, config).run())
}

impl Consumer {
    fn new(
        rx: Receiver<Command>,
        transport: Transport,
        shutdown: ShutdownSignal,
        config: ConsumerConfig,
    ) -> Self {
        let flush_at = config.flush_at.max(1);
        Self {
            rx,
            transport,
            shutdown,
            config,
            flush_at,
            rng: StdRng::from_entropy(),
        }
    }

    fn run(mut self) {
        let mut buffer: Vec<Event> = Vec::new();
        loop {
            let flow = match self.rx.recv_timeout(self.config.flush_interval) {
                Ok(command) => self.handle_command(command, &mut buffer),
                Err(RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        self.flush_buffer(&mut buffer);
                    }
                    if self.shutdown.is_signalled() {
                        self.drain(&mut buffer);
                        Flow::Stop
                    } else {
                        Flow::Continue
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.drain(&mut buffer);
                    Flow::Stop
                }
            };
            if matches!(flow, Flow::Stop) {
                break;
            }
        }
    }

    fn handle_command(&mut self, command: Command, buffer: &mut Vec<Event>) -> Flow {
        match command {
            Command::Message(event) => {
                buffer.push(*event);
                let control = self.fill(buffer);
                self.flush_buffer(buffer);
                match control {
                    Some(command) => self.handle_command(command, buffer),
                    None => Flow::Continue,
                }
            }
            Command::Flush(ack) => {
                self.flush_buffer(buffer);
                let _ = ack.send(());
                Flow::Continue
            }
            Command::Shutdown(ack) => {
                self.drain(buffer);
                let _ = ack.send(());
                Flow::Stop
            }
        }
    }

    /// Greedily pull further messages without blocking. A control command
    /// encountered mid-fill is returned to the caller for handling after the
    /// buffered messages have been uploaded.
    fn fill(&mut self, buffer: &mut Vec<Event>) -> Option<Command> {
        while buffer.len() < self.flush_at {
            match self.rx.try_recv() {
                Ok(Command::Message(event)) => buffer.push(*event),
                Ok(control) => return Some(control),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        None
    }

    /// Upload everything buffered, split into count- and byte-bounded chunks.
    fn flush_buffer(&mut self, buffer: &mut Vec<Event>) {
        while !buffer.is_empty() {
            let chunk = take_chunk(buffer, self.flush_at);
            self.send_batch(chunk);
        }
    }

    /// Drain the queue fully, uploading as batches fill, then flush the rest.
    fn drain(&mut self, buffer: &mut Vec<Event>) {
        loop {
            match self.rx.try_recv() {
                Ok(Command::Message(event)) => {
                    buffer.push(*event);
                    if buffer.len() >= self.flush_at {
                        self.flush_buffer(buffer);
                    }
                }
                Ok(Command::Flush(ack)) => {
                    self.flush_buffer(buffer);
                    let _ = ack.send(());
                }
                // Another worker's sentinel; ack it so shutdown is not kept
                // waiting, and let that worker exit via the stop signal.
                Ok(Command::Shutdown(ack)) => {
                    let _ = ack.send(());
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        self.flush_buffer(buffer);
    }

    fn send_batch(&mut self, batch: Vec<Event>) {
        if batch.is_empty() {
            return;
        }
        let mut attempt: u32 = 0;
        loop {
            match self
                .transport
                .batch_post(&self.config.api_key, &batch, self.config.gzip)
            {
                Ok(()) => {
                    debug!("uploaded batch of {} messages", batch.len());
                    return;
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_retries => {
                    warn!("batch upload failed (attempt {attempt}), retrying: {err}");
                    let interrupted = self.backoff(attempt);
                    if interrupted {
                        debug!("retry sleep interrupted by shutdown");
                    }
                    attempt += 1;
                }
                Err(err) => {
                    self.note_permanent_failure(&err);
                    warn!("dropping batch of {} messages: {err}", batch.len());
                    if let Some(on_error) = &self.config.on_error {
                        on_error(&err, &batch);
                    }
                    return;
                }
            }
        }
    }

    /// A payload-too-large rejection halves the batch target for subsequent
    /// uploads (floor 1).
    fn note_permanent_failure(&mut self, err: &TransportError) {
        if err.status() == Some(413) {
            self.flush_at = halved_flush_at(self.flush_at);
            warn!(
                "payload too large; reducing batch target to {}",
                self.flush_at
            );
        }
    }

    /// Full-jitter sleep bounded by `min(30 s, 2^attempt s)`. Returns true
    /// when the sleep was cut short by shutdown.
    fn backoff(&mut self, attempt: u32) -> bool {
        let cap = retry_sleep_cap(attempt);
        let max_ms = cap.as_millis() as u64;
        let sleep = Duration::from_millis(self.rng.gen_range(0..=max_ms));
        self.shutdown.wait_timeout(sleep)
    }
}

fn retry_sleep_cap(attempt: u32) -> Duration {
    let exponential = Duration::from_secs(2u64.saturating_pow(attempt.min(10)));
    exponential.min(RETRY_SLEEP_CAP)
}

fn halved_flush_at(flush_at: usize) -> usize {
    (flush_at / 2).max(1)
}

/// Take the longest batch prefix within the count target and the serialized
/// byte cap. Always takes at least one message so oversized stragglers
/// cannot wedge the queue.
fn take_chunk(buffer: &mut Vec<Event>, flush_at: usize) -> Vec<Event> {
    let mut bytes = 0usize;
    let mut count = 0usize;
    while count < buffer.len() && count < flush_at {
        let size = buffer[count].serialized_size();
        if count > 0 && bytes.saturating_add(size) > BATCH_SIZE_LIMIT {
            break;
        }
        bytes = bytes.saturating_add(size);
        count += 1;
    }
    buffer.drain(..count).collect()
}
