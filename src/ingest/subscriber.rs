//! TCP subscriber for one upstream producer.
//!
//! Each `SourceSubscriber` runs on its own thread: it connects to the
//! producer's endpoint, splits the byte stream into messages, and forwards
//! every two-part message to the event loop as an `InboundMessage`. It never
//! touches combiner state. Connection loss is retried with a fixed backoff.
//!
//! The subscriber MUST NOT:
//! - Decode headers (the loop owns that, so failures are counted in one place)
//! - Buffer messages beyond the channel bound

use anyhow::{anyhow, Result};
use std::io::{ErrorKind, Read};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::combiner::SourceId;
use crate::transport::{Endpoint, MessageDecoder};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const READ_BUF_BYTES: usize = 64 * 1024;

/// One raw message from a producer.
#[derive(Debug)]
pub struct InboundMessage {
    pub source: SourceId,
    pub header: Vec<u8>,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct SubscriberConfig {
    pub source: SourceId,
    pub name: String,
    pub endpoint: Endpoint,
    /// Wait between reconnect attempts.
    pub reconnect_backoff: Duration,
    /// Socket read timeout; bounds how long shutdown takes to notice.
    pub poll_interval: Duration,
}

impl SubscriberConfig {
    pub fn new(source: SourceId, name: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            source,
            name: name.into(),
            endpoint,
            reconnect_backoff: Duration::from_millis(500),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    connected: AtomicBool,
    forwarded: AtomicU64,
    rejected: AtomicU64,
}

/// Statistics for a subscriber.
#[derive(Clone, Debug)]
pub struct SubscriberStats {
    pub name: String,
    pub endpoint: String,
    pub connected: bool,
    pub messages_forwarded: u64,
    pub messages_rejected: u64,
}

#[derive(Debug)]
pub struct SourceSubscriber {
    name: String,
    endpoint: Endpoint,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SourceSubscriber {
    pub fn spawn(config: SubscriberConfig, tx: SyncSender<InboundMessage>) -> Result<Self> {
        let counters = Arc::new(Counters::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let name = config.name.clone();
        let endpoint = config.endpoint.clone();

        let thread_counters = counters.clone();
        let thread_shutdown = shutdown.clone();
        let join = std::thread::Builder::new()
            .name(format!("sub-{}", config.name))
            .spawn(move || run_subscriber(config, tx, thread_counters, thread_shutdown))?;

        Ok(Self {
            name,
            endpoint,
            counters,
            shutdown,
            join: Some(join),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.counters.connected.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> SubscriberStats {
        SubscriberStats {
            name: self.name.clone(),
            endpoint: self.endpoint.to_string(),
            connected: self.is_connected(),
            messages_forwarded: self.counters.forwarded.load(Ordering::SeqCst),
            messages_rejected: self.counters.rejected.load(Ordering::SeqCst),
        }
    }

    /// Ask the thread to stop without waiting for it.
    pub fn request_stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Stop and join. The receiving end must not be blocked on, or already be gone.
    pub fn stop(mut self) -> Result<()> {
        self.request_stop();
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("subscriber thread {} panicked", self.name))?;
        }
        Ok(())
    }
}

enum PumpEnd {
    Eof,
    Shutdown,
    ChannelClosed,
}

fn run_subscriber(
    config: SubscriberConfig,
    tx: SyncSender<InboundMessage>,
    counters: Arc<Counters>,
    shutdown: Arc<AtomicBool>,
) {
    let mut reported_unreachable = false;
    while !shutdown.load(Ordering::SeqCst) {
        match connect(&config) {
            Ok(stream) => {
                reported_unreachable = false;
                counters.connected.store(true, Ordering::SeqCst);
                log::info!("source {} connected to {}", config.name, config.endpoint);
                let end = pump(&config, stream, &tx, &counters, &shutdown);
                counters.connected.store(false, Ordering::SeqCst);
                match end {
                    Ok(PumpEnd::Shutdown) => break,
                    Ok(PumpEnd::ChannelClosed) => {
                        log::debug!("source {}: event loop gone, stopping", config.name);
                        return;
                    }
                    Ok(PumpEnd::Eof) => {
                        log::info!("source {} disconnected from {}", config.name, config.endpoint)
                    }
                    Err(err) => log::warn!("source {} connection dropped: {}", config.name, err),
                }
            }
            Err(err) => {
                if !reported_unreachable {
                    log::warn!(
                        "source {} cannot reach {}: {} (retrying)",
                        config.name,
                        config.endpoint,
                        err
                    );
                    reported_unreachable = true;
                } else {
                    log::trace!("source {} reconnect failed: {}", config.name, err);
                }
            }
        }
        sleep_unless_shutdown(config.reconnect_backoff, &shutdown);
    }
    log::debug!("source {} subscriber stopped", config.name);
}

fn connect(config: &SubscriberConfig) -> Result<TcpStream> {
    let addr = config.endpoint.socket_addr()?;
    let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
    stream.set_read_timeout(Some(config.poll_interval))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

fn pump(
    config: &SubscriberConfig,
    mut stream: TcpStream,
    tx: &SyncSender<InboundMessage>,
    counters: &Counters,
    shutdown: &AtomicBool,
) -> Result<PumpEnd> {
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_BUF_BYTES];
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return Ok(PumpEnd::Shutdown);
        }
        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(PumpEnd::Eof),
            Ok(n) => n,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        decoder.feed(&buf[..n]);

        while let Some(mut parts) = decoder.next_message()? {
            if parts.len() != 2 {
                counters.rejected.fetch_add(1, Ordering::SeqCst);
                log::warn!(
                    "source {}: skipping message with {} part(s), expected header and payload",
                    config.name,
                    parts.len()
                );
                continue;
            }
            let payload = parts.pop().unwrap_or_default();
            let header = parts.pop().unwrap_or_default();
            let message = InboundMessage {
                source: config.source,
                header,
                payload,
            };
            counters.forwarded.fetch_add(1, Ordering::SeqCst);
            if tx.send(message).is_err() {
                return Ok(PumpEnd::ChannelClosed);
            }
        }
    }
}

fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(20)));
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
