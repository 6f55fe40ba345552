//! Outbound side: where drained frames go.
//!
//! `FramePublisher` is the seam the combiner publishes through. Two
//! implementations ship with the crate:
//! - `TcpFramePublisher`: binds the destination endpoint and fans each frame
//!   out to every connected consumer (fire-and-forget).
//! - `InMemoryFramePublisher`: records frames, for tests and embedding.

use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::frame::FrameHeader;
use crate::transport::{encode_message, Endpoint};

const SUBSCRIBER_WRITE_TIMEOUT: Duration = Duration::from_millis(50);

pub trait FramePublisher {
    /// Publish one frame as a single two-part message.
    fn publish(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()>;
}

impl<P: FramePublisher + ?Sized> FramePublisher for Box<P> {
    fn publish(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        (**self).publish(header, payload)
    }
}

/// Cloneable handle to a publisher behind its own lock.
///
/// Lets the event loop publish after releasing the combiner lock.
pub struct SharedPublisher<P> {
    inner: Arc<Mutex<P>>,
}

impl<P> SharedPublisher<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            inner: Arc::new(Mutex::new(publisher)),
        }
    }

    /// Run `f` with exclusive access to the wrapped publisher.
    pub fn with<R>(&self, f: impl FnOnce(&mut P) -> R) -> R {
        f(&mut self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl<P> Clone for SharedPublisher<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: FramePublisher> FramePublisher for SharedPublisher<P> {
    fn publish(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        self.with(|publisher| publisher.publish(header, payload))
    }
}

// ----------------------------------------------------------------------------
// TcpFramePublisher
// ----------------------------------------------------------------------------

pub struct TcpFramePublisher {
    listener: TcpListener,
    endpoint: Endpoint,
    subscribers: Vec<Subscriber>,
}

struct Subscriber {
    peer: SocketAddr,
    stream: TcpStream,
}

impl TcpFramePublisher {
    /// Bind the destination endpoint. Fails if the address is already in use.
    pub fn bind(endpoint: &Endpoint) -> Result<Self> {
        let listener = TcpListener::bind(endpoint.bind_addr())
            .map_err(|e| anyhow!("failed to bind publisher on {}: {}", endpoint, e))?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        let endpoint = Endpoint {
            host: endpoint.host.clone(),
            port: local.port(),
        };
        log::debug!("publisher bound to {}", endpoint);
        Ok(Self {
            listener,
            endpoint,
            subscribers: Vec::new(),
        })
    }

    /// Bound endpoint (with the real port when bound to port 0).
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Accept any consumers waiting to connect. Never blocks.
    pub fn accept_pending(&mut self) -> Result<usize> {
        let mut accepted = 0;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    stream.set_write_timeout(Some(SUBSCRIBER_WRITE_TIMEOUT))?;
                    log::info!("consumer {} connected to {}", peer, self.endpoint);
                    self.subscribers.push(Subscriber { peer, stream });
                    accepted += 1;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(accepted),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Send pre-encoded parts to every subscriber, dropping the ones that fail.
    pub fn send_parts(&mut self, parts: &[&[u8]]) -> Result<()> {
        if let Err(err) = self.accept_pending() {
            log::warn!("publisher accept on {} failed: {}", self.endpoint, err);
        }
        if self.subscribers.is_empty() {
            return Ok(());
        }

        let message = encode_message(parts)?;
        let before = self.subscribers.len();
        self.subscribers.retain_mut(|sub| {
            match std::io::Write::write_all(&mut sub.stream, &message) {
                Ok(()) => true,
                Err(err) => {
                    log::info!("consumer {} dropped: {}", sub.peer, err);
                    false
                }
            }
        });

        if self.subscribers.is_empty() {
            return Err(anyhow!(
                "publish to {} failed: all {} consumer(s) disconnected",
                self.endpoint,
                before
            ));
        }
        Ok(())
    }
}

impl FramePublisher for TcpFramePublisher {
    fn publish(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        let header = header.to_json_bytes()?;
        self.send_parts(&[header.as_slice(), payload])
    }
}

// ----------------------------------------------------------------------------
// InMemoryFramePublisher
// ----------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq)]
pub struct PublishedFrame {
    pub header: Value,
    pub payload: Vec<u8>,
}

impl PublishedFrame {
    pub fn frame_num(&self) -> Option<u64> {
        self.header.get(crate::frame::FRAME_NUM_FIELD)?.as_u64()
    }
}

/// Records every published frame. Clones share the same record.
#[derive(Clone, Debug, Default)]
pub struct InMemoryFramePublisher {
    published: Arc<Mutex<Vec<PublishedFrame>>>,
    fail_next: Arc<Mutex<usize>>,
}

impl InMemoryFramePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedFrame> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn frame_nums(&self) -> Vec<u64> {
        self.published()
            .iter()
            .filter_map(PublishedFrame::frame_num)
            .collect()
    }

    /// Make the next `count` publishes fail.
    pub fn fail_next(&self, count: usize) {
        *self.fail_next.lock().unwrap_or_else(PoisonError::into_inner) = count;
    }
}

impl FramePublisher for InMemoryFramePublisher {
    fn publish(&mut self, header: &FrameHeader, payload: &[u8]) -> Result<()> {
        {
            let mut fail = self.fail_next.lock().unwrap_or_else(PoisonError::into_inner);
            if *fail > 0 {
                *fail -= 1;
                return Err(anyhow!("destination unavailable"));
            }
        }
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedFrame {
                header: Value::Object(header.fields().clone()),
                payload: payload.to_vec(),
            });
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
