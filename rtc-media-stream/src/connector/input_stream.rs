//! Receive side of a connector: one thread per stream reading datagrams into
//! pooled buffers and handing the latest one to a consumer.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::{debug, error, trace, warn};
use parking_lot::{Mutex, RwLock};
use shared::error::{Error, Result};

use super::transport::PacketTransport;
use crate::config::MediaStreamConfig;
use crate::packet::{PacketPool, RawPacket};

/// Which channel an input stream reads.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Data,
    Control,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Data => write!(f, "data"),
            StreamKind::Control => write!(f, "control"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// A packet was stored in the handoff slot.
    DataAvailable,
    /// The transport failed; no further packets will arrive.
    EndOfStream,
}

/// Receives input stream notifications on the receive thread.
pub trait PacketConsumer: Send + Sync {
    fn on_event(&self, stream: &RtpConnectorInputStream, event: InputEvent);
}

impl<F> PacketConsumer for F
where
    F: Fn(&RtpConnectorInputStream, InputEvent) + Send + Sync,
{
    fn on_event(&self, stream: &RtpConnectorInputStream, event: InputEvent) {
        self(stream, event)
    }
}

/// Predicate deciding whether a received datagram is kept.
pub trait DatagramFilter: Send + Sync {
    fn accept(&self, buf: &[u8], from: SocketAddr) -> bool;
}

impl<F> DatagramFilter for F
where
    F: Fn(&[u8], SocketAddr) -> bool + Send + Sync,
{
    fn accept(&self, buf: &[u8], from: SocketAddr) -> bool {
        self(buf, from)
    }
}

/// Accepts everything and records when the last datagram arrived.
struct ActivityFilter {
    last_activity: Mutex<Option<Instant>>,
}

impl DatagramFilter for ActivityFilter {
    fn accept(&self, _buf: &[u8], _from: SocketAddr) -> bool {
        *self.last_activity.lock() = Some(Instant::now());
        true
    }
}

struct InputInner {
    kind: StreamKind,
    pool: PacketPool,
    buffer_size: usize,

    transport: Mutex<Option<Arc<dyn PacketTransport>>>,
    consumer: Mutex<Option<Arc<dyn PacketConsumer>>>,
    activity: ActivityFilter,
    filters: RwLock<Vec<Box<dyn DatagramFilter>>>,

    /// Most recently received packet not yet read.
    slot: Mutex<Option<(RawPacket, SocketAddr)>>,

    enabled: AtomicBool,
    closed: AtomicBool,
    failed: AtomicBool,

    received_bytes: AtomicU64,
    received_packets: AtomicU64,
    overwritten: AtomicU64,

    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for InputInner {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.get_mut().take() {
            let _ = transport.close();
        }
    }
}

/// Receive side of one connector channel.
///
/// The handoff is a single slot: a packet that arrives before the previous
/// one was read replaces it. This is not a queue; slow readers lose packets.
#[derive(Clone)]
pub struct RtpConnectorInputStream {
    inner: Arc<InputInner>,
}

impl fmt::Debug for RtpConnectorInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpConnectorInputStream")
            .field("kind", &self.inner.kind)
            .field("received_packets", &self.number_of_received_packets())
            .field("closed", &self.is_closed())
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl RtpConnectorInputStream {
    pub fn new(kind: StreamKind, pool: PacketPool, config: &MediaStreamConfig) -> Self {
        Self {
            inner: Arc::new(InputInner {
                kind,
                pool,
                buffer_size: config.receive_buffer_size.max(1),
                transport: Mutex::new(None),
                consumer: Mutex::new(None),
                activity: ActivityFilter {
                    last_activity: Mutex::new(None),
                },
                filters: RwLock::new(vec![]),
                slot: Mutex::new(None),
                enabled: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                received_bytes: AtomicU64::new(0),
                received_packets: AtomicU64::new(0),
                overwritten: AtomicU64::new(0),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn set_transport(&self, transport: Arc<dyn PacketTransport>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrStreamClosed);
        }
        *self.inner.transport.lock() = Some(transport);
        self.maybe_start();
        Ok(())
    }

    /// Registers the consumer. The receive thread starts once both a
    /// transport and a consumer are present.
    pub fn set_consumer(&self, consumer: Arc<dyn PacketConsumer>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ErrStreamClosed);
        }
        *self.inner.consumer.lock() = Some(consumer);
        self.maybe_start();
        Ok(())
    }

    /// Appends a filter; filters run in insertion order after the built-in
    /// activity filter.
    pub fn add_filter(&self, filter: Box<dyn DatagramFilter>) {
        self.inner.filters.write().push(filter);
    }

    /// A disabled stream keeps reading but drops every datagram.
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Option<Instant> {
        *self.inner.activity.last_activity.lock()
    }

    pub fn number_of_received_bytes(&self) -> u64 {
        self.inner.received_bytes.load(Ordering::Relaxed)
    }

    pub fn number_of_received_packets(&self) -> u64 {
        self.inner.received_packets.load(Ordering::Relaxed)
    }

    /// Packets replaced in the slot before anyone read them.
    pub fn overwritten(&self) -> u64 {
        self.inner.overwritten.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &PacketPool {
        &self.inner.pool
    }

    /// Copies the pending packet into `buf` and recycles it.
    ///
    /// Returns `Ok(0)` when nothing is pending. A destination smaller than the
    /// packet leaves it pending and fails with `ErrShortBuffer`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut slot = self.inner.slot.lock();
        match slot.take() {
            None => {
                if self.is_failed() || self.is_closed() {
                    Err(Error::ErrEndOfStream)
                } else {
                    Ok(0)
                }
            }
            Some((pkt, from)) => {
                let n = pkt.len();
                if buf.len() < n {
                    *slot = Some((pkt, from));
                    return Err(Error::ErrShortBuffer);
                }
                buf[..n].copy_from_slice(pkt.as_slice());
                drop(slot);
                self.inner.pool.release(pkt);
                Ok(n)
            }
        }
    }

    /// Like [`RtpConnectorInputStream::read`], but copies into a fresh
    /// unpooled packet that keeps the arrival time and source address.
    pub fn read_packet(&self) -> Result<Option<(RawPacket, SocketAddr)>> {
        let taken = self.inner.slot.lock().take();
        match taken {
            None => {
                if self.is_failed() || self.is_closed() {
                    Err(Error::ErrEndOfStream)
                } else {
                    Ok(None)
                }
            }
            Some((pkt, from)) => {
                let copy = RawPacket::new(pkt.as_slice(), pkt.now);
                self.inner.pool.release(pkt);
                Ok(Some((copy, from)))
            }
        }
    }

    /// Closes the transport, joins the receive thread and recycles any
    /// pending packet. Terminal.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing {} input stream", self.inner.kind);

        if let Some(transport) = self.inner.transport.lock().take()
            && let Err(err) = transport.close()
        {
            warn!("closing {} transport: {}", self.inner.kind, err);
        }

        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle
            && handle.thread().id() != thread::current().id()
        {
            let _ = handle.join();
        }

        if let Some((pkt, _)) = self.inner.slot.lock().take() {
            self.inner.pool.release(pkt);
        }
        self.inner.consumer.lock().take();
    }

    fn maybe_start(&self) {
        if self.is_closed() {
            return;
        }
        let mut thread = self.inner.thread.lock();
        if thread.is_some() {
            return;
        }
        let transport = match self.inner.transport.lock().as_ref() {
            Some(t) => Arc::clone(t),
            None => return,
        };
        if self.inner.consumer.lock().is_none() {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let buffer_size = self.inner.buffer_size;
        let name = format!("rtp-{}-recv", self.inner.kind);
        match thread::Builder::new()
            .name(name)
            .spawn(move || receive_loop(weak, transport, buffer_size))
        {
            Ok(handle) => {
                debug!("{} receive thread started", self.inner.kind);
                *thread = Some(handle);
            }
            Err(err) => {
                error!("spawning {} receive thread: {}", self.inner.kind, err);
                self.inner.failed.store(true, Ordering::Release);
            }
        }
    }
}

fn receive_loop(weak: Weak<InputInner>, transport: Arc<dyn PacketTransport>, buffer_size: usize) {
    let mut scratch = vec![0u8; buffer_size];
    loop {
        let result = transport.recv(&mut scratch);

        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::Acquire) {
            break;
        }

        match result {
            Ok((0, from)) => {
                trace!("dropping empty datagram from {}", from);
            }
            Ok((n, from)) => {
                let stream = RtpConnectorInputStream { inner };
                stream.handle_datagram(&scratch[..n], from);
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(err) => {
                error!("{} receive failed: {}", inner.kind, err);
                inner.failed.store(true, Ordering::Release);
                let stream = RtpConnectorInputStream { inner };
                stream.notify(InputEvent::EndOfStream);
                break;
            }
        }
    }
}

impl RtpConnectorInputStream {
    fn handle_datagram(&self, data: &[u8], from: SocketAddr) {
        if !self.is_enabled() {
            trace!("{} stream disabled, dropping {} bytes", self.inner.kind, data.len());
            return;
        }

        self.inner.activity.accept(data, from);
        if !self.inner.filters.read().iter().all(|f| f.accept(data, from)) {
            trace!("{} datagram from {} rejected by filter", self.inner.kind, from);
            return;
        }

        let Some(mut pkt) = self.inner.pool.acquire() else {
            warn!("{} packet pool exhausted, dropping datagram", self.inner.kind);
            return;
        };
        pkt.fill(data, Instant::now());

        let previous = self.inner.slot.lock().replace((pkt, from));
        if let Some((old, _)) = previous {
            self.inner.overwritten.fetch_add(1, Ordering::Relaxed);
            self.inner.pool.release(old);
        }

        self.inner
            .received_bytes
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.inner.received_packets.fetch_add(1, Ordering::Relaxed);

        self.notify(InputEvent::DataAvailable);
    }

    fn notify(&self, event: InputEvent) {
        let consumer = self.inner.consumer.lock().clone();
        if let Some(consumer) = consumer {
            consumer.on_event(self, event);
        }
    }
}
