use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{error, trace};
use parking_lot::RwLock;
use shared::error::{Error, IoError, Result};

use super::transport::PacketTransport;

struct OutputInner {
    transport: RwLock<Option<Arc<dyn PacketTransport>>>,
    targets: RwLock<Vec<SocketAddr>>,
    sent_bytes: AtomicU64,
    sent_packets: AtomicU64,
    failed: AtomicBool,
    closed: AtomicBool,
}

/// Send side of one connector channel, fanning each packet out to every
/// target. A send error fails this output only.
#[derive(Clone)]
pub struct RtpConnectorOutputStream {
    inner: Arc<OutputInner>,
}

impl fmt::Debug for RtpConnectorOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpConnectorOutputStream")
            .field("targets", &*self.inner.targets.read())
            .field("sent_packets", &self.number_of_sent_packets())
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl Default for RtpConnectorOutputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl RtpConnectorOutputStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(OutputInner {
                transport: RwLock::new(None),
                targets: RwLock::new(vec![]),
                sent_bytes: AtomicU64::new(0),
                sent_packets: AtomicU64::new(0),
                failed: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_transport(&self, transport: Arc<dyn PacketTransport>) {
        *self.inner.transport.write() = Some(transport);
    }

    pub fn add_target(&self, target: SocketAddr) {
        let mut targets = self.inner.targets.write();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    pub fn remove_target(&self, target: SocketAddr) -> bool {
        let mut targets = self.inner.targets.write();
        let before = targets.len();
        targets.retain(|t| *t != target);
        before != targets.len()
    }

    pub fn remove_targets(&self) {
        self.inner.targets.write().clear();
    }

    pub fn targets(&self) -> Vec<SocketAddr> {
        self.inner.targets.read().clone()
    }

    /// Sends `buf` to every target.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ErrStreamClosed);
        }
        if self.is_failed() {
            return Err(Error::ErrEndOfStream);
        }
        let transport = self
            .inner
            .transport
            .read()
            .clone()
            .ok_or(Error::ErrConnectorNotSet)?;

        for target in self.inner.targets.read().iter() {
            match transport.send_to(buf, *target) {
                Ok(n) => {
                    trace!("sent {} bytes to {}", n, target);
                    self.inner
                        .sent_bytes
                        .fetch_add(n as u64, Ordering::Relaxed);
                    self.inner.sent_packets.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    error!("sending to {} failed: {}", target, err);
                    self.inner.failed.store(true, Ordering::Release);
                    return Err(Error::Io(IoError(err)));
                }
            }
        }
        Ok(buf.len())
    }

    pub fn number_of_sent_bytes(&self) -> u64 {
        self.inner.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn number_of_sent_packets(&self) -> u64 {
        self.inner.sent_packets.load(Ordering::Relaxed)
    }

    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.transport.write().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::transport::mock::MockTransport;
    use std::net::Ipv4Addr;

    #[test]
    fn test_output_stream_fans_out() -> Result<()> {
        let (transport, _tx) = MockTransport::new();
        let transport = Arc::new(transport);
        let output = RtpConnectorOutputStream::new();
        output.set_transport(transport.clone());

        let a = SocketAddr::from((Ipv4Addr::LOCALHOST, 1000));
        let b = SocketAddr::from((Ipv4Addr::LOCALHOST, 1002));
        output.add_target(a);
        output.add_target(b);
        output.add_target(a);

        output.write(&[1, 2, 3])?;
        assert_eq!(output.number_of_sent_packets(), 2);
        assert_eq!(output.number_of_sent_bytes(), 6);

        let sent: Vec<SocketAddr> = transport.sent.lock().iter().map(|(_, t)| *t).collect();
        assert_eq!(sent, vec![a, b]);

        assert!(output.remove_target(b));
        assert!(!output.remove_target(b));
        assert_eq!(output.targets(), vec![a]);
        Ok(())
    }

    #[test]
    fn test_output_stream_failure_is_sticky() {
        let (transport, _tx) = MockTransport::new();
        let transport = Arc::new(transport);
        let output = RtpConnectorOutputStream::new();
        output.set_transport(transport.clone());
        output.add_target(MockTransport::peer());

        transport.close().unwrap();
        assert!(matches!(output.write(&[1]), Err(Error::Io(_))));
        assert!(output.is_failed());
        assert_eq!(output.write(&[1]), Err(Error::ErrEndOfStream));
    }

    #[test]
    fn test_output_stream_without_transport() {
        let output = RtpConnectorOutputStream::new();
        assert_eq!(output.write(&[1]), Err(Error::ErrConnectorNotSet));
        output.close();
        assert_eq!(output.write(&[1]), Err(Error::ErrStreamClosed));
    }
}
