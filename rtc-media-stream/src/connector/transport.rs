//! Blocking datagram transports the connector streams read from and write to.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use shared::TransportProtocol;
use shared::tcp_framing::{FrameDecoder, MAX_FRAMED_PACKET_SIZE, encode_frame};

/// A bound endpoint carrying whole RTP or RTCP packets.
///
/// `recv` blocks for at most the configured read timeout and reports an
/// expiry as `WouldBlock` or `TimedOut`. After `close` every call fails.
pub trait PacketTransport: Send + Sync {
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;
    fn close(&self) -> io::Result<()>;
    fn local_addr(&self) -> io::Result<SocketAddr>;

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::UDP
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport closed")
}

/// UDP socket with a read timeout, so a closed transport is noticed by the
/// receive loop within one timeout period.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr, read_timeout: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        Self::from_socket(socket, read_timeout)
    }

    pub fn from_socket(socket: UdpSocket, read_timeout: Duration) -> io::Result<Self> {
        socket.set_read_timeout(Some(read_timeout))?;
        Ok(Self {
            socket,
            closed: AtomicBool::new(false),
        })
    }
}

impl PacketTransport for UdpTransport {
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        let result = self.socket.recv_from(buf);
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        result
    }

    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        self.socket.send_to(buf, target)
    }

    fn close(&self) -> io::Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

/// A connected TCP stream carrying RFC 4571 length-framed packets.
///
/// The stream has a single peer, so `send_to` ignores its target.
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    decoder: Mutex<FrameDecoder>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn connect(addr: SocketAddr, read_timeout: Duration) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        Self::from_stream(stream, read_timeout)
    }

    pub fn from_stream(stream: TcpStream, read_timeout: Duration) -> io::Result<Self> {
        stream.set_read_timeout(Some(read_timeout))?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            decoder: Mutex::new(FrameDecoder::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl PacketTransport for TcpTransport {
    fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut decoder = self.decoder.lock();
        let mut chunk = [0u8; 2048];
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(closed_error());
            }
            if let Some(frame) = decoder.next_frame() {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                return Ok((n, self.peer));
            }

            let n = (&self.stream).read(&mut chunk)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "tcp peer closed the stream",
                ));
            }
            decoder.feed(&chunk[..n]);
        }
    }

    fn send_to(&self, buf: &[u8], _target: SocketAddr) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        if buf.len() > MAX_FRAMED_PACKET_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "packet too large for rfc 4571 framing",
            ));
        }
        let mut out = BytesMut::with_capacity(buf.len() + 2);
        encode_frame(buf, &mut out).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        (&self.stream).write_all(&out)?;
        Ok(buf.len())
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn protocol(&self) -> TransportProtocol {
        TransportProtocol::TCP
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn test_udp_transport_loopback() -> io::Result<()> {
        let any = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let a = UdpTransport::bind(any, Duration::from_millis(500))?;
        let b = UdpTransport::bind(any, Duration::from_millis(500))?;

        a.send_to(&[1, 2, 3], b.local_addr()?)?;
        let mut buf = [0u8; 16];
        let (n, from) = b.recv(&mut buf)?;
        assert_eq!(&buf[..n], &[1, 2, 3]);
        assert_eq!(from, a.local_addr()?);

        b.close()?;
        assert_eq!(
            b.recv(&mut buf).map_err(|e| e.kind()).err(),
            Some(io::ErrorKind::NotConnected)
        );
        Ok(())
    }

    #[test]
    fn test_tcp_transport_framing() -> io::Result<()> {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        let client = TcpTransport::connect(listener.local_addr()?, Duration::from_millis(500))?;
        let (accepted, _) = listener.accept()?;
        let server = TcpTransport::from_stream(accepted, Duration::from_millis(500))?;

        client.send_to(&[0x80, 0x60, 0x00, 0x01], server.local_addr()?)?;
        client.send_to(&[0x81, 0xc9], server.local_addr()?)?;

        let mut buf = [0u8; 16];
        let (n, _) = server.recv(&mut buf)?;
        assert_eq!(&buf[..n], &[0x80, 0x60, 0x00, 0x01]);
        let (n, from) = server.recv(&mut buf)?;
        assert_eq!(&buf[..n], &[0x81, 0xc9]);
        assert_eq!(from, client.local_addr()?);
        assert_eq!(server.protocol(), TransportProtocol::TCP);

        client.close()?;
        assert!(server.recv(&mut buf).is_err());
        Ok(())
    }
}
