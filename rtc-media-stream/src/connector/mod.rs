//! Packet I/O of a media stream: a data (RTP) and a control (RTCP) channel,
//! each with an input stream read by a dedicated thread and an output stream
//! written by the caller.

pub mod input_stream;
pub mod output_stream;
pub mod transport;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use shared::TransportProtocol;
use shared::error::Result;

use crate::config::MediaStreamConfig;
use crate::packet::{PacketKind, PacketPool};

pub use input_stream::{
    DatagramFilter, InputEvent, PacketConsumer, RtpConnectorInputStream, StreamKind,
};
pub use output_stream::RtpConnectorOutputStream;
pub use transport::{PacketTransport, TcpTransport, UdpTransport};

/// Transport flavour of a connector. Changing it rebuilds the transform chain.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    Udp,
    Tcp,
}

impl From<TransportProtocol> for ConnectorKind {
    fn from(protocol: TransportProtocol) -> Self {
        match protocol {
            TransportProtocol::UDP => ConnectorKind::Udp,
            TransportProtocol::TCP => ConnectorKind::Tcp,
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorKind::Udp => write!(f, "udp"),
            ConnectorKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Both channels of a media stream.
#[derive(Clone)]
pub struct RtpConnector {
    kind: ConnectorKind,
    data_input: RtpConnectorInputStream,
    control_input: RtpConnectorInputStream,
    data_output: RtpConnectorOutputStream,
    control_output: RtpConnectorOutputStream,
}

impl fmt::Debug for RtpConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtpConnector")
            .field("kind", &self.kind)
            .field("data_input", &self.data_input)
            .field("control_input", &self.control_input)
            .finish()
    }
}

impl RtpConnector {
    /// Creates a connector over two transports, one per channel. Both input
    /// streams share `pool`.
    pub fn new(
        data: Arc<dyn PacketTransport>,
        control: Arc<dyn PacketTransport>,
        pool: PacketPool,
        config: &MediaStreamConfig,
    ) -> Result<Self> {
        let kind = ConnectorKind::from(data.protocol());

        let data_input = RtpConnectorInputStream::new(StreamKind::Data, pool.clone(), config);
        let control_input = RtpConnectorInputStream::new(StreamKind::Control, pool, config);
        data_input.set_transport(Arc::clone(&data))?;
        control_input.set_transport(Arc::clone(&control))?;

        let data_output = RtpConnectorOutputStream::new();
        data_output.set_transport(data);
        let control_output = RtpConnectorOutputStream::new();
        control_output.set_transport(control);

        Ok(Self {
            kind,
            data_input,
            control_input,
            data_output,
            control_output,
        })
    }

    pub fn kind(&self) -> ConnectorKind {
        self.kind
    }

    pub fn data_input_stream(&self) -> &RtpConnectorInputStream {
        &self.data_input
    }

    pub fn control_input_stream(&self) -> &RtpConnectorInputStream {
        &self.control_input
    }

    pub fn data_output_stream(&self) -> &RtpConnectorOutputStream {
        &self.data_output
    }

    pub fn control_output_stream(&self) -> &RtpConnectorOutputStream {
        &self.control_output
    }

    pub fn input_stream(&self, kind: PacketKind) -> &RtpConnectorInputStream {
        match kind {
            PacketKind::Rtp => &self.data_input,
            PacketKind::Rtcp => &self.control_input,
        }
    }

    pub fn output_stream(&self, kind: PacketKind) -> &RtpConnectorOutputStream {
        match kind {
            PacketKind::Rtp => &self.data_output,
            PacketKind::Rtcp => &self.control_output,
        }
    }

    /// Adds a remote peer for both channels.
    pub fn add_target(&self, data: SocketAddr, control: SocketAddr) {
        self.data_output.add_target(data);
        self.control_output.add_target(control);
    }

    pub fn remove_targets(&self) {
        self.data_output.remove_targets();
        self.control_output.remove_targets();
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.data_input.set_enabled(enabled);
        self.control_input.set_enabled(enabled);
    }

    pub fn close(&self) {
        self.data_input.close();
        self.control_input.close();
        self.data_output.close();
        self.control_output.close();
    }
}
