use std::fmt;

use serde::{Deserialize, Serialize};

const DIRECTION_SENDRECV_STR: &str = "sendrecv";
const DIRECTION_SENDONLY_STR: &str = "sendonly";
const DIRECTION_RECVONLY_STR: &str = "recvonly";
const DIRECTION_INACTIVE_STR: &str = "inactive";

/// Direction of media flow of a stream, or of a header extension binding.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaDirection {
    #[default]
    Inactive,
    SendOnly,
    RecvOnly,
    SendRecv,
}

impl From<&str> for MediaDirection {
    fn from(raw: &str) -> Self {
        match raw {
            DIRECTION_SENDRECV_STR => MediaDirection::SendRecv,
            DIRECTION_SENDONLY_STR => MediaDirection::SendOnly,
            DIRECTION_RECVONLY_STR => MediaDirection::RecvOnly,
            _ => MediaDirection::Inactive,
        }
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            MediaDirection::SendRecv => DIRECTION_SENDRECV_STR,
            MediaDirection::SendOnly => DIRECTION_SENDONLY_STR,
            MediaDirection::RecvOnly => DIRECTION_RECVONLY_STR,
            MediaDirection::Inactive => DIRECTION_INACTIVE_STR,
        };
        write!(f, "{s}")
    }
}

impl MediaDirection {
    pub fn from_send_recv(send: bool, recv: bool) -> MediaDirection {
        match (send, recv) {
            (true, true) => Self::SendRecv,
            (true, false) => Self::SendOnly,
            (false, true) => Self::RecvOnly,
            (false, false) => Self::Inactive,
        }
    }

    pub fn allows_sending(&self) -> bool {
        matches!(self, Self::SendRecv | Self::SendOnly)
    }

    pub fn allows_receiving(&self) -> bool {
        matches!(self, Self::SendRecv | Self::RecvOnly)
    }

    /// Adds the halves of `other` to this direction.
    pub fn or(&self, other: MediaDirection) -> MediaDirection {
        Self::from_send_recv(
            self.allows_sending() || other.allows_sending(),
            self.allows_receiving() || other.allows_receiving(),
        )
    }

    /// Removes the halves of `other` from this direction.
    pub fn and_not(&self, other: MediaDirection) -> MediaDirection {
        Self::from_send_recv(
            self.allows_sending() && !other.allows_sending(),
            self.allows_receiving() && !other.allows_receiving(),
        )
    }

    /// Returns the opposite direction, swapping send-only with receive-only.
    pub fn reverse(&self) -> MediaDirection {
        match *self {
            Self::SendOnly => Self::RecvOnly,
            Self::RecvOnly => Self::SendOnly,
            _ => *self,
        }
    }
}

/// The two flows statistics are kept for.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamDirection {
    /// Inbound media, from the remote peer.
    Download,
    /// Outbound media, towards the remote peer.
    Upload,
}

impl StreamDirection {
    pub(crate) fn index(&self) -> usize {
        match self {
            StreamDirection::Download => 0,
            StreamDirection::Upload => 1,
        }
    }
}

impl fmt::Display for StreamDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDirection::Download => write!(f, "download"),
            StreamDirection::Upload => write!(f, "upload"),
        }
    }
}
