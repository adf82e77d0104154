//! Packet classification and sequence number arithmetic.

/// Half of the 16-bit sequence number space, the RFC 3550 wraparound threshold.
pub const SEQ_NUM_HALF: u16 = 1 << 15;

/// First octet of RTP and RTCP in the RFC 7983 demultiplexing scheme.
pub fn match_rtp_or_rtcp(b: &[u8]) -> bool {
    matches!(b.first(), Some(128..=191))
}

/// RTCP packet types occupy 192..=223 in the second octet (RFC 5761).
pub fn is_rtcp(buf: &[u8]) -> bool {
    // Not long enough to determine RTP/RTCP
    if buf.len() < 4 {
        return false;
    }

    let rtcp_packet_type = buf[1];
    (192..=223).contains(&rtcp_packet_type)
}

pub fn is_rtp(buf: &[u8]) -> bool {
    buf.len() >= 12 && match_rtp_or_rtcp(buf) && !is_rtcp(buf)
}

/// Returns true when `a` is newer than `b` in modulo-2^16 arithmetic.
pub fn is_newer_seq(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    diff != 0 && diff < SEQ_NUM_HALF
}
