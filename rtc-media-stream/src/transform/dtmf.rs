//! Out-of-band DTMF (RFC 4733 telephone-event). While a tone is active the
//! payload of outgoing audio packets is replaced by event payloads.

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use log::{debug, trace};
use parking_lot::Mutex;
use shared::error::Result;

use super::{PayloadTypeMap, TransformStage};
use crate::packet::RawPacket;

/// Volume used when the caller does not give one, in -dBm0.
pub const DEFAULT_DTMF_VOLUME: u8 = 10;

const MAX_VOLUME: u8 = 0x3F;
/// Retransmissions of the final event packet (RFC 4733 section 2.5.1.4).
const END_PACKETS: u8 = 3;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DtmfTone {
    Digit0,
    Digit1,
    Digit2,
    Digit3,
    Digit4,
    Digit5,
    Digit6,
    Digit7,
    Digit8,
    Digit9,
    Star,
    Pound,
    A,
    B,
    C,
    D,
}

impl DtmfTone {
    pub fn from_char(c: char) -> Option<Self> {
        Some(match c {
            '0' => Self::Digit0,
            '1' => Self::Digit1,
            '2' => Self::Digit2,
            '3' => Self::Digit3,
            '4' => Self::Digit4,
            '5' => Self::Digit5,
            '6' => Self::Digit6,
            '7' => Self::Digit7,
            '8' => Self::Digit8,
            '9' => Self::Digit9,
            '*' => Self::Star,
            '#' => Self::Pound,
            'A' | 'a' => Self::A,
            'B' | 'b' => Self::B,
            'C' | 'c' => Self::C,
            'D' | 'd' => Self::D,
            _ => return None,
        })
    }

    pub fn to_char(self) -> char {
        match self {
            Self::Digit0 => '0',
            Self::Digit1 => '1',
            Self::Digit2 => '2',
            Self::Digit3 => '3',
            Self::Digit4 => '4',
            Self::Digit5 => '5',
            Self::Digit6 => '6',
            Self::Digit7 => '7',
            Self::Digit8 => '8',
            Self::Digit9 => '9',
            Self::Star => '*',
            Self::Pound => '#',
            Self::A => 'A',
            Self::B => 'B',
            Self::C => 'C',
            Self::D => 'D',
        }
    }

    /// Event code of the tone in the telephone-event registry.
    pub fn event_code(self) -> u8 {
        match self {
            Self::Digit0 => 0,
            Self::Digit1 => 1,
            Self::Digit2 => 2,
            Self::Digit3 => 3,
            Self::Digit4 => 4,
            Self::Digit5 => 5,
            Self::Digit6 => 6,
            Self::Digit7 => 7,
            Self::Digit8 => 8,
            Self::Digit9 => 9,
            Self::Star => 10,
            Self::Pound => 11,
            Self::A => 12,
            Self::B => 13,
            Self::C => 14,
            Self::D => 15,
        }
    }
}

impl fmt::Display for DtmfTone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_char())
    }
}

/// Payload of one telephone-event packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TelephoneEvent {
    pub event: u8,
    pub end: bool,
    pub volume: u8,
    pub duration: u16,
}

impl TelephoneEvent {
    pub fn marshal(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4);
        buf.put_u8(self.event);
        let mut flags = self.volume & MAX_VOLUME;
        if self.end {
            flags |= 0x80;
        }
        buf.put_u8(flags);
        buf.put_u16(self.duration);
        buf
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(shared::error::Error::ErrShortBuffer);
        }
        Ok(Self {
            event: raw[0],
            end: raw[1] & 0x80 != 0,
            volume: raw[1] & MAX_VOLUME,
            duration: u16::from_be_bytes([raw[2], raw[3]]),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DtmfRequest {
    Start { tone: DtmfTone, volume: u8 },
    Stop,
}

#[derive(Debug, Copy, Clone)]
struct ActiveTone {
    tone: DtmfTone,
    volume: u8,
    start_timestamp: u32,
    duration: u16,
    /// End packets still to send, once stopping.
    ending: Option<u8>,
}

#[derive(Debug, Default)]
struct DtmfState {
    requests: VecDeque<DtmfRequest>,
    active: Option<ActiveTone>,
}

/// Start/stop handle shared by the audio stream and its DTMF stage.
#[derive(Debug, Clone, Default)]
pub struct DtmfControl {
    state: Arc<Mutex<DtmfState>>,
}

impl DtmfControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_sending(&self, tone: DtmfTone) {
        self.start_sending_with_volume(tone, DEFAULT_DTMF_VOLUME);
    }

    pub fn start_sending_with_volume(&self, tone: DtmfTone, volume: u8) {
        debug!("dtmf start {tone}");
        self.state.lock().requests.push_back(DtmfRequest::Start {
            tone,
            volume: volume.min(MAX_VOLUME),
        });
    }

    /// Ends the current tone. A stop with no tone started or queued is
    /// ignored.
    pub fn stop_sending(&self) {
        let mut state = self.state.lock();
        let started = state.active.is_some()
            || state
                .requests
                .iter()
                .any(|r| matches!(r, DtmfRequest::Start { .. }));
        if started {
            state.requests.push_back(DtmfRequest::Stop);
        }
    }

    /// A tone is being sent or waits to be sent.
    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        state.active.is_some() || !state.requests.is_empty()
    }

    /// Event payload replacing the packet sent at `timestamp`, if any.
    fn next_event(&self, timestamp: u32) -> Option<(TelephoneEvent, u32, bool)> {
        let mut state = self.state.lock();

        let mut first = false;
        if state.active.is_none() {
            match state.requests.pop_front()? {
                DtmfRequest::Start { tone, volume } => {
                    state.active = Some(ActiveTone {
                        tone,
                        volume,
                        start_timestamp: timestamp,
                        duration: 0,
                        ending: None,
                    });
                    first = true;
                }
                DtmfRequest::Stop => return None,
            }
        } else if state.requests.front() == Some(&DtmfRequest::Stop) {
            state.requests.pop_front();
            if let Some(active) = state.active.as_mut()
                && active.ending.is_none()
            {
                active.ending = Some(END_PACKETS);
            }
        }

        let active = state.active.as_mut()?;
        let end = match active.ending.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                true
            }
            None => {
                let elapsed = timestamp.wrapping_sub(active.start_timestamp);
                active.duration = elapsed.min(u16::MAX as u32) as u16;
                false
            }
        };
        let event = TelephoneEvent {
            event: active.tone.event_code(),
            end,
            volume: active.volume,
            duration: active.duration,
        };
        let start_timestamp = active.start_timestamp;
        if active.ending == Some(0) {
            trace!("dtmf {} ended after {} units", active.tone, active.duration);
            state.active = None;
        }
        Some((event, start_timestamp, first))
    }
}

/// Sends queued tones in place of outgoing audio.
#[derive(Debug)]
pub struct DtmfTransformer {
    control: DtmfControl,
    payload_type: Option<u8>,
}

impl DtmfTransformer {
    pub fn new(control: DtmfControl) -> Self {
        Self {
            control,
            payload_type: None,
        }
    }

    pub fn control(&self) -> DtmfControl {
        self.control.clone()
    }

    fn rewrite(&self, pkt: RawPacket, payload_type: u8) -> Result<RawPacket> {
        let Some((event, start_timestamp, first)) = self.control.next_event(pkt.timestamp())
        else {
            return Ok(pkt);
        };

        let mut rtp = pkt.to_rtp()?;
        rtp.header.payload_type = payload_type;
        rtp.header.timestamp = start_timestamp;
        rtp.header.marker = first;
        rtp.header.padding = false;
        rtp.padding_size = 0;
        rtp.payload = event.marshal().freeze();
        RawPacket::from_rtp(&rtp, pkt.now)
    }
}

impl TransformStage for DtmfTransformer {
    fn name(&self) -> &'static str {
        "dtmf"
    }

    fn transform_rtp(&mut self, pkts: Vec<RawPacket>) -> Result<Vec<RawPacket>> {
        let Some(payload_type) = self.payload_type else {
            return Ok(pkts);
        };
        pkts.into_iter()
            .map(|pkt| self.rewrite(pkt, payload_type))
            .collect()
    }

    fn bind_payload_types(&mut self, payload_types: &PayloadTypeMap) {
        self.payload_type = payload_types
            .iter()
            .find(|(_, format)| format.is_telephone_event())
            .map(|(pt, _)| *pt);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{MediaFormat, MediaType, TELEPHONE_EVENT_ENCODING};
    use crate::transform::test_util::make_raw_rtp;

    fn stage() -> DtmfTransformer {
        let mut stage = DtmfTransformer::new(DtmfControl::new());
        let mut map = PayloadTypeMap::new();
        map.insert(0, MediaFormat::new("PCMU", 8000, MediaType::Audio));
        map.insert(
            101,
            MediaFormat::new(TELEPHONE_EVENT_ENCODING, 8000, MediaType::Audio),
        );
        stage.bind_payload_types(&map);
        stage
    }

    fn send(stage: &mut DtmfTransformer, seq: u16) -> RawPacket {
        let mut out = stage
            .transform_rtp(vec![make_raw_rtp(0, seq, 0x1, &[0xD5; 160])])
            .unwrap();
        out.remove(0)
    }

    #[test]
    fn test_dtmf_tone_codes() {
        let tests = vec![
            ('0', Some(0u8)),
            ('9', Some(9)),
            ('*', Some(10)),
            ('#', Some(11)),
            ('a', Some(12)),
            ('D', Some(15)),
            ('x', None),
        ];

        for (c, expected) in tests {
            assert_eq!(
                DtmfTone::from_char(c).map(DtmfTone::event_code),
                expected,
                "char {c}"
            );
        }
        assert_eq!(DtmfTone::Pound.to_string(), "#");
    }

    #[test]
    fn test_telephone_event_payload() -> Result<()> {
        let event = TelephoneEvent {
            event: 11,
            end: true,
            volume: 10,
            duration: 800,
        };
        let raw = event.marshal();
        assert_eq!(&raw[..], &[11, 0x8A, 0x03, 0x20]);
        assert_eq!(TelephoneEvent::unmarshal(&raw)?, event);
        assert!(TelephoneEvent::unmarshal(&raw[..3]).is_err());
        Ok(())
    }

    #[test]
    fn test_dtmf_tone_replaces_audio() -> Result<()> {
        let mut stage = stage();
        let control = stage.control();

        assert_eq!(send(&mut stage, 1).payload_type(), 0);

        control.start_sending(DtmfTone::Digit5);
        assert!(control.is_active());

        let first = send(&mut stage, 2);
        assert_eq!(first.payload_type(), 101);
        assert!(first.is_marker());
        assert_eq!(first.timestamp(), 320);
        let event = TelephoneEvent::unmarshal(first.payload())?;
        assert_eq!((event.event, event.end, event.duration), (5, false, 0));

        let second = send(&mut stage, 3);
        assert!(!second.is_marker());
        assert_eq!(second.timestamp(), 320);
        assert_eq!(TelephoneEvent::unmarshal(second.payload())?.duration, 160);

        control.stop_sending();
        for seq in 4..7 {
            let end = send(&mut stage, seq);
            assert_eq!(end.sequence_number(), seq);
            assert_eq!(end.timestamp(), 320);
            let event = TelephoneEvent::unmarshal(end.payload())?;
            assert!(event.end);
            assert_eq!(event.duration, 160);
        }
        assert!(!control.is_active());

        let audio = send(&mut stage, 7);
        assert_eq!(audio.payload_type(), 0);
        assert_eq!(audio.payload().len(), 160);
        Ok(())
    }

    #[test]
    fn test_dtmf_without_telephone_event() {
        let mut stage = DtmfTransformer::new(DtmfControl::new());
        stage.control().start_sending(DtmfTone::Star);
        let pkt = make_raw_rtp(0, 1, 0x1, &[0; 4]);
        let out = stage.transform_rtp(vec![pkt.clone()]).unwrap();
        assert_eq!(out, vec![pkt]);
    }

    #[test]
    fn test_dtmf_stop_without_start_is_ignored() {
        let control = DtmfControl::new();
        control.stop_sending();
        assert!(!control.is_active());
    }
}
