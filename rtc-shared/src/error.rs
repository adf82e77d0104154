#![allow(dead_code)]

use std::io;
use std::num::ParseIntError;
use std::time::SystemTimeError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, PartialEq)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer: full")]
    ErrBufferFull,
    #[error("buffer: short")]
    ErrBufferShort,
    #[error("buffer too small")]
    ErrBufferTooSmall,
    #[error("packet too big")]
    ErrPacketTooBig,
    #[error("i/o timeout")]
    ErrTimeout,
    #[error("use of closed network connection")]
    ErrUseClosedNetworkConn,
    #[error("unexpected end of stream")]
    ErrEndOfStream,

    // RTP errors
    #[error("RTP header size insufficient")]
    ErrHeaderSizeInsufficient,
    #[error("RTP header size insufficient for extension")]
    ErrHeaderSizeInsufficientForExtension,
    #[error("buffer too small")]
    ErrTooSmall,
    #[error("extension not enabled")]
    ErrHeaderExtensionsNotEnabled,
    #[error("extension not found")]
    ErrHeaderExtensionNotFound,
    #[error("header extension id must be between 1 and 14 for RFC 5285 one byte extensions")]
    ErrRfc8285OneByteHeaderIdRange,
    #[error("header extension payload must be 16bytes or less for RFC 5285 one byte extensions")]
    ErrRfc8285OneByteHeaderSize,
    #[error("header extension id must be between 1 and 255 for RFC 5285 two byte extensions")]
    ErrRfc8285TwoByteHeaderIdRange,
    #[error("header extension payload must be 255bytes or less for RFC 5285 two byte extensions")]
    ErrRfc8285TwoByteHeaderSize,
    #[error("header extension id must be 0 for non-RFC 5285 extensions")]
    ErrRfc3550HeaderIdRange,
    #[error("extension_payload must be in 32-bit words")]
    ErrHeaderExtensionPayloadNot32BitWords,
    #[error("packet is not large enough")]
    ErrShortPacket,
    #[error("invalid nil packet")]
    ErrNilPacket,
    #[error("too many CSRC identifiers")]
    ErrTooManyCsrcs,
    #[error("payload is not large enough")]
    ErrPayloadTooSmall,
    #[error("padding size is invalid")]
    ErrWrongPaddingSize,

    // RTCP errors
    #[error("wrong marshal size")]
    ErrWrongMarshalSize,
    #[error("invalid total lost count")]
    ErrInvalidTotalLost,
    #[error("invalid header")]
    ErrInvalidHeader,
    #[error("empty compound packet")]
    ErrEmptyCompound,
    #[error("first packet in compound must be SR or RR")]
    ErrBadFirstPacket,
    #[error("SSRC must be 0 or 1")]
    ErrSsrcNumAndLengthMismatch,
    #[error("too many reports")]
    ErrTooManyReports,
    #[error("too many chunks")]
    ErrTooManyChunks,
    #[error("too many sources")]
    ErrTooManySources,
    #[error("packet status chunk must be 2 bytes")]
    ErrPacketTooShort,
    #[error("wrong packet type")]
    ErrWrongType,
    #[error("reason must be < 255 octets long")]
    ErrReasonTooLong,
    #[error("invalid packet version")]
    ErrBadVersion,
    #[error("invalid padding value")]
    ErrWrongPadding,
    #[error("wrong feedback message type")]
    ErrWrongFeedbackType,
    #[error("wrong payload type")]
    ErrWrongPayloadType,
    #[error("header length is too small")]
    ErrHeaderTooSmall,
    #[error("media SSRC must be 0")]
    ErrSsrcMustBeZero,
    #[error("missing REMB identifier")]
    ErrMissingRembIdentifier,
    #[error("SSRC num and length do not match")]
    ErrSsrcNumAndLengthMismatchRemb,
    #[error("invalid size or start index")]
    ErrInvalidSizeOrStartIndex,
    #[error("invalid bitrate")]
    ErrInvalidBitrate,

    // media stream errors
    #[error("media stream: closed")]
    ErrStreamClosed,
    #[error("media stream: local SSRC cannot change while a send stream exists")]
    ErrLocalSsrcLocked,
    #[error("media stream: connector is not set")]
    ErrConnectorNotSet,
    #[error("media stream: no such receive stream")]
    ErrNoSuchReceiveStream,
    #[error("media stream: packet pool capacity must be greater than zero")]
    ErrInvalidPoolCapacity,
    #[error("media stream: destination buffer is shorter than the pending packet")]
    ErrShortBuffer,
    #[error("media stream: transform failed: {0}")]
    ErrTransformFailed(String),
    #[error("media stream: negotiation failed: {0}")]
    ErrNegotiation(String),

    #[error("parse int: {0}")]
    ParseInt(#[from] ParseIntError),
    #[error("{0}")]
    Io(#[source] IoError),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Error)]
#[error("io error: {0}")]
pub struct IoError(#[from] pub io::Error);

// Workaround for wanting PartialEq for io::Error.
impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(IoError(e))
    }
}

impl From<SystemTimeError> for Error {
    fn from(e: SystemTimeError) -> Self {
        Error::Other(e.to_string())
    }
}

/// flatten_errs flattens multiple errors into one
pub fn flatten_errs(errs: Vec<impl Into<Error>>) -> Result<()> {
    if errs.is_empty() {
        Ok(())
    } else {
        let errs_strs: Vec<String> = errs.into_iter().map(|e| e.into().to_string()).collect();
        Err(Error::Other(errs_strs.join("\n")))
    }
}
