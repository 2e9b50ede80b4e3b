//! Wire codec.
//!
//! Binary encoding for the fixed set of value shapes the replication layer
//! transmits, plus the outer message frame:
//!
//! ```text
//! [5B "::S::"][1B message type][4B BE payload length][payload][5B "::E::"]
//! ```
//!
//! Integers are fixed width big-endian. Floats are sent as their IEEE-754 bit
//! pattern, so NaN payloads and infinities survive unchanged. There is no
//! version negotiation: both peers run the same build.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use crate::{
    error::{DecodeError, FrameError},
    math::{Quat, Vec3},
};

/// Start-of-frame marker.
pub const START_SIGNATURE: [u8; 5] = *b"::S::";
/// End-of-frame marker.
pub const END_SIGNATURE: [u8; 5] = *b"::E::";
/// Start signature + type byte + length.
pub const HEADER_LEN: usize = START_SIGNATURE.len() + 1 + 4;
/// Bytes added around every payload.
pub const FRAME_OVERHEAD: usize = HEADER_LEN + END_SIGNATURE.len();
/// Largest frame either peer will emit or accept.
pub const MAX_TRANSMISSION_SIZE: usize = 16 * 1024;
/// Largest payload that fits in one frame.
pub const MAX_PAYLOAD_SIZE: usize = MAX_TRANSMISSION_SIZE - FRAME_OVERHEAD;

/// Message type byte, the outermost routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Echoed back by the server, logged by the client.
    Debug = 0,
    Handshake = 1,
    Welcome = 2,
    Disconnect = 3,
    UpdateObject = 10,
    OwnerChanged = 11,
    SpawnObject = 21,
    DestroyObject = 22,
    SpawnComponent = 23,
    GameStarted = 24,
    ClientLoaded = 25,
    ReplayComplete = 26,
    ClientRequest = 100,
    ServerEvent = 110,
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> Self {
        kind as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = DecodeError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => MessageType::Debug,
            1 => MessageType::Handshake,
            2 => MessageType::Welcome,
            3 => MessageType::Disconnect,
            10 => MessageType::UpdateObject,
            11 => MessageType::OwnerChanged,
            21 => MessageType::SpawnObject,
            22 => MessageType::DestroyObject,
            23 => MessageType::SpawnComponent,
            24 => MessageType::GameStarted,
            25 => MessageType::ClientLoaded,
            26 => MessageType::ReplayComplete,
            100 => MessageType::ClientRequest,
            110 => MessageType::ServerEvent,
            other => return Err(DecodeError::UnknownMessageType(other)),
        })
    }
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(cap),
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Writes any wire value.
    pub fn put<T: WireValue>(&mut self, value: &T) {
        value.encode(self);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Bounds-checked cursor over a received payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn need(&self, needed: usize) -> Result<(), DecodeError> {
        if self.buf.len() < needed {
            return Err(DecodeError::Truncated {
                needed,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.need(2)?;
        Ok(self.buf.get_u16())
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32())
    }

    /// Splits off the next `n` bytes.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    /// Reads any wire value.
    pub fn read<T: WireValue>(&mut self) -> Result<T, DecodeError> {
        T::decode(self)
    }

    /// Fails if anything is left unread.
    pub fn finish(&self) -> Result<(), DecodeError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::TrailingBytes(self.buf.len()))
        }
    }
}

/// A value with a fixed binary representation.
pub trait WireValue: Sized {
    fn encode(&self, w: &mut Writer);
    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Encodes into a fresh buffer.
    fn to_wire(&self) -> Bytes {
        let mut w = Writer::new();
        self.encode(&mut w);
        w.into_bytes()
    }

    /// Decodes a complete buffer, rejecting trailing bytes.
    fn from_wire(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let v = Self::decode(&mut r)?;
        r.finish()?;
        Ok(v)
    }
}

macro_rules! wire_number {
    ($($t:ty => $put:ident, $get:ident;)*) => {
        $(
            impl WireValue for $t {
                fn encode(&self, w: &mut Writer) {
                    w.buf.$put(*self);
                }

                fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
                    r.need(std::mem::size_of::<$t>())?;
                    Ok(r.buf.$get())
                }
            }
        )*
    };
}

wire_number! {
    u8 => put_u8, get_u8;
    u16 => put_u16, get_u16;
    u32 => put_u32, get_u32;
    u64 => put_u64, get_u64;
    i8 => put_i8, get_i8;
    i16 => put_i16, get_i16;
    i32 => put_i32, get_i32;
    i64 => put_i64, get_i64;
    f32 => put_f32, get_f32;
    f64 => put_f64, get_f64;
}

impl WireValue for bool {
    fn encode(&self, w: &mut Writer) {
        w.put_u8(u8::from(*self));
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(r.read_u8()? != 0)
    }
}

impl WireValue for () {
    fn encode(&self, _w: &mut Writer) {}

    fn decode(_r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(())
    }
}

impl WireValue for String {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.len() as u32);
        w.put_slice(self.as_bytes());
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let len = r.read_u32()? as usize;
        let bytes = r.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }
}

impl<T: WireValue> WireValue for Vec<T> {
    fn encode(&self, w: &mut Writer) {
        w.put_u32(self.len() as u32);
        for item in self {
            item.encode(w);
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let count = r.read_u32()? as usize;
        // Every element takes at least one byte except `()`, so this only caps
        // the preallocation.
        let mut out = Vec::with_capacity(count.min(r.remaining()));
        for _ in 0..count {
            out.push(T::decode(r)?);
        }
        Ok(out)
    }
}

impl WireValue for Vec3 {
    fn encode(&self, w: &mut Writer) {
        self.x.encode(w);
        self.y.encode(w);
        self.z.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Vec3::new(r.read()?, r.read()?, r.read()?))
    }
}

impl WireValue for Quat {
    fn encode(&self, w: &mut Writer) {
        self.x.encode(w);
        self.y.encode(w);
        self.z.encode(w);
        self.w.encode(w);
    }

    fn decode(r: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Quat {
            x: r.read()?,
            y: r.read()?,
            z: r.read()?,
            w: r.read()?,
        })
    }
}

/// Wraps a payload in a frame.
///
/// Payloads above [`MAX_PAYLOAD_SIZE`] are a caller bug: debug builds panic,
/// release builds return [`FrameError::PayloadTooLarge`].
pub fn encode_frame(kind: impl Into<u8>, payload: &[u8]) -> Result<Bytes, FrameError> {
    debug_assert!(
        payload.len() <= MAX_PAYLOAD_SIZE,
        "frame payload of {} bytes exceeds {MAX_PAYLOAD_SIZE}",
        payload.len()
    );
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
    buf.put_slice(&START_SIGNATURE);
    buf.put_u8(kind.into());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.put_slice(&END_SIGNATURE);
    Ok(buf.freeze())
}

/// Verifies a single complete frame and returns its type byte and payload.
pub fn decode_frame(buf: &[u8]) -> Result<(u8, &[u8]), FrameError> {
    if buf.len() < FRAME_OVERHEAD {
        return Err(FrameError::TooShort(buf.len()));
    }
    let len = check_header(buf)?;
    let total = FRAME_OVERHEAD + len;
    if buf.len() < total {
        return Err(FrameError::LengthOverrun {
            declared: len,
            available: buf.len() - FRAME_OVERHEAD,
        });
    }
    if buf[HEADER_LEN + len..total] != END_SIGNATURE {
        return Err(FrameError::BadEndSignature);
    }
    Ok((buf[START_SIGNATURE.len()], &buf[HEADER_LEN..HEADER_LEN + len]))
}

/// Checks the start signature and returns the declared payload length.
fn check_header(buf: &[u8]) -> Result<usize, FrameError> {
    if buf[..START_SIGNATURE.len()] != START_SIGNATURE {
        return Err(FrameError::BadStartSignature);
    }
    let len_bytes = [buf[6], buf[7], buf[8], buf[9]];
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(FrameError::PayloadTooLarge(len));
    }
    Ok(len)
}

/// A verified frame lifted off the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub kind: u8,
    pub payload: Bytes,
}

impl RawFrame {
    pub fn message_type(&self) -> Result<MessageType, DecodeError> {
        MessageType::try_from(self.kind)
    }
}

/// Streaming frame decoder with resynchronization.
///
/// Frames failing verification are discarded whole and scanning resumes at
/// the next start signature. More than one [`MAX_TRANSMISSION_SIZE`] of bytes
/// discarded without a valid frame is a [`FrameError::Desync`].
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    discarded: usize,
    rejected_frames: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends raw stream bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read socket data into directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Frames dropped for failing verification so far.
    pub fn rejected_frames(&self) -> u64 {
        self.rejected_frames
    }

    /// Bytes buffered but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next verified frame, `None` if more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, FrameError> {
        loop {
            if !self.buf.starts_with(&START_SIGNATURE) {
                match find_signature(&self.buf) {
                    Some(pos) => {
                        debug!(skipped = pos, "resynchronizing frame stream");
                        self.discard(pos)?;
                    }
                    None => {
                        let keep = partial_signature_suffix(&self.buf);
                        let stale = self.buf.len() - keep;
                        self.discard(stale)?;
                        return Ok(None);
                    }
                }
            }

            if self.buf.len() < HEADER_LEN {
                return Ok(None);
            }

            let len = match check_header(&self.buf) {
                Ok(len) => len,
                Err(e) => {
                    warn!(error = %e, "discarding frame with bad header");
                    self.reject()?;
                    continue;
                }
            };

            let total = FRAME_OVERHEAD + len;
            if self.buf.len() < total {
                return Ok(None);
            }

            if self.buf[HEADER_LEN + len..total] != END_SIGNATURE {
                warn!(
                    error = %FrameError::BadEndSignature,
                    len,
                    "discarding frame"
                );
                self.reject()?;
                continue;
            }

            let mut frame = self.buf.split_to(total);
            let kind = frame[START_SIGNATURE.len()];
            frame.advance(HEADER_LEN);
            frame.truncate(len);
            self.discarded = 0;
            return Ok(Some(RawFrame {
                kind,
                payload: frame.freeze(),
            }));
        }
    }

    /// Drops the start byte of a bad frame so scanning resumes past it.
    fn reject(&mut self) -> Result<(), FrameError> {
        self.rejected_frames += 1;
        self.discard(1)
    }

    fn discard(&mut self, n: usize) -> Result<(), FrameError> {
        self.buf.advance(n);
        self.discarded += n;
        if self.discarded > MAX_TRANSMISSION_SIZE {
            let discarded = self.discarded;
            self.buf.clear();
            self.discarded = 0;
            return Err(FrameError::Desync(discarded));
        }
        Ok(())
    }
}

fn find_signature(buf: &[u8]) -> Option<usize> {
    buf.windows(START_SIGNATURE.len())
        .position(|w| w == START_SIGNATURE)
}

/// Length of the longest buffer suffix that could begin a start signature.
fn partial_signature_suffix(buf: &[u8]) -> usize {
    let max = (START_SIGNATURE.len() - 1).min(buf.len());
    (1..=max)
        .rev()
        .find(|&k| buf[buf.len() - k..] == START_SIGNATURE[..k])
        .unwrap_or(0)
}
