//! Binary frame codec for the room wire protocol.
//!
//! Wire format:
//! ```text
//! ┌──────────┬────────────────┬──────────┐
//! │ kind     │ payload length │ payload  │
//! │ 1 byte   │ LEB128 varint  │ variable │
//! └──────────┴────────────────┴──────────┘
//! ```
//!
//! The decoder buffers partial reads and yields a frame only once its whole
//! payload has arrived. Frames with an unknown kind are skipped so newer
//! peers can add kinds without breaking older ones.
//!
//! The varint length is the same LEB128 the Yjs sync protocol uses, so a
//! 64-byte keystroke update costs two bytes of framing. Payloads are split
//! off the read buffer as `Bytes` without copying.
//!
//! Reference: Kleppmann, *Designing Data-Intensive Applications*, ch. 4
//! (encoding and evolution: unknown fields must be skippable).

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::DecodeError;

/// Default upper bound on a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// LEB128 encoding of a u64 never exceeds 10 bytes.
const MAX_VARINT_LEN: usize = 10;

/// Frame kinds of the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Sender's state vector; the receiver answers with a `SyncStep2`.
    SyncStep1 = 0,
    /// Delta answering a `SyncStep1`.
    SyncStep2 = 1,
    /// Incremental CRDT update.
    Update = 2,
    /// Ephemeral presence payload.
    Awareness = 3,
    /// Authorization outcome sent by the relay.
    Auth = 4,
}

impl FrameKind {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::SyncStep1),
            1 => Some(Self::SyncStep2),
            2 => Some(Self::Update),
            3 => Some(Self::Awareness),
            4 => Some(Self::Auth),
            _ => None,
        }
    }
}

/// First payload byte of an `Auth` frame denying access.
pub const AUTH_PERMISSION_DENIED: u8 = 0;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: impl Into<Bytes>) -> Self {
        Self { kind, payload: payload.into() }
    }

    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Self::new(FrameKind::SyncStep1, state_vector)
    }

    pub fn sync_step2(update: Vec<u8>) -> Self {
        Self::new(FrameKind::SyncStep2, update)
    }

    pub fn update(update: Vec<u8>) -> Self {
        Self::new(FrameKind::Update, update)
    }

    pub fn awareness(payload: Vec<u8>) -> Self {
        Self::new(FrameKind::Awareness, payload)
    }

    pub fn permission_denied(reason: &str) -> Self {
        let mut payload = Vec::with_capacity(reason.len() + 1);
        payload.push(AUTH_PERMISSION_DENIED);
        payload.extend_from_slice(reason.as_bytes());
        Self::new(FrameKind::Auth, payload)
    }

    /// Reason carried by a permission-denied `Auth` frame.
    pub fn denial_reason(&self) -> Option<String> {
        match (self.kind, self.payload.first()) {
            (FrameKind::Auth, Some(&AUTH_PERMISSION_DENIED)) => {
                Some(String::from_utf8_lossy(&self.payload[1..]).into_owned())
            }
            _ => None,
        }
    }

    /// Append the wire encoding to `dst`.
    pub fn encode_into(&self, dst: &mut BytesMut) {
        dst.reserve(1 + MAX_VARINT_LEN + self.payload.len());
        dst.put_u8(self.kind as u8);
        write_varint(dst, self.payload.len() as u64);
        dst.put_slice(&self.payload);
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + MAX_VARINT_LEN + self.payload.len());
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

/// Write `value` as unsigned LEB128.
pub fn write_varint(dst: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Read an unsigned LEB128 value from the front of `src`.
///
/// Returns `Ok(None)` if `src` ends before the varint does, otherwise the
/// value and the number of bytes it occupied.
pub fn read_varint(src: &[u8]) -> Result<Option<(u64, usize)>, DecodeError> {
    let mut value: u64 = 0;
    for (i, byte) in src.iter().enumerate() {
        if i >= MAX_VARINT_LEN {
            return Err(DecodeError::VarintOverflow);
        }
        let low = u64::from(byte & 0x7F);
        if i == MAX_VARINT_LEN - 1 && low > 1 {
            return Err(DecodeError::VarintOverflow);
        }
        value |= low << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if src.len() >= MAX_VARINT_LEN {
        return Err(DecodeError::VarintOverflow);
    }
    Ok(None)
}

/// Incremental frame decoder over a byte stream.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame_len: usize,
    skipped: u64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl FrameDecoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame_len,
            skipped: 0,
        }
    }

    /// Append bytes received from the transport.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Frames with an unknown kind skipped so far.
    pub fn skipped_frames(&self) -> u64 {
        self.skipped
    }

    /// Yield the next complete frame, if one is buffered.
    ///
    /// On error the buffer is discarded, since the frame boundary is lost.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, DecodeError> {
        loop {
            let Some(&tag) = self.buf.first() else {
                return Ok(None);
            };
            let (len, varint_len) = match read_varint(&self.buf[1..]) {
                Ok(Some(v)) => v,
                Ok(None) => return Ok(None),
                Err(e) => {
                    self.buf.clear();
                    return Err(e);
                }
            };
            if len > self.max_frame_len as u64 {
                self.buf.clear();
                return Err(DecodeError::FrameTooLarge { len, max: self.max_frame_len });
            }
            let header = 1 + varint_len;
            let total = header + len as usize;
            if self.buf.len() < total {
                return Ok(None);
            }

            self.buf.advance(header);
            let payload = self.buf.split_to(len as usize).freeze();

            match FrameKind::from_u8(tag) {
                Some(kind) => return Ok(Some(Frame { kind, payload })),
                None => {
                    self.skipped += 1;
                    log::warn!("Skipping frame with unknown kind {tag} ({len} bytes)");
                }
            }
        }
    }
}

/// Decode every frame contained in one transport message.
///
/// A trailing partial frame is an error here, since a WebSocket message
/// always carries whole frames.
pub fn decode_all(data: &[u8]) -> Result<Vec<Frame>, DecodeError> {
    let mut decoder = FrameDecoder::default();
    decoder.push(data);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    if decoder.buffered() > 0 {
        return Err(DecodeError::Truncated { remaining: decoder.buffered() });
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_kind_values() {
        assert_eq!(FrameKind::SyncStep1 as u8, 0);
        assert_eq!(FrameKind::SyncStep2 as u8, 1);
        assert_eq!(FrameKind::Update as u8, 2);
        assert_eq!(FrameKind::Awareness as u8, 3);
        assert_eq!(FrameKind::Auth as u8, 4);
        assert_eq!(FrameKind::from_u8(5), None);
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::update(vec![9, 8, 7]);
        assert_eq!(frame.encode(), vec![2, 3, 9, 8, 7]);

        let empty = Frame::sync_step1(Vec::new());
        assert_eq!(empty.encode(), vec![0, 0]);
    }

    #[test]
    fn test_varint_multibyte_length() {
        let payload = vec![1u8; 300];
        let encoded = Frame::update(payload.clone()).encode();
        // 300 = 0b1_0010_1100 → [0xAC, 0x02]
        assert_eq!(&encoded[..3], &[2, 0xAC, 0x02]);

        let frames = decode_all(&encoded).unwrap();
        assert_eq!(frames[0].payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn test_varint_extremes() {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        assert_eq!(read_varint(&buf).unwrap(), Some((u64::MAX, 10)));

        assert_eq!(read_varint(&[0x80, 0x80]).unwrap(), None);
        assert_eq!(read_varint(&[0xFF; 11]), Err(DecodeError::VarintOverflow));
    }

    #[test]
    fn test_partial_reads() {
        let encoded = Frame::sync_step2(vec![42; 200]).encode();
        let mut decoder = FrameDecoder::default();

        for chunk in encoded.chunks(7) {
            assert!(decoder.buffered() < encoded.len());
            if let Some(frame) = decoder.next_frame().unwrap() {
                panic!("frame yielded early: {frame:?}");
            }
            decoder.push(chunk);
        }
        let frame = decoder.next_frame().unwrap().expect("complete frame");
        assert_eq!(frame.kind, FrameKind::SyncStep2);
        assert_eq!(frame.payload.len(), 200);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let mut data = Frame::sync_step1(vec![1]).encode();
        data.extend(Frame::update(vec![2, 2]).encode());
        data.extend(Frame::awareness(vec![3, 3, 3]).encode());

        let frames = decode_all(&data).unwrap();
        let kinds: Vec<FrameKind> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FrameKind::SyncStep1, FrameKind::Update, FrameKind::Awareness]);
    }

    #[test]
    fn test_unknown_kind_skipped() {
        let mut data = vec![0x7E, 3, 0xAA, 0xBB, 0xCC];
        data.extend(Frame::update(vec![5]).encode());

        let mut decoder = FrameDecoder::default();
        decoder.push(&data);
        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Update);
        assert_eq!(decoder.skipped_frames(), 1);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large() {
        let mut decoder = FrameDecoder::new(8);
        decoder.push(&Frame::update(vec![0; 9]).encode());
        assert!(matches!(
            decoder.next_frame(),
            Err(DecodeError::FrameTooLarge { len: 9, max: 8 })
        ));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_truncated_message() {
        let encoded = Frame::update(vec![1, 2, 3, 4]).encode();
        let err = decode_all(&encoded[..4]).unwrap_err();
        assert_eq!(err, DecodeError::Truncated { remaining: 4 });
    }

    #[test]
    fn test_auth_denied_reason() {
        let frame = Frame::permission_denied("bad token");
        let decoded = decode_all(&frame.encode()).unwrap().remove(0);
        assert_eq!(decoded.denial_reason().as_deref(), Some("bad token"));
        assert!(Frame::update(vec![0]).denial_reason().is_none());
    }
}
