use bytes::{BufMut, BytesMut};

use crate::codec::apply_mask;
use crate::errors::ProtocolError;

/// Interpretation of the "Payload data" of one frame.
/// - x0 denotes a continuation frame
/// - x1 denotes a text frame
/// - x2 denotes a binary frame
/// - x3-7 are reserved for further non-control frames
/// - x8 denotes a connection close
/// - x9 denotes a ping
/// - xA denotes a pong
/// - xB-F are reserved for further control frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// continuation of a fragmented message
    Continue,
    /// utf-8 text message
    Text,
    /// binary message
    Binary,
    /// x3-7, rejected on receive
    ReservedNonControl,
    /// connection close
    Close,
    /// ping
    Ping,
    /// pong
    Pong,
    /// xB-F, rejected on receive
    ReservedControl,
}

impl OpCode {
    /// wire value of this opcode
    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::ReservedNonControl => 0x3,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::ReservedControl => 0xB,
        }
    }

    /// text, binary or continuation
    pub fn is_data(&self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary | OpCode::Continue)
    }

    /// close, ping, pong or a reserved control code (wire value >= 0x8)
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            OpCode::Close | OpCode::Ping | OpCode::Pong | OpCode::ReservedControl
        )
    }
}

/// map the low nibble of frame byte 0 to an opcode; reserved ranges map to
/// the two `Reserved*` variants and are rejected later by the decoder
pub(crate) fn parse_opcode(byte0: u8) -> OpCode {
    match byte0 & 0x0F {
        0x0 => OpCode::Continue,
        0x1 => OpCode::Text,
        0x2 => OpCode::Binary,
        0x3..=0x7 => OpCode::ReservedNonControl,
        0x8 => OpCode::Close,
        0x9 => OpCode::Ping,
        0xA => OpCode::Pong,
        _ => OpCode::ReservedControl,
    }
}

#[inline]
pub(crate) fn get_bit(source: &[u8], byte_idx: usize, bit_idx: usize) -> bool {
    1 & (source[byte_idx] >> (7 - bit_idx)) != 0
}

#[inline]
pub(crate) fn set_bit(source: &mut [u8], byte_idx: usize, bit_idx: usize, val: bool) {
    if val {
        source[byte_idx] |= 1 << (7 - bit_idx);
    } else {
        source[byte_idx] &= !(1 << (7 - bit_idx));
    }
}

/// Parse the payload length starting at frame byte 1. Returns
/// `Ok(None)` when the buffer does not yet hold the whole length
/// encoding, otherwise `(bytes occupied after byte 0, payload length)`
/// with occupancy 1, 3 or 9.
pub(crate) fn parse_payload_len(src: &[u8]) -> Result<Option<(usize, u64)>, ProtocolError> {
    match src[1] & 0x7F {
        len @ 0..=125 => Ok(Some((1, len as u64))),
        126 => {
            if src.len() < 4 {
                return Ok(None);
            }
            let mut arr = [0u8; 2];
            arr.copy_from_slice(&src[2..4]);
            Ok(Some((3, u16::from_be_bytes(arr) as u64)))
        }
        _ => {
            if src.len() < 10 {
                return Ok(None);
            }
            if src[2] & 0x80 != 0 {
                return Err(ProtocolError::InvalidLeadingLen(127));
            }
            let mut arr = [0u8; 8];
            arr.copy_from_slice(&src[2..10]);
            Ok(Some((9, u64::from_be_bytes(arr))))
        }
    }
}

/// Owned frame header, the leading bytes of the wire image: flag/opcode
/// byte, length encoding and, when the mask bit is set, the 4-byte key.
#[derive(Debug, Clone)]
pub struct Header(pub(crate) BytesMut);

impl Header {
    /// fin bit
    #[inline]
    pub fn fin(&self) -> bool {
        get_bit(&self.0, 0, 0)
    }

    /// frame opcode
    #[inline]
    pub fn opcode(&self) -> OpCode {
        parse_opcode(self.0[0])
    }

    /// mask bit
    #[inline]
    pub fn masked(&self) -> bool {
        get_bit(&self.0, 1, 0)
    }

    /// (bytes the length encoding occupies after byte 0, payload length)
    #[inline]
    fn length_encoding(&self) -> (usize, u64) {
        match self.0[1] & 0x7F {
            len @ 0..=125 => (1, len as u64),
            126 => {
                let mut arr = [0u8; 2];
                arr.copy_from_slice(&self.0[2..4]);
                (3, u16::from_be_bytes(arr) as u64)
            }
            _ => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&self.0[2..10]);
                (9, u64::from_be_bytes(arr))
            }
        }
    }

    /// payload length recorded in the header
    #[inline]
    pub fn payload_len(&self) -> u64 {
        self.length_encoding().1
    }

    /// mask key, when the mask bit is set
    #[inline]
    pub fn masking_key(&self) -> Option<[u8; 4]> {
        if self.masked() {
            let (occupied, _) = self.length_encoding();
            let mut arr = [0u8; 4];
            arr.copy_from_slice(&self.0[1 + occupied..5 + occupied]);
            Some(arr)
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn set_fin(&mut self, val: bool) {
        set_bit(&mut self.0, 0, 0, val)
    }

    #[inline]
    pub(crate) fn set_opcode(&mut self, code: OpCode) {
        let leading_bits = (self.0[0] >> 4) << 4;
        self.0[0] = leading_bits | code.as_u8();
    }

    /// The mask bit only; the key bytes are appended or dropped by the
    /// caller together with re-masking the payload.
    #[inline]
    pub(crate) fn set_mask(&mut self, mask: bool) {
        set_bit(&mut self.0, 1, 0, mask);
    }

    /// Write the 1/3/9-byte length encoding, preserving the mask bit and
    /// re-appending the mask key after the resize when one was present.
    pub(crate) fn set_payload_len(&mut self, len: u64) {
        let mask = self.masking_key();
        let mask_len = if mask.is_some() { 4 } else { 0 };
        let header = &mut self.0;
        let mask_bit = header[1] & 0x80;
        let occupied = match len {
            0..=125 => {
                header[1] = mask_bit | (len as u8);
                1
            }
            126..=65535 => {
                header[1] = mask_bit | 126;
                header.resize(4.max(header.len()), 0);
                header[2..4].copy_from_slice(&(len as u16).to_be_bytes());
                3
            }
            _ => {
                header[1] = mask_bit | 127;
                header.resize(10.max(header.len()), 0);
                header[2..10].copy_from_slice(&len.to_be_bytes());
                9
            }
        };
        header.resize(1 + occupied + mask_len, 0);
        if let Some(mask) = mask {
            let at = 1 + occupied;
            header[at..at + 4].copy_from_slice(&mask);
        }
    }

    /// wrap already-validated header bytes
    pub(crate) fn raw(data: BytesMut) -> Self {
        Self(data)
    }

    /// construct a header from parts
    pub fn new<M: Into<Option<[u8; 4]>>>(
        fin: bool,
        mask_key: M,
        opcode: OpCode,
        payload_len: u64,
    ) -> Self {
        let mask = mask_key.into();
        let len_bytes = match payload_len {
            0..=125 => 1,
            126..=65535 => 3,
            _ => 9,
        };
        let mut buf = BytesMut::new();
        buf.resize(1 + len_bytes, 0);
        let mut header = Self(buf);
        header.set_fin(fin);
        header.set_opcode(opcode);
        header.set_payload_len(payload_len);
        if let Some(mask) = mask {
            header.set_mask(true);
            header.0.extend_from_slice(&mask);
        }
        header
    }
}

/// One frame, fully owned: header plus payload. The payload is stored the
/// way it goes on the wire, so it is masked whenever the header says so.
#[derive(Debug, Clone)]
pub struct OwnedFrame {
    header: Header,
    payload: BytesMut,
}

impl OwnedFrame {
    /// construct a frame, masking the payload when a key is given
    pub fn new(fin: bool, code: OpCode, mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        let header = Header::new(fin, mask, code, data.len() as u64);
        let mut payload = BytesMut::with_capacity(data.len());
        payload.extend_from_slice(data);
        if let Some(mask) = header.masking_key() {
            apply_mask(&mut payload, mask);
        }
        Self { header, payload }
    }

    /// use pre-validated header and payload as decoded off the wire
    pub(crate) fn with_raw(header: Header, payload: BytesMut) -> Self {
        Self { header, payload }
    }

    /// final text frame
    pub fn text_frame(mask: impl Into<Option<[u8; 4]>>, data: &str) -> Self {
        Self::new(true, OpCode::Text, mask, data.as_bytes())
    }

    /// final binary frame
    pub fn binary_frame(mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        Self::new(true, OpCode::Binary, mask, data)
    }

    /// ping frame; control payloads are capped at 125 bytes
    pub fn ping_frame(mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        assert!(data.len() <= 125);
        Self::new(true, OpCode::Ping, mask, data)
    }

    /// pong frame; control payloads are capped at 125 bytes
    pub fn pong_frame(mask: impl Into<Option<[u8; 4]>>, data: &[u8]) -> Self {
        assert!(data.len() <= 125);
        Self::new(true, OpCode::Pong, mask, data)
    }

    /// close frame; a reason requires a status code
    pub fn close_frame(
        mask: impl Into<Option<[u8; 4]>>,
        code: impl Into<Option<u16>>,
        reason: &[u8],
    ) -> Self {
        assert!(reason.len() <= 123);
        let code = code.into();
        assert!(code.is_some() || reason.is_empty());
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        if let Some(code) = code {
            payload.put_u16(code);
            payload.extend_from_slice(reason);
        }
        Self::new(true, OpCode::Close, mask, &payload)
    }

    /// Remove the mask: unmask the payload, clear the mask bit and drop
    /// the key bytes. Returns the key that was in effect.
    pub fn unmask(&mut self) -> Option<[u8; 4]> {
        let mask = self.header.masking_key()?;
        apply_mask(&mut self.payload, mask);
        self.header.set_mask(false);
        let trimmed = self.header.0.len() - 4;
        self.header.0.truncate(trimmed);
        Some(mask)
    }

    /// frame header
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// payload bytes as stored (masked iff the header says so)
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// append the wire image of this frame to `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(&self.header.0);
        dst.extend_from_slice(&self.payload);
    }

    /// consume the frame, returning the unmasked payload
    pub(crate) fn into_payload(mut self) -> BytesMut {
        self.unmask();
        self.payload
    }
}
