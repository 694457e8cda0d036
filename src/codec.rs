use bytes::BytesMut;

use crate::errors::ProtocolError;
use crate::frame::{get_bit, parse_payload_len, Header, OpCode, OwnedFrame};

/// xor the payload with the mask key, RFC 6455 section 5.3
pub(crate) fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    apply_mask_fast32(buf, mask)
}

/// word-at-a-time variant of the xor; safe because masking starts at
/// offset zero, so the key rotation stays aligned across chunks
pub(crate) fn apply_mask_fast32(buf: &mut [u8], mask: [u8; 4]) {
    let mask_u32 = u32::from_ne_bytes(mask);
    let mut chunks = buf.chunks_exact_mut(4);
    for chunk in &mut chunks {
        let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) ^ mask_u32;
        chunk.copy_from_slice(&word.to_ne_bytes());
    }
    for (i, byte) in chunks.into_remainder().iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// One unit surfaced by the decoder: either a complete (reassembled)
/// data message or a single control frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    /// complete text or binary message; `code` is `Text` or `Binary`
    Message {
        /// original opcode of the first fragment
        code: OpCode,
        /// concatenated, unmasked payload
        data: BytesMut,
    },
    /// close frame with its status code, when one was present
    Close {
        /// peer status code
        code: Option<u16>,
        /// close reason bytes
        reason: BytesMut,
    },
    /// ping with its payload
    Ping(BytesMut),
    /// pong with its payload
    Pong(BytesMut),
}

/// Incremental frame decoder. Feed it the receive buffer; it consumes
/// whole frames, tracks a fragmented message in progress and surfaces
/// [`Incoming`] items as they complete. Frames from a server arrive
/// unmasked by RFC 6455, but masked ones are accepted and unmasked too.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    fragmented: bool,
    fragmented_type: Option<OpCode>,
    fragmented_data: BytesMut,
}

impl FrameDecoder {
    /// split exactly one frame off `src`, or `None` while incomplete
    fn decode_single(&mut self, src: &mut BytesMut) -> Result<Option<OwnedFrame>, ProtocolError> {
        if src.len() < 2 {
            return Ok(None);
        }
        let leading_bits = src[0] >> 4;
        if !(leading_bits == 0b1000 || leading_bits == 0b0000) {
            return Err(ProtocolError::InvalidLeadingBits(leading_bits));
        }
        let Some((len_occupied, payload_len)) = parse_payload_len(src)? else {
            return Ok(None);
        };
        let masked = get_bit(src, 1, 0);
        let header_len = 1 + len_occupied + if masked { 4 } else { 0 };
        let expected_len = header_len + payload_len as usize;
        if src.len() < expected_len {
            src.reserve(expected_len - src.len());
            return Ok(None);
        }
        let mut data = src.split_to(expected_len);
        let payload = data.split_off(header_len);
        let mut frame = OwnedFrame::with_raw(Header::raw(data), payload);
        frame.unmask();
        Ok(Some(frame))
    }

    /// Decode as much as `src` allows, returning the next completed item
    /// or `None` once the buffer holds no further complete unit.
    pub fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Incoming>, ProtocolError> {
        loop {
            let Some(frame) = self.decode_single(src)? else {
                return Ok(None);
            };
            let header = frame.header();
            let fin = header.fin();
            let opcode = header.opcode();
            match opcode {
                OpCode::Continue => {
                    if !self.fragmented {
                        return Err(ProtocolError::MissInitialFragmentedFrame);
                    }
                    self.fragmented_data.extend_from_slice(frame.payload());
                    if fin {
                        self.fragmented = false;
                        let code = self.fragmented_type.take().unwrap_or(OpCode::Text);
                        let data = std::mem::take(&mut self.fragmented_data);
                        return Ok(Some(Incoming::Message { code, data }));
                    }
                }
                OpCode::Text | OpCode::Binary => {
                    if self.fragmented {
                        return Err(ProtocolError::NotContinueFrameAfterFragmented);
                    }
                    if fin {
                        return Ok(Some(Incoming::Message {
                            code: opcode,
                            data: frame.into_payload(),
                        }));
                    }
                    self.fragmented = true;
                    self.fragmented_type = Some(opcode);
                    self.fragmented_data.extend_from_slice(frame.payload());
                }
                OpCode::Close | OpCode::Ping | OpCode::Pong => {
                    if !fin {
                        return Err(ProtocolError::FragmentedControlFrame);
                    }
                    let payload = frame.into_payload();
                    if payload.len() > 125 {
                        return Err(ProtocolError::ControlFrameTooBig(payload.len()));
                    }
                    match opcode {
                        OpCode::Ping => return Ok(Some(Incoming::Ping(payload))),
                        OpCode::Pong => return Ok(Some(Incoming::Pong(payload))),
                        _ => return Self::decode_close(payload).map(Some),
                    }
                }
                OpCode::ReservedNonControl | OpCode::ReservedControl => {
                    return Err(ProtocolError::UnsupportedFrame(opcode));
                }
            }
        }
    }

    fn decode_close(mut payload: BytesMut) -> Result<Incoming, ProtocolError> {
        if payload.is_empty() {
            return Ok(Incoming::Close {
                code: None,
                reason: payload,
            });
        }
        if payload.len() == 1 {
            return Err(ProtocolError::InvalidCloseFramePayload);
        }
        let reason = payload.split_off(2);
        let code = u16::from_be_bytes([payload[0], payload[1]]);
        if code < 1000 || (1004..=1006).contains(&code) || (1015..=2999).contains(&code) || code >= 5000
        {
            return Err(ProtocolError::InvalidCloseCode(code));
        }
        if std::str::from_utf8(&reason).is_err() {
            return Err(ProtocolError::InvalidUtf8);
        }
        Ok(Incoming::Close {
            code: Some(code),
            reason,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn wire(frame: &OwnedFrame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.write_to(&mut buf);
        buf
    }

    #[test]
    fn masked_frame_round_trips() {
        let payload = b"round and round";
        let mut buf = wire(&OwnedFrame::new(true, OpCode::Binary, [1, 2, 3, 4], payload));
        let mut decoder = FrameDecoder::default();
        match decoder.decode(&mut buf).unwrap() {
            Some(Incoming::Message { code, data }) => {
                assert_eq!(code, OpCode::Binary);
                assert_eq!(&data[..], payload);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn unmasked_server_frame_accepted() {
        let mut buf = wire(&OwnedFrame::text_frame(None, "from server"));
        let mut decoder = FrameDecoder::default();
        let Some(Incoming::Message { data, .. }) = decoder.decode(&mut buf).unwrap() else {
            panic!("expected message");
        };
        assert_eq!(&data[..], b"from server");
    }

    #[test]
    fn incomplete_frame_waits_for_more() {
        let full = wire(&OwnedFrame::binary_frame(None, &[7u8; 200]));
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::from(&full[..5]);
        assert!(matches!(decoder.decode(&mut buf), Ok(None)));
        buf.extend_from_slice(&full[5..]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Ok(Some(Incoming::Message { .. }))
        ));
    }

    #[test]
    fn reassembles_any_partition() {
        let message = b"Hello, world";
        for split in 1..message.len() - 1 {
            let mut decoder = FrameDecoder::default();
            let mut buf = BytesMut::new();
            OwnedFrame::new(false, OpCode::Text, None, &message[..split]).write_to(&mut buf);
            assert!(matches!(decoder.decode(&mut buf), Ok(None)));
            OwnedFrame::new(true, OpCode::Continue, None, &message[split..]).write_to(&mut buf);
            match decoder.decode(&mut buf).unwrap() {
                Some(Incoming::Message { code, data }) => {
                    assert_eq!(code, OpCode::Text);
                    assert_eq!(&data[..], message);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn control_frames_interleave_with_fragments() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        OwnedFrame::new(false, OpCode::Text, None, b"He").write_to(&mut buf);
        OwnedFrame::ping_frame(None, &[0xDE, 0xAD]).write_to(&mut buf);
        OwnedFrame::new(true, OpCode::Continue, None, b"llo").write_to(&mut buf);
        match decoder.decode(&mut buf).unwrap() {
            Some(Incoming::Ping(data)) => assert_eq!(&data[..], &[0xDE, 0xAD]),
            other => panic!("unexpected {other:?}"),
        }
        match decoder.decode(&mut buf).unwrap() {
            Some(Incoming::Message { data, .. }) => assert_eq!(&data[..], b"Hello"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn continuation_without_start_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = wire(&OwnedFrame::new(true, OpCode::Continue, None, b"stray"));
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::MissInitialFragmentedFrame)
        );
    }

    #[test]
    fn data_frame_during_fragmentation_rejected() {
        let mut decoder = FrameDecoder::default();
        let mut buf = BytesMut::new();
        OwnedFrame::new(false, OpCode::Text, None, b"He").write_to(&mut buf);
        OwnedFrame::text_frame(None, "interloper").write_to(&mut buf);
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::NotContinueFrameAfterFragmented)
        );
    }

    #[test]
    fn nonzero_rsv_rejected() {
        let mut buf = wire(&OwnedFrame::text_frame(None, "x"));
        buf[0] |= 0x40;
        let mut decoder = FrameDecoder::default();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ProtocolError::InvalidLeadingBits(_))
        ));
    }

    #[test]
    fn fragmented_control_rejected() {
        let mut buf = wire(&OwnedFrame::ping_frame(None, b"pp"));
        buf[0] &= 0x7F;
        let mut decoder = FrameDecoder::default();
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::FragmentedControlFrame)
        );
    }

    #[test]
    fn close_code_and_reason_decoded() {
        let mut buf = wire(&OwnedFrame::close_frame(None, 1001, b"going away"));
        let mut decoder = FrameDecoder::default();
        match decoder.decode(&mut buf).unwrap() {
            Some(Incoming::Close { code, reason }) => {
                assert_eq!(code, Some(1001));
                assert_eq!(&reason[..], b"going away");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reserved_close_code_rejected() {
        let mut buf = wire(&OwnedFrame::close_frame(None, 1005, b""));
        let mut decoder = FrameDecoder::default();
        assert_eq!(
            decoder.decode(&mut buf),
            Err(ProtocolError::InvalidCloseCode(1005))
        );
    }

    #[test]
    fn sixty_four_bit_length_high_bit_rejected() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[0x82, 0x7F]);
        buf.extend_from_slice(&u64::MAX.to_be_bytes());
        let mut decoder = FrameDecoder::default();
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(ProtocolError::InvalidLeadingLen(_))
        ));
    }
}
