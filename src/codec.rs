use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::errors::{Error, ProtocolError};
use crate::frame::{apply_mask, encode_header, Frame, MaskGen, OpCode};

/// default capacity of the read and write rings
pub const DEFAULT_RING_SIZE: usize = 64 * 1024;

/// default cap on a single assembled payload before it is dropped
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// fail the connection when reserved bits are set. no extension is
    /// ever negotiated, so nonzero rsv is always a violation
    pub check_rsv: bool,
    /// mask every outgoing frame (client role)
    pub mask_outgoing: bool,
    /// accept masked inbound frames. servers must never mask, so this
    /// is only enabled by tests exercising the encoder output
    pub accept_masked: bool,
    /// payloads above this are drained and dropped with a warning
    /// instead of failing the session
    pub max_payload: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            check_rsv: true,
            mask_outgoing: true,
            accept_masked: false,
            max_payload: DEFAULT_MAX_PAYLOAD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    Header,
    Len2,
    Len8,
    Mask,
    Payload,
    /// draining an oversized payload that will not be delivered
    Drop,
}

/// streaming frame reader. each `decode` call advances as far as the
/// buffered bytes permit and yields a frame exactly when FIN is set
/// and the full payload is assembled. continuation payloads are
/// accumulated until the final fragment arrives.
#[derive(Debug)]
pub struct FrameDecoder {
    config: FrameConfig,
    state: ReadState,
    fin: bool,
    opcode: OpCode,
    masked: bool,
    mask: [u8; 4],
    payload_len: u64,
    payload: BytesMut,
    fragmented: bool,
    fragmented_type: OpCode,
    fragmented_data: BytesMut,
    remaining_drop: u64,
}

impl FrameDecoder {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            config,
            state: ReadState::Header,
            fin: false,
            opcode: OpCode::Text,
            masked: false,
            mask: [0; 4],
            payload_len: 0,
            payload: BytesMut::new(),
            fragmented: false,
            fragmented_type: OpCode::Text,
            fragmented_data: BytesMut::new(),
            remaining_drop: 0,
        }
    }

    fn reset_frame(&mut self) {
        self.state = ReadState::Header;
        self.payload_len = 0;
        self.payload = BytesMut::new();
    }

    fn enter_payload_state(&mut self) {
        if self.payload_len as usize > self.config.max_payload {
            tracing::warn!(
                len = self.payload_len,
                max = self.config.max_payload,
                "frame payload exceeds scratch capacity, dropping"
            );
            self.remaining_drop = self.payload_len;
            // a lost fragment poisons the whole message
            self.fragmented = false;
            self.fragmented_data = BytesMut::new();
            self.state = ReadState::Drop;
        } else {
            self.payload.reserve(self.payload_len as usize);
            self.state = ReadState::Payload;
        }
    }

    fn check_close_payload(payload: &[u8]) -> Result<(), Error> {
        if payload.len() == 1 {
            return Err(Error::protocol(ProtocolError::InvalidCloseFramePayload));
        }
        if payload.len() >= 2 {
            let code = u16::from_be_bytes([payload[0], payload[1]]);
            if code < 1000
                || (1004..=1006).contains(&code)
                || (1015..=2999).contains(&code)
                || code >= 5000
            {
                return Err(Error::protocol(ProtocolError::InvalidCloseCode(code)));
            }
        }
        Ok(())
    }

    /// a frame is fully assembled; fold it into the fragmentation
    /// state and decide whether a message is ready for the caller
    fn finish_frame(&mut self) -> Result<Option<Frame>, Error> {
        let fin = self.fin;
        let opcode = self.opcode;
        let mut payload = std::mem::take(&mut self.payload);
        if self.masked {
            apply_mask(&mut payload, self.mask);
        }
        self.reset_frame();

        if opcode.is_control() {
            if opcode == OpCode::Close {
                Self::check_close_payload(&payload)?;
            }
            return Ok(Some(Frame {
                fin: true,
                opcode,
                payload: payload.freeze(),
            }));
        }

        match opcode {
            OpCode::Continue => {
                if !self.fragmented {
                    return Err(Error::protocol(ProtocolError::MissInitialFragmentedFrame));
                }
                self.fragmented_data.extend_from_slice(&payload);
                if fin {
                    self.fragmented = false;
                    let data = std::mem::take(&mut self.fragmented_data);
                    Ok(Some(Frame {
                        fin: true,
                        opcode: self.fragmented_type,
                        payload: data.freeze(),
                    }))
                } else {
                    Ok(None)
                }
            }
            OpCode::Text | OpCode::Binary => {
                if self.fragmented {
                    return Err(Error::protocol(
                        ProtocolError::NotContinueFrameAfterFragmented,
                    ));
                }
                if fin {
                    Ok(Some(Frame {
                        fin: true,
                        opcode,
                        payload: payload.freeze(),
                    }))
                } else {
                    self.fragmented = true;
                    self.fragmented_type = opcode;
                    self.fragmented_data = BytesMut::from(&payload[..]);
                    Ok(None)
                }
            }
            _ => unreachable!(),
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(FrameConfig::default())
    }
}

impl Decoder for FrameDecoder {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        loop {
            match self.state {
                ReadState::Header => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    let b0 = src[0];
                    let b1 = src[1];

                    let rsv = (b0 >> 4) & 0x7;
                    if self.config.check_rsv && rsv != 0 {
                        return Err(Error::protocol(ProtocolError::InvalidLeadingBits(b0 >> 4)));
                    }
                    self.fin = b0 & 0x80 != 0;
                    self.opcode = OpCode::parse(b0)
                        .map_err(|op| Error::protocol(ProtocolError::InvalidOpcode(op)))?;

                    self.masked = b1 & 0x80 != 0;
                    if self.masked && !self.config.accept_masked {
                        return Err(Error::protocol(ProtocolError::MaskedFrameFromServer));
                    }

                    let len7 = (b1 & 0x7f) as u64;
                    if self.opcode.is_control() {
                        if !self.fin {
                            return Err(Error::protocol(ProtocolError::FragmentedControlFrame));
                        }
                        if len7 > 125 {
                            return Err(Error::protocol(ProtocolError::ControlFrameTooBig(
                                len7 as usize,
                            )));
                        }
                    }
                    src.advance(2);

                    match len7 {
                        126 => self.state = ReadState::Len2,
                        127 => self.state = ReadState::Len8,
                        len => {
                            self.payload_len = len;
                            if self.masked {
                                self.state = ReadState::Mask;
                            } else {
                                self.enter_payload_state();
                            }
                        }
                    }
                }
                ReadState::Len2 => {
                    if src.len() < 2 {
                        return Ok(None);
                    }
                    self.payload_len = src.get_u16() as u64;
                    if self.masked {
                        self.state = ReadState::Mask;
                    } else {
                        self.enter_payload_state();
                    }
                }
                ReadState::Len8 => {
                    if src.len() < 8 {
                        return Ok(None);
                    }
                    self.payload_len = src.get_u64();
                    if self.masked {
                        self.state = ReadState::Mask;
                    } else {
                        self.enter_payload_state();
                    }
                }
                ReadState::Mask => {
                    if src.len() < 4 {
                        return Ok(None);
                    }
                    self.mask.copy_from_slice(&src[..4]);
                    src.advance(4);
                    self.enter_payload_state();
                }
                ReadState::Payload => {
                    let missing = self.payload_len as usize - self.payload.len();
                    let take = missing.min(src.len());
                    self.payload.extend_from_slice(&src[..take]);
                    src.advance(take);
                    if self.payload.len() < self.payload_len as usize {
                        return Ok(None);
                    }
                    match self.finish_frame()? {
                        Some(frame) => return Ok(Some(frame)),
                        // mid fragmentation, keep consuming
                        None => continue,
                    }
                }
                ReadState::Drop => {
                    let take = (self.remaining_drop as usize).min(src.len());
                    src.advance(take);
                    self.remaining_drop -= take as u64;
                    if self.remaining_drop > 0 {
                        return Ok(None);
                    }
                    self.reset_frame();
                }
            }
        }
    }
}

/// frame writer: renders the header, masks the payload with a fresh
/// xorshift32 key and appends the whole frame to the outbound ring
#[derive(Debug)]
pub struct FrameEncoder {
    pub mask_outgoing: bool,
    mask_gen: MaskGen,
}

impl FrameEncoder {
    pub fn new(mask_outgoing: bool) -> Self {
        Self {
            mask_outgoing,
            mask_gen: MaskGen::new(),
        }
    }

    #[cfg(test)]
    pub fn with_seed(mask_outgoing: bool, seed: u32) -> Self {
        Self {
            mask_outgoing,
            mask_gen: MaskGen::with_seed(seed),
        }
    }
}

impl Encoder<Frame> for FrameEncoder {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        let mask = if self.mask_outgoing {
            Some(self.mask_gen.mask())
        } else {
            None
        };
        encode_header(dst, frame.fin, frame.opcode, mask, frame.payload.len() as u64);
        let start = dst.len();
        dst.extend_from_slice(&frame.payload);
        if let Some(mask) = mask {
            apply_mask(&mut dst[start..], mask);
        }
        Ok(())
    }
}

/// paired encoder/decoder with a shared configuration
#[derive(Debug)]
pub struct FrameCodec {
    pub encoder: FrameEncoder,
    pub decoder: FrameDecoder,
}

impl FrameCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self {
            encoder: FrameEncoder::new(config.mask_outgoing),
            decoder: FrameDecoder::new(config),
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(FrameConfig::default())
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        self.encoder.encode(item, dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        self.decoder.decode(src)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn server_decoder() -> FrameDecoder {
        FrameDecoder::default()
    }

    fn loopback_decoder() -> FrameDecoder {
        FrameDecoder::new(FrameConfig {
            accept_masked: true,
            ..Default::default()
        })
    }

    /// raw unmasked frame the way a server would send it
    fn server_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        encode_header(&mut buf, fin, opcode, None, payload.len() as u64);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn encoded_frames_round_trip() {
        let mut encoder = FrameEncoder::with_seed(true, 0x1234_5678);
        let mut decoder = loopback_decoder();
        for payload in [&b""[..], b"x", &[0u8; 125], &[7u8; 126], &[9u8; 65535]] {
            let frame = Frame::binary(payload);
            let mut wire = BytesMut::new();
            encoder.encode(frame.clone(), &mut wire).unwrap();
            // every client frame is masked
            assert_eq!(wire[1] & 0x80, 0x80);
            let got = decoder.decode(&mut wire).unwrap().unwrap();
            assert_eq!(got, frame);
            assert!(wire.is_empty());
        }
    }

    #[test]
    fn masked_server_frame_is_rejected() {
        let mut encoder = FrameEncoder::with_seed(true, 1);
        let mut wire = BytesMut::new();
        encoder.encode(Frame::text("hi"), &mut wire).unwrap();
        let err = server_decoder().decode(&mut wire).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                close_code: 1002,
                error: ProtocolError::MaskedFrameFromServer
            }
        ));
    }

    #[test]
    fn partial_header_and_payload_resume() {
        let mut decoder = server_decoder();
        let wire = server_frame(true, OpCode::Text, b"hello world");
        let mut src = BytesMut::from(&wire[..1]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&wire[1..5]);
        assert!(decoder.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&wire[5..]);
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"hello world");
    }

    #[test]
    fn large_payload_spans_multiple_updates() {
        // 70 KiB payload cannot fit the 64 KiB ring in one pass
        let payload = vec![0xabu8; 70 * 1024];
        let wire = server_frame(true, OpCode::Binary, &payload);

        let mut decoder = server_decoder();
        let mut ring = BytesMut::with_capacity(DEFAULT_RING_SIZE);
        let first = DEFAULT_RING_SIZE.min(wire.len());
        ring.put_slice(&wire[..first]);
        assert!(decoder.decode(&mut ring).unwrap().is_none());
        assert!(ring.is_empty());

        ring.put_slice(&wire[first..]);
        let frame = decoder.decode(&mut ring).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Binary);
        assert_eq!(frame.payload.len(), payload.len());
        assert_eq!(&frame.payload[..], &payload[..]);
    }

    #[test]
    fn length_encodings_decode() {
        for len in [125usize, 126, 65535, 65536] {
            let payload = vec![3u8; len];
            let mut wire = server_frame(true, OpCode::Binary, &payload);
            let frame = server_decoder().decode(&mut wire).unwrap().unwrap();
            assert_eq!(frame.payload.len(), len);
        }
    }

    #[test]
    fn extended_lengths_are_big_endian() {
        // 0x0102 = 258 bytes via the 16 bit form
        let mut wire = BytesMut::from(&[0x82u8, 126, 0x01, 0x02][..]);
        wire.extend_from_slice(&vec![0u8; 258]);
        let frame = server_decoder().decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 258);

        // 0x0000000000010000 = 65536 via the 64 bit form
        let mut wire = BytesMut::from(&[0x82u8, 127, 0, 0, 0, 0, 0, 1, 0, 0][..]);
        wire.extend_from_slice(&vec![0u8; 65536]);
        let frame = server_decoder().decode(&mut wire).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 65536);
    }

    #[test]
    fn fragments_accumulate_until_fin() {
        let mut decoder = server_decoder();
        let mut src = server_frame(false, OpCode::Text, b"hel");
        assert!(decoder.decode(&mut src).unwrap().is_none());
        let mut src = server_frame(false, OpCode::Continue, b"lo ");
        assert!(decoder.decode(&mut src).unwrap().is_none());
        let mut src = server_frame(true, OpCode::Continue, b"world");
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"hello world");
    }

    #[test]
    fn control_frame_interleaves_fragments() {
        let mut decoder = server_decoder();
        let mut src = server_frame(false, OpCode::Text, b"half");
        assert!(decoder.decode(&mut src).unwrap().is_none());
        let mut src = server_frame(true, OpCode::Ping, b"keepalive");
        let ping = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(ping.opcode, OpCode::Ping);
        let mut src = server_frame(true, OpCode::Continue, b" done");
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"half done");
    }

    #[test]
    fn data_opcode_inside_fragmented_message_fails() {
        let mut decoder = server_decoder();
        let mut src = server_frame(false, OpCode::Text, b"frag");
        assert!(decoder.decode(&mut src).unwrap().is_none());
        let mut src = server_frame(true, OpCode::Text, b"oops");
        let err = decoder.decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                error: ProtocolError::NotContinueFrameAfterFragmented,
                ..
            }
        ));
    }

    #[test]
    fn continuation_without_initial_fragment_fails() {
        let mut src = server_frame(true, OpCode::Continue, b"orphan");
        let err = server_decoder().decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                error: ProtocolError::MissInitialFragmentedFrame,
                ..
            }
        ));
    }

    #[test]
    fn fragmented_control_frame_fails() {
        let mut src = server_frame(false, OpCode::Ping, b"");
        let err = server_decoder().decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                error: ProtocolError::FragmentedControlFrame,
                ..
            }
        ));
    }

    #[test]
    fn oversized_control_frame_fails() {
        // 16 bit length form on a ping implies a payload above 125
        let mut src = BytesMut::from(&[0x89u8, 126, 0x01, 0x00][..]);
        let err = server_decoder().decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                error: ProtocolError::ControlFrameTooBig(_),
                ..
            }
        ));
    }

    #[test]
    fn reserved_bits_fail_without_extensions() {
        let mut src = BytesMut::from(&[0xc1u8, 0x00][..]);
        let err = server_decoder().decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                error: ProtocolError::InvalidLeadingBits(_),
                ..
            }
        ));
    }

    #[test]
    fn oversized_payload_is_dropped_session_continues() {
        let mut decoder = FrameDecoder::new(FrameConfig {
            max_payload: 8,
            ..Default::default()
        });
        let mut src = server_frame(true, OpCode::Binary, &[1u8; 32]);
        src.extend_from_slice(&server_frame(true, OpCode::Text, b"next"));
        let frame = decoder.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(&frame.payload[..], b"next");
    }

    #[test]
    fn invalid_close_code_fails() {
        let mut payload = BytesMut::new();
        payload.put_u16(999);
        let mut src = server_frame(true, OpCode::Close, &payload);
        let err = server_decoder().decode(&mut src).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                error: ProtocolError::InvalidCloseCode(999),
                ..
            }
        ));
    }
}
