use bytes::{BufMut, Bytes, BytesMut};

/// Defines the interpretation of the "Payload data".  If an unknown
/// opcode is received, the receiving endpoint MUST _Fail the
/// WebSocket Connection_.
/// - x0 denotes a continuation frame
/// - x1 denotes a text frame
/// - x2 denotes a binary frame
/// - x8 denotes a connection close
/// - x9 denotes a ping
/// - xA denotes a pong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// get corresponding u8 value
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xa,
        }
    }

    /// decode the low nibble of the first header byte
    pub fn parse(val: u8) -> Result<Self, u8> {
        match val & 0x0f {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xa => Ok(OpCode::Pong),
            other => Err(other),
        }
    }

    /// close/ping/pong, which must fit one unfragmented short frame
    pub fn is_control(self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// check is text/binary/continuation
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary | OpCode::Continue)
    }
}

/// a single complete frame, payload already unmasked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    pub fn text(data: &str) -> Self {
        Self::new(OpCode::Text, Bytes::copy_from_slice(data.as_bytes()))
    }

    pub fn binary(data: &[u8]) -> Self {
        Self::new(OpCode::Binary, Bytes::copy_from_slice(data))
    }

    pub fn ping(data: &[u8]) -> Self {
        debug_assert!(data.len() <= 125);
        Self::new(OpCode::Ping, Bytes::copy_from_slice(data))
    }

    pub fn pong(data: &[u8]) -> Self {
        debug_assert!(data.len() <= 125);
        Self::new(OpCode::Pong, Bytes::copy_from_slice(data))
    }

    /// close frame carrying a status code and an optional utf-8 reason
    pub fn close(code: u16, reason: &[u8]) -> Self {
        debug_assert!(reason.len() <= 123);
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.extend_from_slice(reason);
        Self::new(OpCode::Close, payload.freeze())
    }

    /// status code of a close frame, if the payload carries one
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode == OpCode::Close && self.payload.len() >= 2 {
            Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
        } else {
            None
        }
    }
}

/// write a frame header into `dst`: fin+opcode, mask bit, the 7/16/64
/// bit length encoding and the mask key when present. 2 to 14 bytes.
pub fn encode_header(dst: &mut BytesMut, fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, payload_len: u64) {
    let mut first = opcode.as_u8();
    if fin {
        first |= 0x80;
    }
    dst.put_u8(first);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len <= 125 {
        dst.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= u16::MAX as u64 {
        dst.put_u8(mask_bit | 126);
        dst.put_u16(payload_len as u16);
    } else {
        dst.put_u8(mask_bit | 127);
        dst.put_u64(payload_len);
    }

    if let Some(mask) = mask {
        dst.extend_from_slice(&mask);
    }
}

/// xor every payload byte with the rotating 4 byte key
pub fn apply_mask(buf: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// mask key generator. xorshift32 is enough for masking, which only
/// exists to defeat broken intermediaries, not for secrecy.
#[derive(Debug, Clone)]
pub struct MaskGen {
    state: u32,
}

impl MaskGen {
    pub fn new() -> Self {
        // zero would lock the generator on zero forever
        let seed: u32 = rand::random::<u32>() | 1;
        Self { state: seed }
    }

    pub fn with_seed(seed: u32) -> Self {
        Self {
            state: if seed == 0 { 0xfdfd_fdfd } else { seed },
        }
    }

    fn next(&mut self) -> u32 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.state = x;
        x
    }

    pub fn mask(&mut self) -> [u8; 4] {
        self.next().to_be_bytes()
    }
}

impl Default for MaskGen {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for code in [
            OpCode::Continue,
            OpCode::Text,
            OpCode::Binary,
            OpCode::Close,
            OpCode::Ping,
            OpCode::Pong,
        ] {
            assert_eq!(OpCode::parse(code.as_u8()), Ok(code));
        }
        assert_eq!(OpCode::parse(0x3), Err(0x3));
        assert_eq!(OpCode::parse(0xf), Err(0xf));
    }

    #[test]
    fn header_length_encodings() {
        // 125 stays inline, 126 takes the 16 bit form, 65535 is the
        // largest 16 bit form, 65536 takes the 64 bit form
        let mut dst = BytesMut::new();
        encode_header(&mut dst, true, OpCode::Binary, None, 125);
        assert_eq!(&dst[..], &[0x82, 125]);

        dst.clear();
        encode_header(&mut dst, true, OpCode::Binary, None, 126);
        assert_eq!(&dst[..], &[0x82, 126, 0x00, 126]);

        dst.clear();
        encode_header(&mut dst, true, OpCode::Binary, None, 65535);
        assert_eq!(&dst[..], &[0x82, 126, 0xff, 0xff]);

        dst.clear();
        encode_header(&mut dst, true, OpCode::Binary, None, 65536);
        assert_eq!(&dst[..], &[0x82, 127, 0, 0, 0, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn header_mask_key_follows_length() {
        let mut dst = BytesMut::new();
        encode_header(&mut dst, true, OpCode::Text, Some([1, 2, 3, 4]), 5);
        assert_eq!(&dst[..], &[0x81, 0x80 | 5, 1, 2, 3, 4]);
    }

    #[test]
    fn mask_is_involutive() {
        let mask = [0xa5, 0x5a, 0x3c, 0xc3];
        let mut data = b"gateway payload bytes".to_vec();
        let original = data.clone();
        apply_mask(&mut data, mask);
        assert_ne!(data, original);
        apply_mask(&mut data, mask);
        assert_eq!(data, original);
    }

    #[test]
    fn close_frame_carries_code() {
        let frame = Frame::close(1000, b"bye");
        assert_eq!(frame.close_code(), Some(1000));
        assert_eq!(&frame.payload[2..], b"bye");
        assert_eq!(Frame::new(OpCode::Close, Bytes::new()).close_code(), None);
    }

    #[test]
    fn mask_gen_never_sticks_on_zero() {
        let mut gen = MaskGen::with_seed(0);
        for _ in 0..64 {
            assert_ne!(gen.mask(), [0, 0, 0, 0]);
        }
    }
}
