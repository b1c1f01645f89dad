use byteorder::{BigEndian, ByteOrder};
use sett::crypto;

/// Envelope header: 2-byte big-endian body size, 1-byte type, 1-byte sub-type.
pub const HEADER_SIZE: usize = 4;

/// Room reserved ahead of the envelope so the relay layer can prepend its
/// framing without copying the payload body.
pub const PADDING_SIZE: usize = 128;

/// The size field is 16 bits; nothing larger ever goes on the wire.
pub const MAX_BODY_SIZE: usize = u16::max_value() as usize;

/// Body overhead added by one relay-layer wrap: sender uuid, nonce and MAC.
pub const OUTER_OVERHEAD: usize = 8 + crypto::NONCE_SIZE + crypto::MAC_SIZE;

/// Overhead added by one encrypted segment: nonce and MAC.
pub const SEGMENT_OVERHEAD: usize = crypto::NONCE_SIZE + crypto::MAC_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PayloadType {
    IpFrame = 0x02,
    Index = 0x04,
    Ping = 0x06,
    Detect = 0x08,
    UdpLog = 0x0a,
}

impl PayloadType {
    #[inline]
    pub fn from_u8(value: u8) -> Option<PayloadType> {
        match value {
            0x02 => Some(PayloadType::IpFrame),
            0x04 => Some(PayloadType::Index),
            0x06 => Some(PayloadType::Ping),
            0x08 => Some(PayloadType::Detect),
            0x0a => Some(PayloadType::UdpLog),
            _ => None,
        }
    }
}

impl From<PayloadType> for u8 {
    #[inline]
    fn from(t: PayloadType) -> Self {
        t as u8
    }
}

/// Sub-type bits qualifying an `IpFrame` payload.
pub mod sub {
    /// Payload segment is end-to-end encrypted.
    pub const P2P: u8 = 0x01;
    /// Datagram carries a relay-layer wrap.
    pub const RELAY: u8 = 0x02;
    /// Payload segment is deflate-compressed.
    pub const ZIP: u8 = 0x04;
}

#[derive(Debug, Eq, PartialEq)]
pub enum FramingError {
    /// Fewer bytes than one envelope header.
    Truncated,
    /// Declared size exceeds the received byte count.
    SizeMismatch,
    /// Unknown top-level type byte.
    UnknownType(u8),
    /// Unknown forwarding class byte in a route header.
    UnknownClass(u8),
    /// Not enough padding left in front of the wire start.
    NoHeadroom,
    /// Not enough capacity behind the wire end.
    NoCapacity,
    /// Relay path capacity exceeded.
    PathFull,
    /// Authentication failure on an encrypted segment or wrap.
    Crypto,
}

/// One staging buffer holding a single datagram. The wire image starts at
/// `start` and spans `len` bytes; the region in front of `start` is padding
/// that prepends may grow into.
pub struct PayloadBuf {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl PayloadBuf {
    /// Allocates a buffer able to stage `capacity` wire bytes plus padding.
    #[inline]
    pub fn new(capacity: usize) -> PayloadBuf {
        let buf = vec![0u8; PADDING_SIZE + capacity].into_boxed_slice();

        PayloadBuf {
            buf,
            start: PADDING_SIZE,
            len: HEADER_SIZE,
        }
    }

    /// Wire byte capacity (excluding the padding region).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len() - PADDING_SIZE
    }

    /// Restores the empty egress layout: wire start at the padding boundary,
    /// an all-zero envelope header and no body.
    #[inline]
    pub fn reset(&mut self) {
        self.start = PADDING_SIZE;
        self.len = HEADER_SIZE;
        for b in &mut self.buf[self.start..self.start + HEADER_SIZE] {
            *b = 0;
        }
    }

    #[inline]
    pub fn set_header(&mut self, t: PayloadType, sub_type: u8) {
        self.buf[self.start + 2] = t.into();
        self.buf[self.start + 3] = sub_type;
    }

    #[inline]
    pub fn payload_type(&self) -> u8 {
        self.buf[self.start + 2]
    }

    #[inline]
    pub fn sub_type(&self) -> u8 {
        self.buf[self.start + 3]
    }

    #[inline]
    pub fn or_sub_type(&mut self, bits: u8) {
        self.buf[self.start + 3] |= bits;
    }

    #[inline]
    pub fn clear_sub_type(&mut self, bits: u8) {
        self.buf[self.start + 3] &= !bits;
    }

    #[inline]
    pub fn body_len(&self) -> usize {
        self.len - HEADER_SIZE
    }

    /// Sets the body length and rewrites the envelope size field.
    #[inline]
    pub fn set_body_len(&mut self, body_len: usize) -> Result<(), FramingError> {
        if body_len > MAX_BODY_SIZE || self.start + HEADER_SIZE + body_len > self.buf.len() {
            return Err(FramingError::NoCapacity);
        }

        self.len = HEADER_SIZE + body_len;
        BigEndian::write_u16(&mut self.buf[self.start..], body_len as u16);
        Ok(())
    }

    /// The body as currently framed.
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buf[self.start + HEADER_SIZE..self.start + self.len]
    }

    #[inline]
    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start + HEADER_SIZE..self.start + self.len]
    }

    /// The full writable region behind the envelope header, independent of
    /// the current body length.
    #[inline]
    pub fn body_space_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start + HEADER_SIZE..]
    }

    /// The complete wire image of the staged datagram.
    #[inline]
    pub fn wire(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    /// Receive window for a UDP read. Always starts at the padding boundary.
    #[inline]
    pub fn recv_space_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PADDING_SIZE..]
    }

    /// Validates a freshly received datagram of `received` bytes and adopts it
    /// as the staged wire image. Returns the type and sub-type bytes. Bytes
    /// past the declared size are ignored.
    pub fn commit_recv(&mut self, received: usize) -> Result<(u8, u8), FramingError> {
        self.start = PADDING_SIZE;

        if received < HEADER_SIZE || received > self.capacity() {
            return Err(FramingError::Truncated);
        }

        let declared = BigEndian::read_u16(&self.buf[self.start..]) as usize;

        if HEADER_SIZE + declared > received {
            return Err(FramingError::SizeMismatch);
        }

        self.len = HEADER_SIZE + declared;
        Ok((self.payload_type(), self.sub_type()))
    }

    /// Installs a complete datagram (used by tests and the relay unwrap).
    pub fn install(&mut self, datagram: &[u8]) -> Result<(u8, u8), FramingError> {
        if datagram.len() > self.capacity() {
            return Err(FramingError::NoCapacity);
        }

        self.buf[PADDING_SIZE..PADDING_SIZE + datagram.len()].copy_from_slice(datagram);
        self.commit_recv(datagram.len())
    }

    /// Encrypts the body from `offset` onward in place, leaving
    /// `nonce ‖ cipher ‖ mac` in its place.
    pub fn encrypt_segment(
        &mut self,
        offset: usize,
        additional_data: &[u8],
        key: &[u8; crypto::KEY_SIZE],
        scratch: &mut Vec<u8>,
    ) -> Result<(), FramingError> {
        let plain_len = self.body_len().checked_sub(offset).ok_or(FramingError::Truncated)?;

        if self.start + self.len + SEGMENT_OVERHEAD > self.buf.len() {
            return Err(FramingError::NoCapacity);
        }

        scratch.clear();
        scratch.extend_from_slice(&self.body()[offset..]);

        let mut nonce = [0u8; crypto::NONCE_SIZE];
        crypto::random_bytes(&mut nonce);

        let seg = self.start + HEADER_SIZE + offset;
        self.buf[seg..seg + crypto::NONCE_SIZE].copy_from_slice(&nonce);

        let cipher_start = seg + crypto::NONCE_SIZE;
        if !crypto::encrypt(
            &mut self.buf[cipher_start..cipher_start + plain_len + crypto::MAC_SIZE],
            &scratch[..plain_len],
            additional_data,
            &nonce,
            key,
        ) {
            return Err(FramingError::Crypto);
        }

        self.set_body_len(offset + SEGMENT_OVERHEAD + plain_len)
    }

    /// Reverses `encrypt_segment`, trying the supplied keys in order.
    pub fn decrypt_segment(
        &mut self,
        offset: usize,
        additional_data: &[u8],
        keys: &[[u8; crypto::KEY_SIZE]],
        scratch: &mut Vec<u8>,
    ) -> Result<(), FramingError> {
        let seg_len = self.body_len().checked_sub(offset).ok_or(FramingError::Truncated)?;

        if seg_len < SEGMENT_OVERHEAD {
            return Err(FramingError::Truncated);
        }

        let plain_len = seg_len - SEGMENT_OVERHEAD;
        let seg = self.start + HEADER_SIZE + offset;

        let mut nonce = [0u8; crypto::NONCE_SIZE];
        nonce.copy_from_slice(&self.buf[seg..seg + crypto::NONCE_SIZE]);

        scratch.clear();
        scratch.resize(plain_len, 0);

        let cipher_start = seg + crypto::NONCE_SIZE;
        let decrypted = keys.iter().any(|key| {
            crypto::decrypt(
                &mut scratch[..],
                &self.buf[cipher_start..cipher_start + plain_len + crypto::MAC_SIZE],
                additional_data,
                &nonce,
                key,
            )
        });

        if !decrypted {
            return Err(FramingError::Crypto);
        }

        self.buf[seg..seg + plain_len].copy_from_slice(scratch);
        self.set_body_len(offset + plain_len)
    }

    /// Wraps the whole staged datagram in a relay layer addressed from
    /// `from`: a fresh envelope is prepended into the padding region and the
    /// former wire image becomes the AEAD cipher text.
    pub fn wrap_outer(
        &mut self,
        from: u64,
        key: &[u8; crypto::KEY_SIZE],
        scratch: &mut Vec<u8>,
    ) -> Result<(), FramingError> {
        let inner_len = self.len;
        let front = HEADER_SIZE + 8 + crypto::NONCE_SIZE;

        if self.start < front {
            return Err(FramingError::NoHeadroom);
        }

        if self.start + inner_len + crypto::MAC_SIZE > self.buf.len() {
            return Err(FramingError::NoCapacity);
        }

        if HEADER_SIZE + OUTER_OVERHEAD + inner_len > HEADER_SIZE + MAX_BODY_SIZE {
            return Err(FramingError::NoCapacity);
        }

        scratch.clear();
        scratch.extend_from_slice(self.wire());

        let mut nonce = [0u8; crypto::NONCE_SIZE];
        crypto::random_bytes(&mut nonce);

        let additional_data = outer_additional_data(from);

        let cipher_start = self.start;
        if !crypto::encrypt(
            &mut self.buf[cipher_start..cipher_start + inner_len + crypto::MAC_SIZE],
            &scratch[..inner_len],
            &additional_data,
            &nonce,
            key,
        ) {
            return Err(FramingError::Crypto);
        }

        self.start -= front;
        self.len = front + inner_len + crypto::MAC_SIZE;

        BigEndian::write_u16(&mut self.buf[self.start..], (self.len - HEADER_SIZE) as u16);
        self.buf[self.start + 2] = PayloadType::IpFrame.into();
        self.buf[self.start + 3] = sub::RELAY;
        BigEndian::write_u64(&mut self.buf[self.start + HEADER_SIZE..], from);
        let nonce_start = self.start + HEADER_SIZE + 8;
        self.buf[nonce_start..nonce_start + crypto::NONCE_SIZE].copy_from_slice(&nonce);

        Ok(())
    }

    /// The sender uuid of a relay-layer wrap.
    pub fn outer_from(&self) -> Result<u64, FramingError> {
        if self.body_len() < OUTER_OVERHEAD {
            return Err(FramingError::Truncated);
        }

        Ok(BigEndian::read_u64(self.body()))
    }

    /// Reverses `wrap_outer`, trying the supplied keys in order. On success the
    /// staged datagram is replaced by the recovered inner datagram.
    pub fn unwrap_outer(
        &mut self,
        keys: &[[u8; crypto::KEY_SIZE]],
        scratch: &mut Vec<u8>,
    ) -> Result<(u8, u8), FramingError> {
        let from = self.outer_from()?;
        let inner_len = self.body_len() - OUTER_OVERHEAD;

        let body_start = self.start + HEADER_SIZE;
        let mut nonce = [0u8; crypto::NONCE_SIZE];
        nonce.copy_from_slice(&self.buf[body_start + 8..body_start + 8 + crypto::NONCE_SIZE]);

        let additional_data = outer_additional_data(from);

        scratch.clear();
        scratch.resize(inner_len, 0);

        let cipher_start = body_start + 8 + crypto::NONCE_SIZE;
        let decrypted = keys.iter().any(|key| {
            crypto::decrypt(
                &mut scratch[..],
                &self.buf[cipher_start..cipher_start + inner_len + crypto::MAC_SIZE],
                &additional_data,
                &nonce,
                key,
            )
        });

        if !decrypted {
            return Err(FramingError::Crypto);
        }

        let inner = std::mem::replace(scratch, Vec::new());
        let result = self.install(&inner);
        *scratch = inner;

        result
    }
}

#[inline]
fn outer_additional_data(from: u64) -> [u8; 10] {
    let mut additional_data = [0u8; 10];
    additional_data[0] = PayloadType::IpFrame.into();
    additional_data[1] = sub::RELAY;
    BigEndian::write_u64(&mut additional_data[2..], from);
    additional_data
}

#[cfg(test)]
mod tests {
    use super::*;

    const CAPACITY: usize = 2048;

    fn staged(t: PayloadType, sub_type: u8, body: &[u8]) -> PayloadBuf {
        let mut buf = PayloadBuf::new(CAPACITY);
        buf.set_header(t, sub_type);
        buf.body_space_mut()[..body.len()].copy_from_slice(body);
        buf.set_body_len(body.len()).unwrap();
        buf
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let body = [9u8; 300];
        let sent = staged(PayloadType::IpFrame, sub::P2P, &body);

        let mut received = PayloadBuf::new(CAPACITY);
        let (t, s) = received.install(sent.wire()).unwrap();

        assert_eq!(t, u8::from(PayloadType::IpFrame));
        assert_eq!(s, sub::P2P);
        assert_eq!(received.body(), &body[..]);
    }

    #[test]
    fn test_decode_declared_size_exceeds_received() {
        let mut wire = staged(PayloadType::Ping, 0, &[1, 2, 3]).wire().to_vec();
        // Lie about the size.
        wire[0] = 0xff;
        wire[1] = 0xff;

        let mut received = PayloadBuf::new(CAPACITY);
        assert_eq!(received.install(&wire).unwrap_err(), FramingError::SizeMismatch);
    }

    #[test]
    fn test_decode_runt_datagram() {
        let mut received = PayloadBuf::new(CAPACITY);
        assert_eq!(received.install(&[1, 2]).unwrap_err(), FramingError::Truncated);
    }

    #[test]
    fn test_decode_ignores_trailing_garbage() {
        let mut wire = staged(PayloadType::Ping, 0, &[1, 2, 3]).wire().to_vec();
        wire.extend_from_slice(&[0xaa; 16]);

        let mut received = PayloadBuf::new(CAPACITY);
        received.install(&wire).unwrap();
        assert_eq!(received.body(), &[1, 2, 3]);
    }

    #[test]
    fn test_payload_type_values_are_stable() {
        assert_eq!(u8::from(PayloadType::IpFrame), 0x02);
        assert_eq!(u8::from(PayloadType::Index), 0x04);
        assert_eq!(u8::from(PayloadType::Ping), 0x06);
        assert_eq!(u8::from(PayloadType::Detect), 0x08);
        assert_eq!(u8::from(PayloadType::UdpLog), 0x0a);
        assert_eq!(PayloadType::from_u8(0x03), None);
    }

    #[test]
    fn test_segment_encrypt_decrypt_roundtrip() {
        let mut key = [0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut key);

        let body = [0x55u8; 200];
        let mut buf = staged(PayloadType::IpFrame, 0, &body);
        let mut scratch = Vec::new();

        buf.encrypt_segment(20, b"route", &key, &mut scratch).unwrap();
        assert_eq!(buf.body_len(), 20 + SEGMENT_OVERHEAD + 180);
        assert_ne!(&buf.body()[20 + crypto::NONCE_SIZE..20 + crypto::NONCE_SIZE + 8], &body[20..28]);

        buf.decrypt_segment(20, b"route", &[key], &mut scratch).unwrap();
        assert_eq!(buf.body(), &body[..]);
    }

    #[test]
    fn test_segment_decrypt_wrong_key() {
        let mut key = [0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut key);

        let mut buf = staged(PayloadType::IpFrame, 0, &[7u8; 64]);
        let mut scratch = Vec::new();

        buf.encrypt_segment(0, &[], &key, &mut scratch).unwrap();

        let mut wrong = key;
        wrong[5] ^= 0x80;

        assert_eq!(
            buf.decrypt_segment(0, &[], &[wrong], &mut scratch).unwrap_err(),
            FramingError::Crypto
        );
    }

    #[test]
    fn test_segment_decrypt_second_key_applies() {
        let mut key = [0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut key);

        let mut buf = staged(PayloadType::IpFrame, 0, &[7u8; 64]);
        let mut scratch = Vec::new();

        buf.encrypt_segment(0, &[], &key, &mut scratch).unwrap();

        let mut other = key;
        other[5] ^= 0x80;

        buf.decrypt_segment(0, &[], &[other, key], &mut scratch).unwrap();
        assert_eq!(buf.body(), &[7u8; 64][..]);
    }

    #[test]
    fn test_outer_wrap_unwrap_roundtrip() {
        let mut key = [0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut key);

        let body = [3u8; 90];
        let mut buf = staged(PayloadType::IpFrame, sub::P2P, &body);
        let inner_wire = buf.wire().to_vec();
        let mut scratch = Vec::new();

        buf.wrap_outer(1001, &key, &mut scratch).unwrap();

        assert_eq!(buf.sub_type(), sub::RELAY);
        assert_eq!(buf.outer_from().unwrap(), 1001);
        assert_eq!(buf.body_len(), OUTER_OVERHEAD + inner_wire.len());

        let (t, s) = buf.unwrap_outer(&[key], &mut scratch).unwrap();

        assert_eq!(t, u8::from(PayloadType::IpFrame));
        assert_eq!(s, sub::P2P);
        assert_eq!(buf.wire(), &inner_wire[..]);
    }

    #[test]
    fn test_outer_unwrap_wrong_key() {
        let mut key = [0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut key);

        let mut buf = staged(PayloadType::IpFrame, 0, &[1u8; 40]);
        let mut scratch = Vec::new();
        buf.wrap_outer(42, &key, &mut scratch).unwrap();

        let mut wrong = key;
        wrong[0] ^= 1;

        assert_eq!(buf.unwrap_outer(&[wrong], &mut scratch).unwrap_err(), FramingError::Crypto);
    }

    #[test]
    fn test_wrap_requires_headroom() {
        let mut key = [0u8; crypto::KEY_SIZE];
        crypto::random_bytes(&mut key);

        let mut buf = staged(PayloadType::IpFrame, 0, &[1u8; 40]);
        let mut scratch = Vec::new();

        // Five nested wraps exceed the padding region.
        let mut failed = false;
        for _ in 0..6 {
            if buf.wrap_outer(42, &key, &mut scratch).is_err() {
                failed = true;
                break;
            }
        }

        assert!(failed);
    }
}
