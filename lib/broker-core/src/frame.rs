//! The fixed-layout wire envelope. Parsing and serialization are manual (no serde), matching this
//! codebase's practice of hand-rolling the wire format for anything that has to interop with a
//! non-Rust counterparty and cares about an exact byte layout.

use byteorder::{ByteOrder, NativeEndian};

/// Declared payload bytes + header. The whole envelope is always this many bytes on the wire,
/// irrespective of the declared `size` field -- see the module-level rationale in the design docs.
pub const HEADER_SIZE: usize = 12;
pub const PAYLOAD_SIZE: usize = 1028;
pub const ENVELOPE_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

pub const MAX_KEY_LEN: usize = 1024;
pub const MAX_FDS: usize = 64;

pub const PROTOCOL_VERSION: u32 = 0x1;
pub const VERSION_MASK: u32 = 0x0f;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RequestKind {
    None,
    GetPair,
    SetPair,
}

impl RequestKind {
    #[inline]
    pub fn from_raw(raw: u32) -> Option<RequestKind> {
        match raw {
            0 => Some(RequestKind::None),
            1 => Some(RequestKind::GetPair),
            2 => Some(RequestKind::SetPair),
            _ => None,
        }
    }

    #[inline]
    pub fn as_raw(self) -> u32 {
        match self {
            RequestKind::None => 0,
            RequestKind::GetPair => 1,
            RequestKind::SetPair => 2,
        }
    }

    /// The payload size the validator expects for this request kind (the `size` field).
    #[inline]
    pub fn expected_payload_size(self) -> u32 {
        match self {
            RequestKind::GetPair => (4 + MAX_KEY_LEN) as u32,
            RequestKind::SetPair => 8,
            RequestKind::None => 0,
        }
    }

    /// The descriptor count the validator expects to accompany this request kind.
    #[inline]
    pub fn expected_fd_count(self) -> usize {
        match self {
            RequestKind::GetPair => 0,
            RequestKind::SetPair => 1,
            RequestKind::None => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Mode {
    None,
    Client,
    Server,
}

impl Mode {
    #[inline]
    pub fn from_raw(raw: u16) -> Option<Mode> {
        match raw {
            0 => Some(Mode::None),
            1 => Some(Mode::Client),
            2 => Some(Mode::Server),
            _ => None,
        }
    }

    #[inline]
    pub fn as_raw(self) -> u16 {
        match self {
            Mode::None => 0,
            Mode::Client => 1,
            Mode::Server => 2,
        }
    }

    /// Two modes are complementary when they describe one rendezvous relationship: both `None`,
    /// or one `Client` and one `Server`.
    #[inline]
    pub fn complements(self, other: Mode) -> bool {
        matches!(
            (self, other),
            (Mode::None, Mode::None) | (Mode::Client, Mode::Server) | (Mode::Server, Mode::Client)
        )
    }
}

/// A decoded (or about-to-be-encoded) frame. `request`/`flags`/`size` are kept raw (not yet
/// validated) so the validator can inspect and reject malformed values; only after validation do
/// callers interpret the payload via `mode()`/`key()`/`value()`.
#[derive(Clone)]
pub struct Frame {
    pub request: u32,
    pub flags: u32,
    pub size: u32,
    payload: [u8; PAYLOAD_SIZE],
}

impl Frame {
    pub fn get_pair(mode: Mode, key: &[u8]) -> Frame {
        assert!(key.len() <= MAX_KEY_LEN, "key exceeds maximum length");

        let mut payload = [0u8; PAYLOAD_SIZE];
        NativeEndian::write_u16(&mut payload[0..2], mode.as_raw());
        NativeEndian::write_u16(&mut payload[2..4], key.len() as u16);
        payload[4..4 + key.len()].copy_from_slice(key);

        Frame {
            request: RequestKind::GetPair.as_raw(),
            flags: PROTOCOL_VERSION,
            size: RequestKind::GetPair.expected_payload_size(),
            payload,
        }
    }

    pub fn set_pair(value: u64) -> Frame {
        let mut payload = [0u8; PAYLOAD_SIZE];
        NativeEndian::write_u64(&mut payload[0..8], value);

        Frame {
            request: RequestKind::SetPair.as_raw(),
            flags: PROTOCOL_VERSION,
            size: RequestKind::SetPair.expected_payload_size(),
            payload,
        }
    }

    #[inline]
    pub fn request_kind(&self) -> Option<RequestKind> {
        RequestKind::from_raw(self.request)
    }

    #[inline]
    pub fn mode_raw(&self) -> u16 {
        NativeEndian::read_u16(&self.payload[0..2])
    }

    #[inline]
    pub fn key_len_raw(&self) -> u16 {
        NativeEndian::read_u16(&self.payload[2..4])
    }

    /// The key bytes, sliced to `key_len_raw()`. Only meaningful once the validator has confirmed
    /// `key_len_raw()` is in range.
    #[inline]
    pub fn key(&self) -> &[u8] {
        let len = self.key_len_raw() as usize;
        &self.payload[4..4 + len.min(MAX_KEY_LEN)]
    }

    #[inline]
    pub fn value(&self) -> u64 {
        NativeEndian::read_u64(&self.payload[0..8])
    }

    pub fn to_bytes(&self) -> [u8; ENVELOPE_SIZE] {
        let mut buf = [0u8; ENVELOPE_SIZE];
        NativeEndian::write_u32(&mut buf[0..4], self.request);
        NativeEndian::write_u32(&mut buf[4..8], self.flags);
        NativeEndian::write_u32(&mut buf[8..12], self.size);
        buf[HEADER_SIZE..].copy_from_slice(&self.payload);
        buf
    }

    pub fn from_bytes(buf: &[u8; ENVELOPE_SIZE]) -> Frame {
        let mut payload = [0u8; PAYLOAD_SIZE];
        payload.copy_from_slice(&buf[HEADER_SIZE..]);

        Frame {
            request: NativeEndian::read_u32(&buf[0..4]),
            flags: NativeEndian::read_u32(&buf[4..8]),
            size: NativeEndian::read_u32(&buf[8..12]),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_pair_roundtrip() {
        let frame = Frame::get_pair(Mode::Server, b"abc");
        let bytes = frame.to_bytes();
        assert_eq!(bytes.len(), ENVELOPE_SIZE);

        let decoded = Frame::from_bytes(&bytes);
        assert_eq!(decoded.request_kind(), Some(RequestKind::GetPair));
        assert_eq!(decoded.flags, PROTOCOL_VERSION);
        assert_eq!(Mode::from_raw(decoded.mode_raw()), Some(Mode::Server));
        assert_eq!(decoded.key_len_raw(), 3);
        assert_eq!(decoded.key(), b"abc");
    }

    #[test]
    fn set_pair_roundtrip() {
        let frame = Frame::set_pair(0);
        let decoded = Frame::from_bytes(&frame.to_bytes());
        assert_eq!(decoded.request_kind(), Some(RequestKind::SetPair));
        assert_eq!(decoded.size, 8);
    }

    #[test]
    fn mode_complements() {
        assert!(Mode::None.complements(Mode::None));
        assert!(Mode::Client.complements(Mode::Server));
        assert!(Mode::Server.complements(Mode::Client));
        assert!(!Mode::Client.complements(Mode::Client));
        assert!(!Mode::Server.complements(Mode::Server));
        assert!(!Mode::None.complements(Mode::Client));
        assert!(!Mode::None.complements(Mode::Server));
    }

    #[test]
    fn envelope_size_is_1040() {
        assert_eq!(ENVELOPE_SIZE, 1040);
    }
}
