//! Enforces the ordered predicate chain every inbound frame must pass. Mirrors this codebase's
//! habit of keeping validation as a pure function over already-decoded data, separate from the
//! transport that produced it.

use crate::frame::{Frame, Mode, RequestKind, MAX_KEY_LEN, PROTOCOL_VERSION, VERSION_MASK};
use broker_support::{BrokerError, BrokerResult, ErrorKind};

/// Validates a decoded frame against the protocol invariants, in the order specified: version,
/// reserved flags, request kind, declared size, descriptor count, the optional allow-list, and
/// finally request-specific fields. Returns the first failing predicate's `ErrorKind`.
pub fn validate(frame: &Frame, n_fds: usize, allowed: Option<&[RequestKind]>) -> BrokerResult<RequestKind> {
    if frame.flags & VERSION_MASK != PROTOCOL_VERSION {
        return Err(BrokerError::Fatal(ErrorKind::UnsupportedVersion));
    }

    if frame.flags & !VERSION_MASK != 0 {
        return Err(BrokerError::Fatal(ErrorKind::UnsupportedFlags));
    }

    let kind = match RequestKind::from_raw(frame.request) {
        Some(RequestKind::GetPair) => RequestKind::GetPair,
        Some(RequestKind::SetPair) => RequestKind::SetPair,
        _ => return Err(BrokerError::Fatal(ErrorKind::BadRequest)),
    };

    if frame.size != kind.expected_payload_size() {
        return Err(BrokerError::Fatal(ErrorKind::BadSize));
    }

    if n_fds != kind.expected_fd_count() {
        return Err(BrokerError::Fatal(ErrorKind::BadFdCount));
    }

    if let Some(allowed) = allowed {
        if !allowed.contains(&kind) {
            return Err(BrokerError::Fatal(ErrorKind::UnexpectedRequest));
        }
    }

    if kind == RequestKind::GetPair {
        if Mode::from_raw(frame.mode_raw()).is_none() {
            return Err(BrokerError::Fatal(ErrorKind::BadMode));
        }

        let key_len = frame.key_len_raw() as usize;
        if key_len == 0 || key_len > MAX_KEY_LEN {
            return Err(BrokerError::Fatal(ErrorKind::BadKeyLen));
        }
    }

    Ok(kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PROTOCOL_VERSION;

    fn well_formed() -> Frame {
        Frame::get_pair(Mode::Server, b"abc")
    }

    #[test]
    fn accepts_well_formed_get_pair() {
        let frame = well_formed();
        assert_eq!(validate(&frame, 0, Some(&[RequestKind::GetPair])), Ok(RequestKind::GetPair));
    }

    #[test]
    fn rejects_bad_version() {
        let mut frame = well_formed();
        frame.flags = 0x2;
        assert_eq!(
            validate(&frame, 0, None),
            Err(BrokerError::Fatal(ErrorKind::UnsupportedVersion))
        );
    }

    #[test]
    fn rejects_reserved_flag_bits() {
        let mut frame = well_formed();
        frame.flags = PROTOCOL_VERSION | 0x10;
        assert_eq!(
            validate(&frame, 0, None),
            Err(BrokerError::Fatal(ErrorKind::UnsupportedFlags))
        );
    }

    #[test]
    fn rejects_bad_request() {
        let mut frame = well_formed();
        frame.request = 99;
        assert_eq!(validate(&frame, 0, None), Err(BrokerError::Fatal(ErrorKind::BadRequest)));
    }

    #[test]
    fn rejects_bad_size() {
        let mut frame = well_formed();
        frame.size = 3;
        assert_eq!(validate(&frame, 0, None), Err(BrokerError::Fatal(ErrorKind::BadSize)));
    }

    #[test]
    fn rejects_bad_fd_count() {
        let frame = well_formed();
        assert_eq!(validate(&frame, 1, None), Err(BrokerError::Fatal(ErrorKind::BadFdCount)));
    }

    #[test]
    fn rejects_unexpected_request() {
        let frame = well_formed();
        assert_eq!(
            validate(&frame, 0, Some(&[RequestKind::SetPair])),
            Err(BrokerError::Fatal(ErrorKind::UnexpectedRequest))
        );
    }

    #[test]
    fn rejects_bad_mode() {
        let mut frame = well_formed();
        // Stomp the mode field directly; 3 is out of range.
        let mut bytes = frame.to_bytes();
        bytes[12] = 3;
        bytes[13] = 0;
        frame = Frame::from_bytes(&bytes);
        assert_eq!(validate(&frame, 0, None), Err(BrokerError::Fatal(ErrorKind::BadMode)));
    }

    #[test]
    fn rejects_zero_key_len() {
        let mut bytes = well_formed().to_bytes();
        bytes[14] = 0;
        bytes[15] = 0;
        let frame = Frame::from_bytes(&bytes);
        assert_eq!(validate(&frame, 0, None), Err(BrokerError::Fatal(ErrorKind::BadKeyLen)));
    }

    #[test]
    fn rejects_oversized_key_len() {
        let mut bytes = well_formed().to_bytes();
        bytes[14] = 0xff;
        bytes[15] = 0xff;
        let frame = Frame::from_bytes(&bytes);
        assert_eq!(validate(&frame, 0, None), Err(BrokerError::Fatal(ErrorKind::BadKeyLen)));
    }

    #[test]
    fn accepts_well_formed_set_pair() {
        let frame = Frame::set_pair(0);
        assert_eq!(validate(&frame, 1, Some(&[RequestKind::SetPair])), Ok(RequestKind::SetPair));
    }
}
