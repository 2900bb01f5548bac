//! Binds the frame codec to descriptor-passing I/O on one peer connection. One `recv_frame`/
//! `send_frame` call corresponds to exactly one envelope, matching the "one wakeup, one frame"
//! contract the worker loop relies on.

use std::io;
use std::os::unix::io::RawFd;

use broker_support::{BrokerError, BrokerResult, ErrorKind};

use crate::fd_passing::{recv_with_fds, send_with_fds};
use crate::frame::{Frame, ENVELOPE_SIZE, MAX_FDS};

/// The result of one decode attempt.
pub enum RecvOutcome {
    /// A well-formed envelope, plus whatever descriptors rode along with it.
    Frame(Frame, Vec<RawFd>),
    /// Zero bytes read: the peer closed its write side.
    Eof,
}

/// Reads exactly one envelope (and its ancillary descriptors, if any) from `fd`. A short read
/// (more than zero but fewer than `ENVELOPE_SIZE` bytes) is treated as a transport error rather
/// than buffered for a follow-up read, per the fixed-envelope contract.
pub fn recv_frame(fd: RawFd) -> BrokerResult<RecvOutcome> {
    let mut buf = [0u8; ENVELOPE_SIZE];
    let mut fds = [0 as RawFd; MAX_FDS];

    let (n, n_fds) = recv_with_fds(fd, &mut buf, &mut fds)?;

    if n == 0 {
        return Ok(RecvOutcome::Eof);
    }

    if n != ENVELOPE_SIZE {
        for fd in &fds[..n_fds] {
            unsafe {
                libc::close(*fd);
            }
        }
        return Err(BrokerError::Fatal(ErrorKind::Io(io::ErrorKind::UnexpectedEof)));
    }

    let frame = Frame::from_bytes(&buf);
    Ok(RecvOutcome::Frame(frame, fds[..n_fds].to_vec()))
}

/// Writes `frame`'s envelope and attaches `out_fds` as ancillary data. Fails with
/// `ArgumentTooLarge` rather than attempting a send when `out_fds.len() > MAX_FDS`.
pub fn send_frame(fd: RawFd, frame: &Frame, out_fds: &[RawFd]) -> BrokerResult<()> {
    if out_fds.len() > MAX_FDS {
        return Err(BrokerError::Fatal(ErrorKind::ArgumentTooLarge));
    }

    let bytes = frame.to_bytes();
    let sent = send_with_fds(fd, &bytes, out_fds)?;

    if sent != ENVELOPE_SIZE {
        return Err(BrokerError::Fatal(ErrorKind::Io(io::ErrorKind::WriteZero)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Mode;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn sends_and_receives_a_get_pair_frame() {
        let (a, b) = UnixStream::pair().expect("create socketpair");
        let frame = Frame::get_pair(Mode::Server, b"abc");
        send_frame(a.as_raw_fd(), &frame, &[]).expect("send_frame");

        match recv_frame(b.as_raw_fd()).expect("recv_frame") {
            RecvOutcome::Frame(decoded, fds) => {
                assert_eq!(decoded.key(), b"abc");
                assert!(fds.is_empty());
            }
            RecvOutcome::Eof => panic!("expected a frame, got eof"),
        }
    }

    #[test]
    fn sends_and_receives_a_set_pair_frame_with_one_fd() {
        let (a, b) = UnixStream::pair().expect("create socketpair");
        let (extra_a, extra_b) = UnixStream::pair().expect("create extra socketpair");
        let frame = Frame::set_pair(0);
        send_frame(a.as_raw_fd(), &frame, &[extra_a.as_raw_fd()]).expect("send_frame");

        match recv_frame(b.as_raw_fd()).expect("recv_frame") {
            RecvOutcome::Frame(decoded, fds) => {
                assert_eq!(decoded.request_kind(), Some(crate::frame::RequestKind::SetPair));
                assert_eq!(fds.len(), 1);
                unsafe {
                    libc::close(fds[0]);
                }
            }
            RecvOutcome::Eof => panic!("expected a frame, got eof"),
        }

        drop(extra_b);
    }

    #[test]
    fn eof_on_peer_hangup() {
        let (a, b) = UnixStream::pair().expect("create socketpair");
        drop(a);
        match recv_frame(b.as_raw_fd()).expect("recv_frame") {
            RecvOutcome::Eof => {}
            RecvOutcome::Frame(..) => panic!("expected eof"),
        }
    }
}
