//! The counterparty side of the rendezvous wire protocol: connect to a running broker, present a
//! key and a role, and get back the connected endpoint the broker matched it with. Links against
//! `broker-core` for the frame codec and transport rather than re-implementing either.

use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use broker_core::frame::{Frame, Mode, RequestKind, MAX_KEY_LEN};
use broker_core::transport::{recv_frame, send_frame, RecvOutcome};
use broker_core::validator::validate;
use broker_support::{BrokerError, BrokerResult, ErrorKind};

/// Connects to the broker listening at `socket_path`, sends `GET_PAIR` with `mode` and `key`, and
/// blocks until the matching `SET_PAIR` arrives. Returns the connected endpoint the broker handed
/// back; the connection used to talk to the broker is dropped once the exchange completes.
pub fn request_pair(socket_path: &Path, mode: Mode, key: &[u8]) -> BrokerResult<UnixStream> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(BrokerError::Fatal(ErrorKind::BadKeyLen));
    }

    let stream = UnixStream::connect(socket_path).map_err(BrokerError::from)?;
    let fd = stream.as_raw_fd();

    send_frame(fd, &Frame::get_pair(mode, key), &[])?;

    loop {
        match recv_frame(fd)? {
            RecvOutcome::Eof => return Err(BrokerError::Fatal(ErrorKind::Io(std::io::ErrorKind::UnexpectedEof))),
            RecvOutcome::Frame(frame, fds) => {
                if let Err(err) = validate(&frame, fds.len(), Some(&[RequestKind::SetPair])) {
                    for fd in fds {
                        unsafe {
                            libc::close(fd);
                        }
                    }
                    return Err(err);
                }
                return Ok(unsafe { UnixStream::from_raw_fd(fds[0]) });
            }
        }
    }
}

/// The symmetric variant of [`request_pair`]: both sides present `Mode::None`, so neither declares
/// a directional role.
pub fn request_pair_symmetric(socket_path: &Path, key: &[u8]) -> BrokerResult<UnixStream> {
    request_pair(socket_path, Mode::None, key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_core::{Worker, WorkerConfig, SHUTDOWN_BYTE};
    use std::io::{Read, Write};
    use std::thread;
    use std::time::Duration;

    fn socket_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("broker-client-test-{}-{}", tag, std::process::id()))
    }

    #[test]
    fn directional_round_trip_against_a_live_worker() {
        let path = socket_path("directional");
        let _ = std::fs::remove_file(&path);

        let (control_here, control_there) = UnixStream::pair().expect("control pair");
        let config = WorkerConfig::new(path.clone(), 1).with_max_clients(16);
        let mut worker = Worker::new(config, broker_support::logging::discard(), control_there).expect("worker");

        let handle = thread::spawn(move || worker.run());

        // Give the worker a moment to bind and start its loop.
        thread::sleep(Duration::from_millis(50));

        let client_a = thread::spawn({
            let path = path.clone();
            move || request_pair(&path, Mode::Server, b"abc").expect("A's request")
        });
        let client_b = thread::spawn({
            let path = path.clone();
            move || request_pair(&path, Mode::Client, b"abc").expect("B's request")
        });

        let mut endpoint_a = client_a.join().expect("A joined");
        let mut endpoint_b = client_b.join().expect("B joined");

        endpoint_a.write_all(b"ping").expect("write on A's endpoint");
        let mut buf = [0u8; 4];
        endpoint_b.read_exact(&mut buf).expect("read on B's endpoint");
        assert_eq!(&buf, b"ping");

        let mut control_here = control_here;
        control_here.write_all(&[SHUTDOWN_BYTE]).expect("send shutdown");
        handle.join().expect("worker thread joined").expect("worker run");

        let _ = std::fs::remove_file(&path);
    }
}
