//! Worker process entry point: parses configuration, wires up logging, and drives one
//! `broker-core` worker loop to completion. A single process runs exactly one worker bound to one
//! listening path; running several rendezvous spaces means running several processes.

use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, Ordering};

use broker_core::config::{WorkerConfig, DEFAULT_MAX_CLIENTS};
use broker_core::worker::{Worker, SHUTDOWN_BYTE};
use broker_support::logging::{info, warn};
use clap::{App, Arg};

/// Fallback listening path when neither the CLI flag nor `RENDEZVOUS_SOCKET_PATH` is set.
const DEFAULT_SOCKET_NAME: &str = "rendezvous.sock";

/// `sockaddr_un.sun_path` capacity on Linux. A configured path longer than this can never be
/// bound, so it is rejected up front rather than failing deep inside `bind_listener`.
const UNIX_PATH_MAX: usize = 108;

/// Holds the raw fd the shutdown signal handler writes a single byte into. `-1` until installed.
/// `write(2)` is async-signal-safe, which is the only reason touching this from a signal handler
/// is sound.
static SIGNAL_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    let fd = SIGNAL_FD.load(Ordering::SeqCst);
    if fd >= 0 {
        let byte = [SHUTDOWN_BYTE];
        unsafe {
            libc::write(fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn default_socket_path() -> PathBuf {
    std::env::temp_dir().join(DEFAULT_SOCKET_NAME)
}

fn resolve_socket_path(cli_value: Option<&str>, logger: &broker_support::logging::Logger) -> PathBuf {
    let candidate = cli_value
        .map(PathBuf::from)
        .or_else(|| std::env::var("RENDEZVOUS_SOCKET_PATH").ok().map(PathBuf::from));

    match candidate {
        Some(path) if path.as_os_str().len() > UNIX_PATH_MAX => {
            warn!(logger, "configured socket path exceeds platform capacity, using default";
                  "path" => path.display().to_string(), "limit" => UNIX_PATH_MAX);
            default_socket_path()
        }
        Some(path) => path,
        None => default_socket_path(),
    }
}

fn resolve_max_clients(cli_value: Option<&str>) -> usize {
    cli_value
        .and_then(|v| v.parse().ok())
        .or_else(|| std::env::var("RENDEZVOUS_MAX_CLIENTS").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(DEFAULT_MAX_CLIENTS)
}

fn main() {
    let matches = App::new("Rendezvous Broker")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Introduces anonymous local-IPC peers by key.")
        .arg(
            Arg::with_name("socket-path")
                .long("socket-path")
                .takes_value(true)
                .help("Listening socket path (overrides RENDEZVOUS_SOCKET_PATH)"),
        )
        .arg(
            Arg::with_name("max-clients")
                .long("max-clients")
                .takes_value(true)
                .help("Maximum concurrent peers (overrides RENDEZVOUS_MAX_CLIENTS)"),
        )
        .arg(
            Arg::with_name("log-level")
                .long("log-level")
                .takes_value(true)
                .default_value("info")
                .help("Logging level: trace, debug, info, warn, error"),
        )
        .get_matches();

    let logger = broker_support::logging::init(matches.value_of("log-level").unwrap());

    let socket_path = resolve_socket_path(matches.value_of("socket-path"), &logger);
    let max_clients = resolve_max_clients(matches.value_of("max-clients"));

    let (control_here, control_there) = std::os::unix::net::UnixStream::pair().expect("failed to allocate control pair");
    SIGNAL_FD.store(control_here.as_raw_fd(), Ordering::SeqCst);

    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
    }

    let config = WorkerConfig::new(socket_path, 0).with_max_clients(max_clients);

    info!(logger, "rendezvous broker starting";
          "socket_path" => config.socket_path.display().to_string(),
          "max_clients" => config.max_clients);

    let mut worker = Worker::new(config, logger, control_there).expect("failed to start worker");

    // Keep control_here alive for the lifetime of the process: the signal handler writes into its
    // fd, and dropping it here would close that fd out from under the handler.
    std::mem::forget(control_here);

    worker.run().expect("worker loop failed");
}
