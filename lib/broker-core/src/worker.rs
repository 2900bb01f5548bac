//! The worker loop: accept, dispatch, pair, evict, sweep, and the restart/shutdown policy around
//! all of it. Everything upstream of this module is a pure library; this is where it becomes an
//! event loop.

use std::mem;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::{Duration, Instant};

use broker_support::logging::{debug, error, info, trace, warn, Logger};
use broker_support::{BrokerError, BrokerResult, ErrorKind};
use rand::Rng;

use crate::config::WorkerConfig;
use crate::frame::{Frame, Mode, RequestKind};
use crate::mux::{Cookie, Multiplexer, ReadyEvent};
use crate::peer::{PeerId, PeerRecord, PeerSlot, PeerState};
use crate::rendezvous::RendezvousTable;
use crate::transport::{recv_frame, send_frame, RecvOutcome};
use crate::validator::validate;

/// The byte the control connection carries to request a graceful shutdown. Any other byte is
/// silently acknowledged, per §4.6.
pub const SHUTDOWN_BYTE: u8 = 0x01;

/// What the worker loop should do after the current tick.
enum TickOutcome {
    Continue,
    Shutdown,
}

/// A tick-ending condition that the caller of `tick` cannot resolve locally.
enum TickFailure {
    /// Loop-fatal but worker-survivable: tear down and rebuild the loop (§4.7).
    Restart,
    /// Fatal to the process: abort (§4.7).
    ProcessFatal(ErrorKind),
}

struct Peer {
    record: PeerRecord,
    stream: UnixStream,
}

impl Peer {
    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Owns one listening endpoint and the peer table behind it. `run` drives the loop until a
/// graceful shutdown completes or the process aborts; loop-fatal failures are handled internally
/// via `restart` and never escape `run`.
pub struct Worker {
    config: WorkerConfig,
    logger: Logger,

    listener: UnixListener,
    control: UnixStream,
    mux: Multiplexer,

    peers: Vec<Option<Peer>>,
    free_slots: Vec<PeerSlot>,
    live_count: usize,
    next_seq: u64,

    rendezvous: RendezvousTable,
    pressure: bool,

    shutting_down: bool,
    drain_deadline: Option<Instant>,
}

impl Worker {
    pub fn new(config: WorkerConfig, logger: Logger, control: UnixStream) -> BrokerResult<Worker> {
        let listener = bind_listener(&config.socket_path)?;
        let mux = Multiplexer::new(config.event_capacity())
            .map_err(|_| BrokerError::Fatal(ErrorKind::Multiplexer))?;

        mux.register(control.as_raw_fd(), Cookie::Control)
            .map_err(|_| BrokerError::Fatal(ErrorKind::Multiplexer))?;
        mux.register(listener.as_raw_fd(), Cookie::Listen)
            .map_err(|_| BrokerError::Fatal(ErrorKind::Multiplexer))?;

        let capacity = config.event_capacity();
        info!(logger, "worker starting"; "worker_id" => config.worker_id, "socket_path" => config.socket_path.display().to_string());

        Ok(Worker {
            config,
            logger,
            listener,
            control,
            mux,
            peers: (0..capacity).map(|_| None).collect(),
            free_slots: Vec::new(),
            live_count: 0,
            next_seq: 0,
            rendezvous: RendezvousTable::new(),
            pressure: false,
            shutting_down: false,
            drain_deadline: None,
        })
    }

    /// Drives the loop to completion. Returns once a graceful shutdown has fully drained;
    /// loop-fatal conditions are absorbed by an internal restart and never returned here.
    pub fn run(&mut self) -> BrokerResult<()> {
        loop {
            match self.tick() {
                Ok(TickOutcome::Continue) => continue,
                Ok(TickOutcome::Shutdown) => {
                    info!(self.logger, "worker shutdown complete"; "worker_id" => self.config.worker_id);
                    return Ok(());
                }
                Err(TickFailure::Restart) => {
                    warn!(self.logger, "worker restarting after loop-fatal error"; "worker_id" => self.config.worker_id);
                    self.restart()?;
                }
                Err(TickFailure::ProcessFatal(kind)) => {
                    error!(self.logger, "worker aborting"; "worker_id" => self.config.worker_id, "reason" => kind.diagnostic());
                    std::process::abort();
                }
            }
        }
    }

    fn tick(&mut self) -> Result<TickOutcome, TickFailure> {
        let timeout = self.drain_deadline.map(|deadline| {
            deadline.saturating_duration_since(Instant::now())
        });

        self.tick_with_timeout(timeout)
    }

    /// Shared by `tick` (real blocking-or-deadline wait) and the test harness (a short bounded
    /// wait, so a test that sends nothing never hangs the suite).
    fn tick_with_timeout(&mut self, timeout: Option<Duration>) -> Result<TickOutcome, TickFailure> {
        let events = self.mux.wait(timeout).map_err(|err| {
            error!(self.logger, "multiplexer wait failed"; "error" => err.to_string());
            TickFailure::Restart
        })?;

        for event in events {
            self.dispatch(event)?;
        }

        if self.shutting_down && self.drain_complete() {
            self.terminate_all_peers();
            return Ok(TickOutcome::Shutdown);
        }

        self.sweep()?;
        Ok(TickOutcome::Continue)
    }

    fn dispatch(&mut self, event: ReadyEvent) -> Result<(), TickFailure> {
        match event.cookie {
            Cookie::Control => self.handle_control(event),
            Cookie::Listen => self.handle_listen(event),
            Cookie::Peer(slot) => {
                self.handle_peer(slot, event);
                Ok(())
            }
        }
    }

    fn handle_control(&mut self, event: ReadyEvent) -> Result<(), TickFailure> {
        if event.error {
            return Err(TickFailure::ProcessFatal(ErrorKind::Io(std::io::ErrorKind::BrokenPipe)));
        }

        use std::io::Read;
        let mut byte = [0u8; 1];
        match self.control.read(&mut byte) {
            Ok(0) => Err(TickFailure::ProcessFatal(ErrorKind::Io(std::io::ErrorKind::UnexpectedEof))),
            Ok(_) => {
                if byte[0] == SHUTDOWN_BYTE && !self.shutting_down {
                    self.begin_shutdown();
                }
                Ok(())
            }
            Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(_) => Err(TickFailure::ProcessFatal(ErrorKind::Io(std::io::ErrorKind::BrokenPipe))),
        }
    }

    fn begin_shutdown(&mut self) {
        info!(self.logger, "worker draining for shutdown"; "worker_id" => self.config.worker_id);
        let _ = self.mux.deregister(self.listener.as_raw_fd());
        self.shutting_down = true;
        self.drain_deadline = Some(Instant::now() + self.config.drain_deadline);
    }

    fn drain_complete(&self) -> bool {
        let deadline_passed = self
            .drain_deadline
            .map_or(false, |deadline| Instant::now() >= deadline);

        let no_waiters = self
            .peers
            .iter()
            .flatten()
            .all(|peer| peer.record.state != PeerState::PairRequested);

        deadline_passed || no_waiters
    }

    fn terminate_all_peers(&mut self) {
        for slot_idx in 0..self.peers.len() {
            if let Some(peer) = self.peers[slot_idx].take() {
                let _ = self.mux.deregister(peer.fd());
                self.rendezvous.remove(PeerSlot(slot_idx));
                drop(peer);
                self.live_count -= 1;
            }
        }
    }

    /// Drains the accept backlog to `WouldBlock`. mio's epoll backend is edge-triggered
    /// regardless of the requested `Interest`, so a single `accept()` per readiness notification
    /// would starve any connection queued behind the first; looping here is what makes "accept
    /// one peer" (§4.6) safe to read as "accept everything this edge announced".
    fn handle_listen(&mut self, event: ReadyEvent) -> Result<(), TickFailure> {
        if event.error {
            return Err(TickFailure::Restart);
        }

        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        warn!(self.logger, "failed to set accepted peer non-blocking"; "error" => err.to_string());
                        continue;
                    }
                    self.admit(stream);
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref err) if is_descriptor_exhaustion(err) => {
                    self.pressure = true;
                    return Ok(());
                }
                Err(err) => {
                    warn!(self.logger, "accept failed"; "error" => err.to_string());
                    return Ok(());
                }
            }
        }
    }

    fn admit(&mut self, stream: UnixStream) {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                let slot = PeerSlot(self.peers.len());
                self.peers.push(None);
                slot
            }
        };

        let id = PeerId::new(self.config.worker_id, self.next_seq, stream.as_raw_fd());
        self.next_seq += 1;

        if let Err(err) = self.mux.register(stream.as_raw_fd(), Cookie::Peer(slot)) {
            warn!(self.logger, "failed to register accepted peer"; "peer" => id.to_string(), "error" => err.to_string());
            return;
        }

        debug!(self.logger, "peer accepted"; "peer" => id.to_string());
        self.peers[slot.0] = Some(Peer { record: PeerRecord::new(id), stream });
        self.live_count += 1;
    }

    /// Reads every frame already buffered on this connection, for the same edge-triggered reason
    /// `handle_listen` loops: a single recv per notification could leave a second, already-arrived
    /// frame stranded until unrelated traffic re-triggers the edge. Stops as soon as the peer
    /// reaches a terminal state or the socket would block.
    fn handle_peer(&mut self, slot: PeerSlot, event: ReadyEvent) {
        if event.error {
            self.mark_dead(slot, ErrorKind::Io(std::io::ErrorKind::BrokenPipe));
            return;
        }

        loop {
            let fd = match &self.peers[slot.0] {
                Some(peer) => peer.fd(),
                None => return,
            };

            match recv_frame(fd) {
                Ok(RecvOutcome::Eof) => {
                    self.mark_dead(slot, ErrorKind::Io(std::io::ErrorKind::UnexpectedEof));
                    return;
                }
                Ok(RecvOutcome::Frame(frame, fds)) => {
                    close_fds(&fds);
                    self.process_frame(slot, frame);
                    if self.peer_is_terminal(slot) {
                        return;
                    }
                }
                Err(BrokerError::Wait) => return,
                Err(BrokerError::Fatal(kind)) => {
                    self.mark_dead(slot, kind);
                    return;
                }
            }
        }
    }

    fn peer_is_terminal(&self, slot: PeerSlot) -> bool {
        self.peers[slot.0]
            .as_ref()
            .map_or(true, |peer| peer.record.state.is_terminal())
    }

    fn process_frame(&mut self, slot: PeerSlot, frame: Frame) {
        let peer_id = match &self.peers[slot.0] {
            Some(peer) => peer.record.id,
            None => return,
        };

        let already_requested = matches!(
            self.peers[slot.0].as_ref().map(|p| p.record.state),
            Some(PeerState::PairRequested)
        );

        if already_requested {
            debug!(self.logger, "second request on connection"; "peer" => peer_id.to_string());
            self.mark_dead(slot, ErrorKind::UnexpectedRequest);
            return;
        }

        match validate(&frame, 0, Some(&[RequestKind::GetPair])) {
            Ok(RequestKind::GetPair) => {
                let mode = Mode::from_raw(frame.mode_raw()).expect("validated mode");
                let key = frame.key().to_vec();

                if let Some(peer) = self.peers[slot.0].as_mut() {
                    peer.record.enter_pair_requested(key.clone(), mode);
                }

                match self.rendezvous.match_or_wait(&key, slot, mode) {
                    Some(waiter) => self.fulfill_pair(waiter, slot),
                    None => {
                        debug!(self.logger, "peer waiting for rendezvous"; "peer" => peer_id.to_string());
                    }
                }
            }
            Ok(_) | Err(BrokerError::Wait) => unreachable!("allow-list restricts to GetPair"),
            Err(BrokerError::Fatal(kind)) => {
                debug!(self.logger, "validator rejected frame"; "peer" => peer_id.to_string(), "reason" => kind.diagnostic());
                self.mark_dead(slot, kind);
            }
        }
    }

    fn fulfill_pair(&mut self, waiter: PeerSlot, requester: PeerSlot) {
        let (e0, e1) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(err) => {
                warn!(self.logger, "pair allocation failed"; "error" => err.to_string());
                self.mark_dead(waiter, ErrorKind::PairAllocation);
                self.mark_dead(requester, ErrorKind::PairAllocation);
                return;
            }
        };

        let frame = Frame::set_pair(0);

        let waiter_fd = match &self.peers[waiter.0] {
            Some(peer) => peer.fd(),
            None => return,
        };
        let requester_fd = match &self.peers[requester.0] {
            Some(peer) => peer.fd(),
            None => return,
        };

        let waiter_id = self.peers[waiter.0].as_ref().map(|p| p.record.id);
        let requester_id = self.peers[requester.0].as_ref().map(|p| p.record.id);

        if let Err(err) = send_frame(waiter_fd, &frame, &[e0.as_raw_fd()]) {
            warn!(self.logger, "failed to deliver pair to waiter"; "error" => format!("{:?}", err));
            self.mark_dead(waiter, ErrorKind::Io(std::io::ErrorKind::BrokenPipe));
            // The requester never entered the table for this attempt; put it back so a future
            // arrival can still match it. A third complementary peer may already be waiting on
            // this key, in which case match_or_wait matches them immediately instead of parking
            // the requester -- that pair still needs fulfilling, same as any other match.
            if let Some(peer) = self.peers[requester.0].as_ref() {
                if let (Some(key), Some(mode)) = (peer.record.key.clone(), peer.record.mode) {
                    if let Some(other_waiter) = self.rendezvous.match_or_wait(&key, requester, mode) {
                        self.fulfill_pair(other_waiter, requester);
                    }
                }
            }
            return;
        }

        if let Err(err) = send_frame(requester_fd, &frame, &[e1.as_raw_fd()]) {
            warn!(self.logger, "failed to deliver pair to requester"; "error" => format!("{:?}", err));
            self.mark_dead(waiter, ErrorKind::Io(std::io::ErrorKind::BrokenPipe));
            self.mark_dead(requester, ErrorKind::Io(std::io::ErrorKind::BrokenPipe));
            return;
        }

        info!(self.logger, "pair fulfilled";
              "waiter" => waiter_id.map_or_else(String::new, |id| id.to_string()),
              "requester" => requester_id.map_or_else(String::new, |id| id.to_string()));

        self.mark_state(waiter, PeerState::Complete);
        self.mark_state(requester, PeerState::Complete);
    }

    fn mark_dead(&mut self, slot: PeerSlot, reason: ErrorKind) {
        if let Some(peer) = self.peers[slot.0].as_mut() {
            if peer.record.state == PeerState::PairRequested {
                self.rendezvous.remove(slot);
            }
            trace!(self.logger, "peer marked dead"; "peer" => peer.record.id.to_string(), "reason" => reason.diagnostic());
            peer.record.state = PeerState::Dead;
        }
    }

    fn mark_state(&mut self, slot: PeerSlot, state: PeerState) {
        if let Some(peer) = self.peers[slot.0].as_mut() {
            peer.record.state = state;
        }
    }

    /// The end-of-tick sweep: admission-pressure eviction, then terminal-state cleanup.
    fn sweep(&mut self) -> Result<(), TickFailure> {
        self.evict_under_pressure();
        self.cleanup()
    }

    fn evict_under_pressure(&mut self) {
        let pressure = mem::replace(&mut self.pressure, false);
        let near_capacity = self.live_count + 2 >= self.config.max_clients;

        if !(pressure || near_capacity) || self.live_count == 0 {
            return;
        }

        let live_slots: Vec<usize> = self
            .peers
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx))
            .collect();

        if live_slots.is_empty() {
            return;
        }

        let victim_idx = live_slots[rand::thread_rng().gen_range(0..live_slots.len())];
        if let Some(peer) = self.peers[victim_idx].as_mut() {
            warn!(self.logger, "evicting peer under admission pressure"; "peer" => peer.record.id.to_string());
            if peer.record.state == PeerState::PairRequested {
                self.rendezvous.remove(PeerSlot(victim_idx));
            }
            peer.record.state = PeerState::Victim;
        }
    }

    fn cleanup(&mut self) -> Result<(), TickFailure> {
        for slot_idx in 0..self.peers.len() {
            let is_terminal = self.peers[slot_idx]
                .as_ref()
                .map_or(false, |peer| peer.record.state.is_terminal());

            if !is_terminal {
                continue;
            }

            let peer = self.peers[slot_idx].take().expect("checked above");
            debug!(self.logger, "peer disconnected"; "peer" => peer.record.id.to_string());

            if let Err(err) = self.mux.deregister(peer.fd()) {
                error!(self.logger, "deregistration failed"; "error" => err.to_string());
                return Err(TickFailure::Restart);
            }

            drop(peer);
            self.free_slots.push(PeerSlot(slot_idx));
            self.live_count -= 1;
        }

        Ok(())
    }

    /// Tears everything down and rebuilds a fresh loop bound to the same path. The control
    /// connection is untouched.
    fn restart(&mut self) -> BrokerResult<()> {
        for slot in self.peers.iter_mut() {
            if let Some(peer) = slot.take() {
                drop(peer);
            }
        }
        self.free_slots.clear();
        self.live_count = 0;
        self.rendezvous = RendezvousTable::new();
        self.pressure = false;

        self.listener = bind_listener(&self.config.socket_path)?;
        self.mux = Multiplexer::new(self.config.event_capacity())
            .map_err(|_| BrokerError::Fatal(ErrorKind::Multiplexer))?;
        self.mux
            .register(self.control.as_raw_fd(), Cookie::Control)
            .map_err(|_| BrokerError::Fatal(ErrorKind::Multiplexer))?;
        self.mux
            .register(self.listener.as_raw_fd(), Cookie::Listen)
            .map_err(|_| BrokerError::Fatal(ErrorKind::Multiplexer))?;

        info!(self.logger, "worker restarted"; "worker_id" => self.config.worker_id);
        Ok(())
    }
}

fn bind_listener(path: &Path) -> BrokerResult<UnixListener> {
    let _ = std::fs::remove_file(path);
    let listener = UnixListener::bind(path)?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn is_descriptor_exhaustion(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE)
    )
}

fn close_fds(fds: &[RawFd]) {
    for fd in fds {
        unsafe {
            libc::close(*fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_KEY_LEN;
    use std::os::unix::io::FromRawFd;

    fn test_worker(path: &Path) -> (Worker, UnixStream) {
        let (control_here, control_there) = UnixStream::pair().expect("control pair");
        control_there.set_nonblocking(true).expect("nonblocking");
        let config = WorkerConfig::new(path.to_path_buf(), 1).with_max_clients(16);
        let worker = Worker::new(config, broker_support::logging::discard(), control_there).expect("worker");
        (worker, control_here)
    }

    fn connect(path: &Path) -> UnixStream {
        let stream = UnixStream::connect(path).expect("connect");
        stream.set_nonblocking(true).expect("nonblocking");
        stream
    }

    fn send_get_pair(stream: &UnixStream, mode: Mode, key: &[u8]) {
        let frame = Frame::get_pair(mode, key);
        send_frame(stream.as_raw_fd(), &frame, &[]).expect("send get_pair");
    }

    fn drain_ticks(worker: &mut Worker, n: usize) {
        for _ in 0..n {
            worker.tick_pub();
        }
    }

    impl Worker {
        /// A test-only tick bounded by a short timeout, so a tick with nothing pending returns
        /// instead of blocking the suite forever the way the real `tick`'s indefinite wait would.
        fn tick_pub(&mut self) {
            let _ = self.tick_with_timeout(Some(Duration::from_millis(200)));
        }
    }

    #[test]
    fn directional_rendezvous_delivers_connected_descriptors() {
        let dir = std::env::temp_dir().join(format!("broker-test-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let (mut worker, _control) = test_worker(&dir);

        let a = connect(&dir);
        let b = connect(&dir);
        worker.tick_pub();

        send_get_pair(&a, Mode::Server, b"abc");
        send_get_pair(&b, Mode::Client, b"abc");
        drain_ticks(&mut worker, 4);

        let mut buf_a = [0u8; crate::frame::ENVELOPE_SIZE];
        let mut buf_b = [0u8; crate::frame::ENVELOPE_SIZE];
        let mut fds_a = [0 as RawFd; crate::frame::MAX_FDS];
        let mut fds_b = [0 as RawFd; crate::frame::MAX_FDS];

        let (_, n_a) = crate::fd_passing::recv_with_fds(a.as_raw_fd(), &mut buf_a, &mut fds_a).expect("recv a");
        let (_, n_b) = crate::fd_passing::recv_with_fds(b.as_raw_fd(), &mut buf_b, &mut fds_b).expect("recv b");
        assert_eq!(n_a, 1);
        assert_eq!(n_b, 1);

        let ea = unsafe { UnixStream::from_raw_fd(fds_a[0]) };
        let eb = unsafe { UnixStream::from_raw_fd(fds_b[0]) };
        use std::io::{Read, Write};
        let mut eb_nb = eb;
        eb_nb.set_nonblocking(false).unwrap();
        let mut ea_nb = ea;
        ea_nb.set_nonblocking(false).unwrap();
        ea_nb.write_all(b"ping").unwrap();
        let mut out = [0u8; 4];
        eb_nb.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"ping");

        let _ = dir;
        let _ = std::fs::remove_file(&dir);
    }

    #[test]
    fn bad_key_len_disconnects_peer() {
        let dir = std::env::temp_dir().join(format!("broker-test-kl-{}", std::process::id()));
        let _ = std::fs::remove_file(&dir);
        let (mut worker, _control) = test_worker(&dir);
        let a = connect(&dir);
        worker.tick_pub();

        let mut bytes = Frame::get_pair(Mode::Server, b"x").to_bytes();
        bytes[14] = 0;
        bytes[15] = 0;
        send_frame(a.as_raw_fd(), &Frame::from_bytes(&bytes), &[]).expect("send bad frame");
        drain_ticks(&mut worker, 2);

        assert_eq!(worker.live_count, 0);
        let _ = MAX_KEY_LEN;
        let _ = std::fs::remove_file(&dir);
    }
}
