#![allow(clippy::new_without_default)]

pub mod config;
pub mod fd_passing;
pub mod frame;
pub mod mux;
pub mod peer;
pub mod rendezvous;
pub mod transport;
pub mod validator;
pub mod worker;

pub use config::WorkerConfig;
pub use frame::{Frame, Mode, RequestKind};
pub use mux::{Cookie, Multiplexer, ReadyEvent};
pub use peer::{PeerId, PeerSlot, PeerState};
pub use worker::{Worker, SHUTDOWN_BYTE};
