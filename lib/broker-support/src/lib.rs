#![allow(clippy::new_without_default)]

pub mod error;
pub mod logging;
pub mod time;

pub use error::{BrokerError, BrokerResult, ErrorKind, ResultExt};
