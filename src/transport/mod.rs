//! Network transports for DMQ
//!
//! The DMQ core only knows the [`Transport`](crate::dmq::Transport) trait.
//! This module provides the TCP implementation used by the `dmq-node`
//! binary.

pub mod tcp;
pub mod wire;

pub use tcp::{serve, socket_target, TcpConfig, TcpTransport, DEFAULT_SIP_PORT};
pub use wire::{read_frame, write_frame, WireMessage, DEFAULT_MAX_FRAME};
