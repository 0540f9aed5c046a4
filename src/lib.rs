//! DMQ node library
//!
//! Gossip-based node membership and broadcast messaging for clusters of SIP
//! servers. The [`dmq`] module is transport-agnostic; [`transport`] provides
//! the TCP implementation the `dmq-node` binary runs on.

pub mod config;
pub mod dmq;
pub mod error;
pub mod logging;
pub mod transport;
pub mod version;

pub use dmq::{Dmq, DmqConfig};
pub use error::{Error, ErrorCode, Result};
