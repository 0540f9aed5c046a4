//! Error types for the DMQ node
//!
//! Provides structured error handling with:
//! - Numeric error codes for machine parsing
//! - User-friendly messages with suggestions
//! - Reply status mapping for inbound DMQ requests
//! - Exit codes for CLI

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for DMQ operations
pub type Result<T> = std::result::Result<T, Error>;

/// Numeric error codes for machine parsing and documentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    // Configuration errors (1xx)
    ConfigNotFound = 100,
    ConfigParseError = 101,
    ConfigValidation = 102,

    // IO errors (2xx)
    IoRead = 200,
    IoWrite = 201,
    IoPermission = 202,
    IoNotFound = 203,

    // Transport / messaging errors (3xx)
    ConnectionFailed = 300,
    ConnectionTimeout = 301,
    SendRejected = 302,
    PartialBroadcastFailure = 303,

    // Protocol errors (4xx)
    ProtocolMalformed = 400,
    MalformedGossipBody = 401,
    FrameTooLarge = 402,

    // Peer errors (5xx)
    DuplicatePeer = 500,
    PeerNotFound = 501,
    HandlerFailed = 502,

    // Resource errors (7xx)
    AllocationFailure = 700,
    ShuttingDown = 701,

    // Internal errors (9xx)
    InternalError = 900,
}

impl ErrorCode {
    /// Get the string code (e.g., "E100")
    pub fn as_str(&self) -> String {
        format!("E{}", *self as u16)
    }

    /// Get the exit code for CLI (maps to 1-125 range)
    pub fn exit_code(&self) -> i32 {
        match *self as u16 {
            100..=199 => 10, // Config errors
            200..=299 => 20, // IO errors
            300..=399 => 30, // Transport errors
            400..=499 => 40, // Protocol errors
            500..=599 => 50, // Peer errors
            700..=799 => 70, // Resource errors
            900..=999 => 90, // Internal errors
            _ => 1,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Main error type for the DMQ node
#[derive(Error, Debug)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    ConfigNotFound {
        path: PathBuf,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Configuration parse error
    #[error("Failed to parse configuration: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<toml::de::Error>,
    },

    /// Configuration validation error
    #[error("Configuration validation failed: {message}")]
    ConfigValidation { message: String, field: Option<String> },

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    // ─────────────────────────────────────────────────────────────
    // IO Errors
    // ─────────────────────────────────────────────────────────────

    /// File read error
    #[error("Failed to read file: {path}")]
    IoRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File write error
    #[error("Failed to write file: {path}")]
    IoWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Generic IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML serialization error
    #[error("TOML serialization error: {0}")]
    Toml(#[from] toml::ser::Error),

    /// JSON frame encoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Transport / Messaging Errors
    // ─────────────────────────────────────────────────────────────

    /// Could not reach a node
    #[error("Failed to connect to {addr}: {message}")]
    ConnectionFailed { addr: String, message: String },

    /// Node did not answer in time
    #[error("Request to {addr} timed out after {timeout_ms}ms")]
    ConnectionTimeout { addr: String, timeout_ms: u64 },

    /// The transport refused to accept a request
    #[error("Send to {target} rejected: {reason}")]
    SendRejected { target: String, reason: String },

    /// At least one unicast of a broadcast was rejected
    #[error("Broadcast partially failed: {failed} of {attempted} sends rejected")]
    PartialBroadcastFailure { failed: usize, attempted: usize },

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────

    /// Membership body could not be parsed
    #[error("Malformed gossip body: {reason}")]
    MalformedGossipBody { reason: String },

    /// Frame length prefix above the configured maximum
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Generic protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    // ─────────────────────────────────────────────────────────────
    // Peer Errors
    // ─────────────────────────────────────────────────────────────

    /// A peer with the same id is already registered
    #[error("Peer already registered: {peer_id}")]
    DuplicatePeer { peer_id: String },

    /// No peer registered under the addressed id
    #[error("No such destination: {peer_id}")]
    PeerNotFound { peer_id: String },

    /// A peer handler failed while processing a job
    #[error("Peer {peer_id} handler failed: {message}")]
    Handler { peer_id: String, message: String },

    // ─────────────────────────────────────────────────────────────
    // Resource Errors
    // ─────────────────────────────────────────────────────────────

    /// Could not grow a registry or queue
    #[error("Allocation failure: {what}")]
    AllocationFailure { what: String },

    /// Work submitted after shutdown began
    #[error("DMQ is shutting down")]
    ShuttingDown,

    // ─────────────────────────────────────────────────────────────
    // Internal Errors
    // ─────────────────────────────────────────────────────────────

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    // ─────────────────────────────────────────────────────────────
    // Error Classification
    // ─────────────────────────────────────────────────────────────

    /// Get the numeric error code
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::ConfigNotFound { .. } => ErrorCode::ConfigNotFound,
            Error::ConfigParse { .. } => ErrorCode::ConfigParseError,
            Error::ConfigValidation { .. } => ErrorCode::ConfigValidation,
            Error::Config(_) => ErrorCode::ConfigValidation,

            Error::IoRead { .. } => ErrorCode::IoRead,
            Error::IoWrite { .. } => ErrorCode::IoWrite,
            Error::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorCode::IoNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorCode::IoPermission,
                _ => ErrorCode::IoRead,
            },
            Error::Toml(_) => ErrorCode::ConfigParseError,
            Error::Json(_) => ErrorCode::ProtocolMalformed,

            Error::ConnectionFailed { .. } => ErrorCode::ConnectionFailed,
            Error::ConnectionTimeout { .. } => ErrorCode::ConnectionTimeout,
            Error::SendRejected { .. } => ErrorCode::SendRejected,
            Error::PartialBroadcastFailure { .. } => ErrorCode::PartialBroadcastFailure,

            Error::MalformedGossipBody { .. } => ErrorCode::MalformedGossipBody,
            Error::FrameTooLarge { .. } => ErrorCode::FrameTooLarge,
            Error::Protocol(_) => ErrorCode::ProtocolMalformed,

            Error::DuplicatePeer { .. } => ErrorCode::DuplicatePeer,
            Error::PeerNotFound { .. } => ErrorCode::PeerNotFound,
            Error::Handler { .. } => ErrorCode::HandlerFailed,

            Error::AllocationFailure { .. } => ErrorCode::AllocationFailure,
            Error::ShuttingDown => ErrorCode::ShuttingDown,

            Error::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionFailed { .. }
                | Error::ConnectionTimeout { .. }
                | Error::SendRejected { .. }
                | Error::PartialBroadcastFailure { .. }
                | Error::AllocationFailure { .. }
                | Error::Io(_)
        )
    }

    /// Status code sent back to the node that addressed us, or reported to
    /// the local sender when the exchange itself failed
    pub fn response_code(&self) -> u16 {
        match self {
            Error::PeerNotFound { .. } => 404,
            Error::ConnectionTimeout { .. } => 408,
            Error::MalformedGossipBody { .. }
            | Error::FrameTooLarge { .. }
            | Error::Protocol(_)
            | Error::Json(_) => 400,
            Error::ShuttingDown | Error::AllocationFailure { .. } | Error::ConnectionFailed { .. } => 503,
            _ => 500,
        }
    }

    /// Get the exit code for CLI
    pub fn exit_code(&self) -> i32 {
        self.code().exit_code()
    }

    // ─────────────────────────────────────────────────────────────
    // User-Friendly Messages
    // ─────────────────────────────────────────────────────────────

    /// Get a user-friendly suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Error::ConfigNotFound { .. } => Some(
                "Run 'dmq-node config init' to create a default configuration file."
            ),
            Error::ConfigParse { .. } => Some(
                "Check your configuration file syntax. Run 'dmq-node config validate' to see details."
            ),
            Error::ConfigValidation { .. } => Some(
                "Review the configuration file and fix the invalid values."
            ),
            Error::ConnectionFailed { .. } => Some(
                "Check that the node is running and that 'listen_addr' is reachable from this host."
            ),
            Error::ConnectionTimeout { .. } => Some(
                "The node may be overloaded. Consider raising 'response_timeout_ms'."
            ),
            Error::DuplicatePeer { .. } => Some(
                "Each subsystem must register a distinct peer id."
            ),
            Error::PeerNotFound { .. } => Some(
                "The addressed subsystem is not loaded on this node."
            ),
            Error::AllocationFailure { .. } => Some(
                "The node is out of memory. Reduce load or raise the memory limit."
            ),
            _ => None,
        }
    }

    /// Format the error for terminal display with colors
    pub fn format_for_terminal(&self) -> String {
        let code = self.code();
        let suggestion = self.suggestion();

        let mut output = format!(
            "\x1b[31mError [{}]\x1b[0m: {}\n",
            code.as_str(),
            self
        );

        if let Some(hint) = suggestion {
            output.push_str(&format!("\n\x1b[33mHint\x1b[0m: {}\n", hint));
        }

        output
    }

    /// Format the error for logging (no colors)
    pub fn format_for_log(&self) -> String {
        format!("[{}] {}", self.code().as_str(), self)
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    /// Create a config not found error
    pub fn config_not_found(path: impl Into<PathBuf>) -> Self {
        Error::ConfigNotFound {
            path: path.into(),
            source: None,
        }
    }

    /// Create a config validation error with field name
    pub fn config_field_invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ConfigValidation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a malformed gossip body error
    pub fn malformed_gossip(reason: impl Into<String>) -> Self {
        Error::MalformedGossipBody {
            reason: reason.into(),
        }
    }

    /// Create an allocation failure error
    pub fn allocation(what: impl Into<String>) -> Self {
        Error::AllocationFailure { what: what.into() }
    }

    /// Create a send rejected error
    pub fn send_rejected(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::SendRejected {
            target: target.into(),
            reason: reason.into(),
        }
    }

    /// Create a handler failure error
    pub fn handler(peer_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Handler {
            peer_id: peer_id.into(),
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
