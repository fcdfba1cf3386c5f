//! Error taxonomy of the harness.
//!
//! - [`TransportError`]: the channel to the game server failed (process spawn, broken pipe,
//!   panel RPC). Logged where it happens; adapters try one recovery step and otherwise end their
//!   event sequence.
//! - [`ConfigError`]: invalid settings or credentials. Raised eagerly when an adapter or the
//!   [`Configuration`](crate::configuration::Configuration) is built, never recovered.
//! - [`ParseError`]: a single malformed console row. Always dropped locally by the parser.
//!
//! A shutdown request is not an error: it is a flag checked at loop boundaries.

use std::time::Duration;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error of the library.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failures (subprocess or panel)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Unparseable console content
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Failures of the channel used to talk with the game server.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The server binary could not be started
    #[error("could not spawn '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    /// The child closed its input stream
    #[error("broken pipe while writing '{command}'")]
    BrokenPipe { command: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Request could not be sent or its body could not be read
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The panel answered with a non-success HTTP status
    #[error("{endpoint} returned HTTP {status}: {body}")]
    Status {
        endpoint: String,
        status: u16,
        body: String,
    },

    /// The panel answered with something that is not the expected JSON
    #[error("invalid response from {endpoint}: {reason}")]
    InvalidResponse { endpoint: String, reason: String },

    /// The panel answered, but reported a failure
    #[error("{endpoint} failed: {message}")]
    Api { endpoint: String, message: String },

    /// Login answered without any usable session
    #[error("login succeeded without a session token")]
    MissingSession,

    /// An operation needed a connection that is not established
    #[error("not connected")]
    NotConnected,

    /// A runtime needed to drive an async call could not be built
    #[error("could not build async runtime: {0}")]
    Runtime(std::io::Error),

    /// Process did not exit within the allowed time
    #[error("process {pid} still running after {waited:?}")]
    KillTimeout { pid: u32, waited: Duration },
}

/// Invalid settings, detected before anything is started.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    MissingField(&'static str),

    /// Credentials are not of the form `username:password`
    #[error("invalid credentials: {0}")]
    InvalidCredentials(&'static str),

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("at least one latency level is required")]
    EmptyLatencies,

    #[error("unknown game type '{0}' (expected 'openarena' or 'amp')")]
    UnknownGameType(String),
}

/// A single console row that could not be understood.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid IPv4 address '{0}'")]
    InvalidAddress(String),

    #[error("malformed client row: {0}")]
    MalformedRow(String),
}
