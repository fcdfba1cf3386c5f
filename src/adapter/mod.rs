//! Transport adapters.
//!
//! An adapter owns the channel to one game server and exposes the same surface whatever the
//! transport: [`connect`](GameAdapter::connect), an ordered and cancellable stream of
//! [`ParsedEvent`]s ([`events`](GameAdapter::events)), fire-and-forget commands,
//! [`disconnect`](GameAdapter::disconnect) and a cooperative [`ShutdownSignal`].
//!
//! Two implementations exist, sharing no state:
//! - [`SubprocessAdapter`]: spawns the OpenArena dedicated server, reads its console from
//!   stderr and writes commands to stdin.
//! - [`PanelAdapter`]: polls an AMP panel over HTTP and de-duplicates the returned entries.
//!
//! Use [`create_adapter`] to build the one selected by an [`AdapterConfig`].

mod dedup;
mod panel;
mod process;
mod subprocess;

use std::time::Duration;

pub use dedup::DedupCache;
pub use panel::PanelAdapter;
pub use process::ServerProcess;
pub use subprocess::SubprocessAdapter;

use crate::bridge::{AsyncBridge, CommandDispatcher, ShutdownSignal};
use crate::errors::{ConfigError, Error};
use crate::event::ParsedEvent;

/// Ordered console events of a connected adapter.
pub type EventStream<'a> = Box<dyn Iterator<Item = ParsedEvent> + 'a>;

/// Builds the server command removing a client.
pub type KickCommand = fn(u32) -> String;

/// Uniform surface over the game server transports.
pub trait GameAdapter: Send {
    /// Short transport name, for logs.
    fn name(&self) -> &'static str;

    /// Establish the transport. Idempotent. Returns `false`, leaving the adapter untouched,
    /// when the server cannot be started or the login is refused.
    fn connect(&mut self) -> bool;

    /// Events in console order. The stream ends when a shutdown is requested or the transport
    /// is lost for good.
    fn events(&mut self) -> EventStream<'_>;

    /// Dispatcher writing to this adapter's transport.
    fn commands(&self) -> CommandDispatcher;

    /// Best-effort command, never waits for delivery when an async context is attached.
    fn send_command(&self, command: &str) {
        self.commands().send_sync(command);
    }

    /// Release the transport. Safe to call any number of times.
    fn disconnect(&mut self);

    fn shutdown_signal(&self) -> ShutdownSignal;

    fn request_shutdown(&self) {
        self.shutdown_signal().request();
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown_signal().is_requested()
    }

    /// How this transport's server kicks a client.
    fn kick_format(&self) -> KickCommand;

    /// Server command removing `client_id` from the game.
    fn kick_command(&self, client_id: u32) -> String {
        (self.kick_format())(client_id)
    }
}

/// Process to spawn for the line-based transport.
#[derive(Debug, Clone, PartialEq)]
pub struct SubprocessConfig {
    pub binary: String,
    pub args: Vec<String>,
}

/// Connection parameters for the AMP panel.
#[derive(Clone, PartialEq)]
pub struct PanelConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    pub instance_id: Option<String>,
    pub request_timeout: Duration,
    /// Start the instance on connect and stop it on disconnect
    pub manage_instance: bool,
}

impl std::fmt::Debug for PanelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PanelConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"***")
            .field("instance_id", &self.instance_id)
            .field("request_timeout", &self.request_timeout)
            .field("manage_instance", &self.manage_instance)
            .finish()
    }
}

impl PanelConfig {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Build from `username:password` credentials.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the URL is empty, the credentials are missing, have no `:`, or an
    /// empty user or password.
    pub fn from_credentials(
        base_url: &str,
        credentials: Option<&str>,
        instance_id: Option<String>,
    ) -> Result<Self, ConfigError> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ConfigError::MissingField("AMP_BASE_URL"));
        }
        let credentials = credentials
            .filter(|c| !c.is_empty())
            .ok_or(ConfigError::InvalidCredentials("credentials are required"))?;
        let (username, password) = credentials.split_once(':').ok_or(
            ConfigError::InvalidCredentials("expected 'username:password'"),
        )?;
        if username.is_empty() {
            return Err(ConfigError::InvalidCredentials("username is empty"));
        }
        if password.is_empty() {
            return Err(ConfigError::InvalidCredentials("password is empty"));
        }

        Ok(Self {
            base_url: base_url.to_owned(),
            username: username.to_owned(),
            password: password.to_owned(),
            instance_id: instance_id.filter(|id| !id.is_empty()),
            request_timeout: Self::DEFAULT_TIMEOUT,
            manage_instance: false,
        })
    }

    pub fn with_manage_instance(mut self, value: bool) -> Self {
        self.manage_instance = value;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportConfig {
    Subprocess(SubprocessConfig),
    Panel(PanelConfig),
}

/// Transport selection plus its connection parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    pub transport: TransportConfig,
    /// Delay between two panel polls
    pub poll_interval: Duration,
}

/// Build the adapter matching `config`, sharing `bridge` for commands and side effects.
pub fn create_adapter(
    config: &AdapterConfig,
    bridge: AsyncBridge,
) -> Result<Box<dyn GameAdapter>, Error> {
    match &config.transport {
        TransportConfig::Subprocess(subprocess) => {
            Ok(Box::new(SubprocessAdapter::new(subprocess.clone(), bridge)))
        }
        TransportConfig::Panel(panel) => Ok(Box::new(PanelAdapter::new(
            panel,
            config.poll_interval,
            bridge,
        )?)),
    }
}

#[cfg(test)]
mod adapter_config_tests {
    use super::*;

    #[test]
    fn parses_credentials() {
        let config =
            PanelConfig::from_credentials("http://panel:8080/", Some("admin:s3:cret"), None)
                .unwrap();
        assert_eq!(config.base_url, "http://panel:8080");
        assert_eq!(config.username, "admin");
        assert_eq!(config.password, "s3:cret");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!format!("{config:?}").contains("s3:cret"));
    }

    #[test]
    fn rejects_bad_credentials_eagerly() {
        for credentials in [None, Some(""), Some("admin"), Some(":pw"), Some("admin:")] {
            let result = PanelConfig::from_credentials("http://panel", credentials, None);
            assert!(
                matches!(result, Err(ConfigError::InvalidCredentials(_))),
                "{credentials:?} should be rejected"
            );
        }
        assert!(matches!(
            PanelConfig::from_credentials("  ", Some("a:b"), None),
            Err(ConfigError::MissingField(_))
        ));
    }

    #[test]
    fn empty_instance_id_means_none() {
        let config =
            PanelConfig::from_credentials("http://panel", Some("a:b"), Some(String::new()))
                .unwrap();
        assert_eq!(config.instance_id, None);
    }

    #[test]
    fn registry_selects_subprocess_transport() {
        let config = AdapterConfig {
            transport: TransportConfig::Subprocess(SubprocessConfig {
                binary: "oa_ded".into(),
                args: vec![],
            }),
            poll_interval: Duration::from_secs(2),
        };
        let adapter = create_adapter(&config, AsyncBridge::new()).unwrap();
        assert_eq!(adapter.name(), "openarena");
        assert_eq!(adapter.kick_command(3), "clientkick 3");
        assert!(!adapter.is_shutdown_requested());
    }
}
