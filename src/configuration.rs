//! Config for the experiment harness
//!
//! Configuration can be created programmatically using [`Configuration::new()`] or by reading
//! environment variables using [`Configuration::from_env()`]. The binary loads a `.env` file
//! first, so the variables can also live there.
//!
//! # Environment Variables
//!
//! All values are optional. Flags are enabled by `"true"`, `"1"` or `"yes"` (case-insensitive).
//! A value that cannot be parsed is a [`ConfigError`], it never falls back to the default.
//!
//! Experiment:
//! - `GAME_TYPE`: `openarena` or `amp` (alias `dota2`) (default: `openarena`)
//! - `NPLAYERS_THRESHOLD`: humans needed before a match may start (default: `1`)
//! - `REPEATS`: rounds played per latency level (default: `5`)
//! - `LATENCIES`: comma separated latency levels in ms (default: `200`)
//! - `ENABLE_LATENCY_CONTROL`: shape the client traffic (default: `false`)
//! - `INTERFACE`: network interface used for traffic shaping (default: `eno2`)
//!
//! Game rules:
//! - `TIMELIMIT`: match time limit in minutes (default: `10`)
//! - `FRAGLIMIT`: frag limit, `FLAGLIMIT` is accepted too (default: `10`)
//! - `ENABLE_WARMUP`: play a warmup before each match (default: `true`)
//! - `WARMUP_TIME`: warmup duration in seconds (default: `100000000000`)
//! - `BOT_ENABLE`, `BOT_COUNT`, `BOT_DIFFICULTY`, `BOT_NAMES`: bots (default: off, `4`, `1`,
//!   stock names)
//!
//! Transports:
//! - `OA_BINARY_PATH`: OpenArena dedicated server binary (default: `oa_ded`)
//! - `OA_PORT`: OpenArena server port (default: `27960`)
//! - `AMP_BASE_URL`: panel URL (default: `http://localhost:8080`)
//! - `AMP_USERNAME`, `AMP_PASSWORD`: panel credentials (required for `amp`)
//! - `AMP_INSTANCE_ID`: instance reached through the panel (default: none)
//! - `AMP_POLL_INTERVAL`: seconds between two console polls (default: `2.0`)
//! - `AMP_MANAGE_INSTANCE`: start the instance on connect, stop it on disconnect
//!   (default: `false`)
//!
//! Output:
//! - `HARNESS_VERBOSE`: echo the server console on stdout (default: `true`)
//! - `HARNESS_LOG`: log to a timestamped file instead of stdout (default: `false`)
//! - `HARNESS_LOG_LEVEL`: `trace`, `debug`, `info`, `warn` or `error` (default: `info`)

use std::str::FromStr;
use std::time::Duration;

use tracing::Level;

use crate::adapter::{AdapterConfig, PanelConfig, SubprocessConfig, TransportConfig};
use crate::errors::ConfigError;
use crate::game_manager::{BotSettings, GameSettings};

const DEFAULT_MOTD: &str = "Welcome to the arena";

/// Transport family of the game server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameType {
    /// OpenArena dedicated server run as a child process
    OpenArena,
    /// Server hosted behind an AMP panel
    Amp,
}

impl FromStr for GameType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openarena" => Ok(GameType::OpenArena),
            "amp" | "dota2" => Ok(GameType::Amp),
            other => Err(ConfigError::UnknownGameType(other.to_owned())),
        }
    }
}

/// Configuration of the harness.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub(crate) game_type: GameType,
    pub(crate) nplayers_threshold: usize,
    pub(crate) repeats: u32,
    pub(crate) latencies: Vec<u32>,
    pub(crate) enable_latency_control: bool,
    pub(crate) interface: String,
    pub(crate) game: GameSettings,
    pub(crate) bots: BotSettings,
    pub(crate) oa_binary_path: String,
    pub(crate) oa_port: u16,
    pub(crate) amp_base_url: String,
    pub(crate) amp_username: String,
    pub(crate) amp_password: String,
    pub(crate) amp_instance_id: Option<String>,
    pub(crate) amp_manage_instance: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) verbose: bool,
    pub(crate) log: bool,
    pub(crate) log_level: Level,
}

impl Configuration {
    /// Create a new configuration with default parameters.
    ///
    /// By default:
    /// - An OpenArena server (`oa_ded`, port 27960) is spawned.
    /// - One human is enough to start, 5 rounds are played on a single 200 ms level.
    /// - Latency control and bots are disabled.
    /// - The server console is echoed on stdout and logs go to stdout at `info` level.
    pub fn new() -> Self {
        Self {
            game_type: GameType::OpenArena,
            nplayers_threshold: 1,
            repeats: 5,
            latencies: vec![200],
            enable_latency_control: false,
            interface: "eno2".to_owned(),
            game: GameSettings::default(),
            bots: BotSettings::default(),
            oa_binary_path: "oa_ded".to_owned(),
            oa_port: 27960,
            amp_base_url: "http://localhost:8080".to_owned(),
            amp_username: String::new(),
            amp_password: String::new(),
            amp_instance_id: None,
            amp_manage_instance: false,
            poll_interval: Duration::from_secs(2),
            verbose: true,
            log: false,
            log_level: Level::INFO,
        }
    }

    /// Create configuration from environment variables (see the module documentation).
    ///
    /// # Errors
    ///
    /// [`ConfigError`] for any value that does not parse, an empty latency list or an unknown
    /// game type.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let get_env_flag = |key: &'static str, default: bool| -> bool {
            match get(key) {
                Some(value) => {
                    let value = value.trim();
                    ["true", "1", "yes"]
                        .iter()
                        .any(|flag| value.eq_ignore_ascii_case(flag))
                }
                None => default,
            }
        };
        fn parse<T: FromStr>(
            key: &'static str,
            value: Option<String>,
            default: T,
        ) -> Result<T, ConfigError> {
            match value {
                Some(value) => value.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    key,
                    value,
                }),
                None => Ok(default),
            }
        }

        let defaults = Self::new();
        let game_type = match get("GAME_TYPE") {
            Some(value) => value.parse()?,
            None => defaults.game_type,
        };
        let latencies = match get("LATENCIES") {
            Some(value) => parse_latencies(&value)?,
            None => defaults.latencies,
        };
        let poll_seconds: f64 = parse("AMP_POLL_INTERVAL", get("AMP_POLL_INTERVAL"), 2.0)?;
        if !poll_seconds.is_finite() || poll_seconds <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "AMP_POLL_INTERVAL",
                value: poll_seconds.to_string(),
            });
        }
        let fraglimit = get("FRAGLIMIT").or_else(|| get("FLAGLIMIT"));

        Ok(Self {
            game_type,
            nplayers_threshold: parse(
                "NPLAYERS_THRESHOLD",
                get("NPLAYERS_THRESHOLD"),
                defaults.nplayers_threshold,
            )?,
            repeats: parse("REPEATS", get("REPEATS"), defaults.repeats)?,
            latencies,
            enable_latency_control: get_env_flag("ENABLE_LATENCY_CONTROL", false),
            interface: get("INTERFACE").unwrap_or(defaults.interface),
            game: GameSettings {
                timelimit: parse("TIMELIMIT", get("TIMELIMIT"), defaults.game.timelimit)?,
                fraglimit: parse("FRAGLIMIT", fraglimit, defaults.game.fraglimit)?,
                enable_warmup: get_env_flag("ENABLE_WARMUP", true),
                warmup_time: parse("WARMUP_TIME", get("WARMUP_TIME"), defaults.game.warmup_time)?,
            },
            bots: BotSettings {
                enabled: get_env_flag("BOT_ENABLE", false),
                count: parse("BOT_COUNT", get("BOT_COUNT"), defaults.bots.count)?,
                difficulty: parse(
                    "BOT_DIFFICULTY",
                    get("BOT_DIFFICULTY"),
                    defaults.bots.difficulty,
                )?,
                names: get("BOT_NAMES")
                    .map(|names| names.split(',').map(|n| n.trim().to_owned()).collect())
                    .unwrap_or_default(),
            },
            oa_binary_path: get("OA_BINARY_PATH").unwrap_or(defaults.oa_binary_path),
            oa_port: parse("OA_PORT", get("OA_PORT"), defaults.oa_port)?,
            amp_base_url: get("AMP_BASE_URL").unwrap_or(defaults.amp_base_url),
            amp_username: get("AMP_USERNAME").unwrap_or_default(),
            amp_password: lookup("AMP_PASSWORD").unwrap_or_default(),
            amp_instance_id: get("AMP_INSTANCE_ID"),
            amp_manage_instance: get_env_flag("AMP_MANAGE_INSTANCE", false),
            poll_interval: Duration::from_secs_f64(poll_seconds),
            verbose: get_env_flag("HARNESS_VERBOSE", true),
            log: get_env_flag("HARNESS_LOG", false),
            log_level: parse("HARNESS_LOG_LEVEL", get("HARNESS_LOG_LEVEL"), Level::INFO)?,
        })
    }

    pub fn game_type(&self) -> GameType {
        self.game_type
    }

    pub fn latencies(&self) -> &[u32] {
        &self.latencies
    }

    pub fn game_settings(&self) -> &GameSettings {
        &self.game
    }

    pub fn bot_settings(&self) -> &BotSettings {
        &self.bots
    }

    pub fn log_level(&self) -> Level {
        self.log_level
    }

    /// Whether logs go to a timestamped file instead of stdout.
    pub fn logs_to_file(&self) -> bool {
        self.log
    }

    /// Select the transport.
    pub fn with_game_type(mut self, value: GameType) -> Self {
        self.game_type = value;
        self
    }

    /// Number of humans required before a warmup may turn into a match.
    pub fn with_nplayers_threshold(mut self, value: usize) -> Self {
        self.nplayers_threshold = value;
        self
    }

    /// Rounds played per latency level.
    pub fn with_repeats(mut self, value: u32) -> Self {
        self.repeats = value;
        self
    }

    /// Latency levels in milliseconds.
    ///
    /// # Errors
    ///
    /// [`ConfigError::EmptyLatencies`] when `value` is empty.
    pub fn with_latencies(mut self, value: Vec<u32>) -> Result<Self, ConfigError> {
        if value.is_empty() {
            return Err(ConfigError::EmptyLatencies);
        }
        self.latencies = value;
        Ok(self)
    }

    /// Enable or disable traffic shaping.
    pub fn with_latency_control(mut self, value: bool) -> Self {
        self.enable_latency_control = value;
        self
    }

    pub fn with_game_settings(mut self, value: GameSettings) -> Self {
        self.game = value;
        self
    }

    pub fn with_bot_settings(mut self, value: BotSettings) -> Self {
        self.bots = value;
        self
    }

    /// Dedicated server binary and the port it listens on.
    pub fn with_openarena_server(mut self, binary: impl Into<String>, port: u16) -> Self {
        self.oa_binary_path = binary.into();
        self.oa_port = port;
        self
    }

    /// Panel URL and credentials.
    pub fn with_panel(
        mut self,
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.amp_base_url = base_url.into();
        self.amp_username = username.into();
        self.amp_password = password.into();
        self
    }

    pub fn with_instance_id(mut self, value: Option<String>) -> Self {
        self.amp_instance_id = value;
        self
    }

    pub fn with_manage_instance(mut self, value: bool) -> Self {
        self.amp_manage_instance = value;
        self
    }

    pub fn with_poll_interval(mut self, value: Duration) -> Self {
        self.poll_interval = value;
        self
    }

    /// Enable or disable the console echo.
    pub fn with_verbose(mut self, value: bool) -> Self {
        self.verbose = value;
        self
    }

    /// Enable or disable logging to file.
    pub fn with_log(mut self, value: bool) -> Self {
        self.log = value;
        self
    }

    pub fn with_log_level(mut self, value: Level) -> Self {
        self.log_level = value;
        self
    }

    /// Rounds the experiment lasts: latency levels times repeats.
    pub fn max_rounds(&self) -> u32 {
        (self.latencies.len() as u32).saturating_mul(self.repeats)
    }

    /// Command line of the OpenArena dedicated server.
    pub fn openarena_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            ("dedicated", "1".to_owned()),
            ("net_port", self.oa_port.to_string()),
            ("com_legacyprotocol", "71".to_owned()),
            ("com_protocol", "71".to_owned()),
            ("sv_pure", "0".to_owned()),
            ("sv_master1", "dpmaster.deathmask.net".to_owned()),
            ("sv_maxclients", "4".to_owned()),
            ("cl_motd", DEFAULT_MOTD.to_owned()),
        ]
        .into_iter()
        .chain(self.game.startup_config())
        .flat_map(|(key, value)| ["+set".to_owned(), key.to_owned(), value])
        .collect();
        args.extend(["+exec".to_owned(), "t_server.cfg".to_owned()]);
        args
    }

    /// Transport selection and parameters.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the panel is selected with missing or malformed credentials.
    pub fn adapter_config(&self) -> Result<AdapterConfig, ConfigError> {
        let transport = match self.game_type {
            GameType::OpenArena => TransportConfig::Subprocess(SubprocessConfig {
                binary: self.oa_binary_path.clone(),
                args: self.openarena_args(),
            }),
            GameType::Amp => {
                let credentials = format!("{}:{}", self.amp_username, self.amp_password);
                let panel = PanelConfig::from_credentials(
                    &self.amp_base_url,
                    Some(credentials.as_str()),
                    self.amp_instance_id.clone(),
                )?
                .with_manage_instance(self.amp_manage_instance);
                TransportConfig::Panel(panel)
            }
        };
        Ok(AdapterConfig {
            transport,
            poll_interval: self.poll_interval,
        })
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_latencies(value: &str) -> Result<Vec<u32>, ConfigError> {
    let latencies = value
        .split(',')
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .map(|level| {
            level.parse().map_err(|_| ConfigError::InvalidValue {
                key: "LATENCIES",
                value: level.to_owned(),
            })
        })
        .collect::<Result<Vec<u32>, _>>()?;
    if latencies.is_empty() {
        return Err(ConfigError::EmptyLatencies);
    }
    Ok(latencies)
}

#[cfg(test)]
mod configuration_tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> Result<Configuration, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Configuration::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_variables() {
        let config = from_vars(&[]).unwrap();
        assert_eq!(config.game_type(), GameType::OpenArena);
        assert_eq!(config.latencies(), &[200]);
        assert_eq!(config.max_rounds(), 5);
        assert_eq!(config.poll_interval, Duration::from_secs(2));
        assert!(config.verbose && !config.log);
        assert_eq!(config.log_level(), Level::INFO);
    }

    #[test]
    fn reads_experiment_variables() {
        let config = from_vars(&[
            ("GAME_TYPE", "DOTA2"),
            ("LATENCIES", "0, 50,100"),
            ("REPEATS", "2"),
            ("BOT_ENABLE", "yes"),
            ("BOT_NAMES", "Alpha,Beta"),
            ("FLAGLIMIT", "7"),
            ("ENABLE_WARMUP", "false"),
            ("AMP_POLL_INTERVAL", "0.5"),
            ("HARNESS_LOG_LEVEL", "debug"),
        ])
        .unwrap();
        assert_eq!(config.game_type(), GameType::Amp);
        assert_eq!(config.latencies(), &[0, 50, 100]);
        assert_eq!(config.max_rounds(), 6);
        assert!(config.bot_settings().enabled);
        assert_eq!(config.bot_settings().names, ["Alpha", "Beta"]);
        assert_eq!(config.game_settings().fraglimit, 7);
        assert!(!config.game_settings().enable_warmup);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.log_level(), Level::DEBUG);
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(matches!(
            from_vars(&[("REPEATS", "five")]),
            Err(ConfigError::InvalidValue { key: "REPEATS", .. })
        ));
        assert!(matches!(
            from_vars(&[("LATENCIES", "10,x")]),
            Err(ConfigError::InvalidValue { key: "LATENCIES", .. })
        ));
        assert!(matches!(
            from_vars(&[("LATENCIES", " , ")]),
            Err(ConfigError::EmptyLatencies)
        ));
        assert!(matches!(
            from_vars(&[("GAME_TYPE", "quake")]),
            Err(ConfigError::UnknownGameType(_))
        ));
        assert!(matches!(
            from_vars(&[("AMP_POLL_INTERVAL", "0")]),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn openarena_command_line() {
        let config = Configuration::new().with_openarena_server("/opt/oa_ded", 27961);
        let args = config.openarena_args();
        assert_eq!(&args[..3], ["+set", "dedicated", "1"]);
        assert!(args
            .windows(3)
            .any(|w| w == ["+set", "net_port", "27961"]));
        assert!(args.windows(3).any(|w| w == ["+set", "capturelimit", "10"]));
        assert_eq!(&args[args.len() - 2..], ["+exec", "t_server.cfg"]);

        let TransportConfig::Subprocess(subprocess) = config.adapter_config().unwrap().transport
        else {
            panic!("expected subprocess transport");
        };
        assert_eq!(subprocess.binary, "/opt/oa_ded");
    }

    #[test]
    fn panel_needs_credentials() {
        let config = Configuration::new().with_game_type(GameType::Amp);
        assert!(matches!(
            config.adapter_config(),
            Err(ConfigError::InvalidCredentials(_))
        ));

        let config = config
            .with_panel("http://panel:8080", "admin", "secret")
            .with_manage_instance(true);
        let TransportConfig::Panel(panel) = config.adapter_config().unwrap().transport else {
            panic!("expected panel transport");
        };
        assert_eq!(panel.username, "admin");
        assert!(panel.manage_instance);
    }
}
