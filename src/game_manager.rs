//! Game settings pushed to the server, and bot management.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::bridge::CommandDispatcher;
use crate::clients::BOT_NAMES;

/// Delay between two `addbot` commands.
const BOT_ADD_INTERVAL: Duration = Duration::from_millis(100);

/// Match rules applied to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSettings {
    /// Minutes
    pub timelimit: u32,
    pub fraglimit: u32,
    pub enable_warmup: bool,
    /// Seconds
    pub warmup_time: u64,
}

impl GameSettings {
    /// Settings passed on the server command line.
    pub fn startup_config(&self) -> Vec<(&'static str, String)> {
        vec![
            ("timelimit", self.timelimit.to_string()),
            ("capturelimit", self.fraglimit.to_string()),
            (
                "g_doWarmup",
                if self.enable_warmup { "1" } else { "0" }.to_owned(),
            ),
            ("g_warmup", self.warmup_time.to_string()),
        ]
    }
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            timelimit: 10,
            fraglimit: 10,
            enable_warmup: true,
            warmup_time: 100_000_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotSettings {
    pub enabled: bool,
    pub count: u32,
    pub difficulty: u32,
    /// Names given to the bots, in order. Missing or empty entries use the stock names.
    pub names: Vec<String>,
}

impl Default for BotSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            count: 4,
            difficulty: 1,
            names: Vec::new(),
        }
    }
}

impl BotSettings {
    pub fn name_of(&self, index: usize) -> &str {
        match self.names.get(index).map(String::as_str) {
            Some(name) if !name.is_empty() => name,
            _ => BOT_NAMES[index % BOT_NAMES.len()],
        }
    }
}

/// Sends game configuration and adds bots. Cheap to clone; clones share the bot state.
#[derive(Clone)]
pub struct GameManager {
    game: Arc<GameSettings>,
    bots: Arc<BotSettings>,
    commands: CommandDispatcher,
    bots_added: Arc<AtomicBool>,
    adding_bots: Arc<AtomicBool>,
}

impl GameManager {
    pub fn new(game: GameSettings, bots: BotSettings, commands: CommandDispatcher) -> Self {
        Self {
            game: Arc::new(game),
            bots: Arc::new(bots),
            commands,
            bots_added: Arc::new(AtomicBool::new(false)),
            adding_bots: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn game_settings(&self) -> &GameSettings {
        &self.game
    }

    pub fn bots_enabled(&self) -> bool {
        self.bots.enabled && self.bots.count > 0
    }

    pub fn bots_added(&self) -> bool {
        self.bots_added.load(Ordering::SeqCst)
    }

    pub fn is_adding_bots(&self) -> bool {
        self.adding_bots.load(Ordering::SeqCst)
    }

    /// Bots are wanted and nobody added them yet.
    pub fn should_add_bots(&self) -> bool {
        self.bots_enabled() && !self.bots_added() && !self.is_adding_bots()
    }

    /// Add the configured bots, one `addbot` every 100 ms.
    ///
    /// Returns `true` once the bots are on the server, `false` if disabled or another addition
    /// is running.
    pub async fn add_bots(&self) -> bool {
        if self.bots_added() {
            debug!("bots already added");
            return true;
        }
        if !self.bots_enabled() {
            info!("bot addition disabled");
            return false;
        }
        if self
            .adding_bots
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("bot addition already in progress");
            return false;
        }

        info!(count = self.bots.count, "adding bots");
        for index in 0..self.bots.count as usize {
            let name = self.bots.name_of(index);
            self.commands
                .send(format!("addbot {} {}", name, self.bots.difficulty))
                .await;
            debug!(name, difficulty = self.bots.difficulty, "bot added");
            tokio::time::sleep(BOT_ADD_INTERVAL).await;
        }
        self.bots_added.store(true, Ordering::SeqCst);
        self.adding_bots.store(false, Ordering::SeqCst);
        self.commands
            .send(format!("say Added {} bots to the server", self.bots.count))
            .await;
        true
    }

    pub fn initialize_bot_settings(&self) -> bool {
        if !self.bots_enabled() {
            return false;
        }
        self.commands.send_sync("set bot_minplayers 0");
        info!(count = self.bots.count, "bot settings initialized");
        true
    }

    pub fn apply_default_config(&self) {
        self.initialize_bot_settings();
        self.commands
            .send_sync(format!("set timelimit {}", self.game.timelimit));
        self.commands
            .send_sync(format!("set fraglimit {}", self.game.fraglimit));
        if self.game.enable_warmup {
            self.commands.send_sync("set g_doWarmup 1");
            self.commands
                .send_sync(format!("set g_warmup {}", self.game.warmup_time));
        }
        info!("default game configuration applied");
    }

    /// Have the next round start with a warmup phase again.
    pub fn set_next_round_with_warmup_phase(&self) {
        self.commands.send_sync("set g_doWarmup 1");
        self.commands
            .send_sync(format!("set g_warmup {}", self.game.warmup_time));
        info!("next round starts with a warmup");
    }

    pub fn startup_config(&self) -> Vec<(&'static str, String)> {
        self.game.startup_config()
    }

    pub fn reset_bot_state(&self) {
        self.bots_added.store(false, Ordering::SeqCst);
        self.adding_bots.store(false, Ordering::SeqCst);
        info!("bot state reset");
    }
}

#[cfg(test)]
mod game_manager_tests {
    use super::*;
    use crate::bridge::testing::recording_dispatcher;

    fn bots(count: u32, names: &[&str]) -> BotSettings {
        BotSettings {
            enabled: true,
            count,
            difficulty: 3,
            names: names.iter().map(|name| name.to_string()).collect(),
        }
    }

    #[test]
    fn default_config_commands() {
        let (commands, sent) = recording_dispatcher();
        let game = GameSettings {
            timelimit: 5,
            fraglimit: 20,
            enable_warmup: true,
            warmup_time: 30,
        };
        GameManager::new(game, bots(2, &[]), commands).apply_default_config();
        assert_eq!(
            sent.sent(),
            [
                "set bot_minplayers 0",
                "set timelimit 5",
                "set fraglimit 20",
                "set g_doWarmup 1",
                "set g_warmup 30",
            ]
        );
    }

    #[test]
    fn startup_config_without_warmup() {
        let (commands, _) = recording_dispatcher();
        let game = GameSettings {
            enable_warmup: false,
            ..GameSettings::default()
        };
        let manager = GameManager::new(game, BotSettings::default(), commands);
        assert_eq!(
            manager.startup_config(),
            vec![
                ("timelimit", "10".to_owned()),
                ("capturelimit", "10".to_owned()),
                ("g_doWarmup", "0".to_owned()),
                ("g_warmup", "100000000000".to_owned()),
            ]
        );
        assert!(!manager.should_add_bots());
    }

    #[tokio::test(start_paused = true)]
    async fn bots_are_added_once() {
        let (commands, sent) = recording_dispatcher();
        let manager = GameManager::new(GameSettings::default(), bots(3, &["Alpha", ""]), commands);
        assert!(manager.should_add_bots());

        assert!(manager.add_bots().await);
        assert!(manager.bots_added());
        assert!(!manager.should_add_bots());
        assert_eq!(
            sent.sent(),
            [
                "addbot Alpha 3",
                "addbot Arachna 3",
                "addbot Major 3",
                "say Added 3 bots to the server",
            ]
        );

        assert!(manager.add_bots().await);
        assert_eq!(sent.sent().len(), 4);

        manager.reset_bot_state();
        assert!(manager.should_add_bots());
    }
}
