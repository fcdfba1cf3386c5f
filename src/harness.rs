//! Experiment runner.
//!
//! The [`Harness`] wires a [`GameAdapter`] to the event pipeline and drives one experiment from
//! the first console line to the teardown:
//!
//! 1. start the [`SideEffectRuntime`] and attach it to the adapter's [`AsyncBridge`]
//! 2. connect the adapter and push the default game configuration
//! 3. feed every event to the [`OutputHandler`], then to the [`EventDispatcher`]
//! 4. once the experiment is finished, let the server shut down by itself for
//!    [`FINISH_GRACE`] before tripping the shutdown signal
//! 5. tear down: stop side effects, clean the recorders, clear the latency rules, disconnect
//!
//! The loop also ends when the transport is lost for good, or when the adapter's
//! [`ShutdownSignal`] is tripped from another thread (e.g. a Ctrl-C watcher).
//!
//! # Example
//!
//! ```no_run
//! use arena_harness::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::from_env()?;
//!     let summary = Harness::new(config)?.run()?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, instrument, trace, warn};

use crate::adapter::{create_adapter, GameAdapter};
use crate::bridge::{AsyncBridge, ShutdownSignal, SideEffectRuntime};
use crate::clients::{
    ClientRegistry, DisabledLatency, LatencySchedule, LatencySink, NoRecording, RecordingSink,
};
use crate::configuration::Configuration;
use crate::dispatch::{EventDispatcher, Experiment};
use crate::event::ParsedEvent;
use crate::game_manager::GameManager;
use crate::round::RoundStateMachine;

/// Time left to the server to exit on its own once the last round is over.
pub const FINISH_GRACE: Duration = Duration::from_secs(5);
/// Upper bound of every teardown step.
const TEARDOWN_WAIT: Duration = Duration::from_secs(5);

/// Receives every event before it is dispatched.
pub trait OutputHandler: Send {
    fn handle(&mut self, event: &ParsedEvent);
}

/// Echoes the server console on stdout when verbose.
#[derive(Debug, Clone, Copy)]
pub struct ConsoleEcho {
    verbose: bool,
}

impl ConsoleEcho {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl OutputHandler for ConsoleEcho {
    fn handle(&mut self, event: &ParsedEvent) {
        trace!(kind = ?event.kind(), raw = event.raw());
        if self.verbose && !event.raw().is_empty() {
            println!("{}", event.raw());
        }
    }
}

/// What happened during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds_completed: u32,
    pub max_rounds: u32,
    pub finished: bool,
    pub events: usize,
    pub handled_events: usize,
    pub humans: usize,
    pub bots: usize,
}

impl Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let outcome = if self.finished {
            "finished"
        } else {
            "interrupted"
        };
        write!(
            f,
            "experiment {outcome}: {}/{} rounds, {} events ({} handled), {} humans, {} bots",
            self.rounds_completed,
            self.max_rounds,
            self.events,
            self.handled_events,
            self.humans,
            self.bots
        )
    }
}

/// Runs one experiment against one game server.
pub struct Harness {
    config: Configuration,
    adapter: Box<dyn GameAdapter>,
    bridge: AsyncBridge,
    recording: Arc<dyn RecordingSink>,
    latency: Arc<dyn LatencySink>,
    output: Box<dyn OutputHandler>,
}

impl Harness {
    /// Build the adapter selected by `config`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid transport configuration (e.g. missing panel credentials).
    #[instrument(skip_all)]
    pub fn new(config: Configuration) -> anyhow::Result<Self> {
        let adapter_config = config
            .adapter_config()
            .context("Invalid transport configuration")?;
        let bridge = AsyncBridge::new();
        let adapter =
            create_adapter(&adapter_config, bridge.clone()).context("Could not create adapter")?;
        trace!(?config);
        Ok(Self::with_adapter(config, adapter, bridge))
    }

    /// Use an already built adapter. `bridge` must be the one the adapter was built with.
    pub fn with_adapter(
        config: Configuration,
        adapter: Box<dyn GameAdapter>,
        bridge: AsyncBridge,
    ) -> Self {
        let output = Box::new(ConsoleEcho::new(config.verbose));
        Self {
            config,
            adapter,
            bridge,
            recording: Arc::new(NoRecording),
            latency: Arc::new(DisabledLatency),
            output,
        }
    }

    pub fn with_recording(mut self, recording: Arc<dyn RecordingSink>) -> Self {
        self.recording = recording;
        self
    }

    /// Traffic shaping backend. Ignored unless latency control is enabled.
    pub fn with_latency(mut self, latency: Arc<dyn LatencySink>) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_output(mut self, output: Box<dyn OutputHandler>) -> Self {
        self.output = output;
        self
    }

    /// Handle that stops the run from another thread.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.adapter.shutdown_signal()
    }

    /// Run the experiment until it finishes, the transport is lost or a shutdown is requested.
    ///
    /// # Errors
    ///
    /// Fails when the side-effect runtime cannot start or the adapter cannot connect.
    #[instrument(skip_all, fields(adapter = self.adapter.name()))]
    pub fn run(mut self) -> anyhow::Result<RunSummary> {
        let runtime =
            SideEffectRuntime::start(&self.bridge).context("Could not start side-effect runtime")?;

        if !self.adapter.connect() {
            runtime.shutdown(TEARDOWN_WAIT);
            anyhow::bail!("Could not connect to the {} server", self.adapter.name());
        }

        let mut dispatcher = EventDispatcher::new(self.build_experiment());
        dispatcher.experiment().game().apply_default_config();
        info!(rounds = %dispatcher.experiment().rounds().round_info(), "experiment started");

        let signal = self.adapter.shutdown_signal();
        let mut events = 0;
        let mut handled_events = 0;
        let mut grace_armed = false;
        for event in self.adapter.events() {
            events += 1;
            self.output.handle(&event);
            if dispatcher.dispatch(&event) {
                handled_events += 1;
            }

            if dispatcher.experiment().is_finished() && !grace_armed {
                grace_armed = true;
                info!(grace = ?FINISH_GRACE, "experiment finished, waiting for the server to stop");
                let signal = signal.clone();
                self.bridge.schedule_async("finish-grace", async move {
                    tokio::time::sleep(FINISH_GRACE).await;
                    signal.request();
                });
            }
        }

        let experiment = dispatcher.experiment();
        let summary = RunSummary {
            rounds_completed: experiment.rounds().round_count().saturating_sub(1),
            max_rounds: experiment.rounds().max_rounds(),
            finished: experiment.is_finished(),
            events,
            handled_events,
            humans: experiment.clients().human_count(),
            bots: experiment.clients().bot_count(),
        };

        self.teardown(runtime, &signal);
        info!(%summary, "run over");
        Ok(summary)
    }

    fn build_experiment(&self) -> Experiment {
        let commands = self.adapter.commands();
        let game = GameManager::new(
            self.config.game.clone(),
            self.config.bots.clone(),
            commands.clone(),
        );
        let latency: Arc<dyn LatencySink> = if self.config.enable_latency_control {
            self.latency.clone()
        } else {
            Arc::new(DisabledLatency)
        };
        Experiment::new(
            RoundStateMachine::new(self.config.latencies.len(), self.config.repeats),
            Box::new(ClientRegistry::new()),
            LatencySchedule::new(self.config.latencies.clone()),
            game,
            self.recording.clone(),
            latency,
            commands,
            self.adapter.kick_format(),
            self.config.nplayers_threshold,
        )
    }

    fn teardown(&mut self, runtime: SideEffectRuntime, signal: &ShutdownSignal) {
        signal.request();
        self.bridge.request_shutdown();

        if self.recording.is_enabled()
            && runtime
                .block_on_timeout(TEARDOWN_WAIT, self.recording.cleanup())
                .is_none()
        {
            warn!("recording cleanup timed out");
        }
        if self.config.enable_latency_control && self.latency.is_enabled() {
            match runtime.block_on_timeout(TEARDOWN_WAIT, self.latency.clear()) {
                Some(true) => info!("latency rules cleared"),
                Some(false) => warn!("could not clear latency rules"),
                None => warn!("clearing latency rules timed out"),
            }
        }

        self.adapter.disconnect();
        runtime.shutdown(TEARDOWN_WAIT);
    }
}

#[cfg(test)]
mod harness_tests {
    use super::*;

    #[test]
    fn summary_display() {
        let summary = RunSummary {
            rounds_completed: 2,
            max_rounds: 3,
            finished: false,
            events: 40,
            handled_events: 12,
            humans: 1,
            bots: 4,
        };
        assert_eq!(
            summary.to_string(),
            "experiment interrupted: 2/3 rounds, 40 events (12 handled), 1 humans, 4 bots"
        );
    }
}
