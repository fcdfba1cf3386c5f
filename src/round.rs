//! Round progression of an experiment.
//!
//! ```text
//! Waiting --warmup--> Warmup --match start--> Running --warmup--> Warmup
//!    any  --game initialization--> Running
//! Running --shutdown--> (round counted) --reset_to_waiting--> Waiting
//! ```
//!
//! Going back to `Waiting` only happens through [`RoundStateMachine::reset_to_waiting`].

use std::fmt;

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundState {
    Waiting,
    Warmup,
    Running,
}

impl fmt::Display for RoundState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundState::Waiting => "WAITING",
            RoundState::Warmup => "WARMUP",
            RoundState::Running => "RUNNING",
        };
        f.write_str(name)
    }
}

/// Side effect requested when a match starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundAction {
    StartRecording,
    ApplyLatency,
}

/// Result of a shutdown. `round_completed` and `experiment_finished` are never both set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownOutcome {
    pub round_completed: bool,
    pub experiment_finished: bool,
    pub rotate_latency: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundInfo {
    pub current_round: u32,
    pub max_rounds: u32,
    pub state: RoundState,
}

impl fmt::Display for RoundInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "round {}/{} ({})",
            self.current_round, self.max_rounds, self.state
        )
    }
}

#[derive(Debug)]
pub struct RoundStateMachine {
    state: RoundState,
    round_count: u32,
    max_rounds: u32,
    finished: bool,
}

impl RoundStateMachine {
    /// `latency_levels × repeats` rounds, starting at round 1.
    pub fn new(latency_levels: usize, repeats: u32) -> Self {
        let max_rounds = (latency_levels as u32).saturating_mul(repeats);
        info!(latency_levels, repeats, max_rounds, "round state machine ready");
        Self {
            state: RoundState::Waiting,
            round_count: 1,
            max_rounds,
            finished: false,
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn round_count(&self) -> u32 {
        self.round_count
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn round_info(&self) -> RoundInfo {
        RoundInfo {
            current_round: self.round_count,
            max_rounds: self.max_rounds,
            state: self.state,
        }
    }

    /// Returns whether the state changed.
    pub fn handle_warmup(&mut self) -> bool {
        match self.state {
            RoundState::Waiting | RoundState::Running => {
                info!("{} -> {}", self.state, RoundState::Warmup);
                self.state = RoundState::Warmup;
                true
            }
            RoundState::Warmup => {
                info!("warmup restarted");
                false
            }
        }
    }

    /// Game initialization is authoritative: whatever the state, the game is running.
    pub fn handle_game_initialization(&mut self) -> bool {
        let changed = self.state != RoundState::Running;
        if changed {
            info!("{} -> {}", self.state, RoundState::Running);
        }
        self.state = RoundState::Running;
        changed
    }

    /// Warmup ended and the match starts. Only valid from `Warmup`.
    pub fn handle_match_start(&mut self) -> Vec<RoundAction> {
        if self.state != RoundState::Warmup {
            warn!(state = %self.state, "match start outside of warmup");
            return Vec::new();
        }
        self.state = RoundState::Running;
        info!(round = self.round_count, "WARMUP -> RUNNING");
        vec![RoundAction::StartRecording, RoundAction::ApplyLatency]
    }

    /// A match ended. Counts the round when running.
    pub fn handle_shutdown(&mut self) -> ShutdownOutcome {
        if self.state != RoundState::Running {
            return ShutdownOutcome::default();
        }
        if self.finished {
            warn!("shutdown after the experiment already finished");
            return ShutdownOutcome::default();
        }

        self.round_count += 1;
        if self.round_count >= self.max_rounds {
            self.finished = true;
            info!(
                rounds = self.round_count,
                max_rounds = self.max_rounds,
                "experiment finished"
            );
            ShutdownOutcome {
                experiment_finished: true,
                ..Default::default()
            }
        } else {
            info!(
                round = self.round_count,
                max_rounds = self.max_rounds,
                "round completed"
            );
            ShutdownOutcome {
                round_completed: true,
                rotate_latency: true,
                ..Default::default()
            }
        }
    }

    pub fn reset_to_waiting(&mut self) {
        if self.state != RoundState::Waiting {
            info!("{} -> {}", self.state, RoundState::Waiting);
        }
        self.state = RoundState::Waiting;
    }
}

#[cfg(test)]
mod round_tests {
    use super::*;

    fn running(machine: &mut RoundStateMachine) {
        machine.handle_warmup();
        machine.handle_game_initialization();
    }

    #[test]
    fn warmup_alone_never_starts_the_match() {
        let mut machine = RoundStateMachine::new(2, 1);
        assert!(machine.handle_warmup());
        assert!(!machine.handle_warmup());
        assert_eq!(machine.state(), RoundState::Warmup);

        assert_eq!(
            machine.handle_match_start(),
            vec![RoundAction::StartRecording, RoundAction::ApplyLatency]
        );
        assert_eq!(machine.state(), RoundState::Running);
        assert!(machine.handle_match_start().is_empty());
    }

    #[test]
    fn game_initialization_forces_running() {
        let mut machine = RoundStateMachine::new(1, 1);
        assert!(machine.handle_game_initialization());
        assert!(!machine.handle_game_initialization());
        assert_eq!(machine.state(), RoundState::Running);
        assert!(machine.handle_warmup());
        assert_eq!(machine.state(), RoundState::Warmup);
    }

    #[test]
    fn shutdown_outside_running_counts_nothing() {
        let mut machine = RoundStateMachine::new(3, 1);
        assert_eq!(machine.handle_shutdown(), ShutdownOutcome::default());
        machine.handle_warmup();
        assert_eq!(machine.handle_shutdown(), ShutdownOutcome::default());
        assert_eq!(machine.round_count(), 1);
    }

    #[test]
    fn experiment_finishes_exactly_once() {
        let mut machine = RoundStateMachine::new(3, 1);
        assert_eq!(machine.max_rounds(), 3);

        running(&mut machine);
        let outcome = machine.handle_shutdown();
        assert!(outcome.round_completed && outcome.rotate_latency);
        assert!(!outcome.experiment_finished);
        assert_eq!(machine.round_count(), 2);
        machine.reset_to_waiting();

        running(&mut machine);
        let outcome = machine.handle_shutdown();
        assert!(outcome.experiment_finished);
        assert!(!outcome.round_completed && !outcome.rotate_latency);
        assert!(machine.is_finished());
        machine.reset_to_waiting();
        assert_eq!(machine.state(), RoundState::Waiting);

        running(&mut machine);
        assert_eq!(machine.handle_shutdown(), ShutdownOutcome::default());
        assert_eq!(machine.round_count(), 3);
    }

    #[test]
    fn round_info_display() {
        let machine = RoundStateMachine::new(2, 3);
        assert_eq!(machine.round_info().to_string(), "round 1/6 (WAITING)");
    }
}
