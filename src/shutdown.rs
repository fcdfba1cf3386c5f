//! What to do when the server reports `ShutdownGame`.
//!
//! The console processor tells a match end from a warmup end (see
//! [`ShutdownKind`]); each kind has its own [`ShutdownStrategy`]. Strategies never move the
//! round machine back to `Waiting` themselves: the dispatcher does it after every strategy.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::{info, warn};

use crate::dispatch::Experiment;
use crate::event::{ParsedEvent, ShutdownKind};
use crate::round::RoundAction;

pub trait ShutdownStrategy: Sync {
    fn kind(&self) -> ShutdownKind;

    fn handle(&self, experiment: &mut Experiment, event: &ParsedEvent);
}

/// The match is over: stop recording, count the round, then kill the server or announce it.
#[derive(Debug, Default, Clone, Copy)]
pub struct MatchShutdown;

impl ShutdownStrategy for MatchShutdown {
    fn kind(&self) -> ShutdownKind {
        ShutdownKind::MatchEnd
    }

    fn handle(&self, experiment: &mut Experiment, _event: &ParsedEvent) {
        info!("match ended");

        if experiment.recording_enabled() {
            let recording = experiment.recording();
            experiment.bridge().schedule_async("recording-stop", async move {
                let results = recording.stop_all().await;
                log_recording_results("stop", &results);
            });
        }

        let outcome = experiment.rounds_mut().handle_shutdown();
        if outcome.rotate_latency {
            experiment.rotate_latencies();
        }

        if outcome.experiment_finished {
            experiment.send("killserver");
            info!("sent killserver");
        } else {
            experiment.send("say Match completed!");
        }
    }
}

/// Warmup is over: start the match, or warm up again while too few humans are connected.
#[derive(Debug, Default, Clone, Copy)]
pub struct WarmupShutdown;

impl ShutdownStrategy for WarmupShutdown {
    fn kind(&self) -> ShutdownKind {
        ShutdownKind::WarmupEnd
    }

    fn handle(&self, experiment: &mut Experiment, _event: &ParsedEvent) {
        if experiment.insufficient_humans() {
            info!(
                humans = experiment.clients().human_count(),
                threshold = experiment.nplayers_threshold(),
                "warmup ended without enough players, warming up again"
            );
            experiment.game().set_next_round_with_warmup_phase();
            return;
        }

        info!("warmup ended, match starting");
        for action in experiment.rounds_mut().handle_match_start() {
            match action {
                RoundAction::StartRecording if experiment.recording_enabled() => {
                    let recording = experiment.recording();
                    experiment
                        .bridge()
                        .schedule_async("recording-start", async move {
                            let results = recording.start_all().await;
                            log_recording_results("start", &results);
                        });
                }
                RoundAction::StartRecording => {}
                RoundAction::ApplyLatency => experiment.apply_latency(),
            }
        }
    }
}

static MATCH_SHUTDOWN: MatchShutdown = MatchShutdown;
static WARMUP_SHUTDOWN: WarmupShutdown = WarmupShutdown;

pub fn strategy_for(kind: ShutdownKind) -> &'static dyn ShutdownStrategy {
    match kind {
        ShutdownKind::MatchEnd => &MATCH_SHUTDOWN,
        ShutdownKind::WarmupEnd => &WARMUP_SHUTDOWN,
    }
}

fn log_recording_results(action: &str, results: &HashMap<Ipv4Addr, bool>) {
    let failed: Vec<_> = results
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(address, _)| *address)
        .collect();
    if failed.is_empty() {
        info!(action, clients = results.len(), "recording updated");
    } else {
        warn!(action, ?failed, "recording failed for some clients");
    }
}
