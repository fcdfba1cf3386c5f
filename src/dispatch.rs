//! Event dispatch table and the experiment state it drives.
//!
//! [`EventDispatcher`] maps every [`EventKind`] to a handler run on the ingestion thread. Handlers
//! update the [`Experiment`] (client tracker, round machine) synchronously and hand anything
//! doing network I/O (recording, traffic shaping, bot addition) to the side-effect runtime
//! through the [`AsyncBridge`]. Side-effect tasks receive copies of what they need and never
//! touch the experiment state.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::adapter::KickCommand;
use crate::bridge::{AsyncBridge, CommandDispatcher};
use crate::clients::{ClientTracker, LatencySchedule, LatencySink, RecordingSink};
use crate::event::{ClientRecord, EventData, EventKind, ParsedEvent};
use crate::game_manager::GameManager;
use crate::round::{RoundState, RoundStateMachine};
use crate::shutdown::strategy_for;

type Handler = fn(&mut Experiment, &ParsedEvent);

/// State of a running experiment and the collaborators acting on it.
pub struct Experiment {
    rounds: RoundStateMachine,
    clients: Box<dyn ClientTracker>,
    schedule: LatencySchedule,
    game: GameManager,
    recording: Arc<dyn RecordingSink>,
    latency: Arc<dyn LatencySink>,
    commands: CommandDispatcher,
    kick: KickCommand,
    nplayers_threshold: usize,
    insufficient_humans: bool,
    current_map: Option<String>,
}

impl Experiment {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rounds: RoundStateMachine,
        clients: Box<dyn ClientTracker>,
        schedule: LatencySchedule,
        game: GameManager,
        recording: Arc<dyn RecordingSink>,
        latency: Arc<dyn LatencySink>,
        commands: CommandDispatcher,
        kick: KickCommand,
        nplayers_threshold: usize,
    ) -> Self {
        Self {
            rounds,
            clients,
            schedule,
            game,
            recording,
            latency,
            commands,
            kick,
            nplayers_threshold,
            insufficient_humans: nplayers_threshold > 0,
            current_map: None,
        }
    }

    pub fn rounds(&self) -> &RoundStateMachine {
        &self.rounds
    }

    pub(crate) fn rounds_mut(&mut self) -> &mut RoundStateMachine {
        &mut self.rounds
    }

    pub fn clients(&self) -> &dyn ClientTracker {
        self.clients.as_ref()
    }

    pub fn schedule(&self) -> &LatencySchedule {
        &self.schedule
    }

    pub fn game(&self) -> &GameManager {
        &self.game
    }

    pub fn is_finished(&self) -> bool {
        self.rounds.is_finished()
    }

    pub fn insufficient_humans(&self) -> bool {
        self.insufficient_humans
    }

    pub fn nplayers_threshold(&self) -> usize {
        self.nplayers_threshold
    }

    pub fn current_map(&self) -> Option<&str> {
        self.current_map.as_deref()
    }

    pub fn bridge(&self) -> &AsyncBridge {
        self.commands.bridge()
    }

    pub(crate) fn recording_enabled(&self) -> bool {
        self.recording.is_enabled()
    }

    pub(crate) fn recording(&self) -> Arc<dyn RecordingSink> {
        self.recording.clone()
    }

    pub(crate) fn send(&self, command: impl Into<String>) {
        self.commands.send_sync(command);
    }

    /// Hand the current assignments to the latency sink.
    pub(crate) fn apply_latency(&self) {
        if !self.latency.is_enabled() {
            info!("latency control disabled");
            self.send("say Latency control disabled");
            return;
        }
        let assignments = self.clients.latency_assignments();
        if assignments.is_empty() {
            warn!("no client to apply latency to");
            return;
        }
        let latency = self.latency.clone();
        let commands = self.commands.clone();
        self.bridge().schedule_async("latency-apply", async move {
            let count = assignments.len();
            if latency.apply(assignments).await {
                commands
                    .send(format!("say Latency rules applied to {count} clients"))
                    .await;
            } else {
                warn!("latency rules were not applied");
            }
        });
    }

    /// Shift the latency levels for the next round and announce them.
    pub(crate) fn rotate_latencies(&mut self) {
        if !self.latency.is_enabled() {
            info!("latency control disabled, not rotating");
            return;
        }
        let levels = self.schedule.rotate().to_vec();
        self.clients.assign_latencies(&levels);
        info!(round = self.schedule.rotations(), ?levels, "latencies rotated");

        let assignments = self.clients.latency_assignments();
        let latency = self.latency.clone();
        self.bridge().schedule_async("latency-rotate", async move {
            if !latency.rotate(assignments).await {
                warn!("latency rotation was not applied");
            }
        });
        self.send(self.schedule.announcement());
    }

    fn update_insufficient_humans(&mut self) {
        self.insufficient_humans = self.clients.human_count() < self.nplayers_threshold;
    }

    fn update_player_status(&self) {
        if self.rounds.state() == RoundState::Waiting {
            self.send(format!(
                "say WAITING ROOM: {}/{} players connected",
                self.clients.human_count(),
                self.nplayers_threshold
            ));
        }
    }

    fn discover_client(&mut self, client: &ClientRecord) {
        if self.clients.is_tracked(client.id) {
            debug!(id = client.id, "client already tracked");
            return;
        }

        if client.is_bot {
            self.clients
                .add_client(client.id, None, None, Some(client.name.clone()), true);
        } else if let Some(address) = client.address {
            let latency = self
                .schedule
                .level_for(self.clients.assigned_address_count());
            self.clients.add_client(
                client.id,
                Some(address),
                latency,
                Some(client.name.clone()),
                false,
            );
            info!(id = client.id, name = %client.name, %address, ?latency, "new human client");
            self.connect_recording(client.id, address);
        } else {
            debug!(id = client.id, "human client without address, waiting for next status");
            return;
        }

        self.update_player_status();
        self.update_insufficient_humans();
    }

    /// Reach the client's recorder; a client that cannot be recorded is kicked.
    fn connect_recording(&self, client_id: u32, address: Ipv4Addr) {
        if !self.recording.is_enabled() {
            return;
        }
        let recording = self.recording.clone();
        let commands = self.commands.clone();
        let kick = (self.kick)(client_id);
        self.bridge().schedule_async("recording-connect", async move {
            if recording.connect_client(address).await {
                info!(%address, "recorder connected");
            } else {
                warn!(%address, client_id, "recorder unreachable, kicking client");
                commands.send(kick).await;
            }
        });
    }
}

fn on_client_connect(_experiment: &mut Experiment, event: &ParsedEvent) {
    if let Some(client_id) = event.client_id() {
        info!(client_id, "client connecting");
    }
}

fn on_client_disconnect(experiment: &mut Experiment, event: &ParsedEvent) {
    let Some(client_id) = event.client_id() else {
        return;
    };
    if let Some(address) = experiment.clients.address_of(client_id) {
        if experiment.recording.is_enabled() {
            let recording = experiment.recording.clone();
            experiment
                .bridge()
                .schedule_async("recording-disconnect", async move {
                    recording.disconnect_client(address).await;
                });
        }
    }
    experiment.clients.remove_client(client_id);
    info!(
        client_id,
        humans = experiment.clients.human_count(),
        bots = experiment.clients.bot_count(),
        "client disconnected"
    );
    experiment.update_player_status();
    experiment.update_insufficient_humans();
}

fn on_game_initialization(experiment: &mut Experiment, _event: &ParsedEvent) {
    if experiment.rounds.handle_game_initialization() {
        info!("game running");
    }
}

fn on_game_end(experiment: &mut Experiment, event: &ParsedEvent) {
    if let EventData::GameEnd { reason } = event.data() {
        info!(%reason, "match ended");
        experiment.send(format!("say Match ended! {reason} hit."));
    }
}

fn on_warmup(experiment: &mut Experiment, event: &ParsedEvent) {
    if let EventData::Warmup { info, .. } = event.data() {
        info!(info, "warmup started");
    }
    experiment.rounds.handle_warmup();

    if experiment.game.should_add_bots() {
        let game = experiment.game.clone();
        experiment.bridge().schedule_async("add-bots", async move {
            game.add_bots().await;
        });
    }
}

fn on_shutdown(experiment: &mut Experiment, event: &ParsedEvent) {
    let EventData::Shutdown { kind, .. } = event.data() else {
        warn!(raw = event.raw(), "shutdown event without kind");
        return;
    };
    strategy_for(*kind).handle(experiment, event);
    experiment.rounds.reset_to_waiting();
}

fn on_status(experiment: &mut Experiment, event: &ParsedEvent) {
    if let Some(map) = event.raw().strip_prefix("map:") {
        let map = map.trim().to_owned();
        debug!(map, "current map");
        experiment.current_map = Some(map);
    }

    match event.data() {
        EventData::StatusRow { client } => experiment.discover_client(client),
        EventData::StatusComplete { clients } => {
            for client in clients {
                experiment.discover_client(client);
            }
        }
        _ => {}
    }
}

/// Routes each event to the handler of its kind.
pub struct EventDispatcher {
    experiment: Experiment,
    handlers: HashMap<EventKind, Handler>,
}

impl EventDispatcher {
    pub fn new(experiment: Experiment) -> Self {
        let handlers: HashMap<EventKind, Handler> = [
            (EventKind::ClientConnect, on_client_connect as Handler),
            (EventKind::ClientDisconnect, on_client_disconnect),
            (EventKind::GameInit, on_game_initialization),
            (EventKind::GameEnd, on_game_end),
            (EventKind::WarmupStart, on_warmup),
            (EventKind::ServerShutdown, on_shutdown),
            (EventKind::StatusUpdate, on_status),
        ]
        .into_iter()
        .collect();

        Self {
            experiment,
            handlers,
        }
    }

    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Run the handler of `event`'s kind. Returns `false` when no handler exists.
    pub fn dispatch(&mut self, event: &ParsedEvent) -> bool {
        match self.handlers.get(&event.kind()) {
            Some(handler) => {
                handler(&mut self.experiment, event);
                true
            }
            None => false,
        }
    }
}
