use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::{debug, error, info, instrument, warn};

use super::{DedupCache, EventStream, GameAdapter, KickCommand, PanelConfig};
use crate::bridge::{AsyncBridge, CommandDispatcher, CommandSender, ShutdownSignal};
use crate::errors::{Error, TransportError};
use crate::event::ParsedEvent;
use crate::panel::{AmpApiClient, ConsoleEntry, PanelApi};
use crate::processor::{AmpProcessor, MessageProcessor};

/// Granularity of the wait between two polls.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Sends console messages through the panel, on the adapter's RPC runtime.
struct PanelCommandSender {
    api: Arc<dyn PanelApi>,
    rpc: Handle,
}

#[async_trait]
impl CommandSender for PanelCommandSender {
    async fn send_command(&self, command: String) {
        let api = self.api.clone();
        let sent = self
            .rpc
            .spawn(async move { api.send_console_message(command).await })
            .await;
        match sent {
            Ok(Ok(true)) => debug!("console message sent"),
            Ok(Ok(false)) => warn!("panel refused console message"),
            Ok(Err(e)) => error!("failed to send console message: {e}"),
            Err(e) => error!("console message task failed: {e}"),
        }
    }
}

/// Adapter polling an AMP panel for console entries.
///
/// Every RPC runs on a private single-worker runtime, so the adapter can be driven from a plain
/// thread. Entries seen before (same timestamp and content) are skipped; an entry holding
/// several lines yields one event per line, all stamped with the entry time.
pub struct PanelAdapter {
    api: Arc<dyn PanelApi>,
    rpc: Runtime,
    processor: AmpProcessor,
    seen: DedupCache,
    poll_interval: Duration,
    manage_instance: bool,
    connected: bool,
    polled_once: bool,
    pending: VecDeque<ParsedEvent>,
    commands: CommandDispatcher,
    shutdown: ShutdownSignal,
}

impl PanelAdapter {
    /// Adapter talking HTTP to the panel described by `config`.
    pub fn new(
        config: &PanelConfig,
        poll_interval: Duration,
        bridge: AsyncBridge,
    ) -> Result<Self, Error> {
        let api = AmpApiClient::new(config)?;
        let adapter = Self::with_api(Arc::new(api), poll_interval, bridge)?
            .with_manage_instance(config.manage_instance);
        Ok(adapter)
    }

    pub fn with_api(
        api: Arc<dyn PanelApi>,
        poll_interval: Duration,
        bridge: AsyncBridge,
    ) -> Result<Self, TransportError> {
        let rpc = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("panel-rpc")
            .enable_all()
            .build()
            .map_err(TransportError::Runtime)?;
        let shutdown = bridge.shutdown_signal();
        let commands = CommandDispatcher::new(
            Arc::new(PanelCommandSender {
                api: api.clone(),
                rpc: rpc.handle().clone(),
            }),
            bridge,
        );

        Ok(Self {
            api,
            rpc,
            processor: AmpProcessor::new(),
            seen: DedupCache::new(DedupCache::DEFAULT_CAPACITY),
            poll_interval,
            manage_instance: false,
            connected: false,
            polled_once: false,
            pending: VecDeque::new(),
            commands,
            shutdown,
        })
    }

    pub fn with_manage_instance(mut self, manage_instance: bool) -> Self {
        self.manage_instance = manage_instance;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Number of entry keys currently remembered.
    pub fn seen_entries(&self) -> usize {
        self.seen.len()
    }

    fn forget_session(&mut self) {
        self.seen.clear();
        self.processor.reset();
        self.pending.clear();
        self.polled_once = false;
    }

    fn ingest(&mut self, entries: Vec<ConsoleEntry>) {
        for entry in entries {
            if !self.seen.insert(entry.dedup_key()) {
                debug!(contents = %entry.contents, "skipping duplicate entry");
                continue;
            }
            let timestamp = entry.epoch_seconds();
            for line in entry.contents.split('\n') {
                let line = line.trim_end_matches('\r');
                if line.trim().is_empty() {
                    continue;
                }
                let event = self.processor.process(line).with_timestamp(timestamp);
                self.pending.push_back(event);
            }
        }
    }

    /// Sleep until the next poll is due. `false` when a shutdown arrived meanwhile.
    fn wait_for_next_poll(&self) -> bool {
        let deadline = Instant::now() + self.poll_interval;
        loop {
            if self.shutdown.is_requested() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(POLL_SLICE.min(deadline - now));
        }
    }

    fn relogin(&mut self) -> bool {
        warn!("trying to log in again");
        match self.rpc.block_on(self.api.login()) {
            Ok(()) => {
                // same session as far as the console goes: seen entries stay seen
                info!("logged in again");
                true
            }
            Err(e) => {
                error!("re-login failed, ending event stream: {e}");
                false
            }
        }
    }

    fn next_event(&mut self) -> Option<ParsedEvent> {
        loop {
            if self.shutdown.is_requested() {
                info!("shutdown requested, leaving poll loop");
                return None;
            }
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            if !self.connected {
                return None;
            }
            if self.polled_once && !self.wait_for_next_poll() {
                continue;
            }
            self.polled_once = true;

            match self.rpc.block_on(self.api.get_updates()) {
                Ok(entries) => self.ingest(entries),
                Err(e) => {
                    error!("GetUpdates failed: {e}");
                    if !self.relogin() {
                        self.connected = false;
                        return None;
                    }
                }
            }
        }
    }

    fn release(&mut self) {
        if !self.connected {
            return;
        }
        self.connected = false;
        if self.manage_instance {
            match self.rpc.block_on(self.api.stop_instance()) {
                Ok(true) => info!("instance stopped"),
                Ok(false) => warn!("panel refused to stop the instance"),
                Err(e) => warn!("could not stop instance: {e}"),
            }
        }
        if let Err(e) = self.rpc.block_on(self.api.logout()) {
            warn!("logout failed: {e}");
        }
        self.forget_session();
        info!("disconnected from panel");
    }
}

impl GameAdapter for PanelAdapter {
    fn name(&self) -> &'static str {
        "amp"
    }

    #[instrument(skip_all, fields(poll_interval = ?self.poll_interval))]
    fn connect(&mut self) -> bool {
        if self.connected {
            debug!("already connected");
            return true;
        }
        if let Err(e) = self.rpc.block_on(self.api.login()) {
            error!("panel login failed: {e}");
            return false;
        }

        self.forget_session();
        if self.manage_instance {
            match self.rpc.block_on(self.api.start_instance()) {
                Ok(true) => info!("instance started"),
                Ok(false) => warn!("panel refused to start the instance"),
                Err(e) => warn!("could not start instance: {e}"),
            }
        }
        match self.rpc.block_on(self.api.get_status()) {
            Ok(status) => {
                let state = status.get("State").cloned().unwrap_or(Value::Null);
                info!(%state, "connected to panel");
            }
            Err(e) => warn!("connected, but instance status is unavailable: {e}"),
        }
        self.connected = true;
        self.shutdown.clear();
        true
    }

    fn events(&mut self) -> EventStream<'_> {
        Box::new(std::iter::from_fn(move || self.next_event()))
    }

    fn commands(&self) -> CommandDispatcher {
        self.commands.clone()
    }

    fn disconnect(&mut self) {
        self.shutdown.request();
        self.release();
    }

    fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    fn kick_format(&self) -> KickCommand {
        |client_id| format!("kickid {client_id}")
    }
}

impl Drop for PanelAdapter {
    fn drop(&mut self) {
        self.release();
    }
}
