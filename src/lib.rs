//! # Arena Harness
//!
//! A harness running multi-round latency experiments on game servers.
//!
//! It provides:
//! - Two transports behind one [`GameAdapter`](crate::adapter::GameAdapter) surface: an
//!   OpenArena dedicated server run as a child process, and a server hosted behind an AMP panel
//!   polled over HTTP
//! - Stateful console processors turning raw lines into typed [`ParsedEvent`](crate::event::ParsedEvent)s,
//!   including multi-line status blocks and de-duplication of polled entries
//! - A round state machine (`WAITING` / `WARMUP` / `RUNNING`) and match-end / warmup-end
//!   shutdown strategies deciding when the experiment is over
//! - Client tracking with per-client latency levels rotated between rounds, and hooks for
//!   screen recording and traffic shaping
//!
//! Console ingestion is blocking and runs on the caller's thread. Side effects (recording,
//! latency rules, bot addition) run on a separate tokio runtime and are handed over through an
//! [`AsyncBridge`](crate::bridge::AsyncBridge), never awaited by the event handlers.
//!
//! # Documentation Overview
//!
//! - For the experiment lifecycle, see the [`harness`] module.
//! - For configuring the run, see [`Configuration`](crate::configuration::Configuration).
//! - For the transports, see the [`adapter`] module and the [`panel`] API.
//! - For the event vocabulary, see [`event`]; for the line classification, see [`processor`]
//!   and [`status`].
//! - For round sequencing, see [`round`], [`shutdown`] and [`dispatch`].
//!
//! # Usage Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use arena_harness::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Configuration::new()
//!         .with_openarena_server("/usr/games/oa_ded", 27960)
//!         .with_latencies(vec![0, 50, 100])?
//!         .with_repeats(2)
//!         .with_nplayers_threshold(2);
//!
//!     let harness = Harness::new(config)?.with_recording(Arc::new(NoRecording));
//!
//!     let signal = harness.shutdown_signal();
//!     std::thread::spawn(move || {
//!         std::thread::sleep(std::time::Duration::from_secs(3600));
//!         signal.request();
//!     });
//!
//!     let summary = harness.run()?;
//!     println!("{summary}");
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod bridge;
pub mod clients;
pub mod configuration;
pub mod dispatch;
pub mod errors;
pub mod event;
pub mod game_manager;
pub mod harness;
mod logger;
pub mod panel;
pub mod processor;
pub mod round;
pub mod shutdown;
pub mod status;

pub use anyhow;
pub use logger::init_logger;

/// Commonly used types and traits for quick access.
///
/// Import this prelude to get started easily:
/// ```rust
/// use arena_harness::prelude::*;
/// ```
///
/// Includes:
/// - [`Configuration`](crate::configuration::Configuration) and [`GameType`](crate::configuration::GameType)
/// - [`Harness`](crate::harness::Harness) and its [`RunSummary`](crate::harness::RunSummary)
/// - the adapter surface and the collaborator traits
pub mod prelude {
    pub use crate::adapter::{create_adapter, AdapterConfig, GameAdapter, TransportConfig};
    pub use crate::bridge::{AsyncBridge, ShutdownSignal};
    pub use crate::clients::{
        ClientRegistry, ClientTracker, DisabledLatency, LatencySink, NoRecording, RecordingSink,
    };
    pub use crate::configuration::{Configuration, GameType};
    pub use crate::event::{EventKind, ParsedEvent};
    pub use crate::harness::{Harness, OutputHandler, RunSummary};
}
