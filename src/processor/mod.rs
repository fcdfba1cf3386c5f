//! Classification of console lines into [`ParsedEvent`]s.
//!
//! A processor is stateless for single-line markers (each matched by one fixed pattern, in a
//! fixed priority order) and stateful for status blocks, which it accumulates through a
//! [`StatusBlockParser`](crate::status::StatusBlockParser) it owns.

mod amp;
mod openarena;

use std::sync::Arc;

pub use amp::AmpProcessor;
pub use openarena::OpenArenaProcessor;

use crate::event::{EventKind, ParsedEvent};

/// Injected way for a processor to talk back to the server (e.g. ask for `status`).
pub type CommandCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Turns raw console lines into events.
pub trait MessageProcessor: Send {
    /// Classify one line. Never fails: unrecognised content is [`EventKind::Unknown`].
    fn process(&mut self, line: &str) -> ParsedEvent;

    /// Kinds this processor can emit, besides `Unknown`.
    fn supported_kinds(&self) -> &'static [EventKind];

    /// Forget every piece of accumulated state (open block, one-shot flags).
    fn reset(&mut self);

    /// Whether a status block is currently open.
    fn is_in_block(&self) -> bool;
}
