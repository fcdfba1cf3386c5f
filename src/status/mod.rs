//! Multi-line status block accumulation.
//!
//! Game servers answer a `status` request with a block of lines listing every connected
//! client. [`StatusBlockParser`] holds the block state ([`StatusParseState`], accumulated lines,
//! separator flag and parsed clients) and each console dialect supplies a [`StatusFormat`]
//! that recognises its own header, end marker, column header and rows.
//!
//! Rows that cannot be parsed are dropped one by one; they never abort the block.

mod amp;
mod openarena;

pub use amp::AmpStatusFormat;
pub use openarena::OpenArenaStatusFormat;

use crate::event::ClientRecord;

/// Dialect specific recognisers for a status block.
pub trait StatusFormat: Send {
    /// Line opening a new block
    fn is_block_header(&self, line: &str) -> bool;

    /// Explicit end marker, or the empty line convention for dialects without one
    fn is_block_end(&self, line: &str) -> bool;

    /// Header row naming the columns, not data
    fn is_column_header(&self, line: &str) -> bool;

    /// Separator between header and rows. Dialects without one keep the default.
    fn is_separator(&self, _line: &str) -> bool {
        false
    }

    /// Parse one client row, `None` when the row is malformed.
    fn parse_client_line(&self, line: &str) -> Option<ClientRecord>;
}

/// Whether a block is currently being accumulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusParseState {
    #[default]
    Idle,
    InBlock,
}

/// Accumulator for one status block at a time.
///
/// `InBlock` means a header was seen and the matching end was not. Leaving `InBlock` always
/// clears everything that was accumulated.
#[derive(Debug, Default)]
pub struct StatusBlockParser {
    state: StatusParseState,
    lines: Vec<String>,
    separator_seen: bool,
    clients: Vec<ClientRecord>,
}

impl StatusBlockParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> StatusParseState {
        self.state
    }

    pub fn is_in_block(&self) -> bool {
        self.state == StatusParseState::InBlock
    }

    pub fn separator_seen(&self) -> bool {
        self.separator_seen
    }

    /// Enter `InBlock` with empty accumulators. An unfinished previous block is discarded.
    pub fn start_block(&mut self) {
        self.reset();
        self.state = StatusParseState::InBlock;
    }

    /// Append a line. Ignored while `Idle`.
    pub fn add_line(&mut self, line: &str) {
        if self.is_in_block() {
            self.lines.push(line.to_owned());
        }
    }

    /// Record a parsed client. Ignored while `Idle`.
    pub fn add_client(&mut self, client: ClientRecord) {
        if self.is_in_block() {
            self.clients.push(client);
        }
    }

    pub fn mark_separator_seen(&mut self) {
        self.separator_seen = true;
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn clients(&self) -> &[ClientRecord] {
        &self.clients
    }

    /// Return the accumulated lines and go back to `Idle`. Safe on an empty block.
    pub fn complete_block(&mut self) -> Vec<String> {
        let lines = std::mem::take(&mut self.lines);
        self.reset();
        lines
    }

    /// Like [`complete_block`](Self::complete_block), returning the parsed clients instead.
    pub fn complete_clients(&mut self) -> Vec<ClientRecord> {
        let clients = std::mem::take(&mut self.clients);
        self.reset();
        clients
    }

    pub fn reset(&mut self) {
        self.state = StatusParseState::Idle;
        self.lines.clear();
        self.separator_seen = false;
        self.clients.clear();
    }
}
