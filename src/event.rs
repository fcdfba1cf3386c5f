//! Typed events produced by the console parsers.
//!
//! Every console line (or panel entry line) becomes exactly one [`ParsedEvent`]. Events are
//! immutable: they are built through per-kind constructors so that [`ParsedEvent::kind`] and
//! [`ParsedEvent::data`] always agree, and are consumed by a single dispatch.

use std::fmt::Display;
use std::net::Ipv4Addr;

use serde_json::{Map, Value};

use crate::errors::ParseError;

/// Closed set of events the pipeline understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ClientConnect,
    ClientDisconnect,
    GameInit,
    GameEnd,
    WarmupStart,
    ServerShutdown,
    StatusUpdate,
    Unknown,
}

/// Why a match ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Fraglimit,
    Timelimit,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Fraglimit => "fraglimit",
            EndReason::Timelimit => "timelimit",
        }
    }
}

impl Display for EndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which shutdown strategy a server shutdown must go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownKind {
    /// The shutdown closes a played match
    MatchEnd,
    /// The shutdown closes a warmup phase
    WarmupEnd,
}

impl ShutdownKind {
    /// Key used in logs (`match_end` / `warmup_end`).
    pub fn key(&self) -> &'static str {
        match self {
            ShutdownKind::MatchEnd => "match_end",
            ShutdownKind::WarmupEnd => "warmup_end",
        }
    }
}

/// One client as reported by a status block.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRecord {
    pub id: u32,
    pub name: String,
    pub address: Option<Ipv4Addr>,
    pub is_bot: bool,
    /// Transport specific fields (ping, loss, rate, state, ...) the pipeline does not interpret
    pub extra: Map<String, Value>,
}

impl ClientRecord {
    pub fn human(id: u32, name: impl Into<String>, address: Ipv4Addr) -> Self {
        Self {
            id,
            name: name.into(),
            address: Some(address),
            is_bot: false,
            extra: Map::new(),
        }
    }

    pub fn bot(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            address: None,
            is_bot: true,
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_owned(), value.into());
        self
    }
}

/// Payload of a [`ParsedEvent`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventData {
    None,
    ClientConnect {
        client_id: u32,
        challenge_ping: u32,
    },
    ClientDisconnect {
        client_id: u32,
    },
    GameEnd {
        reason: EndReason,
    },
    Warmup {
        info: String,
        follows_game_initialization: bool,
    },
    Shutdown {
        kind: ShutdownKind,
        info: String,
    },
    /// Latest row accumulated inside a status block
    StatusRow {
        client: ClientRecord,
    },
    /// End of a status block, clients de-duplicated by id
    StatusComplete {
        clients: Vec<ClientRecord>,
    },
}

/// A classified console line.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEvent {
    kind: EventKind,
    raw: String,
    data: EventData,
    timestamp: Option<f64>,
}

impl ParsedEvent {
    fn build(kind: EventKind, raw: &str, data: EventData) -> Self {
        Self {
            kind,
            raw: raw.to_owned(),
            data,
            timestamp: None,
        }
    }

    pub fn unknown(raw: &str) -> Self {
        Self::build(EventKind::Unknown, raw, EventData::None)
    }

    pub fn client_connect(raw: &str, client_id: u32, challenge_ping: u32) -> Self {
        Self::build(
            EventKind::ClientConnect,
            raw,
            EventData::ClientConnect {
                client_id,
                challenge_ping,
            },
        )
    }

    pub fn client_disconnect(raw: &str, client_id: u32) -> Self {
        Self::build(
            EventKind::ClientDisconnect,
            raw,
            EventData::ClientDisconnect { client_id },
        )
    }

    pub fn game_init(raw: &str) -> Self {
        Self::build(EventKind::GameInit, raw, EventData::None)
    }

    pub fn game_end(raw: &str, reason: EndReason) -> Self {
        Self::build(EventKind::GameEnd, raw, EventData::GameEnd { reason })
    }

    pub fn warmup(raw: &str, info: &str, follows_game_initialization: bool) -> Self {
        Self::build(
            EventKind::WarmupStart,
            raw,
            EventData::Warmup {
                info: info.to_owned(),
                follows_game_initialization,
            },
        )
    }

    pub fn shutdown(raw: &str, kind: ShutdownKind, info: &str) -> Self {
        Self::build(
            EventKind::ServerShutdown,
            raw,
            EventData::Shutdown {
                kind,
                info: info.to_owned(),
            },
        )
    }

    /// A line that belongs to a status block but carries no client.
    pub fn status_line(raw: &str) -> Self {
        Self::build(EventKind::StatusUpdate, raw, EventData::None)
    }

    pub fn status_row(raw: &str, client: ClientRecord) -> Self {
        Self::build(
            EventKind::StatusUpdate,
            raw,
            EventData::StatusRow { client },
        )
    }

    pub fn status_complete(raw: &str, clients: Vec<ClientRecord>) -> Self {
        Self::build(
            EventKind::StatusUpdate,
            raw,
            EventData::StatusComplete { clients },
        )
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn data(&self) -> &EventData {
        &self.data
    }

    pub fn timestamp(&self) -> Option<f64> {
        self.timestamp
    }

    /// Client id carried by connect/disconnect events.
    pub fn client_id(&self) -> Option<u32> {
        match self.data {
            EventData::ClientConnect { client_id, .. }
            | EventData::ClientDisconnect { client_id } => Some(client_id),
            _ => None,
        }
    }

    pub fn is_status_complete(&self) -> bool {
        matches!(self.data, EventData::StatusComplete { .. })
    }
}

/// Validate a dotted IPv4 address: four non-empty digit groups, each in `0..=255`.
///
/// Leading zeros are accepted (`010.0.0.1` is `10.0.0.1`).
pub fn parse_ipv4(text: &str) -> Result<Ipv4Addr, ParseError> {
    let invalid = || ParseError::InvalidAddress(text.to_owned());
    let mut octets = [0u8; 4];
    let mut count = 0;
    for part in text.split('.') {
        if count == 4 || part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let value: u32 = part.parse().map_err(|_| invalid())?;
        octets[count] = u8::try_from(value).map_err(|_| invalid())?;
        count += 1;
    }
    if count != 4 {
        return Err(invalid());
    }
    Ok(Ipv4Addr::from(octets))
}

/// Keep the first record for every id, in input order.
pub fn dedup_by_id(clients: Vec<ClientRecord>) -> Vec<ClientRecord> {
    let mut seen = std::collections::HashSet::new();
    clients
        .into_iter()
        .filter(|client| seen.insert(client.id))
        .collect()
}
