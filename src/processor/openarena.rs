use regex::Regex;
use tracing::{debug, info};

use super::{CommandCallback, MessageProcessor};
use crate::event::{dedup_by_id, EndReason, EventKind, ParsedEvent, ShutdownKind};
use crate::status::{OpenArenaStatusFormat, StatusBlockParser, StatusFormat};

const SUPPORTED_KINDS: &[EventKind] = &[
    EventKind::ClientConnect,
    EventKind::ClientDisconnect,
    EventKind::GameInit,
    EventKind::GameEnd,
    EventKind::WarmupStart,
    EventKind::ServerShutdown,
    EventKind::StatusUpdate,
];

/// Processor for the OpenArena dedicated server console.
///
/// Besides classifying lines it keeps two one-shot markers:
/// - `recent_fraglimit_hit`: set by `Exit: Fraglimit hit.`, consumed by the next
///   `ShutdownGame:` (which then closes a match instead of a warmup) and cleared by `Warmup:`.
/// - `recent_game_initialization`: set by the game initialization banner, reported and cleared
///   by the next `Warmup:`.
pub struct OpenArenaProcessor {
    connect_regex: Regex,
    disconnect_regex: Regex,
    init_regex: Regex,
    exit_regex: Regex,
    warmup_regex: Regex,
    shutdown_regex: Regex,
    format: OpenArenaStatusFormat,
    status: StatusBlockParser,
    recent_fraglimit_hit: bool,
    recent_game_initialization: bool,
    current_map: Option<String>,
    send_command: Option<CommandCallback>,
}

impl OpenArenaProcessor {
    /// `send_command` is used to request a `status` block whenever a client connects.
    pub fn new(send_command: Option<CommandCallback>) -> Self {
        Self {
            connect_regex: Regex::new(r"^Client ([0-9]+) connecting with ([0-9]+) challenge ping$")
                .unwrap(),
            disconnect_regex: Regex::new(r"^ClientDisconnect: ([0-9]+)$").unwrap(),
            init_regex: Regex::new(r"^------- Game Initialization -------$").unwrap(),
            exit_regex: Regex::new(r"^Exit: (Fraglimit|Timelimit) hit\.$").unwrap(),
            warmup_regex: Regex::new(r"^Warmup:\s*(.*)$").unwrap(),
            shutdown_regex: Regex::new(r"^ShutdownGame:\s*(.*)$").unwrap(),
            format: OpenArenaStatusFormat::new(),
            status: StatusBlockParser::new(),
            recent_fraglimit_hit: false,
            recent_game_initialization: false,
            current_map: None,
            send_command,
        }
    }

    pub fn recent_fraglimit_hit(&self) -> bool {
        self.recent_fraglimit_hit
    }

    /// Last map announced before a status block.
    pub fn current_map(&self) -> Option<&str> {
        self.current_map.as_deref()
    }

    fn process_marker(&mut self, line: &str) -> Option<ParsedEvent> {
        if let Some(caps) = self.connect_regex.captures(line) {
            let client_id: u32 = caps[1].parse().ok()?;
            let challenge_ping: u32 = caps[2].parse().unwrap_or(0);
            info!(client_id, "client connecting, requesting status");
            if let Some(send) = &self.send_command {
                send("status");
            }
            return Some(ParsedEvent::client_connect(line, client_id, challenge_ping));
        }

        if let Some(caps) = self.disconnect_regex.captures(line) {
            let client_id: u32 = caps[1].parse().ok()?;
            return Some(ParsedEvent::client_disconnect(line, client_id));
        }

        if self.init_regex.is_match(line) {
            self.recent_game_initialization = true;
            return Some(ParsedEvent::game_init(line));
        }

        if let Some(caps) = self.exit_regex.captures(line) {
            let reason = if &caps[1] == "Fraglimit" {
                EndReason::Fraglimit
            } else {
                EndReason::Timelimit
            };
            self.recent_fraglimit_hit = true;
            return Some(ParsedEvent::game_end(line, reason));
        }

        if let Some(caps) = self.warmup_regex.captures(line) {
            let follows_game_initialization = self.recent_game_initialization;
            self.recent_fraglimit_hit = false;
            self.recent_game_initialization = false;
            return Some(ParsedEvent::warmup(
                line,
                caps[1].trim(),
                follows_game_initialization,
            ));
        }

        if let Some(caps) = self.shutdown_regex.captures(line) {
            // NOTE: heuristic, the server does not say which phase it is shutting down
            let kind = if std::mem::take(&mut self.recent_fraglimit_hit) {
                ShutdownKind::MatchEnd
            } else {
                ShutdownKind::WarmupEnd
            };
            debug!(kind = kind.key(), "server shutdown");
            return Some(ParsedEvent::shutdown(line, kind, caps[1].trim()));
        }

        None
    }

    fn complete_status(&mut self, line: &str) -> ParsedEvent {
        let clients = dedup_by_id(self.status.complete_clients());
        debug!(count = clients.len(), "status block complete");
        ParsedEvent::status_complete(line, clients)
    }

    fn process_block_line(&mut self, line: &str) -> ParsedEvent {
        if self.format.is_block_end(line) {
            return self.complete_status(line);
        }
        self.status.add_line(line);

        if self.format.is_separator(line) {
            self.status.mark_separator_seen();
            return ParsedEvent::status_line(line);
        }
        if !self.status.separator_seen() {
            return ParsedEvent::status_line(line);
        }
        if !self.format.is_client_row(line) {
            // the block has no end marker, anything else closes it
            return self.complete_status(line);
        }
        match self.format.parse_client_line(line) {
            Some(client) => {
                self.status.add_client(client.clone());
                ParsedEvent::status_row(line, client)
            }
            None => ParsedEvent::status_line(line),
        }
    }
}

impl MessageProcessor for OpenArenaProcessor {
    fn process(&mut self, line: &str) -> ParsedEvent {
        let line = line.trim();

        if let Some(event) = self.process_marker(line) {
            return event;
        }

        if self.format.is_block_header(line) {
            self.status.start_block();
            self.status.add_line(line);
            return ParsedEvent::status_line(line);
        }

        if self.status.is_in_block() {
            return self.process_block_line(line);
        }

        if let Some(map) = self.format.map_name(line) {
            self.current_map = Some(map.to_owned());
            return ParsedEvent::status_line(line);
        }

        ParsedEvent::unknown(line)
    }

    fn supported_kinds(&self) -> &'static [EventKind] {
        SUPPORTED_KINDS
    }

    fn reset(&mut self) {
        self.status.reset();
        self.recent_fraglimit_hit = false;
        self.recent_game_initialization = false;
    }

    fn is_in_block(&self) -> bool {
        self.status.is_in_block()
    }
}

#[cfg(test)]
mod openarena_processor_tests {
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::event::EventData;

    fn processor() -> OpenArenaProcessor {
        OpenArenaProcessor::new(None)
    }

    #[test]
    fn disconnect_carries_client_id() {
        let event = processor().process("ClientDisconnect: 7");
        assert_eq!(event.kind(), EventKind::ClientDisconnect);
        assert_eq!(event.client_id(), Some(7));
    }

    #[test]
    fn connect_requests_status() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let mut processor = OpenArenaProcessor::new(Some(Arc::new(move |cmd: &str| {
            sink.lock().unwrap().push(cmd.to_owned())
        })));

        let event = processor.process("Client 2 connecting with 50 challenge ping");
        assert_eq!(
            event.data(),
            &EventData::ClientConnect {
                client_id: 2,
                challenge_ping: 50
            }
        );
        assert_eq!(*sent.lock().unwrap(), vec!["status".to_owned()]);
    }

    #[test]
    fn shutdown_after_fraglimit_is_match_end() {
        let mut processor = processor();
        let end = processor.process("Exit: Fraglimit hit.");
        assert_eq!(
            end.data(),
            &EventData::GameEnd {
                reason: EndReason::Fraglimit
            }
        );
        assert!(processor.recent_fraglimit_hit());

        let shutdown = processor.process("ShutdownGame:");
        assert!(matches!(
            shutdown.data(),
            EventData::Shutdown {
                kind: ShutdownKind::MatchEnd,
                ..
            }
        ));
        assert!(!processor.recent_fraglimit_hit());

        let next = processor.process("ShutdownGame:");
        assert!(matches!(
            next.data(),
            EventData::Shutdown {
                kind: ShutdownKind::WarmupEnd,
                ..
            }
        ));
    }

    #[test]
    fn warmup_clears_fraglimit_flag() {
        let mut processor = processor();
        processor.process("Exit: Timelimit hit.");
        let warmup = processor.process("Warmup: 10");
        assert_eq!(warmup.kind(), EventKind::WarmupStart);
        assert!(!processor.recent_fraglimit_hit());
        let shutdown = processor.process("ShutdownGame:");
        assert!(matches!(
            shutdown.data(),
            EventData::Shutdown {
                kind: ShutdownKind::WarmupEnd,
                ..
            }
        ));
    }

    #[test]
    fn reset_clears_fraglimit_flag() {
        let mut processor = processor();
        processor.process("Exit: Fraglimit hit.");
        processor.reset();
        assert!(!processor.recent_fraglimit_hit());
    }

    #[test]
    fn warmup_reports_previous_initialization() {
        let mut processor = processor();
        assert_eq!(
            processor.process("------- Game Initialization -------").kind(),
            EventKind::GameInit
        );
        let warmup = processor.process("Warmup:");
        assert!(matches!(
            warmup.data(),
            EventData::Warmup {
                follows_game_initialization: true,
                ..
            }
        ));
        let again = processor.process("Warmup:");
        assert!(matches!(
            again.data(),
            EventData::Warmup {
                follows_game_initialization: false,
                ..
            }
        ));
    }

    #[test]
    fn status_block_round_trip() {
        let mut processor = processor();
        let lines = [
            "map: oa_dm1",
            "num score ping name            lastmsg address               qport rate",
            "--- ----- ---- --------------- ------- --------------------- ----- -----",
            "  0     0    0 Sarge                 0 bot                       0 16384",
            "  1     3   48 alice                50 192.168.1.20:27960    12345 25000",
            "  2     1   30 bob                  50 300.168.1.21:27960    12346 25000",
            "  1     3   48 alice                50 192.168.1.20:27960    12345 25000",
            "  3     0   22 carol                50 192.168.1.22:27960    12347 25000",
        ];
        let mut rows = 0;
        for line in lines {
            let event = processor.process(line);
            assert_eq!(event.kind(), EventKind::StatusUpdate);
            if matches!(event.data(), EventData::StatusRow { .. }) {
                rows += 1;
            }
        }
        assert_eq!(rows, 4);
        assert_eq!(processor.current_map(), Some("oa_dm1"));

        let complete = processor.process("");
        let EventData::StatusComplete { clients } = complete.data() else {
            panic!("expected a completed block, got {complete:?}");
        };
        let ids: Vec<u32> = clients.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 3]);
        assert_eq!(clients[1].name, "alice");
        assert_eq!(clients[1].address, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(clients[0].is_bot);
        assert!(!processor.is_in_block());
    }

    #[test]
    fn non_row_line_closes_block_without_swallowing_markers() {
        let mut processor = processor();
        processor.process("num score ping name lastmsg address qport rate");
        processor.process("--- ----- ---- ----");
        processor.process("  1 3 48 alice 50 10.0.0.1:27960 1 2");

        // markers are classified before block handling
        let disconnect = processor.process("ClientDisconnect: 1");
        assert_eq!(disconnect.kind(), EventKind::ClientDisconnect);
        assert!(processor.is_in_block());

        let closing = processor.process("Hitch warning: 1200 msec frame time");
        assert!(closing.is_status_complete());
        assert!(!processor.is_in_block());
        assert_eq!(
            processor.process("Hitch warning: 1200 msec frame time").kind(),
            EventKind::Unknown
        );
    }

    #[test]
    fn empty_line_outside_block_is_unknown() {
        assert_eq!(processor().process("").kind(), EventKind::Unknown);
        assert_eq!(processor().process("random noise").kind(), EventKind::Unknown);
    }
}
