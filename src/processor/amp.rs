use tracing::debug;

use super::MessageProcessor;
use crate::event::{dedup_by_id, EventKind, ParsedEvent};
use crate::status::{AmpStatusFormat, StatusBlockParser, StatusFormat};

/// Processor for console entries relayed by the AMP panel.
///
/// The panel only carries status blocks the pipeline cares about: every accepted row is
/// reported as it arrives, and `#end` reports the whole block.
#[derive(Debug, Default)]
pub struct AmpProcessor {
    format: AmpStatusFormat,
    status: StatusBlockParser,
}

impl AmpProcessor {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageProcessor for AmpProcessor {
    fn process(&mut self, line: &str) -> ParsedEvent {
        let line = line.trim();

        if self.format.is_block_header(line) {
            self.status.start_block();
            self.status.add_line(line);
            return ParsedEvent::status_line(line);
        }

        if !self.status.is_in_block() {
            return ParsedEvent::unknown(line);
        }

        if self.format.is_block_end(line) {
            let clients = dedup_by_id(self.status.complete_clients());
            debug!(count = clients.len(), "player section complete");
            return ParsedEvent::status_complete(line, clients);
        }

        self.status.add_line(line);
        if line.is_empty() || self.format.is_column_header(line) {
            return ParsedEvent::status_line(line);
        }
        match self.format.parse_client_line(line) {
            Some(client) => {
                self.status.add_client(client.clone());
                ParsedEvent::status_row(line, client)
            }
            None => {
                debug!(line, "skipping unparseable player row");
                ParsedEvent::status_line(line)
            }
        }
    }

    fn supported_kinds(&self) -> &'static [EventKind] {
        &[EventKind::StatusUpdate]
    }

    fn reset(&mut self) {
        self.status.reset();
    }

    fn is_in_block(&self) -> bool {
        self.status.is_in_block()
    }
}

#[cfg(test)]
mod amp_processor_tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::event::EventData;

    #[test]
    fn full_status_flow() {
        let mut processor = AmpProcessor::new();
        let lines = [
            "---------players--------",
            "  id     time ping loss      state   rate adr name",
            "  3    00:05   12    0   spawning  80000 127.190.6.117:52271 'quangminh2479'",
            "  1      BOT    0    0     active      0 'SourceTV'",
            "  4    00:07   20    0     active  80000 10.0.0.300:52272 'broken'",
            "  5    01:10   18    0     active  80000 10.0.0.5:52273 'second'",
        ];
        let events: Vec<_> = lines.iter().map(|line| processor.process(line)).collect();
        let rows = events
            .iter()
            .filter(|e| matches!(e.data(), EventData::StatusRow { .. }))
            .count();
        assert_eq!(rows, 3);
        assert!(events.iter().all(|e| e.kind() == EventKind::StatusUpdate));

        let complete = processor.process("#end");
        let EventData::StatusComplete { clients } = complete.data() else {
            panic!("expected completed block, got {complete:?}");
        };
        assert_eq!(clients.len(), 3);
        assert_eq!(clients[0].name, "quangminh2479");
        assert_eq!(clients[0].address, Some(Ipv4Addr::new(127, 190, 6, 117)));
        assert!(clients[1].is_bot);
        assert_eq!(clients[2].id, 5);
        assert!(!processor.is_in_block());
    }

    #[test]
    fn lines_outside_block_are_unknown() {
        let mut processor = AmpProcessor::new();
        assert_eq!(processor.process("some random noise").kind(), EventKind::Unknown);
        assert_eq!(processor.process("#end").kind(), EventKind::Unknown);
    }

    #[test]
    fn new_header_restarts_block() {
        let mut processor = AmpProcessor::new();
        processor.process("---------players--------");
        processor.process("3 00:05 12 0 spawning 80000 127.0.0.3:1 'old'");
        processor.process("---------players--------");
        processor.process("4 00:05 12 0 spawning 80000 127.0.0.4:1 'new'");
        let complete = processor.process("#end");
        let EventData::StatusComplete { clients } = complete.data() else {
            panic!("expected completed block");
        };
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id, 4);
    }

    #[test]
    fn duplicate_ids_are_reported_once() {
        let mut processor = AmpProcessor::new();
        processor.process("---------players--------");
        processor.process("3 00:05 12 0 spawning 80000 127.0.0.3:1 'same'");
        processor.process("3 00:06 12 0 spawning 80000 127.0.0.3:1 'same'");
        let complete = processor.process("#end");
        let EventData::StatusComplete { clients } = complete.data() else {
            panic!("expected completed block");
        };
        assert_eq!(clients.len(), 1);
    }
}
