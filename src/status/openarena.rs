use regex::Regex;
use tracing::debug;

use super::StatusFormat;
use crate::event::{parse_ipv4, ClientRecord};

/// Status output of the OpenArena dedicated server.
///
/// ```text
/// map: oa_dm1
/// num score ping name            lastmsg address               qport rate
/// --- ----- ---- --------------- ------- --------------------- ----- -----
///   0     0    0 Sarge                 0 bot                       0 16384
///   1     3   48 player               50 192.168.1.20:27960    12345 25000
/// ```
///
/// The block has no end marker: it ends on an empty line, or on the first line after the
/// separator that is not a row.
#[derive(Debug, Clone)]
pub struct OpenArenaStatusFormat {
    row_regex: Regex,
}

impl Default for OpenArenaStatusFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl OpenArenaStatusFormat {
    pub fn new() -> Self {
        Self {
            row_regex: Regex::new(r"^\s*\d+\s+").unwrap(),
        }
    }

    /// Rows start with the slot number.
    pub fn is_client_row(&self, line: &str) -> bool {
        self.row_regex.is_match(line)
    }

    pub fn is_map_line(&self, line: &str) -> bool {
        line.trim_start().starts_with("map:")
    }

    pub fn map_name<'a>(&self, line: &'a str) -> Option<&'a str> {
        line.trim_start()
            .strip_prefix("map:")
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}

impl StatusFormat for OpenArenaStatusFormat {
    fn is_block_header(&self, line: &str) -> bool {
        line.contains("num score ping name") && line.contains("address")
    }

    fn is_block_end(&self, line: &str) -> bool {
        line.trim().is_empty()
    }

    fn is_column_header(&self, line: &str) -> bool {
        self.is_block_header(line)
    }

    fn is_separator(&self, line: &str) -> bool {
        line.trim_start().starts_with("---")
    }

    fn parse_client_line(&self, line: &str) -> Option<ClientRecord> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 6 {
            debug!(line, "status row has fewer than 6 fields");
            return None;
        }

        let id: u32 = parts[0].parse().ok()?;
        let score: i64 = parts[1].parse().ok()?;
        let ping: i64 = parts[2].parse().ok()?;
        let name = parts[3];
        let lastmsg: i64 = parts[4].parse().ok()?;
        let address = parts[5];

        let mut client = if address == "bot" {
            ClientRecord::bot(id, name)
        } else {
            let (ip, port) = match address.split_once(':') {
                Some((ip, port)) => (ip, port.parse::<u16>().ok()),
                None => (address, None),
            };
            let ip = match parse_ipv4(ip) {
                Ok(ip) => ip,
                Err(e) => {
                    debug!(line, "dropping status row: {e}");
                    return None;
                }
            };
            let mut client = ClientRecord::human(id, name, ip);
            if let Some(port) = port {
                client = client.with_extra("port", port);
            }
            client
        };

        client = client
            .with_extra("score", score)
            .with_extra("ping", ping)
            .with_extra("lastmsg", lastmsg);
        if let Some(qport) = parts.get(6).and_then(|p| p.parse::<i64>().ok()) {
            client = client.with_extra("qport", qport);
        }
        if let Some(rate) = parts.get(7).and_then(|p| p.parse::<i64>().ok()) {
            client = client.with_extra("rate", rate);
        }
        Some(client)
    }
}

#[cfg(test)]
mod openarena_status_tests {
    use std::net::Ipv4Addr;

    use super::*;

    #[test]
    fn recognises_block_structure() {
        let format = OpenArenaStatusFormat::new();
        let header = "num score ping name            lastmsg address               qport rate";
        assert!(format.is_block_header(header));
        assert!(format.is_column_header(header));
        assert!(format.is_separator("--- ----- ---- ------"));
        assert!(format.is_block_end(""));
        assert!(format.is_block_end("   "));
        assert_eq!(format.map_name("map: oa_dm1"), Some("oa_dm1"));
        assert!(format.is_client_row("  1     3   48 player"));
        assert!(!format.is_client_row("ShutdownGame:"));
    }

    #[test]
    fn parses_human_row() {
        let format = OpenArenaStatusFormat::new();
        let client = format
            .parse_client_line("  1     3   48 player      50 192.168.1.20:27960 12345 25000")
            .unwrap();
        assert_eq!(client.id, 1);
        assert_eq!(client.name, "player");
        assert_eq!(client.address, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert!(!client.is_bot);
        assert_eq!(client.extra["ping"], 48);
        assert_eq!(client.extra["port"], 27960);
        assert_eq!(client.extra["rate"], 25000);
    }

    #[test]
    fn parses_bot_row() {
        let format = OpenArenaStatusFormat::new();
        let client = format
            .parse_client_line("  0     0    0 Sarge        0 bot       0 16384")
            .unwrap();
        assert!(client.is_bot);
        assert_eq!(client.address, None);
        assert_eq!(client.name, "Sarge");
    }

    #[test]
    fn drops_malformed_rows() {
        let format = OpenArenaStatusFormat::new();
        assert!(format.parse_client_line("  1 3 48 player").is_none());
        assert!(format
            .parse_client_line("  1 3 48 player 50 300.1.1.1:27960")
            .is_none());
        assert!(format
            .parse_client_line("  x 3 48 player 50 10.0.0.1:27960")
            .is_none());
    }
}
