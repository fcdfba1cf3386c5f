use regex::Regex;
use tracing::debug;

use super::StatusFormat;
use crate::event::{parse_ipv4, ClientRecord};

pub(crate) const PLAYER_SECTION_START: &str = "---------players--------";
pub(crate) const PLAYER_SECTION_END: &str = "#end";

/// Status output of a Source engine server relayed by the AMP panel.
///
/// ```text
/// ---------players--------
///   id     time ping loss      state   rate adr name
///   3    00:05   12    0   spawning  80000 127.190.6.117:52271 'quangminh2479'
///   65535 [NoChan]    0    0   reserved      0127.190.6.117:49721 ''
///   1      BOT    0    0     active      0 'SourceTV'
/// #end
/// ```
///
/// The formatter sometimes glues the rate onto the first octet (`0127.190.6.117`), so the
/// address is located first and the remaining fields are split around it.
#[derive(Debug, Clone)]
pub struct AmpStatusFormat {
    address_regex: Regex,
}

impl Default for AmpStatusFormat {
    fn default() -> Self {
        Self::new()
    }
}

impl AmpStatusFormat {
    pub fn new() -> Self {
        Self {
            address_regex: Regex::new(r"(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}:\d+)").unwrap(),
        }
    }

    fn parse_bot_line(&self, line: &str) -> Option<ClientRecord> {
        // id BOT ping loss state rate 'name'
        let (fields, name) = match line.find('\'') {
            Some(quote) => (&line[..quote], strip_quotes(&line[quote..])),
            None => (line, ""),
        };
        let parts: Vec<&str> = fields.split_whitespace().collect();
        if parts.len() < 2 || parts[1] != "BOT" {
            return None;
        }
        let id: u32 = parts[0].parse().ok()?;
        let name = if name.is_empty() {
            parts.get(6).copied().unwrap_or_default()
        } else {
            name
        };

        let mut client = ClientRecord::bot(id, name);
        if let Some(state) = parts.get(4) {
            client = client.with_extra("state", *state);
        }
        Some(client)
    }
}

fn strip_quotes(text: &str) -> &str {
    text.trim_matches(|c: char| c == '\'' || c == '"' || c == ' ')
}

fn lenient_number(text: &str) -> i64 {
    text.parse().unwrap_or(0)
}

impl StatusFormat for AmpStatusFormat {
    fn is_block_header(&self, line: &str) -> bool {
        line.contains(PLAYER_SECTION_START)
    }

    fn is_block_end(&self, line: &str) -> bool {
        line.trim() == PLAYER_SECTION_END
    }

    fn is_column_header(&self, line: &str) -> bool {
        ["id", "ping", "adr", "name"]
            .iter()
            .all(|column| line.contains(column))
    }

    fn parse_client_line(&self, line: &str) -> Option<ClientRecord> {
        if line.contains(" BOT ") {
            return self.parse_bot_line(line);
        }

        let found = self.address_regex.find(line)?;
        let address = found.as_str();
        let (ip, port) = address.split_once(':')?;
        let ip = match parse_ipv4(ip) {
            Ok(ip) => ip,
            Err(e) => {
                debug!(line, "dropping status row: {e}");
                return None;
            }
        };

        let before: Vec<&str> = line[..found.start()].split_whitespace().collect();
        if before.len() < 5 {
            debug!(line, "status row has fewer than 5 leading fields");
            return None;
        }
        let id: u32 = before[0].parse().ok()?;
        // a rate glued to the address leaves a partial, possibly empty, token
        let rate = before
            .get(5)
            .filter(|rate| rate.bytes().all(|b| b.is_ascii_digit()))
            .map(|rate| lenient_number(rate))
            .unwrap_or(0);
        let name = strip_quotes(&line[found.end()..]);

        let mut client = ClientRecord::human(id, name, ip)
            .with_extra("time", before[1])
            .with_extra("ping", lenient_number(before[2]))
            .with_extra("loss", lenient_number(before[3]))
            .with_extra("state", before[4])
            .with_extra("rate", rate)
            .with_extra("address", address);
        if let Ok(port) = port.parse::<u16>() {
            client = client.with_extra("port", port);
        }
        Some(client)
    }
}
